use super::{ApiClient, ApiResult, seg};
use crate::core::models::{Agent, Invoice, MissionOrder};

impl ApiClient {
    pub async fn list_agents(&self) -> ApiResult<Vec<Agent>> {
        self.get_json("/agents").await
    }

    pub async fn list_agents_for_user(&self, user_id: &str) -> ApiResult<Vec<Agent>> {
        self.get_json(&format!("/agents/user/{}", seg(user_id))).await
    }

    pub async fn get_agent(&self, id: &str) -> ApiResult<Agent> {
        self.get_json(&format!("/agents/{}", seg(id))).await
    }

    pub async fn create_agent(&self, agent: &Agent) -> ApiResult<Agent> {
        self.post_json("/agents", agent).await
    }

    pub async fn update_agent(&self, agent: &Agent) -> ApiResult<Agent> {
        self.put_json(&format!("/agents/{}", seg(&agent.id)), agent)
            .await
    }

    pub async fn delete_agent(&self, id: &str) -> ApiResult<()> {
        self.delete(&format!("/agents/{}", seg(id))).await
    }

    pub async fn list_invoices(&self, agent_id: &str) -> ApiResult<Vec<Invoice>> {
        self.get_json(&format!("/agents/{}/invoices", seg(agent_id)))
            .await
    }

    pub async fn add_invoice(&self, agent_id: &str, invoice: &Invoice) -> ApiResult<Invoice> {
        self.post_json(&format!("/agents/{}/invoices", seg(agent_id)), invoice)
            .await
    }

    pub async fn delete_invoice(&self, agent_id: &str, invoice_id: &str) -> ApiResult<()> {
        self.delete(&format!(
            "/agents/{}/invoices/{}",
            seg(agent_id),
            seg(invoice_id)
        ))
        .await
    }

    /// `None` when the agent has no mission order (empty 200 body).
    pub async fn get_mission_order(&self, agent_id: &str) -> ApiResult<Option<MissionOrder>> {
        self.get_optional_json(&format!("/agents/{}/mission-order", seg(agent_id)))
            .await
    }

    pub async fn set_mission_order(
        &self,
        agent_id: &str,
        order: &MissionOrder,
    ) -> ApiResult<MissionOrder> {
        self.post_json(&format!("/agents/{}/mission-order", seg(agent_id)), order)
            .await
    }

    pub async fn delete_mission_order(&self, agent_id: &str) -> ApiResult<()> {
        self.delete(&format!("/agents/{}/mission-order", seg(agent_id)))
            .await
    }
}
