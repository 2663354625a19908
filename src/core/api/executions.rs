use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ApiClient, ApiResult, read_json, seg};
use crate::core::models::{AnalysisResult, Execution};
use crate::core::status::ExecutionStatus;

/// Execution record as kept by the analysis service's own store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreExecution {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub date_debut: Option<String>,
    #[serde(default)]
    pub date_fin: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub resultats: Value,
    #[serde(default)]
    pub erreur: Option<String>,
    #[serde(default)]
    pub fichiers: Value,
}

fn file_names(fichiers: &Value) -> Vec<String> {
    match fichiers {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::Object(obj) => obj
            .values()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

impl From<StoreExecution> for Execution {
    fn from(raw: StoreExecution) -> Self {
        Execution {
            files: file_names(&raw.fichiers),
            id: raw.id,
            agent_id: raw.agent_id.unwrap_or_default(),
            user_id: None,
            status: raw
                .status
                .as_deref()
                .map(ExecutionStatus::normalize)
                .unwrap_or_default(),
            start_time: raw.date_debut,
            end_time: raw.date_fin,
            result: raw.resultats,
            error: raw.erreur,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeletedCount {
    #[serde(default)]
    count: u64,
}

impl ApiClient {
    pub async fn list_executions_for_user(&self, user_id: &str) -> ApiResult<Vec<Execution>> {
        self.get_json(&format!("/executions/user/{}", seg(user_id)))
            .await
    }

    pub async fn list_executions_for_agent(&self, agent_id: &str) -> ApiResult<Vec<Execution>> {
        self.get_json(&format!("/executions/agent/{}", seg(agent_id)))
            .await
    }

    pub async fn get_execution(&self, id: &str) -> ApiResult<Execution> {
        self.get_json(&format!("/executions/{}", seg(id))).await
    }

    pub async fn create_execution(&self, execution: &Execution) -> ApiResult<Execution> {
        self.post_json("/executions", execution).await
    }

    pub async fn delete_execution(&self, id: &str) -> ApiResult<()> {
        self.delete(&format!("/executions/{}", seg(id))).await
    }

    pub async fn list_analysis_results(&self, execution_id: &str) -> ApiResult<Vec<AnalysisResult>> {
        self.get_json(&format!("/analysis-results/execution/{}", seg(execution_id)))
            .await
    }

    /// Store one verdict object against an execution; the backend marks it completed.
    pub async fn save_analysis(&self, execution_id: &str, payload: &Value) -> ApiResult<Value> {
        self.post_json(
            &format!("/analysis-results/execution/{}", seg(execution_id)),
            payload,
        )
        .await
    }

    pub async fn fail_analysis(&self, execution_id: &str, message: &str) -> ApiResult<Value> {
        self.post_json(
            &format!("/analysis-results/execution/{}/fail", seg(execution_id)),
            &json!({ "error": message }),
        )
        .await
    }

    pub async fn store_list_executions(&self) -> ApiResult<Vec<Execution>> {
        debug!("GET store /executions/");
        let res = self.send(self.http.get(self.store_url("/executions/"))).await?;
        let raw: Vec<StoreExecution> = read_json(res).await?;
        Ok(raw.into_iter().map(Execution::from).collect())
    }

    pub async fn store_executions_for_agent(&self, agent_id: &str) -> ApiResult<Vec<Execution>> {
        let url = self.store_url(&format!("/executions/agent/{}", seg(agent_id)));
        let res = self.send(self.http.get(url)).await?;
        let raw: Vec<StoreExecution> = read_json(res).await?;
        Ok(raw.into_iter().map(Execution::from).collect())
    }

    pub async fn store_get_execution(&self, id: &str) -> ApiResult<Execution> {
        let url = self.store_url(&format!("/executions/{}", seg(id)));
        let res = self.send(self.http.get(url)).await?;
        let raw: StoreExecution = read_json(res).await?;
        Ok(raw.into())
    }

    /// Returns how many records the store removed.
    pub async fn store_delete_agent_executions(&self, agent_id: &str) -> ApiResult<u64> {
        let url = self.store_url(&format!("/executions/agent/{}", seg(agent_id)));
        let res = self.send(self.http.delete(url)).await?;
        let deleted: Option<DeletedCount> = super::read_optional_json(res).await?;
        Ok(deleted.map(|d| d.count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_records_convert_to_executions() {
        let raw: StoreExecution = serde_json::from_value(json!({
            "_id": "e-1",
            "agent_id": "a-1",
            "status": "termine",
            "date_debut": "2024-05-01T10:00:00",
            "date_fin": "2024-05-01T10:02:00",
            "fichiers": { "nb_factures": 2, "ordre_mission": "om.pdf" },
            "resultats": [{ "fraude": "Oui" }]
        }))
        .unwrap();
        let exec: Execution = raw.into();
        assert_eq!(exec.id, "e-1");
        assert_eq!(exec.agent_id, "a-1");
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.files, vec!["om.pdf".to_string()]);
        assert_eq!(exec.is_fraudulent(), Some(true));
    }

    #[test]
    fn store_error_records_are_failed() {
        let raw: StoreExecution = serde_json::from_value(json!({
            "_id": "e-2",
            "status": "erreur",
            "erreur": "pdf illisible",
            "resultats": null
        }))
        .unwrap();
        let exec: Execution = raw.into();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("pdf illisible"));
        assert_eq!(exec.agent_id, "");
    }

    #[test]
    fn missing_status_means_running() {
        let raw: StoreExecution = serde_json::from_value(json!({ "_id": "e-3" })).unwrap();
        let exec: Execution = raw.into();
        assert_eq!(exec.status, ExecutionStatus::Running);
    }
}
