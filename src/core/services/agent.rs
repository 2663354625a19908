use std::collections::HashSet;
use tracing::{info, warn};

use super::{
    Outcome, ServiceError, ServiceResult, Services, Source, cache_write, defer, remote_or_cached,
};
use crate::core::models::{Agent, AgentPatch, Execution, Invoice, MissionOrder, now_iso};
use crate::core::store::{
    AGENTS, ANALYSIS_RESULTS, EXECUTIONS, INVOICE_FILES, PendingOp, mission_order_file_key,
    mission_order_key,
};

pub struct AgentService {
    ctx: Services,
}

fn required(field: &str, value: &str) -> ServiceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::Invalid(format!("Agent {} is required", field)));
    }
    Ok(trimmed.to_string())
}

impl AgentService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Ids of agents whose creation has not reached the backend yet.
    async fn pending_agent_ids(&self) -> ServiceResult<HashSet<String>> {
        Ok(self
            .ctx
            .store
            .pending()
            .await?
            .into_iter()
            .filter_map(|e| match e.op {
                PendingOp::CreateAgent { agent } => Some(agent.id),
                _ => None,
            })
            .collect())
    }

    pub async fn list_for_user(&self, user_id: &str) -> ServiceResult<(Vec<Agent>, Source)> {
        let remote = remote_or_cached(
            "Listing agents",
            self.ctx.api.list_agents_for_user(user_id),
        )
        .await?;

        let Some(mut agents) = remote else {
            let cached = self
                .ctx
                .store
                .filter_by_owner(AGENTS, "userId", user_id)
                .await?;
            return Ok((cached, Source::Cache));
        };

        for agent in agents.iter_mut() {
            if agent.user_id.is_none() {
                agent.user_id = Some(user_id.to_string());
            }
        }

        // The listing endpoint omits invoices; keep the cached ones, and keep
        // agents that only exist locally until they are synced.
        let cached: Vec<Agent> = self
            .ctx
            .store
            .filter_by_owner(AGENTS, "userId", user_id)
            .await?;
        let pending = self.pending_agent_ids().await?;
        let mut mirror = agents.clone();
        for agent in mirror.iter_mut() {
            if agent.invoices.is_empty()
                && let Some(old) = cached.iter().find(|c| c.id == agent.id)
            {
                agent.invoices = old.invoices.clone();
            }
        }
        mirror.extend(cached.into_iter().filter(|c| pending.contains(&c.id)));
        cache_write(
            "agents",
            self.ctx
                .store
                .replace_owned(AGENTS, "userId", user_id, &mirror)
                .await,
        );
        Ok((agents, Source::Remote))
    }

    pub async fn list_all(&self) -> ServiceResult<(Vec<Agent>, Source)> {
        match remote_or_cached("Listing all agents", self.ctx.api.list_agents()).await? {
            Some(agents) => {
                cache_write("agents", self.ctx.store.save_all(AGENTS, &agents).await);
                Ok((agents, Source::Remote))
            }
            None => Ok((self.ctx.store.get(AGENTS).await?, Source::Cache)),
        }
    }

    pub async fn get(&self, id: &str) -> ServiceResult<(Agent, Source)> {
        let cached: Option<Agent> = self.ctx.store.find(AGENTS, id).await?;
        match remote_or_cached("Fetching agent", self.ctx.api.get_agent(id)).await? {
            Some(mut agent) => {
                if let Some(old) = &cached {
                    if agent.user_id.is_none() {
                        agent.user_id = old.user_id.clone();
                    }
                    if agent.invoices.is_empty() {
                        agent.invoices = old.invoices.clone();
                    }
                }
                cache_write("agent", self.ctx.store.save(AGENTS, &agent).await);
                Ok((agent, Source::Remote))
            }
            None => cached
                .map(|a| (a, Source::Cache))
                .ok_or_else(|| ServiceError::NotFound(format!("Agent {}", id))),
        }
    }

    pub async fn create(
        &self,
        name: &str,
        role: &str,
        description: Option<String>,
    ) -> ServiceResult<Outcome<Agent>> {
        let name = required("name", name)?;
        let role = required("role", role)?;
        let user = self.ctx.require_user().await?;

        let agent = Agent {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            role,
            description: description.filter(|d| !d.trim().is_empty()),
            created_at: Some(now_iso()),
            user_id: Some(user.id.clone()),
            invoices: Vec::new(),
        };

        let outcome = match self.ctx.api.create_agent(&agent).await {
            Ok(mut saved) => {
                if saved.user_id.is_none() {
                    saved.user_id = agent.user_id.clone();
                }
                if saved.created_at.is_none() {
                    saved.created_at = agent.created_at.clone();
                }
                cache_write("agent", self.ctx.store.save(AGENTS, &saved).await);
                info!("Created agent {} ({})", saved.name, saved.id);
                Outcome::Synced(saved)
            }
            Err(e) => {
                let reason = defer("Creating agent", e)?;
                cache_write("agent", self.ctx.store.save(AGENTS, &agent).await);
                self.ctx
                    .queue(
                        PendingOp::CreateAgent {
                            agent: agent.clone(),
                        },
                        &reason,
                    )
                    .await;
                Outcome::LocalOnly {
                    value: agent,
                    reason,
                }
            }
        };
        self.ctx.users().refresh_local_stats(&user.id).await;
        Ok(outcome)
    }

    pub async fn update(&self, id: &str, patch: &AgentPatch) -> ServiceResult<Outcome<Agent>> {
        if patch.is_empty() {
            return Err(ServiceError::Invalid("Nothing to update".into()));
        }
        let (mut agent, _) = self.get(id).await?;
        patch.apply(&mut agent);
        agent.name = required("name", &agent.name)?;
        agent.role = required("role", &agent.role)?;

        if self.ctx.store.is_pending_creation(id).await? {
            cache_write("agent", self.ctx.store.save(AGENTS, &agent).await);
            let reason = "agent not synced yet".to_string();
            self.ctx
                .queue(
                    PendingOp::UpdateAgent {
                        agent: agent.clone(),
                    },
                    &reason,
                )
                .await;
            return Ok(Outcome::LocalOnly {
                value: agent,
                reason,
            });
        }

        match self.ctx.api.update_agent(&agent).await {
            Ok(mut saved) => {
                if saved.user_id.is_none() {
                    saved.user_id = agent.user_id.clone();
                }
                if saved.invoices.is_empty() {
                    saved.invoices = agent.invoices.clone();
                }
                cache_write("agent", self.ctx.store.save(AGENTS, &saved).await);
                Ok(Outcome::Synced(saved))
            }
            Err(e) => {
                let reason = defer("Updating agent", e)?;
                cache_write("agent", self.ctx.store.save(AGENTS, &agent).await);
                self.ctx
                    .queue(
                        PendingOp::UpdateAgent {
                            agent: agent.clone(),
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: agent,
                    reason,
                })
            }
        }
    }

    /// Delete an agent with its invoices, mission order, executions and
    /// analysis results. Returns how many cached executions went with it.
    pub async fn delete(&self, id: &str) -> ServiceResult<Outcome<usize>> {
        let owner = self
            .ctx
            .store
            .find::<Agent>(AGENTS, id)
            .await?
            .and_then(|a| a.user_id);

        let remote = if self.ctx.store.is_pending_creation(id).await? {
            let dropped = self.ctx.store.discard_pending_for_agent(id).await?;
            info!("Agent {} was never synced, dropped {} queued op(s)", id, dropped);
            Ok(())
        } else {
            match self.ctx.api.delete_agent(id).await {
                Ok(()) => {
                    self.delete_remote_executions(id).await;
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => {
                    let reason = defer("Deleting agent", e)?;
                    self.ctx
                        .queue(
                            PendingOp::DeleteAgent {
                                agent_id: id.to_string(),
                            },
                            &reason,
                        )
                        .await;
                    Err(reason)
                }
            }
        };

        let removed = self.purge_local(id).await?;
        if let Some(user_id) = owner {
            self.ctx.users().refresh_local_stats(&user_id).await;
        }
        Ok(match remote {
            Ok(()) => Outcome::Synced(removed),
            Err(reason) => Outcome::LocalOnly {
                value: removed,
                reason,
            },
        })
    }

    /// The execution store keeps its own records; clearing them is best effort.
    pub(crate) async fn delete_remote_executions(&self, agent_id: &str) {
        match self.ctx.api.store_delete_agent_executions(agent_id).await {
            Ok(count) => info!("Execution store dropped {} record(s) for {}", count, agent_id),
            Err(e) => warn!("Could not clear stored executions of {}: {}", agent_id, e),
        }
    }

    /// Remove every cached trace of an agent.
    pub(crate) async fn purge_local(&self, agent_id: &str) -> ServiceResult<usize> {
        let store = &self.ctx.store;
        let executions: Vec<Execution> = store
            .filter_by_owner(EXECUTIONS, "agentId", agent_id)
            .await?;
        for execution in &executions {
            store
                .delete_by_owner(ANALYSIS_RESULTS, "executionId", &execution.id)
                .await?;
        }
        let removed = store
            .delete_by_owner(EXECUTIONS, "agentId", agent_id)
            .await?;
        store
            .delete_by_owner(ANALYSIS_RESULTS, "agentId", agent_id)
            .await?;
        store
            .delete_by_owner(INVOICE_FILES, "agentId", agent_id)
            .await?;
        store.remove_raw(&mission_order_key(agent_id)).await?;
        store.remove_raw(&mission_order_file_key(agent_id)).await?;
        store.delete(AGENTS, agent_id).await?;
        Ok(removed)
    }

    async fn edit_cached_invoices<F>(&self, agent_id: &str, edit: F)
    where
        F: FnOnce(&mut Vec<Invoice>),
    {
        match self.ctx.store.find::<Agent>(AGENTS, agent_id).await {
            Ok(Some(mut agent)) => {
                edit(&mut agent.invoices);
                cache_write("invoices", self.ctx.store.save(AGENTS, &agent).await);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read cached agent {}: {}", agent_id, e),
        }
    }

    pub async fn list_invoices(&self, agent_id: &str) -> ServiceResult<(Vec<Invoice>, Source)> {
        match remote_or_cached("Listing invoices", self.ctx.api.list_invoices(agent_id)).await? {
            Some(invoices) => {
                let fresh = invoices.clone();
                self.edit_cached_invoices(agent_id, |cached| *cached = fresh)
                    .await;
                Ok((invoices, Source::Remote))
            }
            None => {
                let agent: Option<Agent> = self.ctx.store.find(AGENTS, agent_id).await?;
                Ok((agent.map(|a| a.invoices).unwrap_or_default(), Source::Cache))
            }
        }
    }

    pub async fn add_invoice(
        &self,
        agent_id: &str,
        mut invoice: Invoice,
    ) -> ServiceResult<Outcome<Invoice>> {
        if invoice.amount < 0.0 {
            return Err(ServiceError::Invalid("Invoice amount cannot be negative".into()));
        }
        invoice.agent_id = Some(agent_id.to_string());

        let remote = if self.ctx.store.is_pending_creation(agent_id).await? {
            Err("agent not synced yet".to_string())
        } else {
            match self.ctx.api.add_invoice(agent_id, &invoice).await {
                Ok(saved) => Ok(saved),
                Err(e) => Err(defer("Adding invoice", e)?),
            }
        };

        match remote {
            Ok(saved) => {
                let mirrored = saved.clone();
                self.edit_cached_invoices(agent_id, |cached| {
                    cached.retain(|i| i.id != mirrored.id);
                    cached.push(mirrored);
                })
                .await;
                Ok(Outcome::Synced(saved))
            }
            Err(reason) => {
                let local = invoice.clone();
                self.edit_cached_invoices(agent_id, |cached| cached.push(local))
                    .await;
                self.ctx
                    .queue(
                        PendingOp::AddInvoice {
                            agent_id: agent_id.to_string(),
                            invoice: invoice.clone(),
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: invoice,
                    reason,
                })
            }
        }
    }

    pub async fn delete_invoice(
        &self,
        agent_id: &str,
        invoice_id: &str,
    ) -> ServiceResult<Outcome<()>> {
        let unsent = self
            .ctx
            .store
            .discard_pending_where(|op| {
                matches!(op, PendingOp::AddInvoice { agent_id: owner, invoice }
                    if owner == agent_id && invoice.id == invoice_id)
            })
            .await?;
        let remote = if unsent > 0 {
            info!("Invoice {} was never synced, dropped its queued add", invoice_id);
            Ok(())
        } else {
            self.ctx.api.delete_invoice(agent_id, invoice_id).await
        };
        let outcome = match remote {
            Ok(()) => Outcome::Synced(()),
            Err(e) if e.is_not_found() => Outcome::Synced(()),
            Err(e) => {
                let reason = defer("Deleting invoice", e)?;
                self.ctx
                    .queue(
                        PendingOp::DeleteInvoice {
                            agent_id: agent_id.to_string(),
                            invoice_id: invoice_id.to_string(),
                        },
                        &reason,
                    )
                    .await;
                Outcome::LocalOnly { value: (), reason }
            }
        };
        self.edit_cached_invoices(agent_id, |cached| cached.retain(|i| i.id != invoice_id))
            .await;
        Ok(outcome)
    }

    pub async fn get_mission_order(
        &self,
        agent_id: &str,
    ) -> ServiceResult<(Option<MissionOrder>, Source)> {
        let key = mission_order_key(agent_id);
        match remote_or_cached(
            "Fetching mission order",
            self.ctx.api.get_mission_order(agent_id),
        )
        .await?
        {
            Some(Some(order)) => {
                cache_write("mission order", self.ctx.store.set_value(&key, &order).await);
                Ok((Some(order), Source::Remote))
            }
            Some(None) => {
                if let Err(e) = self.ctx.store.remove_raw(&key).await {
                    warn!("Could not clear cached mission order: {}", e);
                }
                Ok((None, Source::Remote))
            }
            None => Ok((self.ctx.store.get_value(&key).await?, Source::Cache)),
        }
    }

    pub async fn set_mission_order(
        &self,
        agent_id: &str,
        mut order: MissionOrder,
    ) -> ServiceResult<Outcome<MissionOrder>> {
        if order.mission_name.trim().is_empty() {
            return Err(ServiceError::Invalid("Mission name is required".into()));
        }
        order.agent_id = Some(agent_id.to_string());
        let key = mission_order_key(agent_id);

        match self.ctx.api.set_mission_order(agent_id, &order).await {
            Ok(saved) => {
                cache_write("mission order", self.ctx.store.set_value(&key, &saved).await);
                Ok(Outcome::Synced(saved))
            }
            Err(e) => {
                let reason = defer("Saving mission order", e)?;
                cache_write("mission order", self.ctx.store.set_value(&key, &order).await);
                self.ctx
                    .queue(
                        PendingOp::SetMissionOrder {
                            agent_id: agent_id.to_string(),
                            order: order.clone(),
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: order,
                    reason,
                })
            }
        }
    }

    pub async fn delete_mission_order(&self, agent_id: &str) -> ServiceResult<Outcome<()>> {
        let unsent = self
            .ctx
            .store
            .discard_pending_where(
                |op| matches!(op, PendingOp::SetMissionOrder { agent_id: owner, .. } if owner == agent_id),
            )
            .await?;
        if unsent > 0 {
            info!("Dropped {} queued mission order save(s) for agent {}", unsent, agent_id);
        }
        let outcome = match self.ctx.api.delete_mission_order(agent_id).await {
            Ok(()) => Outcome::Synced(()),
            Err(e) if e.is_not_found() => Outcome::Synced(()),
            Err(e) => {
                let reason = defer("Deleting mission order", e)?;
                self.ctx
                    .queue(
                        PendingOp::DeleteMissionOrder {
                            agent_id: agent_id.to_string(),
                        },
                        &reason,
                    )
                    .await;
                Outcome::LocalOnly { value: (), reason }
            }
        };
        self.ctx
            .store
            .remove_raw(&mission_order_key(agent_id))
            .await?;
        Ok(outcome)
    }
}
