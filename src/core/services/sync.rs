use std::path::Path;
use tracing::{info, warn};

use super::file::is_placeholder;
use super::{ServiceError, ServiceResult, Services, cache_write};
use crate::core::api::{ApiError, ApiResult};
use crate::core::models::{
    Agent, AnalysisResult, Execution, Invoice, StoredFile, backend_analysis_payload, now_iso,
};
use crate::core::store::{
    AGENTS, ANALYSIS_RESULTS, EXECUTIONS, INVOICE_FILES, OutboxEntry, PendingOp, SESSION_KEY,
    mission_order_file_key, mission_order_key,
};

/// Replays writes that only reached the local cache.
pub struct SyncService {
    ctx: Services,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub replayed: usize,
    pub remaining: usize,
    /// Writes the backend refused outright; they were dropped from the queue.
    pub rejected: Vec<(String, String)>,
    /// The operation that failed and why; the queue stops there.
    pub stopped_at: Option<(String, String)>,
}

/// Deleting something the backend no longer has is a success.
fn gone_is_fine(res: ApiResult<()>) -> ServiceResult<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => Ok(other?),
    }
}

impl SyncService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    async fn signed_in_id(&self) -> ServiceResult<Option<String>> {
        Ok(self.ctx.session().await?.map(|u| u.id))
    }

    /// Queued writes of the signed-in account, oldest first.
    pub async fn pending(&self) -> ServiceResult<Vec<OutboxEntry>> {
        let user_id = self.signed_in_id().await?;
        Ok(self
            .ctx
            .store
            .pending()
            .await?
            .into_iter()
            .filter(|e| e.belongs_to(user_id.as_deref()))
            .collect())
    }

    /// Replay the signed-in account's queued writes oldest first. Each one
    /// leaves the queue once the backend accepts it. A write the backend
    /// refuses is dropped and reported; any other failure stops the flush.
    pub async fn flush(&self) -> ServiceResult<FlushReport> {
        let mut report = FlushReport::default();
        let user_id = self.signed_in_id().await?;
        if user_id.is_none() && !self.ctx.store.pending().await?.is_empty() {
            return Err(ServiceError::Unauthenticated);
        }
        loop {
            // re-read each round: a replayed create may rebind later entries
            let Some(entry) = self.pending().await?.into_iter().next() else {
                break;
            };
            let label = entry.op.describe();
            match self.replay(&entry.op).await {
                Ok(()) => {
                    self.ctx.store.dequeue(&entry.id).await?;
                    info!("Synced: {}", label);
                    report.replayed += 1;
                }
                Err(ServiceError::Unauthenticated) => return Err(ServiceError::Unauthenticated),
                Err(ServiceError::Api(e)) if e.is_rejection() => {
                    self.ctx.store.dequeue(&entry.id).await?;
                    warn!("Backend refused '{}', dropped from the queue: {}", label, e);
                    report.rejected.push((label, e.to_string()));
                }
                Err(e) => {
                    warn!("Sync stopped at '{}': {}", label, e);
                    report.stopped_at = Some((label, e.to_string()));
                    break;
                }
            }
        }
        report.remaining = self.pending().await?.len();
        Ok(report)
    }

    async fn replay(&self, op: &PendingOp) -> ServiceResult<()> {
        let api = &self.ctx.api;
        let store = &self.ctx.store;
        match op {
            PendingOp::CreateAgent { agent } => {
                let mut saved = api.create_agent(agent).await?;
                let cached: Option<Agent> = store.find(AGENTS, &agent.id).await?;
                saved.user_id = saved.user_id.or_else(|| agent.user_id.clone());
                saved.invoices = cached
                    .map(|a| a.invoices)
                    .unwrap_or_else(|| agent.invoices.clone());
                if saved.id != agent.id {
                    store.rebind_pending_agent(&agent.id, &saved.id).await?;
                    self.rekey_agent(&agent.id, &saved.id).await?;
                }
                cache_write("agent", store.save(AGENTS, &saved).await);
            }
            PendingOp::UpdateAgent { agent } => {
                let mut saved = api.update_agent(agent).await?;
                saved.user_id = saved.user_id.or_else(|| agent.user_id.clone());
                if saved.invoices.is_empty() {
                    saved.invoices = agent.invoices.clone();
                }
                cache_write("agent", store.save(AGENTS, &saved).await);
            }
            PendingOp::DeleteAgent { agent_id } => {
                gone_is_fine(api.delete_agent(agent_id).await)?;
                self.ctx.agents().delete_remote_executions(agent_id).await;
            }
            PendingOp::AddInvoice { agent_id, invoice } => {
                let saved = api.add_invoice(agent_id, invoice).await?;
                if saved.id != invoice.id {
                    store.rebind_pending_invoice(&invoice.id, &saved.id).await?;
                }
                self.swap_invoice(agent_id, &invoice.id, saved).await?;
            }
            PendingOp::DeleteInvoice {
                agent_id,
                invoice_id,
            } => gone_is_fine(api.delete_invoice(agent_id, invoice_id).await)?,
            PendingOp::SetMissionOrder { agent_id, order } => {
                let saved = api.set_mission_order(agent_id, order).await?;
                cache_write(
                    "mission order",
                    store.set_value(&mission_order_key(agent_id), &saved).await,
                );
            }
            PendingOp::DeleteMissionOrder { agent_id } => {
                gone_is_fine(api.delete_mission_order(agent_id).await)?
            }
            PendingOp::CreateExecution { execution } => {
                let mut saved = api.create_execution(execution).await?;
                saved.user_id = saved.user_id.or_else(|| execution.user_id.clone());
                if saved.id != execution.id {
                    store
                        .rebind_pending_execution(&execution.id, &saved.id)
                        .await?;
                    self.rekey_execution(&execution.id, &saved.id).await?;
                }
                // keep the local progress; the create only carried the start
                let local: Option<Execution> = store.find(EXECUTIONS, &saved.id).await?;
                if local.is_none() {
                    cache_write("execution", store.save(EXECUTIONS, &saved).await);
                }
            }
            PendingOp::DeleteExecution { execution_id } => {
                gone_is_fine(api.delete_execution(execution_id).await)?
            }
            PendingOp::SaveAnalysis {
                execution_id,
                results,
            } => {
                let payload = backend_analysis_payload(results, &now_iso());
                api.save_analysis(execution_id, &payload).await?;
            }
            PendingOp::FailExecution {
                execution_id,
                message,
            } => {
                api.fail_analysis(execution_id, message).await?;
            }
            PendingOp::UpdateProfile { update } => {
                let mut saved = api.update_profile(update).await?;
                if let Some(session) = self.ctx.session().await? {
                    saved.token = session.token;
                    cache_write("session", store.set_value(SESSION_KEY, &saved).await);
                }
            }
            PendingOp::UploadInvoiceFile {
                agent_id,
                path,
                placeholder_id,
            } => match api.upload_invoice_file(agent_id, Path::new(path)).await {
                Ok(mut file) => {
                    file.agent_id.get_or_insert_with(|| agent_id.clone());
                    store.delete(INVOICE_FILES, placeholder_id).await?;
                    cache_write("invoice file", store.save(INVOICE_FILES, &file).await);
                }
                Err(e @ ApiError::Io { .. }) => {
                    warn!("Dropping queued upload, file is gone: {}", e);
                    store.delete(INVOICE_FILES, placeholder_id).await?;
                }
                Err(e) => return Err(e.into()),
            },
            PendingOp::DeleteInvoiceFile { file_id } => {
                gone_is_fine(api.delete_invoice_file(file_id).await)?
            }
            PendingOp::UploadMissionOrderFile { agent_id, path } => {
                let key = mission_order_file_key(agent_id);
                match api.upload_mission_order_file(agent_id, Path::new(path)).await {
                    Ok(mut file) => {
                        file.agent_id.get_or_insert_with(|| agent_id.clone());
                        cache_write("mission order file", store.set_value(&key, &file).await);
                    }
                    Err(e @ ApiError::Io { .. }) => {
                        warn!("Dropping queued upload, file is gone: {}", e);
                        let cached: Option<StoredFile> = store.get_value(&key).await?;
                        if cached.is_some_and(|f| is_placeholder(&f.id)) {
                            store.remove_raw(&key).await?;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            PendingOp::DeleteMissionOrderFile { file_id } => {
                gone_is_fine(api.delete_mission_order_file(file_id).await)?
            }
        }
        Ok(())
    }

    /// Move cached data recorded under a local agent id to the server's id.
    async fn rekey_agent(&self, old: &str, new: &str) -> ServiceResult<()> {
        let store = &self.ctx.store;
        store.delete(AGENTS, old).await?;

        let mut executions: Vec<Execution> = store.filter_by_owner(EXECUTIONS, "agentId", old).await?;
        if !executions.is_empty() {
            for execution in executions.iter_mut() {
                execution.agent_id = new.to_string();
            }
            cache_write("executions", store.save_all(EXECUTIONS, &executions).await);
        }

        let mut files: Vec<StoredFile> = store.filter_by_owner(INVOICE_FILES, "agentId", old).await?;
        if !files.is_empty() {
            for file in files.iter_mut() {
                file.agent_id = Some(new.to_string());
            }
            cache_write("invoice files", store.save_all(INVOICE_FILES, &files).await);
        }

        for (old_key, new_key) in [
            (mission_order_key(old), mission_order_key(new)),
            (mission_order_file_key(old), mission_order_file_key(new)),
        ] {
            if let Some(raw) = store.get_raw(&old_key).await? {
                cache_write("mission order", store.set_raw(&new_key, &raw).await);
                store.remove_raw(&old_key).await?;
            }
        }
        Ok(())
    }

    async fn rekey_execution(&self, old: &str, new: &str) -> ServiceResult<()> {
        let store = &self.ctx.store;
        if let Some(mut execution) = store.find::<Execution>(EXECUTIONS, old).await? {
            store.delete(EXECUTIONS, old).await?;
            execution.id = new.to_string();
            cache_write("execution", store.save(EXECUTIONS, &execution).await);
        }
        let mut results: Vec<AnalysisResult> = store
            .filter_by_owner(ANALYSIS_RESULTS, "executionId", old)
            .await?;
        if !results.is_empty() {
            for result in results.iter_mut() {
                result.execution_id = new.to_string();
            }
            cache_write(
                "analysis results",
                store.save_all(ANALYSIS_RESULTS, &results).await,
            );
        }
        Ok(())
    }

    async fn swap_invoice(&self, agent_id: &str, local_id: &str, saved: Invoice) -> ServiceResult<()> {
        if let Some(mut agent) = self.ctx.store.find::<Agent>(AGENTS, agent_id).await? {
            agent.invoices.retain(|i| i.id != local_id && i.id != saved.id);
            agent.invoices.push(saved);
            cache_write("invoices", self.ctx.store.save(AGENTS, &agent).await);
        }
        Ok(())
    }
}
