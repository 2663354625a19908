use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    Outcome, ServiceError, ServiceResult, Services, Source, absorb, cache_write, defer, remote_or_cached,
};
use crate::core::api::display_name;
use crate::core::listing::{ListQuery, SortDirection};
use crate::core::models::{
    AnalysisResult, Execution, FraudVerdict, backend_analysis_payload, now_iso,
};
use crate::core::status::ExecutionStatus;
use crate::core::store::{ANALYSIS_RESULTS, EXECUTIONS, PendingOp};

pub struct ExecutionService {
    ctx: Services,
}

/// What `run` produced: the finished execution and the per-file verdicts.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution: Execution,
    pub verdicts: Vec<FraudVerdict>,
    pub store_execution_id: Option<String>,
    /// Set when some of the bookkeeping only reached the local cache.
    pub local_only: Option<String>,
}

fn newest_first(executions: Vec<Execution>) -> Vec<Execution> {
    ListQuery::new("startTime", SortDirection::Desc).apply(executions)
}

impl ExecutionService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Store records carry no owner; keep the one already known locally.
    async fn mirror_preserving_owner(&self, executions: &mut [Execution]) -> ServiceResult<()> {
        let cached: Vec<Execution> = self.ctx.store.get(EXECUTIONS).await?;
        let owners: HashMap<String, Option<String>> =
            cached.into_iter().map(|e| (e.id, e.user_id)).collect();
        for execution in executions.iter_mut() {
            if execution.user_id.is_none()
                && let Some(owner) = owners.get(&execution.id)
            {
                execution.user_id = owner.clone();
            }
        }
        cache_write(
            "executions",
            self.ctx.store.save_all(EXECUTIONS, executions).await,
        );
        Ok(())
    }

    /// Every execution, newest first. Reads the execution store, then the cache.
    pub async fn get_all(&self) -> ServiceResult<(Vec<Execution>, Source)> {
        match remote_or_cached("Listing executions", self.ctx.api.store_list_executions()).await? {
            Some(mut executions) => {
                self.mirror_preserving_owner(&mut executions).await?;
                Ok((newest_first(executions), Source::Remote))
            }
            None => {
                let cached = self.ctx.store.get(EXECUTIONS).await?;
                Ok((newest_first(cached), Source::Cache))
            }
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> ServiceResult<(Vec<Execution>, Source)> {
        match remote_or_cached(
            "Listing user executions",
            self.ctx.api.list_executions_for_user(user_id),
        )
        .await?
        {
            Some(mut executions) => {
                for execution in executions.iter_mut() {
                    execution.user_id.get_or_insert_with(|| user_id.to_string());
                }
                cache_write(
                    "executions",
                    self.ctx.store.save_all(EXECUTIONS, &executions).await,
                );
                Ok((newest_first(executions), Source::Remote))
            }
            None => {
                let cached = self
                    .ctx
                    .store
                    .filter_by_owner(EXECUTIONS, "userId", user_id)
                    .await?;
                Ok((newest_first(cached), Source::Cache))
            }
        }
    }

    /// Execution store, then the primary API, then the cache.
    pub async fn list_for_agent(&self, agent_id: &str) -> ServiceResult<(Vec<Execution>, Source)> {
        if let Some(mut executions) = remote_or_cached(
            "Listing agent executions",
            self.ctx.api.store_executions_for_agent(agent_id),
        )
        .await?
        {
            self.mirror_preserving_owner(&mut executions).await?;
            return Ok((newest_first(executions), Source::Remote));
        }
        if let Some(mut executions) = remote_or_cached(
            "Listing agent executions from the primary API",
            self.ctx.api.list_executions_for_agent(agent_id),
        )
        .await?
        {
            self.mirror_preserving_owner(&mut executions).await?;
            return Ok((newest_first(executions), Source::Remote));
        }
        let cached = self
            .ctx
            .store
            .filter_by_owner(EXECUTIONS, "agentId", agent_id)
            .await?;
        Ok((newest_first(cached), Source::Cache))
    }

    /// Primary API first, then the execution store, then the cache.
    pub async fn get(&self, id: &str) -> ServiceResult<(Execution, Source)> {
        let cached: Option<Execution> = self.ctx.store.find(EXECUTIONS, id).await?;
        let remote = match self.ctx.api.get_execution(id).await {
            Ok(execution) => Some(execution),
            Err(e) => {
                absorb("Fetching execution", e)?;
                remote_or_cached(
                    "Fetching stored execution",
                    self.ctx.api.store_get_execution(id),
                )
                .await?
            }
        };
        match remote {
            Some(mut execution) => {
                if execution.user_id.is_none() {
                    execution.user_id = cached.as_ref().and_then(|c| c.user_id.clone());
                }
                cache_write(
                    "execution",
                    self.ctx.store.save(EXECUTIONS, &execution).await,
                );
                Ok((execution, Source::Remote))
            }
            None => cached
                .map(|e| (e, Source::Cache))
                .ok_or_else(|| ServiceError::NotFound(format!("Execution {}", id))),
        }
    }

    pub async fn start(&self, agent_id: &str, files: Vec<String>) -> ServiceResult<Outcome<Execution>> {
        let user = self.ctx.require_user().await?;
        self.ctx.agents().get(agent_id).await?;

        let execution = Execution::start(agent_id, Some(user.id.clone()), files);
        let outcome = match self.ctx.api.create_execution(&execution).await {
            Ok(mut saved) => {
                saved.user_id.get_or_insert_with(|| user.id.clone());
                cache_write("execution", self.ctx.store.save(EXECUTIONS, &saved).await);
                Outcome::Synced(saved)
            }
            Err(e) => {
                let reason = defer("Recording execution", e)?;
                cache_write(
                    "execution",
                    self.ctx.store.save(EXECUTIONS, &execution).await,
                );
                self.ctx
                    .queue(
                        PendingOp::CreateExecution {
                            execution: execution.clone(),
                        },
                        &reason,
                    )
                    .await;
                Outcome::LocalOnly {
                    value: execution,
                    reason,
                }
            }
        };
        info!("Execution {} started for agent {}", outcome.value().id, agent_id);
        self.ctx.users().refresh_local_stats(&user.id).await;
        Ok(outcome)
    }

    async fn load(&self, id: &str) -> ServiceResult<Execution> {
        if let Some(execution) = self.ctx.store.find(EXECUTIONS, id).await? {
            return Ok(execution);
        }
        Ok(self.get(id).await?.0)
    }

    /// Record the analysis results and mark the execution completed.
    pub async fn complete(&self, id: &str, results: Value) -> ServiceResult<Outcome<Execution>> {
        let mut execution = self.load(id).await?;
        let finished_at = now_iso();
        execution.status = ExecutionStatus::Completed;
        execution.end_time = Some(finished_at.clone());
        execution.result = results.clone();
        execution.error = None;

        let analysis = AnalysisResult {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution.id.clone(),
            agent_id: Some(execution.agent_id.clone()),
            user_id: execution.user_id.clone(),
            created_at: Some(finished_at.clone()),
            results: results.clone(),
        };
        cache_write(
            "analysis result",
            self.ctx.store.save(ANALYSIS_RESULTS, &analysis).await,
        );
        cache_write("execution", self.ctx.store.save(EXECUTIONS, &execution).await);

        let remote = if self.ctx.store.is_pending_execution(id).await? {
            Err("execution not synced yet".to_string())
        } else {
            let payload = backend_analysis_payload(&results, &finished_at);
            match self.ctx.api.save_analysis(id, &payload).await {
                Ok(_) => Ok(()),
                Err(e) => Err(defer("Saving analysis results", e)?),
            }
        };

        if let Some(user_id) = &execution.user_id {
            self.ctx.users().refresh_local_stats(user_id).await;
        }
        match remote {
            Ok(()) => Ok(Outcome::Synced(execution)),
            Err(reason) => {
                self.ctx
                    .queue(
                        PendingOp::SaveAnalysis {
                            execution_id: id.to_string(),
                            results,
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: execution,
                    reason,
                })
            }
        }
    }

    pub async fn fail(&self, id: &str, message: &str) -> ServiceResult<Outcome<Execution>> {
        let mut execution = self.load(id).await?;
        execution.status = ExecutionStatus::Failed;
        execution.end_time = Some(now_iso());
        execution.error = Some(message.to_string());
        cache_write("execution", self.ctx.store.save(EXECUTIONS, &execution).await);

        let remote = if self.ctx.store.is_pending_execution(id).await? {
            Err("execution not synced yet".to_string())
        } else {
            match self.ctx.api.fail_analysis(id, message).await {
                Ok(_) => Ok(()),
                Err(e) => Err(defer("Marking execution failed", e)?),
            }
        };

        if let Some(user_id) = &execution.user_id {
            self.ctx.users().refresh_local_stats(user_id).await;
        }
        match remote {
            Ok(()) => Ok(Outcome::Synced(execution)),
            Err(reason) => {
                self.ctx
                    .queue(
                        PendingOp::FailExecution {
                            execution_id: id.to_string(),
                            message: message.to_string(),
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: execution,
                    reason,
                })
            }
        }
    }

    pub async fn delete(&self, id: &str) -> ServiceResult<Outcome<()>> {
        let owner = self
            .ctx
            .store
            .find::<Execution>(EXECUTIONS, id)
            .await?
            .and_then(|e| e.user_id);

        let outcome = if self.ctx.store.is_pending_execution(id).await? {
            self.ctx.store.discard_pending_for_execution(id).await?;
            Outcome::Synced(())
        } else {
            match self.ctx.api.delete_execution(id).await {
                Ok(()) => Outcome::Synced(()),
                Err(e) if e.is_not_found() => Outcome::Synced(()),
                Err(e) => {
                    let reason = defer("Deleting execution", e)?;
                    self.ctx
                        .queue(
                            PendingOp::DeleteExecution {
                                execution_id: id.to_string(),
                            },
                            &reason,
                        )
                        .await;
                    Outcome::LocalOnly { value: (), reason }
                }
            }
        };

        self.ctx.store.delete(EXECUTIONS, id).await?;
        self.ctx
            .store
            .delete_by_owner(ANALYSIS_RESULTS, "executionId", id)
            .await?;
        if let Some(user_id) = owner {
            self.ctx.users().refresh_local_stats(&user_id).await;
        }
        Ok(outcome)
    }

    pub async fn analysis_results(
        &self,
        execution_id: &str,
    ) -> ServiceResult<(Vec<AnalysisResult>, Source)> {
        match remote_or_cached(
            "Listing analysis results",
            self.ctx.api.list_analysis_results(execution_id),
        )
        .await?
        {
            Some(results) => {
                cache_write(
                    "analysis results",
                    self.ctx
                        .store
                        .replace_owned(ANALYSIS_RESULTS, "executionId", execution_id, &results)
                        .await,
                );
                Ok((results, Source::Remote))
            }
            None => Ok((
                self.ctx
                    .store
                    .filter_by_owner(ANALYSIS_RESULTS, "executionId", execution_id)
                    .await?,
                Source::Cache,
            )),
        }
    }

    /// Record an execution, submit the files for analysis and store the
    /// verdicts. Cancelling marks the execution failed and drops the response.
    pub async fn run(
        &self,
        agent_id: &str,
        invoices: Vec<PathBuf>,
        mission_order: PathBuf,
        cancel: &CancellationToken,
    ) -> ServiceResult<RunReport> {
        let mut files: Vec<String> = invoices.iter().map(|p| display_name(p)).collect();
        files.push(display_name(&mission_order));

        let started = self.start(agent_id, files).await?;
        let mut local_only = match &started {
            Outcome::LocalOnly { reason, .. } => Some(reason.clone()),
            Outcome::Synced(_) => None,
        };
        let execution_id = started.into_value().id;

        let analysis = match self
            .ctx
            .files()
            .analyze(agent_id, &invoices, &mission_order, cancel)
            .await
        {
            Ok(analysis) => analysis,
            Err(err) => {
                let message = match &err {
                    ServiceError::Canceled => "canceled".to_string(),
                    other => other.to_string(),
                };
                if let Err(e) = self.fail(&execution_id, &message).await {
                    warn!("Could not mark execution {} failed: {}", execution_id, e);
                }
                return Err(err);
            }
        };

        let completed = self.complete(&execution_id, analysis.results).await?;
        if let Outcome::LocalOnly { reason, .. } = &completed {
            local_only.get_or_insert_with(|| reason.clone());
        }
        Ok(RunReport {
            execution: completed.into_value(),
            verdicts: analysis.verdicts,
            store_execution_id: analysis.store_execution_id,
            local_only,
        })
    }
}
