use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    Outcome, ServiceError, ServiceResult, Services, Source, cache_write, defer, remote_or_cached,
};
use crate::core::api::{ApiError, ApiResult, display_name, mime_of};
use crate::core::models::{FraudVerdict, StoredFile, now_iso, verdicts_from_payload};
use crate::core::store::{INVOICE_FILES, PendingOp, mission_order_file_key};

/// Ids of files that exist only locally until their upload is replayed.
pub(crate) const PLACEHOLDER_PREFIX: &str = "pending-";

pub struct FileService {
    ctx: Services,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<StoredFile>,
    /// Kept as placeholders and queued for `sync flush`.
    pub queued: Vec<StoredFile>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Fraud-analysis response with its verdicts extracted.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub store_execution_id: Option<String>,
    pub results: Value,
    pub verdicts: Vec<FraudVerdict>,
}

impl Analysis {
    pub fn from_payload(payload: Value) -> Self {
        let store_execution_id = payload
            .get("execution_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let results = ["résultats", "resultats"]
            .iter()
            .find_map(|k| payload.get(*k).filter(|v| !v.is_null()).cloned())
            .unwrap_or(payload);
        let verdicts = verdicts_from_payload(&results);
        Self {
            store_execution_id,
            results,
            verdicts,
        }
    }
}

fn placeholder(agent_id: &str, path: &Path) -> StoredFile {
    StoredFile {
        id: format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4()),
        file_name: display_name(path),
        file_type: Some(mime_of(path)),
        agent_id: Some(agent_id.to_string()),
        upload_date: Some(now_iso()),
    }
}

pub(crate) fn is_placeholder(file_id: &str) -> bool {
    file_id.starts_with(PLACEHOLDER_PREFIX)
}

async fn ensure_readable(path: &Path) -> ServiceResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ServiceError::Invalid(format!(
            "{} is not a readable file",
            path.display()
        ))),
    }
}

impl FileService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Upload every invoice concurrently and wait for all of them. Uploads
    /// that fail for reasons other than auth are kept as placeholders and
    /// queued. Cancelling aborts whatever is still in flight.
    pub async fn upload_invoices(
        &self,
        agent_id: &str,
        paths: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> ServiceResult<UploadReport> {
        if paths.is_empty() {
            return Err(ServiceError::Invalid("No invoice files given".into()));
        }

        let mut set: JoinSet<(usize, PathBuf, ApiResult<StoredFile>)> = JoinSet::new();
        for (idx, path) in paths.into_iter().enumerate() {
            let api = self.ctx.api.clone();
            let agent_id = agent_id.to_string();
            set.spawn(async move {
                let res = api.upload_invoice_file(&agent_id, &path).await;
                (idx, path, res)
            });
        }

        let mut finished = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    info!("Invoice upload canceled, {} finished before", finished.len());
                    return Err(ServiceError::Canceled);
                }
                next = set.join_next() => match next {
                    Some(Ok(done)) => finished.push(done),
                    Some(Err(e)) => warn!("Upload task ended abnormally: {}", e),
                    None => break,
                }
            }
        }
        finished.sort_by_key(|(idx, _, _)| *idx);

        let mut report = UploadReport::default();
        for (_, path, res) in finished {
            match res {
                Ok(mut file) => {
                    file.agent_id.get_or_insert_with(|| agent_id.to_string());
                    cache_write("invoice file", self.ctx.store.save(INVOICE_FILES, &file).await);
                    report.uploaded.push(file);
                }
                Err(e @ ApiError::Io { .. }) => report.failed.push((path, e.to_string())),
                Err(e) if e.is_rejection() => report.failed.push((path, e.to_string())),
                Err(e) => {
                    let reason = defer("Uploading invoice", e)?;
                    let local = placeholder(agent_id, &path);
                    cache_write("invoice file", self.ctx.store.save(INVOICE_FILES, &local).await);
                    self.ctx
                        .queue(
                            PendingOp::UploadInvoiceFile {
                                agent_id: agent_id.to_string(),
                                path: path.display().to_string(),
                                placeholder_id: local.id.clone(),
                            },
                            &reason,
                        )
                        .await;
                    report.queued.push(local);
                }
            }
        }
        Ok(report)
    }

    /// Send the file inline as base64 JSON instead of multipart. Not queued
    /// when the backend is unreachable.
    pub async fn upload_invoice_inline(&self, agent_id: &str, path: &Path) -> ServiceResult<StoredFile> {
        ensure_readable(path).await?;
        let bytes = tokio::fs::read(path).await.map_err(|source| {
            ServiceError::Api(ApiError::Io {
                path: path.display().to_string(),
                source,
            })
        })?;
        let mut file = self
            .ctx
            .api
            .upload_invoice_base64(agent_id, &display_name(path), &mime_of(path), &bytes)
            .await?;
        file.agent_id.get_or_insert_with(|| agent_id.to_string());
        cache_write("invoice file", self.ctx.store.save(INVOICE_FILES, &file).await);
        Ok(file)
    }

    pub async fn list_invoice_files(&self, agent_id: &str) -> ServiceResult<(Vec<StoredFile>, Source)> {
        let cached: Vec<StoredFile> = self
            .ctx
            .store
            .filter_by_owner(INVOICE_FILES, "agentId", agent_id)
            .await?;
        match remote_or_cached(
            "Listing invoice files",
            self.ctx.api.list_invoice_files(agent_id),
        )
        .await?
        {
            Some(files) => {
                let mut mirror = files.clone();
                for file in mirror.iter_mut() {
                    file.agent_id.get_or_insert_with(|| agent_id.to_string());
                }
                mirror.extend(cached.into_iter().filter(|f| is_placeholder(&f.id)));
                cache_write(
                    "invoice files",
                    self.ctx
                        .store
                        .replace_owned(INVOICE_FILES, "agentId", agent_id, &mirror)
                        .await,
                );
                Ok((files, Source::Remote))
            }
            None => Ok((cached, Source::Cache)),
        }
    }

    pub async fn delete_invoice_file(&self, file_id: &str) -> ServiceResult<Outcome<()>> {
        let outcome = if is_placeholder(file_id) {
            self.ctx
                .store
                .discard_pending_where(|op| {
                    matches!(op, PendingOp::UploadInvoiceFile { placeholder_id, .. } if placeholder_id == file_id)
                })
                .await?;
            Outcome::Synced(())
        } else {
            match self.ctx.api.delete_invoice_file(file_id).await {
                Ok(()) => Outcome::Synced(()),
                Err(e) if e.is_not_found() => Outcome::Synced(()),
                Err(e) => {
                    let reason = defer("Deleting invoice file", e)?;
                    self.ctx
                        .queue(
                            PendingOp::DeleteInvoiceFile {
                                file_id: file_id.to_string(),
                            },
                            &reason,
                        )
                        .await;
                    Outcome::LocalOnly { value: (), reason }
                }
            }
        };
        self.ctx.store.delete(INVOICE_FILES, file_id).await?;
        Ok(outcome)
    }

    /// Upload the agent's mission-order document, replacing any previous one.
    pub async fn upload_mission_order(
        &self,
        agent_id: &str,
        path: &Path,
    ) -> ServiceResult<Outcome<StoredFile>> {
        ensure_readable(path).await?;
        let key = mission_order_file_key(agent_id);
        match self.ctx.api.upload_mission_order_file(agent_id, path).await {
            Ok(mut file) => {
                file.agent_id.get_or_insert_with(|| agent_id.to_string());
                cache_write("mission order file", self.ctx.store.set_value(&key, &file).await);
                Ok(Outcome::Synced(file))
            }
            Err(e @ ApiError::Io { .. }) => Err(ServiceError::Api(e)),
            Err(e) => {
                let reason = defer("Uploading mission order", e)?;
                let local = placeholder(agent_id, path);
                cache_write("mission order file", self.ctx.store.set_value(&key, &local).await);
                self.ctx
                    .store
                    .discard_pending_where(|op| {
                        matches!(op, PendingOp::UploadMissionOrderFile { agent_id: id, .. } if id == agent_id)
                    })
                    .await?;
                self.ctx
                    .queue(
                        PendingOp::UploadMissionOrderFile {
                            agent_id: agent_id.to_string(),
                            path: path.display().to_string(),
                        },
                        &reason,
                    )
                    .await;
                Ok(Outcome::LocalOnly {
                    value: local,
                    reason,
                })
            }
        }
    }

    pub async fn get_mission_order_file(
        &self,
        agent_id: &str,
    ) -> ServiceResult<(Option<StoredFile>, Source)> {
        let key = mission_order_file_key(agent_id);
        match remote_or_cached(
            "Fetching mission order file",
            self.ctx.api.get_mission_order_file(agent_id),
        )
        .await?
        {
            Some(Some(file)) => {
                cache_write("mission order file", self.ctx.store.set_value(&key, &file).await);
                Ok((Some(file), Source::Remote))
            }
            Some(None) => {
                // a queued upload is still the agent's mission order
                let cached: Option<StoredFile> = self.ctx.store.get_value(&key).await?;
                Ok((cached.filter(|f| is_placeholder(&f.id)), Source::Remote))
            }
            None => Ok((self.ctx.store.get_value(&key).await?, Source::Cache)),
        }
    }

    pub async fn delete_mission_order_file(&self, agent_id: &str) -> ServiceResult<Outcome<()>> {
        let (file, _) = self.get_mission_order_file(agent_id).await?;
        let file = file.ok_or_else(|| ServiceError::NotFound("Mission order file".into()))?;
        let key = mission_order_file_key(agent_id);

        let outcome = if is_placeholder(&file.id) {
            self.ctx
                .store
                .discard_pending_where(|op| {
                    matches!(op, PendingOp::UploadMissionOrderFile { agent_id: id, .. } if id == agent_id)
                })
                .await?;
            Outcome::Synced(())
        } else {
            match self.ctx.api.delete_mission_order_file(&file.id).await {
                Ok(()) => Outcome::Synced(()),
                Err(e) if e.is_not_found() => Outcome::Synced(()),
                Err(e) => {
                    let reason = defer("Deleting mission order file", e)?;
                    self.ctx
                        .queue(PendingOp::DeleteMissionOrderFile { file_id: file.id }, &reason)
                        .await;
                    Outcome::LocalOnly { value: (), reason }
                }
            }
        };
        self.ctx.store.remove_raw(&key).await?;
        Ok(outcome)
    }

    /// Post invoices and mission order to the fraud endpoint.
    pub async fn analyze(
        &self,
        agent_id: &str,
        invoices: &[PathBuf],
        mission_order: &Path,
        cancel: &CancellationToken,
    ) -> ServiceResult<Analysis> {
        if invoices.is_empty() {
            return Err(ServiceError::Invalid(
                "At least one invoice file is required".into(),
            ));
        }
        for path in invoices {
            ensure_readable(path).await?;
        }
        ensure_readable(mission_order).await?;

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(ServiceError::Canceled),
            res = self.ctx.api.detect_fraud(agent_id, invoices, mission_order) => res?,
        };
        let analysis = Analysis::from_payload(payload);
        info!(
            "Analysis for agent {} returned {} verdict(s)",
            agent_id,
            analysis.verdicts.len()
        );
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn analysis_unwraps_service_payload() {
        let analysis = Analysis::from_payload(json!({
            "execution_id": "665f",
            "agent_id": "a1",
            "résultats": [{ "fraude": "Oui", "Ville": "Rabat" }],
            "status": "termine"
        }));
        assert_eq!(analysis.store_execution_id.as_deref(), Some("665f"));
        assert_eq!(analysis.verdicts.len(), 1);
        assert!(analysis.verdicts[0].fraud);
        assert!(analysis.results.is_array());
    }

    #[test]
    fn bare_list_payload_is_the_results() {
        let analysis = Analysis::from_payload(json!([{ "fraude": "Non" }]));
        assert!(analysis.store_execution_id.is_none());
        assert_eq!(analysis.verdicts.len(), 1);
    }

    #[test]
    fn placeholders_are_recognised() {
        let file = placeholder("a1", Path::new("/tmp/f.pdf"));
        assert!(is_placeholder(&file.id));
        assert_eq!(file.file_name, "f.pdf");
        assert_eq!(file.file_type.as_deref(), Some("application/pdf"));
        assert!(!is_placeholder("64ab12"));
    }
}
