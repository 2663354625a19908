use reqwest::multipart::Form;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

use super::files::file_part;
use super::{ApiClient, ApiResult, read_json};

impl ApiClient {
    /// Submit invoices and the mission order to the fraud-detection service.
    /// The payload is returned untouched; it usually wraps the per-file
    /// verdicts in `résultats` next to the service's own `execution_id`.
    pub async fn detect_fraud(
        &self,
        agent_id: &str,
        invoices: &[PathBuf],
        mission_order: &Path,
    ) -> ApiResult<Value> {
        let mut form = Form::new().text("agent_id", agent_id.to_string());
        for invoice in invoices {
            form = form.part("factures", file_part(invoice).await?);
        }
        form = form.part("ordre_mission", file_part(mission_order).await?);

        info!(
            "Submitting {} invoice(s) for agent {} to fraud analysis",
            invoices.len(),
            agent_id
        );
        let req = self.maybe_authed(self.http.post(&self.analysis_url).multipart(form));
        read_json(self.send(req).await?).await
    }
}
