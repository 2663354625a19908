use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::path::Path;
use tracing::debug;

use super::{ApiClient, ApiError, ApiResult, read_json, seg};
use crate::core::models::StoredFile;

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub(crate) fn mime_of(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub(super) async fn read_file(path: &Path) -> ApiResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| ApiError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Multipart part for a file on disk, named and typed after it.
pub(super) async fn file_part(path: &Path) -> ApiResult<Part> {
    let bytes = read_file(path).await?;
    Ok(Part::bytes(bytes)
        .file_name(display_name(path))
        .mime_str(&mime_of(path))?)
}

impl ApiClient {
    async fn upload_multipart(&self, endpoint: &str, path: &Path) -> ApiResult<StoredFile> {
        debug!("POST {} ({})", endpoint, path.display());
        let form = Form::new().part("file", file_part(path).await?);
        let req = self.authed(self.http.post(self.url(endpoint)).multipart(form))?;
        read_json(self.send(req).await?).await
    }

    pub async fn upload_invoice_file(&self, agent_id: &str, path: &Path) -> ApiResult<StoredFile> {
        self.upload_multipart(&format!("/files/invoices/{}", seg(agent_id)), path)
            .await
    }

    /// JSON alternative to the multipart upload, for callers holding bytes.
    pub async fn upload_invoice_base64(
        &self,
        agent_id: &str,
        file_name: &str,
        file_type: &str,
        bytes: &[u8],
    ) -> ApiResult<StoredFile> {
        self.post_json(
            &format!("/files/invoices/base64/{}", seg(agent_id)),
            &json!({
                "fileName": file_name,
                "fileType": file_type,
                "fileData": STANDARD.encode(bytes),
            }),
        )
        .await
    }

    pub async fn list_invoice_files(&self, agent_id: &str) -> ApiResult<Vec<StoredFile>> {
        self.get_json(&format!("/files/invoices/agent/{}", seg(agent_id)))
            .await
    }

    pub async fn delete_invoice_file(&self, file_id: &str) -> ApiResult<()> {
        self.delete(&format!("/files/invoices/{}", seg(file_id)))
            .await
    }

    pub async fn upload_mission_order_file(
        &self,
        agent_id: &str,
        path: &Path,
    ) -> ApiResult<StoredFile> {
        self.upload_multipart(&format!("/files/mission-orders/{}", seg(agent_id)), path)
            .await
    }

    /// `None` when the agent has no mission-order file.
    pub async fn get_mission_order_file(&self, agent_id: &str) -> ApiResult<Option<StoredFile>> {
        self.get_optional_json(&format!("/files/mission-orders/agent/{}", seg(agent_id)))
            .await
    }

    pub async fn delete_mission_order_file(&self, file_id: &str) -> ApiResult<()> {
        self.delete(&format!("/files/mission-orders/{}", seg(file_id)))
            .await
    }
}
