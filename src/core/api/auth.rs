use serde_json::json;
use tracing::info;

use super::{ApiClient, ApiResult, check_status, read_json};
use crate::core::models::User;

impl ApiClient {
    /// `POST /auth/login`. The response carries the token alongside the profile.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<User> {
        let res = self
            .http
            .post(self.url("/auth/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let user: User = read_json(check_status(res).await?).await?;
        info!("Authenticated as {}", user.email);
        Ok(user)
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> ApiResult<User> {
        let res = self
            .http
            .post(self.url("/auth/register"))
            .json(&json!({ "name": name, "email": email, "password": password }))
            .send()
            .await?;
        read_json(check_status(res).await?).await
    }
}
