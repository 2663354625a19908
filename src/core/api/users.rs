use serde_json::json;

use super::{ApiClient, ApiResult, seg};
use crate::core::models::{ProfileUpdate, User, UserStats};

impl ApiClient {
    pub async fn me(&self) -> ApiResult<User> {
        self.get_json("/users/me").await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> ApiResult<User> {
        self.put_json("/users/profile", update).await
    }

    pub async fn change_password(&self, current: &str, new: &str) -> ApiResult<()> {
        self.put_unit(
            "/users/password",
            &json!({
                "currentPassword": current,
                "newPassword": new,
                "confirmPassword": new,
            }),
        )
        .await
    }

    pub async fn delete_account(&self) -> ApiResult<()> {
        self.delete("/users/account").await
    }

    /// Server-side recount of the user's agents and executions.
    pub async fn user_stats(&self, user_id: &str) -> ApiResult<UserStats> {
        self.get_json(&format!("/users/{}/stats?recalculate=true", seg(user_id)))
            .await
    }
}
