use tracing::{info, warn};

use super::{
    Outcome, ServiceError, ServiceResult, Services, Source, cache_write, defer, remote_or_cached,
};
use crate::core::api::ApiError;
use crate::core::models::{Agent, Execution, ProfileUpdate, User, UserStats};
use crate::core::store::{AGENTS, ANALYSIS_RESULTS, EXECUTIONS, PendingOp, SESSION_KEY, USERS};

pub struct UserService {
    ctx: Services,
}

fn non_empty(label: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::Invalid(format!("{} is required", label)));
    }
    Ok(())
}

impl UserService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Persist the session (with token) and the user record (without).
    async fn remember(&self, user: &User) {
        cache_write("session", self.ctx.store.set_value(SESSION_KEY, user).await);
        let mut record = user.clone();
        record.token = None;
        cache_write("user", self.ctx.store.save(USERS, &record).await);
    }

    async fn establish(&self, user: User) -> User {
        self.ctx.api.set_token(user.token.clone());
        self.remember(&user).await;
        user
    }

    pub async fn login(&self, email: &str, password: &str) -> ServiceResult<User> {
        non_empty("Email", email)?;
        non_empty("Password", password)?;

        let user = match self.ctx.api.login(email.trim(), password).await {
            Ok(user) => user,
            Err(ApiError::Unauthorized(_)) | Err(ApiError::Status { status: 400 | 401, .. }) => {
                return Err(ServiceError::Invalid("Invalid email or password".into()));
            }
            Err(e) => return Err(ServiceError::Api(e)),
        };
        if user.token.is_none() {
            return Err(ServiceError::Api(ApiError::Decode(
                "login response carried no token".into(),
            )));
        }
        info!("Logged in as {}", user.email);
        Ok(self.establish(user).await)
    }

    /// Create an account. When the backend answers with a token the new user
    /// is logged in right away.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> ServiceResult<User> {
        non_empty("Name", name)?;
        non_empty("Email", email)?;
        non_empty("Password", password)?;

        let user = match self
            .ctx
            .api
            .register(name.trim(), email.trim(), password)
            .await
        {
            Ok(user) => user,
            Err(ApiError::Status {
                status: 400 | 409,
                message,
            }) => return Err(ServiceError::Invalid(message)),
            Err(e) => return Err(ServiceError::Api(e)),
        };
        if user.token.is_some() {
            return Ok(self.establish(user).await);
        }
        Ok(user)
    }

    /// Forget the session. Returns whether one existed.
    pub async fn logout(&self) -> ServiceResult<bool> {
        self.ctx.api.set_token(None);
        Ok(self.ctx.store.remove_raw(SESSION_KEY).await?)
    }

    pub async fn current_user(&self) -> ServiceResult<Option<User>> {
        self.ctx.session().await
    }

    pub async fn profile(&self) -> ServiceResult<(User, Source)> {
        let session = self.ctx.require_user().await?;
        match remote_or_cached("Fetching profile", self.ctx.api.me()).await? {
            Some(mut user) => {
                user.token = session.token.clone();
                self.remember(&user).await;
                Ok((user, Source::Remote))
            }
            None => Ok((session, Source::Cache)),
        }
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> ServiceResult<Outcome<User>> {
        if update.name.is_none() && update.email.is_none() && update.profile_image.is_none() {
            return Err(ServiceError::Invalid("Nothing to update".into()));
        }
        if let Some(name) = &update.name {
            non_empty("Name", name)?;
        }
        if let Some(email) = &update.email
            && !email.contains('@')
        {
            return Err(ServiceError::Invalid(format!("'{}' is not an email address", email)));
        }
        let session = self.ctx.require_user().await?;

        match self.ctx.api.update_profile(update).await {
            Ok(mut saved) => {
                saved.token = session.token.clone();
                self.remember(&saved).await;
                Ok(Outcome::Synced(saved))
            }
            Err(e) => {
                let reason = defer("Updating profile", e)?;
                let mut local = session;
                update.apply(&mut local);
                self.remember(&local).await;
                self.ctx
                    .queue(
                        PendingOp::UpdateProfile {
                            update: update.clone(),
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

    /// Passwords are never stored or queued, so this needs the backend.
    pub async fn change_password(&self, current: &str, new: &str, confirm: &str) -> ServiceResult<()> {
        non_empty("Current password", current)?;
        non_empty("New password", new)?;
        if new != confirm {
            return Err(ServiceError::Invalid("New passwords do not match".into()));
        }
        self.ctx.require_user().await?;
        match self.ctx.api.change_password(current, new).await {
            Ok(()) => Ok(()),
            Err(ApiError::Status {
                status: 400,
                message,
            }) => Err(ServiceError::Invalid(message)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the account on the backend, then everything cached for it.
    /// Returns how many agents were removed locally.
    pub async fn delete_account(&self) -> ServiceResult<usize> {
        let user = self.ctx.require_user().await?;
        self.ctx.api.delete_account().await?;

        let agents: Vec<Agent> = self
            .ctx
            .store
            .filter_by_owner(AGENTS, "userId", &user.id)
            .await?;
        let service = self.ctx.agents();
        for agent in &agents {
            service.purge_local(&agent.id).await?;
        }
        let store = &self.ctx.store;
        store.delete_by_owner(EXECUTIONS, "userId", &user.id).await?;
        store
            .delete_by_owner(ANALYSIS_RESULTS, "userId", &user.id)
            .await?;
        store.delete(USERS, &user.id).await?;
        store.discard_pending_owned_by(&user.id).await?;
        self.logout().await?;
        info!("Deleted account {} and {} agent(s)", user.email, agents.len());
        Ok(agents.len())
    }

    /// Server-side recount when reachable, otherwise counted from the cache.
    pub async fn stats(&self, user_id: &str) -> ServiceResult<(UserStats, Source)> {
        match remote_or_cached("Fetching user stats", self.ctx.api.user_stats(user_id)).await? {
            Some(stats) => {
                self.store_stats(user_id, stats).await?;
                Ok((stats, Source::Remote))
            }
            None => Ok((self.recount_local(user_id).await?, Source::Cache)),
        }
    }

    pub async fn recount_local(&self, user_id: &str) -> ServiceResult<UserStats> {
        let agents: Vec<Agent> = self
            .ctx
            .store
            .filter_by_owner(AGENTS, "userId", user_id)
            .await?;
        let executions: Vec<Execution> = self
            .ctx
            .store
            .filter_by_owner(EXECUTIONS, "userId", user_id)
            .await?;
        let stats = UserStats::compute(&agents, &executions);
        self.store_stats(user_id, stats).await?;
        Ok(stats)
    }

    pub(crate) async fn refresh_local_stats(&self, user_id: &str) {
        if let Err(e) = self.recount_local(user_id).await {
            warn!("Could not refresh stats of {}: {}", user_id, e);
        }
    }

    async fn store_stats(&self, user_id: &str, stats: UserStats) -> ServiceResult<()> {
        if let Some(mut user) = self.ctx.store.find::<User>(USERS, user_id).await? {
            user.stats = stats;
            cache_write("user", self.ctx.store.save(USERS, &user).await);
        }
        if let Some(mut session) = self.ctx.session().await?
            && session.id == user_id
        {
            session.stats = stats;
            cache_write("session", self.ctx.store.set_value(SESSION_KEY, &session).await);
        }
        Ok(())
    }
}
