mod agent;
mod catalog;
mod execution;
mod file;
mod sync;
mod user;

#[cfg(test)]
mod tests;

pub use agent::AgentService;
pub use catalog::{CatalogService, ClientDraft, ProductDraft};
pub use execution::{ExecutionService, RunReport};
pub use file::{Analysis, FileService, UploadReport};
pub use sync::{FlushReport, SyncService};
pub use user::UserService;

use std::future::Future;
use tracing::warn;

use crate::core::api::{ApiClient, ApiError, ApiResult};
use crate::core::config::Config;
use crate::core::models::User;
use crate::core::store::{LocalStore, PendingOp, SESSION_KEY, StoreError, StoreResult};

/// Result of a write: confirmed by the backend, or kept locally and queued.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Synced(T),
    LocalOnly { value: T, reason: String },
}

impl<T> Outcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Outcome::Synced(v) => v,
            Outcome::LocalOnly { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Synced(v) => v,
            Outcome::LocalOnly { value, .. } => value,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, Outcome::Synced(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Synced(v) => Outcome::Synced(f(v)),
            Outcome::LocalOnly { value, reason } => Outcome::LocalOnly {
                value: f(value),
                reason,
            },
        }
    }
}

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Remote,
    Cache,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not logged in or session expired. Run `optiagent login` first.")]
    Unauthenticated,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("Operation canceled")]
    Canceled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(ApiError),
}

impl From<ApiError> for ServiceError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::NotAuthenticated | ApiError::Unauthorized(_) => ServiceError::Unauthenticated,
            ApiError::Canceled => ServiceError::Canceled,
            other => ServiceError::Api(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Auth failures surface; everything else is logged so the caller can fall
/// back to the cache.
pub(crate) fn absorb(what: &str, err: ApiError) -> ServiceResult<String> {
    if err.is_auth() {
        return Err(ServiceError::Unauthenticated);
    }
    warn!("{} failed, falling back to local data: {}", what, err);
    Ok(err.to_string())
}

/// Write failures: an unanswered request is kept for `sync flush`, anything
/// the backend refused goes back to the caller.
pub(crate) fn defer(what: &str, err: ApiError) -> ServiceResult<String> {
    if err.is_auth() || !err.is_transient() {
        return Err(err.into());
    }
    warn!("{} failed, keeping it locally: {}", what, err);
    Ok(err.to_string())
}

pub(crate) async fn remote_or_cached<T>(
    what: &str,
    remote: impl Future<Output = ApiResult<T>>,
) -> ServiceResult<Option<T>> {
    match remote.await {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            absorb(what, e)?;
            Ok(None)
        }
    }
}

/// Cache writes never fail a service call; quota overflow and the like are logged.
pub(crate) fn cache_write(what: &str, res: StoreResult<()>) -> bool {
    match res {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not cache {}: {}", what, e);
            false
        }
    }
}

/// Shared handles every service works through.
#[derive(Clone)]
pub struct Services {
    pub store: LocalStore,
    pub api: ApiClient,
}

impl Services {
    pub async fn open(config: &Config) -> ServiceResult<Self> {
        let store = LocalStore::open(&config.data_dir, config.storage_quota_bytes).await?;
        let api = ApiClient::new(config).map_err(ServiceError::Api)?;
        let services = Self::new(store, api);
        services.restore_session().await?;
        Ok(services)
    }

    pub fn new(store: LocalStore, api: ApiClient) -> Self {
        Self { store, api }
    }

    /// Load the saved session's token into the HTTP client.
    pub async fn restore_session(&self) -> ServiceResult<Option<User>> {
        let session: Option<User> = self.store.get_value(SESSION_KEY).await?;
        self.api
            .set_token(session.as_ref().and_then(|u| u.token.clone()));
        Ok(session)
    }

    pub(crate) async fn session(&self) -> ServiceResult<Option<User>> {
        Ok(self.store.get_value(SESSION_KEY).await?)
    }

    pub(crate) async fn require_user(&self) -> ServiceResult<User> {
        self.session().await?.ok_or(ServiceError::Unauthenticated)
    }

    /// Keep a write locally and queue it for `sync flush`.
    pub(crate) async fn queue(&self, op: PendingOp, reason: &str) {
        let owner = match self.session().await {
            Ok(session) => session.map(|u| u.id),
            Err(e) => {
                warn!("Could not read session for queued write: {}", e);
                None
            }
        };
        if let Err(e) = self.store.enqueue(op, reason, owner.as_deref()).await {
            warn!("Could not queue pending write: {}", e);
        }
    }

    pub fn agents(&self) -> AgentService {
        AgentService::new(self.clone())
    }

    pub fn executions(&self) -> ExecutionService {
        ExecutionService::new(self.clone())
    }

    pub fn files(&self) -> FileService {
        FileService::new(self.clone())
    }

    pub fn users(&self) -> UserService {
        UserService::new(self.clone())
    }

    pub fn sync(&self) -> SyncService {
        SyncService::new(self.clone())
    }

    pub fn catalog(&self) -> CatalogService {
        CatalogService::new(self.clone())
    }
}
