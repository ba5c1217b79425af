//! Directory-service seam: the operations the provisioning workflow needs from the
//! tenant's object catalog, plus the live and in-memory implementations.

pub mod live;
pub mod memory;
pub mod models;

use async_trait::async_trait;
use thiserror::Error;

pub use live::GraphDirectory;
pub use memory::{DirectoryCall, MemoryDirectory, Operation};
pub use models::{
    AppRoleAssignment, Application, ApplicationPatch, Domain, NewApplication, NewUser,
    Organization, PasswordCredential, PasswordCredentialRequest, PasswordProfile,
    RequiredResourceAccess, ResourceAccess, ServicePrincipal, UnifiedRoleAssignment, User,
};

/// Failure reported by the directory service or the transport in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory returned {status}{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },
    #[error("invalid directory response: {0}")]
    InvalidResponse(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl DirectoryError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// 429: the directory refused the request without applying it.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }

    /// Throttling, server-side failures and retryable transport errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::InvalidResponse(err.to_string());
        }
        Self::Transport {
            retryable: err.is_timeout() || err.is_connect(),
            message: err.to_string(),
        }
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Typed CRUD over the directory objects a session touches. Each method is one
/// request/response unit against the remote catalog.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> DirectoryResult<User>;

    async fn create_application(&self, app: &NewApplication) -> DirectoryResult<Application>;

    async fn create_service_principal(&self, app_id: &str) -> DirectoryResult<ServicePrincipal>;

    /// Looks an application up by its client id (`appId`), not its object id.
    async fn get_application_by_app_id(&self, app_id: &str) -> DirectoryResult<Application>;

    async fn get_service_principal_by_app_id(
        &self,
        app_id: &str,
    ) -> DirectoryResult<ServicePrincipal>;

    async fn patch_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> DirectoryResult<()>;

    /// Creates the assignment on the service principal identified by `principal_id`.
    async fn create_app_role_assignment(
        &self,
        principal_id: &str,
        assignment: &AppRoleAssignment,
    ) -> DirectoryResult<AppRoleAssignment>;

    async fn create_password_credential(
        &self,
        object_id: &str,
        request: &PasswordCredentialRequest,
    ) -> DirectoryResult<PasswordCredential>;

    async fn get_organization(&self) -> DirectoryResult<Vec<Organization>>;

    async fn get_domains(&self) -> DirectoryResult<Vec<Domain>>;

    async fn create_owner_reference(
        &self,
        application_object_id: &str,
        directory_object_id: &str,
    ) -> DirectoryResult<()>;

    async fn create_unified_role_assignment(
        &self,
        assignment: &UnifiedRoleAssignment,
    ) -> DirectoryResult<UnifiedRoleAssignment>;

    async fn delete_application(&self, object_id: &str) -> DirectoryResult<()>;

    async fn delete_service_principal(&self, object_id: &str) -> DirectoryResult<()>;

    async fn delete_user(&self, object_id: &str) -> DirectoryResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(DirectoryError::api(429, "slow down").is_transient());
        assert!(DirectoryError::api(503, "unavailable").is_transient());
        assert!(!DirectoryError::api(403, "forbidden").is_transient());
        assert!(!DirectoryError::InvalidResponse("bad".into()).is_transient());
        assert!(DirectoryError::api(429, "slow down").is_throttled());
        assert!(!DirectoryError::api(503, "unavailable").is_throttled());
        assert!(
            DirectoryError::Transport {
                message: "timed out".into(),
                retryable: true
            }
            .is_transient()
        );
    }

    #[test]
    fn api_error_display_includes_code() {
        let err = DirectoryError::Api {
            status: 404,
            code: Some("Request_ResourceNotFound".into()),
            message: "missing".into(),
            retry_after: None,
        };
        assert_eq!(
            err.to_string(),
            "directory returned 404 (Request_ResourceNotFound): missing"
        );
        assert!(err.is_not_found());
    }
}
