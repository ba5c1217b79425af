//! Provisions a transient application, service principal, client secret,
//! permission grants and managing user in an Entra ID tenant, and removes them
//! again on request.

pub mod config;
pub mod credentials;
pub mod error;
pub mod grants;
pub mod graph;
pub mod identity;
pub mod ledger;
pub mod orchestrator;
pub mod prompt;
pub mod roles;
pub mod telemetry;

pub use config::{AzureCredentials, ConfigError, SessionOptions, Settings};
pub use credentials::{
    BundleError, BundleStore, CredentialBundle, CredentialIssuer, FileBundleStore,
    MemoryBundleStore,
};
pub use error::{ProvisionError, Step};
pub use grants::{GrantFailure, GrantReport, PermissionGrant, PermissionGrantEngine};
pub use graph::{DirectoryClient, DirectoryError, GraphDirectory, MemoryDirectory};
pub use identity::IdentityFactory;
pub use ledger::{DirectoryObjectRef, ResourceKind, ResourceLedger};
pub use orchestrator::{
    ApplicationSource, ResourceOrchestrator, SessionReport, SessionRequest, TeardownFailure,
    TeardownReport, UserSource,
};
pub use prompt::{RequestError, collect_request};
pub use roles::{RoleBinder, RoleSelection};
