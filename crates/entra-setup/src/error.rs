use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{
    credentials::BundleError,
    grants::GrantFailure,
    graph::DirectoryError,
    orchestrator::TeardownFailure,
};

/// Workflow step a directory call belonged to, carried on errors so the operator
/// can reconcile by hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ResolveApplication,
    CreateApplication,
    CreateServicePrincipal,
    IssueCredential,
    LookupTenant,
    DeclarePermissions,
    ActivatePermission,
    LookupDomain,
    CreateUser,
    BindOwner,
    BindDirectoryRole,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::ResolveApplication => "resolve application",
            Step::CreateApplication => "create application",
            Step::CreateServicePrincipal => "create service principal",
            Step::IssueCredential => "issue client secret",
            Step::LookupTenant => "look up tenant",
            Step::DeclarePermissions => "declare permissions",
            Step::ActivatePermission => "activate permission",
            Step::LookupDomain => "look up domain",
            Step::CreateUser => "create user",
            Step::BindOwner => "bind owner",
            Step::BindDirectoryRole => "bind directory role",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("application with client id {app_id} could not be resolved: {source}")]
    UnknownApplication {
        app_id: String,
        #[source]
        source: DirectoryError,
    },
    #[error("{step} failed for {target}: {source}")]
    Directory {
        step: Step,
        target: String,
        #[source]
        source: DirectoryError,
    },
    #[error("{} of {} permission activations failed", failures.len(), failures.len() + succeeded)]
    PartialGrantFailure {
        succeeded: usize,
        failures: Vec<GrantFailure>,
    },
    #[error("{} of {} deletions failed", failures.len(), failures.len() + succeeded)]
    PartialTeardownFailure {
        succeeded: usize,
        failures: Vec<TeardownFailure>,
    },
    #[error("credential bundle could not be persisted: {0}")]
    Bundle(#[from] BundleError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProvisionError {
    pub fn directory(step: Step, target: impl Into<String>, source: DirectoryError) -> Self {
        Self::Directory {
            step,
            target: target.into(),
            source,
        }
    }
}
