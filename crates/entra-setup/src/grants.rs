use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{ProvisionError, Step},
    graph::{
        AppRoleAssignment, ApplicationPatch, DirectoryClient, DirectoryError,
        RequiredResourceAccess, ResourceAccess,
    },
};

/// An application permission on a resource API: the resource's client id and the
/// id of the app role being granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub resource_app_id: Uuid,
    pub app_role_id: Uuid,
}

impl PermissionGrant {
    pub fn new(resource_app_id: Uuid, app_role_id: Uuid) -> Self {
        Self {
            resource_app_id,
            app_role_id,
        }
    }
}

impl fmt::Display for PermissionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource_app_id, self.app_role_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantParseError {
    #[error("expected `<resourceAppId> <permissionId>`, got `{0}`")]
    Shape(String),
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidId {
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl FromStr for PermissionGrant {
    type Err = GrantParseError;

    /// Parses `<resourceAppId> <permissionId>`; extra whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(resource), Some(role), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(GrantParseError::Shape(s.trim().to_string()));
        };
        let parse = |field: &'static str, value: &str| {
            Uuid::parse_str(value).map_err(|err| GrantParseError::InvalidId {
                field,
                value: value.to_string(),
                reason: err.to_string(),
            })
        };
        Ok(Self::new(
            parse("resourceAppId", resource)?,
            parse("permissionId", role)?,
        ))
    }
}

/// Groups grants by resource, one entry per distinct resource with its role ids
/// deduplicated. Resources and roles keep first-seen order.
pub fn declared_permissions(grants: &[PermissionGrant]) -> Vec<RequiredResourceAccess> {
    let mut grouped: Vec<RequiredResourceAccess> = Vec::new();
    let mut index: BTreeMap<Uuid, usize> = BTreeMap::new();
    for grant in grants {
        let slot = *index.entry(grant.resource_app_id).or_insert_with(|| {
            grouped.push(RequiredResourceAccess {
                resource_app_id: grant.resource_app_id,
                resource_access: Vec::new(),
            });
            grouped.len() - 1
        });
        let access = &mut grouped[slot].resource_access;
        if !access.iter().any(|existing| existing.id == grant.app_role_id) {
            access.push(ResourceAccess::role(grant.app_role_id));
        }
    }
    grouped
}

/// Why a single permission could not be activated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GrantFailure {
    pub grant: PermissionGrant,
    pub step: Step,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GrantActivation {
    pub grant: PermissionGrant,
    pub resource_service_principal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
}

/// Outcome of a grant run: the declared manifest plus every per-pair activation result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GrantReport {
    pub declared: Vec<RequiredResourceAccess>,
    pub activated: Vec<GrantActivation>,
    pub failures: Vec<GrantFailure>,
}

impl GrantReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts collected activation failures into [`ProvisionError::PartialGrantFailure`].
    pub fn into_result(self) -> Result<Self, ProvisionError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ProvisionError::PartialGrantFailure {
                succeeded: self.activated.len(),
                failures: self.failures,
            })
        }
    }
}

/// Declares permissions on an application and activates each one on its service principal.
pub struct PermissionGrantEngine<'a> {
    directory: &'a dyn DirectoryClient,
}

impl<'a> PermissionGrantEngine<'a> {
    pub fn new(directory: &'a dyn DirectoryClient) -> Self {
        Self { directory }
    }

    /// Replaces the application's declared permissions with `grants`, then creates one
    /// app-role assignment per distinct pair. A failed declaration aborts; failed
    /// activations are collected in the report and do not stop the others.
    pub async fn grant(
        &self,
        application_object_id: &str,
        principal_id: &str,
        grants: &[PermissionGrant],
    ) -> Result<GrantReport, ProvisionError> {
        if grants.is_empty() {
            return Ok(GrantReport::default());
        }

        let declared = declared_permissions(grants);
        let patch = ApplicationPatch {
            required_resource_access: declared.clone(),
        };
        self.directory
            .patch_application(application_object_id, &patch)
            .await
            .map_err(|err| {
                ProvisionError::directory(Step::DeclarePermissions, application_object_id, err)
            })?;
        info!(
            target = "provision.grants",
            event = "grant.declare.success",
            application = %application_object_id,
            resources = declared.len(),
            "declared permissions patched"
        );

        let mut report = GrantReport {
            declared,
            ..GrantReport::default()
        };
        let mut seen = Vec::with_capacity(grants.len());
        for grant in grants {
            if seen.contains(grant) {
                continue;
            }
            seen.push(*grant);
            match self.activate(principal_id, grant).await {
                Ok(activation) => {
                    info!(
                        target = "provision.grants",
                        event = "grant.activate.success",
                        principal = %principal_id,
                        resource = %activation.resource_service_principal_id,
                        app_role = %grant.app_role_id,
                        "app role assigned"
                    );
                    report.activated.push(activation);
                }
                Err((step, err)) => {
                    warn!(
                        target = "provision.grants",
                        event = "grant.activate.error",
                        principal = %principal_id,
                        resource_app = %grant.resource_app_id,
                        app_role = %grant.app_role_id,
                        error = %err,
                        "app role assignment failed"
                    );
                    report.failures.push(GrantFailure {
                        grant: *grant,
                        step,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn activate(
        &self,
        principal_id: &str,
        grant: &PermissionGrant,
    ) -> Result<GrantActivation, (Step, DirectoryError)> {
        let resource = self
            .directory
            .get_service_principal_by_app_id(&grant.resource_app_id.to_string())
            .await
            .map_err(|err| (Step::ResolveApplication, err))?;
        let assignment = AppRoleAssignment {
            id: None,
            principal_id: principal_id.to_string(),
            resource_id: resource.object_id.clone(),
            app_role_id: grant.app_role_id,
        };
        let created = self
            .directory
            .create_app_role_assignment(principal_id, &assignment)
            .await
            .map_err(|err| (Step::ActivatePermission, err))?;
        Ok(GrantActivation {
            grant: *grant,
            resource_service_principal_id: resource.object_id,
            assignment_id: created.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DirectoryCall, MemoryDirectory, Operation};

    const GRAPH: &str = "00000003-0000-0000-c000-000000000000";
    const ROLE_MGMT: &str = "9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8";
    const USER_RW: &str = "741f803b-c850-494e-b5df-cde7c675a1ca";

    fn grant(resource: &str, role: &str) -> PermissionGrant {
        format!("{resource} {role}").parse().unwrap()
    }

    #[test]
    fn parses_pairs_and_rejects_malformed_lines() {
        let parsed: PermissionGrant = format!("  {GRAPH}   {ROLE_MGMT} ").parse().unwrap();
        assert_eq!(parsed.resource_app_id.to_string(), GRAPH);
        assert!(matches!(
            GRAPH.parse::<PermissionGrant>(),
            Err(GrantParseError::Shape(_))
        ));
        assert!(matches!(
            format!("{GRAPH} not-a-guid").parse::<PermissionGrant>(),
            Err(GrantParseError::InvalidId {
                field: "permissionId",
                ..
            })
        ));
        assert!(format!("{GRAPH} {ROLE_MGMT} extra").parse::<PermissionGrant>().is_err());
    }

    #[test]
    fn grouping_emits_one_entry_per_resource_without_duplicate_roles() {
        let other = "00000002-0000-0ff1-ce00-000000000000";
        let grants = vec![
            grant(GRAPH, ROLE_MGMT),
            grant(other, ROLE_MGMT),
            grant(GRAPH, USER_RW),
            grant(GRAPH, ROLE_MGMT),
        ];
        let declared = declared_permissions(&grants);
        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0].resource_app_id.to_string(), GRAPH);
        let graph_roles: Vec<String> = declared[0]
            .resource_access
            .iter()
            .map(|access| access.id.to_string())
            .collect();
        assert_eq!(graph_roles, vec![ROLE_MGMT, USER_RW]);
        assert_eq!(declared[1].resource_access.len(), 1);
    }

    #[tokio::test]
    async fn empty_grant_list_makes_no_calls() {
        let directory = MemoryDirectory::new();
        let engine = PermissionGrantEngine::new(&directory);
        let report = engine.grant("app", "sp", &[]).await.unwrap();
        assert!(report.is_complete());
        assert!(report.declared.is_empty());
        assert!(directory.calls().is_empty());
    }

    #[tokio::test]
    async fn single_grant_patches_then_assigns_against_resource_principal() {
        let directory = MemoryDirectory::new();
        let (app, sp) = directory.seed_application("target");
        let graph_sp = directory
            .get_service_principal_by_app_id(GRAPH)
            .await
            .unwrap();
        let engine = PermissionGrantEngine::new(&directory);

        let report = engine
            .grant(&app.object_id, &sp.object_id, &[grant(GRAPH, ROLE_MGMT)])
            .await
            .unwrap();
        assert!(report.is_complete());

        let patches = directory.calls_of(Operation::PatchApplication);
        assert_eq!(patches.len(), 1);
        let DirectoryCall::PatchApplication { patch, .. } = &patches[0] else {
            unreachable!()
        };
        assert_eq!(patch.required_resource_access.len(), 1);
        assert_eq!(patch.required_resource_access[0].resource_access.len(), 1);

        let assignments = directory.app_role_assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].resource_id, graph_sp.object_id);
        assert_eq!(assignments[0].principal_id, sp.object_id);
    }

    #[tokio::test]
    async fn failed_activation_does_not_block_remaining_pairs() {
        let directory = MemoryDirectory::new();
        let (app, sp) = directory.seed_application("target");
        let unknown_resource = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        let engine = PermissionGrantEngine::new(&directory);

        let report = engine
            .grant(
                &app.object_id,
                &sp.object_id,
                &[grant(unknown_resource, ROLE_MGMT), grant(GRAPH, USER_RW)],
            )
            .await
            .unwrap();
        assert_eq!(report.activated.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, Step::ResolveApplication);

        match report.into_result() {
            Err(ProvisionError::PartialGrantFailure {
                succeeded,
                failures,
            }) => {
                assert_eq!(succeeded, 1);
                assert_eq!(failures[0].grant.resource_app_id.to_string(), unknown_resource);
            }
            other => panic!("expected partial grant failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn declaration_failure_skips_activation() {
        let directory = MemoryDirectory::new();
        let (app, sp) = directory.seed_application("target");
        directory.fail_on(
            Operation::PatchApplication,
            None,
            DirectoryError::api(403, "Insufficient privileges"),
        );
        let engine = PermissionGrantEngine::new(&directory);

        let err = engine
            .grant(&app.object_id, &sp.object_id, &[grant(GRAPH, ROLE_MGMT)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Directory {
                step: Step::DeclarePermissions,
                ..
            }
        ));
        assert!(directory.calls_of(Operation::CreateAppRoleAssignment).is_empty());
    }
}
