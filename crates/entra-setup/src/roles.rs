use std::{fmt, str::FromStr};

use serde::Serialize;
use tracing::info;

use crate::{
    error::{ProvisionError, Step},
    graph::{Application, DirectoryClient, UnifiedRoleAssignment},
};

pub const APPLICATION_ADMINISTRATOR_ROLE_ID: &str = "9b895d92-2cd3-44c7-9d02-a6ac2d5ea5c3";
pub const CLOUD_APPLICATION_ADMINISTRATOR_ROLE_ID: &str = "158c047a-c907-4556-b7ef-446551a6b5f7";

/// Privilege a staged user gets over the session's application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSelection {
    /// Ownership of the application object.
    Owner,
    ApplicationAdministrator,
    CloudApplicationAdministrator,
}

impl RoleSelection {
    /// Directory role template id, `None` for ownership.
    pub fn role_definition_id(self) -> Option<&'static str> {
        match self {
            RoleSelection::Owner => None,
            RoleSelection::ApplicationAdministrator => Some(APPLICATION_ADMINISTRATOR_ROLE_ID),
            RoleSelection::CloudApplicationAdministrator => {
                Some(CLOUD_APPLICATION_ADMINISTRATOR_ROLE_ID)
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RoleSelection::Owner => "Application Owner",
            RoleSelection::ApplicationAdministrator => "Application Administrator",
            RoleSelection::CloudApplicationAdministrator => "Cloud Application Administrator",
        }
    }
}

impl fmt::Display for RoleSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RoleSelection {
    type Err = String;

    /// Accepts the menu numbers `1`-`3` or a role name in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "1" | "owner" | "applicationowner" => Ok(RoleSelection::Owner),
            "2" | "applicationadministrator" | "appadmin" => {
                Ok(RoleSelection::ApplicationAdministrator)
            }
            "3" | "cloudapplicationadministrator" | "cloudappadmin" => {
                Ok(RoleSelection::CloudApplicationAdministrator)
            }
            _ => Err(format!("unknown role `{}`", s.trim())),
        }
    }
}

/// What a binding created, for the session report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleBinding {
    pub role: RoleSelection,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
}

pub struct RoleBinder<'a> {
    directory: &'a dyn DirectoryClient,
}

impl<'a> RoleBinder<'a> {
    pub fn new(directory: &'a dyn DirectoryClient) -> Self {
        Self { directory }
    }

    /// Makes `user_id` an owner of `application` or assigns it a tenant-wide
    /// directory role.
    pub async fn bind(
        &self,
        user_id: &str,
        application: Option<&Application>,
        role: RoleSelection,
    ) -> Result<RoleBinding, ProvisionError> {
        let assignment_id = match role.role_definition_id() {
            None => {
                let app = application.ok_or_else(|| {
                    ProvisionError::InvalidRequest(
                        "application ownership requires an application".into(),
                    )
                })?;
                self.directory
                    .create_owner_reference(&app.object_id, user_id)
                    .await
                    .map_err(|err| ProvisionError::directory(Step::BindOwner, &app.object_id, err))?;
                None
            }
            Some(definition) => {
                let assignment = UnifiedRoleAssignment::tenant_wide(definition, user_id);
                let created = self
                    .directory
                    .create_unified_role_assignment(&assignment)
                    .await
                    .map_err(|err| ProvisionError::directory(Step::BindDirectoryRole, user_id, err))?;
                created.id
            }
        };
        info!(
            target = "provision.roles",
            event = "role.bind.success",
            user = %user_id,
            role = %role,
            "role bound"
        );
        Ok(RoleBinding {
            role,
            user_id: user_id.to_string(),
            assignment_id,
        })
    }
}
