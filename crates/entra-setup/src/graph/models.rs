use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const UNIFIED_ROLE_ASSIGNMENT_ODATA_TYPE: &str = "#microsoft.graph.unifiedRoleAssignment";
/// Tenant-wide directory scope for role assignments.
pub const TENANT_SCOPE: &str = "/";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_in_audience: Option<String>,
}

impl NewApplication {
    pub fn validate(&self) -> Result<(), String> {
        if self.display_name.trim().is_empty() {
            return Err("application display name must not be empty".into());
        }
        Ok(())
    }
}

/// An application registration. `object_id` addresses the registration itself,
/// `app_id` is the client id used for service principal and permission lookups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(rename = "id")]
    pub object_id: String,
    pub app_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    #[serde(rename = "id")]
    pub object_id: String,
    pub app_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Full replacement of an application's declared permissions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPatch {
    pub required_resource_access: Vec<RequiredResourceAccess>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredResourceAccess {
    pub resource_app_id: Uuid,
    pub resource_access: Vec<ResourceAccess>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAccess {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ResourceAccessKind,
}

impl ResourceAccess {
    pub fn role(id: Uuid) -> Self {
        Self {
            id,
            kind: ResourceAccessKind::Role,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAccessKind {
    /// Application permission.
    Role,
    /// Delegated permission.
    Scope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRoleAssignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub principal_id: String,
    pub resource_id: String,
    pub app_role_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordCredentialRequest {
    pub display_name: String,
}

/// Response of the add-password call. `secret_text` is only ever present here.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordCredential {
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub secret_text: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date_time: Option<OffsetDateTime>,
}

impl fmt::Debug for PasswordCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCredential")
            .field("key_id", &self.key_id)
            .field("display_name", &self.display_name)
            .field("secret_text", &self.secret_text.as_ref().map(|_| "<redacted>"))
            .field("end_date_time", &self.end_date_time)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_verified: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub account_enabled: bool,
    pub display_name: String,
    pub mail_nickname: String,
    pub user_principal_name: String,
    pub password_profile: PasswordProfile,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), String> {
        if self.display_name.trim().is_empty() {
            return Err("user display name must not be empty".into());
        }
        if self.mail_nickname.is_empty()
            || self.mail_nickname.contains(char::is_whitespace)
            || self.mail_nickname.contains('@')
        {
            return Err(format!("invalid mail nickname `{}`", self.mail_nickname));
        }
        match self.user_principal_name.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => {
                return Err(format!(
                    "invalid user principal name `{}`",
                    self.user_principal_name
                ));
            }
        }
        if self.password_profile.password.is_empty() {
            return Err("initial password must not be empty".into());
        }
        Ok(())
    }
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("account_enabled", &self.account_enabled)
            .field("display_name", &self.display_name)
            .field("mail_nickname", &self.mail_nickname)
            .field("user_principal_name", &self.user_principal_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordProfile {
    pub force_change_password_next_sign_in: bool,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "id")]
    pub object_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedRoleAssignment {
    #[serde(rename = "@odata.type", default = "unified_role_assignment_type")]
    pub odata_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role_definition_id: String,
    pub principal_id: String,
    pub directory_scope_id: String,
}

impl UnifiedRoleAssignment {
    pub fn tenant_wide(role_definition_id: impl Into<String>, principal_id: impl Into<String>) -> Self {
        Self {
            odata_type: unified_role_assignment_type(),
            id: None,
            role_definition_id: role_definition_id.into(),
            principal_id: principal_id.into(),
            directory_scope_id: TENANT_SCOPE.to_string(),
        }
    }
}

fn unified_role_assignment_type() -> String {
    UNIFIED_ROLE_ASSIGNMENT_ODATA_TYPE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn application_patch_uses_graph_field_names() {
        let patch = ApplicationPatch {
            required_resource_access: vec![RequiredResourceAccess {
                resource_app_id: "00000003-0000-0000-c000-000000000000".parse().unwrap(),
                resource_access: vec![ResourceAccess::role(
                    "9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8".parse().unwrap(),
                )],
            }],
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({
                "requiredResourceAccess": [{
                    "resourceAppId": "00000003-0000-0000-c000-000000000000",
                    "resourceAccess": [{
                        "id": "9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8",
                        "type": "Role"
                    }]
                }]
            })
        );
    }

    #[test]
    fn application_reads_object_id_from_id_field() {
        let app: Application = serde_json::from_value(json!({
            "id": "obj-1",
            "appId": "client-1",
            "displayName": "Demo",
            "signInAudience": "AzureADMyOrg"
        }))
        .unwrap();
        assert_eq!(app.object_id, "obj-1");
        assert_eq!(app.app_id, "client-1");
    }

    #[test]
    fn unified_role_assignment_carries_odata_type() {
        let assignment = UnifiedRoleAssignment::tenant_wide("role-def", "user-1");
        let value = serde_json::to_value(&assignment).unwrap();
        assert_eq!(value["@odata.type"], UNIFIED_ROLE_ASSIGNMENT_ODATA_TYPE);
        assert_eq!(value["directoryScopeId"], "/");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let credential: PasswordCredential = serde_json::from_value(json!({
            "keyId": "k",
            "secretText": "very-secret",
            "endDateTime": "2027-01-01T00:00:00Z"
        }))
        .unwrap();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("very-secret"));

        let user = NewUser {
            account_enabled: true,
            display_name: "Jane Roe".into(),
            mail_nickname: "JaneRoe".into(),
            user_principal_name: "janeroe@contoso.test".into(),
            password_profile: PasswordProfile {
                force_change_password_next_sign_in: true,
                password: "hunter2!A".into(),
            },
        };
        assert!(!format!("{user:?}").contains("hunter2"));
    }

    #[test]
    fn new_user_validation_rejects_bad_principal_names() {
        let mut user = NewUser {
            account_enabled: true,
            display_name: "Jane Roe".into(),
            mail_nickname: "JaneRoe".into(),
            user_principal_name: "janeroe@contoso.test".into(),
            password_profile: PasswordProfile {
                force_change_password_next_sign_in: true,
                password: "pw".into(),
            },
        };
        assert!(user.validate().is_ok());
        user.user_principal_name = "janeroe@".into();
        assert!(user.validate().is_err());
        user.user_principal_name = "janeroe@contoso.test".into();
        user.mail_nickname = "Jane Roe".into();
        assert!(user.validate().is_err());
    }
}
