use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::{
    DirectoryClient, DirectoryError, DirectoryResult,
    models::{
        AppRoleAssignment, Application, ApplicationPatch, Domain, NewApplication, NewUser,
        Organization, PasswordCredential, PasswordCredentialRequest, ServicePrincipal,
        UnifiedRoleAssignment, User,
    },
};

/// Client id of the Microsoft Graph resource application.
pub const MICROSOFT_GRAPH_APP_ID: &str = "00000003-0000-0000-c000-000000000000";

/// Kind of directory call, used to target injected failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Operation {
    CreateUser,
    CreateApplication,
    CreateServicePrincipal,
    GetApplication,
    GetServicePrincipal,
    PatchApplication,
    CreateAppRoleAssignment,
    CreatePasswordCredential,
    GetOrganization,
    GetDomains,
    CreateOwnerReference,
    CreateUnifiedRoleAssignment,
    DeleteApplication,
    DeleteServicePrincipal,
    DeleteUser,
}

/// One recorded call, with the identifiers and payload it carried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DirectoryCall {
    CreateUser { user_principal_name: String },
    CreateApplication { display_name: String },
    CreateServicePrincipal { app_id: String },
    GetApplication { app_id: String },
    GetServicePrincipal { app_id: String },
    PatchApplication { object_id: String, patch: ApplicationPatch },
    CreateAppRoleAssignment { principal_id: String, assignment: AppRoleAssignment },
    CreatePasswordCredential { object_id: String },
    GetOrganization,
    GetDomains,
    CreateOwnerReference { application_object_id: String, directory_object_id: String },
    CreateUnifiedRoleAssignment { assignment: UnifiedRoleAssignment },
    DeleteApplication { object_id: String },
    DeleteServicePrincipal { object_id: String },
    DeleteUser { object_id: String },
}

impl DirectoryCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreateUser { .. } => Operation::CreateUser,
            Self::CreateApplication { .. } => Operation::CreateApplication,
            Self::CreateServicePrincipal { .. } => Operation::CreateServicePrincipal,
            Self::GetApplication { .. } => Operation::GetApplication,
            Self::GetServicePrincipal { .. } => Operation::GetServicePrincipal,
            Self::PatchApplication { .. } => Operation::PatchApplication,
            Self::CreateAppRoleAssignment { .. } => Operation::CreateAppRoleAssignment,
            Self::CreatePasswordCredential { .. } => Operation::CreatePasswordCredential,
            Self::GetOrganization => Operation::GetOrganization,
            Self::GetDomains => Operation::GetDomains,
            Self::CreateOwnerReference { .. } => Operation::CreateOwnerReference,
            Self::CreateUnifiedRoleAssignment { .. } => Operation::CreateUnifiedRoleAssignment,
            Self::DeleteApplication { .. } => Operation::DeleteApplication,
            Self::DeleteServicePrincipal { .. } => Operation::DeleteServicePrincipal,
            Self::DeleteUser { .. } => Operation::DeleteUser,
        }
    }

    /// The identifier a failure can be keyed on, if the call has one.
    fn target(&self) -> Option<&str> {
        match self {
            Self::CreateServicePrincipal { app_id }
            | Self::GetApplication { app_id }
            | Self::GetServicePrincipal { app_id } => Some(app_id),
            Self::PatchApplication { object_id, .. }
            | Self::CreatePasswordCredential { object_id }
            | Self::DeleteApplication { object_id }
            | Self::DeleteServicePrincipal { object_id }
            | Self::DeleteUser { object_id } => Some(object_id),
            Self::CreateAppRoleAssignment { assignment, .. } => Some(&assignment.resource_id),
            Self::CreateOwnerReference {
                application_object_id,
                ..
            } => Some(application_object_id),
            Self::CreateUser { .. }
            | Self::CreateApplication { .. }
            | Self::GetOrganization
            | Self::GetDomains
            | Self::CreateUnifiedRoleAssignment { .. } => None,
        }
    }
}

#[derive(Default)]
struct State {
    tenant_id: String,
    domains: Vec<Domain>,
    applications: BTreeMap<String, Application>,
    service_principals: BTreeMap<String, ServicePrincipal>,
    users: BTreeMap<String, User>,
    owners: BTreeMap<String, BTreeSet<String>>,
    app_role_assignments: Vec<AppRoleAssignment>,
    role_assignments: Vec<UnifiedRoleAssignment>,
    declared: BTreeMap<String, ApplicationPatch>,
    calls: Vec<DirectoryCall>,
    failures: Vec<(Operation, Option<String>, DirectoryError)>,
}

/// In-memory directory that behaves like the live service for the calls a session
/// makes and records every call in order. Used for dry runs and tests.
pub struct MemoryDirectory {
    state: Mutex<State>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    /// A tenant with a default domain and the Microsoft Graph resource service principal.
    pub fn new() -> Self {
        let directory = Self::empty(Uuid::new_v4().to_string());
        directory.add_domain("contoso.onmicrosoft.com", true);
        directory.seed_resource_service_principal(MICROSOFT_GRAPH_APP_ID, "Microsoft Graph");
        directory
    }

    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                tenant_id: tenant_id.into(),
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory directory lock poisoned")
    }

    pub fn tenant_id(&self) -> String {
        self.lock().tenant_id.clone()
    }

    pub fn add_domain(&self, name: &str, is_default: bool) {
        self.lock().domains.push(Domain {
            id: name.to_string(),
            is_default,
            is_verified: true,
        });
    }

    /// Registers an application + service principal owned by someone else, e.g. a
    /// first-party API or an app the operator supplies by client id.
    pub fn seed_application(&self, display_name: &str) -> (Application, ServicePrincipal) {
        let app = Application {
            object_id: Uuid::new_v4().to_string(),
            app_id: Uuid::new_v4().to_string(),
            display_name: Some(display_name.to_string()),
        };
        let sp = ServicePrincipal {
            object_id: Uuid::new_v4().to_string(),
            app_id: app.app_id.clone(),
            display_name: Some(display_name.to_string()),
        };
        let mut state = self.lock();
        state
            .applications
            .insert(app.object_id.clone(), app.clone());
        state
            .service_principals
            .insert(sp.object_id.clone(), sp.clone());
        (app, sp)
    }

    pub fn seed_resource_service_principal(&self, app_id: &str, display_name: &str) -> ServicePrincipal {
        let sp = ServicePrincipal {
            object_id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            display_name: Some(display_name.to_string()),
        };
        self.lock()
            .service_principals
            .insert(sp.object_id.clone(), sp.clone());
        sp
    }

    pub fn seed_user(&self, user_principal_name: &str) -> User {
        let user = User {
            object_id: Uuid::new_v4().to_string(),
            display_name: None,
            user_principal_name: Some(user_principal_name.to_string()),
        };
        self.lock()
            .users
            .insert(user.object_id.clone(), user.clone());
        user
    }

    /// Makes every call of `operation` fail. With `target`, only calls addressing
    /// that identifier fail.
    pub fn fail_on(&self, operation: Operation, target: Option<&str>, error: DirectoryError) {
        self.lock()
            .failures
            .push((operation, target.map(str::to_string), error));
    }

    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, operation: Operation) -> Vec<DirectoryCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation() == operation)
            .cloned()
            .collect()
    }

    pub fn has_application(&self, object_id: &str) -> bool {
        self.lock().applications.contains_key(object_id)
    }

    pub fn has_service_principal(&self, object_id: &str) -> bool {
        self.lock().service_principals.contains_key(object_id)
    }

    pub fn has_user(&self, object_id: &str) -> bool {
        self.lock().users.contains_key(object_id)
    }

    pub fn owners_of(&self, application_object_id: &str) -> Vec<String> {
        self.lock()
            .owners
            .get(application_object_id)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn declared_permissions(&self, application_object_id: &str) -> Option<ApplicationPatch> {
        self.lock().declared.get(application_object_id).cloned()
    }

    pub fn app_role_assignments(&self) -> Vec<AppRoleAssignment> {
        self.lock().app_role_assignments.clone()
    }

    pub fn role_assignments(&self) -> Vec<UnifiedRoleAssignment> {
        self.lock().role_assignments.clone()
    }

    /// Records the call and returns the injected failure for it, if any.
    fn begin(&self, state: &mut State, call: DirectoryCall) -> DirectoryResult<()> {
        let operation = call.operation();
        let target = call.target().map(str::to_string);
        state.calls.push(call);
        let injected = state.failures.iter().find(|(op, wanted, _)| {
            *op == operation
                && wanted
                    .as_deref()
                    .is_none_or(|wanted| target.as_deref() == Some(wanted))
        });
        match injected {
            Some((_, _, error)) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn not_found(kind: &str, id: &str) -> DirectoryError {
    DirectoryError::Api {
        status: 404,
        code: Some("Request_ResourceNotFound".into()),
        message: format!("{kind} '{id}' does not exist"),
        retry_after: None,
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn create_user(&self, user: &NewUser) -> DirectoryResult<User> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateUser {
                user_principal_name: user.user_principal_name.clone(),
            },
        )?;
        let created = User {
            object_id: Uuid::new_v4().to_string(),
            display_name: Some(user.display_name.clone()),
            user_principal_name: Some(user.user_principal_name.clone()),
        };
        state
            .users
            .insert(created.object_id.clone(), created.clone());
        Ok(created)
    }

    async fn create_application(&self, app: &NewApplication) -> DirectoryResult<Application> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateApplication {
                display_name: app.display_name.clone(),
            },
        )?;
        let created = Application {
            object_id: Uuid::new_v4().to_string(),
            app_id: Uuid::new_v4().to_string(),
            display_name: Some(app.display_name.clone()),
        };
        state
            .applications
            .insert(created.object_id.clone(), created.clone());
        Ok(created)
    }

    async fn create_service_principal(&self, app_id: &str) -> DirectoryResult<ServicePrincipal> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateServicePrincipal {
                app_id: app_id.to_string(),
            },
        )?;
        let app = state
            .applications
            .values()
            .find(|app| app.app_id.eq_ignore_ascii_case(app_id))
            .cloned()
            .ok_or_else(|| not_found("application", app_id))?;
        let created = ServicePrincipal {
            object_id: Uuid::new_v4().to_string(),
            app_id: app.app_id,
            display_name: app.display_name,
        };
        state
            .service_principals
            .insert(created.object_id.clone(), created.clone());
        Ok(created)
    }

    async fn get_application_by_app_id(&self, app_id: &str) -> DirectoryResult<Application> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::GetApplication {
                app_id: app_id.to_string(),
            },
        )?;
        state
            .applications
            .values()
            .find(|app| app.app_id.eq_ignore_ascii_case(app_id))
            .cloned()
            .ok_or_else(|| not_found("application", app_id))
    }

    async fn get_service_principal_by_app_id(
        &self,
        app_id: &str,
    ) -> DirectoryResult<ServicePrincipal> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::GetServicePrincipal {
                app_id: app_id.to_string(),
            },
        )?;
        state
            .service_principals
            .values()
            .find(|sp| sp.app_id.eq_ignore_ascii_case(app_id))
            .cloned()
            .ok_or_else(|| not_found("servicePrincipal", app_id))
    }

    async fn patch_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> DirectoryResult<()> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::PatchApplication {
                object_id: object_id.to_string(),
                patch: patch.clone(),
            },
        )?;
        if !state.applications.contains_key(object_id) {
            return Err(not_found("application", object_id));
        }
        state.declared.insert(object_id.to_string(), patch.clone());
        Ok(())
    }

    async fn create_app_role_assignment(
        &self,
        principal_id: &str,
        assignment: &AppRoleAssignment,
    ) -> DirectoryResult<AppRoleAssignment> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateAppRoleAssignment {
                principal_id: principal_id.to_string(),
                assignment: assignment.clone(),
            },
        )?;
        if !state.service_principals.contains_key(principal_id) {
            return Err(not_found("servicePrincipal", principal_id));
        }
        let duplicate = state.app_role_assignments.iter().any(|existing| {
            existing.principal_id == assignment.principal_id
                && existing.resource_id == assignment.resource_id
                && existing.app_role_id == assignment.app_role_id
        });
        if duplicate {
            return Err(DirectoryError::Api {
                status: 400,
                code: Some("Request_BadRequest".into()),
                message: "Permission being assigned already exists on the object".into(),
                retry_after: None,
            });
        }
        let created = AppRoleAssignment {
            id: Some(Uuid::new_v4().to_string()),
            ..assignment.clone()
        };
        state.app_role_assignments.push(created.clone());
        Ok(created)
    }

    async fn create_password_credential(
        &self,
        object_id: &str,
        request: &PasswordCredentialRequest,
    ) -> DirectoryResult<PasswordCredential> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreatePasswordCredential {
                object_id: object_id.to_string(),
            },
        )?;
        if !state.applications.contains_key(object_id) {
            return Err(not_found("application", object_id));
        }
        Ok(PasswordCredential {
            key_id: Some(Uuid::new_v4().to_string()),
            display_name: Some(request.display_name.clone()),
            secret_text: Some(format!("mem~{}", Uuid::new_v4().simple())),
            end_date_time: None,
        })
    }

    async fn get_organization(&self) -> DirectoryResult<Vec<Organization>> {
        let mut state = self.lock();
        self.begin(&mut state, DirectoryCall::GetOrganization)?;
        Ok(vec![Organization {
            id: state.tenant_id.clone(),
            display_name: Some("Contoso".into()),
        }])
    }

    async fn get_domains(&self) -> DirectoryResult<Vec<Domain>> {
        let mut state = self.lock();
        self.begin(&mut state, DirectoryCall::GetDomains)?;
        Ok(state.domains.clone())
    }

    async fn create_owner_reference(
        &self,
        application_object_id: &str,
        directory_object_id: &str,
    ) -> DirectoryResult<()> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateOwnerReference {
                application_object_id: application_object_id.to_string(),
                directory_object_id: directory_object_id.to_string(),
            },
        )?;
        if !state.applications.contains_key(application_object_id) {
            return Err(not_found("application", application_object_id));
        }
        if !state.users.contains_key(directory_object_id) {
            return Err(not_found("directoryObject", directory_object_id));
        }
        state
            .owners
            .entry(application_object_id.to_string())
            .or_default()
            .insert(directory_object_id.to_string());
        Ok(())
    }

    async fn create_unified_role_assignment(
        &self,
        assignment: &UnifiedRoleAssignment,
    ) -> DirectoryResult<UnifiedRoleAssignment> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::CreateUnifiedRoleAssignment {
                assignment: assignment.clone(),
            },
        )?;
        if !state.users.contains_key(&assignment.principal_id) {
            return Err(not_found("directoryObject", &assignment.principal_id));
        }
        let created = UnifiedRoleAssignment {
            id: Some(Uuid::new_v4().to_string()),
            ..assignment.clone()
        };
        state.role_assignments.push(created.clone());
        Ok(created)
    }

    async fn delete_application(&self, object_id: &str) -> DirectoryResult<()> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::DeleteApplication {
                object_id: object_id.to_string(),
            },
        )?;
        state
            .applications
            .remove(object_id)
            .ok_or_else(|| not_found("application", object_id))?;
        state.owners.remove(object_id);
        state.declared.remove(object_id);
        Ok(())
    }

    async fn delete_service_principal(&self, object_id: &str) -> DirectoryResult<()> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::DeleteServicePrincipal {
                object_id: object_id.to_string(),
            },
        )?;
        state
            .service_principals
            .remove(object_id)
            .ok_or_else(|| not_found("servicePrincipal", object_id))?;
        state
            .app_role_assignments
            .retain(|assignment| assignment.principal_id != object_id);
        Ok(())
    }

    async fn delete_user(&self, object_id: &str) -> DirectoryResult<()> {
        let mut state = self.lock();
        self.begin(
            &mut state,
            DirectoryCall::DeleteUser {
                object_id: object_id.to_string(),
            },
        )?;
        state
            .users
            .remove(object_id)
            .ok_or_else(|| not_found("user", object_id))?;
        state
            .role_assignments
            .retain(|assignment| assignment.principal_id != object_id);
        for owners in state.owners.values_mut() {
            owners.remove(object_id);
        }
        Ok(())
    }
}
