//! Session workflow: acquire an application, issue its credentials, grant
//! permissions, stage a user with a role, and optionally remove everything the
//! session created.

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::{
    config::SessionOptions,
    credentials::{BundleError, BundleStore, CredentialIssuer},
    error::{ProvisionError, Step},
    grants::{GrantReport, PermissionGrant, PermissionGrantEngine},
    graph::{Application, DirectoryClient, DirectoryError, ServicePrincipal},
    identity::{IdentityFactory, pick_domain},
    ledger::{DirectoryObjectRef, ResourceKind, ResourceLedger},
    roles::{RoleBinder, RoleBinding, RoleSelection},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplicationSource {
    Create,
    /// Client id (`appId`) of an application that already exists in the tenant.
    Existing(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserSource {
    Skip,
    Create,
    /// Object id of an existing user, used as given.
    Existing(String),
}

/// Every decision a session needs, collected before any directory call is made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub application: ApplicationSource,
    pub grants: Vec<PermissionGrant>,
    pub user: UserSource,
    pub role: Option<RoleSelection>,
    pub teardown: bool,
}

impl Default for SessionRequest {
    fn default() -> Self {
        Self {
            application: ApplicationSource::Create,
            grants: Vec::new(),
            user: UserSource::Skip,
            role: None,
            teardown: false,
        }
    }
}

impl SessionRequest {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if let ApplicationSource::Existing(app_id) = &self.application
            && app_id.trim().is_empty()
        {
            return Err(ProvisionError::InvalidRequest(
                "existing application id must not be empty".into(),
            ));
        }
        if let UserSource::Existing(user_id) = &self.user
            && user_id.trim().is_empty()
        {
            return Err(ProvisionError::InvalidRequest(
                "existing user id must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub object: DirectoryObjectRef,
    pub error: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.object, self.error)
    }
}

/// Result of one teardown pass. Failed objects stay in the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub deleted: Vec<DirectoryObjectRef>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<Self, ProvisionError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ProvisionError::PartialTeardownFailure {
                succeeded: self.deleted.len(),
                failures: self.failures,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub object_id: String,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub service_principal_id: String,
    pub created: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_password: Option<String>,
    pub created: bool,
}

impl fmt::Debug for UserSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSummary")
            .field("object_id", &self.object_id)
            .field("user_principal_name", &self.user_principal_name)
            .field(
                "initial_password",
                &self.initial_password.as_ref().map(|_| "<redacted>"),
            )
            .field("created", &self.created)
            .finish()
    }
}

/// What a session did, for the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub application: ApplicationSummary,
    pub tenant_id: String,
    pub bundle_location: String,
    pub admin_consent_url: String,
    pub grants: GrantReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownReport>,
    /// Objects created by the session that still exist.
    pub remaining: Vec<DirectoryObjectRef>,
}

impl SessionReport {
    /// Surfaces the first partial failure recorded in the report, grants before teardown.
    pub fn check(&self) -> Result<(), ProvisionError> {
        self.grants.clone().into_result()?;
        if let Some(teardown) = &self.teardown {
            teardown.clone().into_result()?;
        }
        Ok(())
    }
}

/// Owns the session context: the directory handle, the bundle store and the ledger
/// of created objects.
pub struct ResourceOrchestrator {
    directory: Arc<dyn DirectoryClient>,
    store: Box<dyn BundleStore>,
    identities: IdentityFactory,
    options: SessionOptions,
    ledger: ResourceLedger,
    bundle_persisted: bool,
}

impl ResourceOrchestrator {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        store: Box<dyn BundleStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            directory,
            store,
            identities: IdentityFactory::new(options.display_name_tag.clone()),
            options,
            ledger: ResourceLedger::new(),
            bundle_persisted: false,
        }
    }

    pub fn with_identity_factory(mut self, identities: IdentityFactory) -> Self {
        self.identities = identities;
        self
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Runs the workflow. A fatal error returns early and leaves the ledger as it
    /// stands so [`Self::teardown`] can still remove what was created.
    pub async fn run(&mut self, request: &SessionRequest) -> Result<SessionReport, ProvisionError> {
        request.validate()?;
        let session_id = Ulid::new().to_string();
        let started_at = OffsetDateTime::now_utc();
        info!(
            target = "provision.session",
            event = "session.start",
            session = %session_id,
            grants = request.grants.len(),
            teardown = request.teardown,
            "provisioning session started"
        );

        if self.bundle_persisted {
            return Err(BundleError::AlreadyPersisted(self.store.location()).into());
        }

        let (app, sp, created) = self.acquire_application(&request.application).await?;

        let bundle = CredentialIssuer::new(
            self.directory.as_ref(),
            self.store.as_ref(),
            self.identities.tag(),
        )
        .issue(&app)
        .await?;
        self.bundle_persisted = true;

        let grants = PermissionGrantEngine::new(self.directory.as_ref())
            .grant(&app.object_id, &sp.object_id, &request.grants)
            .await?;

        let user = self.acquire_user(&request.user).await?;

        let role = match (request.role, &user) {
            (Some(role), Some(user)) => {
                if user.created && self.options.user_propagation_delay_secs > 0 {
                    tokio::time::sleep(Duration::from_secs(
                        self.options.user_propagation_delay_secs,
                    ))
                    .await;
                }
                Some(
                    RoleBinder::new(self.directory.as_ref())
                        .bind(&user.object_id, Some(&app), role)
                        .await?,
                )
            }
            (Some(role), None) => {
                warn!(
                    target = "provision.roles",
                    event = "role.bind.skipped",
                    role = %role,
                    "no user in this session; role selection ignored"
                );
                None
            }
            (None, _) => None,
        };

        let teardown = if request.teardown {
            Some(self.teardown().await)
        } else {
            None
        };

        let report = SessionReport {
            session_id,
            started_at,
            admin_consent_url: admin_consent_url(&self.options, &app.app_id),
            application: ApplicationSummary {
                object_id: app.object_id,
                app_id: app.app_id,
                display_name: app.display_name,
                service_principal_id: sp.object_id,
                created,
            },
            tenant_id: bundle.tenant_id,
            bundle_location: self.store.location(),
            grants,
            user,
            role,
            teardown,
            remaining: self.ledger.entries().to_vec(),
        };
        info!(
            target = "provision.session",
            event = "session.complete",
            session = %report.session_id,
            remaining = report.remaining.len(),
            "provisioning session finished"
        );
        Ok(report)
    }

    async fn acquire_application(
        &mut self,
        source: &ApplicationSource,
    ) -> Result<(Application, ServicePrincipal, bool), ProvisionError> {
        match source {
            ApplicationSource::Existing(app_id) => {
                let unknown = |source: DirectoryError| ProvisionError::UnknownApplication {
                    app_id: app_id.clone(),
                    source,
                };
                let app = self
                    .directory
                    .get_application_by_app_id(app_id)
                    .await
                    .map_err(unknown)?;
                let sp = self
                    .directory
                    .get_service_principal_by_app_id(app_id)
                    .await
                    .map_err(unknown)?;
                info!(
                    target = "provision.session",
                    event = "app.resolve.success",
                    app_id = %app.app_id,
                    object_id = %app.object_id,
                    service_principal = %sp.object_id,
                    "existing application resolved"
                );
                Ok((app, sp, false))
            }
            ApplicationSource::Create => {
                let payload = self.identities.new_application();
                payload.validate().map_err(ProvisionError::InvalidRequest)?;
                let app = self
                    .directory
                    .create_application(&payload)
                    .await
                    .map_err(|err| {
                        ProvisionError::directory(
                            Step::CreateApplication,
                            &payload.display_name,
                            err,
                        )
                    })?;
                self.ledger
                    .record(ResourceKind::Application, app.object_id.clone());
                info!(
                    target = "provision.session",
                    event = "app.create.success",
                    app_id = %app.app_id,
                    object_id = %app.object_id,
                    "application created"
                );

                let sp = self
                    .directory
                    .create_service_principal(&app.app_id)
                    .await
                    .map_err(|err| {
                        ProvisionError::directory(Step::CreateServicePrincipal, &app.app_id, err)
                    })?;
                self.ledger
                    .record(ResourceKind::ServicePrincipal, sp.object_id.clone());
                info!(
                    target = "provision.session",
                    event = "sp.create.success",
                    app_id = %app.app_id,
                    service_principal = %sp.object_id,
                    "service principal created"
                );
                Ok((app, sp, true))
            }
        }
    }

    async fn acquire_user(
        &mut self,
        source: &UserSource,
    ) -> Result<Option<UserSummary>, ProvisionError> {
        match source {
            UserSource::Skip => Ok(None),
            UserSource::Existing(user_id) => Ok(Some(UserSummary {
                object_id: user_id.trim().to_string(),
                user_principal_name: None,
                initial_password: None,
                created: false,
            })),
            UserSource::Create => {
                let domains = self
                    .directory
                    .get_domains()
                    .await
                    .map_err(|err| ProvisionError::directory(Step::LookupDomain, "domains", err))?;
                let domain = pick_domain(&domains).ok_or_else(|| {
                    ProvisionError::directory(
                        Step::LookupDomain,
                        "domains",
                        DirectoryError::InvalidResponse("tenant lists no domains".into()),
                    )
                })?;
                let blueprint = self.identities.new_user(domain);
                blueprint
                    .user
                    .validate()
                    .map_err(ProvisionError::InvalidRequest)?;
                let user = self
                    .directory
                    .create_user(&blueprint.user)
                    .await
                    .map_err(|err| {
                        ProvisionError::directory(
                            Step::CreateUser,
                            &blueprint.user.user_principal_name,
                            err,
                        )
                    })?;
                self.ledger
                    .record(ResourceKind::User, user.object_id.clone());
                info!(
                    target = "provision.session",
                    event = "user.create.success",
                    user = %user.object_id,
                    upn = %blueprint.user.user_principal_name,
                    "user created"
                );
                Ok(Some(UserSummary {
                    object_id: user.object_id,
                    user_principal_name: user
                        .user_principal_name
                        .or(Some(blueprint.user.user_principal_name)),
                    initial_password: Some(blueprint.initial_password),
                    created: true,
                }))
            }
        }
    }

    /// Deletes every ledger entry, service principals first, then applications, then
    /// users. Each deletion is attempted regardless of earlier failures; deleted
    /// entries leave the ledger so a repeated call only retries what failed.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for entry in self.ledger.teardown_order() {
            let result = match entry.kind {
                ResourceKind::ServicePrincipal => {
                    self.directory.delete_service_principal(&entry.object_id).await
                }
                ResourceKind::Application => self.directory.delete_application(&entry.object_id).await,
                ResourceKind::User => self.directory.delete_user(&entry.object_id).await,
            };
            match result {
                Ok(()) => {
                    info!(
                        target = "provision.teardown",
                        event = "teardown.delete.success",
                        kind = %entry.kind,
                        object_id = %entry.object_id,
                        "object deleted"
                    );
                }
                Err(err) if err.is_not_found() => {
                    warn!(
                        target = "provision.teardown",
                        event = "teardown.delete.absent",
                        kind = %entry.kind,
                        object_id = %entry.object_id,
                        "object already gone"
                    );
                }
                Err(err) => {
                    error!(
                        target = "provision.teardown",
                        event = "teardown.delete.error",
                        kind = %entry.kind,
                        object_id = %entry.object_id,
                        error = %err,
                        "deletion failed; object kept in ledger"
                    );
                    report.failures.push(TeardownFailure {
                        object: entry,
                        error: err.to_string(),
                    });
                    continue;
                }
            }
            self.ledger.remove(&entry);
            report.deleted.push(entry);
        }
        report
    }
}

/// Link a tenant administrator follows to consent to the application's permissions.
pub fn admin_consent_url(options: &SessionOptions, app_id: &str) -> String {
    format!(
        "{}/common/adminconsent?client_id={app_id}",
        options.login_base_url.as_str().trim_end_matches('/')
    )
}
