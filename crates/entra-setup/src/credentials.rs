use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{AzureCredentials, Settings},
    error::{ProvisionError, Step},
    graph::{Application, DirectoryClient, DirectoryError, PasswordCredentialRequest},
};

/// Client credentials for a provisioned application. The secret only ever exists
/// in the add-password response and in this bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

impl CredentialBundle {
    /// Renders the bundle as a settings file with a single `[azure]` section.
    pub fn to_toml(&self) -> Result<String, BundleError> {
        #[derive(Serialize)]
        struct BundleFile<'a> {
            azure: &'a CredentialBundle,
        }
        Ok(toml::to_string(&BundleFile { azure: self })?)
    }

    pub fn into_credentials(self) -> AzureCredentials {
        AzureCredentials {
            client_id: self.client_id,
            client_secret: self.client_secret,
            tenant_id: self.tenant_id,
        }
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
    #[error("bundle already persisted to {0}")]
    AlreadyPersisted(String),
}

/// Durable home for the session's credential bundle.
pub trait BundleStore: Send + Sync {
    /// Writes the bundle; must not return before the data is durable.
    fn persist(&self, bundle: &CredentialBundle) -> Result<(), BundleError>;

    /// Human-readable location, for the session report.
    fn location(&self) -> String;
}

impl<T: BundleStore + ?Sized> BundleStore for Arc<T> {
    fn persist(&self, bundle: &CredentialBundle) -> Result<(), BundleError> {
        (**self).persist(bundle)
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Keeps bundles in memory. Dry runs use it so a rehearsal never overwrites a real bundle.
#[derive(Default)]
pub struct MemoryBundleStore {
    bundles: Mutex<Vec<CredentialBundle>>,
}

impl MemoryBundleStore {
    pub fn bundles(&self) -> Vec<CredentialBundle> {
        self.bundles
            .lock()
            .expect("bundle store lock poisoned")
            .clone()
    }
}

impl BundleStore for MemoryBundleStore {
    fn persist(&self, bundle: &CredentialBundle) -> Result<(), BundleError> {
        self.bundles
            .lock()
            .expect("bundle store lock poisoned")
            .push(bundle.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "memory (dry run)".into()
    }
}

/// Writes the bundle as a TOML settings file that [`Settings::load`] reads back.
pub struct FileBundleStore {
    path: PathBuf,
}

impl FileBundleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads a previously written bundle back as settings.
    pub fn load(&self) -> Result<Settings, crate::config::ConfigError> {
        Settings::from_toml_str(&fs::read_to_string(&self.path).map_err(|source| {
            crate::config::ConfigError::Read {
                path: self.path.clone(),
                source,
            }
        })?)
    }

    fn io_error(&self, source: std::io::Error) -> BundleError {
        BundleError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl BundleStore for FileBundleStore {
    fn persist(&self, bundle: &CredentialBundle) -> Result<(), BundleError> {
        let payload = bundle.to_toml()?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(|err| self.io_error(err))?;
        file.write_all(payload.as_bytes())
            .map_err(|err| self.io_error(err))?;
        file.sync_all().map_err(|err| self.io_error(err))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Mints a client secret for an application and persists it with the tenant id.
pub struct CredentialIssuer<'a> {
    directory: &'a dyn DirectoryClient,
    store: &'a dyn BundleStore,
    display_name: String,
}

impl<'a> CredentialIssuer<'a> {
    pub fn new(
        directory: &'a dyn DirectoryClient,
        store: &'a dyn BundleStore,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            store,
            display_name: display_name.into(),
        }
    }

    /// Mints a secret and writes the bundle before returning. The tenant id is
    /// looked up first, so only building the bundle sits between the secret and the store.
    pub async fn issue(&self, app: &Application) -> Result<CredentialBundle, ProvisionError> {
        let tenant_id = self.tenant_id().await?;
        let request = PasswordCredentialRequest {
            display_name: self.display_name.clone(),
        };
        let credential = self
            .directory
            .create_password_credential(&app.object_id, &request)
            .await
            .map_err(|err| ProvisionError::directory(Step::IssueCredential, &app.object_id, err))?;
        let client_secret = credential.secret_text.clone().ok_or_else(|| {
            ProvisionError::directory(
                Step::IssueCredential,
                &app.object_id,
                DirectoryError::InvalidResponse("add-password response missing secretText".into()),
            )
        })?;
        info!(
            target = "provision.credentials",
            event = "secret.create.success",
            application = %app.object_id,
            key_id = credential.key_id.as_deref().unwrap_or_default(),
            "client secret issued"
        );

        let bundle = CredentialBundle {
            client_id: app.app_id.clone(),
            client_secret,
            tenant_id,
        };
        self.store.persist(&bundle)?;
        info!(
            target = "provision.credentials",
            event = "bundle.persist.success",
            location = %self.store.location(),
            "credential bundle written"
        );
        Ok(bundle)
    }

    async fn tenant_id(&self) -> Result<String, ProvisionError> {
        let organizations = self
            .directory
            .get_organization()
            .await
            .map_err(|err| ProvisionError::directory(Step::LookupTenant, "organization", err))?;
        organizations
            .into_iter()
            .next()
            .map(|org| org.id)
            .ok_or_else(|| {
                ProvisionError::directory(
                    Step::LookupTenant,
                    "organization",
                    DirectoryError::InvalidResponse("organization list is empty".into()),
                )
            })
    }
}
