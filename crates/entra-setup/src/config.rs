use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_SETTINGS_PATH: &str = "setup.toml";
pub const DEFAULT_BUNDLE_PATH: &str = "exploit.toml";
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_DISPLAY_NAME_TAG: &str = "(created by entra-setup)";

const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{ENV_CLIENT_ID}, {ENV_CLIENT_SECRET} and {ENV_TENANT_ID} must all be set together")]
    PartialEnvironment,
    #[error("no [azure] credentials configured; set them in the settings file or via {ENV_CLIENT_ID}/{ENV_CLIENT_SECRET}/{ENV_TENANT_ID}")]
    MissingCredentials,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client-credential triple for an application in a tenant. The same shape is
/// used for the operator's own credentials and for the bundle a session writes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

impl AzureCredentials {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("clientId", &self.client_id),
            ("clientSecret", &self.client_secret),
            ("tenantId", &self.tenant_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("azure.{field} must not be empty")));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Tunables for a provisioning session (`[session]` section).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub graph_base_url: Url,
    pub login_base_url: Url,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub user_propagation_delay_secs: u64,
    pub display_name_tag: String,
    pub bundle_path: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            graph_base_url: Url::parse(DEFAULT_GRAPH_BASE_URL).expect("default graph url"),
            login_base_url: Url::parse(DEFAULT_LOGIN_BASE_URL).expect("default login url"),
            request_timeout_secs: 20,
            max_attempts: 5,
            user_propagation_delay_secs: 3,
            display_name_tag: DEFAULT_DISPLAY_NAME_TAG.to_string(),
            bundle_path: PathBuf::from(DEFAULT_BUNDLE_PATH),
        }
    }
}

impl SessionOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.requestTimeoutSecs must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "session.maxAttempts must be at least 1".into(),
            ));
        }
        for (field, url) in [
            ("graphBaseUrl", &self.graph_base_url),
            ("loginBaseUrl", &self.login_base_url),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "session.{field} must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    azure: Option<AzureCredentials>,
    #[serde(default)]
    session: SessionOptions,
}

#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub credentials: Option<AzureCredentials>,
    pub options: SessionOptions,
}

impl Settings {
    /// Loads the settings file and applies `AZURE_*` environment overrides. A
    /// missing file is only an error when the path was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_SETTINGS_PATH), false),
        };
        let mut settings = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents).map_err(|err| match err {
                ConfigError::Parse { source, .. } => ConfigError::Parse {
                    path: path.clone(),
                    source,
                },
                other => other,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        if let Some(credentials) = &file.azure {
            credentials.validate()?;
        }
        file.session.validate()?;
        Ok(Self {
            credentials: file.azure,
            options: file.session,
        })
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        match (
            non_empty(ENV_CLIENT_ID),
            non_empty(ENV_CLIENT_SECRET),
            non_empty(ENV_TENANT_ID),
        ) {
            (Some(client_id), Some(client_secret), Some(tenant_id)) => {
                self.credentials = Some(AzureCredentials {
                    client_id,
                    client_secret,
                    tenant_id,
                });
                Ok(())
            }
            (None, None, None) => Ok(()),
            _ => Err(ConfigError::PartialEnvironment),
        }
    }

    pub fn require_credentials(&self) -> Result<AzureCredentials, ConfigError> {
        self.credentials
            .clone()
            .ok_or(ConfigError::MissingCredentials)
    }
}
