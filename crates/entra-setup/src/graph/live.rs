use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use super::{
    DirectoryClient, DirectoryError, DirectoryResult,
    models::{
        AppRoleAssignment, Application, ApplicationPatch, Domain, NewApplication, NewUser,
        Organization, PasswordCredential, PasswordCredentialRequest, ServicePrincipal,
        UnifiedRoleAssignment, User,
    },
};
use crate::config::{AzureCredentials, SessionOptions};

const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
const MAX_BACKOFF_EXPONENT: u32 = 5;
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Directory client backed by the Microsoft Graph REST API, authenticated with
/// the client-credentials grant.
pub struct GraphDirectory {
    http: HttpClient,
    graph_base: Url,
    login_base: Url,
    credentials: AzureCredentials,
    max_attempts: u32,
    token: Mutex<Option<AccessToken>>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct GraphListResponse<T> {
    value: Vec<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewServicePrincipal<'a> {
    app_id: &'a str,
}

/// Which failures a call may be repeated after.
#[derive(Clone, Copy, Debug)]
enum Retry {
    /// Reads, patches and deletes.
    Transient,
    /// Creates. Only a 429 is known to have left nothing behind.
    Throttled,
}

impl Retry {
    fn allows(self, err: &DirectoryError) -> bool {
        match self {
            Retry::Transient => err.is_transient(),
            Retry::Throttled => err.is_throttled(),
        }
    }
}

impl GraphDirectory {
    pub fn new(credentials: AzureCredentials, options: &SessionOptions) -> DirectoryResult<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            graph_base: with_trailing_slash(options.graph_base_url.clone()),
            login_base: with_trailing_slash(options.login_base_url.clone()),
            credentials,
            max_attempts: options.max_attempts.max(1),
            token: Mutex::new(None),
        })
    }

    /// Absolute URL of a directory object, as used by `@odata.id` references.
    pub fn directory_object_url(&self, object_id: &str) -> String {
        format!("{}directoryObjects/{object_id}", self.graph_base)
    }

    fn url(&self, path: &str) -> DirectoryResult<Url> {
        self.graph_base
            .join(path)
            .map_err(|err| DirectoryError::InvalidResponse(format!("bad request path {path}: {err}")))
    }

    async fn access_token(&self) -> DirectoryResult<String> {
        {
            let guard = self.token.lock().expect("graph token lock poisoned");
            if let Some(token) = guard.as_ref()
                && token.expires_at > Instant::now() + TOKEN_EXPIRY_SKEW
            {
                return Ok(token.value.clone());
            }
        }

        let token_url = self
            .login_base
            .join(&format!("{}/oauth2/v2.0/token", self.credentials.tenant_id))
            .map_err(|err| DirectoryError::Auth(format!("invalid token endpoint: {err}")))?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", GRAPH_DEFAULT_SCOPE),
        ];
        let response = self.http.post(token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Auth(format!(
                "token request failed {status}: {}",
                extract_error(&body).1
            )));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| DirectoryError::Auth(format!("invalid token response: {err}")))?;
        if payload.access_token.is_empty() {
            return Err(DirectoryError::Auth(
                "token response missing access_token".into(),
            ));
        }
        let lifetime = payload.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        *self.token.lock().expect("graph token lock poisoned") = Some(AccessToken {
            value: payload.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(payload.access_token)
    }

    async fn send(&self, builder: RequestBuilder) -> DirectoryResult<Response> {
        let response = builder
            .bearer_auth(self.access_token().await?)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let (code, message) = extract_error(&body);
        Err(DirectoryError::Api {
            status,
            code,
            message,
            retry_after,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> DirectoryResult<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| DirectoryError::InvalidResponse(err.to_string()))
    }

    async fn send_no_content(&self, builder: RequestBuilder) -> DirectoryResult<()> {
        self.send(builder).await.map(|_| ())
    }

    /// Runs `call` until it succeeds, fails permanently, or the attempt budget is spent.
    async fn retry_with_backoff<T, F, Fut>(
        &self,
        operation: &str,
        retry: Retry,
        mut call: F,
    ) -> DirectoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = DirectoryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if retry.allows(&err) && attempt < self.max_attempts => {
                    let delay = retry_delay(&err, attempt);
                    warn!(
                        target = "provision.graph",
                        operation,
                        attempt,
                        error = %err,
                        "directory call failed; retrying after {delay}s"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, path: &str) -> DirectoryResult<T> {
        let url = self.url(path)?;
        self.retry_with_backoff(operation, Retry::Transient, || {
            self.send_json(self.http.get(url.clone()))
        })
        .await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> DirectoryResult<T> {
        let url = self.url(path)?;
        self.retry_with_backoff(operation, Retry::Throttled, || {
            self.send_json(self.http.post(url.clone()).json(body))
        })
        .await
    }

    async fn delete(&self, operation: &str, path: &str) -> DirectoryResult<()> {
        let url = self.url(path)?;
        self.retry_with_backoff(operation, Retry::Transient, || {
            self.send_no_content(self.http.delete(url.clone()))
        })
        .await
    }
}

#[async_trait]
impl DirectoryClient for GraphDirectory {
    async fn create_user(&self, user: &NewUser) -> DirectoryResult<User> {
        self.post_json("users.create", "users", user).await
    }

    async fn create_application(&self, app: &NewApplication) -> DirectoryResult<Application> {
        self.post_json("applications.create", "applications", app)
            .await
    }

    async fn create_service_principal(&self, app_id: &str) -> DirectoryResult<ServicePrincipal> {
        self.post_json(
            "service_principals.create",
            "servicePrincipals",
            &NewServicePrincipal { app_id },
        )
        .await
    }

    async fn get_application_by_app_id(&self, app_id: &str) -> DirectoryResult<Application> {
        self.get_json(
            "applications.get",
            &format!("applications(appId='{}')", escape_key(app_id)),
        )
        .await
    }

    async fn get_service_principal_by_app_id(
        &self,
        app_id: &str,
    ) -> DirectoryResult<ServicePrincipal> {
        self.get_json(
            "service_principals.get",
            &format!("servicePrincipals(appId='{}')", escape_key(app_id)),
        )
        .await
    }

    async fn patch_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> DirectoryResult<()> {
        let url = self.url(&format!("applications/{object_id}"))?;
        self.retry_with_backoff("applications.patch", Retry::Transient, || {
            self.send_no_content(self.http.patch(url.clone()).json(patch))
        })
        .await
    }

    async fn create_app_role_assignment(
        &self,
        principal_id: &str,
        assignment: &AppRoleAssignment,
    ) -> DirectoryResult<AppRoleAssignment> {
        self.post_json(
            "app_role_assignments.create",
            &format!("servicePrincipals/{principal_id}/appRoleAssignments"),
            assignment,
        )
        .await
    }

    async fn create_password_credential(
        &self,
        object_id: &str,
        request: &PasswordCredentialRequest,
    ) -> DirectoryResult<PasswordCredential> {
        // Not retried: a lost response would leave an orphaned secret behind.
        let url = self.url(&format!("applications/{object_id}/addPassword"))?;
        let body = json!({ "passwordCredential": request });
        self.send_json(self.http.post(url).json(&body)).await
    }

    async fn get_organization(&self) -> DirectoryResult<Vec<Organization>> {
        let list: GraphListResponse<Organization> =
            self.get_json("organization.get", "organization").await?;
        Ok(list.value)
    }

    async fn get_domains(&self) -> DirectoryResult<Vec<Domain>> {
        let list: GraphListResponse<Domain> = self.get_json("domains.get", "domains").await?;
        Ok(list.value)
    }

    async fn create_owner_reference(
        &self,
        application_object_id: &str,
        directory_object_id: &str,
    ) -> DirectoryResult<()> {
        let url = self.url(&format!("applications/{application_object_id}/owners/$ref"))?;
        let body = json!({ "@odata.id": self.directory_object_url(directory_object_id) });
        self.retry_with_backoff("owners.create", Retry::Throttled, || {
            self.send_no_content(self.http.post(url.clone()).json(&body))
        })
        .await
    }

    async fn create_unified_role_assignment(
        &self,
        assignment: &UnifiedRoleAssignment,
    ) -> DirectoryResult<UnifiedRoleAssignment> {
        self.post_json(
            "role_assignments.create",
            "roleManagement/directory/roleAssignments",
            assignment,
        )
        .await
    }

    async fn delete_application(&self, object_id: &str) -> DirectoryResult<()> {
        self.delete("applications.delete", &format!("applications/{object_id}"))
            .await
    }

    async fn delete_service_principal(&self, object_id: &str) -> DirectoryResult<()> {
        self.delete(
            "service_principals.delete",
            &format!("servicePrincipals/{object_id}"),
        )
        .await
    }

    async fn delete_user(&self, object_id: &str) -> DirectoryResult<()> {
        self.delete("users.delete", &format!("users/{object_id}"))
            .await
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn escape_key(value: &str) -> String {
    value.replace('\'', "''")
}

fn retry_delay(err: &DirectoryError, attempt: u32) -> u64 {
    if let DirectoryError::Api {
        retry_after: Some(seconds),
        ..
    } = err
    {
        return (*seconds).min(MAX_RETRY_AFTER_SECS);
    }
    2_u64.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT))
}

/// Pulls `(code, message)` out of a Graph error body, falling back to the raw text.
fn extract_error(body: &str) -> (Option<String>, String) {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    let code = error
        .and_then(|err| err.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = error
        .and_then(|err| err.get("message"))
        .or_else(|| parsed.as_ref().and_then(|value| value.get("error_description")))
        .or(error)
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
        .map_or_else(|| body.to_string(), str::to_string);
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_graph_error_code_and_message() {
        let (code, message) = extract_error(
            r#"{"error":{"code":"Authorization_RequestDenied","message":"Insufficient privileges"}}"#,
        );
        assert_eq!(code.as_deref(), Some("Authorization_RequestDenied"));
        assert_eq!(message, "Insufficient privileges");
    }

    #[test]
    fn token_errors_prefer_the_description() {
        let (code, message) = extract_error(
            r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret provided."}"#,
        );
        assert!(code.is_none());
        assert!(message.starts_with("AADSTS7000215"));
    }

    #[test]
    fn falls_back_to_raw_body() {
        let (code, message) = extract_error("upstream exploded");
        assert!(code.is_none());
        assert_eq!(message, "upstream exploded");
    }

    #[test]
    fn retry_after_wins_over_backoff() {
        let throttled = DirectoryError::Api {
            status: 429,
            code: None,
            message: "throttled".into(),
            retry_after: Some(7),
        };
        assert_eq!(retry_delay(&throttled, 1), 7);
        let stalling = DirectoryError::Api {
            status: 429,
            code: None,
            message: "throttled".into(),
            retry_after: Some(86_400),
        };
        assert_eq!(retry_delay(&stalling, 1), MAX_RETRY_AFTER_SECS);
        assert_eq!(retry_delay(&DirectoryError::api(503, "x"), 3), 8);
        assert_eq!(retry_delay(&DirectoryError::api(503, "x"), 12), 32);
    }

    #[test]
    fn base_urls_gain_trailing_slash() {
        let url = with_trailing_slash(Url::parse("https://graph.microsoft.com/v1.0").unwrap());
        assert_eq!(
            url.join("applications").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/applications"
        );
    }

    #[test]
    fn key_lookups_escape_quotes() {
        assert_eq!(escape_key("a'b"), "a''b");
    }
}
