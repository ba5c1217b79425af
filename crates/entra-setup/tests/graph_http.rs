use entra_setup::{
    AzureCredentials, DirectoryClient, DirectoryError, GraphDirectory, SessionOptions,
    graph::{
        ApplicationPatch, NewApplication, NewUser, PasswordCredentialRequest, PasswordProfile,
        RequiredResourceAccess, ResourceAccess,
    },
};
use futures_util::future::FutureExt;
use url::Url;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, body_string_contains, header, method, path},
};

async fn try_start_mock() -> Option<MockServer> {
    let fut = MockServer::start();
    let fut = std::panic::AssertUnwindSafe(fut);
    fut.catch_unwind().await.ok()
}

fn directory(server: &MockServer, max_attempts: u32) -> GraphDirectory {
    let base = Url::parse(&server.uri()).expect("mock uri");
    let options = SessionOptions {
        graph_base_url: base.join("v1.0").expect("graph url"),
        login_base_url: base.join("login").expect("login url"),
        max_attempts,
        ..SessionOptions::default()
    };
    let credentials = AzureCredentials {
        client_id: "operator-client".into(),
        client_secret: "operator-secret".into(),
        tenant_id: "tenant-1".into(),
    };
    GraphDirectory::new(credentials, &options).expect("graph directory")
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/login/tenant-1/oauth2/v2.0/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=operator-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "graph-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn creates_application_with_cached_bearer_token() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping creates_application_with_cached_bearer_token: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/applications"))
        .and(header("authorization", "Bearer graph-token"))
        .and(body_json(serde_json::json!({ "displayName": "Test App abc (tag)" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "app-object",
            "appId": "app-client",
            "displayName": "Test App abc (tag)"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/servicePrincipals"))
        .and(body_json(serde_json::json!({ "appId": "app-client" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "sp-object",
            "appId": "app-client"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let directory = directory(&server, 1);
    let app = directory
        .create_application(&NewApplication {
            display_name: "Test App abc (tag)".into(),
            sign_in_audience: None,
        })
        .await
        .expect("application");
    assert_eq!(app.object_id, "app-object");
    assert_eq!(app.app_id, "app-client");

    let sp = directory
        .create_service_principal(&app.app_id)
        .await
        .expect("service principal");
    assert_eq!(sp.object_id, "sp-object");
}

#[tokio::test]
async fn missing_application_surfaces_graph_error() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping missing_application_surfaces_graph_error: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(
            "/v1.0/applications(appId='11111111-1111-1111-1111-111111111111')",
        ))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": {
                "code": "Request_ResourceNotFound",
                "message": "Resource '11111111-1111-1111-1111-111111111111' does not exist"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = directory(&server, 3)
        .get_application_by_app_id("11111111-1111-1111-1111-111111111111")
        .await
        .expect_err("lookup should fail");
    assert!(err.is_not_found());
    match err {
        DirectoryError::Api { code, message, .. } => {
            assert_eq!(code.as_deref(), Some("Request_ResourceNotFound"));
            assert!(message.contains("does not exist"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn throttled_patch_is_retried() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping throttled_patch_is_retried: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("PATCH"))
        .and(path("/v1.0/applications/app-object"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({
                    "error": { "code": "TooManyRequests", "message": "slow down" }
                })),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v1.0/applications/app-object"))
        .and(body_string_contains("\"type\":\"Role\""))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let patch = ApplicationPatch {
        required_resource_access: vec![RequiredResourceAccess {
            resource_app_id: Uuid::parse_str("00000003-0000-0000-c000-000000000000").unwrap(),
            resource_access: vec![ResourceAccess::role(
                Uuid::parse_str("9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8").unwrap(),
            )],
        }],
    };
    directory(&server, 2)
        .patch_application("app-object", &patch)
        .await
        .expect("patch after retry");
}

#[tokio::test]
async fn exhausted_retries_return_last_error() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping exhausted_retries_return_last_error: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/v1.0/servicePrincipals/sp-object"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(2)
        .mount(&server)
        .await;

    let err = directory(&server, 2)
        .delete_service_principal("sp-object")
        .await
        .expect_err("throttled delete");
    assert_eq!(err.status(), Some(429));
}

#[tokio::test]
async fn add_password_is_sent_once_and_returns_secret() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping add_password_is_sent_once_and_returns_secret: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/applications/app-object/addPassword"))
        .and(body_json(serde_json::json!({
            "passwordCredential": { "displayName": "(tag)" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "keyId": "key-1",
            "displayName": "(tag)",
            "secretText": "fresh-secret",
            "endDateTime": "2027-10-19T00:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let credential = directory(&server, 5)
        .create_password_credential(
            "app-object",
            &PasswordCredentialRequest {
                display_name: "(tag)".into(),
            },
        )
        .await
        .expect("password credential");
    assert_eq!(credential.secret_text.as_deref(), Some("fresh-secret"));
    assert!(credential.end_date_time.is_some());
}

#[tokio::test]
async fn rejected_token_request_is_an_auth_error() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping rejected_token_request_is_an_auth_error: mock server unavailable");
            return;
        }
    };
    Mock::given(method("POST"))
        .and(path("/login/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "invalid_client",
            "error_description": "AADSTS7000215: Invalid client secret provided."
        })))
        .mount(&server)
        .await;

    let err = directory(&server, 1)
        .get_domains()
        .await
        .expect_err("token failure");
    match err {
        DirectoryError::Auth(message) => assert!(message.contains("AADSTS7000215")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn failed_create_is_not_repeated_on_server_error() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping failed_create_is_not_repeated_on_server_error: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/applications"))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": { "code": "ServiceUnavailable", "message": "try later" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = directory(&server, 3)
        .create_application(&NewApplication {
            display_name: "Test App abc (tag)".into(),
            sign_in_audience: None,
        })
        .await
        .expect_err("server error surfaces");
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn throttled_create_is_retried() {
    let server = match try_start_mock().await {
        Some(srv) => srv,
        None => {
            eprintln!("skipping throttled_create_is_retried: mock server unavailable");
            return;
        }
    };
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/users"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "user-object",
            "userPrincipalName": "robinvale@contoso.test",
            "displayName": "Robin Vale"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let user = directory(&server, 3)
        .create_user(&NewUser {
            account_enabled: true,
            display_name: "Robin Vale".into(),
            mail_nickname: "robinvale".into(),
            user_principal_name: "robinvale@contoso.test".into(),
            password_profile: PasswordProfile {
                force_change_password_next_sign_in: false,
                password: "Secret-123".into(),
            },
        })
        .await
        .expect("user after throttling");
    assert_eq!(user.object_id, "user-object");
}
