use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gateway_stress_tester::auth::{AuthError, GatewayAuthClient, DEFAULT_TOKEN_LIFETIME};
use gateway_stress_tester::types::AuthSettings;

fn settings(server: &MockServer) -> AuthSettings {
    AuthSettings {
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
        audience: "https://example.auth0.com/api/v2/".to_string(),
        scope: "read:users".to_string(),
        token_url: format!("{}/token/client-credentials", server.uri()),
        provider_token_url: format!("{}/oauth/token", server.uri()),
    }
}

fn auth_client(server: &MockServer) -> GatewayAuthClient {
    GatewayAuthClient::new(reqwest::Client::new(), settings(server))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
async fn concurrent_acquires_coalesce_onto_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "accesToken": "tok-1",
                    "expiresAt": now_ms() + 3_600_000,
                }))
                .set_delay(Duration::from_millis(250)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(auth_client(&server));
    let acquires = (0..8).map(|_| {
        let client = Arc::clone(&client);
        async move { client.acquire().await }
    });
    let results = join_all(acquires).await;

    for result in results {
        assert_eq!(result.unwrap().token, "tok-1");
    }
}

#[tokio::test]
async fn fresh_credential_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accesToken": "tok-cached",
            "expiresAt": now_ms() + 3_600_000,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = auth_client(&server);
    let first = client.acquire().await.unwrap();
    let second = client.acquire().await.unwrap();
    assert_eq!(first.token, second.token);
}

#[tokio::test]
async fn credential_inside_safety_margin_triggers_refresh() {
    let server = MockServer::start().await;
    // expires in 10s, inside the 30s safety margin: each acquire refreshes
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accesToken": "tok-short",
            "expiresAt": now_ms() + 10_000,
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = auth_client(&server);
    client.acquire().await.unwrap();
    client.acquire().await.unwrap();
}

#[tokio::test]
async fn missing_expiry_defaults_to_an_hour() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "accesToken": "tok-default" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = auth_client(&server);
    let credential = client.acquire().await.unwrap();
    let lifetime_ms = credential.expires_at_ms - credential.issued_at_ms;
    assert_eq!(lifetime_ms, DEFAULT_TOKEN_LIFETIME.as_millis() as u64);

    // well outside the safety margin, so the next acquire is a cache hit
    client.acquire().await.unwrap();
}

#[tokio::test]
async fn rejected_status_is_an_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = auth_client(&server);
    match client.acquire().await {
        Err(AuthError::Rejected { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected Rejected, got {:?}", other.map(|c| c.token)),
    }
}

#[tokio::test]
async fn missing_token_field_is_an_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
        .mount(&server)
        .await;

    let client = auth_client(&server);
    assert!(matches!(
        client.acquire().await,
        Err(AuthError::MissingToken)
    ));
}

#[tokio::test]
async fn non_json_body_is_an_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/client-credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = auth_client(&server);
    assert!(matches!(
        client.acquire().await,
        Err(AuthError::MalformedBody(_))
    ));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_failure() {
    let server = MockServer::start().await;
    let mut settings = settings(&server);
    settings.token_url = "http://127.0.0.1:1/token/client-credentials".to_string();
    let client = GatewayAuthClient::new(reqwest::Client::new(), settings);
    assert!(matches!(
        client.acquire().await,
        Err(AuthError::Transport(_))
    ));
}

#[tokio::test]
async fn provider_flow_is_never_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "provider-tok",
            "expires_in": 600,
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = auth_client(&server);
    let first = client.acquire_from_provider().await.unwrap();
    let second = client.acquire_from_provider().await.unwrap();
    assert_eq!(first.token, "provider-tok");
    assert_eq!(second.token, "provider-tok");
}
