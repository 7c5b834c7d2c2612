use std::sync::Arc;

use serde_json::json;
use sweat24_protocol::{LoginRequest, Role};
use sweat24_session::events::event_channel;
use sweat24_session::{
    ApiError, ApiRequest, AuthBackend, AuthStatus, AuthStore, AuthorizedClient, ErrorKind,
    FileStorage, HttpBackend, SessionConfig, SessionStorage,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> SessionConfig {
    SessionConfig {
        api_base_url: format!("{}/api/v1", server.uri()),
        ..SessionConfig::default()
    }
}

fn admin() -> serde_json::Value {
    json!({
        "id": 1,
        "name": "Admin",
        "email": "admin@sweat24.gr",
        "role": "admin"
    })
}

#[tokio::test]
async fn login_accepts_wrapped_and_bare_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .and(body_json(json!({"email": "admin@sweat24.gr", "password": "password"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"token": "mock-jwt-token", "user": admin()}})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "bare-token", "user": admin()})),
        )
        .mount(&server)
        .await;

    let backend = HttpBackend::new(config_for(&server)).unwrap();
    let credentials = LoginRequest {
        email: "admin@sweat24.gr".into(),
        password: "password".into(),
    };

    let (token, user) = backend.login(&credentials).await.unwrap().into_parts().unwrap();
    assert_eq!(token, "mock-jwt-token");
    assert_eq!(user.role, Role::Admin);

    let (token, _) = backend.login(&credentials).await.unwrap().into_parts().unwrap();
    assert_eq!(token, "bare-token");
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/auth/me"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Unauthenticated."})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({
                "message": "The given data was invalid.",
                "errors": {"email": ["These credentials do not match our records."]}
            })),
        )
        .mount(&server)
        .await;

    let backend = HttpBackend::new(config_for(&server)).unwrap();

    let err = backend.identity("stale").await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(err.server_message(), Some("Unauthenticated."));

    let err = backend
        .login(&LoginRequest {
            email: "admin@sweat24.gr".into(),
            password: "nope".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.status(), Some(422));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let config = SessionConfig {
        api_base_url: "http://127.0.0.1:9/api/v1".into(),
        ..SessionConfig::default()
    };
    let backend = HttpBackend::new(config).unwrap();

    let err = backend.unread_count("token").await.unwrap_err();
    assert!(matches!(err, ApiError::Network(_)));
}

#[tokio::test]
async fn bearer_token_and_unread_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chat/unread-count"))
        .and(header("authorization", "Bearer jwt-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"unread_count": 6}})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/logout"))
        .and(header("authorization", "Bearer jwt-123"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(config_for(&server)).unwrap();
    assert_eq!(backend.unread_count("jwt-123").await.unwrap(), 6);
    backend.logout("jwt-123").await.unwrap();

    let value = backend
        .call(&ApiRequest::get("/chat/unread-count"), "jwt-123")
        .await
        .unwrap();
    assert_eq!(value["data"]["unread_count"], 6);
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "first-token", "user": admin()})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/members"))
        .and(header("authorization", "Bearer first-token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Token expired"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/refresh"))
        .and(header("authorization", "Bearer first-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"token": "second-token", "user": admin()}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/members"))
        .and(header("authorization", "Bearer second-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": 3}]})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()));
    let backend = Arc::new(HttpBackend::new(config_for(&server)).unwrap());
    let (tx, _rx) = event_channel();
    let store = AuthStore::new(config_for(&server), backend.clone(), storage.clone(), tx);
    store.login("admin@sweat24.gr", "password").await.unwrap();

    let client = AuthorizedClient::new(store.clone(), backend);
    let members: Vec<serde_json::Value> = client.get_json("/members").await.unwrap();

    assert_eq!(members, vec![json!({"id": 3})]);
    assert_eq!(store.status(), AuthStatus::Authenticated);
    assert_eq!(storage.load().unwrap().unwrap().token, "second-token");
}
