//! Auth-aware request wrapper.
//!
//! Every authenticated REST call goes through [`AuthorizedClient::execute`]:
//! it attaches the current token, and on a 401 rotates the token once and
//! replays the call. Anything else is returned classified, never retried.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth_store::AuthStore;
use crate::backend::{normalize, ApiRequest, AuthBackend};
use crate::error::{ApiError, AuthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

pub struct AuthorizedClient {
    store: Arc<AuthStore>,
    backend: Arc<dyn AuthBackend>,
    connectivity: watch::Sender<Connectivity>,
}

impl AuthorizedClient {
    pub fn new(store: Arc<AuthStore>, backend: Arc<dyn AuthBackend>) -> Self {
        let (connectivity, _) = watch::channel(Connectivity::Online);
        Self {
            store,
            backend,
            connectivity,
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Run `call` with the current token, refreshing and retrying once on 401.
    ///
    /// A failed refresh has already forced the logout; its error is returned.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, AuthError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let Some(token) = self.store.token() else {
            return Err(AuthError::NoSession);
        };

        match self.observe(call(token.clone()).await) {
            Err(e) if e.is_unauthorized() => {
                info!(
                    component = "request",
                    event = "request.unauthorized",
                    "Request rejected with 401, refreshing token"
                );
                self.store.refresh_if_current(&token).await?;
                let Some(token) = self.store.token() else {
                    return Err(AuthError::NoSession);
                };
                self.observe(call(token).await).map_err(AuthError::from)
            }
            other => other.map_err(AuthError::from),
        }
    }

    /// Raw JSON body of `request`.
    pub async fn send(&self, request: ApiRequest) -> Result<Value, AuthError> {
        let backend = &self.backend;
        let request = &request;
        self.execute(|token| async move { backend.call(request, &token).await })
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let body = self.send(ApiRequest::get(path)).await?;
        Ok(normalize(body)?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = self.send(ApiRequest::post(path, to_body(body)?)).await?;
        Ok(normalize(body)?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = self.send(ApiRequest::put(path, to_body(body)?)).await?;
        Ok(normalize(body)?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), AuthError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    /// Track reachability from the outcome of a call.
    fn observe<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        let next = match &result {
            Err(ApiError::Network(_)) => Connectivity::Offline,
            _ => Connectivity::Online,
        };
        let changed = self.connectivity.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
        if changed {
            match next {
                Connectivity::Offline => warn!(
                    component = "request",
                    event = "request.offline",
                    "Backend unreachable"
                ),
                Connectivity::Online => info!(
                    component = "request",
                    event = "request.online",
                    "Backend reachable again"
                ),
            }
        }
        result
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, AuthError> {
    serde_json::to_value(body).map_err(|e| AuthError::Protocol(format!("unserializable body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::ErrorKind;
    use crate::events::event_channel;
    use crate::storage::MemoryStorage;
    use crate::test_support::{unauthorized, MockBackend};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sweat24_protocol::ErrorBody;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Member {
        id: u64,
        name: String,
    }

    async fn client() -> (AuthorizedClient, Arc<AuthStore>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        let (tx, _rx) = event_channel();
        let store = AuthStore::new(
            SessionConfig::default(),
            backend.clone(),
            Arc::new(MemoryStorage::new()),
            tx,
        );
        store.login("admin@sweat24.gr", "password").await.unwrap();
        (
            AuthorizedClient::new(store.clone(), backend.clone()),
            store,
            backend,
        )
    }

    fn tokens(backend: &MockBackend) -> Vec<String> {
        backend.call_tokens.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn retries_once_with_rotated_token_after_401() {
        let (client, store, backend) = client().await;
        backend.push_call(Err(unauthorized()));
        backend.push_call(Ok(json!({"data": {"id": 5, "name": "Eleni"}})));

        let member: Member = client.get_json("/members/5").await.unwrap();

        assert_eq!(
            member,
            Member {
                id: 5,
                name: "Eleni".into()
            }
        );
        assert_eq!(backend.refreshes(), 1);
        let sent = tokens(&backend);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], "mock-jwt-token");
        assert_eq!(Some(sent[1].clone()), store.token());
        assert_ne!(sent[0], sent[1]);
    }

    #[tokio::test]
    async fn reuses_rotation_that_landed_after_the_401() {
        let (client, store, backend) = client().await;
        let calls = AtomicUsize::new(0);

        let sent = client
            .execute(|token| {
                let store = store.clone();
                let calls = &calls;
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Another caller rotates before this one gets to refresh
                        store.refresh().await.unwrap();
                        Err(unauthorized())
                    } else {
                        Ok(token)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(backend.refreshes(), 1);
        assert_eq!(Some(sent.clone()), store.token());
        assert_ne!(sent, "mock-jwt-token");
    }

    #[tokio::test]
    async fn failed_refresh_propagates_and_logs_out() {
        let (client, store, backend) = client().await;
        backend.push_call(Err(unauthorized()));
        backend.fail_refresh_with(unauthorized());

        let err = client.delete("/bookings/9").await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(tokens(&backend).len(), 1);
        assert_eq!(store.token(), None);
    }

    #[tokio::test]
    async fn second_401_is_not_retried_again() {
        let (client, _store, backend) = client().await;
        backend.push_call(Err(unauthorized()));
        backend.push_call(Err(unauthorized()));

        let err = client.send(ApiRequest::get("/reports")).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(tokens(&backend).len(), 2);
        assert_eq!(backend.refreshes(), 1);
    }

    #[tokio::test]
    async fn other_errors_are_classified_not_retried() {
        let (client, _store, backend) = client().await;
        let mut body = ErrorBody::default();
        body.errors
            .insert("capacity".into(), vec!["Capacity must be positive.".into()]);
        backend.push_call(Err(ApiError::from_status(422, Some(body))));

        let err = client
            .post_json::<_, Value>("/classes", &json!({"capacity": 0}))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.user_message(), "Capacity must be positive.");
        assert_eq!(tokens(&backend).len(), 1);
        assert_eq!(backend.refreshes(), 0);
    }

    #[tokio::test]
    async fn without_session_nothing_is_sent() {
        let (client, store, backend) = client().await;
        store.logout().await;

        let err = client.get_json::<Value>("/members").await.unwrap_err();

        assert!(matches!(err, AuthError::NoSession));
        assert!(tokens(&backend).is_empty());
    }

    #[tokio::test]
    async fn connectivity_follows_transport_failures() {
        let (client, _store, backend) = client().await;
        let mut rx = client.subscribe_connectivity();
        backend.push_call(Err(ApiError::Network("connection refused".into())));

        let err = client.get_json::<Value>("/members").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(client.connectivity(), Connectivity::Offline);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        backend.push_call(Err(ApiError::from_status(404, None)));
        let _ = client.get_json::<Value>("/members/404").await;
        assert_eq!(client.connectivity(), Connectivity::Online);
        assert!(rx.has_changed().unwrap());
    }
}
