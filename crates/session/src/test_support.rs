//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use sweat24_protocol::{AuthPayload, Id, LoginRequest, Role, User};

use crate::backend::{ApiRequest, AuthBackend};
use crate::error::ApiError;
use crate::token;

pub fn make_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

/// Token for `user` expiring `ttl_secs` from now.
pub fn token_for(user: &User, ttl_secs: i64) -> String {
    let now = token::now_millis() / 1000;
    make_token(json!({
        "sub": user.id.to_string(),
        "email": user.email,
        "role": user.role.as_str(),
        "iat": now,
        "exp": now + ttl_secs,
    }))
}

pub fn admin_user() -> User {
    User {
        id: Id::Number(1),
        name: "Admin".into(),
        email: "admin@sweat24.gr".into(),
        role: Role::Admin,
        avatar: None,
    }
}

pub fn unauthorized() -> ApiError {
    ApiError::Unauthorized {
        message: "Unauthenticated.".into(),
    }
}

/// Scriptable [`AuthBackend`].
///
/// Refresh rotates to a new token with a strictly later `exp` unless
/// `fail_refresh` is set.
pub struct MockBackend {
    pub login_response: Mutex<Result<AuthPayload, ApiError>>,
    pub identity_response: Mutex<Result<User, ApiError>>,
    pub logout_response: Mutex<Result<(), ApiError>>,
    pub unread_response: Mutex<Result<u64, ApiError>>,
    pub fail_refresh: Mutex<Option<ApiError>>,
    pub refresh_delay: Mutex<Option<Duration>>,
    pub login_delay: Mutex<Option<Duration>>,
    pub call_responses: Mutex<VecDeque<Result<Value, ApiError>>>,
    pub call_tokens: Mutex<Vec<String>>,
    pub login_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub identity_calls: AtomicUsize,
    pub unread_calls: AtomicUsize,
    next_exp_offset: AtomicI64,
}

impl Default for MockBackend {
    fn default() -> Self {
        let user = admin_user();
        Self {
            login_response: Mutex::new(Ok(AuthPayload::new("mock-jwt-token", user.clone()))),
            identity_response: Mutex::new(Ok(user)),
            logout_response: Mutex::new(Ok(())),
            unread_response: Mutex::new(Ok(0)),
            fail_refresh: Mutex::new(None),
            refresh_delay: Mutex::new(None),
            login_delay: Mutex::new(None),
            call_responses: Mutex::new(VecDeque::new()),
            call_tokens: Mutex::new(Vec::new()),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            identity_calls: AtomicUsize::new(0),
            unread_calls: AtomicUsize::new(0),
            next_exp_offset: AtomicI64::new(3600),
        }
    }
}

impl MockBackend {
    pub fn set_login(&self, response: Result<AuthPayload, ApiError>) {
        *self.login_response.lock().unwrap() = response;
    }

    pub fn set_identity(&self, response: Result<User, ApiError>) {
        *self.identity_response.lock().unwrap() = response;
    }

    pub fn set_logout(&self, response: Result<(), ApiError>) {
        *self.logout_response.lock().unwrap() = response;
    }

    pub fn set_unread(&self, response: Result<u64, ApiError>) {
        *self.unread_response.lock().unwrap() = response;
    }

    pub fn fail_refresh_with(&self, error: ApiError) {
        *self.fail_refresh.lock().unwrap() = Some(error);
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    pub fn delay_login(&self, delay: Duration) {
        *self.login_delay.lock().unwrap() = Some(delay);
    }

    pub fn push_call(&self, response: Result<Value, ApiError>) {
        self.call_responses.lock().unwrap().push_back(response);
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn login(&self, _credentials: &LoginRequest) -> Result<AuthPayload, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.login_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.login_response.lock().unwrap().clone()
    }

    async fn logout(&self, _token: &str) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.logout_response.lock().unwrap().clone()
    }

    async fn refresh(&self, _token: &str) -> Result<AuthPayload, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_refresh.lock().unwrap().clone() {
            return Err(error);
        }
        let offset = self.next_exp_offset.fetch_add(60, Ordering::SeqCst);
        let user = admin_user();
        Ok(AuthPayload::new(token_for(&user, offset), user))
    }

    async fn identity(&self, _token: &str) -> Result<User, ApiError> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        self.identity_response.lock().unwrap().clone()
    }

    async fn unread_count(&self, _token: &str) -> Result<u64, ApiError> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        self.unread_response.lock().unwrap().clone()
    }

    async fn call(&self, _request: &ApiRequest, token: &str) -> Result<Value, ApiError> {
        self.call_tokens.lock().unwrap().push(token.to_string());
        self.call_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }
}
