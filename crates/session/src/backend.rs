//! Backend client for the endpoint roles the lifecycle depends on.
//!
//! [`AuthBackend`] is the seam the auth store, the realtime manager and the
//! request wrapper talk through; [`HttpBackend`] is the reqwest
//! implementation. Response bodies are normalized through
//! [`Envelope`] here and nowhere else.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sweat24_protocol::{
    AuthPayload, Envelope, ErrorBody, IdentityResponse, LoginRequest, UnreadCount, User,
};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::ApiError;

/// A request against an arbitrary REST path, issued with the caller's bearer token
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// POST credentials → `{token, user}`
    async fn login(&self, credentials: &LoginRequest) -> Result<AuthPayload, ApiError>;

    /// Invalidate `token` server-side
    async fn logout(&self, token: &str) -> Result<(), ApiError>;

    /// Rotate `token` → `{token, user}`
    async fn refresh(&self, token: &str) -> Result<AuthPayload, ApiError>;

    /// Verify `token` and return the current user
    async fn identity(&self, token: &str) -> Result<User, ApiError>;

    /// Authoritative unread-message count
    async fn unread_count(&self, token: &str) -> Result<u64, ApiError>;

    /// Any other REST call. Returns the raw JSON body (`null` when empty).
    async fn call(&self, request: &ApiRequest, token: &str) -> Result<Value, ApiError>;
}

/// reqwest-backed [`AuthBackend`]
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: SessionConfig,
}

impl HttpBackend {
    pub fn new(config: SessionConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.config.url(path))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn authorized(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.request(method, path).bearer_auth(token)
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn login(&self, credentials: &LoginRequest) -> Result<AuthPayload, ApiError> {
        let request = self
            .request(Method::POST, &self.config.endpoints.login)
            .json(credentials);
        let payload: AuthPayload = read_envelope(send(request).await?).await?;
        Ok(payload)
    }

    async fn logout(&self, token: &str) -> Result<(), ApiError> {
        let request = self.authorized(Method::POST, &self.config.endpoints.logout, token);
        read_raw(send(request).await?).await.map(|_| ())
    }

    async fn refresh(&self, token: &str) -> Result<AuthPayload, ApiError> {
        let request = self.authorized(Method::POST, &self.config.endpoints.refresh, token);
        read_envelope(send(request).await?).await
    }

    async fn identity(&self, token: &str) -> Result<User, ApiError> {
        let request = self.authorized(Method::GET, &self.config.endpoints.identity, token);
        let identity: IdentityResponse = read_envelope(send(request).await?).await?;
        Ok(identity.into_user())
    }

    async fn unread_count(&self, token: &str) -> Result<u64, ApiError> {
        let request = self.authorized(Method::GET, &self.config.endpoints.unread_count, token);
        let unread: UnreadCount = read_envelope(send(request).await?).await?;
        Ok(unread.count)
    }

    async fn call(&self, request: &ApiRequest, token: &str) -> Result<Value, ApiError> {
        let mut builder = self.authorized(request.method.clone(), &request.path, token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        read_raw(send(builder).await?).await
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    request
        .send()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))
}

/// Raw body of a 2xx response, or the classified error.
async fn read_raw(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let url = response.url().path().to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;

    debug!(
        component = "backend",
        event = "backend.response",
        path = %url,
        status = status.as_u16(),
        bytes = bytes.len(),
    );

    if !status.is_success() {
        let body = serde_json::from_slice::<ErrorBody>(&bytes).ok();
        return Err(ApiError::from_status(status.as_u16(), body));
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    normalize(read_raw(response).await?)
}

/// Single normalization step from a raw body to `T`.
pub fn normalize<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value::<Envelope<T>>(body)
        .map(Envelope::into_inner)
        .map_err(|e| ApiError::Decode(e.to_string()))
}
