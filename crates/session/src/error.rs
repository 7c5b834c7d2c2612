//! Error taxonomy for the session lifecycle

use sweat24_protocol::ErrorBody;
use thiserror::Error;

pub use crate::token::MalformedTokenError;

/// Coarse classification used for user-facing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Server,
    Network,
    Other,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            400 | 409 | 422 => ErrorKind::Validation,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Other,
        }
    }

    /// Generic text shown when the server did not send a usable message.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "Your session has expired. Please sign in again.",
            ErrorKind::Forbidden => "You do not have permission to perform this action.",
            ErrorKind::NotFound => "The requested resource was not found.",
            ErrorKind::Validation => "Please check the submitted data and try again.",
            ErrorKind::Server => "The server encountered an error. Please try again later.",
            ErrorKind::Network => "Unable to reach the server. Check your connection.",
            ErrorKind::Other => "Something went wrong. Please try again.",
        }
    }
}

/// Failure of a single backend call
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// HTTP 401
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Any other non-2xx response
    #[error("request failed with status {status}")]
    Status {
        status: u16,
        body: Option<ErrorBody>,
    },

    /// No response at all (DNS, connect, timeout, reset)
    #[error("network error: {0}")]
    Network(String),

    /// 2xx response whose body did not match the expected schema
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn from_status(status: u16, body: Option<ErrorBody>) -> Self {
        if status == 401 {
            let message = body
                .as_ref()
                .and_then(ErrorBody::message)
                .unwrap_or("Unauthorized")
                .to_string();
            ApiError::Unauthorized { message }
        } else {
            ApiError::Status { status, body }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ApiError::Status { status, .. } => ErrorKind::from_status(*status),
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Decode(_) => ErrorKind::Other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Network(_) | ApiError::Decode(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Message sent by the server, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Unauthorized { message } => Some(message.as_str()),
            ApiError::Status { body, .. } => body.as_ref().and_then(ErrorBody::message),
            ApiError::Network(_) | ApiError::Decode(_) => None,
        }
    }

    /// Text suitable for a toast or inline form error.
    pub fn user_message(&self) -> String {
        let kind = self.kind();
        match kind {
            ErrorKind::Validation | ErrorKind::Other => self
                .server_message()
                .unwrap_or(kind.default_message())
                .to_string(),
            _ => kind.default_message().to_string(),
        }
    }
}

/// Failure of an auth-store operation or of a wrapped request
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("no active session")]
    NoSession,

    /// Rejected login, carrying the message to show next to the form
    #[error("{0}")]
    Login(String),

    /// 2xx response that did not carry what the contract promises
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("session storage failed: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::NoSession => ErrorKind::Unauthorized,
            AuthError::Login(_) => ErrorKind::Unauthorized,
            AuthError::Protocol(_) | AuthError::Storage(_) => ErrorKind::Other,
            AuthError::Api(api) => api.kind(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        match self {
            AuthError::NoSession => true,
            AuthError::Api(api) => api.is_unauthorized(),
            _ => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            AuthError::Login(message) => message.clone(),
            AuthError::Api(api) => api.user_message(),
            other => other.kind().default_message().to_string(),
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

/// Durable session storage failure
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}
