//! Session token codec.
//!
//! Reads the claims of a compact `header.payload.signature` token. The
//! signature is never checked here; that is the backend's job. Every helper
//! except [`decode`] is fail-closed: a token that cannot be read counts as
//! expired and has no time left.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a token could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedTokenError {
    #[error("token has {0} segments, expected 3")]
    SegmentCount(usize),
    #[error("token payload is not valid base64url: {0}")]
    Encoding(String),
    #[error("token payload is not a JSON object: {0}")]
    Payload(String),
}

/// Decoded claim map
#[derive(Debug, Clone, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// `exp` in epoch seconds
    pub fn exp(&self) -> Option<i64> {
        self.number("exp")
    }

    /// `iat` in epoch seconds
    pub fn iat(&self) -> Option<i64> {
        self.number("iat")
    }

    pub fn sub(&self) -> Option<String> {
        match self.0.get("sub")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.string("email")
    }

    pub fn name(&self) -> Option<&str> {
        self.string("name")
    }

    pub fn role(&self) -> Option<&str> {
        self.string("role")
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp()?, 0)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat()?, 0)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn number(&self, key: &str) -> Option<i64> {
        let value = self.0.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

/// Decode the claims of `token`.
pub fn decode(token: &str) -> Result<Claims, MalformedTokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(MalformedTokenError::SegmentCount(parts.len()));
    }

    // Accept padded segments too; some issuers keep the `=`.
    let payload = parts[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| MalformedTokenError::Encoding(e.to_string()))?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(Claims(map)),
        Ok(other) => Err(MalformedTokenError::Payload(format!(
            "expected object, found {}",
            json_kind(&other)
        ))),
        Err(e) => Err(MalformedTokenError::Payload(e.to_string())),
    }
}

/// Whether `token` is expired right now.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, now_millis())
}

/// Whether `token` is expired at `now_ms` (epoch milliseconds).
///
/// Undecodable tokens and tokens without `exp` are expired.
pub fn is_expired_at(token: &str, now_ms: i64) -> bool {
    match decode(token).map(|claims| claims.exp()) {
        Ok(Some(exp)) => now_ms >= exp.saturating_mul(1000),
        Ok(None) | Err(_) => true,
    }
}

/// Time left before `token` expires; zero when it cannot be decoded.
pub fn time_remaining(token: &str) -> Duration {
    time_remaining_at(token, now_millis())
}

pub fn time_remaining_at(token: &str, now_ms: i64) -> Duration {
    let Ok(Some(exp)) = decode(token).map(|claims| claims.exp()) else {
        return Duration::ZERO;
    };
    let remaining = exp.saturating_mul(1000).saturating_sub(now_ms);
    if remaining > 0 {
        Duration::from_millis(remaining as u64)
    } else {
        Duration::ZERO
    }
}

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
