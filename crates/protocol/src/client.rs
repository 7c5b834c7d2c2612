//! Client → Server frames

use serde::{Deserialize, Serialize};

/// Frames sent from the client over the realtime socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after the socket opens; carries the bearer token.
    #[serde(rename = "auth")]
    Authenticate { token: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // String-only variants cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
