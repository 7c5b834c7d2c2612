//! SWEAT24 Protocol
//!
//! Shared types for communication between the SWEAT24 admin client and the
//! backend. REST bodies and WebSocket frames are serialized as JSON.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientFrame;
pub use server::ServerFrame;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
