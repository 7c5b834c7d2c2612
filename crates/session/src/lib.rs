//! SWEAT24 session lifecycle
//!
//! Everything the admin client needs to keep a staff member signed in and
//! connected: the auth store, the idle watchdog, the realtime unread-count
//! channel and the auth-aware request wrapper. Hosts wire them together with
//! explicit `Arc`s; nothing here is a global singleton except the data dir.

pub mod auth_store;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod paths;
pub mod realtime;
pub mod request;
pub mod storage;
pub mod sync;
pub mod token;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use auth_store::{AuthSnapshot, AuthStatus, AuthStore, Session};
pub use backend::{ApiRequest, AuthBackend, HttpBackend};
pub use config::SessionConfig;
pub use error::{ApiError, AuthError, ErrorKind, StorageError};
pub use events::{LogoutReason, SessionEvent};
pub use realtime::{RealtimeManager, TokenSource, TungsteniteConnector, Visibility};
pub use request::{AuthorizedClient, Connectivity};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use watchdog::{ActivitySignal, SessionWatchdog, WatchdogPhase};
