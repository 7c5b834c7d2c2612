//! Lifecycle notifications for the presentation layer.
//!
//! The auth store and the watchdog never drive navigation themselves; they
//! publish these events and the host decides what to render.

use std::time::Duration;

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Login succeeded; show the default view.
    NavigateToDashboard,
    /// No session anymore; show the login view.
    NavigateToLogin,
    /// The session was closed without the user asking for it.
    ForcedLogout { reason: LogoutReason },
    /// The idle guard will close the session after `remaining`.
    IdleWarning { remaining: Duration },
    /// The idle warning was dismissed by activity or "continue".
    IdleWarningCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    Inactivity,
    RefreshFailed,
}

impl LogoutReason {
    /// Notice shown to the user after the redirect.
    pub fn notice(self) -> &'static str {
        match self {
            LogoutReason::Inactivity => "Session expired due to inactivity",
            LogoutReason::RefreshFailed => "Your session has expired. Please sign in again.",
        }
    }
}

pub type EventSender = broadcast::Sender<SessionEvent>;

pub fn event_channel() -> (EventSender, broadcast::Receiver<SessionEvent>) {
    broadcast::channel(EVENT_CAPACITY)
}
