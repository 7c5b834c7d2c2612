//! Idle-session guard.
//!
//! While a session is authenticated the watchdog keeps one timer task armed:
//! it warns `warning_window` before the idle deadline and logs the user out at
//! the deadline. Any [`ActivitySignal`] re-arms it from zero.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth_store::{AuthStatus, AuthStore};
use crate::config::WatchdogConfig;
use crate::error::AuthError;
use crate::events::{LogoutReason, SessionEvent};

/// User input that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    Touch,
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    /// No authenticated session to guard
    Idle,
    Active,
    /// Warning shown, logout pending
    Warning,
    /// Logged out for inactivity
    Expired,
    Stopped,
}

#[derive(Debug)]
struct WatchState {
    phase: WatchdogPhase,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct SessionWatchdog {
    config: WatchdogConfig,
    store: Arc<AuthStore>,
    state: Arc<Mutex<WatchState>>,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWatchdog {
    pub fn new(config: WatchdogConfig, store: Arc<AuthStore>) -> Self {
        Self {
            config,
            store,
            state: Arc::new(Mutex::new(WatchState {
                phase: WatchdogPhase::Idle,
                timer: None,
                generation: 0,
            })),
            follower: Mutex::new(None),
        }
    }

    /// Arm now if authenticated, then follow the store's status.
    pub fn start(&self) {
        {
            let mut state = self.lock_state();
            if state.phase == WatchdogPhase::Stopped {
                state.phase = WatchdogPhase::Idle;
            }
        }
        if self.store.status() == AuthStatus::Authenticated {
            self.arm_if_idle();
        }

        let mut follower = self.follower.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = follower.take() {
            handle.abort();
        }
        let mut status_rx = self.store.subscribe_status();
        let guard = self.guard();
        *follower = Some(tokio::spawn(async move {
            loop {
                let status = *status_rx.borrow_and_update();
                match status {
                    AuthStatus::Authenticated => guard.arm_if_idle(),
                    AuthStatus::Unauthenticated => guard.disarm(),
                    // A refresh in flight is not activity and not a logout.
                    AuthStatus::Checking | AuthStatus::Refreshing => {}
                }
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn record_activity(&self, signal: ActivitySignal) {
        let guard = self.guard();
        let phase = guard.phase();
        if !matches!(phase, WatchdogPhase::Active | WatchdogPhase::Warning) {
            return;
        }
        debug!(
            component = "watchdog",
            event = "watchdog.activity",
            signal = ?signal,
        );
        guard.arm();
        if phase == WatchdogPhase::Warning {
            let _ = self.store.events().send(SessionEvent::IdleWarningCleared);
        }
    }

    /// The user chose to stay signed in from the warning.
    ///
    /// Rotates the token; on failure the refresh has already forced the
    /// logout and the watchdog stops.
    pub async fn continue_session(&self) -> Result<(), AuthError> {
        match self.store.refresh().await {
            Ok(_) => {
                info!(
                    component = "watchdog",
                    event = "watchdog.continued",
                    "Session continued from idle warning"
                );
                let was_warning = self.phase() == WatchdogPhase::Warning;
                self.guard().arm();
                if was_warning {
                    let _ = self.store.events().send(SessionEvent::IdleWarningCleared);
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    component = "watchdog",
                    event = "watchdog.continue_failed",
                    error = %e,
                    "Could not continue session"
                );
                self.stop();
                Err(e)
            }
        }
    }

    /// Cancel every pending timer. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self
            .follower
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let mut state = self.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        if state.phase != WatchdogPhase::Stopped {
            debug!(component = "watchdog", event = "watchdog.stopped");
        }
        state.phase = WatchdogPhase::Stopped;
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.lock_state().phase
    }

    /// Idle timers still waiting to fire (0 or 1).
    pub fn pending_timers(&self) -> usize {
        let state = self.lock_state();
        usize::from(state.timer.as_ref().is_some_and(|t| !t.is_finished()))
    }

    fn arm_if_idle(&self) {
        self.guard().arm_if_idle();
    }

    fn guard(&self) -> Guard {
        Guard {
            config: self.config,
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The parts of the watchdog its tasks need.
#[derive(Clone)]
struct Guard {
    config: WatchdogConfig,
    store: Arc<AuthStore>,
    state: Arc<Mutex<WatchState>>,
}

impl Guard {
    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn phase(&self) -> WatchdogPhase {
        self.lock().phase
    }

    fn arm_if_idle(&self) {
        let phase = self.phase();
        if matches!(phase, WatchdogPhase::Idle | WatchdogPhase::Expired) {
            self.arm();
        }
    }

    /// Replace any pending timer with a fresh one.
    fn arm(&self) {
        let mut state = self.lock();
        if state.phase == WatchdogPhase::Stopped {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.phase = WatchdogPhase::Active;
        let generation = state.generation;
        state.timer = Some(tokio::spawn(self.clone().run_timer(generation)));
    }

    fn disarm(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        if matches!(state.phase, WatchdogPhase::Active | WatchdogPhase::Warning) {
            state.phase = WatchdogPhase::Idle;
        }
    }

    async fn run_timer(self, generation: u64) {
        tokio::time::sleep(self.config.warning_after()).await;
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.phase = WatchdogPhase::Warning;
        }
        info!(
            component = "watchdog",
            event = "watchdog.warning",
            remaining_secs = self.config.warning_window.as_secs(),
            "Idle warning"
        );
        let _ = self.store.events().send(SessionEvent::IdleWarning {
            remaining: self.config.warning_window,
        });

        tokio::time::sleep(self.config.warning_window).await;
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            // Detach so the logout's status change cannot abort this task.
            state.timer = None;
            state.phase = WatchdogPhase::Expired;
        }
        info!(
            component = "watchdog",
            event = "watchdog.expired",
            idle_secs = self.config.session_duration.as_secs(),
            "Logging out after inactivity"
        );
        let _ = self.store.events().send(SessionEvent::ForcedLogout {
            reason: LogoutReason::Inactivity,
        });
        self.store.logout().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::event_channel;
    use crate::storage::MemoryStorage;
    use crate::test_support::MockBackend;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        watchdog: SessionWatchdog,
        store: Arc<AuthStore>,
        backend: Arc<MockBackend>,
        events: broadcast::Receiver<SessionEvent>,
    }

    async fn signed_in() -> Harness {
        let backend = Arc::new(MockBackend::default());
        let (tx, events) = event_channel();
        let config = SessionConfig::default();
        let store = AuthStore::new(
            config.clone(),
            backend.clone(),
            Arc::new(MemoryStorage::new()),
            tx,
        );
        store.login("admin@sweat24.gr", "password").await.unwrap();
        let watchdog = SessionWatchdog::new(config.watchdog, store.clone());
        watchdog.start();
        let mut harness = Harness {
            watchdog,
            store,
            backend,
            events,
        };
        drain(&mut harness.events);
        harness
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn warns_at_eighteen_minutes_and_logs_out_at_twenty() {
        let mut h = signed_in().await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);

        tokio::time::sleep(18 * MINUTE - Duration::from_secs(1)).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
        assert!(drain(&mut h.events).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Warning);
        assert_eq!(
            drain(&mut h.events),
            vec![SessionEvent::IdleWarning {
                remaining: 2 * MINUTE
            }]
        );

        tokio::time::sleep(2 * MINUTE).await;
        settle().await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Expired);
        assert_eq!(h.store.status(), AuthStatus::Unauthenticated);
        assert_eq!(h.backend.logout_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            drain(&mut h.events),
            vec![
                SessionEvent::ForcedLogout {
                    reason: LogoutReason::Inactivity
                },
                SessionEvent::NavigateToLogin,
            ]
        );
        assert_eq!(h.watchdog.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_rearms_from_zero() {
        let mut h = signed_in().await;

        tokio::time::sleep(17 * MINUTE).await;
        h.watchdog.record_activity(ActivitySignal::KeyPress);

        tokio::time::sleep(17 * MINUTE).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
        assert!(drain(&mut h.events).is_empty());

        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_during_warning_clears_it() {
        let mut h = signed_in().await;
        tokio::time::sleep(19 * MINUTE).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Warning);
        drain(&mut h.events);

        h.watchdog.record_activity(ActivitySignal::Scroll);
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::IdleWarningCleared]);

        tokio::time::sleep(5 * MINUTE).await;
        settle().await;
        assert_eq!(h.store.status(), AuthStatus::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_session_refreshes_and_resets() {
        let mut h = signed_in().await;
        tokio::time::sleep(19 * MINUTE).await;
        drain(&mut h.events);

        h.watchdog.continue_session().await.unwrap();
        assert_eq!(h.backend.refreshes(), 1);
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::IdleWarningCleared]);

        tokio::time::sleep(17 * MINUTE).await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_continue_stops_watchdog() {
        let h = signed_in().await;
        tokio::time::sleep(19 * MINUTE).await;
        h.backend.fail_refresh_with(crate::test_support::unauthorized());

        assert!(h.watchdog.continue_session().await.is_err());
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Stopped);
        assert_eq!(h.watchdog.pending_timers(), 0);
        assert_eq!(h.store.status(), AuthStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_cancels_timers() {
        let h = signed_in().await;
        assert_eq!(h.watchdog.pending_timers(), 1);

        h.watchdog.stop();
        h.watchdog.stop();
        assert_eq!(h.watchdog.pending_timers(), 0);

        tokio::time::sleep(30 * MINUTE).await;
        settle().await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Stopped);
        assert_eq!(h.backend.logout_calls.load(Ordering::SeqCst), 0);

        h.watchdog.record_activity(ActivitySignal::Click);
        assert_eq!(h.watchdog.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_logout_disarms() {
        let h = signed_in().await;
        h.store.logout().await;
        settle().await;

        assert_eq!(h.watchdog.phase(), WatchdogPhase::Idle);
        assert_eq!(h.watchdog.pending_timers(), 0);

        h.store.login("admin@sweat24.gr", "password").await.unwrap();
        settle().await;
        assert_eq!(h.watchdog.phase(), WatchdogPhase::Active);
    }
}
