//! Realtime channel manager.
//!
//! Keeps one authenticated socket open to the chat backend and turns its
//! frames into an authoritative unread count. Failed connections are retried
//! with exponential backoff; once the retry budget is spent the manager gives
//! up on the socket for the rest of the session and polls the count instead.
//!
//! ```text
//! disconnected ──► connecting ──► connected
//!      ▲               │              │
//!      └── backoff ◄───┴── error ◄────┘
//!      └── attempts exhausted ──► polling
//! ```

use std::future::{pending, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use sweat24_protocol::{ClientFrame, ServerFrame};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth_store::{AuthStatus, AuthStore};
use crate::backend::AuthBackend;
use crate::config::RealtimeConfig;

const EVENT_CAPACITY: usize = 64;

/// Read-only access to the current bearer token.
pub trait TokenSource: Send + Sync {
    fn current_token(&self) -> Option<String>;

    /// Auth status feed. A running channel closes once it reports
    /// `Unauthenticated`; sources without one are never signed out.
    fn subscribe_status(&self) -> Option<watch::Receiver<AuthStatus>> {
        None
    }
}

impl TokenSource for AuthStore {
    fn current_token(&self) -> Option<String> {
        self.token()
    }

    fn subscribe_status(&self) -> Option<watch::Receiver<AuthStatus>> {
        Some(AuthStore::subscribe_status(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SocketError(pub String);

/// An open socket carrying text frames.
#[async_trait]
pub trait RealtimeSocket: Send {
    async fn send(&mut self, text: String) -> Result<(), SocketError>;

    /// Next text frame; `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, SocketError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn RealtimeSocket>, SocketError>;
}

/// tokio-tungstenite connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn RealtimeSocket>, SocketError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SocketError(e.to_string()))?;
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeSocket for TungsteniteSocket {
    async fn send(&mut self, text: String) -> Result<(), SocketError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SocketError(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SocketError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(SocketError(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Socket,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RealtimeConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub mode: TransportMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// A known frame arrived on the socket
    Frame(ServerFrame),
    UnreadCountChanged(u64),
    /// The socket was given up; the count is polled from now on
    PollingStarted,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RealtimeManager {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Inner {
    config: RealtimeConfig,
    ws_url: String,
    connector: Arc<dyn SocketConnector>,
    backend: Arc<dyn AuthBackend>,
    tokens: Arc<dyn TokenSource>,
    state_tx: watch::Sender<RealtimeConnectionState>,
    unread_tx: watch::Sender<u64>,
    events_tx: broadcast::Sender<RealtimeEvent>,
    gave_up: AtomicBool,
}

impl RealtimeManager {
    pub fn new(
        config: RealtimeConfig,
        ws_url: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        backend: Arc<dyn AuthBackend>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RealtimeConnectionState::default());
        let (unread_tx, _) = watch::channel(0);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                ws_url: ws_url.into(),
                connector,
                backend,
                tokens,
                state_tx,
                unread_tx,
                events_tx,
                gave_up: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RealtimeConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RealtimeConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn unread_count(&self) -> u64 {
        *self.inner.unread_tx.borrow()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<u64> {
        self.inner.unread_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Connect (or resume polling) unless already running.
    ///
    /// Without a token nothing is attempted and the manager stays idle.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        if self.inner.tokens.current_token().is_none() {
            debug!(
                component = "realtime",
                event = "realtime.idle",
                "No token, not connecting"
            );
            self.inner.update(|s| s.status = ConnectionStatus::Disconnected);
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.inner.clone().run(stop_rx));
        *running = Some(Running { stop_tx, handle });
    }

    pub async fn set_visibility(&self, visibility: Visibility) {
        debug!(
            component = "realtime",
            event = "realtime.visibility",
            visibility = ?visibility,
        );
        match visibility {
            Visibility::Hidden => self.halt().await,
            Visibility::Visible => self.start(),
        }
    }

    /// Close the socket and cancel pending timers. Idempotent.
    ///
    /// Also forgets that the socket was given up, so the next session starts
    /// on the socket again.
    pub async fn shutdown(&self) {
        self.halt().await;
        self.inner.gave_up.store(false, Ordering::SeqCst);
        self.inner.update(|s| {
            *s = RealtimeConnectionState::default();
        });
    }

    async fn halt(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            if !e.is_cancelled() {
                warn!(
                    component = "realtime",
                    event = "realtime.task_failed",
                    error = %e,
                    "Realtime task ended abnormally"
                );
            }
        }
        self.inner.update(|s| s.status = ConnectionStatus::Disconnected);
        info!(
            component = "realtime",
            event = "realtime.stopped",
            "Realtime channel stopped"
        );
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            running.handle.abort();
        }
    }
}

/// What ends a running channel: an explicit stop or the session signing out.
struct Halt {
    stop: watch::Receiver<bool>,
    status: Option<watch::Receiver<AuthStatus>>,
}

impl Halt {
    fn signed_out(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| *status.borrow() == AuthStatus::Unauthenticated)
    }

    fn triggered(&self) -> bool {
        *self.stop.borrow() || self.signed_out()
    }

    async fn wait(&mut self) {
        let Self { stop, status } = self;
        let signed_out = async {
            match status {
                Some(status) => {
                    let closed = status
                        .wait_for(|s| *s == AuthStatus::Unauthenticated)
                        .await
                        .is_err();
                    if closed {
                        pending::<()>().await;
                    }
                }
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => {}
            _ = signed_out => {}
        }
    }
}

/// Resolve `fut` unless the channel is halted first.
async fn or_stopped<T>(stop: &mut Halt, fut: impl Future<Output = T>) -> Option<T> {
    if stop.triggered() {
        return None;
    }
    tokio::select! {
        value = fut => Some(value),
        _ = stop.wait() => None,
    }
}

enum Disconnect {
    Stopped,
    Lost(String),
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut RealtimeConnectionState)) {
        self.state_tx.send_modify(f);
    }

    async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let mut halt = Halt {
            stop,
            status: self.tokens.subscribe_status(),
        };
        if self.gave_up.load(Ordering::SeqCst) || self.run_socket(&mut halt).await {
            self.run_polling(&mut halt).await;
        }

        if halt.signed_out() {
            // The next session starts on the socket again
            self.gave_up.store(false, Ordering::SeqCst);
            self.update(|s| *s = RealtimeConnectionState::default());
            info!(
                component = "realtime",
                event = "realtime.signed_out",
                "Session ended, realtime channel closed"
            );
        }
    }

    /// Socket loop with backoff. Returns `true` once the retry budget is spent.
    async fn run_socket(&self, stop: &mut Halt) -> bool {
        let mut attempts = 0u32;
        loop {
            let Some(token) = self.tokens.current_token() else {
                debug!(
                    component = "realtime",
                    event = "realtime.idle",
                    "Token gone, not reconnecting"
                );
                self.update(|s| s.status = ConnectionStatus::Disconnected);
                return false;
            };

            self.update(|s| {
                s.status = ConnectionStatus::Connecting;
                s.mode = TransportMode::Socket;
            });

            let error = match self.session(stop, &token, &mut attempts).await {
                Disconnect::Stopped => return false,
                Disconnect::Lost(error) => error,
            };

            self.update(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.last_error = Some(error.clone());
            });

            if attempts >= self.config.max_reconnect_attempts {
                info!(
                    component = "realtime",
                    event = "realtime.gave_up",
                    attempts,
                    error = %error,
                    "Reconnect attempts exhausted, falling back to polling"
                );
                self.gave_up.store(true, Ordering::SeqCst);
                return true;
            }

            let delay = self.config.reconnect_delay(attempts);
            attempts += 1;
            self.update(|s| s.reconnect_attempts = attempts);
            warn!(
                component = "realtime",
                event = "realtime.reconnect_scheduled",
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Realtime connection lost"
            );
            if or_stopped(stop, tokio::time::sleep(delay)).await.is_none() {
                return false;
            }
        }
    }

    /// One connection, from connect to disconnect.
    async fn session(
        &self,
        stop: &mut Halt,
        token: &str,
        attempts: &mut u32,
    ) -> Disconnect {
        let connected = match or_stopped(stop, self.connector.connect(&self.ws_url)).await {
            None => return Disconnect::Stopped,
            Some(connected) => connected,
        };
        let mut socket = match connected {
            Ok(socket) => socket,
            Err(e) => return Disconnect::Lost(e.0),
        };

        let hello = ClientFrame::Authenticate {
            token: token.to_string(),
        };
        match or_stopped(stop, socket.send(hello.to_json())).await {
            None => {
                socket.close().await;
                return Disconnect::Stopped;
            }
            Some(Err(e)) => return Disconnect::Lost(e.0),
            Some(Ok(())) => {}
        }

        *attempts = 0;
        self.update(|s| {
            s.status = ConnectionStatus::Connected;
            s.reconnect_attempts = 0;
            s.last_error = None;
        });
        info!(
            component = "realtime",
            event = "realtime.connected",
            url = %self.ws_url,
            "Realtime channel connected"
        );

        loop {
            let next = match or_stopped(stop, socket.recv()).await {
                None => {
                    socket.close().await;
                    return Disconnect::Stopped;
                }
                Some(next) => next,
            };
            match next {
                None => return Disconnect::Lost("connection closed".into()),
                Some(Err(e)) => return Disconnect::Lost(e.0),
                Some(Ok(text)) => {
                    if let Some(reason) = self.handle_frame(stop, &text).await {
                        socket.close().await;
                        return Disconnect::Lost(reason);
                    }
                }
            }
        }
    }

    /// Apply one frame. Returns a reason when the connection should be dropped.
    async fn handle_frame(&self, stop: &mut Halt, text: &str) -> Option<String> {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(
                    component = "realtime",
                    event = "realtime.frame_ignored",
                    error = %e,
                    "Unparseable frame"
                );
                return None;
            }
        };
        if frame == ServerFrame::Unknown {
            return None;
        }
        let _ = self.events_tx.send(RealtimeEvent::Frame(frame.clone()));

        match frame {
            ServerFrame::UnreadCountUpdate { count } => self.set_unread(count),
            ServerFrame::AuthError { message } => {
                let reason = message.unwrap_or_else(|| "socket authentication rejected".into());
                warn!(
                    component = "realtime",
                    event = "realtime.auth_rejected",
                    reason = %reason,
                    "Socket authentication rejected"
                );
                return Some(reason);
            }
            ServerFrame::AuthSuccess => {
                debug!(component = "realtime", event = "realtime.authenticated");
            }
            ref other if other.invalidates_unread_count() => {
                let _ = or_stopped(stop, self.fetch_unread()).await;
            }
            _ => {}
        }
        None
    }

    async fn run_polling(&self, stop: &mut Halt) {
        self.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.mode = TransportMode::Polling;
        });
        let _ = self.events_tx.send(RealtimeEvent::PollingStarted);
        info!(
            component = "realtime",
            event = "realtime.polling_started",
            interval_secs = self.config.poll_interval.as_secs(),
            "Polling unread count"
        );
        loop {
            if or_stopped(stop, self.fetch_unread()).await.is_none() {
                return;
            }
            if or_stopped(stop, tokio::time::sleep(self.config.poll_interval))
                .await
                .is_none()
            {
                return;
            }
        }
    }

    async fn fetch_unread(&self) {
        let Some(token) = self.tokens.current_token() else {
            return;
        };
        match self.backend.unread_count(&token).await {
            Ok(count) => self.set_unread(count),
            Err(e) => warn!(
                component = "realtime",
                event = "realtime.unread_fetch_failed",
                error = %e,
                "Failed to fetch unread count"
            ),
        }
    }

    fn set_unread(&self, count: u64) {
        let changed = self.unread_tx.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
        if changed {
            let _ = self.events_tx.send(RealtimeEvent::UnreadCountChanged(count));
        }
    }
}
