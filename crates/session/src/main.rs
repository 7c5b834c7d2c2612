//! sweat24-session
//!
//! Headless host for the session layer: sign in, inspect the stored session,
//! or stay connected and print unread counts until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use sweat24_session::events::event_channel;
use sweat24_session::logging::{init_logging, LogSink};
use sweat24_session::realtime::RealtimeEvent;
use sweat24_session::sync::BroadcastWatcher;
use sweat24_session::{
    paths, token, AuthStatus, AuthStore, AuthorizedClient, FileStorage, HttpBackend,
    RealtimeManager, SessionConfig, SessionEvent, SessionWatchdog, TungsteniteConnector,
};

#[derive(Parser, Debug)]
#[command(
    name = "sweat24-session",
    about = "Sign in to the SWEAT24 admin backend and keep the session alive",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Where the session and logs are kept (default ~/.sweat24)"
    )]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "SWEAT24_API_URL", help = "REST API base URL")]
    api_url: Option<String>,

    #[arg(long, global = true, env = "SWEAT24_WS_URL", help = "Realtime WebSocket URL")]
    ws_url: Option<String>,

    #[arg(long, global = true, help = "Log to stderr instead of the log file")]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and persist the session
    Login(LoginArgs),
    /// Sign out and clear the stored session
    Logout,
    /// Restore the stored session and print who is signed in
    Status,
    /// Stay connected and print unread counts until Ctrl-C
    Watch,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, env = "SWEAT24_EMAIL")]
    email: String,

    #[arg(long, env = "SWEAT24_PASSWORD", hide_env_values = true)]
    password: String,
}

struct App {
    config: SessionConfig,
    backend: Arc<HttpBackend>,
    storage: Arc<FileStorage>,
    store: Arc<AuthStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs().context("failed to create data dir")?;
    let sink = if cli.log_stderr {
        LogSink::Stderr
    } else {
        LogSink::File
    };
    let logging = init_logging(sink)?;
    info!(
        component = "main",
        event = "main.started",
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
        "sweat24-session starting"
    );

    let mut config = SessionConfig::from_env();
    if let Some(url) = cli.api_url {
        config.api_base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(url) = cli.ws_url {
        config.ws_url = url;
    }

    let backend = Arc::new(HttpBackend::new(config.clone())?);
    let storage = Arc::new(FileStorage::in_data_dir());
    let (events_tx, _) = event_channel();
    let store = AuthStore::new(config.clone(), backend.clone(), storage.clone(), events_tx);
    let ctx = App {
        config,
        backend,
        storage,
        store,
    };

    match cli.command {
        Command::Login(args) => login(&ctx, args).await,
        Command::Logout => logout(&ctx).await,
        Command::Status => status(&ctx).await,
        Command::Watch => watch(&ctx).await,
    }
}

async fn login(ctx: &App, args: LoginArgs) -> anyhow::Result<()> {
    match ctx.store.login(&args.email, &args.password).await {
        Ok(session) => {
            println!(
                "Signed in as {} <{}> ({})",
                session.display_name, session.email, session.role
            );
            Ok(())
        }
        Err(e) => bail!(e.user_message()),
    }
}

async fn logout(ctx: &App) -> anyhow::Result<()> {
    ctx.store.initialize().await;
    ctx.store.logout().await;
    println!("Signed out");
    Ok(())
}

async fn status(ctx: &App) -> anyhow::Result<()> {
    if ctx.store.initialize().await != AuthStatus::Authenticated {
        println!("Not signed in");
        return Ok(());
    }
    let snapshot = ctx.store.snapshot();
    if let Some(session) = &snapshot.session {
        println!(
            "Signed in as {} <{}> ({})",
            session.display_name, session.email, session.role
        );
    }
    if let Some(jwt) = &snapshot.token {
        let remaining = token::time_remaining(jwt);
        println!("Token valid for {}s", remaining.as_secs());
    }
    let client = AuthorizedClient::new(ctx.store.clone(), ctx.backend.clone());
    let unread: sweat24_protocol::UnreadCount = client
        .get_json(&ctx.config.endpoints.unread_count)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    println!("Unread messages: {}", unread.count);
    Ok(())
}

async fn watch(ctx: &App) -> anyhow::Result<()> {
    if ctx.store.initialize().await != AuthStatus::Authenticated {
        bail!("Not signed in. Run `sweat24-session login` first.");
    }

    let _mirror = BroadcastWatcher::spawn(ctx.store.clone(), ctx.storage.clone())?;
    let watchdog = SessionWatchdog::new(ctx.config.watchdog, ctx.store.clone());
    watchdog.start();
    let realtime = RealtimeManager::new(
        ctx.config.realtime,
        ctx.config.ws_url.clone(),
        Arc::new(TungsteniteConnector),
        ctx.backend.clone(),
        ctx.store.clone(),
    );
    realtime.start();

    let mut session_events = ctx.store.events().subscribe();
    let mut realtime_events = realtime.subscribe_events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = session_events.recv() => match event {
                Ok(SessionEvent::NavigateToLogin) => {
                    println!("Signed out");
                    break;
                }
                Ok(SessionEvent::ForcedLogout { reason }) => println!("{}", reason.notice()),
                Ok(SessionEvent::IdleWarning { remaining }) => {
                    println!("Idle: signing out in {}s", remaining.as_secs());
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            event = realtime_events.recv() => match event {
                Ok(RealtimeEvent::UnreadCountChanged(count)) => println!("Unread messages: {count}"),
                Ok(RealtimeEvent::PollingStarted) => println!("Realtime unavailable, polling"),
                Ok(RealtimeEvent::Frame(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    realtime.shutdown().await;
    watchdog.stop();
    info!(
        component = "main",
        event = "main.stopped",
        "sweat24-session stopped"
    );
    Ok(())
}
