use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Deserialize;
use teloxide::Bot;

mod callback_handlers;
mod desktop;
mod gate;
mod helpers;
mod message_handlers;
mod polling;
mod state;
mod transport;


use desktop::{ApplyError, DesktopApplier, PlasmaApplier};
use helpers::*;
use polling::{run_polling, spawn_signal_listener, ShutdownLatch};
use state::{BotState, ConversationState, StateStore, StoreError, UserId, UserRecord};
use transport::{
    Button, CallbackEvent, CommandSpec, Content, IncomingMessage, Keyboard, MessageRef, Sender,
    TelegramTransport, Transport, TransportError, Update, UpdateKind,
};

const DEFAULT_POLL_TIMEOUT_SECS: u32 = 10;
const DEFAULT_IDLE_DELAY_MS: u64 = 1000;
const ACCEPTED_MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/jxl"];

const OWNER_COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("ping", "pong"),
    CommandSpec::new("shutdown", "shuts down the bot"),
    CommandSpec::new("reset", "resets users"),
    CommandSpec::new("save", "saves state to disk"),
    CommandSpec::new("desktop", "sets desktop background"),
    CommandSpec::new("cancel", "cancels the current upload"),
];

const USER_COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("ping", "pong"),
    CommandSpec::new("desktop", "sets desktop background"),
    CommandSpec::new("cancel", "cancels the current upload"),
];

#[derive(Debug, Deserialize)]
struct ConfigFile {
    token: TokenInput,
    #[serde(default = "default_state_path")]
    state_path: PathBuf,
    #[serde(default = "default_images_dir")]
    images_dir: PathBuf,
    poll_timeout_seconds: Option<u32>,
    idle_delay_ms: Option<u64>,
    #[serde(default)]
    transport: TransportSettings,
    #[serde(default)]
    desktop: DesktopSettings,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenInput {
    Inline(String),
    File { file: PathBuf },
}

#[derive(Debug, Deserialize, Clone, Default)]
struct TransportSettings {
    max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
struct DesktopSettings {
    #[serde(default = "default_busctl_bin")]
    busctl_bin: PathBuf,
    #[serde(default = "default_wallpaper_plugin")]
    plugin: String,
    #[serde(default = "default_monitors")]
    monitors: Vec<MonitorChoice>,
}

impl Default for DesktopSettings {
    fn default() -> Self {
        DesktopSettings {
            busctl_bin: default_busctl_bin(),
            plugin: default_wallpaper_plugin(),
            monitors: default_monitors(),
        }
    }
}

/// One button of the monitor prompt.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
struct MonitorChoice {
    label: String,
    index: u32,
}

#[derive(Debug, Clone)]
struct Config {
    token: String,
    state_path: PathBuf,
    images_dir: PathBuf,
    poll_timeout_seconds: u32,
    idle_delay: Duration,
    transport: TransportSettings,
    desktop: DesktopSettings,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: PathBuf,
    /// Create a fresh state file owned by this user id if none exists yet.
    #[arg(long)]
    init_owner: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Ping,
    Shutdown,
    Reset,
    Save,
    Desktop,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NewUserDecision {
    Allow,
    Ban,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackAction {
    NewUser {
        decision: NewUserDecision,
        user_id: UserId,
    },
    Desktop {
        monitor: u32,
        user_id: UserId,
    },
}

#[derive(Debug, thiserror::Error)]
enum BotError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("no pending image for user {user_id}")]
    MissingFile { user_id: UserId },
}

impl BotError {
    /// Fatal errors stop the polling loop; everything else only aborts the
    /// current cycle.
    fn is_fatal(&self) -> bool {
        match self {
            BotError::Transport(err) => err.is_fatal(),
            BotError::Store(_) | BotError::Apply(_) | BotError::MissingFile { .. } => false,
        }
    }
}

type HandlerResult<T = ()> = std::result::Result<T, BotError>;

struct AppContext<T, D> {
    config: Config,
    transport: T,
    applier: D,
    store: StateStore,
    shutdown: ShutdownLatch,
}

impl<T: Transport, D: DesktopApplier> AppContext<T, D> {
    /// Persists `state`, logging instead of failing so a broken disk does not
    /// take the bot down.
    fn checkpoint(&self, state: &BotState) -> bool {
        match self.store.save(state) {
            Ok(()) => true,
            Err(err) => {
                error!("saving state failed: {:#}", anyhow::Error::new(err));
                false
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let store = StateStore::new(config.state_path.clone());

    let mut state = match args.init_owner {
        Some(owner_id) if !store.path().exists() => {
            store.init(owner_id).context("initialise state")?
        }
        _ => store
            .load()
            .with_context(|| format!("load state {}", store.path().display()))?,
    };
    if let Some(owner_id) = args.init_owner {
        if owner_id != state.owner_id {
            warn!(
                "--init-owner {} ignored; state already belongs to {}",
                owner_id, state.owner_id
            );
        }
    }

    let shutdown = ShutdownLatch::new();
    spawn_signal_listener(shutdown.clone());

    let transport = TelegramTransport::new(
        Bot::new(config.token.clone()),
        config.poll_timeout_seconds,
        config.transport.max_retries,
    );
    let applier = PlasmaApplier::new(
        config.desktop.busctl_bin.clone(),
        config.desktop.plugin.clone(),
    );
    let app = AppContext {
        config,
        transport,
        applier,
        store,
        shutdown,
    };

    info!(
        "starting bot for owner {} at offset {}",
        state.owner_id, state.offset
    );
    run_polling(&app, &mut state)
        .await
        .context("polling loop stopped")?;
    info!("bot stopped");
    Ok(())
}
