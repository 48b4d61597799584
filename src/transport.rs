//! Telegram transport: the seam between the engine and the Bot API.
//!
//! Platform payloads are decoded once here into the closed types below, so
//! handlers never touch raw Telegram structures.

use std::fmt;
use std::future::IntoFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use teloxide::net::Download;
use teloxide::payloads::setters::*;
use teloxide::requests::Requester;
use teloxide::types::{
    AllowedUpdate, BotCommand, BotCommandScope, CallbackQuery, ChatId, InlineKeyboardButton,
    InlineKeyboardMarkup, InputFile, Message as TgMessage, MessageId, Recipient,
    Update as TgUpdate, UpdateKind as TgUpdateKind, User,
};
use teloxide::{Bot, DownloadError, RequestError};

use crate::state::{UpdateId, UserId};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_JITTER_MS: u64 = 250;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Update {
    pub(crate) id: UpdateId,
    pub(crate) kind: UpdateKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    Message(IncomingMessage),
    Callback(CallbackEvent),
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Sender {
    pub(crate) id: UserId,
    pub(crate) username: Option<String>,
    pub(crate) first_name: String,
    pub(crate) last_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IncomingMessage {
    pub(crate) sender: Sender,
    pub(crate) content: Content,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Content {
    Text(String),
    /// Compressed photo; never accepted as a wallpaper.
    Photo,
    Document {
        file_id: String,
        mime_type: Option<String>,
    },
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CallbackEvent {
    pub(crate) id: String,
    pub(crate) sender: Sender,
    pub(crate) data: Option<String>,
    pub(crate) origin: Option<MessageRef>,
}

/// The bot message an inline button was attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MessageRef {
    pub(crate) chat_id: i64,
    pub(crate) message_id: i32,
    pub(crate) text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Button {
    pub(crate) label: String,
    pub(crate) data: String,
}

impl Button {
    pub(crate) fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Button {
            label: label.into(),
            data: data.into(),
        }
    }
}

pub(crate) type Keyboard = Vec<Vec<Button>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CommandSpec {
    pub(crate) command: &'static str,
    pub(crate) description: &'static str,
}

impl CommandSpec {
    pub(crate) const fn new(command: &'static str, description: &'static str) -> Self {
        CommandSpec {
            command,
            description,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("{method} still failing after {attempts} attempts: {last}")]
    Exhausted {
        method: &'static str,
        attempts: u32,
        last: String,
    },
    #[error("{method} rejected by telegram: {body}")]
    Api { method: &'static str, body: String },
    #[error("{method} failed: {message}")]
    Fatal {
        method: &'static str,
        message: String,
    },
    #[error("i/o on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Fatal failures stop the process; API rejections and local i/o only
    /// abort the current cycle.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Exhausted { .. } | TransportError::Fatal { .. }
        )
    }

    pub(crate) fn is_message_not_modified(&self) -> bool {
        match self {
            TransportError::Api { body, .. } => body
                .to_ascii_lowercase()
                .contains("message is not modified"),
            _ => false,
        }
    }
}

/// Everything the engine needs from the messaging platform.
pub(crate) trait Transport {
    async fn fetch_updates(&self, offset: UpdateId) -> Result<Vec<Update>, TransportError>;
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;
    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError>;
    /// Rewrites `origin` with its own text and no inline keyboard.
    async fn clear_keyboard(&self, origin: &MessageRef) -> Result<(), TransportError>;
    async fn set_commands(
        &self,
        chat_id: i64,
        commands: &[CommandSpec],
    ) -> Result<(), TransportError>;
    async fn file_path(&self, file_id: &str) -> Result<String, TransportError>;
    async fn download(&self, remote_path: &str, dest: &Path) -> Result<(), TransportError>;
    async fn send_document(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: &str,
    ) -> Result<(), TransportError>;
    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;
}

pub(crate) struct TelegramTransport {
    bot: Bot,
    poll_timeout_seconds: u32,
    max_retries: Option<u32>,
}

impl TelegramTransport {
    pub(crate) fn new(bot: Bot, poll_timeout_seconds: u32, max_retries: Option<u32>) -> Self {
        TelegramTransport {
            bot,
            poll_timeout_seconds,
            max_retries,
        }
    }

    async fn with_backoff<T, F, R>(&self, method: &'static str, mut call: F) -> Result<T, TransportError>
    where
        F: FnMut() -> R,
        R: IntoFuture<Output = Result<T, RequestError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_transient(&err) {
                return Err(classify(method, err));
            }
            attempts += 1;
            let delay = self.next_retry(method, attempts, &err)?;
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before the next attempt, or `Exhausted` once `max_retries`
    /// attempts have failed.
    fn next_retry(
        &self,
        method: &'static str,
        attempts: u32,
        err: &dyn fmt::Display,
    ) -> Result<Duration, TransportError> {
        if let Some(max) = self.max_retries {
            if attempts > max {
                return Err(TransportError::Exhausted {
                    method,
                    attempts,
                    last: err.to_string(),
                });
            }
        }
        let delay = backoff_delay(attempts - 1);
        warn!(
            "{} failed transiently (attempt {}): {}; retrying in {:?}",
            method, attempts, err, delay
        );
        Ok(delay)
    }
}

impl Transport for TelegramTransport {
    async fn fetch_updates(&self, offset: UpdateId) -> Result<Vec<Update>, TransportError> {
        let updates = self
            .with_backoff("getUpdates", || {
                self.bot
                    .get_updates()
                    .offset(offset)
                    .timeout(self.poll_timeout_seconds)
                    .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
            })
            .await?;
        Ok(updates.into_iter().map(decode_update).collect())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        self.with_backoff("sendMessage", || self.bot.send_message(ChatId(chat_id), text))
            .await?;
        Ok(())
    }

    async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), TransportError> {
        let markup = keyboard_markup(keyboard);
        self.with_backoff("sendMessage", || {
            self.bot
                .send_message(ChatId(chat_id), text)
                .reply_markup(markup.clone())
        })
        .await?;
        Ok(())
    }

    async fn clear_keyboard(&self, origin: &MessageRef) -> Result<(), TransportError> {
        let result = self
            .with_backoff("editMessageText", || {
                self.bot.edit_message_text(
                    ChatId(origin.chat_id),
                    MessageId(origin.message_id),
                    origin.text.as_str(),
                )
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_message_not_modified() => {
                debug!("keyboard on {} already cleared", origin.message_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn set_commands(
        &self,
        chat_id: i64,
        commands: &[CommandSpec],
    ) -> Result<(), TransportError> {
        let commands: Vec<BotCommand> = commands
            .iter()
            .map(|spec| BotCommand::new(spec.command, spec.description))
            .collect();
        self.with_backoff("setMyCommands", || {
            self.bot
                .set_my_commands(commands.clone())
                .scope(BotCommandScope::Chat {
                    chat_id: Recipient::Id(ChatId(chat_id)),
                })
        })
        .await?;
        Ok(())
    }

    async fn file_path(&self, file_id: &str) -> Result<String, TransportError> {
        let file = self
            .with_backoff("getFile", || self.bot.get_file(file_id))
            .await?;
        Ok(file.path)
    }

    async fn download(&self, remote_path: &str, dest: &Path) -> Result<(), TransportError> {
        let io_err = |source: io::Error| TransportError::Io {
            path: dest.to_path_buf(),
            source,
        };
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let mut attempts: u32 = 0;
        loop {
            // Recreated per attempt so a retry never appends to a partial file.
            let mut out = tokio::fs::File::create(dest).await.map_err(io_err)?;
            let err = match self.bot.download_file(remote_path, &mut out).await {
                Ok(()) => return Ok(()),
                Err(DownloadError::Io(source)) => return Err(io_err(source)),
                Err(DownloadError::Network(err)) => err,
            };
            attempts += 1;
            let delay = self.next_retry("downloadFile", attempts, &err)?;
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_document(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: &str,
    ) -> Result<(), TransportError> {
        self.with_backoff("sendDocument", || {
            self.bot
                .send_document(ChatId(chat_id), InputFile::file_id(file_id))
                .caption(caption)
        })
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.with_backoff("answerCallbackQuery", || {
            self.bot.answer_callback_query(callback_id)
        })
        .await?;
        Ok(())
    }
}

fn is_transient(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)
    )
}

fn classify(method: &'static str, err: RequestError) -> TransportError {
    match err {
        RequestError::Api(api) => TransportError::Api {
            method,
            body: api.to_string(),
        },
        RequestError::MigrateToChatId(chat_id) => TransportError::Api {
            method,
            body: format!("chat migrated to {}", chat_id),
        },
        other => TransportError::Fatal {
            method,
            message: other.to_string(),
        },
    }
}

/// Exponential delay for the given zero-based retry, before jitter.
pub(crate) fn backoff_base(retry: u32) -> Duration {
    let factor = 1u64 << retry.min(16);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS))
}

fn backoff_delay(retry: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    backoff_base(retry) + Duration::from_millis(jitter)
}

fn keyboard_markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.iter().map(|row| {
        row.iter()
            .map(|button| InlineKeyboardButton::callback(button.label.clone(), button.data.clone()))
            .collect::<Vec<_>>()
    }))
}

pub(crate) fn decode_update(update: TgUpdate) -> Update {
    let kind = match update.kind {
        TgUpdateKind::Message(message) => decode_message(&message)
            .map(UpdateKind::Message)
            .unwrap_or(UpdateKind::Unsupported),
        TgUpdateKind::CallbackQuery(query) => UpdateKind::Callback(decode_callback(query)),
        _ => UpdateKind::Unsupported,
    };
    Update {
        id: update.id,
        kind,
    }
}

fn decode_sender(user: &User) -> Sender {
    Sender {
        id: user.id.0,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
    }
}

fn decode_message(message: &TgMessage) -> Option<IncomingMessage> {
    let sender = decode_sender(message.from()?);
    let content = if let Some(text) = message.text() {
        Content::Text(text.to_string())
    } else if message.photo().is_some() {
        Content::Photo
    } else if let Some(document) = message.document() {
        Content::Document {
            file_id: document.file.id.clone(),
            mime_type: document
                .mime_type
                .as_ref()
                .map(|mime| mime.essence_str().to_string()),
        }
    } else {
        Content::Other
    };
    Some(IncomingMessage { sender, content })
}

fn decode_callback(query: CallbackQuery) -> CallbackEvent {
    let origin = query.message.as_ref().map(|message| MessageRef {
        chat_id: message.chat.id.0,
        message_id: message.id.0,
        text: message.text().unwrap_or_default().to_string(),
    });
    CallbackEvent {
        id: query.id,
        sender: decode_sender(&query.from),
        data: query.data,
        origin,
    }
}
