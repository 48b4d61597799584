use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

pub(crate) type UserId = u64;
pub(crate) type UpdateId = i32;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BotState {
    pub(crate) owner_id: UserId,
    #[serde(default)]
    pub(crate) offset: UpdateId,
    #[serde(default)]
    pub(crate) users: BTreeMap<UserId, UserRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct UserRecord {
    #[serde(default)]
    pub(crate) username: Option<String>,
    pub(crate) allowed: bool,
    #[serde(default)]
    pub(crate) conversation_state: ConversationState,
    #[serde(default)]
    pub(crate) pending_file_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ConversationState {
    #[default]
    Idle,
    AwaitingImage,
    AwaitingMonitor,
}

impl BotState {
    pub(crate) fn new(owner_id: UserId) -> Self {
        BotState {
            owner_id,
            offset: 0,
            users: BTreeMap::new(),
        }
    }

    pub(crate) fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    /// Moves the dedup cursor past `update_id`.
    ///
    /// Returns `false` when the update was already consumed, in which case it
    /// must not be dispatched again.
    pub(crate) fn advance_offset(&mut self, update_id: UpdateId) -> bool {
        if update_id < self.offset {
            return false;
        }
        self.offset = update_id.saturating_add(1);
        true
    }

    pub(crate) fn username_of(&self, user_id: UserId) -> String {
        self.users
            .get(&user_id)
            .and_then(|user| user.username.clone())
            .unwrap_or_else(|| user_id.to_string())
    }
}

impl UserRecord {
    pub(crate) fn new(username: Option<String>, allowed: bool) -> Self {
        UserRecord {
            username,
            allowed,
            conversation_state: ConversationState::Idle,
            pending_file_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("state file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("state file {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("state file {} is corrupt", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o on state file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// JSON-file backed storage for [`BotState`].
#[derive(Clone, Debug)]
pub(crate) struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn load(&self) -> Result<BotState, StoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(self.path.clone()));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    pub(crate) fn save(&self, state: &BotState) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, &data).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes a fresh state for `owner_id`. Never overwrites an existing file.
    pub(crate) fn init(&self, owner_id: UserId) -> Result<BotState, StoreError> {
        if self.path.exists() {
            return Err(StoreError::AlreadyExists(self.path.clone()));
        }
        let state = BotState::new(owner_id);
        self.save(&state)?;
        info!("initialised state at {} for owner {}", self.path.display(), owner_id);
        Ok(state)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
