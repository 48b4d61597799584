use super::*;

use std::fs;

pub(super) fn parse_command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let cmd = first.trim_start_matches('/');
    Some(cmd.split('@').next().unwrap_or(cmd))
}

impl Command {
    pub(super) fn parse(text: &str) -> Option<Command> {
        let command = match parse_command(text)? {
            "start" => Command::Start,
            "ping" => Command::Ping,
            "shutdown" => Command::Shutdown,
            "reset" => Command::Reset,
            "save" => Command::Save,
            "desktop" => Command::Desktop,
            "cancel" => Command::Cancel,
            _ => return None,
        };
        Some(command)
    }

    pub(super) fn owner_only(self) -> bool {
        matches!(self, Command::Shutdown | Command::Reset)
    }
}

impl CallbackAction {
    pub(super) fn parse(data: &str) -> Result<CallbackAction> {
        let mut parts = data.split(':');
        let namespace = parts.next().unwrap_or("");
        let first = parts
            .next()
            .ok_or_else(|| anyhow!("callback payload {:?} has no fields", data))?;
        let second = parts
            .next()
            .ok_or_else(|| anyhow!("callback payload {:?} is missing a field", data))?;
        if parts.next().is_some() {
            return Err(anyhow!("callback payload {:?} has too many fields", data));
        }
        let user_id: UserId = second
            .parse()
            .with_context(|| format!("parse user id in {:?}", data))?;
        match namespace {
            "new_user" => {
                let decision = match first {
                    "allow" => NewUserDecision::Allow,
                    "ban" => NewUserDecision::Ban,
                    _ => NewUserDecision::Other,
                };
                Ok(CallbackAction::NewUser { decision, user_id })
            }
            "desktop" => {
                let monitor = first
                    .parse()
                    .with_context(|| format!("parse monitor in {:?}", data))?;
                Ok(CallbackAction::Desktop { monitor, user_id })
            }
            _ => Err(anyhow!("unknown callback namespace in {:?}", data)),
        }
    }

    pub(super) fn encode(&self) -> String {
        match self {
            CallbackAction::NewUser { decision, user_id } => {
                let action = match decision {
                    NewUserDecision::Allow => "allow",
                    NewUserDecision::Ban => "ban",
                    NewUserDecision::Other => "other",
                };
                format!("new_user:{}:{}", action, user_id)
            }
            CallbackAction::Desktop { monitor, user_id } => {
                format!("desktop:{}:{}", monitor, user_id)
            }
        }
    }
}

pub(super) fn build_approval_keyboard(user_id: UserId) -> Keyboard {
    let allow = CallbackAction::NewUser {
        decision: NewUserDecision::Allow,
        user_id,
    };
    let ban = CallbackAction::NewUser {
        decision: NewUserDecision::Ban,
        user_id,
    };
    vec![vec![
        Button::callback("allow", allow.encode()),
        Button::callback("ban", ban.encode()),
    ]]
}

pub(super) fn build_monitor_keyboard(monitors: &[MonitorChoice], user_id: UserId) -> Keyboard {
    let row = monitors
        .iter()
        .map(|choice| {
            let action = CallbackAction::Desktop {
                monitor: choice.index,
                user_id,
            };
            Button::callback(choice.label.clone(), action.encode())
        })
        .collect();
    vec![row]
}

pub(super) fn build_approval_text(sender: &Sender) -> String {
    format!(
        "New user needing confirmation\nID: {}\nFirst name: {}\nLast name: {}\nUsername: @{}",
        sender.id,
        sender.first_name,
        sender.last_name.as_deref().unwrap_or("-"),
        sender.username.as_deref().unwrap_or("-"),
    )
}

pub(super) fn is_accepted_mime(mime: &str) -> bool {
    ACCEPTED_MIME_TYPES.contains(&mime)
}

pub(super) fn unsupported_mime_text(mime: Option<&str>) -> String {
    format!(
        "mimetype {} unsupported.\nCurrently supported: {}",
        mime.unwrap_or("unknown"),
        ACCEPTED_MIME_TYPES.join(", ")
    )
}

pub(super) fn chat_id_from_user_id(user_id: UserId) -> i64 {
    user_id as i64
}

pub(super) fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

pub(super) fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}

pub(super) fn default_busctl_bin() -> PathBuf {
    PathBuf::from("busctl")
}

pub(super) fn default_wallpaper_plugin() -> String {
    "org.kde.image".to_string()
}

pub(super) fn default_monitors() -> Vec<MonitorChoice> {
    [("Left", 1), ("Primary", 0), ("Right", 2)]
        .into_iter()
        .map(|(label, index)| MonitorChoice {
            label: label.to_string(),
            index,
        })
        .collect()
}

pub(super) fn resolve_config_path(path: &Path, config_dir: &Path) -> PathBuf {
    if path.is_relative() {
        config_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

pub(super) fn read_token_file(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read token file {}", path.display()))?;
    let token = contents.trim().to_string();
    if token.is_empty() {
        return Err(anyhow!("token file {} is empty", path.display()));
    }
    Ok(token)
}

pub(super) fn resolve_token(input: TokenInput, config_dir: &Path) -> Result<String> {
    match input {
        TokenInput::Inline(raw) => {
            let token = raw.trim().to_string();
            if token.is_empty() {
                return Err(anyhow!("token is empty"));
            }
            Ok(token)
        }
        TokenInput::File { file } => read_token_file(&resolve_config_path(&file, config_dir)),
    }
}

pub(super) fn parse_config(contents: &str, config_dir: &Path) -> Result<Config> {
    let config_file: ConfigFile = toml::from_str(contents).context("parse config")?;
    let token = resolve_token(config_file.token, config_dir)?;
    let mut desktop = config_file.desktop;
    if desktop.monitors.is_empty() {
        return Err(anyhow!("desktop.monitors must list at least one monitor"));
    }
    if desktop.busctl_bin.components().count() > 1 {
        desktop.busctl_bin = resolve_config_path(&desktop.busctl_bin, config_dir);
    }
    Ok(Config {
        token,
        state_path: resolve_config_path(&config_file.state_path, config_dir),
        images_dir: resolve_config_path(&config_file.images_dir, config_dir),
        poll_timeout_seconds: config_file
            .poll_timeout_seconds
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
        idle_delay: Duration::from_millis(
            config_file.idle_delay_ms.unwrap_or(DEFAULT_IDLE_DELAY_MS),
        ),
        transport: config_file.transport,
        desktop,
    })
}

pub(super) fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&contents, config_dir)
}
