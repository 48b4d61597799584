use super::*;

use log::debug;

use crate::gate::{authorize, GateOutcome};

pub(super) async fn handle_message<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    msg: IncomingMessage,
) -> HandlerResult {
    if authorize(app, state, &msg).await? == GateOutcome::Consumed {
        return Ok(());
    }

    let conversation = match state.users.get(&msg.sender.id) {
        Some(user) => user.conversation_state,
        None => return Ok(()),
    };

    match conversation {
        ConversationState::Idle => {
            if let Content::Text(text) = &msg.content {
                handle_command(app, state, &msg.sender, text).await?;
            }
        }
        ConversationState::AwaitingImage => handle_image_intake(app, state, &msg).await?,
        ConversationState::AwaitingMonitor => handle_pending_monitor(app, state, &msg).await?,
    }
    Ok(())
}

async fn handle_command<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    sender: &Sender,
    text: &str,
) -> HandlerResult {
    let Some(command) = Command::parse(text) else {
        debug!("ignoring text from {} while idle", sender.id);
        return Ok(());
    };
    if command.owner_only() && !state.is_owner(sender.id) {
        debug!("user {} tried owner command {:?}", sender.id, command);
        return Ok(());
    }

    let chat_id = chat_id_from_user_id(sender.id);
    match command {
        Command::Start => {
            app.transport
                .send_text(chat_id, "You're already confirmed :3")
                .await?;
        }
        Command::Ping => {
            app.transport.send_text(chat_id, "Pong!").await?;
        }
        Command::Shutdown => {
            info!("shutdown requested by owner");
            app.transport.send_text(chat_id, "Shutting down...").await?;
            app.shutdown.trigger();
        }
        Command::Desktop => {
            set_conversation(state, sender.id, ConversationState::AwaitingImage);
            app.checkpoint(state);
            app.transport
                .send_text(
                    chat_id,
                    "Okay!\nPlease send me the image file to set as desktop.\nalternatively /cancel to stop.",
                )
                .await?;
        }
        Command::Reset => {
            info!("resetting users");
            state.users.clear();
            app.checkpoint(state);
            app.transport.send_text(chat_id, "State reset").await?;
        }
        Command::Save => {
            let reply = if app.checkpoint(state) {
                "State saved"
            } else {
                "Saving state failed."
            };
            app.transport.send_text(chat_id, reply).await?;
        }
        Command::Cancel => {
            debug!("nothing to cancel for {}", sender.id);
        }
    }
    Ok(())
}

async fn handle_image_intake<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    msg: &IncomingMessage,
) -> HandlerResult {
    let sender_id = msg.sender.id;
    let chat_id = chat_id_from_user_id(sender_id);

    match &msg.content {
        Content::Text(text) if Command::parse(text) == Some(Command::Cancel) => {
            cancel_upload(app, state, sender_id).await?;
        }
        Content::Photo => {
            app.transport
                .send_text(chat_id, "Please send the image uncompressed.")
                .await?;
        }
        Content::Document { file_id, mime_type } => {
            let mime = mime_type.as_deref();
            if !mime.map(is_accepted_mime).unwrap_or(false) {
                info!("rejecting {:?} from {}", mime, sender_id);
                app.transport
                    .send_text(chat_id, &unsupported_mime_text(mime))
                    .await?;
                return Ok(());
            }

            if let Some(user) = state.users.get_mut(&sender_id) {
                user.pending_file_id = Some(file_id.clone());
                user.conversation_state = ConversationState::AwaitingMonitor;
            }
            app.checkpoint(state);
            app.transport
                .send_keyboard(
                    chat_id,
                    "Great!\nNow, which monitor should it apply to?",
                    &build_monitor_keyboard(&app.config.desktop.monitors, sender_id),
                )
                .await?;
        }
        Content::Text(_) | Content::Other => {
            app.transport
                .send_text(
                    chat_id,
                    "Send the image as a file, or /cancel to stop.",
                )
                .await?;
        }
    }
    Ok(())
}

async fn handle_pending_monitor<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    msg: &IncomingMessage,
) -> HandlerResult {
    let sender_id = msg.sender.id;
    if let Content::Text(text) = &msg.content {
        if Command::parse(text) == Some(Command::Cancel) {
            return cancel_upload(app, state, sender_id).await;
        }
    }
    app.transport
        .send_text(
            chat_id_from_user_id(sender_id),
            "Pick a monitor on the message above, or /cancel to start over.",
        )
        .await?;
    Ok(())
}

async fn cancel_upload<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    user_id: UserId,
) -> HandlerResult {
    if let Some(user) = state.users.get_mut(&user_id) {
        user.pending_file_id = None;
        user.conversation_state = ConversationState::Idle;
    }
    app.checkpoint(state);
    app.transport
        .send_text(chat_id_from_user_id(user_id), "Cancelling...")
        .await?;
    Ok(())
}

pub(super) fn set_conversation(state: &mut BotState, user_id: UserId, next: ConversationState) {
    if let Some(user) = state.users.get_mut(&user_id) {
        debug!(
            "user {} conversation {:?} -> {:?}",
            user_id, user.conversation_state, next
        );
        user.conversation_state = next;
    }
}
