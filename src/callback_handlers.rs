use super::*;

use log::debug;

use crate::message_handlers::set_conversation;

pub(super) async fn handle_callback<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    q: CallbackEvent,
) -> HandlerResult {
    let result = route_callback(app, state, &q).await;
    if let Err(err) = app.transport.answer_callback(&q.id).await {
        warn!("answering callback {} failed: {}", q.id, err);
    }
    result
}

async fn route_callback<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    q: &CallbackEvent,
) -> HandlerResult {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let action = match CallbackAction::parse(data) {
        Ok(action) => action,
        Err(err) => {
            warn!("ignoring callback from {}: {:#}", q.sender.id, err);
            return Ok(());
        }
    };

    match action {
        CallbackAction::NewUser { decision, user_id } => {
            if !state.is_owner(q.sender.id) {
                warn!("user {} tried to decide on user {}", q.sender.id, user_id);
                return Ok(());
            }
            match decision {
                NewUserDecision::Allow => approve_user(app, state, q, user_id).await,
                NewUserDecision::Ban | NewUserDecision::Other => {
                    debug!("leaving user {} unapproved ({:?})", user_id, decision);
                    Ok(())
                }
            }
        }
        CallbackAction::Desktop { monitor, user_id } => {
            if q.sender.id != user_id && !state.is_owner(q.sender.id) {
                warn!("user {} pressed a monitor button for {}", q.sender.id, user_id);
                return Ok(());
            }
            match apply_desktop(app, state, q, monitor, user_id).await {
                Err(BotError::MissingFile { user_id }) => {
                    info!("no pending image for {}", user_id);
                    app.transport
                        .send_text(
                            chat_id_from_user_id(q.sender.id),
                            "No image is waiting; send /desktop first.",
                        )
                        .await?;
                    Ok(())
                }
                other => other,
            }
        }
    }
}

async fn approve_user<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    q: &CallbackEvent,
    user_id: UserId,
) -> HandlerResult {
    let Some(user) = state.users.get_mut(&user_id) else {
        warn!("approval for unknown user {}", user_id);
        return Ok(());
    };
    if user.allowed {
        debug!("user {} already approved", user_id);
        return Ok(());
    }
    user.allowed = true;
    app.checkpoint(state);
    info!("user {} approved", user_id);

    let username = state.username_of(user_id);
    app.transport
        .send_text(
            chat_id_from_user_id(state.owner_id),
            &format!("Confirmed @{}!", username),
        )
        .await?;
    app.transport
        .send_text(chat_id_from_user_id(user_id), "You've been confirmed.")
        .await?;
    if let Some(origin) = &q.origin {
        app.transport.clear_keyboard(origin).await?;
    }
    app.transport
        .set_commands(chat_id_from_user_id(user_id), USER_COMMANDS)
        .await?;
    Ok(())
}

fn pending_file(state: &BotState, user_id: UserId) -> HandlerResult<String> {
    state
        .users
        .get(&user_id)
        .and_then(|user| user.pending_file_id.clone())
        .ok_or(BotError::MissingFile { user_id })
}

async fn apply_desktop<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    q: &CallbackEvent,
    monitor: u32,
    user_id: UserId,
) -> HandlerResult {
    let file_id = pending_file(state, user_id)?;
    let user_chat = chat_id_from_user_id(user_id);

    let remote_path = app.transport.file_path(&file_id).await?;
    let local_path = app.config.images_dir.join(&file_id);
    app.transport.download(&remote_path, &local_path).await?;

    if let Err(err) = app.applier.apply(&local_path, monitor).await {
        error!("setting desktop for {} failed: {}", user_id, err);
        app.transport
            .send_text(user_chat, "Setting the desktop failed.")
            .await?;
        return Err(err.into());
    }

    if let Some(user) = state.users.get_mut(&user_id) {
        user.pending_file_id = None;
    }
    set_conversation(state, user_id, ConversationState::Idle);
    app.checkpoint(state);
    info!("desktop {} set by {}", monitor, user_id);

    if let Some(origin) = &q.origin {
        app.transport.clear_keyboard(origin).await?;
    }
    app.transport
        .send_document(
            chat_id_from_user_id(state.owner_id),
            &file_id,
            &format!("New desktop set by @{}", state.username_of(user_id)),
        )
        .await?;
    app.transport.send_text(user_chat, "Desktop set!").await?;
    Ok(())
}
