use super::*;

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum GateOutcome {
    /// The sender is an approved user; hand the message to the conversation.
    Pass,
    /// The message was handled (or dropped) here.
    Consumed,
}

/// Decides what happens to a message before any command dispatch.
pub(super) async fn authorize<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    msg: &IncomingMessage,
) -> HandlerResult<GateOutcome> {
    let sender = &msg.sender;

    if let Some(user) = state.users.get(&sender.id) {
        if !user.allowed {
            debug!("dropping message from unapproved user {}", sender.id);
            return Ok(GateOutcome::Consumed);
        }
        return Ok(GateOutcome::Pass);
    }

    if state.is_owner(sender.id) {
        welcome_owner(app, state, sender).await?;
        return Ok(GateOutcome::Consumed);
    }

    let is_start = matches!(
        &msg.content,
        Content::Text(text) if Command::parse(text) == Some(Command::Start)
    );
    if !is_start {
        debug!("ignoring first message from unknown user {}", sender.id);
        return Ok(GateOutcome::Consumed);
    }

    register_new_user(app, state, sender).await?;
    Ok(GateOutcome::Consumed)
}

async fn welcome_owner<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    sender: &Sender,
) -> HandlerResult {
    info!("owner's first message, adding {} as allowed", sender.id);
    state
        .users
        .insert(sender.id, UserRecord::new(sender.username.clone(), true));
    app.checkpoint(state);

    let chat_id = chat_id_from_user_id(sender.id);
    app.transport
        .send_text(chat_id, "Hello owner!\nAdded to allowed users.")
        .await?;
    app.transport.set_commands(chat_id, OWNER_COMMANDS).await?;
    Ok(())
}

async fn register_new_user<T: Transport, D: DesktopApplier>(
    app: &AppContext<T, D>,
    state: &mut BotState,
    sender: &Sender,
) -> HandlerResult {
    let chat_id = chat_id_from_user_id(sender.id);
    if sender.username.is_none() {
        info!("new user {} has no username", sender.id);
        app.transport
            .send_text(chat_id, "Users without a username are unsupported.")
            .await?;
        return Ok(());
    }

    info!("new user {}, awaiting owner approval", sender.id);
    state
        .users
        .insert(sender.id, UserRecord::new(sender.username.clone(), false));
    app.checkpoint(state);

    app.transport
        .send_text(
            chat_id,
            "Hello new user!\nPlease wait until my owner confirms you.",
        )
        .await?;
    app.transport
        .send_keyboard(
            chat_id_from_user_id(state.owner_id),
            &build_approval_text(sender),
            &build_approval_keyboard(sender.id),
        )
        .await?;
    Ok(())
}
