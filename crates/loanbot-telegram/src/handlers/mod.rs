//! Telegram update handlers.
//!
//! Each handler translates a teloxide update into an [`IncomingUpdate`] and
//! hands it to the conversation state machine. Handler errors are logged and
//! swallowed so one bad update never stops the dispatcher.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};
use tracing::{debug, error};

use loanbot_core::{domain::UserId, messaging::types::IncomingUpdate};

use crate::router::AppState;

mod callback;
mod text;

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    callback::handle_callback(q, state).await
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.text().is_some() {
        return text::handle_text(msg, state).await;
    }

    debug!(chat_id = msg.chat.id.0, "ignoring non-text message");
    Ok(())
}

fn user_id(user: &teloxide::types::User) -> UserId {
    UserId(user.id.0 as i64)
}

async fn dispatch(state: &AppState, update: IncomingUpdate) {
    let chat_id = update.chat_id();
    let kind = update.kind();
    if let Err(e) = state.conversation.handle(update).await {
        error!(chat_id = chat_id.0, event = kind, error = %e, "failed to handle update");
    }
}
