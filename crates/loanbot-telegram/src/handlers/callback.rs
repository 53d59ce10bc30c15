use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, warn};

use loanbot_core::{
    domain::ChatId,
    messaging::types::{CallbackQuery as CoreCallback, IncomingUpdate},
};

use crate::router::AppState;

pub async fn handle_callback(q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    // Inline-mode queries carry no message and so no chat to route to.
    let Some(chat_id) = q.message.as_ref().map(|m| m.chat.id) else {
        debug!(callback_id = %q.id, "callback without a chat, acknowledging only");
        if let Err(e) = state.messenger.answer_callback_query(&q.id, None).await {
            warn!(error = %e, "failed to acknowledge callback");
        }
        return Ok(());
    };

    let update = IncomingUpdate::Callback(CoreCallback {
        chat_id: ChatId(chat_id.0),
        user_id: Some(super::user_id(&q.from)),
        callback_id: q.id,
        data: q.data.unwrap_or_default(),
    });
    super::dispatch(&state, update).await;
    Ok(())
}
