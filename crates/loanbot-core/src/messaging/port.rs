use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::InlineKeyboard,
    Result,
};

/// Outbound half of the chat platform boundary.
///
/// The conversation state machine only ever talks to the platform through this
/// trait; the Telegram adapter implements it over teloxide.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
