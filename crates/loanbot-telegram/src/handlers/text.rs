use std::sync::Arc;

use teloxide::prelude::*;

use loanbot_core::{
    domain::{ChatId, UserId},
    messaging::types::{parse_command, Command, IncomingUpdate, TextMessage},
};

use crate::router::AppState;

pub async fn handle_text(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let update = text_update(
        ChatId(msg.chat.id.0),
        msg.from().map(super::user_id),
        text,
    );
    super::dispatch(&state, update).await;
    Ok(())
}

/// Slash-prefixed text is a command, everything else free text.
fn text_update(chat_id: ChatId, user_id: Option<UserId>, text: &str) -> IncomingUpdate {
    match parse_command(text) {
        Some((name, args)) => IncomingUpdate::Command(Command {
            chat_id,
            user_id,
            name,
            args,
        }),
        None => IncomingUpdate::Text(TextMessage {
            chat_id,
            user_id,
            text: text.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_and_free_text_are_told_apart() {
        match text_update(ChatId(5), None, "/check@LoanBot 0912 345 678") {
            IncomingUpdate::Command(cmd) => {
                assert_eq!(cmd.name, "check");
                assert_eq!(cmd.args, "0912 345 678");
                assert_eq!(cmd.chat_id, ChatId(5));
            }
            other => panic!("expected a command, got {other:?}"),
        }

        match text_update(ChatId(5), Some(UserId(9)), "1,500") {
            IncomingUpdate::Text(t) => {
                assert_eq!(t.text, "1,500");
                assert_eq!(t.user_id, Some(UserId(9)));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }
}
