use crate::domain::{ChatId, UserId};

/// Platform-agnostic inbound update.
///
/// Telegram-specific fields stay in the Telegram adapter.
#[derive(Clone, Debug)]
pub enum IncomingUpdate {
    Command(Command),
    Text(TextMessage),
    Callback(CallbackQuery),
}

impl IncomingUpdate {
    pub fn chat_id(&self) -> ChatId {
        match self {
            Self::Command(c) => c.chat_id,
            Self::Text(t) => t.chat_id,
            Self::Callback(q) => q.chat_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Text(_) => "text",
            Self::Callback(_) => "callback",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    /// Lowercased command name without the leading `/` or `@botname` suffix.
    pub name: String,
    pub args: String,
}

#[derive(Clone, Debug)]
pub struct TextMessage {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub callback_id: String,
    pub data: String,
}

/// Split `/cmd@botname arg1 ...` into `("cmd", "arg1 ...")`.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    Some((cmd, rest))
}

/// Inline keyboard, laid out as rows of buttons.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

impl InlineKeyboard {
    /// Convenience for "one button per row" layouts.
    pub fn one_per_row(buttons: impl IntoIterator<Item = InlineButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }

    pub fn push_row(&mut self, button: InlineButton) {
        self.rows.push(vec![button]);
    }

    pub fn buttons(&self) -> impl Iterator<Item = &InlineButton> {
        self.rows.iter().flatten()
    }

    pub fn button_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }
}
