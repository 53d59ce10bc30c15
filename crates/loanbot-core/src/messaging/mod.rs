//! Chat platform abstractions (Telegram today, other messengers behind the same port).

pub mod port;
pub mod types;
