//! Core of the loan-servicing chat bot.
//!
//! This crate is framework-agnostic. Telegram and the loan backend live behind
//! ports (traits) implemented in adapter crates.

pub mod api;
pub mod callback;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod session;
pub mod utils;

pub use errors::{Error, Result};
