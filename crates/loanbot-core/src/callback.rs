//! Inline-button payloads.
//!
//! Wire format: `<action>[:<fields>]`. The action name is everything before the
//! first `:`. Single-id actions carry the id as the whole remainder. Two-id
//! actions length-prefix the first id (`<len>:<id1>:<id2>`) so either id may
//! itself contain `:`. A bare `<id1>:<id2>` is still accepted when the
//! prefixed reading fails and neither id contains `:`, which covers buttons
//! built by older releases. Telegram caps callback data at 64 bytes.

use std::fmt;

/// Telegram limit for `callback_data`.
pub const MAX_CALLBACK_DATA_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Eligibility { borrower_id: String },
    Provider { borrower_id: String, provider_id: String },
    Apply { borrower_id: String, product_id: String },
    Repay { borrower_id: String, loan_id: String },
    ActiveLoans { borrower_id: String },
    History { borrower_id: String },
    MainMenu,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallbackParseError {
    #[error("empty payload")]
    Empty,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("action {action:?} expects {expected} id(s)")]
    Arity {
        action: &'static str,
        expected: usize,
    },
    #[error("malformed length prefix")]
    BadLength,
}

const ELIGIBILITY: &str = "eligibility";
const PROVIDER: &str = "provider";
const APPLY: &str = "apply";
const REPAY: &str = "repay";
const ACTIVE_LOANS: &str = "active_loans";
const HISTORY: &str = "history";
const MAIN_MENU: &str = "main_menu";

impl CallbackAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eligibility { .. } => ELIGIBILITY,
            Self::Provider { .. } => PROVIDER,
            Self::Apply { .. } => APPLY,
            Self::Repay { .. } => REPAY,
            Self::ActiveLoans { .. } => ACTIVE_LOANS,
            Self::History { .. } => HISTORY,
            Self::MainMenu => MAIN_MENU,
        }
    }

    /// The borrower the button was rendered for, if the action carries one.
    pub fn borrower_id(&self) -> Option<&str> {
        match self {
            Self::Eligibility { borrower_id }
            | Self::Provider { borrower_id, .. }
            | Self::Apply { borrower_id, .. }
            | Self::Repay { borrower_id, .. }
            | Self::ActiveLoans { borrower_id }
            | Self::History { borrower_id } => Some(borrower_id),
            Self::MainMenu => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::MainMenu => MAIN_MENU.to_string(),
            Self::Eligibility { borrower_id }
            | Self::ActiveLoans { borrower_id }
            | Self::History { borrower_id } => format!("{}:{borrower_id}", self.name()),
            Self::Provider {
                borrower_id,
                provider_id: second,
            }
            | Self::Apply {
                borrower_id,
                product_id: second,
            }
            | Self::Repay {
                borrower_id,
                loan_id: second,
            } => format!("{}:{}:{borrower_id}:{second}", self.name(), borrower_id.len()),
        }
    }

    pub fn parse(data: &str) -> Result<Self, CallbackParseError> {
        if data.is_empty() {
            return Err(CallbackParseError::Empty);
        }
        let (action, rest) = match data.split_once(':') {
            Some((a, r)) => (a, Some(r)),
            None => (data, None),
        };

        match action {
            MAIN_MENU => match rest {
                None => Ok(Self::MainMenu),
                Some(_) => Err(CallbackParseError::Arity {
                    action: MAIN_MENU,
                    expected: 0,
                }),
            },
            ELIGIBILITY => one(ELIGIBILITY, rest).map(|borrower_id| Self::Eligibility { borrower_id }),
            ACTIVE_LOANS => one(ACTIVE_LOANS, rest).map(|borrower_id| Self::ActiveLoans { borrower_id }),
            HISTORY => one(HISTORY, rest).map(|borrower_id| Self::History { borrower_id }),
            PROVIDER => two(PROVIDER, rest).map(|(borrower_id, provider_id)| Self::Provider {
                borrower_id,
                provider_id,
            }),
            APPLY => two(APPLY, rest).map(|(borrower_id, product_id)| Self::Apply {
                borrower_id,
                product_id,
            }),
            REPAY => two(REPAY, rest).map(|(borrower_id, loan_id)| Self::Repay {
                borrower_id,
                loan_id,
            }),
            other => Err(CallbackParseError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn one(action: &'static str, rest: Option<&str>) -> Result<String, CallbackParseError> {
    match rest {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(CallbackParseError::Arity {
            action,
            expected: 1,
        }),
    }
}

fn two(action: &'static str, rest: Option<&str>) -> Result<(String, String), CallbackParseError> {
    let arity = CallbackParseError::Arity {
        action,
        expected: 2,
    };
    let rest = rest.ok_or_else(|| arity.clone())?;
    match prefixed(rest, &arity) {
        Ok(pair) => Ok(pair),
        Err(e) => bare(rest).ok_or(e),
    }
}

fn prefixed(
    rest: &str,
    arity: &CallbackParseError,
) -> Result<(String, String), CallbackParseError> {
    let (len, tail) = rest.split_once(':').ok_or_else(|| arity.clone())?;
    let len: usize = len.parse().map_err(|_| CallbackParseError::BadLength)?;

    let first = tail.get(..len).ok_or(CallbackParseError::BadLength)?;
    let second = tail
        .get(len..)
        .and_then(|s| s.strip_prefix(':'))
        .ok_or(CallbackParseError::BadLength)?;

    if first.is_empty() || second.is_empty() {
        return Err(arity.clone());
    }
    Ok((first.to_string(), second.to_string()))
}

/// `<id1>:<id2>` with exactly one separator and no length prefix.
fn bare(rest: &str) -> Option<(String, String)> {
    let (first, second) = rest.split_once(':')?;
    if first.is_empty() || second.is_empty() || second.contains(':') {
        return None;
    }
    Some((first.to_string(), second.to_string()))
}
