use std::sync::OnceLock;

use regex::Regex;

use crate::{errors::Error, Result};

/// Digits the backend keys borrowers on.
pub const PHONE_DIGITS: usize = 9;
const PHONE_MAX_DIGITS: usize = 15;

fn phone_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Optional leading `+`, then digits with common visual separators.
    RE.get_or_init(|| Regex::new(r"^\+?[0-9 ().\-]+$").expect("valid regex"))
}

/// Normalize user-typed phone input to the last 9 digits.
///
/// Accepts `+251 912-345-678`, `0912345678`, `912345678`. Rejects anything
/// with letters or fewer than 9 / more than 15 digits.
pub fn normalize_phone(input: &str) -> Result<String> {
    let input = input.trim();
    if !phone_shape().is_match(input) {
        return Err(Error::Validation(
            "Please send your phone number using digits only, e.g. 912345678.".to_string(),
        ));
    }

    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < PHONE_DIGITS || digits.len() > PHONE_MAX_DIGITS {
        return Err(Error::Validation(format!(
            "A phone number needs at least {PHONE_DIGITS} digits, e.g. 912345678."
        )));
    }

    Ok(digits[digits.len() - PHONE_DIGITS..].to_string())
}

/// Parse a user-typed amount. Grouping characters are stripped first.
pub fn parse_amount(input: &str) -> Result<f64> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | '\'' | ' ' | '\u{a0}' | '\u{202f}'))
        .collect();

    let invalid = || {
        Error::Validation(
            "Please enter a valid amount greater than zero, e.g. 1,000.".to_string(),
        )
    };

    // Reject spellings like `inf`/`nan` that `f64::from_str` would accept.
    let numeric = |c: char| c.is_ascii_digit() || matches!(c, '.' | '-' | '+');
    if cleaned.is_empty() || !cleaned.chars().all(numeric) {
        return Err(invalid());
    }

    let value: f64 = cleaned.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid());
    }
    Ok(value)
}
