//! Rendering helpers for Telegram HTML messages.

use chrono::{DateTime, Utc};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `1234.5` -> `1,234.50`. Rounds to cents.
pub fn format_amount(value: f64) -> String {
    if !value.is_finite() {
        return "0.00".to_string();
    }
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}{grouped}.{frac:02}")
}

/// Amount with currency label, e.g. `1,000.00 ETB`.
pub fn format_money(value: f64, currency: &str) -> String {
    format!("{} {}", format_amount(value), escape_html(currency))
}

/// Calendar date, or `unknown` when the backend sent none.
pub fn format_date(date: Option<&DateTime<Utc>>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Trim a string to `max_chars` characters, appending `...` when cut.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(format_amount(0.0), "0.00");
        assert_eq!(format_amount(999.999), "1,000.00");
        assert_eq!(format_amount(1234567.5), "1,234,567.50");
        assert_eq!(format_amount(-250.0), "-250.00");
        assert_eq!(format_money(1000.0, "ETB"), "1,000.00 ETB");
    }

    #[test]
    fn formats_dates() {
        let d = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(format_date(Some(&d)), "2024-03-09");
        assert_eq!(format_date(None), "unknown");
    }

    #[test]
    fn truncate_text_adds_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
