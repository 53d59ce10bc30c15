use std::{env, fs, net::SocketAddr, ops::RangeInclusive, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Accepted loan terms, in days.
pub const LOAN_TERM_DAYS_RANGE: RangeInclusive<i64> = 1..=3650;

/// How Telegram updates reach the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    LongPolling,
    Webhook { url: String, listen_addr: SocketAddr },
}

/// Typed configuration for the loan bot.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub delivery: DeliveryMode,

    // Loan backend
    pub api_base_url: String,
    pub api_timeout: Duration,

    // Sessions
    pub session_idle_timeout: Option<Duration>,
    pub session_sweep_interval: Duration,

    // Rendering / business constants
    pub history_limit: usize,
    pub loan_term_days: i64,
    pub currency: String,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_vars(env_str)
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let delivery = match get("TELEGRAM_WEBHOOK_URL").and_then(non_empty) {
            None => DeliveryMode::LongPolling,
            Some(url) => {
                let raw_addr =
                    get("TELEGRAM_WEBHOOK_ADDR").unwrap_or_else(|| "0.0.0.0:8443".to_string());
                let listen_addr = raw_addr.trim().parse::<SocketAddr>().map_err(|e| {
                    Error::Config(format!("invalid TELEGRAM_WEBHOOK_ADDR {raw_addr:?}: {e}"))
                })?;
                DeliveryMode::Webhook { url, listen_addr }
            }
        };

        let api_base_url = get("LOAN_API_BASE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "http://localhost:3000/api".to_string())
            .trim_end_matches('/')
            .to_string();
        let api_timeout = Duration::from_millis(parse_u64(&get, "LOAN_API_TIMEOUT_MS").unwrap_or(8_000));

        // 0 disables eviction.
        let idle_secs = parse_u64(&get, "SESSION_IDLE_TIMEOUT_SECS").unwrap_or(1_800);
        let session_idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));
        let session_sweep_interval =
            Duration::from_secs(parse_u64(&get, "SESSION_SWEEP_INTERVAL_SECS").unwrap_or(60).max(1));

        let history_limit = parse_u64(&get, "HISTORY_LIMIT").unwrap_or(10).max(1) as usize;
        let loan_term_days = match get("LOAN_TERM_DAYS").and_then(non_empty) {
            None => 30,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|d| LOAN_TERM_DAYS_RANGE.contains(d))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "LOAN_TERM_DAYS must be a whole number of days in {}..={}, got {raw:?}",
                        LOAN_TERM_DAYS_RANGE.start(),
                        LOAN_TERM_DAYS_RANGE.end()
                    ))
                })?,
        };
        let currency = get("CURRENCY")
            .and_then(non_empty)
            .unwrap_or_else(|| "ETB".to_string());

        Ok(Self {
            telegram_bot_token,
            delivery,
            api_base_url,
            api_timeout,
            session_idle_timeout,
            session_sweep_interval,
            history_limit,
            loan_term_days,
            currency,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    get(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|k| vars.get(k).cloned())
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = cfg_from(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = cfg_from(&[("TELEGRAM_BOT_TOKEN", "   ")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_apply() {
        let cfg = cfg_from(&[("TELEGRAM_BOT_TOKEN", "t")]).unwrap();
        assert_eq!(cfg.delivery, DeliveryMode::LongPolling);
        assert_eq!(cfg.api_base_url, "http://localhost:3000/api");
        assert_eq!(cfg.api_timeout, Duration::from_secs(8));
        assert_eq!(cfg.session_idle_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(cfg.history_limit, 10);
        assert_eq!(cfg.loan_term_days, 30);
        assert_eq!(cfg.currency, "ETB");
    }

    #[test]
    fn webhook_mode_and_overrides() {
        let cfg = cfg_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_WEBHOOK_URL", "https://bot.example.com/hook"),
            ("TELEGRAM_WEBHOOK_ADDR", "127.0.0.1:9000"),
            ("LOAN_API_BASE_URL", "https://loans.example.com/api/"),
            ("SESSION_IDLE_TIMEOUT_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(
            cfg.delivery,
            DeliveryMode::Webhook {
                url: "https://bot.example.com/hook".to_string(),
                listen_addr: "127.0.0.1:9000".parse().unwrap(),
            }
        );
        assert_eq!(cfg.api_base_url, "https://loans.example.com/api");
        assert_eq!(cfg.session_idle_timeout, None);
    }

    #[test]
    fn loan_term_must_be_in_range() {
        let cfg = cfg_from(&[("TELEGRAM_BOT_TOKEN", "t"), ("LOAN_TERM_DAYS", "90")]).unwrap();
        assert_eq!(cfg.loan_term_days, 90);

        for bad in ["0", "-7", "3651", "200000000000", "thirty"] {
            let err = cfg_from(&[("TELEGRAM_BOT_TOKEN", "t"), ("LOAN_TERM_DAYS", bad)]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad:?} was accepted");
        }
    }

    #[test]
    fn bad_webhook_addr_is_rejected() {
        let err = cfg_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_WEBHOOK_URL", "https://bot.example.com/hook"),
            ("TELEGRAM_WEBHOOK_ADDR", "not-an-addr"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
