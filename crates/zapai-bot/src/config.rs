// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration from environment variables.
//!
//! The bot is deployed as a container/daemon, so configuration is
//! environment-only.  Three keys are required — the identity key, the AI
//! credential, the relay list — everything else has production defaults.
//!
//! ```text
//! BOT_PRIVATE_KEY=nsec1...         # or 64-char hex
//! GEMINI_API_KEY=...               # or GOOGLE_GENERATIVE_AI_API_KEY
//! NOSTR_RELAYS=wss://a,wss://b
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Clone)]
pub struct Config {
    /// Bot secret key, hex or `nsec1…` (`BOT_PRIVATE_KEY`).
    pub private_key: String,
    /// AI credential (`GEMINI_API_KEY`, fallback `GOOGLE_GENERATIVE_AI_API_KEY`).
    pub gemini_api_key: String,
    pub gemini_model: String,
    /// Endpoint override, for proxies and tests (`GEMINI_BASE_URL`).
    pub gemini_base_url: Option<String>,
    /// Relay URLs (`NOSTR_RELAYS`, comma-separated).
    pub relays: Vec<String>,

    pub bot_name: String,
    pub response_delay: Duration,

    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,

    pub rate_limit_max_tokens: f64,
    pub rate_limit_refill_rate: f64,

    pub metadata_cache_ttl: Duration,
    pub metadata_fast_timeout: Duration,

    pub chat_session_reuse: bool,
    pub chat_session_ttl: Duration,
    pub max_chat_sessions: usize,
    pub enable_memory_summary: bool,
    pub memory_summary_min_messages: usize,

    pub web_port: u16,
    pub dashboard_password: Option<String>,

    pub relay_publish_timeout: Duration,

    /// Directory for the embedded store (`BOT_DATA_DIR`).
    pub data_dir: PathBuf,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function.  Tests pass a map so they
    /// never touch (or race on) the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let private_key = get("BOT_PRIVATE_KEY").context("BOT_PRIVATE_KEY is required")?;

        let gemini_api_key = get("GEMINI_API_KEY")
            .or_else(|| get("GOOGLE_GENERATIVE_AI_API_KEY"))
            .context("GEMINI_API_KEY or GOOGLE_GENERATIVE_AI_API_KEY is required")?;

        let relays: Vec<String> = get("NOSTR_RELAYS")
            .context("NOSTR_RELAYS is required")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if relays.is_empty() {
            bail!("NOSTR_RELAYS must contain at least one relay URL");
        }

        Ok(Self {
            private_key,
            gemini_api_key,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.0-flash".into()),
            gemini_base_url: get("GEMINI_BASE_URL"),
            relays,
            bot_name: get("BOT_NAME").unwrap_or_else(|| "ZapAI".into()),
            response_delay: millis(&get, "BOT_RESPONSE_DELAY", 0)?,
            max_concurrent: parsed(&get, "MAX_CONCURRENT", 10)?,
            max_queue_size: parsed(&get, "MAX_QUEUE_SIZE", 10_000)?,
            queue_timeout: millis(&get, "QUEUE_TIMEOUT", 60_000)?,
            rate_limit_max_tokens: parsed(&get, "RATE_LIMIT_MAX_TOKENS", 50.0)?,
            rate_limit_refill_rate: parsed(&get, "RATE_LIMIT_REFILL_RATE", 5.0)?,
            metadata_cache_ttl: millis(&get, "USER_METADATA_CACHE_TTL_MS", 21_600_000)?,
            metadata_fast_timeout: millis(&get, "USER_METADATA_FAST_TIMEOUT_MS", 300)?,
            chat_session_reuse: flag(&get, "ENABLE_CHAT_SESSION_REUSE", true)?,
            chat_session_ttl: millis(&get, "CHAT_SESSION_TTL_MS", 1_800_000)?,
            max_chat_sessions: parsed(&get, "MAX_CHAT_SESSIONS", 5000)?,
            enable_memory_summary: flag(&get, "ENABLE_MEMORY_SUMMARY", false)?,
            memory_summary_min_messages: parsed(&get, "MEMORY_SUMMARY_MIN_MESSAGES", 16)?,
            web_port: parsed(&get, "WEB_PORT", 3000)?,
            dashboard_password: get("DASHBOARD_PASSWORD").filter(|s| !s.is_empty()),
            relay_publish_timeout: millis(&get, "RELAY_PUBLISH_TIMEOUT_MS", 8000)?,
            data_dir: get("BOT_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "zapai-data".into()),
        })
    }
}

fn parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default_ms: u64,
) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(parsed(get, key, default_ms)?))
}

fn flag(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match get(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => bail!("invalid {key}={other:?}: expected true/false"),
        },
        None => Ok(default),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("BOT_PRIVATE_KEY".into(), "ab".repeat(32)),
            ("GEMINI_API_KEY".into(), "test-key".into()),
            ("NOSTR_RELAYS".into(), "wss://a, wss://b".into()),
        ])
    }

    fn load(vars: HashMap<String, String>) -> anyhow::Result<Config> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load(base_vars()).unwrap();
        assert_eq!(config.relays, vec!["wss://a", "wss://b"]);
        assert_eq!(config.bot_name, "ZapAI");
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.queue_timeout, Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_tokens, 50.0);
        assert_eq!(config.rate_limit_refill_rate, 5.0);
        assert_eq!(config.metadata_cache_ttl, Duration::from_secs(6 * 3600));
        assert_eq!(config.metadata_fast_timeout, Duration::from_millis(300));
        assert!(config.chat_session_reuse);
        assert_eq!(config.chat_session_ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.max_chat_sessions, 5000);
        assert!(!config.enable_memory_summary);
        assert_eq!(config.web_port, 3000);
        assert!(config.dashboard_password.is_none());
        assert_eq!(config.relay_publish_timeout, Duration::from_secs(8));
    }

    #[test]
    fn missing_private_key_is_an_error() {
        let mut vars = base_vars();
        vars.remove("BOT_PRIVATE_KEY");
        let err = load(vars).unwrap_err().to_string();
        assert!(err.contains("BOT_PRIVATE_KEY"));
    }

    #[test]
    fn google_env_alias_works_for_the_ai_key() {
        let mut vars = base_vars();
        vars.remove("GEMINI_API_KEY");
        vars.insert("GOOGLE_GENERATIVE_AI_API_KEY".into(), "alias-key".into());
        let config = load(vars).unwrap();
        assert_eq!(config.gemini_api_key, "alias-key");
    }

    #[test]
    fn empty_relay_list_is_an_error() {
        let mut vars = base_vars();
        vars.insert("NOSTR_RELAYS".into(), " , ".into());
        assert!(load(vars).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = base_vars();
        vars.insert("MAX_CONCURRENT".into(), "3".into());
        vars.insert("ENABLE_MEMORY_SUMMARY".into(), "true".into());
        vars.insert("ENABLE_CHAT_SESSION_REUSE".into(), "false".into());
        vars.insert("BOT_RESPONSE_DELAY".into(), "250".into());
        let config = load(vars).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert!(config.enable_memory_summary);
        assert!(!config.chat_session_reuse);
        assert_eq!(config.response_delay, Duration::from_millis(250));
    }

    #[test]
    fn garbage_numbers_are_rejected_with_the_key_name() {
        let mut vars = base_vars();
        vars.insert("MAX_QUEUE_SIZE".into(), "lots".into());
        let err = load(vars).unwrap_err().to_string();
        assert!(err.contains("MAX_QUEUE_SIZE"));
    }

    #[test]
    fn blank_dashboard_password_disables_auth() {
        let mut vars = base_vars();
        vars.insert("DASHBOARD_PASSWORD".into(), "".into());
        let config = load(vars).unwrap();
        assert!(config.dashboard_password.is_none());
    }
}
