//! Runtime configuration read from the environment (and `.env`, if present).
use crate::escalation::EscalationPolicy;
use crate::notify::RetryPolicy;
use crate::types::UserId;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub sweep_interval: Duration,
    /// JSON company directory. Without one the directory starts empty.
    pub directory_file: Option<PathBuf>,
    pub escalation: EscalationPolicy,
    pub retry: RetryPolicy,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("approval.db"),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            sweep_interval: Duration::from_secs(300),
            directory_file: None,
            escalation: EscalationPolicy::default(),
            retry: RetryPolicy::default(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("APPROVAL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup("APPROVAL_LISTEN_ADDR") {
            config.listen_addr = addr
                .parse()
                .with_context(|| format!("invalid APPROVAL_LISTEN_ADDR '{}'", addr))?;
        }
        if let Some(secs) = lookup("APPROVAL_SWEEP_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid APPROVAL_SWEEP_INTERVAL_SECS '{}'", secs))?;
            anyhow::ensure!(secs > 0, "APPROVAL_SWEEP_INTERVAL_SECS must be positive");
            config.sweep_interval = Duration::from_secs(secs);
        }
        config.directory_file = lookup("APPROVAL_DIRECTORY_FILE").map(PathBuf::from);

        if let Some(list) = lookup("APPROVAL_ESCALATE_TO") {
            config.escalation.escalate_to = parse_user_list(&list)?;
        }
        if let Some(flag) = lookup("APPROVAL_ESCALATE_TO_ADMINS") {
            config.escalation.notify_company_admins = parse_flag("APPROVAL_ESCALATE_TO_ADMINS", &flag)?;
        }
        if let Some(attempts) = lookup("APPROVAL_NOTIFY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts
                .parse()
                .with_context(|| format!("invalid APPROVAL_NOTIFY_MAX_ATTEMPTS '{}'", attempts))?;
        }
        if let Some(ms) = lookup("APPROVAL_NOTIFY_BACKOFF_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("invalid APPROVAL_NOTIFY_BACKOFF_MS '{}'", ms))?;
            config.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup("APPROVAL_LOG_JSON") {
            config.log_json = parse_flag("APPROVAL_LOG_JSON", &flag)?;
        }

        Ok(config)
    }
}

fn parse_user_list(raw: &str) -> anyhow::Result<Vec<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<UserId>()
                .with_context(|| format!("invalid user id '{}' in APPROVAL_ESCALATE_TO", s))
        })
        .collect()
}

fn parse_flag(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("invalid boolean '{}' for {}", other, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn values_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("APPROVAL_DB_PATH", "/var/lib/approval"),
            ("APPROVAL_LISTEN_ADDR", "0.0.0.0:9000"),
            ("APPROVAL_SWEEP_INTERVAL_SECS", "60"),
            ("APPROVAL_ESCALATE_TO", "7, 9"),
            ("APPROVAL_ESCALATE_TO_ADMINS", "true"),
            ("APPROVAL_NOTIFY_MAX_ATTEMPTS", "3"),
            ("APPROVAL_NOTIFY_BACKOFF_MS", "50"),
            ("APPROVAL_LOG_JSON", "1"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/approval"));
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.escalation.escalate_to, vec![7, 9]);
        assert!(config.escalation.notify_company_admins);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(50));
        assert!(config.log_json);
    }

    #[test]
    fn bad_values_are_reported() {
        let err = EngineConfig::from_lookup(lookup(&[("APPROVAL_ESCALATE_TO", "7,x")])).unwrap_err();
        assert!(err.to_string().contains("APPROVAL_ESCALATE_TO"));
        assert!(EngineConfig::from_lookup(lookup(&[("APPROVAL_SWEEP_INTERVAL_SECS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("APPROVAL_LOG_JSON", "maybe")])).is_err());
    }
}
