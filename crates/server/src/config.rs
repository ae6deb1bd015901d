// Server configuration from environment variables

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::gateway::GatewaySettings;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    pub file_store_path: PathBuf,
    pub gateway: GatewaySettings,
    // token -> user id; when non-empty, replaces database session lookup
    pub dev_tokens: HashMap<String, String>,
    // Let any signed-in user join any note id, skipping the notes table
    pub open_notes: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = GatewaySettings::default();

        Ok(ServerConfig {
            bind_addr: parse_or(&lookup, "BIND_ADDR", "127.0.0.1:9001".parse()?)?,
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://notesync.db?mode=rwc".to_string()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            file_store_path: lookup("FILE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./file_store")),
            gateway: GatewaySettings {
                max_apply_attempts: parse_or(
                    &lookup,
                    "MAX_APPLY_ATTEMPTS",
                    defaults.max_apply_attempts,
                )?,
                snapshot_interval: parse_or(&lookup, "SNAPSHOT_INTERVAL", defaults.snapshot_interval)?,
                compact_log: parse_or(&lookup, "COMPACT_LOG", defaults.compact_log)?,
                history_window: parse_or(&lookup, "HISTORY_WINDOW", defaults.history_window)?,
            },
            dev_tokens: lookup("DEV_TOKENS")
                .map(|raw| parse_tokens(&raw))
                .transpose()?
                .unwrap_or_default(),
            open_notes: parse_or(&lookup, "OPEN_NOTES", false)?,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

// "token=user,token2=user2"
fn parse_tokens(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (token, user) = pair
                .split_once('=')
                .with_context(|| format!("DEV_TOKENS entry {pair:?} is not token=user"))?;
            Ok((token.trim().to_string(), user.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.gateway.max_apply_attempts, 3);
        assert!(config.dev_tokens.is_empty());
        assert!(!config.open_notes);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BIND_ADDR", "0.0.0.0:8080"),
            ("SNAPSHOT_INTERVAL", "25"),
            ("COMPACT_LOG", "true"),
            ("DEV_TOKENS", "abc=alice, def=bob"),
            ("OPEN_NOTES", "true"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.gateway.snapshot_interval, 25);
        assert!(config.gateway.compact_log);
        assert!(config.open_notes);
        assert_eq!(config.dev_tokens.get("def").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_invalid_values() {
        let err = config(&[("MAX_APPLY_ATTEMPTS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_APPLY_ATTEMPTS"));

        assert!(config(&[("DEV_TOKENS", "missing-separator")]).is_err());
    }
}
