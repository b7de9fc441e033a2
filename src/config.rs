use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::retry::RetryPolicy;

pub const SETTINGS_FILE: &str = "attendance.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub recompute_timeout_secs: u64,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub export_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            recompute_timeout_secs: 15,
            fetch_retries: 3,
            retry_backoff_ms: 200,
            export_dir: PathBuf::from("."),
        }
    }
}

impl Settings {
    pub fn recompute_timeout(&self) -> Duration {
        Duration::from_secs(self.recompute_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_retries.max(1),
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = match fs::read_to_string(SETTINGS_FILE) {
        Ok(raw) => parse_settings(&raw),
        Err(_) => Settings::default(),
    };
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn parse_settings(raw: &str) -> Settings {
    toml::from_str(raw).unwrap_or_else(|error| {
        warn!(%error, file = SETTINGS_FILE, "ignoring unreadable settings file");
        Settings::default()
    })
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = Some(v);
    }
    if let Some(v) = var("APP__RECOMPUTE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.recompute_timeout_secs = v;
    }
    if let Some(v) = var("APP__FETCH_RETRIES").and_then(|v| v.parse().ok()) {
        settings.fetch_retries = v;
    }
    if let Some(v) = var("APP__RETRY_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        settings.retry_backoff_ms = v;
    }
    if let Some(v) = var("APP__EXPORT_DIR") {
        settings.export_dir = PathBuf::from(v);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_bound_recompute_at_fifteen_seconds() {
        let settings = Settings::default();
        assert_eq!(settings.recompute_timeout(), Duration::from_secs(15));
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = parse_settings("fetch_retries = 5\nexport_dir = \"/tmp/reports\"\n");
        assert_eq!(settings.fetch_retries, 5);
        assert_eq!(settings.export_dir, PathBuf::from("/tmp/reports"));
        assert_eq!(settings.max_connections, 5);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        assert_eq!(parse_settings("fetch_retries = \"many\""), Settings::default());
    }

    #[test]
    fn env_overrides_file_and_skips_unparsable_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/attendance"),
            ("APP__RECOMPUTE_TIMEOUT_SECS", "30"),
            ("APP__FETCH_RETRIES", "lots"),
        ]);
        let mut settings = Settings::default();
        apply_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/attendance"));
        assert_eq!(settings.recompute_timeout_secs, 30);
        assert_eq!(settings.fetch_retries, 3);
    }
}
