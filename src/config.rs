//! Layered configuration using figment.
//!
//! Sources, highest priority first:
//! 1. Environment variables with the `TALLY_` prefix (`TALLY_PORT=9000`)
//! 2. `tally.toml` in the working directory, or the file named by `TALLY_CONFIG`
//! 3. Built-in defaults

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::history::ContributionPolicy;

pub const ENV_PREFIX: &str = "TALLY_";
pub const DEFAULT_CONFIG_FILE: &str = "tally.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error("invalid bind address {addr:?}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding session, archive and live-mode files.
    pub data_dir: PathBuf,
    /// Entries per window for the peak statistic.
    pub peak_window_events: usize,
    pub recent_window_minutes: i64,
    pub contribution_policy: ContributionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("data"),
            peak_window_events: 2,
            recent_window_minutes: 5,
            contribution_policy: ContributionPolicy::DistinctDates,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment()
            .extract()
            .map_err(|e| ConfigError::from(Box::new(e)))
    }

    pub fn figment() -> Figment {
        let file = std::env::var(format!("{ENV_PREFIX}CONFIG"))
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|source| ConfigError::Address { addr, source })
    }

    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.recent_window_minutes.max(0))
            .unwrap_or_else(chrono::Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config: Config = Config::figment().extract()?;
            assert_eq!(config, Config::default());
            assert_eq!(config.bind_addr().unwrap().port(), 8080);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                port = 9000
                data_dir = "/var/lib/tally"
                contribution_policy = "per_session"
                "#,
            )?;
            jail.set_env("TALLY_PORT", "9100");
            jail.set_env("TALLY_PEAK_WINDOW_EVENTS", "3");

            let config: Config = Config::figment().extract()?;
            assert_eq!(config.port, 9100);
            assert_eq!(config.peak_window_events, 3);
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/tally"));
            assert_eq!(config.contribution_policy, ContributionPolicy::PerSession);
            Ok(())
        });
    }

    #[test]
    fn test_bad_host_is_reported() {
        let config = Config {
            host: "not an ip".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.bind_addr(),
            Err(ConfigError::Address { .. })
        ));
    }
}
