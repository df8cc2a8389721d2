//! Service configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing_subscriber::filter::Directive;

/// Logging output format
#[derive(Debug, Clone, Copy, Deserialize)]
pub enum LogFormat {
    Compact,
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Compact
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Logging {
    /// Additional filtering directives
    #[serde(default, deserialize_with = "Logging::deserialize_filters")]
    pub filters: Vec<Directive>,

    /// Logging format
    #[serde(default)]
    pub format: LogFormat,
}

impl Logging {
    fn deserialize_filters<'de, D>(deserializer: D) -> Result<Vec<Directive>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let dirs: Vec<String> = Deserialize::deserialize(deserializer)?;
        dirs.into_iter()
            .map(|dir| dir.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Database backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Database {
    /// In-memory SQLite, migrations always applied
    Memory {
        #[serde(default = "Database::default_max_connections")]
        max_connections: u32,
    },
    /// File-backed SQLite
    SqLite {
        path: PathBuf,
        #[serde(default = "Database::default_max_connections")]
        max_connections: u32,
        /// Apply migrations on startup
        #[serde(default)]
        migrate: bool,
    },
}

impl Database {
    fn default_max_connections() -> u32 {
        4
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::Memory {
            max_connections: Self::default_max_connections(),
        }
    }
}

/// Credential and token tuning
#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    /// Access token lifetime in seconds
    #[serde(default = "Auth::default_access_ttl_secs")]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "Auth::default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,

    /// Straight failures before an account locks
    #[serde(default = "Auth::default_lock_threshold")]
    pub lock_threshold: u32,

    /// Account lock duration in seconds
    #[serde(default = "Auth::default_lock_secs")]
    pub lock_secs: u64,
}

impl Auth {
    fn default_access_ttl_secs() -> u64 {
        30 * 60
    }

    fn default_refresh_ttl_secs() -> u64 {
        14 * 24 * 60 * 60
    }

    fn default_lock_threshold() -> u32 {
        5
    }

    fn default_lock_secs() -> u64 {
        15 * 60
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            access_ttl_secs: Self::default_access_ttl_secs(),
            refresh_ttl_secs: Self::default_refresh_ttl_secs(),
            lock_threshold: Self::default_lock_threshold(),
            lock_secs: Self::default_lock_secs(),
        }
    }
}

/// Top level service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address where to host the service
    #[serde(default = "Config::default_host")]
    pub host: SocketAddr,

    /// Database configuration
    #[serde(default)]
    pub db: Database,

    /// Credential and token tuning
    #[serde(default)]
    pub auth: Auth,

    /// Logging configuration
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    fn default_host() -> SocketAddr {
        ([127, 0, 0, 1], 3030).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.host, ([127, 0, 0, 1], 3030).into());
        assert!(matches!(config.db, Database::Memory { .. }));
        assert_eq!(config.auth.lock_threshold, 5);
        assert_eq!(config.auth.access_ttl(), Duration::from_secs(1800));
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            host = "0.0.0.0:8080"

            [db]
            type = "sq_lite"
            path = "booking.db"
            max_connections = 8
            migrate = true

            [auth]
            access_ttl_secs = 600
            lock_threshold = 3

            [logging]
            format = "Pretty"
            filters = ["sqlx=warn"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.db,
            Database::SqLite {
                max_connections: 8,
                migrate: true,
                ..
            }
        ));
        assert_eq!(config.auth.access_ttl_secs, 600);
        assert_eq!(config.logging.filters.len(), 1);
    }
}
