use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Resync period used when none (or zero) is configured.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Only jobs in this namespace are cleaned up. Empty means all namespaces.
    pub namespace: String,
    pub resync_secs: u64,
    /// Capacity of the channel between the informer and the reconcile loop.
    pub event_buffer: usize,
}

impl ReconcilerConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                addr: lookup("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            reconciler: ReconcilerConfig {
                namespace: lookup("KOBS_NAMESPACE").unwrap_or(defaults.reconciler.namespace),
                resync_secs: parse_var(&lookup, "KOBS_RESYNC_SECS")?
                    .unwrap_or(defaults.reconciler.resync_secs),
                event_buffer: parse_var(&lookup, "KOBS_EVENT_BUFFER")?
                    .unwrap_or(defaults.reconciler.event_buffer),
            },
        };

        if config.reconciler.event_buffer == 0 {
            return Err(Error::Config(
                "KOBS_EVENT_BUFFER must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: '{}'", key, raw))),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            reconciler: ReconcilerConfig {
                namespace: String::new(),
                resync_secs: DEFAULT_RESYNC.as_secs(),
                event_buffer: 100,
            },
        }
    }
}
