//! Environment configuration for the demo.

use std::str::FromStr;
use thiserror::Error;

/// Which event bus backend to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// In-process queue.
    Memory,
    /// Redis Streams at the given URL.
    Redis {
        /// Connection URL
        url: String,
    },
    /// Kafka at the given brokers.
    Kafka {
        /// Comma-separated bootstrap servers
        brokers: String,
    },
}

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `EVENT_BUS_BACKEND` names an unknown backend.
    #[error("unknown EVENT_BUS_BACKEND {0:?} (expected memory, redis or kafka)")]
    UnknownBackend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Memory,
    Redis,
    Kafka,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "kafka" => Ok(Self::Kafka),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Demo configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Selected backend.
    pub backend: Backend,
    /// Consumer group for the Redis and Kafka backends.
    pub group: String,
}

impl Config {
    /// Read `EVENT_BUS_BACKEND`, `REDIS_URL`, `KAFKA_BROKERS` and `EVENT_BUS_GROUP`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBackend`] for an unrecognised backend name.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind: BackendKind = lookup("EVENT_BUS_BACKEND").unwrap_or_default().parse()?;
        let backend = match kind {
            BackendKind::Memory => Backend::Memory,
            BackendKind::Redis => Backend::Redis {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            },
            BackendKind::Kafka => Backend::Kafka {
                brokers: lookup("KAFKA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            },
        };

        Ok(Self {
            backend,
            group: lookup("EVENT_BUS_GROUP").unwrap_or_else(|| "order-events-demo".to_string()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_memory() {
        let config = config(&[]).unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.group, "order-events-demo");
    }

    #[test]
    fn redis_reads_url_and_group() {
        let config = config(&[
            ("EVENT_BUS_BACKEND", "Redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("EVENT_BUS_GROUP", "billing"),
        ])
        .unwrap();
        assert_eq!(
            config.backend,
            Backend::Redis {
                url: "redis://cache:6379".to_string()
            }
        );
        assert_eq!(config.group, "billing");
    }

    #[test]
    fn kafka_has_default_brokers() {
        let config = config(&[("EVENT_BUS_BACKEND", "kafka")]).unwrap();
        assert_eq!(
            config.backend,
            Backend::Kafka {
                brokers: "localhost:9092".to_string()
            }
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert_eq!(
            config(&[("EVENT_BUS_BACKEND", "nats")]),
            Err(ConfigError::UnknownBackend("nats".to_string()))
        );
    }
}
