use std::{env, fmt::Display, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

use crate::{guard::IdentityStrategy, notifier::DEFAULT_CAPACITY};

#[derive(Error, Debug)]
#[error("invalid {key} value `{value}`: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub voter_identity: IdentityStrategy,
    pub trust_forwarded_for: bool,
    pub notifier_capacity: usize,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            database_url: None,
            database_max_connections: 5,
            voter_identity: IdentityStrategy::NetworkAddress,
            trust_forwarded_for: false,
            notifier_capacity: DEFAULT_CAPACITY,
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let database_url = var("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set, votes will only be kept in memory");
        }

        Ok(Self {
            port: try_load("PORT", "3030")?,
            database_url,
            database_max_connections: try_load("DATABASE_MAX_CONNECTIONS", "5")?,
            voter_identity: try_load("VOTER_IDENTITY", "network")?,
            trust_forwarded_for: try_load("TRUST_FORWARDED_FOR", "false")?,
            notifier_capacity: try_load("NOTIFIER_CAPACITY", "64")?,
            cors_allowed_origins: var("CORS_ALLOWED_ORIGINS")
                .map(|origins| split_list(&origins))
                .unwrap_or_default(),
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        reason: e.to_string(),
        value,
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_lists_skip_blanks() {
        assert_eq!(
            split_list(" https://a.example , ,https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn defaults_apply_for_unset_keys() {
        let port: u16 = try_load("POLL_LEDGER_TEST_UNSET_PORT", "3030").unwrap();
        assert_eq!(port, 3030);

        let strategy: IdentityStrategy =
            try_load("POLL_LEDGER_TEST_UNSET_STRATEGY", "token").unwrap();
        assert_eq!(strategy, IdentityStrategy::ClientToken);
    }

    #[test]
    fn malformed_values_name_the_key() {
        let err = try_load::<u16>("POLL_LEDGER_TEST_UNSET_BAD", "not-a-port").unwrap_err();
        assert_eq!(err.key, "POLL_LEDGER_TEST_UNSET_BAD");
        assert_eq!(err.value, "not-a-port");
    }
}
