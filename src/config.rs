// src/config.rs
use crate::auth::DEFAULT_PASSWORD_ROUNDS;
use chrono::Duration;
use std::net::SocketAddr;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://finance.db";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3030";
pub const DEFAULT_LOOKUP_URL: &str = "https://cloud.iexapis.com/stable";
const DEFAULT_SESSION_TTL_SECS: i64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

pub struct Config {
    pub api_key: String,
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub lookup_url: String,
    /// Generated at random when unset; sessions then end with the process.
    pub session_secret: Vec<u8>,
    pub session_ttl: Duration,
    pub password_rounds: u32,
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_source(|name| std::env::var(name).ok())
    }

    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        let api_key = var("API_KEY").ok_or(ConfigError::Missing("API_KEY"))?;
        let database_url = var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let lookup_url = var("LOOKUP_URL").unwrap_or_else(|| DEFAULT_LOOKUP_URL.to_string());

        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind_addr.clone(),
        })?;

        let session_secret = match var("SESSION_SECRET") {
            Some(secret) => secret.into_bytes(),
            None => rand::random::<[u8; 32]>().to_vec(),
        };

        let session_ttl = match var("SESSION_TTL_SECS") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(secs) if secs > 0 => Duration::seconds(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "SESSION_TTL_SECS",
                        value: raw,
                    })
                }
            },
            None => Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        };

        let password_rounds = match var("PASSWORD_ROUNDS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(rounds) if rounds > 0 => rounds,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "PASSWORD_ROUNDS",
                        value: raw,
                    })
                }
            },
            None => DEFAULT_PASSWORD_ROUNDS,
        };

        Ok(Config {
            api_key,
            database_url,
            bind_addr,
            lookup_url,
            session_secret,
            session_ttl,
            password_rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn api_key_is_required() {
        let err = Config::from_source(source(&[])).err().unwrap();
        assert!(matches!(err, ConfigError::Missing("API_KEY")));
        let err = Config::from_source(source(&[("API_KEY", "  ")])).err().unwrap();
        assert_eq!(err.to_string(), "API_KEY not set");
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_source(source(&[("API_KEY", "pk_test")])).unwrap();
        assert_eq!(config.api_key, "pk_test");
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.lookup_url, DEFAULT_LOOKUP_URL);
        assert_eq!(config.session_secret.len(), 32);
        assert_eq!(config.session_ttl, Duration::days(1));
        assert_eq!(config.password_rounds, DEFAULT_PASSWORD_ROUNDS);
    }

    #[test]
    fn overrides_are_validated() {
        let config = Config::from_source(source(&[
            ("API_KEY", "pk_test"),
            ("BIND_ADDR", "0.0.0.0:8080"),
            ("SESSION_SECRET", "abc"),
            ("SESSION_TTL_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.session_secret, b"abc");
        assert_eq!(config.session_ttl, Duration::seconds(60));

        let err = Config::from_source(source(&[("API_KEY", "k"), ("BIND_ADDR", "nowhere")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Invalid { name: "BIND_ADDR", .. }));

        let err = Config::from_source(source(&[("API_KEY", "k"), ("SESSION_TTL_SECS", "-5")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Invalid { name: "SESSION_TTL_SECS", .. }));
    }
}
