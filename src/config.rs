//! Server configuration loaded from environment variables.
//!
//! A `.env` file in the working directory is read first, if present.
//!
//! ## Required
//! - `KIROKU_TOKEN_SECRET` - session token signing secret (min 32 bytes)
//!
//! ## Optional
//! - `KIROKU_DATABASE` - SQLite file (default: kiroku.sqlite3)
//! - `KIROKU_ADDR` - bind address (default: 127.0.0.1:3000)
//! - `KIROKU_SERVER_NAME` - session token issuer and audience
//!   (default: localhost)
//! - `KIROKU_SESSION_DAYS` - session lifetime in days (default: 30)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const MIN_TOKEN_SECRET_LENGTH : usize = 32;
const DEFAULT_DATABASE : &str = "kiroku.sqlite3";
const DEFAULT_ADDR : &str = "127.0.0.1:3000";
const DEFAULT_SERVER_NAME : &str = "localhost";
const DEFAULT_SESSION_DAYS : u64 = 30;
const DAY : u64 = 60 * 60 * 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

#[derive(Clone)]
pub struct Config {
    pub database :     PathBuf,
    pub addr :         SocketAddr,
    pub server_name :  String,
    pub token_secret : Vec<u8>,
    pub session_ttl :  Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f : &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database", &self.database)
            .field("addr", &self.addr)
            .field("server_name", &self.server_name)
            .field("token_secret", &"[REDACTED]")
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // a missing .env file is fine
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup : F) -> Result<Self, ConfigError>
    where
        F : Fn(&str) -> Option<String>,
    {
        let token_secret = lookup("KIROKU_TOKEN_SECRET")
            .ok_or_else(|| {
                ConfigError::MissingEnvVar("KIROKU_TOKEN_SECRET".into())
            })?
            .into_bytes();

        if token_secret.len() < MIN_TOKEN_SECRET_LENGTH {
            return Err(ConfigError::InvalidEnvVar(
                "KIROKU_TOKEN_SECRET".into(),
                format!("must be at least {} bytes", MIN_TOKEN_SECRET_LENGTH),
            ))
        }

        let addr = lookup("KIROKU_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr.parse::<SocketAddr>().map_err(|_| {
            ConfigError::InvalidEnvVar("KIROKU_ADDR".into(), addr.clone())
        })?;

        let days = match lookup("KIROKU_SESSION_DAYS") {
            Some(v) => v.parse::<u64>().ok().filter(|d| *d > 0).ok_or_else(
                || ConfigError::InvalidEnvVar("KIROKU_SESSION_DAYS".into(), v),
            )?,
            None => DEFAULT_SESSION_DAYS,
        };

        Ok(Config {
            database : lookup("KIROKU_DATABASE")
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string())
                .into(),
            addr,
            server_name : lookup("KIROKU_SERVER_NAME")
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            token_secret,
            session_ttl : Duration::from_secs(days * DAY),
        })
    }
}
