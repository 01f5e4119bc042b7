//! Server configuration.
//!
//! Behavior lives in code; these are the environment-level knobs needed to
//! run it: listening address, token signing secret, persistence path,
//! throttle windows, and the checkpoint interval. Every variable has a
//! development default so a bare `collabnotes-sync` starts locally; missing
//! or unparseable values warn and fall back, they never abort startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::throttle::ThrottleConfig;

/// Fallback signing secret, matching the development default of the REST API.
const DEV_JWT_SECRET: &str = "your-secret-key";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// HS256 secret shared with the credential issuer
    pub jwt_secret: String,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between checkpoint flushes of dirty rooms
    pub checkpoint_interval: Duration,
    /// How long a connection may take to send its join frame
    pub join_timeout: Duration,
    /// Connection throttle settings
    pub throttle: ThrottleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            checkpoint_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build configuration from the environment.
    ///
    /// Recognized variables: `COLLAB_BIND_ADDR`, `COLLAB_PORT` (used when no
    /// bind address is given), `JWT_SECRET`, `COLLAB_STORAGE_PATH`,
    /// `COLLAB_CHECKPOINT_SECS`, `COLLAB_THROTTLE_MS`, `COLLAB_BAN_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = env_parsed::<u16>("COLLAB_PORT") {
            config.bind_addr = format!("127.0.0.1:{port}");
        }

        match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => log::warn!("JWT_SECRET not set; using the development default"),
        }

        if let Ok(path) = std::env::var("COLLAB_STORAGE_PATH") {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        } else {
            log::warn!("COLLAB_STORAGE_PATH not set; documents will not be persisted");
        }

        if let Some(secs) = env_parsed::<u64>("COLLAB_CHECKPOINT_SECS") {
            config.checkpoint_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_parsed::<u64>("COLLAB_THROTTLE_MS") {
            config.throttle.min_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parsed::<u64>("COLLAB_BAN_SECS") {
            config.throttle.ban_duration = Duration::from_secs(secs);
        }

        config
    }
}

/// Read and parse an environment variable, warning on garbage.
fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {name}={raw:?}");
            None
        }
    }
}
