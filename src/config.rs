//! Ambient configuration loading (binary-level glue). The room engine
//! itself never touches a config file — callers build a [`RoomEngineConfig`]
//! and hand it in. Layering (a `config/default.toml` overridden by
//! `RELAY_*` environment variables) follows the `config` crate usage seen
//! across the ambient-stack pack (e.g. `berrym-lair-chat`'s manifest), since
//! the teacher itself has no config file at all — it is parameterized
//! entirely through its FFI `init_core()` entry point.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredefinedUserConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub growl: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredefinedRoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub users: Vec<PredefinedUserConfig>,
}

/// The knobs the room engine itself is parameterized by, handed to
/// `Hub`/`Room::spawn` — distinct from the binary-only transport settings
/// below.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEngineConfig {
    #[serde(default = "default_room_id_len")]
    pub room_id_len: usize,
    #[serde(default = "default_max_peers")]
    pub max_peers_per_room: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_room_age_secs")]
    pub room_age_secs: u64,
    #[serde(default = "default_ws_timeout_secs")]
    pub ws_timeout_secs: u64,
    #[serde(default)]
    pub predefined_rooms: Vec<PredefinedRoomConfig>,
}

impl RoomEngineConfig {
    pub fn room_age(&self) -> Duration {
        Duration::from_secs(self.room_age_secs)
    }

    pub fn ws_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_timeout_secs)
    }
}

fn default_room_id_len() -> usize {
    5
}
fn default_max_peers() -> usize {
    200
}
fn default_max_message_len() -> usize {
    crate::peer::MAX_MESSAGE_LEN
}
fn default_room_age_secs() -> u64 {
    4 * 60 * 60
}
fn default_ws_timeout_secs() -> u64 {
    10
}

/// Top-level config for the `relay-server` binary: the room engine knobs
/// plus transport-only settings (out of scope for the core per the
/// spec's explicit collaborator boundary).
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub room_engine: RoomEngineConfig,
}

impl Default for RoomEngineConfig {
    fn default() -> Self {
        Self {
            room_id_len: default_room_id_len(),
            max_peers_per_room: default_max_peers(),
            max_message_len: default_max_message_len(),
            room_age_secs: default_room_age_secs(),
            ws_timeout_secs: default_ws_timeout_secs(),
            predefined_rooms: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl RelayConfig {
    /// Loads `config/default.toml` (if present) then applies `RELAY_*`
    /// environment overrides, e.g. `RELAY_BIND=0.0.0.0:9000`.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("config/default").required(false))
            .add_source(::config::Environment::with_prefix("RELAY").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RoomEngineConfig::default();
        assert_eq!(cfg.room_id_len, 5);
        assert_eq!(cfg.max_peers_per_room, 200);
        assert_eq!(cfg.room_age(), Duration::from_secs(4 * 60 * 60));
    }
}
