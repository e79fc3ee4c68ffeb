//! Room registry (component E): mints room IDs and tracks the live
//! `RoomHandle` for each room, the way the teacher's `network.rs` tracks
//! its `DeltaTopicMap` — a plain `Arc<RwLock<HashMap<_, _>>>`, locked only
//! for the brief lookup/insert/remove critical section.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::growl::GrowlHandler;
use crate::room::{PredefinedUser, Room, RoomHandle, RoomSpawnConfig};

const ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ID_GEN_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unable to generate unique room ID")]
    IdExhausted,
}

/// The registry a room's loop task holds a clone of, so it can remove
/// itself from the hub on dispose without a round trip through a command
/// channel.
pub type RoomRegistry = Arc<RwLock<HashMap<String, RoomHandle>>>;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub id_len: usize,
    pub max_peers_per_room: usize,
    pub room_age: Duration,
    pub ws_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            id_len: 5,
            max_peers_per_room: 200,
            room_age: Duration::from_secs(4 * 60 * 60),
            ws_timeout: crate::peer::WS_TIMEOUT,
        }
    }
}

pub struct Hub {
    rooms: RoomRegistry,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Create and launch a fresh, non-predefined room with a generated ID.
    pub async fn add_room(
        &self,
        name: String,
        growl_handler: Option<Arc<dyn GrowlHandler>>,
    ) -> Result<RoomHandle, HubError> {
        let id = self.generate_unique_id().await?;
        self.add_room_with_id(id, name, false, String::new(), Vec::new(), growl_handler)
            .await
    }

    /// Create a room with a fixed ID, `predefined = true`, and an explicit
    /// motd/user list sourced from config. Predefined rooms are never torn
    /// down by inactivity or an explicit dispose request.
    pub async fn add_predefined_room(
        &self,
        id: String,
        name: String,
        motd: String,
        predefined_users: Vec<PredefinedUser>,
        growl_handler: Option<Arc<dyn GrowlHandler>>,
    ) -> Result<RoomHandle, HubError> {
        self.add_room_with_id(id, name, true, motd, predefined_users, growl_handler)
            .await
    }

    async fn add_room_with_id(
        &self,
        id: String,
        name: String,
        predefined: bool,
        motd: String,
        predefined_users: Vec<PredefinedUser>,
        growl_handler: Option<Arc<dyn GrowlHandler>>,
    ) -> Result<RoomHandle, HubError> {
        let spawn_config = RoomSpawnConfig {
            id: id.clone(),
            name,
            predefined,
            motd,
            max_peers: self.config.max_peers_per_room,
            room_age: self.config.room_age,
            ws_timeout: self.config.ws_timeout,
            predefined_users,
            growl_handler,
        };
        let handle = Room::spawn(spawn_config, self.rooms.clone());
        self.rooms.write().await.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn get_room(&self, id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn remove_room(&self, id: &str) {
        self.rooms.write().await.remove(id);
    }

    async fn generate_unique_id(&self) -> Result<String, HubError> {
        for _ in 0..ID_GEN_RETRIES {
            let candidate = self.random_id();
            if !self.rooms.read().await.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(HubError::IdExhausted)
    }

    fn random_id(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.config.id_len)
            .map(|_| {
                let idx = rng.gen_range(0..ID_ALPHABET.len());
                ID_ALPHABET[idx] as char
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_room_assigns_configured_length_id() {
        let hub = Hub::new(HubConfig {
            id_len: 7,
            ..HubConfig::default()
        });
        let handle = hub.add_room("test room".into(), None).await.unwrap();
        assert_eq!(handle.id().len(), 7);
    }

    #[tokio::test]
    async fn get_room_finds_added_room() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub.add_room("test room".into(), None).await.unwrap();
        let found = hub.get_room(handle.id()).await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn get_room_returns_none_for_unknown_id() {
        let hub = Hub::new(HubConfig::default());
        assert!(hub.get_room("nope!").await.is_none());
    }

    #[tokio::test]
    async fn predefined_room_uses_fixed_id() {
        let hub = Hub::new(HubConfig::default());
        let handle = hub
            .add_predefined_room(
                "lobby".into(),
                "Lobby".into(),
                "welcome".into(),
                Vec::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(handle.id(), "lobby");
        assert!(handle.is_predefined());
    }
}
