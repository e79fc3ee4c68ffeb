//! Room engine (component D) — the heart of the crate.
//!
//! A room is one task running a single event loop; every mutation of its
//! peer set, motd, or activity clock happens inside that loop, reached only
//! through [`RoomCommand`]. This is the same "serialize everything through
//! one channel" discipline the teacher's `store.rs` global uses for its
//! `DeltaStore` — except here the channel *is* the lock, so there is no
//! mutex to take on the hot path at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::crypto::{self, RoomKeyPair, PUBKEY_LEN};
use crate::growl::GrowlHandler;
use crate::hub::RoomRegistry;
use crate::peer::{self, OutboundFrame};
use crate::schema::{
    msg_type, GrowlPayload, MotdPayload, PeerInfo, PeerJoinPayload, PeerLeavePayload,
    PeerListPayload, SealedAuthBody, SealedMsg, UnsealedMsg,
};
use crate::token::TokenStore;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PEER_IDLE_TIMEOUT_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("spub is not valid base64/32 bytes")]
    MalformedSpub,
    #[error("a peer with this public key is already connected")]
    AlreadyConnected,
    #[error("room has reached its peer capacity")]
    RoomCapacityExceeded,
    /// Never returned today — kept for API completeness, see design notes.
    #[error("invalid room password")]
    InvalidRoomPassword,
    /// Never returned today — kept for API completeness, see design notes.
    #[error("invalid user password")]
    InvalidUserPassword,
    #[error("room is shutting down")]
    Gone,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub secret: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PredefinedUser {
    pub name: String,
    pub password: String,
    pub growl: bool,
}

#[derive(Debug, Clone)]
pub struct LoginTokensBundle {
    pub handle: String,
    pub sealed_auths: HashMap<String, SealedMsg>,
}

pub struct RoomSpawnConfig {
    pub id: String,
    pub name: String,
    pub predefined: bool,
    pub motd: String,
    pub max_peers: usize,
    pub room_age: Duration,
    pub ws_timeout: Duration,
    pub predefined_users: Vec<PredefinedUser>,
    pub growl_handler: Option<Arc<dyn GrowlHandler>>,
}

/// Requests accepted by a room's loop task. Every external caller — the
/// HTTP/WS glue, the hub, a peer's reader task — reaches the room only
/// through this channel.
pub enum RoomCommand {
    Login {
        spub: String,
        secret: String,
        resp: oneshot::Sender<Result<LoginOutcome, RoomError>>,
    },
    ConnectPeer {
        spub: String,
        socket: WebSocket,
    },
    InboundFrame {
        from_spub: String,
        msg: SealedMsg,
    },
    PeerLeave {
        spub: String,
    },
    Dispose,
    GetLoginTokens {
        token: String,
        resp: oneshot::Sender<Option<LoginTokensBundle>>,
    },
}

/// Cheaply cloneable reference to a running room, handed out by the hub.
#[derive(Clone)]
pub struct RoomHandle {
    id: Arc<str>,
    name: Arc<str>,
    predefined: bool,
    spub: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_predefined(&self) -> bool {
        self.predefined
    }

    pub fn spub(&self) -> &str {
        &self.spub
    }

    pub async fn login(&self, spub: String, secret: String) -> Result<LoginOutcome, RoomError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::Login {
                spub,
                secret,
                resp: resp_tx,
            })
            .map_err(|_| RoomError::Gone)?;
        resp_rx.await.map_err(|_| RoomError::Gone)?
    }

    pub fn connect_peer(&self, spub: String, socket: WebSocket) -> Result<(), RoomError> {
        self.cmd_tx
            .send(RoomCommand::ConnectPeer { spub, socket })
            .map_err(|_| RoomError::Gone)
    }

    pub fn dispose(&self) -> Result<(), RoomError> {
        self.cmd_tx.send(RoomCommand::Dispose).map_err(|_| RoomError::Gone)
    }

    pub async fn get_login_tokens(&self, token: String) -> Option<LoginTokensBundle> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::GetLoginTokens { token, resp: resp_tx })
            .ok()?;
        resp_rx.await.ok()?
    }
}

struct PeerState {
    spub: String,
    bpub: [u8; PUBKEY_LEN],
    secret: String,
    since: DateTime<Utc>,
    last_message: Option<DateTime<Utc>>,
    sink: Option<peer::PeerSink>,
}

/// Everything a room's loop task owns exclusively. No field here is ever
/// touched from another task.
struct RoomState {
    id: String,
    motd: String,
    predefined: bool,
    max_peers: usize,
    room_age: Duration,
    ws_timeout: Duration,
    keypair: RoomKeyPair,
    peers: HashMap<String, PeerState>,
    predefined_users: Vec<PredefinedUser>,
    growl_handler: Option<Arc<dyn GrowlHandler>>,
    token_store: TokenStore,
    last_activity: Instant,
    cmd_tx: mpsc::UnboundedSender<RoomCommand>,
    registry: RoomRegistry,
}

/// Namespace for the room engine's entry point; the loop's actual state
/// lives in `RoomState`, constructed once inside `spawn`.
pub struct Room;

impl Room {
    /// Panics if the OS RNG fails while generating the room's keypair —
    /// that failure is fatal to the process (see `crypto::RoomKeyPair::generate`).
    pub fn spawn(config: RoomSpawnConfig, registry: RoomRegistry) -> RoomHandle {
        let keypair = RoomKeyPair::generate()
            .expect("fatal: RNG failure generating room keypair");
        let spub: Arc<str> = keypair.spub().into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let handle = RoomHandle {
            id: config.id.clone().into(),
            name: config.name.clone().into(),
            predefined: config.predefined,
            spub,
            cmd_tx: cmd_tx.clone(),
        };

        let state = RoomState {
            id: config.id,
            motd: config.motd,
            predefined: config.predefined,
            max_peers: config.max_peers,
            room_age: config.room_age,
            ws_timeout: config.ws_timeout,
            keypair,
            peers: HashMap::new(),
            predefined_users: config.predefined_users,
            growl_handler: config.growl_handler,
            token_store: TokenStore::new(),
            last_activity: Instant::now(),
            cmd_tx,
            registry,
        };

        tokio::spawn(run(state, cmd_rx));
        handle
    }
}

async fn run(mut state: RoomState, mut cmd_rx: mpsc::UnboundedReceiver<RoomCommand>) {
    let mut idle_ticker = interval(IDLE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if state.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = idle_ticker.tick() => {
                state.sweep_idle_peers();
                if !state.predefined && state.last_activity.elapsed() > state.room_age {
                    info!(room = %state.id, "room inactivity timeout, disposing");
                    break;
                }
            }
        }
    }

    state.teardown().await;
}

impl RoomState {
    /// Returns `true` if the loop should exit after this command.
    ///
    /// Any command re-arms the inactivity clock, not just a broadcast — a
    /// room doing nothing but steady peer-to-peer relay is still active.
    async fn handle_command(&mut self, cmd: RoomCommand) -> bool {
        self.last_activity = Instant::now();
        match cmd {
            RoomCommand::Login { spub, secret, resp } => {
                let outcome = self.handle_login(spub, secret);
                let _ = resp.send(outcome);
                false
            }
            RoomCommand::ConnectPeer { spub, socket } => {
                self.handle_connect(spub, socket);
                false
            }
            RoomCommand::InboundFrame { from_spub, msg } => self.handle_inbound(from_spub, msg).await,
            RoomCommand::PeerLeave { spub } => {
                self.drop_peer(spub);
                false
            }
            RoomCommand::Dispose => !self.predefined,
            RoomCommand::GetLoginTokens { token, resp } => {
                let bundle = self.handle_get_login_tokens(&token).await;
                let _ = resp.send(bundle);
                false
            }
        }
    }

    fn handle_login(&mut self, spub: String, secret: String) -> Result<LoginOutcome, RoomError> {
        let bpub = crypto::decode_pubkey(&spub).map_err(|_| RoomError::MalformedSpub)?;
        if self.peers.contains_key(&spub) {
            return Err(RoomError::AlreadyConnected);
        }
        if self.peers.len() >= self.max_peers {
            return Err(RoomError::RoomCapacityExceeded);
        }

        let secret = if secret.is_empty() {
            generate_secret(&bpub)
        } else {
            secret
        };
        let since = Utc::now();

        self.peers.insert(
            spub.clone(),
            PeerState {
                spub,
                bpub,
                secret: secret.clone(),
                since,
                last_message: None,
                sink: None,
            },
        );

        Ok(LoginOutcome { secret, since })
    }

    fn handle_connect(&mut self, spub: String, socket: WebSocket) {
        if !self.peers.contains_key(&spub) {
            tokio::spawn(reject_unregistered(socket));
            return;
        }

        let sink = peer::spawn_peer_io(socket, spub.clone(), self.cmd_tx.clone(), self.ws_timeout);
        let since = {
            let peer = self.peers.get_mut(&spub).expect("checked above");
            peer.sink = Some(sink);
            peer.since
        };

        self.send_peer_list_to(&spub);
        if !self.motd.is_empty() {
            let motd = self.motd.clone();
            if let Some(sealed) = self.seal_for(&spub, msg_type::MOTD, &MotdPayload { message: motd }) {
                self.enqueue_frame(&spub, OutboundFrame::Text(to_json(&sealed)));
            }
        }

        self.broadcast_unsealed(
            msg_type::PEER_JOIN,
            &PeerJoinPayload {
                public_key: spub.clone(),
                since,
            },
            Some(&spub),
        );
    }

    async fn handle_inbound(&mut self, from_spub: String, msg: SealedMsg) -> bool {
        if let Some(peer) = self.peers.get_mut(&from_spub) {
            peer.last_message = Some(Utc::now());
        }

        if msg.to != self.keypair.spub() {
            self.forward(&msg);
            return false;
        }

        let plaintext = match crypto::open(&self.keypair, &msg) {
            Ok(p) => p,
            Err(_) => {
                debug!(room = %self.id, "dropping sealed frame that failed to open");
                return false;
            }
        };
        let unsealed = match serde_json::from_slice::<UnsealedMsg>(&plaintext) {
            Ok(u) => u,
            Err(_) => {
                debug!(room = %self.id, "dropping malformed unsealed payload");
                return false;
            }
        };

        match unsealed.kind.as_str() {
            msg_type::ROOM_DISPOSE => return !self.predefined,
            msg_type::PEER_LIST => self.send_peer_list_to(&from_spub),
            msg_type::GROWL => {
                if let Ok(payload) = serde_json::from_value::<GrowlPayload>(unsealed.data) {
                    self.handle_growl(payload).await;
                }
            }
            other => debug!(room = %self.id, kind = other, "dropping unknown server-directed type"),
        }
        false
    }

    fn forward(&mut self, msg: &SealedMsg) {
        if msg.to == *self.keypair.spub() {
            warn!(room = %self.id, "peer tried to forward to the room's own key, dropping");
            return;
        }
        if self.peers.contains_key(&msg.to) {
            let to = msg.to.clone();
            self.enqueue_frame(&to, OutboundFrame::Text(to_json(msg)));
        } else {
            self.broadcast_sealed(msg);
        }
    }

    async fn handle_growl(&mut self, payload: GrowlPayload) {
        let is_growl_target = self
            .predefined_users
            .iter()
            .any(|u| u.name == payload.to && u.growl);
        if !is_growl_target {
            return;
        }

        let Some(token) = self.token_store.create_token(&payload.to).await else {
            return;
        };

        if let Some(handler) = self.growl_handler.clone() {
            let msg = payload.msg.clone();
            let from = payload.from.clone();
            tokio::spawn(async move { handler.notify(&msg, &from, &token).await });
        }
    }

    async fn handle_get_login_tokens(&mut self, token: &str) -> Option<LoginTokensBundle> {
        let handle = self.token_store.check_token(token).await?;
        let mut sealed_auths = HashMap::new();
        for spub in self.peers.keys().cloned().collect::<Vec<_>>() {
            if let Some(peer) = self.peers.get(&spub) {
                let body = SealedAuthBody {
                    secret: peer.secret.clone(),
                    date: peer.since,
                };
                if let Ok(plaintext) = serde_json::to_vec(&body) {
                    // Same fatal-on-RNG-failure contract as `seal_for`.
                    let sealed = crypto::seal(&self.keypair, &peer.bpub, &plaintext)
                        .expect("fatal: RNG failure while sealing a box");
                    sealed_auths.insert(spub, sealed);
                }
            }
        }
        Some(LoginTokensBundle { handle, sealed_auths })
    }

    fn send_peer_list_to(&mut self, spub: &str) {
        let peers: Vec<PeerInfo> = self
            .peers
            .values()
            .filter(|p| p.sink.is_some())
            .map(|p| PeerInfo {
                public_key: p.spub.clone(),
                since: p.since,
            })
            .collect();

        if let Some(sealed) = self.seal_for(spub, msg_type::PEER_LIST, &PeerListPayload { peers }) {
            self.enqueue_frame(spub, OutboundFrame::Text(to_json(&sealed)));
        }
    }

    fn broadcast_unsealed(&mut self, kind: &str, payload: &impl Serialize, except: Option<&str>) {
        let targets: Vec<String> = self
            .connected_peer_spubs()
            .into_iter()
            .filter(|s| Some(s.as_str()) != except)
            .collect();

        for spub in targets {
            if let Some(sealed) = self.seal_for(&spub, kind, payload) {
                self.enqueue_frame(&spub, OutboundFrame::Text(to_json(&sealed)));
            }
        }
    }

    fn broadcast_sealed(&mut self, msg: &SealedMsg) {
        let text = to_json(msg);
        for spub in self.connected_peer_spubs() {
            self.enqueue_frame(&spub, OutboundFrame::Text(text.clone()));
        }
    }

    fn seal_for(&self, spub: &str, kind: &str, payload: &impl Serialize) -> Option<SealedMsg> {
        let peer = self.peers.get(spub)?;
        let unsealed = UnsealedMsg::new(kind, payload).ok()?;
        let plaintext = serde_json::to_vec(&unsealed).ok()?;
        // The only way `seal` can fail is an RNG failure while drawing a
        // nonce, which is fatal to the process, never a dropped frame.
        Some(
            crypto::seal(&self.keypair, &peer.bpub, &plaintext)
                .expect("fatal: RNG failure while sealing a box"),
        )
    }

    fn enqueue_frame(&mut self, spub: &str, frame: OutboundFrame) {
        let Some(peer) = self.peers.get(spub) else { return };
        let Some(sink) = &peer.sink else { return };
        if sink.try_send(frame).is_err() {
            warn!(room = %self.id, peer = spub, "outbound queue full or gone, dropping peer");
            self.drop_peer(spub.to_string());
        }
    }

    fn drop_peer(&mut self, spub: String) {
        if let Some(peer) = self.peers.remove(&spub) {
            self.broadcast_unsealed(
                msg_type::PEER_LEAVE,
                &PeerLeavePayload {
                    public_key: spub,
                    since: peer.since,
                },
                None,
            );
        }
    }

    fn connected_peer_spubs(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.sink.is_some())
            .map(|p| p.spub.clone())
            .collect()
    }

    fn sweep_idle_peers(&mut self) {
        let now = Utc::now();
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.sink.is_none())
            .filter(|p| {
                let reference = p.last_message.unwrap_or(p.since);
                now.signed_duration_since(reference).num_seconds() > PEER_IDLE_TIMEOUT_SECS
            })
            .map(|p| p.spub.clone())
            .collect();

        for spub in stale {
            self.peers.remove(&spub);
        }
    }

    async fn teardown(&mut self) {
        info!(room = %self.id, "room disposing");
        for spub in self.peers.keys().cloned().collect::<Vec<_>>() {
            self.enqueue_frame(&spub, peer::close_frame(msg_type::ROOM_DISPOSE));
        }
        self.peers.clear();
        self.registry.write().await.remove(&self.id);
    }
}

async fn reject_unregistered(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: msg_type::MUST_LOGIN.into(),
        })))
        .await;
}

fn generate_secret(bpub: &[u8; PUBKEY_LEN]) -> String {
    let mut random10 = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut random10);
    let mut hasher = Sha256::new();
    hasher.update(random10);
    hasher.update(bpub);
    hex::encode(hasher.finalize())
}

fn to_json(msg: &SealedMsg) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc as StdArc;
    use tokio::sync::RwLock;

    fn test_config(id: &str) -> RoomSpawnConfig {
        RoomSpawnConfig {
            id: id.to_string(),
            name: "test room".to_string(),
            predefined: false,
            motd: String::new(),
            max_peers: 2,
            room_age: Duration::from_secs(3600),
            ws_timeout: peer::WS_TIMEOUT,
            predefined_users: Vec::new(),
            growl_handler: None,
        }
    }

    fn test_registry() -> RoomRegistry {
        StdArc::new(RwLock::new(StdHashMap::new()))
    }

    #[tokio::test]
    async fn login_then_duplicate_is_rejected() {
        let handle = Room::spawn(test_config("r1"), test_registry());
        let peer = RoomKeyPair::generate().unwrap();
        let spub = peer.spub().to_string();

        let first = handle.login(spub.clone(), String::new()).await;
        assert!(first.is_ok());

        let second = handle.login(spub, String::new()).await;
        assert!(matches!(second, Err(RoomError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn login_past_capacity_is_rejected() {
        let handle = Room::spawn(test_config("r2"), test_registry());

        let a = RoomKeyPair::generate().unwrap();
        let b = RoomKeyPair::generate().unwrap();
        let c = RoomKeyPair::generate().unwrap();

        assert!(handle.login(a.spub().to_string(), String::new()).await.is_ok());
        assert!(handle.login(b.spub().to_string(), String::new()).await.is_ok());
        let third = handle.login(c.spub().to_string(), String::new()).await;
        assert!(matches!(third, Err(RoomError::RoomCapacityExceeded)));
    }

    #[tokio::test]
    async fn malformed_spub_is_rejected() {
        let handle = Room::spawn(test_config("r3"), test_registry());
        let result = handle.login("not-base64!!".to_string(), String::new()).await;
        assert!(matches!(result, Err(RoomError::MalformedSpub)));
    }

    #[tokio::test]
    async fn dispose_on_predefined_room_is_ignored() {
        let mut config = test_config("lobby");
        config.predefined = true;
        let handle = Room::spawn(config, test_registry());

        handle.dispose().unwrap();

        // give the loop a tick to process the (ignored) dispose command,
        // then confirm it is still accepting logins.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let peer = RoomKeyPair::generate().unwrap();
        let result = handle.login(peer.spub().to_string(), String::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn server_generates_secret_when_empty() {
        let handle = Room::spawn(test_config("r4"), test_registry());
        let peer = RoomKeyPair::generate().unwrap();
        let outcome = handle.login(peer.spub().to_string(), String::new()).await.unwrap();
        assert!(!outcome.secret.is_empty());
    }

    #[tokio::test]
    async fn get_login_tokens_without_valid_token_is_none() {
        let handle = Room::spawn(test_config("r5"), test_registry());
        let bundle = handle.get_login_tokens("bogus".to_string()).await;
        assert!(bundle.is_none());
    }

    fn bare_state(id: &str, registry: RoomRegistry) -> RoomState {
        RoomState {
            id: id.to_string(),
            motd: String::new(),
            predefined: false,
            max_peers: 10,
            room_age: Duration::from_secs(3600),
            ws_timeout: peer::WS_TIMEOUT,
            keypair: RoomKeyPair::generate().unwrap(),
            peers: HashMap::new(),
            predefined_users: Vec::new(),
            growl_handler: None,
            token_store: TokenStore::new(),
            last_activity: Instant::now(),
            cmd_tx: mpsc::unbounded_channel().0,
            registry,
        }
    }

    #[tokio::test]
    async fn non_broadcast_command_still_resets_inactivity_clock() {
        let mut state = bare_state("r9", test_registry());
        state.last_activity = Instant::now() - Duration::from_secs(10_000);

        // `peer.leave` for an unknown peer is a no-op with respect to room
        // state, and never broadcasts anything — yet it must still count as
        // activity for the RoomAge timer, the same as a login or a forwarded
        // peer-to-peer frame would.
        let exited_early = state
            .handle_command(RoomCommand::PeerLeave { spub: "nobody".to_string() })
            .await;

        assert!(!exited_early);
        assert!(state.last_activity.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sweep_evicts_registered_peer_idle_past_five_minutes() {
        let mut state = bare_state("r6", test_registry());
        let peer = RoomKeyPair::generate().unwrap();
        let bpub = crypto::decode_pubkey(peer.spub()).unwrap();
        state.peers.insert(
            peer.spub().to_string(),
            PeerState {
                spub: peer.spub().to_string(),
                bpub,
                secret: "s".into(),
                since: Utc::now() - chrono::Duration::seconds(6 * 60),
                last_message: None,
                sink: None,
            },
        );

        state.sweep_idle_peers();
        assert!(state.peers.is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_freshly_registered_peer() {
        let mut state = bare_state("r7", test_registry());
        let peer = RoomKeyPair::generate().unwrap();
        let bpub = crypto::decode_pubkey(peer.spub()).unwrap();
        state.peers.insert(
            peer.spub().to_string(),
            PeerState {
                spub: peer.spub().to_string(),
                bpub,
                secret: "s".into(),
                since: Utc::now(),
                last_message: None,
                sink: None,
            },
        );

        state.sweep_idle_peers();
        assert_eq!(state.peers.len(), 1);
    }

    #[tokio::test]
    async fn dispose_twice_on_non_predefined_room_is_idempotent() {
        let handle = Room::spawn(test_config("r8"), test_registry());
        assert!(handle.dispose().is_ok());
        // A second dispose after the loop has already exited still sends
        // successfully into the (now closed) channel's buffer or errs with
        // `Gone` — either way it must never panic or double-teardown.
        let _ = handle.dispose();
    }
}
