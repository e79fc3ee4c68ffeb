//! Wire types exchanged between a peer and a room: the sealed envelope, the
//! unsealed control message it carries, and the typed payloads for each
//! server-originated and peer-originated message `type`.
//!
//! Every timestamp that crosses the wire uses the exact millisecond
//! ISO-8601 format `YYYY-MM-DDTHH:MM:SS.sssZ` via the [`since_format`]
//! module; timestamps that never leave the process (eviction deadlines,
//! token expiry bookkeeping) use `tokio::time::Instant` instead and never
//! appear in this file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A sealed, authenticated envelope — the only shape that ever crosses the
/// wire. `data` decrypts (when addressed to the room) to an [`UnsealedMsg`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMsg {
    pub from: String,
    pub to: String,
    pub nonce: String,
    pub data: String,
}

/// The control message carried inside a sealed envelope once opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealedMsg {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl UnsealedMsg {
    pub fn new<T: Serialize>(kind: &str, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data)?,
        })
    }
}

// ─── type constants ───────────────────────────────────────────────────────

pub mod msg_type {
    pub const PEER_LIST: &str = "peer.list";
    pub const PEER_JOIN: &str = "peer.join";
    pub const PEER_LEAVE: &str = "peer.leave";
    pub const MOTD: &str = "motd";
    pub const ROOM_DISPOSE: &str = "room.dispose";
    pub const PEER_RATELIMITED: &str = "peer.ratelimited";
    pub const ROOM_FULL: &str = "room.full";
    pub const MUST_LOGIN: &str = "must.login";
    pub const GROWL: &str = "growl";
}

// ─── server -> peer payloads ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(with = "since_format")]
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJoinPayload {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(with = "since_format")]
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeavePayload {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(with = "since_format")]
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotdPayload {
    pub message: String,
}

// ─── peer -> server payloads ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowlPayload {
    pub to: String,
    pub from: String,
    pub msg: String,
}

// ─── HTTP login response (glue, not core state) ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub secret: String,
    #[serde(with = "since_format")]
    pub since: DateTime<Utc>,
    #[serde(rename = "serverpubkey")]
    pub server_pub_key: String,
    /// Empty unless an auto-login token was supplied.
    pub handle: String,
    #[serde(rename = "sealedauths")]
    pub sealed_auths: HashMap<String, SealedMsg>,
}

/// Body of the sealed auto-login bundle (`{secret, date}`), sealed once per
/// peer inside `GetLoginTokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedAuthBody {
    pub secret: String,
    #[serde(rename = "date", with = "since_format")]
    pub date: DateTime<Utc>,
}

/// `YYYY-MM-DDTHH:MM:SS.sssZ` — three-digit milliseconds, literal `Z`, the
/// only timestamp format this wire protocol accepts.
pub mod since_format {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}Z", date.format(FORMAT)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let trimmed = s.strip_suffix('Z').ok_or_else(|| {
            serde::de::Error::custom(format!("timestamp {s:?} missing trailing Z"))
        })?;
        let naive = NaiveDateTime::parse_from_str(trimmed, FORMAT)
            .map_err(|e| serde::de::Error::custom(format!("bad timestamp {s:?}: {e}")))?;
        Ok(Utc.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "since_format")]
        since: DateTime<Utc>,
    }

    #[test]
    fn since_format_roundtrips_with_millis() {
        let t = Utc.with_ymd_and_hms(2026, 7, 26, 1, 2, 3).unwrap()
            + chrono::Duration::milliseconds(456);
        let w = Wrapper { since: t };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.ends_with("456Z\""), "got {json}");

        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.since, t);
    }

    #[test]
    fn since_format_rejects_missing_z() {
        let json = r#"{"since":"2026-07-26T01:02:03.456"}"#;
        assert!(serde_json::from_str::<Wrapper>(json).is_err());
    }

    #[test]
    fn unsealed_msg_roundtrips_through_json_value() {
        let payload = MotdPayload {
            message: "welcome".into(),
        };
        let msg = UnsealedMsg::new(msg_type::MOTD, &payload).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"motd\""));

        let back: UnsealedMsg = serde_json::from_str(&json).unwrap();
        let back_payload: MotdPayload = serde_json::from_value(back.data).unwrap();
        assert_eq!(back_payload.message, "welcome");
    }
}
