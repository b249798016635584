use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{RoomMs, WallMs};
use crate::types::{
    DeviceInfo, Epoch, HostState, PeerId, ReadyErrorCode, Role, RoomId, Seq, SessionId,
    StartDescriptor, TrackId,
};

/// Every wire message is a JSON object discriminated by a `type` field.
/// Integer millisecond fields are 64-bit signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    Hello {
        proto_ver: u32,
        room_id: RoomId,
        peer_id: PeerId,
        role: Role,
        device_info: DeviceInfo,
    },

    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: SessionId,
        server_now_ms: RoomMs,
    },

    #[serde(rename_all = "camelCase")]
    Ping { seq: Seq, t0_client_ms: WallMs },

    #[serde(rename_all = "camelCase")]
    Pong {
        seq: Seq,
        t0_client_ms: WallMs,
        t1_server_ms: RoomMs,
    },

    #[serde(rename_all = "camelCase")]
    PeerJoin {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_info: Option<DeviceInfo>,
    },

    #[serde(rename_all = "camelCase")]
    PeerLeave {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    TrackAnnounce(TrackAnnounce),

    #[serde(rename_all = "camelCase")]
    ClientReady {
        track_id: TrackId,
        cached: bool,
        local_path: String,
        prepare_ms: i64,
    },

    #[serde(rename_all = "camelCase")]
    ClientReadyError {
        track_id: TrackId,
        error_code: ReadyErrorCode,
        error_message: String,
    },

    StartAt(StartDescriptor),

    #[serde(rename_all = "camelCase")]
    ClientStartReport {
        peer_id: PeerId,
        epoch: Epoch,
        seq: Seq,
        actual_start_room_time_ms: RoomMs,
        start_error_ms: i64,
    },

    HostState(HostState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAnnounce {
    pub room_id: RoomId,
    pub host_peer_id: PeerId,
    pub track_id: TrackId,
    pub url: String,
    pub file_hash: String,
    pub size_bytes: u64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "welcome",
    "ping",
    "pong",
    "peer_join",
    "peer_leave",
    "track_announce",
    "client_ready",
    "client_ready_error",
    "start_at",
    "client_start_report",
    "host_state",
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type field")]
    MissingType,
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
    #[error("malformed {ty:?} message: {source}")]
    Malformed {
        ty: String,
        source: serde_json::Error,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a message, tolerating peers that nest the tagged object
    /// under a `data` or `payload` envelope. Unknown types come back as
    /// a distinct error so the receiver can log them at a limited rate.
    pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let value = unwrap_envelope(value);

        let ty = value
            .get("type")
            .and_then(|ty| ty.as_str())
            .ok_or(DecodeError::MissingType)?
            .to_owned();

        if !KNOWN_TYPES.contains(&ty.as_str()) {
            return Err(DecodeError::UnknownType(ty));
        }

        serde_json::from_value(value).map_err(|source| DecodeError::Malformed { ty, source })
    }
}

/// If the top-level object carries no `type` but has a `data` or
/// `payload` object that does, decode that inner object instead.
fn unwrap_envelope(value: serde_json::Value) -> serde_json::Value {
    if value.get("type").map(|ty| ty.is_string()) == Some(true) {
        return value;
    }

    for key in ["data", "payload"] {
        if let Some(inner) = value.get(key) {
            if inner.get("type").map(|ty| ty.is_string()) == Some(true) {
                return inner.clone();
            }
        }
    }

    value
}
