use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::time::RoomMs;

#[derive(Debug, Clone, Display, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

#[derive(Debug, Clone, Display, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

#[derive(Debug, Clone, Display, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

/// Set to the wall time the host opened the room, so a replacement host
/// on the same network always sorts later.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

/// Host-assigned counter delimiting one playback session. Increments
/// only on the host; receivers drop strictly older epochs.
#[derive(Debug, Clone, Copy, Display, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

/// Per-epoch monotonic counter attached to time-sensitive messages.
#[derive(Debug, Clone, Copy, Display, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Client,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// One broadcast sample of the host's playback state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    pub room_id: RoomId,
    pub track_id: TrackId,
    pub is_playing: bool,
    pub host_pos_ms: i64,
    pub sampled_at_room_time_ms: RoomMs,
    pub epoch: Epoch,
    pub seq: Seq,
}

impl HostState {
    /// Room-time age of this sample.
    pub fn age_ms(&self, room_now: RoomMs) -> i64 {
        room_now.millis_since(self.sampled_at_room_time_ms)
    }

    pub fn is_stale(&self, room_now: RoomMs, threshold_ms: i64) -> bool {
        self.age_ms(room_now) > threshold_ms
    }
}

/// Identifies one coordinated start attempt. `(epoch, seq)` is unique
/// per attempt; retransmissions carry the same pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDescriptor {
    pub epoch: Epoch,
    pub seq: Seq,
    pub track_id: TrackId,
    pub start_at_room_time_ms: RoomMs,
    pub start_pos_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyErrorCode {
    DownloadFailed,
    HashMismatch,
    #[serde(rename = "http_4xx")]
    Http4xx,
    Timeout,
    Unknown,
}
