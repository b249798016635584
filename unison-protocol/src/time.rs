use serde::{Deserialize, Serialize};

/// A millisecond instant on the local wall clock.
///
/// Wall instants are only meaningful on the machine that produced them.
/// They are used for cooldown and interval bookkeeping, never for
/// position math between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WallMs(pub i64);

impl WallMs {
    pub fn add_ms(self, ms: i64) -> WallMs {
        WallMs(self.0.checked_add(ms).expect("overflow in WallMs::add_ms"))
    }

    /// Signed milliseconds from `earlier` to `self`.
    pub fn millis_since(self, earlier: WallMs) -> i64 {
        self.0 - earlier.0
    }
}

/// A millisecond instant on the room clock, the host-authoritative
/// timeline all peers agree on: `room = wall + offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomMs(pub i64);

impl RoomMs {
    pub fn add_ms(self, ms: i64) -> RoomMs {
        RoomMs(self.0.checked_add(ms).expect("overflow in RoomMs::add_ms"))
    }

    /// Signed milliseconds from `earlier` to `self`.
    pub fn millis_since(self, earlier: RoomMs) -> i64 {
        self.0 - earlier.0
    }
}
