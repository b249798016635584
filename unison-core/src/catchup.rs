use unison_protocol::time::{RoomMs, WallMs};
use unison_protocol::types::{Epoch, HostState};

/// Lead time given to load and seek before the timed play.
pub const PREPARE_MS: i64 = 300;

/// Minimum spacing between catch-up attempts.
pub const RETRY_DEBOUNCE_MS: i64 = 1500;

/// Where and when a catch-up lands: seek to `seek_pos_ms`, then play at
/// `target_room_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpPlan {
    pub target_room_time: RoomMs,
    pub seek_pos_ms: i64,
}

/// Gate bookkeeping for the once-per-epoch catch-up.
///
/// The caller is expected to call [`CatchUp::try_begin`] on the event
/// that completed the trigger (host playing, track ready, clock
/// locked), do the async load/seek/play work only if it returns true,
/// and call [`CatchUp::finish`] when that work ends either way.
pub struct CatchUp {
    in_flight: bool,
    done_epoch: Option<Epoch>,
    last_attempt_at: Option<WallMs>,
}

impl CatchUp {
    pub fn new() -> Self {
        CatchUp {
            in_flight: false,
            done_epoch: None,
            last_attempt_at: None,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn done_epoch(&self) -> Option<Epoch> {
        self.done_epoch
    }

    /// All three gates, checked and latched atomically with respect to
    /// the caller's single-threaded loop: marking in-flight and
    /// done-epoch happens here, before any async work, so concurrent
    /// triggers serialize on the first one.
    pub fn try_begin(&mut self, epoch: Epoch, now_wall: WallMs) -> bool {
        if self.in_flight {
            log::debug!("catch-up skipped: already in flight");
            return false;
        }
        if self.done_epoch == Some(epoch) {
            log::debug!("catch-up skipped: already done for epoch {epoch}");
            return false;
        }
        if let Some(last) = self.last_attempt_at {
            if now_wall.millis_since(last) < RETRY_DEBOUNCE_MS {
                log::debug!("catch-up skipped: attempted too recently");
                return false;
            }
        }

        self.in_flight = true;
        self.done_epoch = Some(epoch);
        self.last_attempt_at = Some(now_wall);
        true
    }

    /// The attempt finished. A failed attempt leaves `done_epoch` set
    /// so stale host states do not retry in a tight loop; recovery
    /// needs a fresh isPlaying edge.
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    /// Host transitioned isPlaying false -> true: the next completed
    /// trigger may catch up again, even within the same epoch.
    pub fn on_playing_edge(&mut self) {
        self.done_epoch = None;
    }

    /// Predict where the host will be at `room_now + PREPARE_MS` and
    /// aim there, compensated and clamped to the track.
    pub fn plan(
        host: &HostState,
        room_now: RoomMs,
        latency_comp_ms: i64,
        duration_ms: i64,
    ) -> CatchUpPlan {
        let target_room_time = room_now.add_ms(PREPARE_MS);
        let elapsed = target_room_time.millis_since(host.sampled_at_room_time_ms);
        let seek_pos_ms =
            (host.host_pos_ms + elapsed - latency_comp_ms).clamp(0, duration_ms.max(0));

        CatchUpPlan {
            target_room_time,
            seek_pos_ms,
        }
    }
}

impl Default for CatchUp {
    fn default() -> Self {
        CatchUp::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_protocol::types::{RoomId, Seq, TrackId};

    fn host(pos: i64, sampled_at: i64) -> HostState {
        HostState {
            room_id: RoomId("r".into()),
            track_id: TrackId("t".into()),
            is_playing: true,
            host_pos_ms: pos,
            sampled_at_room_time_ms: RoomMs(sampled_at),
            epoch: Epoch(1),
            seq: Seq(0),
        }
    }

    #[test]
    fn plan_predicts_host_position_at_target() {
        let plan = CatchUp::plan(&host(42_000, 20_000), RoomMs(20_150), 100, 300_000);

        assert_eq!(plan.target_room_time, RoomMs(20_450));
        // 42000 + 450 elapsed - 100 comp
        assert_eq!(plan.seek_pos_ms, 42_350);
    }

    #[test]
    fn plan_clamps_to_track_bounds() {
        let past_end = CatchUp::plan(&host(299_900, 20_000), RoomMs(20_150), 0, 300_000);
        assert_eq!(past_end.seek_pos_ms, 300_000);

        let before_start = CatchUp::plan(&host(0, 20_000), RoomMs(20_150), 500, 300_000);
        assert_eq!(before_start.seek_pos_ms, 0);
    }

    #[test]
    fn runs_once_per_epoch() {
        let mut cu = CatchUp::new();

        assert!(cu.try_begin(Epoch(1), WallMs(1_000)));
        cu.finish();

        // same epoch, well past the debounce: still refused
        assert!(!cu.try_begin(Epoch(1), WallMs(10_000)));

        // new epoch runs again
        assert!(cu.try_begin(Epoch(2), WallMs(20_000)));
    }

    #[test]
    fn in_flight_gate_serializes_concurrent_triggers() {
        let mut cu = CatchUp::new();

        assert!(cu.try_begin(Epoch(1), WallMs(1_000)));
        // a second trigger while the first is mid-work
        assert!(!cu.try_begin(Epoch(2), WallMs(1_001)));

        cu.finish();
        assert!(cu.try_begin(Epoch(2), WallMs(10_000)));
    }

    #[test]
    fn attempts_are_debounced() {
        let mut cu = CatchUp::new();

        assert!(cu.try_begin(Epoch(1), WallMs(1_000)));
        cu.finish();
        cu.on_playing_edge();

        // the playing edge re-arms the epoch gate, but not the debounce
        assert!(!cu.try_begin(Epoch(1), WallMs(2_000)));
        assert!(cu.try_begin(Epoch(1), WallMs(2_501)));
    }

    #[test]
    fn playing_edge_rearms_same_epoch() {
        let mut cu = CatchUp::new();

        assert!(cu.try_begin(Epoch(1), WallMs(1_000)));
        cu.finish();
        assert_eq!(cu.done_epoch(), Some(Epoch(1)));

        cu.on_playing_edge();
        assert_eq!(cu.done_epoch(), None);
        assert!(cu.try_begin(Epoch(1), WallMs(10_000)));
    }

    #[test]
    fn failure_keeps_epoch_latched() {
        let mut cu = CatchUp::new();

        assert!(cu.try_begin(Epoch(1), WallMs(1_000)));
        // the attempt fails; finish() still leaves done_epoch set
        cu.finish();
        assert!(!cu.try_begin(Epoch(1), WallMs(60_000)));
    }
}
