use heapless::Deque;

use unison_protocol::time::{RoomMs, WallMs};
use unison_protocol::types::{Epoch, Seq};

/// Samples with a round trip above this are rejected outright.
pub const RTT_CAP_MS: i64 = 200;

/// Once an offset estimate exists, a raw offset further than this from
/// it is rejected as a spike rather than folded in.
pub const OFFSET_JUMP_CAP_MS: i64 = 120;

const EMA_ALPHA: f64 = 0.1;

const RECENT_RING: usize = 30;
const GOOD_RING: usize = 5;

const LOCK_MIN_SAMPLES: u64 = 3;
const LOCK_MAX_RTT_MS: i64 = 300;
const LOCK_MAX_JITTER_MS: i64 = 100;

/// One completed ping/pong measurement. t0 and t2 are client wall
/// stamps, t1 is the host's room stamp on reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub seq: Seq,
    pub t0: WallMs,
    pub t1: RoomMs,
    pub t2: WallMs,
}

impl ClockSample {
    pub fn rtt_ms(&self) -> i64 {
        self.t2.millis_since(self.t0)
    }

    pub fn offset_raw_ms(&self) -> i64 {
        self.t1.0 - (self.t0.0 + self.t2.0) / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RttNegative,
    RttTooHigh,
    OffsetJump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Sample folded into the estimators. `lock_edge` is set when the
    /// lock state changed as a result.
    Accepted { lock_edge: Option<bool> },
    Dropped(DropReason),
}

/// Read-only view of the clock for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSnapshot {
    pub offset_ms: i64,
    pub rtt_ms: i64,
    pub jitter_ms: i64,
    pub locked: bool,
    pub sample_count: u64,
    pub dropped_count: u64,
}

/// Maps local wall time onto the host-authoritative room timeline.
///
/// Clients feed it ping/pong samples; the host side never ingests
/// samples and keeps a zero offset, acting only as the epoch/seq
/// issuer.
pub struct RoomClock {
    offset_raw: i64,
    offset_ema: i64,
    rtt_ema: f64,
    jitter_ema: f64,
    sample_count: u64,
    dropped_count: u64,
    last_drop_reason: Option<DropReason>,
    locked: bool,
    is_host: bool,
    recent: Deque<ClockSample, RECENT_RING>,
    good: Deque<ClockSample, GOOD_RING>,
    epoch: Epoch,
    next_seq: u64,
}

impl RoomClock {
    pub fn new() -> Self {
        RoomClock {
            offset_raw: 0,
            offset_ema: 0,
            rtt_ema: 0.0,
            jitter_ema: 0.0,
            sample_count: 0,
            dropped_count: 0,
            last_drop_reason: None,
            locked: false,
            is_host: false,
            recent: Deque::new(),
            good: Deque::new(),
            epoch: Epoch::default(),
            next_seq: 0,
        }
    }

    /// The host is the time authority: zero offset, always locked.
    pub fn host() -> Self {
        RoomClock {
            locked: true,
            is_host: true,
            ..RoomClock::new()
        }
    }

    pub fn room_now(&self, wall: WallMs) -> RoomMs {
        RoomMs(wall.0 + self.offset_ema)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ema
    }

    pub fn rtt_ms(&self) -> i64 {
        self.rtt_ema.round() as i64
    }

    pub fn jitter_ms(&self) -> i64 {
        self.jitter_ema.round() as i64
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn last_drop_reason(&self) -> Option<DropReason> {
        self.last_drop_reason
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            offset_ms: self.offset_ema,
            rtt_ms: self.rtt_ms(),
            jitter_ms: self.jitter_ms(),
            locked: self.locked,
            sample_count: self.sample_count,
            dropped_count: self.dropped_count,
        }
    }

    pub fn on_sample(&mut self, sample: ClockSample) -> SampleOutcome {
        let rtt = sample.rtt_ms();
        let offset_raw = sample.offset_raw_ms();

        if rtt < 0 {
            return self.drop(DropReason::RttNegative);
        }
        if rtt > RTT_CAP_MS {
            return self.drop(DropReason::RttTooHigh);
        }
        if self.offset_ema != 0 && (offset_raw - self.offset_ema).abs() > OFFSET_JUMP_CAP_MS {
            return self.drop(DropReason::OffsetJump);
        }

        push_ring(&mut self.recent, sample);
        push_ring(&mut self.good, sample);
        self.sample_count += 1;
        self.offset_raw = offset_raw;

        if self.sample_count == 1 {
            self.rtt_ema = rtt as f64;
        } else {
            self.rtt_ema = EMA_ALPHA * rtt as f64 + (1.0 - EMA_ALPHA) * self.rtt_ema;
        }
        self.jitter_ema = EMA_ALPHA * (rtt as f64 - self.rtt_ema).abs()
            + (1.0 - EMA_ALPHA) * self.jitter_ema;

        // offset follows the lowest-RTT sample of the last few accepted
        // ones, which bounds the asymmetry error to that sample's rtt/2
        let best = self
            .good
            .iter()
            .min_by_key(|s| s.rtt_ms())
            .expect("good ring is non-empty after push");
        let best_offset = best.offset_raw_ms();

        if self.offset_ema == 0 {
            self.offset_ema = best_offset;
        } else {
            let blended =
                EMA_ALPHA * best_offset as f64 + (1.0 - EMA_ALPHA) * self.offset_ema as f64;
            self.offset_ema = blended.round() as i64;
        }

        let was_locked = self.locked;
        self.locked = self.sample_count >= LOCK_MIN_SAMPLES
            && self.rtt_ms() <= LOCK_MAX_RTT_MS
            && self.jitter_ms() <= LOCK_MAX_JITTER_MS;

        let lock_edge = (self.locked != was_locked).then_some(self.locked);
        if let Some(locked) = lock_edge {
            log::info!(
                "room clock lock {}: offset={}ms rtt={}ms jitter={}ms",
                if locked { "acquired" } else { "lost" },
                self.offset_ema,
                self.rtt_ms(),
                self.jitter_ms(),
            );
        }

        SampleOutcome::Accepted { lock_edge }
    }

    fn drop(&mut self, reason: DropReason) -> SampleOutcome {
        self.dropped_count += 1;
        self.last_drop_reason = Some(reason);
        log::debug!("clock sample dropped: {reason:?}");
        SampleOutcome::Dropped(reason)
    }

    /// Clear estimators and counters. Epoch is untouched: crossing an
    /// epoch is always an explicit caller decision.
    pub fn reset(&mut self, keep_history: bool) {
        self.offset_raw = 0;
        self.offset_ema = 0;
        self.rtt_ema = 0.0;
        self.jitter_ema = 0.0;
        self.sample_count = 0;
        self.dropped_count = 0;
        self.last_drop_reason = None;
        self.locked = self.is_host;

        if !keep_history {
            self.recent.clear();
            self.good.clear();
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Host only: open a new playback session, resetting seq.
    pub fn new_epoch(&mut self) -> Epoch {
        debug_assert!(self.is_host, "only the host assigns epochs");
        self.epoch = self.epoch.next();
        self.next_seq = 0;
        self.epoch
    }

    pub fn next_seq(&mut self) -> Seq {
        let seq = Seq(self.next_seq);
        self.next_seq += 1;
        seq
    }
}

impl Default for RoomClock {
    fn default() -> Self {
        RoomClock::new()
    }
}

fn push_ring<const N: usize>(ring: &mut Deque<ClockSample, N>, sample: ClockSample) {
    if ring.is_full() {
        ring.pop_front();
    }
    // cannot fail, we just made room
    let _ = ring.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, t0: i64, t1: i64, t2: i64) -> ClockSample {
        ClockSample {
            seq: Seq(seq),
            t0: WallMs(t0),
            t1: RoomMs(t1),
            t2: WallMs(t2),
        }
    }

    /// A sample where the host clock leads the client by `offset` and
    /// the round trip is symmetric with the given rtt.
    fn offset_sample(seq: u64, t0: i64, offset: i64, rtt: i64) -> ClockSample {
        sample(seq, t0, t0 + rtt / 2 + offset, t0 + rtt)
    }

    #[test]
    fn derives_rtt_and_raw_offset() {
        let s = sample(0, 1000, 1520, 1040);
        assert_eq!(s.rtt_ms(), 40);
        assert_eq!(s.offset_raw_ms(), 500);
    }

    #[test]
    fn rejects_negative_rtt() {
        let mut clock = RoomClock::new();
        let outcome = clock.on_sample(sample(0, 1000, 1000, 990));
        assert_eq!(outcome, SampleOutcome::Dropped(DropReason::RttNegative));
        assert_eq!(clock.offset_ms(), 0);
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(clock.last_drop_reason(), Some(DropReason::RttNegative));
    }

    #[test]
    fn rejects_rtt_above_cap() {
        let mut clock = RoomClock::new();
        let outcome = clock.on_sample(offset_sample(0, 1000, 500, RTT_CAP_MS + 1));
        assert_eq!(outcome, SampleOutcome::Dropped(DropReason::RttTooHigh));
    }

    #[test]
    fn rejects_offset_jump_once_estimate_exists() {
        let mut clock = RoomClock::new();
        assert!(matches!(
            clock.on_sample(offset_sample(0, 1000, 500, 40)),
            SampleOutcome::Accepted { .. }
        ));

        let jump = offset_sample(1, 2000, 500 + OFFSET_JUMP_CAP_MS + 1, 40);
        assert_eq!(
            clock.on_sample(jump),
            SampleOutcome::Dropped(DropReason::OffsetJump)
        );
        // estimate untouched by the drop
        assert_eq!(clock.offset_ms(), 500);
    }

    #[test]
    fn drop_does_not_touch_estimators() {
        let mut clock = RoomClock::new();
        clock.on_sample(offset_sample(0, 1000, 500, 40));
        let (offset, rtt) = (clock.offset_ms(), clock.rtt_ms());

        clock.on_sample(offset_sample(1, 2000, 500, 300));

        assert_eq!(clock.offset_ms(), offset);
        assert_eq!(clock.rtt_ms(), rtt);
        assert_eq!(clock.sample_count(), 1);
    }

    #[test]
    fn locks_after_three_good_samples() {
        let mut clock = RoomClock::new();

        assert!(!clock.is_locked());
        clock.on_sample(offset_sample(0, 1000, 500, 40));
        clock.on_sample(offset_sample(1, 1800, 500, 42));
        assert!(!clock.is_locked());

        let outcome = clock.on_sample(offset_sample(2, 2600, 500, 41));
        assert_eq!(outcome, SampleOutcome::Accepted { lock_edge: Some(true) });
        assert!(clock.is_locked());

        // steady samples produce no further edge
        let outcome = clock.on_sample(offset_sample(3, 3400, 500, 40));
        assert_eq!(outcome, SampleOutcome::Accepted { lock_edge: None });
    }

    #[test]
    fn offset_follows_min_rtt_sample() {
        let mut clock = RoomClock::new();

        // first sample seeds the estimate
        clock.on_sample(offset_sample(0, 1000, 510, 100));
        assert_eq!(clock.offset_ms(), 510);

        // a lower-rtt sample with a slightly different offset becomes
        // the selected best; the estimate moves toward it by alpha
        clock.on_sample(offset_sample(1, 1800, 520, 20));
        let expected = (0.1 * 520.0 + 0.9 * 510.0_f64).round() as i64;
        assert_eq!(clock.offset_ms(), expected);
    }

    #[test]
    fn room_now_applies_offset() {
        let mut clock = RoomClock::new();
        clock.on_sample(offset_sample(0, 1000, 500, 40));
        assert_eq!(clock.room_now(WallMs(5000)), RoomMs(5500));
    }

    #[test]
    fn room_now_monotone_under_steady_network() {
        let mut clock = RoomClock::new();
        let mut wall = 1000;

        for seq in 0..10 {
            clock.on_sample(offset_sample(seq, wall, 500, 30));
            wall += 800;
        }

        let mut last = clock.room_now(WallMs(wall));
        for _ in 0..20 {
            wall += 5;
            clock.on_sample(offset_sample(99, wall, 500, 30));
            let now = clock.room_now(WallMs(wall));
            assert!(now >= last, "room time went backwards: {now:?} < {last:?}");
            last = now;
        }
    }

    #[test]
    fn reset_clears_estimators_and_lock() {
        let mut clock = RoomClock::new();
        for seq in 0..5 {
            clock.on_sample(offset_sample(seq, 1000 + seq as i64 * 800, 500, 40));
        }
        assert!(clock.is_locked());

        clock.reset(false);

        assert!(!clock.is_locked());
        assert_eq!(clock.offset_ms(), 0);
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(clock.room_now(WallMs(7000)), RoomMs(7000));
    }

    #[test]
    fn host_clock_is_identity_and_issues_epochs() {
        let mut clock = RoomClock::host();

        assert!(clock.is_locked());
        assert_eq!(clock.room_now(WallMs(1234)), RoomMs(1234));

        let e1 = clock.new_epoch();
        assert_eq!(clock.next_seq(), Seq(0));
        assert_eq!(clock.next_seq(), Seq(1));

        let e2 = clock.new_epoch();
        assert!(e2 > e1);
        assert_eq!(clock.next_seq(), Seq(0));
    }

    #[test]
    fn good_ring_keeps_last_five() {
        let mut clock = RoomClock::new();

        // a very low-rtt early sample must age out of the selection
        clock.on_sample(offset_sample(0, 1000, 500, 2));
        for seq in 1..=5 {
            clock.on_sample(offset_sample(seq, 1000 + seq as i64 * 800, 500, 60 + seq as i64));
        }

        // best-of-ring is now the rtt=61 sample, not the aged rtt=2 one
        let best = clock.good.iter().min_by_key(|s| s.rtt_ms()).unwrap();
        assert_eq!(best.rtt_ms(), 61);
    }
}
