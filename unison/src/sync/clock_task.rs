use std::collections::HashMap;
use std::time::Duration;

use unison_core::clock::ClockSample;
use unison_protocol::time::{RoomMs, WallMs};
use unison_protocol::types::Seq;

pub const NORMAL_INTERVAL: Duration = Duration::from_millis(800);
pub const BACKGROUND_INTERVAL: Duration = Duration::from_millis(2_000);
pub const FAST_INTERVAL: Duration = Duration::from_millis(200);

/// Pings taken at the fast cadence after returning to the foreground.
const FAST_RECOVERY_PINGS: u8 = 3;

/// An unanswered ping is forgotten after this long.
const PING_EXPIRY_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Normal,
    Background,
    FastRecovery,
}

/// Ping/pong bookkeeping for the clock synchronizer. The facade loop
/// owns the timer; this type decides the cadence, stamps outgoing
/// pings, and matches pongs back into clock samples.
pub struct ClockTask {
    in_flight: HashMap<Seq, WallMs>,
    next_seq: u64,
    foreground: bool,
    fast_remaining: u8,
}

impl ClockTask {
    pub fn new() -> Self {
        ClockTask {
            in_flight: HashMap::new(),
            next_seq: 0,
            foreground: true,
            fast_remaining: 0,
        }
    }

    pub fn cadence(&self) -> Cadence {
        if self.fast_remaining > 0 {
            Cadence::FastRecovery
        } else if self.foreground {
            Cadence::Normal
        } else {
            Cadence::Background
        }
    }

    /// Time until the next ping after the one just sent.
    pub fn interval(&self) -> Duration {
        match self.cadence() {
            Cadence::Normal => NORMAL_INTERVAL,
            Cadence::Background => BACKGROUND_INTERVAL,
            Cadence::FastRecovery => FAST_INTERVAL,
        }
    }

    /// A background -> foreground edge triggers a short burst of fast
    /// pings to re-converge the clock.
    pub fn set_foreground(&mut self, foreground: bool) {
        if foreground && !self.foreground {
            self.fast_remaining = FAST_RECOVERY_PINGS;
        }
        self.foreground = foreground;
    }

    /// Stamp and register an outgoing ping.
    pub fn make_ping(&mut self, now: WallMs) -> (Seq, WallMs) {
        self.expire(now);

        let seq = Seq(self.next_seq);
        self.next_seq += 1;
        self.in_flight.insert(seq, now);

        if self.fast_remaining > 0 {
            self.fast_remaining -= 1;
        }

        (seq, now)
    }

    /// Match a pong against its in-flight ping. Unknown, duplicate, and
    /// expired pongs yield nothing.
    pub fn on_pong(&mut self, seq: Seq, t1: RoomMs, now: WallMs) -> Option<ClockSample> {
        let t0 = self.in_flight.remove(&seq)?;

        if now.millis_since(t0) > PING_EXPIRY_MS {
            log::debug!("discarding expired pong: seq={seq}");
            return None;
        }

        Some(ClockSample { seq, t0, t1, t2: now })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn expire(&mut self, now: WallMs) {
        self.in_flight
            .retain(|_, t0| now.millis_since(*t0) <= PING_EXPIRY_MS);
    }
}

impl Default for ClockTask {
    fn default() -> Self {
        ClockTask::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_completes_a_sample() {
        let mut task = ClockTask::new();

        let (seq, t0) = task.make_ping(WallMs(1_000));
        let sample = task.on_pong(seq, RoomMs(1_520), WallMs(1_040)).unwrap();

        assert_eq!(sample.t0, t0);
        assert_eq!(sample.rtt_ms(), 40);
        assert_eq!(task.in_flight(), 0);
    }

    #[test]
    fn duplicate_pong_is_dropped() {
        let mut task = ClockTask::new();
        let (seq, _) = task.make_ping(WallMs(1_000));

        assert!(task.on_pong(seq, RoomMs(1_520), WallMs(1_040)).is_some());
        assert!(task.on_pong(seq, RoomMs(1_520), WallMs(1_080)).is_none());
    }

    #[test]
    fn late_pong_is_dropped() {
        let mut task = ClockTask::new();
        let (seq, _) = task.make_ping(WallMs(1_000));

        assert!(task.on_pong(seq, RoomMs(9_999), WallMs(3_100)).is_none());
    }

    #[test]
    fn unanswered_pings_expire() {
        let mut task = ClockTask::new();
        for i in 0..3 {
            task.make_ping(WallMs(1_000 + i * 100));
        }
        assert_eq!(task.in_flight(), 3);

        task.make_ping(WallMs(4_000));
        assert_eq!(task.in_flight(), 1);
    }

    #[test]
    fn cadences_are_mutually_exclusive() {
        let mut task = ClockTask::new();
        assert_eq!(task.cadence(), Cadence::Normal);
        assert_eq!(task.interval(), NORMAL_INTERVAL);

        task.set_foreground(false);
        assert_eq!(task.cadence(), Cadence::Background);
        assert_eq!(task.interval(), BACKGROUND_INTERVAL);

        // returning to the foreground runs three fast pings, then
        // settles back to normal
        task.set_foreground(true);
        assert_eq!(task.cadence(), Cadence::FastRecovery);
        for _ in 0..3 {
            assert_eq!(task.interval(), FAST_INTERVAL);
            task.make_ping(WallMs(5_000));
        }
        assert_eq!(task.cadence(), Cadence::Normal);
    }

    #[test]
    fn foreground_start_is_not_a_recovery_edge() {
        let mut task = ClockTask::new();
        task.set_foreground(true);
        assert_eq!(task.cadence(), Cadence::Normal);
    }
}
