use heapless::Deque;

use unison_protocol::time::RoomMs;

use crate::keepsync::{Action, NoopReason};

/// Window retention: whichever of these trims first wins.
pub const WINDOW_CAP: usize = 600;
pub const WINDOW_SPAN_MS: i64 = 120_000;

const SHORT_SPAN_MS: i64 = 30_000;
const SEEK_RATE_SPAN_MS: i64 = 60_000;

const P95_TRIP_MS: i64 = 60;
const P95_SUSTAIN_MS: i64 = 10_000;
const SEEK_TRIP_COUNT: u32 = 3;
const STALE_STREAK_TRIP: u32 = 5;
const PROTECTION_HOLD_MS: i64 = 10_000;

/// Bounds applied by the facade while protection mode is active.
pub const PROTECTED_MIN_SPEED: f64 = 0.985;
pub const PROTECTED_MAX_SPEED: f64 = 1.015;
pub const PROTECTED_MIN_SEEK_DELTA_MS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Noop,
    SetSpeed,
    Seek,
}

/// One recorded decision.
#[derive(Debug, Clone, Copy)]
pub struct SyncSample {
    pub ts: RoomMs,
    pub delta_ms: i64,
    pub audible_pos_ms: i64,
    pub target_pos_ms: i64,
    pub rtt_ms: i64,
    pub jitter_ms: i64,
    pub speed: f64,
    pub action: ActionKind,
}

/// Statistics over one window. Magnitude statistics (mean, stdev,
/// percentiles, in-band fraction) are computed over |delta|.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    pub stdev: f64,
    pub p50: i64,
    pub p95: i64,
    pub p99: i64,
    pub within_30ms: f64,
    pub seeks: u32,
    pub speed_sets: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionTrigger {
    P95Sustained,
    SeekTooFrequent,
    StaleStreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionEvent {
    Entered(ProtectionTrigger),
    Exited,
}

#[derive(Debug, Clone, Copy)]
struct ProtectionState {
    entered_at: RoomMs,
    trigger: ProtectionTrigger,
}

/// Rolling decision window plus the protection-mode derivation on top
/// of it.
pub struct SyncMetrics {
    window: Box<Deque<SyncSample, WINDOW_CAP>>,
    stale_streak: u32,
    p95_high_since: Option<RoomMs>,
    protection: Option<ProtectionState>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        SyncMetrics {
            window: Box::new(Deque::new()),
            stale_streak: 0,
            p95_high_since: None,
            protection: None,
        }
    }

    pub fn stale_streak(&self) -> u32 {
        self.stale_streak
    }

    pub fn in_protection(&self) -> bool {
        self.protection.is_some()
    }

    pub fn protection_trigger(&self) -> Option<ProtectionTrigger> {
        self.protection.map(|p| p.trigger)
    }

    /// Append one decision and re-derive protection mode.
    ///
    /// `stale_drop` marks decisions dropped for host-state staleness;
    /// any other decision resets the streak.
    pub fn record(&mut self, sample: SyncSample, stale_drop: bool) -> Option<ProtectionEvent> {
        if stale_drop {
            self.stale_streak += 1;
        } else {
            self.stale_streak = 0;
        }

        self.evict(sample.ts);
        if self.window.is_full() {
            self.window.pop_front();
        }
        let _ = self.window.push_back(sample);

        self.derive_protection(sample.ts, sample.action == ActionKind::Seek)
    }

    /// Stats over samples no older than `span_ms` before `now`.
    pub fn window_stats(&self, now: RoomMs, span_ms: i64) -> WindowStats {
        let cutoff = now.0 - span_ms;
        let mut magnitudes: Vec<i64> = Vec::new();
        let mut stats = WindowStats::default();

        for sample in self.window.iter().filter(|s| s.ts.0 >= cutoff) {
            magnitudes.push(sample.delta_ms.abs());
            match sample.action {
                ActionKind::Seek => stats.seeks += 1,
                ActionKind::SetSpeed => stats.speed_sets += 1,
                ActionKind::Noop => {}
            }
        }

        stats.count = magnitudes.len();
        if stats.count == 0 {
            return stats;
        }

        let n = magnitudes.len() as f64;
        let mean = magnitudes.iter().sum::<i64>() as f64 / n;
        let variance = magnitudes
            .iter()
            .map(|m| {
                let d = *m as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        magnitudes.sort_unstable();
        stats.mean = mean;
        stats.stdev = variance.sqrt();
        stats.p50 = percentile(&magnitudes, 0.50);
        stats.p95 = percentile(&magnitudes, 0.95);
        stats.p99 = percentile(&magnitudes, 0.99);
        stats.within_30ms =
            magnitudes.iter().filter(|m| **m <= 30).count() as f64 / n;

        stats
    }

    pub fn stats_30s(&self, now: RoomMs) -> WindowStats {
        self.window_stats(now, SHORT_SPAN_MS)
    }

    pub fn stats_120s(&self, now: RoomMs) -> WindowStats {
        self.window_stats(now, WINDOW_SPAN_MS)
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.stale_streak = 0;
        self.p95_high_since = None;
        self.protection = None;
    }

    fn evict(&mut self, now: RoomMs) {
        let cutoff = now.0 - WINDOW_SPAN_MS;
        while let Some(front) = self.window.front() {
            if front.ts.0 >= cutoff {
                break;
            }
            self.window.pop_front();
        }
    }

    fn derive_protection(&mut self, now: RoomMs, just_seeked: bool) -> Option<ProtectionEvent> {
        if let Some(active) = self.protection {
            if now.millis_since(active.entered_at) < PROTECTION_HOLD_MS {
                return None;
            }
            self.protection = None;
            // a trigger still hot at hold expiry re-enters, restamped
            if let Some(trigger) = self.check_triggers(now, just_seeked) {
                self.enter(now, trigger);
                return Some(ProtectionEvent::Entered(trigger));
            }
            log::info!("protection mode exited");
            return Some(ProtectionEvent::Exited);
        }

        let trigger = self.check_triggers(now, just_seeked)?;
        self.enter(now, trigger);
        Some(ProtectionEvent::Entered(trigger))
    }

    fn enter(&mut self, now: RoomMs, trigger: ProtectionTrigger) {
        self.protection = Some(ProtectionState { entered_at: now, trigger });
        // the p95 sustain timer restarts from scratch after this episode
        self.p95_high_since = None;
        log::warn!("protection mode entered: {trigger:?}");
    }

    fn check_triggers(&mut self, now: RoomMs, just_seeked: bool) -> Option<ProtectionTrigger> {
        if self.stale_streak >= STALE_STREAK_TRIP {
            return Some(ProtectionTrigger::StaleStreak);
        }

        // seek rate is judged when a seek happens, not retroactively on
        // every later sample, so one burst cannot re-trip after exit
        if just_seeked {
            let seeks_recent = self
                .window
                .iter()
                .filter(|s| s.ts.0 >= now.0 - SEEK_RATE_SPAN_MS && s.action == ActionKind::Seek)
                .count() as u32;
            if seeks_recent > SEEK_TRIP_COUNT {
                return Some(ProtectionTrigger::SeekTooFrequent);
            }
        }

        let short = self.stats_30s(now);
        if short.count > 0 && short.p95 > P95_TRIP_MS {
            let since = *self.p95_high_since.get_or_insert(now);
            if now.millis_since(since) >= P95_SUSTAIN_MS {
                return Some(ProtectionTrigger::P95Sustained);
            }
        } else {
            self.p95_high_since = None;
        }

        None
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        SyncMetrics::new()
    }
}

/// Narrow an accepted decision while protection mode is active: speed
/// commands clamp to the protected band and seeks under the floor are
/// swallowed.
pub fn restrict_action(action: Action, delta_ms: i64) -> Action {
    match action {
        Action::SetSpeed { rate, reason } => Action::SetSpeed {
            rate: rate.clamp(PROTECTED_MIN_SPEED, PROTECTED_MAX_SPEED),
            reason,
        },
        Action::Seek { .. } if delta_ms.abs() < PROTECTED_MIN_SEEK_DELTA_MS => {
            Action::Noop(NoopReason::SeekSuppressedByProtection)
        }
        other => other,
    }
}

fn percentile(sorted: &[i64], p: f64) -> i64 {
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}
