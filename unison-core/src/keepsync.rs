use unison_protocol::time::{RoomMs, WallMs};
use unison_protocol::types::{Epoch, HostState, TrackId};

/// Tuning for the rate-nudge controller. The default profile suits
/// outputs with native rate control; [`KeepSyncConfig::ios_safe`] is the
/// conservative variant for platforms where rate changes are audible or
/// unsupported.
#[derive(Debug, Clone)]
pub struct KeepSyncConfig {
    pub deadband_ms: i64,
    pub seek_threshold_ms: i64,
    pub seek_cooldown_ms: i64,
    pub speed_cooldown_after_seek_ms: i64,
    pub speed_interval_ms: i64,
    pub reverse_guard_threshold_ms: i64,
    pub reverse_guard_hold_ms: i64,
    pub prediction_window_ms: i64,
    pub gain: f64,
    pub speed_alpha: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub max_step: f64,
    pub min_emit_step: f64,
    pub stale_threshold_ms: i64,
    pub high_jitter_ms: i64,
    pub high_rtt_ms: i64,
    /// When set, the speed region collapses to a noop inside the
    /// decision itself and alignment relies on the seek path alone, so
    /// the internal rate model never drifts from a player whose rate
    /// is pinned.
    pub rate_control_disabled: bool,
}

impl Default for KeepSyncConfig {
    fn default() -> Self {
        KeepSyncConfig {
            deadband_ms: 30,
            seek_threshold_ms: 1000,
            seek_cooldown_ms: 1500,
            speed_cooldown_after_seek_ms: 500,
            speed_interval_ms: 400,
            reverse_guard_threshold_ms: 120,
            reverse_guard_hold_ms: 800,
            prediction_window_ms: 500,
            gain: 2e-4,
            speed_alpha: 0.2,
            min_speed: 0.96,
            max_speed: 1.04,
            max_step: 0.005,
            min_emit_step: 0.002,
            stale_threshold_ms: unison_protocol::DEFAULT_STALE_THRESHOLD_MS,
            high_jitter_ms: 40,
            high_rtt_ms: 120,
            rate_control_disabled: false,
        }
    }
}

impl KeepSyncConfig {
    /// Narrow speed range, smaller steps, longer intervals. Rate
    /// changes on these outputs pump audibly, so the controller moves
    /// less and seeks earlier.
    pub fn ios_safe() -> Self {
        KeepSyncConfig {
            deadband_ms: 40,
            seek_threshold_ms: 1200,
            seek_cooldown_ms: 2000,
            speed_cooldown_after_seek_ms: 700,
            speed_interval_ms: 800,
            reverse_guard_threshold_ms: 150,
            reverse_guard_hold_ms: 1000,
            gain: 1e-4,
            min_speed: 0.98,
            max_speed: 1.02,
            max_step: 0.003,
            rate_control_disabled: true,
            ..KeepSyncConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopReason {
    NotPlaying,
    ClockNotLocked,
    StaleHostState,
    Hold,
    WithinDeadband,
    SeekCooldown,
    SpeedCooldownAfterSeek,
    SpeedInterval,
    SpeedChangeTooSmall,
    SeekSuppressedByProtection,
    RateControlDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedReason {
    Nudge,
    ReturnToNormal,
    ReverseGuard,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Noop(NoopReason),
    SetSpeed { rate: f64, reason: SpeedReason },
    Seek { target_ms: i64 },
}

impl Action {
    pub fn is_noop(&self) -> bool {
        matches!(self, Action::Noop(_))
    }
}

/// One evaluated host-state sample: the chosen action plus the derived
/// quantities the metrics window records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub delta_ms: i64,
    pub predicted_delta_ms: i64,
    pub target_pos_ms: i64,
}

/// Everything the decision needs besides the host sample itself.
#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub room_now: RoomMs,
    pub now_wall: WallMs,
    pub client_pos_ms: i64,
    pub duration_ms: i64,
    pub latency_comp_ms: i64,
    pub clock_locked: bool,
    pub jitter_ms: i64,
    pub rtt_ms: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepSyncCounters {
    pub seeks: u64,
    pub speed_sets: u64,
    pub dropped_host_states: u64,
}

/// The rate controller: given host state and the client's own position,
/// pick one of {noop, set_speed, seek}. Pure bookkeeping; the caller
/// executes the action against the player.
///
/// Cooldowns and intervals compare local wall time. Room time only
/// enters position math.
pub struct KeepSync {
    config: KeepSyncConfig,
    current_speed: f64,
    speed_ema: f64,
    last_speed_set_at: Option<WallMs>,
    last_seek_at: Option<WallMs>,
    active_epoch: Option<Epoch>,
    active_track: Option<TrackId>,
    last_delta_sign: i8,
    hold_until: Option<WallMs>,
    counters: KeepSyncCounters,
    last_dropped_reason: Option<NoopReason>,
}

impl KeepSync {
    pub fn new(config: KeepSyncConfig) -> Self {
        KeepSync {
            config,
            current_speed: 1.0,
            speed_ema: 1.0,
            last_speed_set_at: None,
            last_seek_at: None,
            active_epoch: None,
            active_track: None,
            last_delta_sign: 0,
            hold_until: None,
            counters: KeepSyncCounters::default(),
            last_dropped_reason: None,
        }
    }

    pub fn config(&self) -> &KeepSyncConfig {
        &self.config
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    pub fn counters(&self) -> KeepSyncCounters {
        self.counters
    }

    pub fn last_dropped_reason(&self) -> Option<NoopReason> {
        self.last_dropped_reason
    }

    pub fn decide(&mut self, host: &HostState, client: &ClientSnapshot) -> Decision {
        let elapsed = host.age_ms(client.room_now);
        let target_pos = (host.host_pos_ms + elapsed - client.latency_comp_ms)
            .clamp(0, client.duration_ms.max(0));
        let delta = target_pos - client.client_pos_ms;
        let predicted = predicted_delta(delta, self.current_speed, self.config.prediction_window_ms);

        let decision = |action| Decision {
            action,
            delta_ms: delta,
            predicted_delta_ms: predicted,
            target_pos_ms: target_pos,
        };

        // drop conditions
        if !host.is_playing {
            self.last_dropped_reason = Some(NoopReason::NotPlaying);
            return decision(Action::Noop(NoopReason::NotPlaying));
        }
        if !client.clock_locked {
            self.last_dropped_reason = Some(NoopReason::ClockNotLocked);
            return decision(Action::Noop(NoopReason::ClockNotLocked));
        }
        if elapsed > self.config.stale_threshold_ms {
            self.counters.dropped_host_states += 1;
            self.last_dropped_reason = Some(NoopReason::StaleHostState);
            return decision(Action::Noop(NoopReason::StaleHostState));
        }

        // a new epoch or track invalidates all pacing state
        if self.active_epoch != Some(host.epoch) || self.active_track.as_ref() != Some(&host.track_id)
        {
            self.reset_pacing();
            self.active_epoch = Some(host.epoch);
            self.active_track = Some(host.track_id.clone());
        }

        let now = client.now_wall;

        // 1. hold: pin speed to 1.0 until the hold expires
        if let Some(hold_until) = self.hold_until {
            if hold_until > now {
                if self.current_speed != 1.0 {
                    return decision(self.emit_speed(1.0, SpeedReason::Hold, now));
                }
                return decision(Action::Noop(NoopReason::Hold));
            }
            self.hold_until = None;
        }

        // 2. dead-band
        if predicted.abs() <= self.config.deadband_ms {
            if self.current_speed != 1.0 && self.speed_interval_elapsed(now) {
                return decision(self.emit_speed(1.0, SpeedReason::ReturnToNormal, now));
            }
            return decision(Action::Noop(NoopReason::WithinDeadband));
        }

        // 3. large delta: jump instead of chasing
        if delta.abs() > self.config.seek_threshold_ms {
            if self.within(self.last_seek_at, now, self.config.seek_cooldown_ms) {
                return decision(Action::Noop(NoopReason::SeekCooldown));
            }

            self.current_speed = 1.0;
            self.speed_ema = 1.0;
            self.last_delta_sign = 0;
            self.hold_until = None;
            self.last_seek_at = Some(now);
            self.counters.seeks += 1;
            return decision(Action::Seek { target_ms: target_pos });
        }

        // 4. speed region. On outputs without usable rate control the
        // whole region is off limits, before any pacing state moves:
        // current_speed must keep describing the real player.
        if self.config.rate_control_disabled {
            return decision(Action::Noop(NoopReason::RateControlDisabled));
        }

        if self.within(self.last_seek_at, now, self.config.speed_cooldown_after_seek_ms) {
            return decision(Action::Noop(NoopReason::SpeedCooldownAfterSeek));
        }

        let sign = delta.signum() as i8;

        // reverse guard: the sign flipped while the residual is small,
        // meaning the last nudge overshot; pin to 1.0 and wait it out.
        // Evaluated ahead of the interval gate so a flip right after a
        // nudge still gets damped.
        if self.last_delta_sign != 0
            && sign != 0
            && sign != self.last_delta_sign
            && delta.abs() < self.config.reverse_guard_threshold_ms
        {
            self.hold_until = Some(now.add_ms(self.config.reverse_guard_hold_ms));
            self.last_delta_sign = sign;
            return decision(self.emit_speed(1.0, SpeedReason::ReverseGuard, now));
        }

        if !self.speed_interval_elapsed(now) {
            return decision(Action::Noop(NoopReason::SpeedInterval));
        }

        // bounded proportional nudge, EMA-smoothed and rate-limited
        let speed_delta = (predicted as f64 * self.config.gain)
            .clamp(self.config.min_speed - 1.0, self.config.max_speed - 1.0);
        let speed_target = 1.0 + speed_delta;

        let mut alpha = self.config.speed_alpha;
        if client.jitter_ms > self.config.high_jitter_ms || client.rtt_ms > self.config.high_rtt_ms {
            alpha /= 2.0;
        }

        self.speed_ema = ((1.0 - alpha) * self.speed_ema + alpha * speed_target)
            .clamp(self.config.min_speed, self.config.max_speed);

        let speed_cmd = self.speed_ema.clamp(
            self.current_speed - self.config.max_step,
            self.current_speed + self.config.max_step,
        );

        self.last_delta_sign = sign;

        if (speed_cmd - self.current_speed).abs() < self.config.min_emit_step {
            return decision(Action::Noop(NoopReason::SpeedChangeTooSmall));
        }

        decision(self.emit_speed(speed_cmd, SpeedReason::Nudge, now))
    }

    /// The host resumed from pause or switched tracks mid-epoch: drop
    /// all pacing state but keep counters.
    pub fn reset_pacing(&mut self) {
        self.current_speed = 1.0;
        self.speed_ema = 1.0;
        self.last_speed_set_at = None;
        self.last_seek_at = None;
        self.last_delta_sign = 0;
        self.hold_until = None;
    }

    fn emit_speed(&mut self, rate: f64, reason: SpeedReason, now: WallMs) -> Action {
        self.current_speed = rate;
        if rate == 1.0 {
            self.speed_ema = 1.0;
        }
        self.last_speed_set_at = Some(now);
        self.counters.speed_sets += 1;
        Action::SetSpeed { rate, reason }
    }

    fn speed_interval_elapsed(&self, now: WallMs) -> bool {
        !self.within(self.last_speed_set_at, now, self.config.speed_interval_ms)
    }

    fn within(&self, stamp: Option<WallMs>, now: WallMs, interval_ms: i64) -> bool {
        match stamp {
            Some(at) => now.millis_since(at) < interval_ms,
            None => false,
        }
    }
}

fn predicted_delta(delta_ms: i64, current_speed: f64, window_ms: i64) -> i64 {
    (delta_ms as f64 + (current_speed - 1.0) * window_ms as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_protocol::types::{RoomId, Seq};

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

    fn client(room_now: i64, wall: i64, client_pos: i64) -> ClientSnapshot {
        ClientSnapshot {
            room_now: RoomMs(room_now),
            now_wall: WallMs(wall),
            client_pos_ms: client_pos,
            duration_ms: 300_000,
            latency_comp_ms: 0,
            clock_locked: true,
            jitter_ms: 5,
            rtt_ms: 20,
        }
    }

    /// Host sample that produces exactly `delta` against a client at
    /// position 60_000, with zero elapsed time.
    fn sample_with_delta(delta: i64, wall: i64) -> (HostState, ClientSnapshot) {
        (host(60_000 + delta, 10_000), client(10_000, wall, 60_000))
    }

    #[test]
    fn not_playing_is_dropped() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());
        let (mut h, c) = sample_with_delta(500, 1000);
        h.is_playing = false;

        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Noop(NoopReason::NotPlaying));
        assert_eq!(ks.last_dropped_reason(), Some(NoopReason::NotPlaying));
    }

    #[test]
    fn unlocked_clock_is_dropped() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());
        let (h, mut c) = sample_with_delta(500, 1000);
        c.clock_locked = false;

        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Noop(NoopReason::ClockNotLocked));
    }

    #[test]
    fn stale_sample_is_dropped_and_counted() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());
        let h = host(60_000, 10_000);
        let c = client(11_300, 1000, 60_000);

        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Noop(NoopReason::StaleHostState));
        assert_eq!(ks.counters().dropped_host_states, 1);
    }

    #[test]
    fn target_position_extrapolates_and_compensates() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());
        let h = host(42_000, 20_000);
        let mut c = client(20_150, 1000, 42_000);
        c.latency_comp_ms = 100;

        let d = ks.decide(&h, &c);
        // 42000 + 150 elapsed - 100 comp
        assert_eq!(d.target_pos_ms, 42_050);
        assert_eq!(d.delta_ms, 50);
    }

    #[test]
    fn deadband_is_stable_at_normal_speed() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let mut wall = 1000;
        for delta in [-20, 5, 10, -8, 15] {
            let (h, c) = sample_with_delta(delta, wall);
            let d = ks.decide(&h, &c);
            assert_eq!(d.action, Action::Noop(NoopReason::WithinDeadband));
            wall += 200;
        }
        assert_eq!(ks.counters().speed_sets, 0);
    }

    #[test]
    fn deadband_returns_speed_to_normal() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        // push speed off 1.0 with a lagging sample
        let (h, c) = sample_with_delta(200, 1000);
        let d = ks.decide(&h, &c);
        assert!(matches!(
            d.action,
            Action::SetSpeed { reason: SpeedReason::Nudge, .. }
        ));

        // once the delta collapses and the interval has passed, the
        // controller issues an explicit return to 1.0
        let (h, c) = sample_with_delta(0, 1000 + 500);
        let d = ks.decide(&h, &c);
        assert!(matches!(
            d.action,
            Action::SetSpeed { rate, reason: SpeedReason::ReturnToNormal } if rate == 1.0
        ));
        assert_eq!(ks.current_speed(), 1.0);
    }

    #[test]
    fn large_delta_seeks_and_resets() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        // establish a non-unit speed first
        let (h, c) = sample_with_delta(300, 1000);
        ks.decide(&h, &c);
        assert!(ks.current_speed() > 1.0);

        let (h, c) = sample_with_delta(2500, 2000);
        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Seek { target_ms: 62_500 });
        assert_eq!(ks.current_speed(), 1.0);
        assert_eq!(ks.counters().seeks, 1);
    }

    #[test]
    fn speed_is_cooled_down_after_seek() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(2500, 1000);
        assert!(matches!(ks.decide(&h, &c).action, Action::Seek { .. }));

        // moderate delta within 500ms of the seek: no nudge yet
        let (h, c) = sample_with_delta(200, 1400);
        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Noop(NoopReason::SpeedCooldownAfterSeek));
    }

    #[test]
    fn seeks_respect_cooldown() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(2500, 1000);
        assert!(matches!(ks.decide(&h, &c).action, Action::Seek { .. }));

        let (h, c) = sample_with_delta(2500, 2000);
        assert_eq!(ks.decide(&h, &c).action, Action::Noop(NoopReason::SeekCooldown));

        let (h, c) = sample_with_delta(2500, 2600);
        assert!(matches!(ks.decide(&h, &c).action, Action::Seek { .. }));
    }

    #[test]
    fn reverse_guard_holds_on_sign_flip() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        // +80 nudges the speed up and records a positive sign
        let (h, c) = sample_with_delta(80, 1000);
        assert!(matches!(
            ks.decide(&h, &c).action,
            Action::SetSpeed { reason: SpeedReason::Nudge, .. }
        ));

        // -70 inside the guard threshold, well within the speed
        // interval: guard wins over the interval gate
        let (h, c) = sample_with_delta(-70, 1100);
        let d = ks.decide(&h, &c);
        assert!(matches!(
            d.action,
            Action::SetSpeed { rate, reason: SpeedReason::ReverseGuard } if rate == 1.0
        ));

        // decisions during the hold are noops
        let (h, c) = sample_with_delta(-60, 1500);
        assert_eq!(ks.decide(&h, &c).action, Action::Noop(NoopReason::Hold));

        // the hold expires 800ms after the flip
        let (h, c) = sample_with_delta(-60, 1901);
        assert_ne!(ks.decide(&h, &c).action, Action::Noop(NoopReason::Hold));
    }

    #[test]
    fn nudges_respect_speed_interval() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(300, 1000);
        assert!(matches!(ks.decide(&h, &c).action, Action::SetSpeed { .. }));

        // same-direction delta arriving too soon
        let (h, c) = sample_with_delta(320, 1200);
        assert_eq!(ks.decide(&h, &c).action, Action::Noop(NoopReason::SpeedInterval));

        let (h, c) = sample_with_delta(320, 1401);
        assert!(matches!(ks.decide(&h, &c).action, Action::SetSpeed { .. }));
    }

    #[test]
    fn speed_stays_inside_configured_range() {
        let cfg = KeepSyncConfig::default();
        let (min, max) = (cfg.min_speed, cfg.max_speed);
        let mut ks = KeepSync::new(cfg);

        let mut wall = 1000;
        for _ in 0..100 {
            let (h, c) = sample_with_delta(900, wall);
            ks.decide(&h, &c);
            assert!(ks.current_speed() >= min && ks.current_speed() <= max);
            wall += 500;
        }
        // converged against the rate cap chasing a persistent lag
        assert!(ks.current_speed() > 1.03);
    }

    #[test]
    fn speed_step_is_rate_limited() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(900, 1000);
        let d = ks.decide(&h, &c);
        let Action::SetSpeed { rate, .. } = d.action else {
            panic!("expected a nudge, got {:?}", d.action);
        };
        // one step from 1.0 can move at most max_step
        assert!((rate - 1.0).abs() <= 0.005 + f64::EPSILON);
    }

    #[test]
    fn tiny_speed_changes_are_suppressed() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(40, 1000);
        let d = ks.decide(&h, &c);
        // 40ms * 2e-4 = 0.008 target delta, ema-smoothed to 0.0016:
        // below the emit floor
        assert_eq!(d.action, Action::Noop(NoopReason::SpeedChangeTooSmall));
    }

    #[test]
    fn degraded_network_halves_alpha() {
        let mut good = KeepSync::new(KeepSyncConfig::default());
        let mut bad = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(600, 1000);
        let d_good = good.decide(&h, &c);

        let (h, mut c) = sample_with_delta(600, 1000);
        c.jitter_ms = 80;
        let d_bad = bad.decide(&h, &c);

        let (Action::SetSpeed { rate: r_good, .. }, Action::SetSpeed { rate: r_bad, .. }) =
            (d_good.action, d_bad.action)
        else {
            panic!("expected nudges");
        };
        assert!(r_bad < r_good);
    }

    #[test]
    fn epoch_change_resets_pacing() {
        let mut ks = KeepSync::new(KeepSyncConfig::default());

        let (h, c) = sample_with_delta(300, 1000);
        ks.decide(&h, &c);
        assert!(ks.current_speed() > 1.0);

        let (mut h, c) = sample_with_delta(10, 1100);
        h.epoch = Epoch(2);
        let d = ks.decide(&h, &c);
        // fresh state: inside deadband at speed 1.0, and no lingering
        // speed-interval stamp
        assert_eq!(d.action, Action::Noop(NoopReason::WithinDeadband));
        assert_eq!(ks.current_speed(), 1.0);
    }

    #[test]
    fn disabled_rate_control_never_moves_the_speed_model() {
        let mut ks = KeepSync::new(KeepSyncConfig::ios_safe());

        // lags that would normally nudge report the disabled path and
        // leave every pacing field untouched
        let mut wall = 1000;
        for delta in [600, 700, -500, 800] {
            let (h, c) = sample_with_delta(delta, wall);
            let d = ks.decide(&h, &c);
            assert_eq!(d.action, Action::Noop(NoopReason::RateControlDisabled));
            assert_eq!(ks.current_speed(), 1.0);
            wall += 1000;
        }
        assert_eq!(ks.counters().speed_sets, 0);
    }

    #[test]
    fn disabled_rate_control_still_seeks() {
        let mut ks = KeepSync::new(KeepSyncConfig::ios_safe());

        let (h, c) = sample_with_delta(2500, 1000);
        let d = ks.decide(&h, &c);
        assert_eq!(d.action, Action::Seek { target_ms: 62_500 });
        assert_eq!(ks.counters().seeks, 1);
        assert_eq!(ks.current_speed(), 1.0);
    }

    #[test]
    fn ios_safe_profile_narrows_everything() {
        let cfg = KeepSyncConfig::ios_safe();
        assert!(cfg.rate_control_disabled);
        assert!(cfg.max_speed <= 1.02 && cfg.min_speed >= 0.98);
        assert!(cfg.max_step <= 0.003);
        assert!(cfg.speed_interval_ms >= 800);
    }
}
