use std::fmt::{self, Display};
use std::sync::{Arc, OnceLock};

pub mod server;
pub mod value;

use self::value::{Counter, Gauge};

/// Process-wide sync gauges and counters, rendered at /metrics.
pub struct SyncStats {
    pub clock_offset_ms: Gauge,
    pub clock_rtt_ms: Gauge,
    pub clock_jitter_ms: Gauge,
    pub clock_locked: Gauge,
    pub clock_samples: Gauge,
    pub clock_samples_dropped: Gauge,
    pub sync_delta_ms: Gauge,
    pub sync_speed_milli: Gauge,
    pub sync_seeks: Counter,
    pub sync_speed_sets: Counter,
    pub sync_stale_drops: Counter,
    pub protection_active: Gauge,
    pub protection_entries: Counter,
    pub start_error_ms: Gauge,
}

impl SyncStats {
    pub fn new() -> Self {
        SyncStats {
            clock_offset_ms: Gauge::new("unison_clock_offset_ms"),
            clock_rtt_ms: Gauge::new("unison_clock_rtt_ms"),
            clock_jitter_ms: Gauge::new("unison_clock_jitter_ms"),
            clock_locked: Gauge::new("unison_clock_locked"),
            clock_samples: Gauge::new("unison_clock_samples"),
            clock_samples_dropped: Gauge::new("unison_clock_samples_dropped"),
            sync_delta_ms: Gauge::new("unison_sync_delta_ms"),
            sync_speed_milli: Gauge::new("unison_sync_speed_milli"),
            sync_seeks: Counter::new("unison_sync_seeks"),
            sync_speed_sets: Counter::new("unison_sync_speed_sets"),
            sync_stale_drops: Counter::new("unison_sync_stale_drops"),
            protection_active: Gauge::new("unison_protection_active"),
            protection_entries: Counter::new("unison_protection_entries"),
            start_error_ms: Gauge::new("unison_start_error_ms"),
        }
    }

    /// Tests share the process-wide instance; they clear it first.
    pub fn reset(&self) {
        self.clock_offset_ms.reset();
        self.clock_rtt_ms.reset();
        self.clock_jitter_ms.reset();
        self.clock_locked.reset();
        self.clock_samples.reset();
        self.clock_samples_dropped.reset();
        self.sync_delta_ms.reset();
        self.sync_speed_milli.reset();
        self.sync_seeks.reset();
        self.sync_speed_sets.reset();
        self.sync_stale_drops.reset();
        self.protection_active.reset();
        self.protection_entries.reset();
        self.start_error_ms.reset();
    }
}

impl Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clock_offset_ms)?;
        write!(f, "{}", self.clock_rtt_ms)?;
        write!(f, "{}", self.clock_jitter_ms)?;
        write!(f, "{}", self.clock_locked)?;
        write!(f, "{}", self.clock_samples)?;
        write!(f, "{}", self.clock_samples_dropped)?;
        write!(f, "{}", self.sync_delta_ms)?;
        write!(f, "{}", self.sync_speed_milli)?;
        write!(f, "{}", self.sync_seeks)?;
        write!(f, "{}", self.sync_speed_sets)?;
        write!(f, "{}", self.sync_stale_drops)?;
        write!(f, "{}", self.protection_active)?;
        write!(f, "{}", self.protection_entries)?;
        write!(f, "{}", self.start_error_ms)?;
        Ok(())
    }
}

static STATS: OnceLock<Arc<SyncStats>> = OnceLock::new();

pub fn get() -> Arc<SyncStats> {
    STATS.get_or_init(|| Arc::new(SyncStats::new())).clone()
}

impl Default for SyncStats {
    fn default() -> Self {
        SyncStats::new()
    }
}

#[cfg(test)]
mod tests {
    use super::value::Milli;
    use super::SyncStats;

    #[test]
    fn registry_renders_set_values_only() {
        let stats = SyncStats::new();

        stats.clock_offset_ms.observe(512i64);
        stats.sync_speed_milli.observe(Milli(1.003));
        stats.sync_seeks.increment();

        let text = stats.to_string();
        assert!(text.contains("unison_clock_offset_ms 512"));
        assert!(text.contains("unison_sync_speed_milli 1003"));
        assert!(text.contains("unison_sync_seeks 1"));
        // unset gauges are omitted, counters always render
        assert!(!text.contains("unison_sync_delta_ms "));
        assert!(text.contains("unison_sync_stale_drops 0"));
    }

    #[test]
    fn reset_returns_registry_to_blank() {
        let stats = SyncStats::new();
        stats.clock_offset_ms.observe(5i64);
        stats.sync_seeks.increment();

        stats.reset();
        assert_eq!(stats.clock_offset_ms.get(), None);
        assert_eq!(stats.sync_seeks.get(), 0);
    }
}
