use std::fmt::{self, Display};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Counter {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "# TYPE {} counter\n", self.name)?;
        write!(f, "{} {}\n\n", self.name, self.get())?;
        Ok(())
    }
}

const GAUGE_NO_VALUE: i64 = i64::MIN;

pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str) -> Self {
        Gauge {
            name,
            value: AtomicI64::new(GAUGE_NO_VALUE),
        }
    }

    pub fn get(&self) -> Option<i64> {
        Some(self.value.load(Ordering::Relaxed)).filter(|val| *val != GAUGE_NO_VALUE)
    }

    pub fn observe<T: GaugeValue>(&self, value: T) {
        self.value.store(value.to_i64(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.value.store(GAUGE_NO_VALUE, Ordering::Relaxed);
    }
}

impl Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.get() {
            write!(f, "# TYPE {} gauge\n", self.name)?;
            write!(f, "{} {}\n\n", self.name, value)?;
        }
        Ok(())
    }
}

pub trait GaugeValue {
    fn to_i64(&self) -> i64;
}

impl GaugeValue for i64 {
    fn to_i64(&self) -> i64 {
        *self
    }
}

impl GaugeValue for bool {
    fn to_i64(&self) -> i64 {
        *self as i64
    }
}

/// Playback rates are published in thousandths to keep the endpoint
/// integer-only.
pub struct Milli(pub f64);

impl GaugeValue for Milli {
    fn to_i64(&self) -> i64 {
        (self.0 * 1000.0).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_renders_prometheus_text() {
        let c = Counter::new("unison_test_total");
        c.add(3);
        let text = c.to_string();
        assert!(text.contains("# TYPE unison_test_total counter"));
        assert!(text.contains("unison_test_total 3"));
    }

    #[test]
    fn unset_gauge_renders_nothing() {
        let g = Gauge::new("unison_test_gauge");
        assert_eq!(g.to_string(), "");

        g.observe(42i64);
        assert!(g.to_string().contains("unison_test_gauge 42"));

        g.reset();
        assert_eq!(g.to_string(), "");
    }

    #[test]
    fn rates_scale_to_milli() {
        let g = Gauge::new("unison_speed_milli");
        g.observe(Milli(1.0042));
        assert_eq!(g.get(), Some(1004));
    }
}
