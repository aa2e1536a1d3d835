//! Rate-metered counters for the write paths.
//!
//! A `Meter` keeps a total count plus 1/5/15-minute exponentially-weighted
//! moving averages, ticking on a five second interval. Snapshots serialize
//! into the `postgres_driver` observability map.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use serde::Serialize;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

lazy_static! {
    /// Process-wide `postgres_driver` metric map.
    pub static ref DRIVER_METRICS: DriverMetrics = DriverMetrics::new();
}

/// The driver's two rate-metered counters.
pub struct DriverMetrics {
    /// Bytes accepted by `FileWriter::write`.
    pub bytes_written: Meter,
    /// Bytes re-read from the object store while proxying an append.
    pub bytes_proxied_in_mds_append: Meter,
}

impl DriverMetrics {
    fn new() -> Self {
        DriverMetrics {
            bytes_written: Meter::new(),
            bytes_proxied_in_mds_append: Meter::new(),
        }
    }

    pub fn snapshot(&self) -> DriverMetricsSnapshot {
        DriverMetricsSnapshot {
            bytes_written: self.bytes_written.snapshot(),
            bytes_proxied_in_mds_append: self.bytes_proxied_in_mds_append.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverMetricsSnapshot {
    pub bytes_written: MeterSnapshot,
    pub bytes_proxied_in_mds_append: MeterSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterSnapshot {
    pub count: u64,
    pub rate: RateSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateSnapshot {
    pub rate1: f64,
    pub rate5: f64,
    pub rate15: f64,
    pub rate_mean: f64,
}

struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        Ewma {
            alpha: 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            initialized: false,
        }
    }

    fn tick(&mut self, instant_rate: f64) {
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

struct MeterInner {
    count: u64,
    uncounted: u64,
    started: Instant,
    last_tick: Instant,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

/// A counter with 1/5/15-minute EWMA rates.
pub struct Meter {
    inner: Mutex<MeterInner>,
}

impl Meter {
    pub fn new() -> Self {
        let now = Instant::now();
        Meter {
            inner: Mutex::new(MeterInner {
                count: 0,
                uncounted: 0,
                started: now,
                last_tick: now,
                m1: Ewma::over_minutes(1.0),
                m5: Ewma::over_minutes(5.0),
                m15: Ewma::over_minutes(15.0),
            }),
        }
    }

    /// Record `n` events.
    pub fn mark(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::tick_if_elapsed(&mut inner);
        inner.count += n;
        inner.uncounted += n;
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::tick_if_elapsed(&mut inner);

        let elapsed = inner.started.elapsed().as_secs_f64();
        let rate_mean = if elapsed > 0.0 {
            inner.count as f64 / elapsed
        } else {
            0.0
        };

        MeterSnapshot {
            count: inner.count,
            rate: RateSnapshot {
                rate1: inner.m1.rate,
                rate5: inner.m5.rate,
                rate15: inner.m15.rate,
                rate_mean,
            },
        }
    }

    fn tick_if_elapsed(inner: &mut MeterInner) {
        let elapsed = inner.last_tick.elapsed();
        let ticks = (elapsed.as_secs_f64() / TICK_INTERVAL.as_secs_f64()) as u32;
        if ticks == 0 {
            return;
        }

        // The first pending tick consumes the uncounted events, the rest
        // represent idle intervals.
        let instant_rate = inner.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        inner.uncounted = 0;
        for i in 0..ticks {
            let rate = if i == 0 { instant_rate } else { 0.0 };
            inner.m1.tick(rate);
            inner.m5.tick(rate);
            inner.m15.tick(rate);
        }
        inner.last_tick += TICK_INTERVAL * ticks;
    }
}

impl Default for Meter {
    fn default() -> Self {
        Meter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_accumulates_count() {
        let meter = Meter::new();
        meter.mark(10);
        meter.mark(32);
        assert_eq!(meter.count(), 42);

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.count, 42);
        assert!(snapshot.rate.rate_mean > 0.0);
    }

    #[test]
    fn snapshot_serializes() {
        DRIVER_METRICS.bytes_written.mark(1);
        let json = serde_json::to_value(DRIVER_METRICS.snapshot()).unwrap();
        assert!(json["bytes_written"]["count"].as_u64().unwrap() >= 1);
        assert!(json["bytes_proxied_in_mds_append"]["rate"]["rate1"].is_number());
    }
}
