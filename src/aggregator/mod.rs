//! Aggregator - group statistics behind a k-anonymity floor and Laplace noise
//!
//! Signals are folded into buckets keyed by (course, window, bias type). A bucket
//! keeps only each contributor's clipped severity and a signal count; it is removed
//! from the store when its window is flushed. What leaves the aggregator is either
//! a noised `AggregateReport` or a `Suppressed` marker that carries no counts.
//!
//! ## Release
//! - Fewer than `min_group_size` distinct fingerprints: suppressed, folded into the
//!   next window up to `max_carry_windows` times, then dropped
//! - Otherwise the contributor count, mean severity and histogram are released,
//!   each with a third of the epsilon budget and truncated Laplace noise

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AggregatorConfig;
use crate::error::{Error, Result};
use crate::model::{BiasSignal, BiasType, SessionFingerprint};

pub mod noise;
pub mod report;

pub use report::{AggregateReport, AnalyticsQuery, ReportBoard};

/// Number of statistics sharing the epsilon budget
const RELEASED_STATISTICS: f64 = 3.0;

/// Aggregation window `[start, start + minutes)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub minutes: u32,
}

impl TimeWindow {
    /// Window of length `minutes` containing `at`
    pub fn containing(at: DateTime<Utc>, minutes: u32) -> Self {
        let step = TimeDelta::minutes(i64::from(minutes.max(1)));
        Self {
            start: at.duration_trunc(step).unwrap_or(at),
            minutes: minutes.max(1),
        }
    }

    /// Saturates at the last representable instant
    pub fn end(&self) -> DateTime<Utc> {
        self.start
            .checked_add_signed(TimeDelta::minutes(i64::from(self.minutes)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn next(&self) -> Self {
        Self {
            start: self.end(),
            minutes: self.minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    course_id: String,
    window: TimeWindow,
    bias_type: BiasType,
}

/// Working state for one group; never leaves the aggregator
#[derive(Debug, Clone, Default)]
struct AggregateBucket {
    /// Clipped severity per contributor, max over its signals
    contributors: HashMap<SessionFingerprint, f64>,
    signal_count: u64,
    /// Windows this bucket has already been carried across
    carried: u32,
}

impl AggregateBucket {
    fn merge(&mut self, other: AggregateBucket) {
        for (fingerprint, severity) in other.contributors {
            self.contributors
                .entry(fingerprint)
                .and_modify(|s| *s = s.max(severity))
                .or_insert(severity);
        }
        self.signal_count += other.signal_count;
        self.carried = self.carried.max(other.carried);
    }
}

/// Severities of a bucket that met the group-size floor, ready to be noised
///
/// Contributors are reduced to their severities; fingerprints are gone by now.
#[derive(Debug, Clone)]
pub struct SealedBucket {
    pub course_id: String,
    pub window: TimeWindow,
    pub bias_type: BiasType,
    severities: Vec<f64>,
}

impl SealedBucket {
    pub fn new(course_id: impl Into<String>, window: TimeWindow, bias_type: BiasType, severities: Vec<f64>) -> Self {
        Self {
            course_id: course_id.into(),
            window,
            bias_type,
            severities,
        }
    }

    pub fn contributors(&self) -> usize {
        self.severities.len()
    }

    /// Produce one noised release
    pub fn release<R: Rng + ?Sized>(&self, rng: &mut R, config: &AggregatorConfig) -> Result<AggregateReport> {
        let n = self.severities.len();
        if n == 0 {
            return Err(Error::InvalidConfig("cannot release an empty bucket".to_string()));
        }

        let epsilon_each = config.epsilon / RELEASED_STATISTICS;
        let bins = config.histogram_bins.max(1);

        let count_scale = noise::scale(1.0, epsilon_each);
        let count_noise = noise::truncated_laplace(rng, count_scale, count_scale * noise::TAIL_SCALES);
        let noised_count = (n as f64 + count_noise).round().max(0.0) as u64;

        let mean = self.severities.iter().sum::<f64>() / n as f64;
        let mean_noise = noise::truncated_laplace(rng, noise::scale(1.0 / n as f64, epsilon_each), config.noise_bound);
        let noised_mean = (mean + mean_noise).clamp(0.0, 1.0);

        let mut histogram = vec![0.0; bins];
        for severity in &self.severities {
            let bin = ((severity * bins as f64) as usize).min(bins - 1);
            histogram[bin] += 1.0;
        }
        let hist_scale = noise::scale(2.0, epsilon_each);
        for cell in histogram.iter_mut() {
            let noised = *cell + noise::truncated_laplace(rng, hist_scale, hist_scale * noise::TAIL_SCALES);
            *cell = noised.max(0.0);
        }

        if !noised_mean.is_finite() || histogram.iter().any(|c| !c.is_finite()) {
            return Err(Error::InvalidConfig("noise produced a non-finite value".to_string()));
        }

        Ok(AggregateReport {
            course_id: self.course_id.clone(),
            window_start: self.window.start,
            window_minutes: self.window.minutes,
            bias_type: self.bias_type,
            noised_contributors: noised_count,
            noised_mean_severity: noised_mean,
            noised_histogram: histogram,
            epsilon_spent: config.epsilon,
        })
    }
}

/// What happened to a suppressed bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Below the group floor, folded into the next window
    CarriedForward,
    /// Below the group floor after the last permitted carry
    Dropped,
    /// Met the floor but the noise step failed; nothing released
    NoiseFault,
}

/// Marker for a withheld bucket; deliberately carries no counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suppressed {
    pub course_id: String,
    pub window_start: DateTime<Utc>,
    pub bias_type: BiasType,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Report(AggregateReport),
    Suppressed(Suppressed),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&AggregateReport> {
        match self {
            FlushOutcome::Report(report) => Some(report),
            FlushOutcome::Suppressed(_) => None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, FlushOutcome::Suppressed(_))
    }
}

#[derive(Debug, Default)]
struct Store {
    buckets: HashMap<BucketKey, AggregateBucket>,
    /// Per course: windows starting before this instant are sealed
    watermarks: HashMap<String, DateTime<Utc>>,
}

/// Keyed bucket store shared by all session workers
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    store: Mutex<Store>,
    rng: Mutex<StdRng>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Aggregator with a reproducible noise stream, for tests
    pub fn with_seed(config: AggregatorConfig, seed: u64) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn window_of(&self, at: DateTime<Utc>) -> TimeWindow {
        TimeWindow::containing(at, self.config.window_minutes)
    }

    /// Fold a signal into its bucket
    ///
    /// Returns the window the signal landed in, which differs from `window` when that
    /// window was already sealed. `none` signals are ignored and yield `None`.
    pub fn absorb(
        &self,
        course_id: &str,
        window: TimeWindow,
        fingerprint: &SessionFingerprint,
        signal: BiasSignal,
    ) -> Option<TimeWindow> {
        if !signal.is_detected() {
            return None;
        }

        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());

        let target = match store.watermarks.get(course_id) {
            Some(&watermark) if window.start < watermark => {
                let open = TimeWindow::containing(watermark, window.minutes);
                debug!(
                    "Window {} sealed for {}, redirecting to {}",
                    window.start, course_id, open.start
                );
                open
            }
            _ => window,
        };

        let bucket = store
            .buckets
            .entry(BucketKey {
                course_id: course_id.to_string(),
                window: target,
                bias_type: signal.bias_type,
            })
            .or_default();
        bucket
            .contributors
            .entry(fingerprint.clone())
            .and_modify(|s| *s = s.max(signal.severity))
            .or_insert(signal.severity);
        bucket.signal_count += 1;

        Some(target)
    }

    /// Seal and flush one window of a course, one outcome per bias type present
    pub fn flush(&self, course_id: &str, window: TimeWindow) -> Vec<FlushOutcome> {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());

        let watermark = store
            .watermarks
            .entry(course_id.to_string())
            .or_insert(window.end());
        if *watermark < window.end() {
            *watermark = window.end();
        }

        let mut keys: Vec<BucketKey> = store
            .buckets
            .keys()
            .filter(|k| k.course_id == course_id && k.window == window)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.bias_type);

        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bucket) = store.buckets.remove(&key) else {
                continue;
            };
            let outcome = self.seal(&mut store, key, bucket);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn seal(&self, store: &mut Store, key: BucketKey, bucket: AggregateBucket) -> FlushOutcome {
        let suppressed = |disposition| {
            FlushOutcome::Suppressed(Suppressed {
                course_id: key.course_id.clone(),
                window_start: key.window.start,
                bias_type: key.bias_type,
                disposition,
            })
        };

        if bucket.contributors.len() < self.config.min_group_size {
            if bucket.carried >= self.config.max_carry_windows {
                debug!(
                    "Dropping {} bucket for {} after {} carries",
                    key.bias_type.as_str(),
                    key.course_id,
                    bucket.carried
                );
                return suppressed(Disposition::Dropped);
            }

            let next_key = BucketKey {
                course_id: key.course_id.clone(),
                window: key.window.next(),
                bias_type: key.bias_type,
            };
            let carried = AggregateBucket {
                carried: bucket.carried + 1,
                ..bucket
            };
            store.buckets.entry(next_key).or_default().merge(carried);
            return suppressed(Disposition::CarriedForward);
        }

        let sealed = SealedBucket::new(
            key.course_id.clone(),
            key.window,
            key.bias_type,
            bucket.contributors.into_values().collect(),
        );

        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        match sealed.release(&mut *rng, &self.config) {
            Ok(report) => FlushOutcome::Report(report),
            Err(e) => {
                warn!("Noise step failed for {}: {}", key.course_id, e);
                suppressed(Disposition::NoiseFault)
            }
        }
    }

    /// Flush every window that has ended by `now`, oldest first
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<FlushOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = {
                let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
                store
                    .buckets
                    .keys()
                    .filter(|k| k.window.end() <= now)
                    .map(|k| (k.window, k.course_id.clone()))
                    .min()
            };
            let Some((window, course_id)) = next else {
                break;
            };
            outcomes.extend(self.flush(&course_id, window));
        }
        outcomes
    }

    /// Number of open buckets
    pub fn open_buckets(&self) -> usize {
        self.store.lock().unwrap_or_else(|p| p.into_inner()).buckets.len()
    }
}
