//! Bounded per-fingerprint interaction window
//!
//! A ring buffer with two eviction rules: capacity, and age relative to the newest
//! bucket seen. Evicted entries are dropped, never archived.

use chrono::TimeDelta;
use std::collections::VecDeque;

use crate::config::WindowConfig;
use crate::model::{AnonymizedInteraction, FeatureSummary, SessionFingerprint, TimeBucket};

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    entries: VecDeque<AnonymizedInteraction>,
    capacity: usize,
    max_span: TimeDelta,
    newest: Option<TimeBucket>,
}

impl SlidingWindow {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.max_interactions),
            capacity: config.max_interactions.max(1),
            max_span: TimeDelta::minutes(i64::from(config.max_span_minutes)),
            newest: None,
        }
    }

    /// Append an interaction, evicting whatever falls outside the bounds
    pub fn push(&mut self, interaction: AnonymizedInteraction) {
        if self.newest.map_or(true, |newest| interaction.bucket > newest) {
            self.newest = Some(interaction.bucket);
        }
        self.entries.push_back(interaction);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        // No horizon before the earliest representable instant, so nothing to evict
        let horizon = self
            .newest
            .and_then(|newest| newest.start().checked_sub_signed(self.max_span));
        if let Some(horizon) = horizon {
            self.entries.retain(|entry| entry.bucket.start() >= horizon);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnonymizedInteraction> {
        self.entries.iter()
    }

    /// Drop everything (session close)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.newest = None;
    }

    pub fn summarize(&self, fingerprint: &SessionFingerprint, config: &WindowConfig) -> FeatureSummary {
        super::extract(fingerprint, self.entries.iter(), config)
    }
}
