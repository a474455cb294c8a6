//! Rotating salt for fingerprint derivation
//!
//! Salts live only in process memory. When the epoch advances the previous salt is
//! dropped, which makes fingerprints from different epochs unlinkable.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Salt length in bytes (HMAC-SHA-256 block-friendly key size)
pub const SALT_LENGTH: usize = 32;

pub struct Salt {
    epoch: i64,
    bytes: [u8; SALT_LENGTH],
}

impl Salt {
    /// Fresh random salt for the given epoch
    pub fn generate(epoch: i64) -> Self {
        let mut bytes = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self { epoch, bytes }
    }

    /// Salt with caller-chosen bytes, for replay in tests and tooling
    pub fn from_bytes(epoch: i64, bytes: [u8; SALT_LENGTH]) -> Self {
        Self { epoch, bytes }
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// Never print key material
impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Salt")
            .field("epoch", &self.epoch)
            .field("bytes", &"[redacted]")
            .finish()
    }
}

/// Salt schedule rotating on a fixed period
#[derive(Debug)]
pub struct SaltSchedule {
    period_secs: i64,
    current: Mutex<Option<Salt>>,
}

impl SaltSchedule {
    pub fn new(rotation_hours: u32) -> Self {
        Self {
            period_secs: i64::from(rotation_hours.max(1)) * 3600,
            current: Mutex::new(None),
        }
    }

    /// Epoch index a timestamp belongs to
    pub fn epoch_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.period_secs)
    }

    /// Run `f` with the salt for the epoch containing `at`, rotating first if needed
    pub fn with_salt<T>(&self, at: DateTime<Utc>, f: impl FnOnce(&Salt) -> T) -> T {
        let epoch = self.epoch_of(at);
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.as_ref().is_some_and(|salt| salt.epoch != epoch) {
            info!("Rotating fingerprint salt (epoch {})", epoch);
            *guard = None;
        }

        let salt = guard.get_or_insert_with(|| Salt::generate(epoch));
        f(salt)
    }
}
