//! Anonymizer - identity stripping at the service boundary
//!
//! Turns an opaque session handle into a keyed one-way fingerprint and floors
//! timestamps to a coarse bucket. The handle never leaves this module.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::LazyLock;

use crate::config::AnonymizerConfig;
use crate::error::{Error, Result};
use crate::model::{AnonymizedInteraction, Interaction, SessionFingerprint, TimeBucket};

pub mod salt;

pub use salt::{Salt, SaltSchedule};

type HmacSha256 = Hmac<Sha256>;

/// Opaque token charset accepted from the identity store
static HANDLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._~+/=:-]{8,256}$").unwrap());

static FINGERPRINT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").unwrap());

/// How a caller identifies the session on a request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionIdentity {
    /// Raw handle from the identity store, converted here and never logged
    Handle(String),
    /// Fingerprint the caller already derived in this epoch
    Fingerprint(String),
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionIdentity::Handle(_) => f.write_str("Handle([redacted])"),
            SessionIdentity::Fingerprint(fp) => {
                write!(f, "Fingerprint({})", &fp[..fp.len().min(8)])
            }
        }
    }
}

/// Check a handle is an opaque token and not an identity attribute
pub fn validate_handle(handle: &str) -> Result<()> {
    if handle.trim().is_empty() {
        return Err(Error::InvalidHandle("handle is empty".to_string()));
    }
    if handle.contains('@') {
        return Err(Error::InvalidHandle(
            "handle looks like an email address".to_string(),
        ));
    }
    if handle.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidHandle(
            "handle looks like a raw numeric identifier".to_string(),
        ));
    }
    if !HANDLE_PATTERN.is_match(handle) {
        return Err(Error::InvalidHandle(
            "handle must be 8-256 opaque token characters".to_string(),
        ));
    }
    Ok(())
}

/// Keyed one-way fingerprint of a handle under `salt`
pub fn fingerprint(handle: &str, salt: &Salt) -> Result<SessionFingerprint> {
    validate_handle(handle)?;

    let mut mac = HmacSha256::new_from_slice(salt.as_bytes())
        .map_err(|e| Error::InvalidHandle(format!("fingerprint key rejected: {}", e)))?;
    mac.update(handle.as_bytes());
    let digest = mac.finalize().into_bytes();

    Ok(SessionFingerprint::from_hex(hex::encode(digest)))
}

/// Floor a timestamp to a `bucket_minutes` boundary
pub fn time_bucket(at: DateTime<Utc>, bucket_minutes: u32) -> TimeBucket {
    let step = TimeDelta::minutes(i64::from(bucket_minutes.max(1)));
    let floored = at.duration_trunc(step).unwrap_or(at);
    TimeBucket(floored)
}

/// `anonymize(handle, timestamp, salt) -> (fingerprint, bucket)`
pub fn anonymize(
    handle: &str,
    raw_timestamp: DateTime<Utc>,
    salt: &Salt,
    bucket_minutes: u32,
) -> Result<(SessionFingerprint, TimeBucket)> {
    let fp = fingerprint(handle, salt)?;
    Ok((fp, time_bucket(raw_timestamp, bucket_minutes)))
}

/// Accept a caller-provided fingerprint after checking its shape
pub fn parse_fingerprint(raw: &str) -> Result<SessionFingerprint> {
    if !FINGERPRINT_PATTERN.is_match(raw) {
        return Err(Error::InvalidHandle(
            "fingerprint must be 64 lowercase hex characters".to_string(),
        ));
    }
    Ok(SessionFingerprint::from_hex(raw.to_string()))
}

/// Boundary anonymizer holding the salt schedule
#[derive(Debug)]
pub struct Anonymizer {
    bucket_minutes: u32,
    max_skew: TimeDelta,
    schedule: SaltSchedule,
}

impl Anonymizer {
    pub fn new(config: &AnonymizerConfig) -> Self {
        Self {
            bucket_minutes: config.bucket_minutes,
            max_skew: TimeDelta::hours(i64::from(config.max_clock_skew_hours)),
            schedule: SaltSchedule::new(config.salt_rotation_hours),
        }
    }

    pub fn bucket(&self, at: DateTime<Utc>) -> TimeBucket {
        time_bucket(at, self.bucket_minutes)
    }

    /// Resolve a request identity to a fingerprint in the epoch containing `now`
    pub fn resolve(&self, identity: &SessionIdentity, now: DateTime<Utc>) -> Result<SessionFingerprint> {
        match identity {
            SessionIdentity::Handle(handle) => {
                self.schedule.with_salt(now, |salt| fingerprint(handle, salt))
            }
            SessionIdentity::Fingerprint(raw) => parse_fingerprint(raw),
        }
    }

    /// Reject timestamps further than the allowed skew from `now`
    pub fn check_timestamp(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let earliest = now.checked_sub_signed(self.max_skew);
        let latest = now.checked_add_signed(self.max_skew);
        let in_range = earliest.map_or(true, |e| at >= e) && latest.map_or(true, |l| at <= l);
        if !in_range {
            return Err(Error::InvalidTimestamp(format!(
                "{} is more than {}h from server time",
                at.to_rfc3339(),
                self.max_skew.num_hours()
            )));
        }
        Ok(())
    }

    /// Strip an interaction down to its anonymized form
    ///
    /// The raw timestamp is checked against `now`, then only its bucket survives.
    pub fn admit(
        &self,
        identity: &SessionIdentity,
        interaction: Interaction,
        now: DateTime<Utc>,
    ) -> Result<AnonymizedInteraction> {
        self.check_timestamp(interaction.timestamp, now)?;

        let (fingerprint, bucket) = match identity {
            SessionIdentity::Handle(handle) => self.schedule.with_salt(now, |salt| {
                anonymize(handle, interaction.timestamp, salt, self.bucket_minutes)
            })?,
            SessionIdentity::Fingerprint(raw) => (parse_fingerprint(raw)?, self.bucket(interaction.timestamp)),
        };

        Ok(AnonymizedInteraction {
            fingerprint,
            bucket,
            action_type: interaction.action_type,
            response_latency_ms: interaction.response_latency_ms,
            content_ref: interaction.content_ref,
        })
    }
}
