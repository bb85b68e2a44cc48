use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

// Process-local; uniqueness across processes comes from the random suffix.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sortable submission identifier: `{YYYYMMDDHHMMSS}-{seq:06}-{random}`.
///
/// Lexicographic order matches arrival order within a process, which keeps
/// object-store listings and tracker scans chronological.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Self(format!(
            "{}-{:06}-{}",
            now.format("%Y%m%d%H%M%S"),
            seq,
            suffix.to_lowercase()
        ))
    }

    /// Validates an id received from the outside (status endpoint, payer
    /// callback). Shape only; no attempt to verify the embedded date.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3
            || parts[0].len() != 14
            || !parts[0].chars().all(|c| c.is_ascii_digit())
            || parts[1].len() != 6
            || !parts[1].chars().all(|c| c.is_ascii_digit())
            || parts[2].is_empty()
            || !parts[2].chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(format!("{s} is not a valid submission id"));
        }
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SubmissionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
