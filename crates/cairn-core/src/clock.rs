use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

// Invariant:
// `Timestamp::now` is strictly monotonic within a process, even when the
// wall clock stalls or steps backwards. Stored form is transparent u64
// Unix milliseconds.

static LAST: AtomicU64 = AtomicU64::new(0);

///
/// Timestamp
///
/// Per-attribute modification time. Millisecond-native.
///

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    /// Current time, advanced past every previously issued stamp.
    #[must_use]
    pub fn now() -> Self {
        let wall = wall_millis();
        let mut prev = LAST.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(observed) => prev = observed,
            }
        }
    }

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Fixed-width decimal rendering; lexicographic order matches
    /// chronological order, which index buckets rely on.
    #[must_use]
    pub fn sort_key(self) -> String {
        format!("{:020}", self.0)
    }
}

#[expect(clippy::cast_sign_loss)]
fn wall_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    if nanos <= 0 {
        0
    } else {
        (nanos / 1_000_000) as u64
    }
}
