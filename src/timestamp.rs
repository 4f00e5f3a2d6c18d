//! Server timestamps and the per-user monotonic clock.
//!
//! The storage protocol exposes timestamps as seconds with exactly two
//! decimal places, but every internal computation uses integer
//! centiseconds. Keeping the integer form everywhere avoids float
//! comparison bugs in precondition checks and makes the monotonicity
//! guarantee (`last + 1`) trivially correct.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Serialize, Serializer};

/// A storage timestamp: integer centiseconds since the unix epoch.
///
/// On the wire this renders as seconds with two decimals
/// (e.g. `1643091234.12`). Parsing rejects any finer precision so that
/// clients cannot submit timestamps the server can't represent exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Builds a timestamp from raw centiseconds.
    pub const fn from_centis(centis: u64) -> Self {
        Self(centis)
    }

    /// Returns the raw centisecond value.
    pub const fn as_centis(self) -> u64 {
        self.0
    }

    /// Returns the timestamp as floating-point seconds.
    ///
    /// Only for JSON number output; internal comparisons stay integer.
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Reads the current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(elapsed.as_millis() as u64 / 10)
    }

    /// Parses a wire timestamp: decimal seconds with at most two
    /// fraction digits.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input, non-digit characters, or a
    /// fraction finer than a centisecond.
    pub fn parse(value: &str) -> Result<Self, ParseTimestampError> {
        let (whole, frac) = match value.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (value, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseTimestampError(value.to_string()));
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseTimestampError(value.to_string()));
        }
        let seconds: u64 = whole
            .parse()
            .map_err(|_| ParseTimestampError(value.to_string()))?;
        let centis = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().unwrap_or(0) * 10,
            _ => frac.parse::<u64>().unwrap_or(0),
        };
        seconds
            .checked_mul(100)
            .and_then(|s| s.checked_add(centis))
            .map(Self)
            .ok_or_else(|| ParseTimestampError(value.to_string()))
    }
}

impl fmt::Display for Timestamp {
    /// Formats as `seconds.centiseconds`, always two fraction digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_seconds())
    }
}

/// Error returned for malformed wire timestamps.
#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp: {0:?}")]
pub struct ParseTimestampError(pub String);

/// Per-user monotonic timestamp issuer.
///
/// Every write request freezes exactly one timestamp at entry. Two
/// writes for the same user never receive the same value: if the wall
/// clock has not advanced past the user's last issued stamp, the next
/// one is `last + 1`.
///
/// # Thread Safety
///
/// `Clock` is `Sync`; the per-user last-seen values live in a `DashMap`
/// so concurrent users never contend with each other.
#[derive(Default)]
pub struct Clock {
    last_issued: DashMap<u64, u64>,
}

impl Clock {
    /// Creates a clock with no issuance history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes the request timestamp for a write on behalf of `user_id`.
    ///
    /// Strictly greater than every previous value returned for the same
    /// user by this process.
    pub fn freeze(&self, user_id: u64) -> Timestamp {
        let now = Timestamp::now().as_centis();
        let mut last = self.last_issued.entry(user_id).or_insert(0);
        let issued = now.max(*last + 1);
        *last = issued;
        Timestamp::from_centis(issued)
    }

    /// Records a timestamp observed from storage, so later freezes stay
    /// ahead of stamps issued before a restart.
    pub fn observe(&self, user_id: u64, ts: Timestamp) {
        let mut last = self.last_issued.entry(user_id).or_insert(0);
        if ts.as_centis() > *last {
            *last = ts.as_centis();
        }
    }
}
