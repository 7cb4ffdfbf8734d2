//! High-resolution time stamps with an exact rational sub-second part.
//!
//! Frame time codes are defined at rates like 64/3 frames per millisecond,
//! so the sub-second field must not round. We carry it as an exact
//! `Ratio<u64>` in `[0, 1)` next to integral Unix seconds.

use chrono::{DateTime, TimeZone, Utc};
use num_rational::Ratio;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch plus an exact fractional second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HighResTime {
    secs: i64,
    frac: Ratio<u64>,
}

impl HighResTime {
    pub fn new(secs: i64, frac: Ratio<u64>) -> Self {
        let mut t = HighResTime { secs, frac };
        t.normalize();
        t
    }

    pub fn from_secs(secs: i64) -> Self {
        HighResTime {
            secs,
            frac: Ratio::from_integer(0),
        }
    }

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        HighResTime {
            secs: d.as_secs() as i64,
            frac: Ratio::new(u64::from(d.subsec_nanos()), 1_000_000_000),
        }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Sub-second part, always in `[0, 1)`.
    pub fn frac(&self) -> Ratio<u64> {
        self.frac
    }

    pub fn subsec_nanos(&self) -> u32 {
        (self.frac * Ratio::from_integer(1_000_000_000u64)).to_integer() as u32
    }

    fn normalize(&mut self) {
        let one = Ratio::from_integer(1u64);
        while self.frac >= one {
            self.frac -= one;
            self.secs += 1;
        }
    }

    /// Adds a non-negative fractional amount of seconds.
    pub fn add_frac(mut self, amount: Ratio<u64>) -> Self {
        let whole = amount.to_integer();
        self.secs += whole as i64;
        self.frac += amount - Ratio::from_integer(whole);
        self.normalize();
        self
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp(self.secs, self.subsec_nanos())
    }
}

impl Add<i64> for HighResTime {
    type Output = HighResTime;

    fn add(mut self, rhs: i64) -> HighResTime {
        self.secs += rhs;
        self
    }
}

impl Sub for HighResTime {
    type Output = Ratio<i64>;

    /// Signed difference in seconds.
    fn sub(self, rhs: HighResTime) -> Ratio<i64> {
        let to_i64 = |r: Ratio<u64>| Ratio::new(*r.numer() as i64, *r.denom() as i64);
        Ratio::from_integer(self.secs - rhs.secs) + to_i64(self.frac) - to_i64(rhs.frac)
    }
}

impl fmt::Display for HighResTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} +{}/{}s",
            self.as_datetime().format("%Y-%m-%dT%H:%M:%S"),
            self.frac.numer(),
            self.frac.denom()
        )
    }
}
