//! Bar timeframes and window alignment.
//!
//! Windows are START-labeled and aligned to the UNIX epoch: a `5m` bar stamped
//! `10:05` covers `[10:05, 10:10)`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe: {0:?} (expected one of 1m, 5m, 1h, 1d)")]
pub struct ParseTimeframeError(pub String);

impl Timeframe {
    /// Timeframes the engine can derive.
    pub const TARGETS: [Timeframe; 3] = [Timeframe::M5, Timeframe::H1, Timeframe::D1];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// The timeframe source bars are read from. Every target derives from 1m.
    pub fn source(self) -> Timeframe {
        Timeframe::M1
    }

    /// Whether this timeframe is an aggregation target (1m is ingested, never derived).
    pub fn is_derived(self) -> bool {
        self != Timeframe::M1
    }

    /// Number of source bars a fully covered window contains.
    pub fn source_bars_per_window(self) -> u32 {
        (self.seconds() / self.source().seconds()) as u32
    }

    /// Start of the window containing `ts`.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.seconds();
        let floored = ts.timestamp().div_euclid(step) * step;
        DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(ts)
    }

    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        self.floor(ts) == ts
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "1h" => Ok(Timeframe::H1),
            "1d" => Ok(Timeframe::D1),
            other => Err(ParseTimeframeError(other.to_string())),
        }
    }
}
