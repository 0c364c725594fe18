//! Price bars: 1m source bars and derived higher-timeframe bars.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timeframe::Timeframe;

/// A 1m bar written by ingestion. Read-only for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBar {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// An aggregated bar, START-labeled and unique per (symbol, timeframe, window_start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedBar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    /// Fraction of expected source bars present, in `[0, 1]`.
    pub quality_score: f64,
    pub source_bars: u32,
    pub derivation_version: u32,
}

impl DerivedBar {
    pub fn is_low_quality(&self) -> bool {
        self.quality_score < 1.0
    }
}
