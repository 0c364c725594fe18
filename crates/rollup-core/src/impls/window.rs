//! Window fold: OHLCV + coverage-based quality for one target window.

use chrono::{DateTime, Utc};

use crate::domain::{DerivedBar, SourceBar, TaskKey};

/// Minimum share of expected source bars for a window to be built
/// without `force_incomplete` (3 of 5 for 5m).
pub const DEFAULT_MIN_COVERAGE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPolicy {
    pub min_coverage: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            min_coverage: DEFAULT_MIN_COVERAGE,
        }
    }
}

/// What to do with one closed window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowVerdict {
    Build(DerivedBar),
    Skip,
}

impl QualityPolicy {
    /// `bars` must be the window's source bars in ascending `ts` order.
    pub fn judge(
        &self,
        key: &TaskKey,
        window_start: DateTime<Utc>,
        bars: &[&SourceBar],
        derivation_version: u32,
        force_incomplete: bool,
    ) -> WindowVerdict {
        let expected = key.timeframe.source_bars_per_window();
        let coverage = coverage(bars.len(), expected);
        if bars.is_empty() || (coverage < self.min_coverage && !force_incomplete) {
            return WindowVerdict::Skip;
        }
        match fold(key, window_start, bars, coverage, derivation_version) {
            Some(bar) => WindowVerdict::Build(bar),
            None => WindowVerdict::Skip,
        }
    }
}

/// Present / expected, clamped to `[0, 1]` and rounded to 4 decimals.
pub fn coverage(present: usize, expected: u32) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    let raw = (present as f64 / expected as f64).min(1.0);
    (raw * 10_000.0).round() / 10_000.0
}

fn fold(
    key: &TaskKey,
    window_start: DateTime<Utc>,
    bars: &[&SourceBar],
    quality_score: f64,
    derivation_version: u32,
) -> Option<DerivedBar> {
    let first = bars.first()?;
    let last = bars.last()?;

    let (high, low, volume) = bars.iter().fold(
        (f64::NEG_INFINITY, f64::INFINITY, 0.0),
        |(high, low, volume), bar| (high.max(bar.high), low.min(bar.low), volume + bar.volume),
    );

    Some(DerivedBar {
        symbol: key.symbol.clone(),
        timeframe: key.timeframe,
        window_start,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        quality_score,
        source_bars: bars.len() as u32,
        derivation_version,
    })
}
