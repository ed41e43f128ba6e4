//! Session-scoped store of live AQI observations, one row per timestamp.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const HOUR_MS: i64 = 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ts_ms_utc: i64,
    pub aqi: f64,
}

impl Observation {
    pub fn new(ts_ms_utc: i64, aqi: f64) -> Self {
        Self { ts_ms_utc, aqi }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub total: usize,
}

/// Append-only observation store keyed by timestamp.
///
/// Merging an observation whose timestamp is already present replaces the
/// stored reading, so the most recently merged value wins. Rows are always
/// returned in ascending timestamp order.
#[derive(Debug, Clone, Default)]
pub struct LiveDataCache {
    rows: BTreeMap<i64, f64>,
}

impl LiveDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge<I>(&mut self, observations: I) -> MergeReport
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut report = MergeReport::default();
        for observation in observations {
            match self.rows.insert(observation.ts_ms_utc, observation.aqi) {
                Some(_) => report.replaced += 1,
                None => report.inserted += 1,
            }
        }
        report.total = self.rows.len();

        debug!(
            component = "cache",
            event = "cache.merge",
            inserted = report.inserted,
            replaced = report.replaced,
            total = report.total
        );

        report
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.rows
            .iter()
            .map(|(ts, aqi)| Observation::new(*ts, *aqi))
            .collect()
    }

    pub fn latest(&self) -> Option<Observation> {
        self.rows
            .iter()
            .next_back()
            .map(|(ts, aqi)| Observation::new(*ts, *aqi))
    }

    /// Last `limit` observations, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Observation> {
        let skip = self.rows.len().saturating_sub(limit);
        self.rows
            .iter()
            .skip(skip)
            .map(|(ts, aqi)| Observation::new(*ts, *aqi))
            .collect()
    }
}
