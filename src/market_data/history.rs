// =============================================================================
// HistoryCache — per (symbol, timeframe) candle history
// =============================================================================
//
// The harness polls the market-data source each tick and merges the returned
// window in here. Rows are immutable by timestamp: an incoming candle either
// replaces the in-progress bar with the same open time or is appended. The
// cache is trimmed to `max_candles` per series.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Candle, Timeframe};

/// Identifies one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct HistoryKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

pub struct HistoryCache {
    buffers: RwLock<HashMap<HistoryKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl HistoryCache {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Merge a freshly fetched window into the series.
    ///
    /// `candles` must be oldest-first (the source contract). Bars older than
    /// the newest cached bar are ignored; the bar sharing the newest cached
    /// open time replaces it (the in-progress bar being updated).
    pub fn merge(&self, key: HistoryKey, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }

        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        for candle in candles {
            match ring.back() {
                Some(last) if candle.timestamp < last.timestamp => continue,
                Some(last) if candle.timestamp == last.timestamp => {
                    ring.pop_back();
                    ring.push_back(candle.clone());
                }
                _ => ring.push_back(candle.clone()),
            }
        }

        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Most recent `count` candles, oldest-first.
    pub fn window(&self, key: &HistoryKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Most recent `count` candles that are fully closed as of `now`
    /// (open time + timeframe <= now), oldest-first. Indicator snapshots use
    /// this view so an in-progress bar never leaks into them.
    pub fn closed_window(&self, key: &HistoryKey, count: usize, now: DateTime<Utc>) -> Vec<Candle> {
        let span = chrono::Duration::seconds(key.timeframe.seconds());
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring
                    .iter()
                    .filter(|c| c.timestamp + span <= now)
                    .collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close of the most recent cached bar, if any.
    pub fn last_close(&self, key: &HistoryKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().map(|c| c.close))
    }

    pub fn len(&self, key: &HistoryKey) -> usize {
        self.buffers.read().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &HistoryKey) -> bool {
        self.len(key) == 0
    }
}
