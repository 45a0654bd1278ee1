//! Per-station historical flow rates.
//!
//! The baseline for a station is the last rate measured while it ran on
//! its own. It is only replaced when a single-station window closes with a
//! positive measured rate.

use crate::core::anomaly::Baseline;
use crate::store::StoreError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Last single-station rate recorded for a station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRate {
    /// Pulses per hour
    pub rate: f64,
    /// When the rate was measured
    pub time: NaiveDateTime,
}

/// Station index to historical rate.
pub type BaselineMap = BTreeMap<usize, HistoricalRate>;

/// JSON file holding the baseline map.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all baselines; a missing or corrupt file yields an empty map.
    pub fn load(&self) -> BaselineMap {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not read flow baselines {:?}: {}", self.path, e);
                }
                return BaselineMap::new();
            }
        };
        // Keys are stored as strings in JSON.
        match serde_json::from_str::<BTreeMap<String, HistoricalRate>>(&content) {
            Ok(raw) => raw
                .into_iter()
                .filter_map(|(k, v)| k.parse::<usize>().ok().map(|k| (k, v)))
                .collect(),
            Err(e) => {
                tracing::warn!("Ignoring corrupt flow baselines {:?}: {}", self.path, e);
                BaselineMap::new()
            }
        }
    }

    /// Persist the full map.
    pub fn save(&self, baselines: &BaselineMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw: BTreeMap<String, &HistoricalRate> =
            baselines.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&raw)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Aggregate baseline for a set of open stations.
///
/// Defined only when every station has a positive history: the rates are
/// summed and the oldest recording time is reported. Otherwise unknown.
pub fn aggregate(baselines: &BaselineMap, open: &[usize]) -> Option<Baseline> {
    if open.is_empty() {
        return None;
    }
    let mut rate = 0.0;
    let mut recorded: Option<NaiveDateTime> = None;
    for station in open {
        let history = baselines.get(station).filter(|h| h.rate > 0.0)?;
        rate += history.rate;
        recorded = Some(match recorded {
            Some(r) => r.min(history.time),
            None => history.time,
        });
    }
    recorded.map(|recorded| Baseline { rate, recorded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("flow_rates.json"));
        assert!(store.load().is_empty());
        std::fs::write(store.path(), "[1,2").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::new(dir.path().join("flow_rates.json"));
        let mut map = BaselineMap::new();
        map.insert(3, HistoricalRate { rate: 100.0, time: day(1) });
        map.insert(11, HistoricalRate { rate: 42.5, time: day(2) });
        store.save(&map).unwrap();
        assert_eq!(store.load(), map);
    }

    #[test]
    fn test_aggregate() {
        let mut map = BaselineMap::new();
        map.insert(1, HistoricalRate { rate: 100.0, time: day(3) });
        map.insert(2, HistoricalRate { rate: 50.0, time: day(1) });
        map.insert(4, HistoricalRate { rate: 0.0, time: day(1) });

        let single = aggregate(&map, &[1]).unwrap();
        assert_eq!(single.rate, 100.0);
        assert_eq!(single.recorded, day(3));

        let both = aggregate(&map, &[1, 2]).unwrap();
        assert_eq!(both.rate, 150.0);
        assert_eq!(both.recorded, day(1));

        assert!(aggregate(&map, &[1, 3]).is_none());
        assert!(aggregate(&map, &[4]).is_none());
        assert!(aggregate(&map, &[]).is_none());
    }
}
