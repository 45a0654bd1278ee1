//! Valve state as published by the irrigation scheduler.
//!
//! The scheduler owns the "requested on" vector; the flow engine only ever
//! reads snapshots of it. Every change signal from the scheduler becomes a
//! [`ValveNotice`] carrying the time and pulse count at the moment of the
//! switch, so the window boundaries line up with the hardware counter even
//! though the notice is processed later.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Station metadata and valve vector owned by the external scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationBoard {
    /// Display names, one per station
    pub names: Vec<String>,
    /// Master valve station number (1-based, 0 = no master)
    pub master: usize,
    /// Requested-on state, one per station
    pub requested_on: Vec<bool>,
}

impl StationBoard {
    /// Create a board with every valve closed.
    pub fn new(names: Vec<String>, master: usize) -> Self {
        let requested_on = vec![false; names.len()];
        Self {
            names,
            master,
            requested_on,
        }
    }

    /// Index of the master valve in the valve vector, if one is configured.
    pub fn master_index(&self) -> Option<usize> {
        self.master.checked_sub(1)
    }

    /// Display name of a station, falling back to its number.
    pub fn station_name(&self, index: usize) -> String {
        self.names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("Station {}", index + 1))
    }

    /// Parse a valve vector such as `1,0,0,1` into requested-on states.
    pub fn parse_vector(line: &str) -> Vec<bool> {
        line.split(',')
            .map(|v| matches!(v.trim(), "1" | "on" | "true"))
            .collect()
    }
}

/// Thread-safe handle to the scheduler's station board.
pub type SharedStationBoard = Arc<RwLock<StationBoard>>;

/// Wrap a board for sharing between the scheduler and the engine.
pub fn share_board(board: StationBoard) -> SharedStationBoard {
    Arc::new(RwLock::new(board))
}

/// A valve change signalled by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveNotice {
    /// When the change was signalled
    pub switch_time: NaiveDateTime,
    /// Pulse total at the moment of the signal
    pub pulse_count: u64,
}

impl ValveNotice {
    pub fn new(switch_time: NaiveDateTime, pulse_count: u64) -> Self {
        Self {
            switch_time,
            pulse_count,
        }
    }
}

/// Open valves at one instant, master excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValveSnapshot {
    /// Open station indices, ascending
    pub open: Vec<usize>,
    /// Names matching `open`
    pub names: Vec<String>,
}

impl ValveSnapshot {
    /// Whether any non-master valve is open.
    pub fn any_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Human readable list of open stations.
    pub fn status_str(&self) -> String {
        if self.names.is_empty() {
            "All valves closed".to_string()
        } else {
            self.names.join(", ")
        }
    }
}

/// Computes which valves are open from the scheduler's vector.
///
/// The result is recomputed on every call; nothing is cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValveStateTracker;

impl ValveStateTracker {
    /// Snapshot the open valves on `board`.
    ///
    /// A valve vector shorter than the station list is padded with closed
    /// valves; the master valve never counts as open.
    pub fn snapshot(board: &StationBoard) -> ValveSnapshot {
        let master = board.master_index();
        let stations = board.names.len().max(board.requested_on.len());

        let mut snapshot = ValveSnapshot::default();
        for index in 0..stations {
            if Some(index) == master {
                continue;
            }
            if board.requested_on.get(index).copied().unwrap_or(false) {
                snapshot.open.push(index);
                snapshot.names.push(board.station_name(index));
            }
        }
        snapshot
    }

    /// Snapshot a shared board, treating a poisoned lock as "all closed".
    pub fn snapshot_shared(board: &SharedStationBoard) -> ValveSnapshot {
        match board.read() {
            Ok(board) => Self::snapshot(&board),
            Err(poisoned) => Self::snapshot(&poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(states: &[u8], master: usize) -> StationBoard {
        StationBoard {
            names: vec!["Front".into(), "Back".into(), "Side".into(), "Drip".into()],
            master,
            requested_on: states.iter().map(|s| *s == 1).collect(),
        }
    }

    #[test]
    fn test_master_excluded_even_when_on() {
        let snap = ValveStateTracker::snapshot(&board(&[1, 0, 1, 0], 1));
        assert_eq!(snap.open, vec![2]);
        assert_eq!(snap.names, vec!["Side".to_string()]);
        assert!(snap.any_open());

        let only_master = ValveStateTracker::snapshot(&board(&[1, 0, 0, 0], 1));
        assert!(!only_master.any_open());
    }

    #[test]
    fn test_no_master_configured() {
        let snap = ValveStateTracker::snapshot(&board(&[1, 1, 0, 0], 0));
        assert_eq!(snap.open, vec![0, 1]);
        assert_eq!(snap.status_str(), "Front, Back");
    }

    #[test]
    fn test_short_vector_treated_as_closed() {
        let snap = ValveStateTracker::snapshot(&board(&[0, 1], 0));
        assert_eq!(snap.open, vec![1]);

        let mut long = board(&[0, 0, 0, 0, 1], 0);
        long.names.truncate(4);
        let snap = ValveStateTracker::snapshot(&long);
        assert_eq!(snap.names, vec!["Station 5".to_string()]);
    }

    #[test]
    fn test_status_when_closed() {
        let snap = ValveStateTracker::snapshot(&board(&[0, 0, 0, 0], 0));
        assert_eq!(snap.status_str(), "All valves closed");
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(
            StationBoard::parse_vector("1, 0,on,false"),
            vec![true, false, true, false]
        );
    }
}
