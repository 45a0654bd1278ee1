//! Core flow-monitoring logic.
//!
//! This module contains:
//! - Valve snapshots taken from the scheduler's station board
//! - The display rate smoother
//! - Flow windows and their anomaly checks

pub mod anomaly;
pub mod smoother;
pub mod valves;
pub mod window;

// Re-export commonly used types
pub use anomaly::{Anomaly, AnomalyKind, Baseline, Channel, ChannelFlags, EventList};
pub use smoother::{RateSmoother, DEFAULT_SMOOTHER_SIZE};
pub use valves::{
    share_board, SharedStationBoard, StationBoard, ValveNotice, ValveSnapshot, ValveStateTracker,
};
pub use window::{FlowWindow, WarningFlags, MEASURE_SECS, SETTLE_SECS};
