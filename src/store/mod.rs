//! Persistent state of the flow engine: usage log and baselines.

pub mod baseline;
pub mod export;
pub mod log;

use thiserror::Error;

pub use baseline::{aggregate, BaselineMap, BaselineStore, HistoricalRate};
pub use log::{EventLogStore, LogEntry, LogIter, LogWriter, WriteOutcome};

/// File names under the data directory.
pub const LOG_FILE: &str = "flowlog.json";
pub const BASELINE_FILE: &str = "flow_rates.json";
pub const SETTINGS_FILE: &str = "flow.json";

/// Errors from the on-disk stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
