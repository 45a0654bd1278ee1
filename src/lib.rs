//! SIP Flow Monitor - water flow monitoring for an irrigation controller.
//!
//! Reads a pulse-counting flow sensor, attributes the water to whichever
//! stations the scheduler has open, keeps a usage log and per-station
//! baseline rates, and raises alerts when the flow does not match.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SIP Flow Monitor                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │ PulseSource │──▶│ Flow window │──▶│ Notification│       │
//! │  │ (I2C / sim) │   │ (anomalies) │   │    gate     │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │                           ▲  │                              │
//! │  ┌─────────────┐          │  ▼                              │
//! │  │  Scheduler  │──notices─┘ ┌─────────────┐                 │
//! │  │ valve board │            │ Usage log + │                 │
//! │  └─────────────┘            │  baselines  │                 │
//! │                             └─────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sip_flow_monitor::{share_board, Config, FlowEngine, NotificationGate, StationBoard};
//! use sip_flow_monitor::sensor::SimulatedSource;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let board = share_board(StationBoard::new(vec!["Front".into(), "Back".into()], 0));
//! let engine = Arc::new(FlowEngine::new(Config::default(), board.clone(), NotificationGate::new()));
//! let running = Arc::new(AtomicBool::new(true));
//! let source = Box::new(SimulatedSource::new(board, 3));
//! let _handles = engine.spawn(source, running).expect("spawn flow threads");
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod notify;
pub mod sensor;
pub mod settings;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, SensorConfig};
pub use crate::core::{share_board, FlowWindow, SharedStationBoard, StationBoard, ValveNotice};
pub use engine::{FlowEngine, FlowStatus, RuntimeInfo, Transition};
pub use notify::{Notification, NotificationGate, Notifier};
pub use sensor::{PulseSource, SensorError};
pub use settings::FlowSettings;
pub use store::{LogEntry, StoreError, WriteOutcome};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
