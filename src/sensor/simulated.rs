//! Pulse sources that do not need hardware.
//!
//! [`SimulatedSource`] lets the agent run on a host without an I2C bus by
//! deriving flow from the stations the scheduler has switched on.
//! [`ScriptedSource`] replays a fixed sequence of readings.

use crate::core::valves::{SharedStationBoard, ValveStateTracker};
use crate::sensor::types::SensorError;
use crate::sensor::PulseSource;
use std::collections::VecDeque;

/// Source reporting a fixed rate per open station.
pub struct SimulatedSource {
    board: SharedStationBoard,
    rate_per_station: u32,
    leak_rate: u32,
}

impl SimulatedSource {
    pub fn new(board: SharedStationBoard, rate_per_station: u32) -> Self {
        Self {
            board,
            rate_per_station,
            leak_rate: 0,
        }
    }

    /// Add a constant flow that is present even with every valve closed.
    pub fn with_leak(mut self, leak_rate: u32) -> Self {
        self.leak_rate = leak_rate;
        self
    }
}

impl PulseSource for SimulatedSource {
    fn read_rate(&mut self) -> Result<u32, SensorError> {
        let open = ValveStateTracker::snapshot_shared(&self.board).open.len() as u32;
        Ok(open * self.rate_per_station + self.leak_rate)
    }

    fn describe(&self) -> String {
        format!(
            "simulated flow sensor ({} pulses/s per station)",
            self.rate_per_station
        )
    }
}

/// Source replaying a queue of readings, then reporting exhaustion.
#[derive(Default)]
pub struct ScriptedSource {
    readings: VecDeque<Result<u32, SensorError>>,
}

impl ScriptedSource {
    pub fn new(readings: impl IntoIterator<Item = Result<u32, SensorError>>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }
}

impl PulseSource for ScriptedSource {
    fn read_rate(&mut self) -> Result<u32, SensorError> {
        self.readings.pop_front().unwrap_or(Err(SensorError::Exhausted))
    }

    fn describe(&self) -> String {
        "scripted flow sensor".to_string()
    }
}
