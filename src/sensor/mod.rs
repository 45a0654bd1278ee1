//! Pulse sources for the flow engine.
//!
//! A source reports the instantaneous pulse rate (pulses per second) of
//! the flow sensor. The engine turns those readings into the monotonic
//! pulse total with a [`PulseAccumulator`].

pub mod i2c;
pub mod simulated;
pub mod types;

pub use i2c::{I2cPulseSource, DEFAULT_ADDRESS, SENSOR_REGISTER, TEST_REGISTER};
pub use simulated::{ScriptedSource, SimulatedSource};
pub use types::{PulseAccumulator, SensorError, SENTINEL_RATE};

/// Anything that can report the current pulse rate.
pub trait PulseSource: Send {
    /// Read the instantaneous rate in pulses per second.
    fn read_rate(&mut self) -> Result<u32, SensorError>;

    /// Short description for status output.
    fn describe(&self) -> String;
}
