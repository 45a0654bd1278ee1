//! Reading types shared by every pulse source.

use std::time::Duration;
use thiserror::Error;

/// Rate reported in place of a reading when the sensor could not be read.
pub const SENTINEL_RATE: i64 = -1;

/// Errors raised while reading the flow sensor.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The bus transaction failed (device absent, NACK, arbitration loss, ...).
    #[error("sensor bus error: {0}")]
    Bus(String),
    /// A scripted or simulated source has nothing more to report.
    #[error("sensor source exhausted")]
    Exhausted,
}

/// Integrates instantaneous rates into the monotonic pulse total.
///
/// The fractional remainder is carried between readings so that slow
/// flows still advance the counter.
#[derive(Debug, Default, Clone)]
pub struct PulseAccumulator {
    total: f64,
}

impl PulseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `rate` pulses/second sustained over `elapsed`, returning the new total.
    pub fn add(&mut self, rate: u32, elapsed: Duration) -> u64 {
        self.total += f64::from(rate) * elapsed.as_secs_f64();
        self.total()
    }

    /// Whole pulses counted since the accumulator was created.
    pub fn total(&self) -> u64 {
        self.total.floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_carries_fraction() {
        let mut acc = PulseAccumulator::new();
        assert_eq!(acc.add(3, Duration::from_millis(500)), 1);
        assert_eq!(acc.add(3, Duration::from_millis(500)), 3);
        assert_eq!(acc.add(0, Duration::from_secs(10)), 3);
    }
}
