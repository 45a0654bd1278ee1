//! Display smoothing of the instantaneous pulse rate.
//!
//! Only the live readout uses this; water usage is always computed from
//! the pulse total.

use statrs::statistics::Statistics;

/// Default number of readings averaged for display.
pub const DEFAULT_SMOOTHER_SIZE: usize = 4;

/// Fixed-size circular buffer of recent rate readings.
#[derive(Debug, Clone)]
pub struct RateSmoother {
    readings: Vec<f64>,
    last_reading: f64,
    next: usize,
}

impl RateSmoother {
    /// Create a smoother averaging over `size` readings (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            readings: vec![0.0; size.max(1)],
            last_reading: 0.0,
            next: 0,
        }
    }

    /// Push a reading, overwriting the oldest slot.
    pub fn add_reading(&mut self, value: f64) {
        self.last_reading = value;
        let len = self.readings.len();
        self.readings[self.next % len] = value;
        self.next = (self.next + 1) % len;
    }

    /// Most recent reading; negative when the sensor could not be read.
    pub fn last_reading(&self) -> f64 {
        self.last_reading
    }

    /// Mean over every slot, including slots not yet filled (zero).
    pub fn ave_reading(&self) -> f64 {
        self.readings.iter().mean()
    }

    /// Number of slots in the buffer.
    pub fn capacity(&self) -> usize {
        self.readings.len()
    }
}

impl Default for RateSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfilled_slots_count_as_zero() {
        let mut smoother = RateSmoother::new(4);
        smoother.add_reading(8.0);
        assert_eq!(smoother.last_reading(), 8.0);
        assert!((smoother.ave_reading() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_of_last_n() {
        let mut smoother = RateSmoother::new(3);
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            smoother.add_reading(value);
        }
        assert!((smoother.ave_reading() - 4.0).abs() < 1e-9);
        assert_eq!(smoother.last_reading(), 5.0);
    }

    #[test]
    fn test_sentinel_passes_through() {
        let mut smoother = RateSmoother::default();
        smoother.add_reading(10.0);
        smoother.add_reading(-1.0);
        assert!(smoother.last_reading() < 0.0);
        assert_eq!(smoother.capacity(), DEFAULT_SMOOTHER_SIZE);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let mut smoother = RateSmoother::new(0);
        smoother.add_reading(6.0);
        assert_eq!(smoother.ave_reading(), 6.0);
    }
}
