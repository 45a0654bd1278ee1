//! Flow controller attached over I2C.
//!
//! The controller is a small microcontroller that counts sensor pulses and
//! exposes the current pulses-per-second as a little-endian `u32`.

use crate::config::SensorConfig;
use crate::sensor::types::SensorError;
use crate::sensor::PulseSource;
use embedded_hal::i2c::{Error as _, I2c};

/// Default bus address of the flow controller.
pub const DEFAULT_ADDRESS: u8 = 0x44;

/// Register holding the live pulse rate.
pub const SENSOR_REGISTER: u8 = 0x00;

/// Register that makes the controller report random rates, for bench testing.
pub const TEST_REGISTER: u8 = 0x01;

const READING_LEN: usize = 4;

/// Pulse source backed by any `embedded-hal` I2C bus.
pub struct I2cPulseSource<I> {
    bus: I,
    address: u8,
    register: u8,
}

impl<I: I2c> I2cPulseSource<I> {
    pub fn new(bus: I, address: u8, register: u8) -> Self {
        Self {
            bus,
            address,
            register,
        }
    }

    /// Source at the address and register named in the engine config.
    pub fn from_config(bus: I, config: &SensorConfig) -> Self {
        Self::new(bus, config.address, config.register)
    }

    /// Release the underlying bus.
    pub fn into_inner(self) -> I {
        self.bus
    }
}

impl<I: I2c + Send> PulseSource for I2cPulseSource<I> {
    fn read_rate(&mut self) -> Result<u32, SensorError> {
        let mut buf = [0u8; READING_LEN];
        self.bus
            .write_read(self.address, &[self.register], &mut buf)
            .map_err(|e| SensorError::Bus(format!("{:?}", e.kind())))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn describe(&self) -> String {
        format!("i2c flow controller at 0x{:02X}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    #[derive(Debug)]
    struct BusError(ErrorKind);

    impl embedded_hal::i2c::Error for BusError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    /// Fake bus answering with a fixed register image.
    struct FakeBus {
        present: bool,
        value: u32,
        last_register: Option<u8>,
    }

    impl ErrorType for FakeBus {
        type Error = BusError;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if !self.present {
                return Err(BusError(ErrorKind::NoAcknowledge(
                    NoAcknowledgeSource::Address,
                )));
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.last_register = bytes.first().copied(),
                    Operation::Read(buf) => {
                        let bytes = self.value.to_le_bytes();
                        buf.copy_from_slice(&bytes[..buf.len()]);
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_reads_little_endian_rate() {
        let bus = FakeBus {
            present: true,
            value: 0x0102,
            last_register: None,
        };
        let mut source = I2cPulseSource::new(bus, DEFAULT_ADDRESS, SENSOR_REGISTER);
        assert_eq!(source.read_rate().unwrap(), 258);
        assert_eq!(source.into_inner().last_register, Some(SENSOR_REGISTER));
    }

    #[test]
    fn test_config_selects_register() {
        let bus = FakeBus {
            present: true,
            value: 7,
            last_register: None,
        };
        let config = SensorConfig {
            register: TEST_REGISTER,
            ..SensorConfig::default()
        };
        let mut source = I2cPulseSource::from_config(bus, &config);
        assert_eq!(source.read_rate().unwrap(), 7);
        assert_eq!(source.into_inner().last_register, Some(TEST_REGISTER));
    }

    #[test]
    fn test_missing_device_is_bus_error() {
        let bus = FakeBus {
            present: false,
            value: 0,
            last_register: None,
        };
        let mut source = I2cPulseSource::new(bus, DEFAULT_ADDRESS, SENSOR_REGISTER);
        assert!(matches!(source.read_rate(), Err(SensorError::Bus(_))));
        assert!(source.describe().contains("0x44"));
    }
}
