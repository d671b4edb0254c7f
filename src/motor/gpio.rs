// GPIO pins for STEP/DIR/EN, the magnet and the DIAG inputs
//
// Everything above this module talks to pins through the embedded-hal 1.0
// digital traits, so the same motion code runs on Linux sysfs GPIO or on
// in-memory simulated pins.

use embedded_hal::digital::{ErrorKind, ErrorType, InputPin, OutputPin};
use std::convert::Infallible;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// Output pin usable from a movement thread
pub trait MotorPin: OutputPin + Send + 'static {}
impl<T: OutputPin + Send + 'static> MotorPin for T {}

/// Input pin usable from an edge watcher thread
pub trait SensePin: InputPin + Send + 'static {}
impl<T: InputPin + Send + 'static> SensePin for T {}

#[derive(Debug, thiserror::Error)]
#[error("GPIO {pin}: {source}")]
pub struct GpioError {
    pin: u32,
    #[source]
    source: io::Error,
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Pin driven through the Linux sysfs GPIO interface (BCM numbering)
pub struct SysfsPin {
    number: u32,
    value: File,
}

impl SysfsPin {
    fn base(number: u32) -> PathBuf {
        PathBuf::from(SYSFS_GPIO).join(format!("gpio{}", number))
    }

    fn export(number: u32) -> io::Result<()> {
        if Self::base(number).exists() {
            return Ok(());
        }
        std::fs::write(PathBuf::from(SYSFS_GPIO).join("export"), number.to_string())?;
        // udev needs a moment to fix up permissions on the new node
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    fn open(number: u32, direction: &str) -> Result<Self, GpioError> {
        let setup = || -> io::Result<File> {
            Self::export(number)?;
            std::fs::write(Self::base(number).join("direction"), direction)?;
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(Self::base(number).join("value"))
        };
        let value = setup().map_err(|source| GpioError { pin: number, source })?;
        debug!("GPIO {} configured as {}", number, direction);
        Ok(Self { number, value })
    }

    /// Configure as output with an initial level (set atomically with the direction)
    pub fn output(number: u32, initial_high: bool) -> Result<Self, GpioError> {
        Self::open(number, if initial_high { "high" } else { "low" })
    }

    pub fn input(number: u32) -> Result<Self, GpioError> {
        Self::open(number, "in")
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    fn write_level(&mut self, high: bool) -> Result<(), GpioError> {
        let pin = self.number;
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(if high { b"1" } else { b"0" }))
            .map_err(|source| GpioError { pin, source })
    }

    fn read_level(&mut self) -> Result<bool, GpioError> {
        let pin = self.number;
        let mut buf = [0u8; 1];
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read_exact(&mut buf))
            .map_err(|source| GpioError { pin, source })?;
        Ok(buf[0] == b'1')
    }
}

impl ErrorType for SysfsPin {
    type Error = GpioError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_level(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_level(true)
    }
}

impl InputPin for SysfsPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.read_level()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.read_level()?)
    }
}

#[derive(Debug, Default)]
struct SimPinState {
    level: AtomicBool,
    rising_edges: AtomicU64,
}

/// In-memory pin. Clones share the same level, so a test can keep one clone
/// to observe an output or to drive an input.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    state: Arc<SimPinState>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(high: bool) -> Self {
        let pin = Self::default();
        pin.state.level.store(high, Ordering::SeqCst);
        pin
    }

    /// Drive the level from outside (simulated DIAG output)
    pub fn drive(&self, high: bool) {
        let was = self.state.level.swap(high, Ordering::SeqCst);
        if high && !was {
            self.state.rising_edges.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn level(&self) -> bool {
        self.state.level.load(Ordering::SeqCst)
    }

    /// Number of low-to-high transitions seen (step pulses on a STEP pin)
    pub fn rising_edges(&self) -> u64 {
        self.state.rising_edges.load(Ordering::SeqCst)
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_pin_clones_share_level() {
        let observer = SimPin::new();
        let mut pin = observer.clone();
        pin.set_high().unwrap();
        assert!(observer.level());
        pin.set_low().unwrap();
        pin.set_high().unwrap();
        assert_eq!(observer.rising_edges(), 2);
    }

    #[test]
    fn test_sim_pin_as_input() {
        let driver = SimPin::with_level(true);
        let mut input = driver.clone();
        assert!(input.is_high().unwrap());
        driver.drive(false);
        assert!(input.is_low().unwrap());
        driver.drive(true);
        assert!(input.is_high().unwrap());
        assert_eq!(driver.rising_edges(), 1);
    }
}
