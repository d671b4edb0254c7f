// Wiring, bus settings, step geometry and speed profiles
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::messages::Square;

// Driver bus (both chips on the Pi's UART)
pub const BUS_PORT: &str = "/dev/serial0";
pub const BUS_BAUDRATE: u32 = 115_200;

// Electromagnet output (active high)
pub const MAGNET_PIN: u32 = 18;

// Axis A: driver address 1 (BCM pin numbers)
pub const AXIS_A_ADDRESS: u8 = 1;
pub const AXIS_A_ENABLE_PIN: u32 = 26;
pub const AXIS_A_STEP_PIN: u32 = 13;
pub const AXIS_A_DIR_PIN: u32 = 19;

// Axis B: driver address 0
pub const AXIS_B_ADDRESS: u8 = 0;
pub const AXIS_B_ENABLE_PIN: u32 = 21;
pub const AXIS_B_STEP_PIN: u32 = 16;
pub const AXIS_B_DIR_PIN: u32 = 20;

// One square along a file or rank (both motors turn)
pub const SQUARE_STEPS: u32 = 505;
// One square along a diagonal (a single motor turns)
pub const DIAGONAL_STEPS: u32 = 1010;

// Full steps per motor revolution
pub const FULLSTEPS_PER_REV: u32 = 200;

// Hold time with the magnet on after a loaded move
pub const MAGNET_SETTLE: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

/// Per-axis driver chip settings, applied once before operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Run current in mA RMS
    pub run_current_ma: u16,
    /// Microsteps per full step (power of two, 1-256)
    pub microsteps: u16,
    /// Interpolate to 256 microsteps
    pub interpolation: bool,
    /// SpreadCycle instead of StealthChop (StallGuard needs StealthChop)
    pub spreadcycle: bool,
    /// Internal sense resistors instead of the board's external ones
    pub internal_rsense: bool,
    /// Invert the motor direction in the chip
    pub invert_direction: bool,
    /// Steps/s^2
    pub acceleration: f64,
    /// Steps/s
    pub max_speed: f64,
    /// Scale the first step interval by 0.676 for a symmetric ramp
    pub first_step_correction: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            run_current_ma: 300,
            microsteps: 2,
            interpolation: true,
            spreadcycle: false,
            internal_rsense: false,
            invert_direction: false,
            acceleration: 1000.0,
            max_speed: 1000.0,
            first_step_correction: false,
        }
    }
}

impl DriverConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.run_current_ma == 0 || self.run_current_ma > 2000 {
            return Err(invalid(
                "run_current_ma",
                format!("must be 1-2000 mA, got {}", self.run_current_ma),
            ));
        }
        if self.microsteps == 0 || self.microsteps > 256 || !self.microsteps.is_power_of_two() {
            return Err(invalid(
                "microsteps",
                format!("must be a power of two up to 256, got {}", self.microsteps),
            ));
        }
        positive("acceleration", self.acceleration)?;
        positive("max_speed", self.max_speed)?;
        Ok(self)
    }

    pub fn steps_per_rev(&self) -> u32 {
        FULLSTEPS_PER_REV * self.microsteps as u32
    }
}

/// Speed/acceleration pair switched between unloaded and loaded travel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub max_speed: f64,
    pub acceleration: f64,
}

impl SpeedProfile {
    /// Travel without a piece
    pub const FREE: SpeedProfile = SpeedProfile {
        max_speed: 1000.0,
        acceleration: 1000.0,
    };

    /// Dragging a piece: slower and gentler so it stays on the magnet
    pub const LOADED: SpeedProfile = SpeedProfile {
        max_speed: 500.0,
        acceleration: 300.0,
    };

    pub fn validate(self) -> Result<Self, ConfigError> {
        positive("max_speed", self.max_speed)?;
        positive("acceleration", self.acceleration)?;
        Ok(self)
    }
}

/// StallGuard homing parameters for one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingConfig {
    /// SG_RESULT below this value at max speed counts as a stall
    pub threshold: u16,
    /// Speed (steps/s) below which the chip ignores StallGuard
    pub min_speed: f64,
    /// Give up after this many steps without a stall
    pub max_travel_steps: u32,
    /// DIAG edge debounce
    pub debounce_ms: u64,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            threshold: 250,
            min_speed: 100.0,
            max_travel_steps: 12_000,
            debounce_ms: 300,
        }
    }
}

impl HomingConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.threshold > 510 {
            return Err(invalid(
                "threshold",
                format!("SG_RESULT is 0-510, got {}", self.threshold),
            ));
        }
        if self.max_travel_steps == 0 {
            return Err(invalid("max_travel_steps", "must be non-zero"));
        }
        positive("min_speed", self.min_speed)?;
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// BCM pin numbers for one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPins {
    pub enable: u32,
    pub step: u32,
    pub dir: u32,
    /// DIAG output of the driver, if wired
    #[serde(default)]
    pub diag: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub magnet: u32,
    pub axis_a: AxisPins,
    pub axis_b: AxisPins,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            magnet: MAGNET_PIN,
            axis_a: AxisPins {
                enable: AXIS_A_ENABLE_PIN,
                step: AXIS_A_STEP_PIN,
                dir: AXIS_A_DIR_PIN,
                diag: None,
            },
            axis_b: AxisPins {
                enable: AXIS_B_ENABLE_PIN,
                step: AXIS_B_STEP_PIN,
                dir: AXIS_B_DIR_PIN,
                diag: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub port: String,
    pub baudrate: u32,
    pub max_attempts: u32,
    pub axis_a_address: u8,
    pub axis_b_address: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: BUS_PORT.to_string(),
            baudrate: BUS_BAUDRATE,
            max_attempts: crate::motor::tmc2209::DEFAULT_MAX_ATTEMPTS,
            axis_a_address: AXIS_A_ADDRESS,
            axis_b_address: AXIS_B_ADDRESS,
        }
    }
}

impl BusConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        let max = crate::motor::tmc2209::MAX_ADDRESS;
        if self.axis_a_address > max || self.axis_b_address > max {
            return Err(invalid("address", format!("driver addresses are 0-{}", max)));
        }
        if self.axis_a_address == self.axis_b_address {
            return Err(invalid("address", "both axes share one driver address"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        Ok(self)
    }
}

/// Step geometry and motion profiles of the trolley
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrolleyConfig {
    pub square_steps: u32,
    pub diagonal_steps: u32,
    pub free: SpeedProfile,
    pub loaded: SpeedProfile,
    pub magnet_settle_ms: u64,
    /// Offset from the homed corner to the centre of the corner square
    pub origin_offset_squares: f32,
    /// Where the trolley waits between moves
    pub park: Square,
    pub homing_a: HomingConfig,
    pub homing_b: HomingConfig,
}

impl Default for TrolleyConfig {
    fn default() -> Self {
        Self {
            square_steps: SQUARE_STEPS,
            diagonal_steps: DIAGONAL_STEPS,
            free: SpeedProfile::FREE,
            loaded: SpeedProfile::LOADED,
            magnet_settle_ms: MAGNET_SETTLE.as_millis() as u64,
            origin_offset_squares: 0.75,
            park: Square { x: 3, y: 7 },
            homing_a: HomingConfig::default(),
            homing_b: HomingConfig::default(),
        }
    }
}

impl TrolleyConfig {
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.square_steps == 0 || self.diagonal_steps == 0 {
            return Err(invalid("square_steps", "step sizes must be non-zero"));
        }
        if !self.origin_offset_squares.is_finite() || self.origin_offset_squares < 0.0 {
            return Err(invalid("origin_offset_squares", "must be zero or positive"));
        }
        self.free = self.free.validate()?;
        self.loaded = self.loaded.validate()?;
        self.homing_a = self.homing_a.validate()?;
        self.homing_b = self.homing_b.validate()?;
        Ok(self)
    }

    pub fn magnet_settle(&self) -> Duration {
        Duration::from_millis(self.magnet_settle_ms)
    }
}

/// Everything the runtime needs, loadable from a JSON file. Never written back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bus: BusConfig,
    pub pins: PinMap,
    pub driver: DriverConfig,
    pub trolley: TrolleyConfig,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(text)?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        Ok(Self {
            bus: self.bus.validate()?,
            pins: self.pins,
            driver: self.driver.validate()?,
            trolley: self.trolley.validate()?,
        })
    }
}
