// Trinamic TMC2209 single-wire UART protocol implementation
//
// Write datagram: [0x05, address, register | 0x80, data (4 bytes, big-endian), CRC]
// Read request:   [0x05, address, register, CRC]
// Read reply:     [0x05, 0xFF, register, data (4 bytes, big-endian), CRC]
//
// The bus is half-duplex: every byte sent is echoed back on the same wire,
// so a read returns the 4-byte request echo followed by the 8-byte reply.
// Up to four chips share one bus, selected by their MS1/MS2 address pins.

use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default serial configuration for the driver bus
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 20;

/// Highest chip address on one bus (MS1/MS2 strapping)
pub const MAX_ADDRESS: u8 = 3;

/// Attempts per register access before the failure is surfaced
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const SYNC_BYTE: u8 = 0x05;
pub const MASTER_ADDRESS: u8 = 0xFF;
const WRITE_BIT: u8 = 0x80;

pub const WRITE_FRAME_LEN: usize = 8;
pub const READ_REQUEST_LEN: usize = 4;
pub const REPLY_LEN: usize = 8;

/// Register map (subset used by this runtime)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Gconf = 0x00,
    Gstat = 0x01,
    Ifcnt = 0x02,
    Ioin = 0x06,
    IholdIrun = 0x10,
    Tpowerdown = 0x11,
    Tstep = 0x12,
    Tcoolthrs = 0x14,
    Vactual = 0x22,
    Sgthrs = 0x40,
    SgResult = 0x41,
    Mscnt = 0x6A,
    Chopconf = 0x6C,
    DrvStatus = 0x6F,
}

impl Register {
    pub const ALL: [Register; 14] = [
        Register::Gconf,
        Register::Gstat,
        Register::Ifcnt,
        Register::Ioin,
        Register::IholdIrun,
        Register::Tpowerdown,
        Register::Tstep,
        Register::Tcoolthrs,
        Register::Vactual,
        Register::Sgthrs,
        Register::SgResult,
        Register::Mscnt,
        Register::Chopconf,
        Register::DrvStatus,
    ];
}

/// Bit positions inside the configuration registers
pub mod bits {
    pub mod gconf {
        pub const I_SCALE_ANALOG: u32 = 1 << 0;
        pub const INTERNAL_RSENSE: u32 = 1 << 1;
        pub const EN_SPREADCYCLE: u32 = 1 << 2;
        pub const SHAFT: u32 = 1 << 3;
        pub const PDN_DISABLE: u32 = 1 << 6;
        pub const MSTEP_REG_SELECT: u32 = 1 << 7;
        pub const MULTISTEP_FILT: u32 = 1 << 8;
    }

    pub mod chopconf {
        pub const TOFF_MASK: u32 = 0xF;
        pub const VSENSE: u32 = 1 << 17;
        pub const MRES_SHIFT: u32 = 24;
        pub const MRES_MASK: u32 = 0xF << MRES_SHIFT;
        pub const INTPOL: u32 = 1 << 28;
    }

    pub mod gstat {
        pub const RESET: u32 = 1 << 0;
        pub const DRV_ERR: u32 = 1 << 1;
        pub const UV_CP: u32 = 1 << 2;
        pub const ALL: u32 = RESET | DRV_ERR | UV_CP;
    }
}

/// Error types for the driver bus
#[derive(Debug, thiserror::Error)]
pub enum TmcError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout waiting for reply from driver {address}")]
    Timeout { address: u8 },

    #[error("Checksum mismatch in reply from driver {address}")]
    ChecksumMismatch { address: u8 },

    #[error("Echo mismatch on bus while addressing driver {address}")]
    EchoMismatch { address: u8 },

    #[error("Invalid reply from driver {address}: {reason}")]
    InvalidReply { address: u8, reason: String },

    #[error("Driver address {0} out of range (0-3)")]
    InvalidAddress(u8),

    #[error("Write to {register:?} on driver {address} was not acknowledged (IFCNT {before} -> {after})")]
    WriteNotAcknowledged {
        address: u8,
        register: Register,
        before: u32,
        after: u32,
    },

    #[error("Driver {address}: {register:?} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        address: u8,
        register: Register,
        attempts: u32,
        #[source]
        last: Box<TmcError>,
    },
}

impl TmcError {
    /// Whether another attempt of the same transaction may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TmcError::Timeout { .. }
                | TmcError::ChecksumMismatch { .. }
                | TmcError::EchoMismatch { .. }
                | TmcError::InvalidReply { .. }
                | TmcError::WriteNotAcknowledged { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TmcError>;

/// CRC-8 (x^8 + x^2 + x + 1), bits fed LSB first as the chip computes it
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut current = byte;
        for _ in 0..8 {
            if ((crc >> 7) ^ (current & 0x01)) != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
            current >>= 1;
        }
    }
    crc
}

/// Build a write datagram
pub fn write_datagram(address: u8, register: Register, value: u32) -> [u8; WRITE_FRAME_LEN] {
    let mut frame = [0u8; WRITE_FRAME_LEN];
    frame[0] = SYNC_BYTE;
    frame[1] = address;
    frame[2] = register as u8 | WRITE_BIT;
    frame[3..7].copy_from_slice(&value.to_be_bytes());
    frame[7] = crc8(&frame[..7]);
    frame
}

/// Build a read request datagram
pub fn read_request(address: u8, register: Register) -> [u8; READ_REQUEST_LEN] {
    let mut frame = [0u8; READ_REQUEST_LEN];
    frame[0] = SYNC_BYTE;
    frame[1] = address;
    frame[2] = register as u8;
    frame[3] = crc8(&frame[..3]);
    frame
}

/// Validate a reply datagram and extract its 32-bit payload
pub fn decode_reply(address: u8, register: Register, reply: &[u8; REPLY_LEN]) -> Result<u32> {
    // Checksum first: any single corrupted byte must surface as a mismatch
    if crc8(&reply[..7]) != reply[7] {
        return Err(TmcError::ChecksumMismatch { address });
    }
    if reply[0] != SYNC_BYTE {
        return Err(TmcError::InvalidReply {
            address,
            reason: format!("Invalid sync byte: {:02X}", reply[0]),
        });
    }
    if reply[1] != MASTER_ADDRESS {
        return Err(TmcError::InvalidReply {
            address,
            reason: format!("Reply not addressed to master: {:02X}", reply[1]),
        });
    }
    if reply[2] != register as u8 {
        return Err(TmcError::InvalidReply {
            address,
            reason: format!(
                "Register mismatch: expected {:02X}, got {:02X}",
                register as u8, reply[2]
            ),
        });
    }
    Ok(u32::from_be_bytes([reply[3], reply[4], reply[5], reply[6]]))
}

/// Byte stream the driver bus runs on
pub trait Transport: Read + Write + Send {
    /// Discard anything left in the receive buffer
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Shared driver bus. One transaction at a time, whichever chip it addresses.
pub struct TmcBus {
    port: Mutex<Box<dyn Transport>>,
    max_attempts: u32,
}

impl TmcBus {
    /// Open the bus on a serial port
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        debug!("Driver bus open on {} at {} baud", port_name, baudrate);
        Ok(Self::from_transport(port))
    }

    /// Run the bus over any transport (simulated chips, loopback adapters)
    pub fn from_transport<T: Transport + 'static>(transport: T) -> Self {
        Self {
            port: Mutex::new(Box::new(transport)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn check_address(address: u8) -> Result<()> {
        if address > MAX_ADDRESS {
            return Err(TmcError::InvalidAddress(address));
        }
        Ok(())
    }

    fn read_frame(port: &mut dyn Transport, buf: &mut [u8], address: u8) -> Result<()> {
        port.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof | io::ErrorKind::WouldBlock => {
                TmcError::Timeout { address }
            }
            _ => TmcError::Io(e),
        })
    }

    /// One read transaction, holding the bus lock from request to reply
    fn transact_read(&self, address: u8, register: Register) -> Result<u32> {
        let request = read_request(address, register);
        let mut port = self.port.lock();
        port.clear_input()?;
        port.write_all(&request)?;
        port.flush()?;

        let mut echo = [0u8; READ_REQUEST_LEN];
        Self::read_frame(&mut **port, &mut echo, address)?;
        let mut reply = [0u8; REPLY_LEN];
        Self::read_frame(&mut **port, &mut reply, address)?;
        drop(port);

        if echo != request {
            return Err(TmcError::EchoMismatch { address });
        }
        decode_reply(address, register, &reply)
    }

    /// One write transaction; the echo is read back and compared
    fn transact_write(&self, address: u8, register: Register, value: u32) -> Result<()> {
        let frame = write_datagram(address, register, value);
        let mut port = self.port.lock();
        port.clear_input()?;
        port.write_all(&frame)?;
        port.flush()?;

        let mut echo = [0u8; WRITE_FRAME_LEN];
        Self::read_frame(&mut **port, &mut echo, address)?;
        drop(port);

        if echo != frame {
            return Err(TmcError::EchoMismatch { address });
        }
        Ok(())
    }

    fn with_retries<T>(
        &self,
        address: u8,
        register: Register,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "Driver {} {:?}: attempt {}/{} failed: {}",
                        address, register, attempt, self.max_attempts, e
                    );
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(TmcError::RetriesExhausted {
                        address,
                        register,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read a register, retrying checksum/echo/timeout failures
    pub fn read_register(&self, address: u8, register: Register) -> Result<u32> {
        Self::check_address(address)?;
        self.with_retries(address, register, || self.transact_read(address, register))
    }

    /// Write a register, retrying echo/timeout failures
    pub fn write_register(&self, address: u8, register: Register, value: u32) -> Result<()> {
        Self::check_address(address)?;
        debug!(
            "Write driver {}: reg={:?}, value=0x{:08X}",
            address, register, value
        );
        self.with_retries(address, register, || {
            self.transact_write(address, register, value)
        })
    }

    /// Write a register and confirm the chip counted it (IFCNT advanced by one)
    pub fn write_register_checked(&self, address: u8, register: Register, value: u32) -> Result<()> {
        Self::check_address(address)?;
        self.with_retries(address, register, || {
            let before = self.read_register(address, Register::Ifcnt)?;
            self.transact_write(address, register, value)?;
            let after = self.read_register(address, Register::Ifcnt)?;
            if after != (before + 1) & 0xFF {
                return Err(TmcError::WriteNotAcknowledged {
                    address,
                    register,
                    before,
                    after,
                });
            }
            Ok(())
        })
    }
}

/// Decoded IOIN register (pin levels as the chip sees them)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ioin {
    pub enn: bool,
    pub ms1: bool,
    pub ms2: bool,
    pub diag: bool,
    pub pdn_uart: bool,
    pub step: bool,
    pub spread_en: bool,
    pub dir: bool,
    pub version: u8,
}

impl Ioin {
    pub fn from_register(value: u32) -> Self {
        Self {
            enn: value & (1 << 0) != 0,
            ms1: value & (1 << 2) != 0,
            ms2: value & (1 << 3) != 0,
            diag: value & (1 << 4) != 0,
            pdn_uart: value & (1 << 6) != 0,
            step: value & (1 << 7) != 0,
            spread_en: value & (1 << 8) != 0,
            dir: value & (1 << 9) != 0,
            version: (value >> 24) as u8,
        }
    }
}

/// Decoded DRV_STATUS register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrvStatus {
    pub standstill: bool,
    pub stealth: bool,
    pub cs_actual: u8,
    pub overtemp_prewarning: bool,
    pub overtemp_shutdown: bool,
    pub short_to_ground_a: bool,
    pub short_to_ground_b: bool,
    pub low_side_short_a: bool,
    pub low_side_short_b: bool,
    pub open_load_a: bool,
    pub open_load_b: bool,
}

impl DrvStatus {
    pub fn from_register(value: u32) -> Self {
        Self {
            standstill: value & (1 << 31) != 0,
            stealth: value & (1 << 30) != 0,
            cs_actual: ((value >> 16) & 0x1F) as u8,
            overtemp_prewarning: value & (1 << 0) != 0,
            overtemp_shutdown: value & (1 << 1) != 0,
            short_to_ground_a: value & (1 << 2) != 0,
            short_to_ground_b: value & (1 << 3) != 0,
            low_side_short_a: value & (1 << 4) != 0,
            low_side_short_b: value & (1 << 5) != 0,
            open_load_a: value & (1 << 6) != 0,
            open_load_b: value & (1 << 7) != 0,
        }
    }

    /// A diagnostic condition that also raises DIAG, indistinguishable from a stall on the pin
    pub fn has_fault(&self) -> bool {
        self.overtemp_shutdown
            || self.short_to_ground_a
            || self.short_to_ground_b
            || self.low_side_short_a
            || self.low_side_short_b
    }
}

/// Sense resistor on the common driver breakout boards (ohm)
const RSENSE: f64 = 0.11;
const VFS_LOW_SENSITIVITY: f64 = 0.325;
const VFS_HIGH_SENSITIVITY: f64 = 0.180;

/// Current scale register values for a requested run current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentSetting {
    pub irun: u8,
    pub ihold: u8,
    pub vsense: bool,
}

/// Convert run current (mA RMS) to IRUN/IHOLD, switching to high-sensitivity
/// vsense when the low-sensitivity scale would be coarser than 16 steps.
pub fn current_setting(run_current_ma: u16, hold_multiplier: f64) -> CurrentSetting {
    let scale = |vfs: f64| 32.0 * std::f64::consts::SQRT_2 * run_current_ma as f64 / 1000.0 * (RSENSE + 0.02) / vfs - 1.0;

    let mut cs = scale(VFS_LOW_SENSITIVITY);
    let mut vsense = false;
    if cs < 16.0 {
        cs = scale(VFS_HIGH_SENSITIVITY);
        vsense = true;
    }
    let cs = cs.clamp(0.0, 31.0);
    CurrentSetting {
        irun: cs.round() as u8,
        ihold: (cs * hold_multiplier).round() as u8,
        vsense,
    }
}

/// MRES field value for a microstep resolution (1..=256, power of two)
pub fn microsteps_to_mres(microsteps: u16) -> Option<u32> {
    if microsteps == 0 || microsteps > 256 || !microsteps.is_power_of_two() {
        return None;
    }
    Some(8 - microsteps.trailing_zeros())
}

pub fn mres_to_microsteps(mres: u32) -> u16 {
    1u16 << (8 - mres.min(8))
}

/// Steps/s to the chip's TSTEP time base (12 MHz clock, 1/256 microsteps)
pub fn steps_to_tstep(steps_per_second: f64, microsteps: u16) -> u32 {
    if steps_per_second <= 0.0 {
        return 0;
    }
    let usteps_256 = steps_per_second * (256.0 / microsteps as f64);
    (12_000_000.0 / usteps_256).round() as u32
}

/// Register-level view of one chip on the shared bus
#[derive(Clone)]
pub struct Tmc2209 {
    bus: Arc<TmcBus>,
    address: u8,
}

impl Tmc2209 {
    pub fn new(bus: Arc<TmcBus>, address: u8) -> Result<Self> {
        TmcBus::check_address(address)?;
        Ok(Self { bus, address })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn read(&self, register: Register) -> Result<u32> {
        self.bus.read_register(self.address, register)
    }

    pub fn write(&self, register: Register, value: u32) -> Result<()> {
        self.bus.write_register_checked(self.address, register, value)
    }

    /// Read-modify-write of a configuration register
    fn update(&self, register: Register, f: impl FnOnce(u32) -> u32) -> Result<()> {
        let value = self.read(register)?;
        self.write(register, f(value))
    }

    fn set_flag(&self, register: Register, mask: u32, on: bool) -> Result<()> {
        debug!(
            "Driver {}: {:?} mask 0x{:08X} -> {}",
            self.address, register, mask, on
        );
        self.update(register, |v| if on { v | mask } else { v & !mask })
    }

    fn flag(&self, register: Register, mask: u32) -> Result<bool> {
        Ok(self.read(register)? & mask != 0)
    }

    // === Status ===

    pub fn read_gconf(&self) -> Result<u32> {
        self.read(Register::Gconf)
    }

    pub fn read_chopconf(&self) -> Result<u32> {
        self.read(Register::Chopconf)
    }

    pub fn read_gstat(&self) -> Result<u32> {
        self.read(Register::Gstat)
    }

    /// GSTAT flags are cleared by writing ones
    pub fn clear_gstat(&self) -> Result<()> {
        self.bus
            .write_register(self.address, Register::Gstat, bits::gstat::ALL)
    }

    pub fn read_ioin(&self) -> Result<Ioin> {
        Ok(Ioin::from_register(self.read(Register::Ioin)?))
    }

    pub fn read_drv_status(&self) -> Result<DrvStatus> {
        Ok(DrvStatus::from_register(self.read(Register::DrvStatus)?))
    }

    pub fn get_interface_transmission_counter(&self) -> Result<u8> {
        Ok((self.read(Register::Ifcnt)? & 0xFF) as u8)
    }

    pub fn get_tstep(&self) -> Result<u32> {
        Ok(self.read(Register::Tstep)? & 0xF_FFFF)
    }

    pub fn get_microstep_counter(&self) -> Result<u16> {
        Ok((self.read(Register::Mscnt)? & 0x3FF) as u16)
    }

    pub fn get_stallguard_result(&self) -> Result<u16> {
        Ok((self.read(Register::SgResult)? & 0x3FF) as u16)
    }

    // === GCONF ===

    pub fn get_direction_reg(&self) -> Result<bool> {
        self.flag(Register::Gconf, bits::gconf::SHAFT)
    }

    /// Inverts the motor direction in the chip (GCONF.shaft)
    pub fn set_direction_reg(&self, inverted: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::SHAFT, inverted)
    }

    pub fn set_iscale_analog(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::I_SCALE_ANALOG, on)
    }

    pub fn get_internal_rsense(&self) -> Result<bool> {
        self.flag(Register::Gconf, bits::gconf::INTERNAL_RSENSE)
    }

    pub fn set_internal_rsense(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::INTERNAL_RSENSE, on)
    }

    pub fn get_spreadcycle(&self) -> Result<bool> {
        self.flag(Register::Gconf, bits::gconf::EN_SPREADCYCLE)
    }

    /// SpreadCycle on, StealthChop off. StallGuard only works with StealthChop.
    pub fn set_spreadcycle(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::EN_SPREADCYCLE, on)
    }

    pub fn set_pdn_disable(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::PDN_DISABLE, on)
    }

    /// Take the microstep resolution from CHOPCONF.MRES instead of MS1/MS2
    pub fn set_mstep_resolution_reg_select(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Gconf, bits::gconf::MSTEP_REG_SELECT, on)
    }

    // === CHOPCONF ===

    pub fn get_vsense(&self) -> Result<bool> {
        self.flag(Register::Chopconf, bits::chopconf::VSENSE)
    }

    pub fn set_vsense(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Chopconf, bits::chopconf::VSENSE, on)
    }

    pub fn get_interpolation(&self) -> Result<bool> {
        self.flag(Register::Chopconf, bits::chopconf::INTPOL)
    }

    pub fn set_interpolation(&self, on: bool) -> Result<()> {
        self.set_flag(Register::Chopconf, bits::chopconf::INTPOL, on)
    }

    pub fn set_toff(&self, toff: u8) -> Result<()> {
        let toff = (toff & 0xF) as u32;
        self.update(Register::Chopconf, |v| {
            (v & !bits::chopconf::TOFF_MASK) | toff
        })
    }

    pub fn read_microstepping_resolution(&self) -> Result<u16> {
        let chopconf = self.read_chopconf()?;
        Ok(mres_to_microsteps(
            (chopconf & bits::chopconf::MRES_MASK) >> bits::chopconf::MRES_SHIFT,
        ))
    }

    /// Returns false without touching the chip if `microsteps` is not a valid resolution
    pub fn set_microstepping_resolution(&self, microsteps: u16) -> Result<bool> {
        let Some(mres) = microsteps_to_mres(microsteps) else {
            return Ok(false);
        };
        self.update(Register::Chopconf, |v| {
            (v & !bits::chopconf::MRES_MASK) | (mres << bits::chopconf::MRES_SHIFT)
        })?;
        self.set_mstep_resolution_reg_select(true)?;
        Ok(true)
    }

    // === Current ===

    pub fn set_irun_ihold(&self, ihold: u8, irun: u8, hold_delay: u8) -> Result<()> {
        let value = (ihold as u32 & 0x1F)
            | ((irun as u32 & 0x1F) << 8)
            | ((hold_delay as u32 & 0x0F) << 16);
        self.write(Register::IholdIrun, value)
    }

    /// Set run current in mA; hold current is half of it
    pub fn set_current(&self, run_current_ma: u16) -> Result<CurrentSetting> {
        self.set_iscale_analog(false)?;
        let setting = current_setting(run_current_ma, 0.5);
        self.set_vsense(setting.vsense)?;
        self.set_irun_ihold(setting.ihold, setting.irun, 10)?;
        self.set_pdn_disable(true)?;
        debug!(
            "Driver {}: {} mA -> IRUN={} IHOLD={} vsense={}",
            self.address, run_current_ma, setting.irun, setting.ihold, setting.vsense
        );
        Ok(setting)
    }

    // === Velocity / StallGuard ===

    /// Internal step generator velocity; 0 hands control back to STEP/DIR
    pub fn set_vactual(&self, vactual: i32) -> Result<()> {
        self.write(Register::Vactual, (vactual as u32) & 0xFF_FFFF)
    }

    pub fn set_stallguard_threshold(&self, threshold: u8) -> Result<()> {
        self.write(Register::Sgthrs, threshold as u32)
    }

    /// Lower velocity bound (TSTEP units) for StallGuard/CoolStep
    pub fn set_coolstep_threshold(&self, tstep: u32) -> Result<()> {
        self.write(Register::Tcoolthrs, tstep & 0xF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimulatedChips;
    use proptest::prelude::*;

    fn sim_bus() -> (SimulatedChips, Arc<TmcBus>) {
        let chips = SimulatedChips::new();
        let bus = TmcBus::from_transport(chips.clone()).into_shared();
        (chips, bus)
    }

    #[test]
    fn test_crc8_known_values() {
        assert_eq!(crc8(&[0x05, 0x00, 0x00]), 0x48);
        assert_eq!(crc8(&[0x05, 0x01, 0x6C]), 0x7C);
        assert_eq!(crc8(&[0x05, 0x00, 0x80, 0x00, 0x00, 0x01, 0xC0]), 0xF6);
    }

    #[test]
    fn test_write_datagram_layout() {
        let frame = write_datagram(0, Register::Gconf, 0x0000_01C0);
        assert_eq!(frame, [0x05, 0x00, 0x80, 0x00, 0x00, 0x01, 0xC0, 0xF6]);
    }

    #[test]
    fn test_read_request_layout() {
        let frame = read_request(1, Register::Chopconf);
        assert_eq!(frame, [0x05, 0x01, 0x6C, 0x7C]);
    }

    #[test]
    fn test_decode_reply_rejects_wrong_register() {
        let mut reply = [SYNC_BYTE, MASTER_ADDRESS, Register::Gconf as u8, 0, 0, 0, 7, 0];
        reply[7] = crc8(&reply[..7]);
        assert_eq!(decode_reply(0, Register::Gconf, &reply).unwrap(), 7);
        assert!(matches!(
            decode_reply(0, Register::Chopconf, &reply),
            Err(TmcError::InvalidReply { .. })
        ));
    }

    #[test]
    fn test_current_setting() {
        // 300 mA is below the low-sensitivity resolution and switches vsense on
        let setting = current_setting(300, 0.5);
        assert_eq!(setting, CurrentSetting { irun: 9, ihold: 4, vsense: true });

        let setting = current_setting(1200, 0.5);
        assert_eq!(setting, CurrentSetting { irun: 21, ihold: 10, vsense: false });

        assert_eq!(current_setting(5000, 0.5).irun, 31);
    }

    #[test]
    fn test_microstep_conversion() {
        assert_eq!(microsteps_to_mres(256), Some(0));
        assert_eq!(microsteps_to_mres(2), Some(7));
        assert_eq!(microsteps_to_mres(1), Some(8));
        assert_eq!(microsteps_to_mres(3), None);
        assert_eq!(microsteps_to_mres(512), None);
        assert_eq!(mres_to_microsteps(7), 2);
        assert_eq!(mres_to_microsteps(0), 256);
    }

    #[test]
    fn test_steps_to_tstep() {
        assert_eq!(steps_to_tstep(100.0, 2), 938);
        assert_eq!(steps_to_tstep(0.0, 2), 0);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let (_chips, bus) = sim_bus();
        assert!(matches!(
            bus.read_register(4, Register::Gconf),
            Err(TmcError::InvalidAddress(4))
        ));
    }

    #[test]
    fn test_single_corruption_is_retried() {
        let (chips, bus) = sim_bus();
        chips.set_register(1, Register::Gconf, 0x1C0);
        chips.corrupt_next_reply(5, 0x10);
        assert_eq!(bus.read_register(1, Register::Gconf).unwrap(), 0x1C0);
    }

    #[test]
    fn test_retries_exhausted_surfaces_failure() {
        let (chips, bus) = sim_bus();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            chips.corrupt_next_reply(3, 0x01);
        }
        let err = bus.read_register(0, Register::Gconf).unwrap_err();
        match err {
            TmcError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, DEFAULT_MAX_ATTEMPTS);
                assert!(matches!(*last, TmcError::ChecksumMismatch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupted_echo_is_retried() {
        let (chips, bus) = sim_bus();
        chips.set_register(1, Register::Gconf, 0x1C0);
        chips.corrupt_next_echo(2, 0x04);
        assert_eq!(bus.read_register(1, Register::Gconf).unwrap(), 0x1C0);

        // the chip took the first frame too, only its echo was garbled
        chips.corrupt_next_echo(4, 0x80);
        bus.write_register(3, Register::Sgthrs, 77).unwrap();
        assert_eq!(chips.register(3, Register::Sgthrs), 77);
        assert_eq!(bus.read_register(3, Register::Ifcnt).unwrap(), 2);
    }

    #[test]
    fn test_echo_mismatch_on_every_attempt_surfaces_failure() {
        let (chips, bus) = sim_bus();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            chips.corrupt_next_echo(1, 0x01);
        }
        match bus.read_register(0, Register::Ioin).unwrap_err() {
            TmcError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, DEFAULT_MAX_ATTEMPTS);
                assert!(matches!(*last, TmcError::EchoMismatch { address: 0 }));
            }
            other => panic!("unexpected error: {other}"),
        }

        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            chips.corrupt_next_echo(6, 0x20);
        }
        match bus.write_register(2, Register::Tcoolthrs, 500).unwrap_err() {
            TmcError::RetriesExhausted { attempts, register, last, .. } => {
                assert_eq!(attempts, DEFAULT_MAX_ATTEMPTS);
                assert_eq!(register, Register::Tcoolthrs);
                assert!(matches!(*last, TmcError::EchoMismatch { address: 2 }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_silent_chip_times_out() {
        let (chips, bus) = sim_bus();
        chips.set_present(2, false);
        let err = bus.read_register(2, Register::Ioin).unwrap_err();
        assert!(matches!(
            err,
            TmcError::RetriesExhausted { ref last, .. } if matches!(**last, TmcError::Timeout { address: 2 })
        ));
    }

    #[test]
    fn test_checked_write_bumps_ifcnt() {
        let (chips, bus) = sim_bus();
        let driver = Tmc2209::new(bus, 0).unwrap();
        let before = driver.get_interface_transmission_counter().unwrap();
        driver.set_stallguard_threshold(120).unwrap();
        assert_eq!(driver.get_interface_transmission_counter().unwrap(), before + 1);
        assert_eq!(chips.register(0, Register::Sgthrs), 120);
    }

    #[test]
    fn test_microstepping_round_trip() {
        let (chips, bus) = sim_bus();
        let driver = Tmc2209::new(bus, 1).unwrap();
        assert!(driver.set_microstepping_resolution(2).unwrap());
        assert_eq!(driver.read_microstepping_resolution().unwrap(), 2);
        assert!(chips.register(1, Register::Gconf) & bits::gconf::MSTEP_REG_SELECT != 0);
        assert!(!driver.set_microstepping_resolution(6).unwrap());
    }

    #[test]
    fn test_set_current_writes_registers() {
        let (chips, bus) = sim_bus();
        let driver = Tmc2209::new(bus, 0).unwrap();
        driver.set_current(300).unwrap();
        assert_eq!(chips.register(0, Register::IholdIrun), 4 | (9 << 8) | (10 << 16));
        assert!(driver.get_vsense().unwrap());
        assert!(chips.register(0, Register::Gconf) & bits::gconf::PDN_DISABLE != 0);
    }

    #[test]
    fn test_flags_are_independent() {
        let (_chips, bus) = sim_bus();
        let driver = Tmc2209::new(bus, 3).unwrap();
        driver.set_spreadcycle(true).unwrap();
        driver.set_direction_reg(true).unwrap();
        driver.set_spreadcycle(false).unwrap();
        assert!(!driver.get_spreadcycle().unwrap());
        assert!(driver.get_direction_reg().unwrap());
    }

    #[test]
    fn test_chopper_and_velocity_fields() {
        let (chips, bus) = sim_bus();
        let driver = Tmc2209::new(bus, 2).unwrap();
        driver.set_toff(5).unwrap();
        assert_eq!(chips.register(2, Register::Chopconf) & bits::chopconf::TOFF_MASK, 5);
        assert!(driver.get_interpolation().unwrap());

        driver.set_vactual(-1).unwrap();
        assert_eq!(chips.register(2, Register::Vactual), 0xFF_FFFF);

        chips.set_register(2, Register::Tstep, 0xF_FFFF);
        chips.set_register(2, Register::Mscnt, 0x1_0100);
        assert_eq!(driver.get_tstep().unwrap(), 0xF_FFFF);
        assert_eq!(driver.get_microstep_counter().unwrap(), 0x100);
    }

    #[test]
    fn test_concurrent_reads_do_not_interleave() {
        let (chips, bus) = sim_bus();
        chips.set_register(0, Register::Tstep, 1111);
        chips.set_register(1, Register::Tstep, 2222);

        let handles: Vec<_> = [(0u8, 1111u32), (1, 2222)]
            .into_iter()
            .map(|(address, expected)| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        assert_eq!(bus.read_register(address, Register::Tstep).unwrap(), expected);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_register_round_trip(address in 0u8..=3, value in any::<u32>()) {
            let (_chips, bus) = sim_bus();
            bus.write_register(address, Register::Chopconf, value).unwrap();
            prop_assert_eq!(bus.read_register(address, Register::Chopconf).unwrap(), value);
        }

        #[test]
        fn prop_corrupted_reply_byte_never_decodes(
            value in any::<u32>(),
            index in 0usize..REPLY_LEN,
            flip in 1u8..=255,
        ) {
            let mut reply = [0u8; REPLY_LEN];
            reply[0] = SYNC_BYTE;
            reply[1] = MASTER_ADDRESS;
            reply[2] = Register::SgResult as u8;
            reply[3..7].copy_from_slice(&value.to_be_bytes());
            reply[7] = crc8(&reply[..7]);
            reply[index] ^= flip;
            let rejected = matches!(
                decode_reply(0, Register::SgResult, &reply),
                Err(TmcError::ChecksumMismatch { .. })
            );
            prop_assert!(rejected);
        }
    }
}
