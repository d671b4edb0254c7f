// Simulated TMC2209 chips sharing one single-wire bus
//
// Behaves like the real wire: every byte the host sends is echoed, a valid
// read request addressed to a present chip is answered with an 8-byte reply,
// and a valid write lands in the register file and bumps IFCNT.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::trace;

use super::tmc2209::{
    MASTER_ADDRESS, MAX_ADDRESS, READ_REQUEST_LEN, REPLY_LEN, Register, SYNC_BYTE, Transport,
    WRITE_FRAME_LEN, bits, crc8,
};

const CHIP_COUNT: usize = MAX_ADDRESS as usize + 1;

/// IOIN.VERSION of the real part
const CHIP_VERSION: u32 = 0x21;
/// CHOPCONF reset value (TOFF=3, HSTRT=5, 256 microsteps, intpol)
const CHOPCONF_RESET: u32 = 0x1000_0053;

#[derive(Debug)]
struct Chip {
    registers: HashMap<u8, u32>,
    ifcnt: u8,
    present: bool,
    stallguard_script: VecDeque<u16>,
}

impl Chip {
    fn new(address: u8) -> Self {
        let mut registers = HashMap::new();
        let ms_pins = ((address as u32 & 0x1) << 2) | ((address as u32 & 0x2) << 2);
        registers.insert(Register::Ioin as u8, (CHIP_VERSION << 24) | ms_pins);
        registers.insert(Register::Chopconf as u8, CHOPCONF_RESET);
        registers.insert(Register::DrvStatus as u8, 1 << 31);
        Self {
            registers,
            ifcnt: 0,
            present: true,
            stallguard_script: VecDeque::new(),
        }
    }

    fn read(&mut self, index: u8) -> u32 {
        if index == Register::Ifcnt as u8 {
            return self.ifcnt as u32;
        }
        if index == Register::SgResult as u8 {
            let next = if self.stallguard_script.len() > 1 {
                self.stallguard_script.pop_front()
            } else {
                self.stallguard_script.front().copied()
            };
            if let Some(value) = next {
                return value as u32;
            }
        }
        self.registers.get(&index).copied().unwrap_or(0)
    }

    fn write(&mut self, index: u8, value: u32) {
        if index == Register::Gstat as u8 {
            // write-one-to-clear
            let current = self.registers.get(&index).copied().unwrap_or(0);
            self.registers
                .insert(index, current & !(value & bits::gstat::ALL));
        } else {
            self.registers.insert(index, value);
        }
        self.ifcnt = self.ifcnt.wrapping_add(1);
    }
}

#[derive(Debug)]
struct BusState {
    chips: Vec<Chip>,
    incoming: Vec<u8>,
    outgoing: VecDeque<u8>,
    corruptions: VecDeque<(usize, u8)>,
    echo_corruptions: VecDeque<(usize, u8)>,
}

impl BusState {
    fn process(&mut self) {
        loop {
            // resync on the sync byte
            while self.incoming.first().is_some_and(|&b| b != SYNC_BYTE) {
                self.incoming.remove(0);
            }
            if self.incoming.len() < 3 {
                return;
            }
            let is_write = self.incoming[2] & 0x80 != 0;
            let len = if is_write { WRITE_FRAME_LEN } else { READ_REQUEST_LEN };
            if self.incoming.len() < len {
                return;
            }
            let frame: Vec<u8> = self.incoming.drain(..len).collect();
            // noise on the echo path only, the chip still sees a clean frame
            let mut echo = frame.clone();
            if let Some((byte, mask)) = self.echo_corruptions.pop_front() {
                echo[byte % len] ^= mask;
            }
            self.outgoing.extend(echo);

            if crc8(&frame[..len - 1]) != frame[len - 1] {
                trace!("sim: dropping frame with bad CRC {:02X?}", frame);
                continue;
            }
            let address = frame[1] as usize;
            let Some(chip) = self.chips.get_mut(address).filter(|c| c.present) else {
                continue;
            };
            let index = frame[2] & 0x7F;

            if is_write {
                let value = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]);
                chip.write(index, value);
            } else {
                let value = chip.read(index);
                let mut reply = [0u8; REPLY_LEN];
                reply[0] = SYNC_BYTE;
                reply[1] = MASTER_ADDRESS;
                reply[2] = index;
                reply[3..7].copy_from_slice(&value.to_be_bytes());
                reply[7] = crc8(&reply[..7]);
                if let Some((byte, mask)) = self.corruptions.pop_front() {
                    reply[byte % REPLY_LEN] ^= mask;
                }
                self.outgoing.extend(reply);
            }
        }
    }
}

/// Handle to the simulated bus. Clones share state; give one to `TmcBus`
/// and keep another to inspect registers or inject faults.
#[derive(Debug, Clone)]
pub struct SimulatedChips {
    state: Arc<Mutex<BusState>>,
}

impl Default for SimulatedChips {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChips {
    pub fn new() -> Self {
        let chips = (0..CHIP_COUNT as u8).map(Chip::new).collect();
        Self {
            state: Arc::new(Mutex::new(BusState {
                chips,
                incoming: Vec::new(),
                outgoing: VecDeque::new(),
                corruptions: VecDeque::new(),
                echo_corruptions: VecDeque::new(),
            })),
        }
    }

    pub fn set_register(&self, address: u8, register: Register, value: u32) {
        let mut state = self.state.lock();
        if let Some(chip) = state.chips.get_mut(address as usize) {
            chip.registers.insert(register as u8, value);
        }
    }

    pub fn register(&self, address: u8, register: Register) -> u32 {
        let state = self.state.lock();
        state
            .chips
            .get(address as usize)
            .and_then(|c| c.registers.get(&(register as u8)).copied())
            .unwrap_or(0)
    }

    /// Chips that are not present still see their request echoed, but never reply
    pub fn set_present(&self, address: u8, present: bool) {
        if let Some(chip) = self.state.lock().chips.get_mut(address as usize) {
            chip.present = present;
        }
    }

    /// XOR `mask` into byte `index` of the next reply datagram
    pub fn corrupt_next_reply(&self, index: usize, mask: u8) {
        self.state.lock().corruptions.push_back((index, mask));
    }

    /// XOR `mask` into byte `index` of the next echoed request
    pub fn corrupt_next_echo(&self, index: usize, mask: u8) {
        self.state.lock().echo_corruptions.push_back((index, mask));
    }

    /// Values returned by successive SG_RESULT reads; the last one repeats
    pub fn script_stallguard(&self, address: u8, values: impl IntoIterator<Item = u16>) {
        if let Some(chip) = self.state.lock().chips.get_mut(address as usize) {
            chip.stallguard_script = values.into_iter().collect();
        }
    }
}

impl Read for SimulatedChips {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.outgoing.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply on bus"));
        }
        let n = buf.len().min(state.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedChips {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.incoming.extend_from_slice(buf);
        state.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimulatedChips {
    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().outgoing.clear();
        Ok(())
    }
}
