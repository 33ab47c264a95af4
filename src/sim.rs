//! Simulated iCE board with an attached SPI NOR flash, for tests.
//!
//! Interprets the command stream seen on the bus: reads are answered as bytes
//! are clocked, and write-type commands take effect when chip select is
//! deasserted, as on a real chip. Clones share state.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use anyhow::anyhow;
use crate::board::{BoardControl, SpiBus, Result};
use crate::clock::{Clock, virt::VirtualClock};

pub const SIM_SIZE: usize = 0x10_0000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ReleaseReset,
    Deselect,
    Cdone,
    Command(u8),
    Close,
    Abort,
}

struct State {
    memory: Vec<u8>,
    current: Option<Vec<u8>>,
    transactions: Vec<Vec<u8>>,
    events: Vec<Event>,
    reset_released: bool,
    cdone: bool,

    protect: u8,
    locked: bool,
    wel: bool,
    busy: usize,
    busy_polls: usize,
    stuck_busy: bool,
    status_script: VecDeque<u8>,
    status_latch: u8,

    jedec: Vec<u8>,

    ops: usize,
    fail_after: Option<usize>,
    fail_on: Option<u8>,
}

#[derive(Clone)]
pub struct SimFlash {
    state: Rc<RefCell<State>>,
    clock: VirtualClock,
}

impl SimFlash {
    pub fn new() -> Self {
        let state = State {
            memory: vec![0xFF; SIM_SIZE],
            current: None,
            transactions: Vec::new(),
            events: Vec::new(),
            reset_released: false,
            cdone: false,
            protect: 0,
            locked: false,
            wel: false,
            busy: 0,
            busy_polls: 0,
            stuck_busy: false,
            status_script: VecDeque::new(),
            status_latch: 0,
            jedec: vec![0xEF, 0x40, 0x16, 0x00],
            ops: 0,
            fail_after: None,
            fail_on: None,
        };
        SimFlash { state: Rc::new(RefCell::new(state)), clock: VirtualClock::new() }
    }

    /// Every completed transaction, as the bytes clocked out.
    pub fn transactions(&self) -> Vec<Vec<u8>> {
        self.state.borrow().transactions.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    /// Forget recorded transactions and events.
    pub fn clear_log(&self) {
        let mut s = self.state.borrow_mut();
        s.transactions.clear();
        s.events.clear();
    }

    /// (address, length) of each page program.
    pub fn programs(&self) -> Vec<(u32, usize)> {
        self.addressed(0x02)
    }

    /// (address, length) of each data read.
    pub fn reads(&self) -> Vec<(u32, usize)> {
        self.addressed(0x03)
    }

    /// Address of each 64kB block erase.
    pub fn erases(&self) -> Vec<u32> {
        self.addressed(0xD8).into_iter().map(|(addr, _)| addr).collect()
    }

    fn addressed(&self, opcode: u8) -> Vec<(u32, usize)> {
        self.state.borrow().transactions.iter()
            .filter(|t| t.len() >= 4 && t[0] == opcode)
            .map(|t| (address(t), t.len() - 4))
            .collect()
    }

    pub fn status_reads(&self) -> usize {
        self.state.borrow().transactions.iter().filter(|t| t.first() == Some(&0x05)).count()
    }

    /// Answer the next status reads from `values` instead of the chip model.
    pub fn script_status(&self, values: &[u8]) {
        self.state.borrow_mut().status_script.extend(values);
    }

    pub fn remaining_status(&self) -> usize {
        self.state.borrow().status_script.len()
    }

    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state.borrow_mut().stuck_busy = stuck;
    }

    /// Number of busy status reads following each program or erase.
    pub fn set_busy_polls(&self, polls: usize) {
        self.state.borrow_mut().busy_polls = polls;
    }

    pub fn set_status_protect(&self, bits: u8) {
        self.state.borrow_mut().protect = bits & 0xFC;
    }

    /// Ignore status register writes.
    pub fn set_status_locked(&self, locked: bool) {
        self.state.borrow_mut().locked = locked;
    }

    pub fn set_jedec(&self, bytes: &[u8]) {
        self.state.borrow_mut().jedec = bytes.to_vec();
    }

    pub fn set_cdone(&self, cdone: bool) {
        self.state.borrow_mut().cdone = cdone;
    }

    /// Fail every bus operation after the first `n` succeed.
    pub fn fail_after(&self, n: usize) {
        self.state.borrow_mut().fail_after = Some(n);
    }

    /// Fail any transaction starting with `opcode`.
    pub fn fail_on(&self, opcode: u8) {
        self.state.borrow_mut().fail_on = Some(opcode);
    }

    pub fn load(&self, addr: usize, data: &[u8]) {
        self.state.borrow_mut().memory[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn memory(&self, addr: usize, len: usize) -> Vec<u8> {
        self.state.borrow().memory[addr..addr + len].to_vec()
    }

    pub fn reset_released(&self) -> bool {
        self.state.borrow().reset_released
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    fn check(&self, opcode: Option<u8>) -> Result<()> {
        let mut s = self.state.borrow_mut();
        s.ops += 1;
        if let Some(n) = s.fail_after {
            if s.ops > n {
                return Err(anyhow!("simulated bus fault").into());
            }
        }
        if opcode.is_some() && opcode == s.fail_on {
            return Err(anyhow!("simulated fault on command {:02X?}", opcode).into());
        }
        Ok(())
    }

    fn opcode(&self, data: &[u8]) -> Option<u8> {
        let s = self.state.borrow();
        match s.current.as_ref().and_then(|c| c.first()) {
            Some(op) => Some(*op),
            None => data.first().copied(),
        }
    }
}

fn address(stream: &[u8]) -> u32 {
    u32::from_be_bytes([0, stream[1], stream[2], stream[3]])
}

impl State {
    fn status(&mut self) -> u8 {
        if let Some(value) = self.status_script.pop_front() {
            return value;
        }
        let busy = self.stuck_busy || self.busy > 0;
        if self.busy > 0 {
            self.busy -= 1;
        }
        self.protect | ((self.wel as u8) << 1) | busy as u8
    }

    fn respond(&mut self, stream: &[u8], pos: usize) -> u8 {
        match stream[0] {
            0x05 => {
                if pos == 1 {
                    self.status_latch = self.status();
                }
                self.status_latch
            },
            0x9F => self.jedec.get(pos - 1).copied().unwrap_or(0xFF),
            0x03 if pos >= 4 => {
                let addr = address(stream) as usize + pos - 4;
                self.memory[addr % SIM_SIZE]
            },
            _ => 0xFF,
        }
    }

    fn execute(&mut self, stream: &[u8]) {
        let wel = self.wel;
        match stream[0] {
            0x06 => { self.wel = true; return; },
            0x04 => { self.wel = false; return; },
            0x01 => if wel && !self.locked {
                self.protect = stream.get(1).copied().unwrap_or(0) & 0xFC;
            },
            0xD8 if stream.len() >= 4 => if wel {
                let base = address(stream) as usize & !0xFFFF;
                for idx in base..base + 0x1_0000 {
                    self.memory[idx % SIM_SIZE] = 0xFF;
                }
            },
            0xC7 => if wel {
                self.memory.iter_mut().for_each(|b| *b = 0xFF);
            },
            0x02 if stream.len() >= 4 => if wel {
                let addr = address(stream) as usize;
                let page = addr & !0xFF;
                for (idx, byte) in stream[4..].iter().enumerate() {
                    let target = page | ((addr + idx) & 0xFF);
                    self.memory[target % SIM_SIZE] &= byte;
                }
            },
            _ => return,
        }
        self.wel = false;
        self.busy = self.busy_polls;
    }
}

impl SpiBus for SimFlash {
    fn select(&mut self) -> Result<()> {
        self.check(None)?;
        let mut s = self.state.borrow_mut();
        s.reset_released = false;
        s.current = Some(Vec::new());
        Ok(())
    }

    fn deselect(&mut self) -> Result<()> {
        self.check(None)?;
        let mut s = self.state.borrow_mut();
        s.reset_released = false;
        let current = s.current.take();
        match current {
            Some(stream) if !stream.is_empty() => {
                s.execute(&stream);
                s.events.push(Event::Command(stream[0]));
                s.transactions.push(stream);
            },
            _ => s.events.push(Event::Deselect),
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check(self.opcode(data))?;
        let mut s = self.state.borrow_mut();
        s.current.get_or_insert_with(Vec::new).extend_from_slice(data);
        Ok(())
    }

    fn transfer(&mut self, data: &mut [u8]) -> Result<()> {
        self.check(self.opcode(data))?;
        let mut s = self.state.borrow_mut();
        let mut stream = s.current.take().unwrap_or_default();
        for byte in data.iter_mut() {
            stream.push(*byte);
            let pos = stream.len() - 1;
            *byte = if pos == 0 { 0xFF } else { s.respond(&stream, pos) };
        }
        s.current = Some(stream);
        Ok(())
    }

    fn clock(&self) -> &dyn Clock {
        &self.clock
    }
}

impl BoardControl for SimFlash {
    fn release_reset(&mut self) -> Result<()> {
        self.check(None)?;
        let mut s = self.state.borrow_mut();
        s.reset_released = true;
        s.current = None;
        s.events.push(Event::ReleaseReset);
        Ok(())
    }

    fn cdone(&mut self) -> Result<bool> {
        self.check(None)?;
        let mut s = self.state.borrow_mut();
        s.events.push(Event::Cdone);
        Ok(s.cdone)
    }

    fn close(self) -> Result<()> {
        self.state.borrow_mut().events.push(Event::Close);
        Ok(())
    }

    fn abort(self) {
        self.state.borrow_mut().events.push(Event::Abort);
    }
}

#[test]
fn test_sim_program_respects_erase_state() {
    let mut sim = SimFlash::new();
    let mut cmd = |bytes: &[u8]| {
        sim.select().unwrap();
        sim.send(bytes).unwrap();
        sim.deselect().unwrap();
    };
    cmd(&[0x02, 0x00, 0x00, 0x00, 0x00]);
    cmd(&[0x06]);
    cmd(&[0x02, 0x00, 0x00, 0x01, 0x0F]);
    assert_eq!(sim.memory(0, 2), vec![0xFF, 0x0F]);
}

/// Warnings logged on the calling thread, for tests that check diagnostics.
///
/// The logger is installed once per test binary; records are kept per thread
/// so tests running in parallel don't see each other's output.
pub mod warnings {
    use std::cell::RefCell;

    thread_local!(static RECORDS: RefCell<Vec<String>> = RefCell::new(Vec::new()));

    struct Capture;

    impl log::Log for Capture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                RECORDS.with(|r| r.borrow_mut().push(record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture;

    /// Start capturing, discarding anything already recorded on this thread.
    pub fn capture() {
        if log::set_logger(&CAPTURE).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
        RECORDS.with(|r| r.borrow_mut().clear());
    }

    pub fn take() -> Vec<String> {
        RECORDS.with(|r| r.borrow_mut().drain(..).collect())
    }
}
