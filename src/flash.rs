//! SPI NOR flash command set, implemented as request/response transactions
//! over an `SpiBus`. Every transaction is bracketed by select and deselect.
//!
//! Opcodes and status register layout follow the Winbond W25Q80/16/32
//! datasheets, which most small SPI flashes on iCE boards are compatible with.

use std::time::Duration;
use num_enum::IntoPrimitive;
use crate::board::{SpiBus, Error as BoardError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Bus error")]
    Bus(#[from] BoardError),
    #[error("Flash still busy after {0:?}.")]
    BusyTimeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Page program size in bytes.
pub const PAGE_SIZE: usize = 256;

/// Block size erased by `block_erase_64k()`.
pub const BLOCK_SIZE: u32 = 0x1_0000;

/// Extended length byte seen when the ID read glitches.
const EXTENDED_LENGTH_INVALID: u8 = 0xFF;

/// Idle time between status polls, and after each explicit status read.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Number of consecutive not-busy polls required by `wait_while_busy()`.
const NOT_BUSY_POLLS: usize = 2;

/// Standard SPI flash command opcodes.
///
/// Only single I/O commands are listed.
#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
enum Command {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatusRegister1 = 0x05,
    ReadStatusRegister2 = 0x35,
    WriteStatusRegister = 0x01,
    PageProgram = 0x02,
    SectorErase = 0x20,
    BlockErase32K = 0x52,
    BlockErase64K = 0xD8,
    ChipErase = 0xC7,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,
    ReadJEDECID = 0x9F,
    ReadData = 0x03,
    FastRead = 0x0B,
    ModeBitReset = 0xFF,
}

/// SPI Flash.
///
/// Owns the bus it talks over; use `bus_mut()` for board-level control
/// between flash transactions and `release()` to get the bus back.
pub struct Flash<B: SpiBus> {
    bus: B,

    /// Decode status reads and dump transferred data at info level.
    verbose: bool,

    /// Upper bound on `wait_while_busy()`. None waits forever.
    busy_timeout: Option<Duration>,
}

impl<B: SpiBus> Flash<B> {
    /// Create a new Flash instance using the given bus.
    pub fn new(bus: B) -> Self {
        Flash { bus, verbose: false, busy_timeout: None }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Return the underlying bus.
    pub fn release(self) -> B {
        self.bus
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Bound the time `wait_while_busy()` will poll before failing.
    ///
    /// By default there is no bound, and a chip which never reports
    /// ready will block forever.
    pub fn set_busy_timeout(&mut self, timeout: Option<Duration>) {
        self.busy_timeout = timeout;
    }

    pub fn busy_timeout(&self) -> Option<Duration> {
        self.busy_timeout
    }

    /// Take the chip out of any continuous-read mode.
    ///
    /// Sends eight 0xFF bytes, which covers chips wanting more clocks
    /// for their mode bit reset than the one or two strictly required.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Sending mode bit reset");
        self.command(&[Command::ModeBitReset.into(); 8])
    }

    /// Release the flash from power-down.
    pub fn power_up(&mut self) -> Result<()> {
        log::debug!("Sending Release Powerdown command");
        self.command(&[Command::ReleasePowerdown.into()])
    }

    /// Power down the flash.
    pub fn power_down(&mut self) -> Result<()> {
        log::debug!("Sending Powerdown command");
        self.command(&[Command::Powerdown.into()])
    }

    /// Read status register 1, reporting the decoded fields if verbose.
    ///
    /// Always idles for a millisecond afterwards so repeated calls
    /// do not hammer the bus.
    pub fn read_status(&mut self) -> Result<Status> {
        let status = self.read_status_register()?;
        if self.verbose {
            for line in status.to_string().lines() {
                log::info!("{}", line);
            }
        }
        self.bus.delay(STATUS_POLL_INTERVAL);
        Ok(status)
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        if self.verbose {
            log::info!("status before enable:");
            self.read_status()?;
            log::info!("write enable..");
        }
        self.command(&[Command::WriteEnable.into()])?;
        if self.verbose {
            log::info!("status after enable:");
            self.read_status()?;
        }
        Ok(())
    }

    /// Clear the whole status register, removing all block protection.
    ///
    /// A write enable must have been issued first. If the register does
    /// not read back as 0x00 afterwards a warning is logged, but this is
    /// not treated as an error. Returns the status read back.
    pub fn disable_protection(&mut self) -> Result<Status> {
        log::info!("disable flash protection...");
        self.command(&[Command::WriteStatusRegister.into(), 0x00])?;
        self.wait_while_busy()?;
        let status = self.read_status_register()?;
        if status.0 != 0x00 {
            log::warn!("failed to disable protection, SR now equal to 0x{:02X} (expected 0x00)",
                       status.0);
        }
        Ok(status)
    }

    /// Erase the 64kB block containing `addr`.
    ///
    /// Does not wait for the erase to complete.
    pub fn block_erase_64k(&mut self, addr: u32) -> Result<()> {
        log::info!("Erase 64kB block at 0x{:06X}..", addr);
        let [a2, a1, a0] = make_address(addr);
        self.command(&[Command::BlockErase64K.into(), a2, a1, a0])
    }

    /// Erase the entire chip.
    ///
    /// Does not wait for the erase to complete.
    pub fn bulk_erase(&mut self) -> Result<()> {
        log::info!("bulk erase..");
        self.command(&[Command::ChipErase.into()])
    }

    /// Program `data` to `addr`.
    ///
    /// The caller must ensure `data` does not cross a page boundary from
    /// `addr`, as the chip would wrap around within the page.
    pub fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if self.verbose {
            log::info!("prog 0x{:06X} +0x{:03X}..", addr, data.len());
        }
        if (addr as usize % PAGE_SIZE) + data.len() > PAGE_SIZE {
            log::warn!("Page program of {} bytes at 0x{:06X} crosses a page boundary",
                       data.len(), addr);
        }
        let [a2, a1, a0] = make_address(addr);
        self.bus.select()?;
        self.bus.send(&[Command::PageProgram.into(), a2, a1, a0])?;
        self.bus.send(data)?;
        self.bus.deselect()?;
        if self.verbose {
            log_hex(data);
        }
        Ok(())
    }

    /// Read `data.len()` bytes starting at `addr` into `data`.
    ///
    /// `data` is zeroed before it is clocked out so stale buffer contents
    /// can never appear as flash contents.
    pub fn read_data(&mut self, addr: u32, data: &mut [u8]) -> Result<()> {
        if self.verbose {
            log::info!("read 0x{:06X} +0x{:03X}..", addr, data.len());
        }
        for byte in data.iter_mut() {
            *byte = 0;
        }
        let [a2, a1, a0] = make_address(addr);
        self.bus.select()?;
        self.bus.send(&[Command::ReadData.into(), a2, a1, a0])?;
        self.bus.transfer(data)?;
        self.bus.deselect()?;
        if self.verbose {
            log_hex(data);
        }
        Ok(())
    }

    /// Wait until the device stops being busy.
    ///
    /// Returns once two consecutive status polls report not-busy, to ride
    /// out a single glitched status read. Polls are spaced by a millisecond.
    /// Without a busy timeout this never returns for a chip stuck busy.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        if self.verbose {
            log::info!("waiting..");
        }
        let start = self.bus.clock().now();
        let mut not_busy = 0;
        loop {
            if self.read_status_register()?.busy() {
                log::trace!("Flash busy");
                not_busy = 0;
            } else {
                not_busy += 1;
                if not_busy >= NOT_BUSY_POLLS {
                    return Ok(());
                }
            }
            if let Some(timeout) = self.busy_timeout {
                let elapsed = self.bus.clock().now() - start;
                if elapsed >= timeout {
                    log::error!("Flash still busy after {:?}", elapsed);
                    return Err(Error::BusyTimeout(elapsed));
                }
            }
            self.bus.delay(STATUS_POLL_INTERVAL);
        }
    }

    /// Read the JEDEC manufacturer and device IDs, and any extended device string.
    ///
    /// An extended length byte of 0xFF is most likely a read glitch, so it is
    /// reported and no extended bytes are read.
    pub fn read_id(&mut self) -> Result<JedecId> {
        log::debug!("Reading flash ID");
        let mut data: [u8; 5] = [Command::ReadJEDECID.into(), 0, 0, 0, 0];
        self.bus.select()?;
        self.bus.transfer(&mut data)?;
        let extended_length = data[4];
        let mut extended = Vec::new();
        if extended_length == EXTENDED_LENGTH_INVALID {
            log::warn!("Extended Device String Length is 0xFF, \
                        this is likely a read error. Ignoring...");
        } else if extended_length != 0 {
            extended.resize(extended_length as usize, 0);
            self.bus.transfer(&mut extended)?;
        }
        self.bus.deselect()?;

        let id = JedecId {
            manufacturer_id: data[1],
            device_id: [data[2], data[3]],
            extended_length,
            extended,
        };
        log::info!("flash ID: {}", id.to_hex());
        Ok(id)
    }

    fn read_status_register(&mut self) -> Result<Status> {
        let mut data: [u8; 2] = [Command::ReadStatusRegister1.into(), 0];
        self.bus.select()?;
        self.bus.transfer(&mut data)?;
        self.bus.deselect()?;
        log::trace!("SR1: 0x{:02X}", data[1]);
        Ok(Status(data[1]))
    }

    /// Send `data` as a complete write-only transaction.
    fn command(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("SPI command: {:02X?}", data);
        self.bus.select()?;
        self.bus.send(data)?;
        self.bus.deselect()?;
        Ok(())
    }
}

/// Generate the 3-byte big-endian address for `addr`.
fn make_address(addr: u32) -> [u8; 3] {
    let bytes = addr.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

fn log_hex(data: &[u8]) {
    for line in data.chunks(32) {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        log::info!("{}", hex.join(" "));
    }
}

/// Protection range encoded in status register bits 2 and 3.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtectionRange {
    Unprotected,
    Partial,
    Reserved,
    All,
}

/// Status Register 1
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Status(pub u8);

impl Status {
    /// Get BUSY bit.
    pub fn busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn write_enable_latch(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get the software protection range from bits 2 and 3.
    pub fn protection(&self) -> ProtectionRange {
        match (self.0 >> 2) & 0b11 {
            0 => ProtectionRange::Unprotected,
            1 => ProtectionRange::Partial,
            2 => ProtectionRange::Reserved,
            _ => ProtectionRange::All,
        }
    }

    /// Get the WP pin state bit; set when ~WP is deasserted.
    pub fn write_protect_deasserted(&self) -> bool {
        self.0 & 0b0001_0000 != 0
    }

    /// Get EPE (erase/program error) bit.
    pub fn erase_program_error(&self) -> bool {
        self.0 & 0b0010_0000 != 0
    }

    /// Get SPM (sequential program mode) bit.
    pub fn sequential_program_mode(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }

    /// Get SPRL (sector protection registers locked) bit.
    pub fn locked(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "SR1: 0x{:02X}", self.0)?;
        writeln!(f, " - SPRL: {}", if self.locked() { "locked" } else { "unlocked" })?;
        writeln!(f, " -  SPM: {}", if self.sequential_program_mode() {
            "Sequential Prog Mode" } else { "Byte/Page Prog Mode" })?;
        writeln!(f, " -  EPE: {}", if self.erase_program_error() {
            "Erase/Prog error" } else { "Erase/Prog success" })?;
        writeln!(f, " -  WPP: {}", if self.write_protect_deasserted() {
            "~WP deasserted" } else { "~WP asserted" })?;
        writeln!(f, " -  SWP: {}", match self.protection() {
            ProtectionRange::Unprotected => "All sectors unprotected",
            ProtectionRange::Partial => "Some sectors protected",
            ProtectionRange::Reserved => "Reserved (xxxx 10xx)",
            ProtectionRange::All => "All sectors protected",
        })?;
        writeln!(f, " -  WEL: {}", if self.write_enable_latch() {
            "Write enabled" } else { "Not write enabled" })?;
        write!(f, " - ~RDY: {}", if self.busy() { "Busy" } else { "Ready" })
    }
}

/// Identification read with the JEDEC ID (0x9F) command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JedecId {
    pub manufacturer_id: u8,
    pub device_id: [u8; 2],

    /// Length byte as read; 0xFF means the extended read was skipped.
    pub extended_length: u8,

    /// Extended device string.
    pub extended: Vec<u8>,
}

impl JedecId {
    /// Look up a manufacturer name from the JEDEC ID.
    ///
    /// Continuation codes are not read, so only bank 1 is considered.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }

    /// True when the extended length byte was read as 0xFF, so the extended
    /// device string was not read.
    pub fn extended_length_invalid(&self) -> bool {
        self.extended_length == EXTENDED_LENGTH_INVALID
    }

    /// All ID bytes as read, formatted as space-separated hex.
    pub fn to_hex(&self) -> String {
        let mut bytes = vec![self.manufacturer_id, self.device_id[0],
                             self.device_id[1], self.extended_length];
        bytes.extend(&self.extended);
        let hex: Vec<String> = bytes.iter().map(|b| format!("0x{:02X}", b)).collect();
        hex.join(" ")
    }
}

impl std::fmt::Display for JedecId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Device 0x{:02X}{:02X}",
               self.manufacturer_id, mfn, self.device_id[0], self.device_id[1])?;
        if !self.extended.is_empty() {
            write!(f, ", Extended {:02X?}", self.extended)?;
        }
        Ok(())
    }
}
