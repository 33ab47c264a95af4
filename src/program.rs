//! Programming session: board bring-up, erase, paged write, verify,
//! read-back and teardown, sequenced over the flash command layer.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use crate::board::{BoardControl, Error as BoardError};
use crate::flash::{Flash, JedecId, Error as FlashError, PAGE_SIZE, BLOCK_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Flash error")]
    Flash(#[from] FlashError),
    #[error("Board error")]
    Board(#[from] BoardError),
    #[error("Error {context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Range 0x{offset:06X}+0x{size:X} exceeds the 24-bit flash address space")]
    InvalidAddress { offset: u32, size: u64 },
    #[error("Found difference between flash and file in {len} bytes at 0x{address:06X}")]
    Verify { address: u32, len: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors after which bus traffic can no longer be trusted.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Error::Flash(_) | Error::Board(_) | Error::Other(_))
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io { .. } | Error::InvalidAddress { .. } => 1,
            Error::Verify { .. } => 3,
            _ => 2,
        }
    }
}

/// One past the highest flash address reachable with 3 address bytes.
pub const ADDRESS_SPACE: u64 = 1 << 24;

const RESET_SETTLE: Duration = Duration::from_millis(100);
const DESELECT_SETTLE: Duration = Duration::from_millis(250);
const RELEASE_SETTLE: Duration = Duration::from_millis(250);

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const ERASE_PROGRESS_TPL: &str = " {msg} [{bar:40}] {pos}/{len} blocks ({elapsed})";
const DATA_PROGRESS_CHARS: &str = "=> ";

/// Range of 64kB blocks covering [offset, offset+size), rounded outwards.
///
/// Both ends saturate at the top of the 24-bit address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErasePlan {
    pub begin: u32,
    pub end: u32,
}

impl ErasePlan {
    pub fn new(offset: u32, size: u32) -> Self {
        let mask = !(BLOCK_SIZE as u64 - 1);
        let begin = (offset as u64 & mask).min(ADDRESS_SPACE);
        let end = ((offset as u64 + size as u64 + BLOCK_SIZE as u64 - 1) & mask)
            .min(ADDRESS_SPACE);
        log::debug!("Erase plan for 0x{:06X}+0x{:X}: [0x{:06X}, 0x{:06X})",
                    offset, size, begin, end);
        ErasePlan { begin: begin as u32, end: end as u32 }
    }

    /// Base address of each block to erase, in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u32> {
        (self.begin..self.end).step_by(BLOCK_SIZE as usize)
    }

    pub fn num_blocks(&self) -> usize {
        ((self.end - self.begin) / BLOCK_SIZE) as usize
    }
}

/// Tracks where the next page program goes so that, after a first partial
/// chunk, all programs are page-aligned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageWindow {
    address: u32,
}

impl PageWindow {
    pub fn new(offset: u32) -> Self {
        PageWindow { address: offset }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Largest chunk which can be programmed at the current address
    /// without crossing a page boundary.
    pub fn chunk_len(&self) -> usize {
        PAGE_SIZE - (self.address as usize % PAGE_SIZE)
    }

    pub fn advance(&mut self, n: usize) {
        self.address += n as u32;
    }
}

/// How to erase ahead of programming.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EraseMode {
    /// Erase the entire chip.
    Bulk,
    /// Erase only the 64kB blocks covering the data.
    Range,
    /// Do not erase.
    Skip,
}

/// Session lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Init,
    BroughtUp,
    ProtectionDisabled,
    Erased,
    Written,
    Verified,
    PoweredDown,
}

/// A programming session owning the board for its whole lifetime.
///
/// Use `run()` to bring the board up, perform a job, and tear it down
/// with the appropriate discipline for how the job ended.
pub struct Session<B: BoardControl> {
    flash: Flash<B>,
    state: State,
    progress: bool,
    id: Option<JedecId>,
}

impl<B: BoardControl> Session<B> {
    pub fn new(board: B) -> Self {
        Session { flash: Flash::new(board), state: State::Init, progress: false, id: None }
    }

    /// Draw progress bars on the terminal during long operations.
    pub fn set_progress(&mut self, progress: bool) {
        self.progress = progress;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.flash.set_verbose(verbose);
    }

    pub fn set_busy_timeout(&mut self, timeout: Option<Duration>) {
        self.flash.set_busy_timeout(timeout);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn flash(&mut self) -> &mut Flash<B> {
        &mut self.flash
    }

    /// Bring up the session, run `job`, then tear down.
    ///
    /// If anything fails with a hardware error, the board is aborted
    /// without any further flash traffic. Otherwise the flash is powered
    /// down, the FPGA released from reset and the board closed, even when
    /// `job` failed with a user or verification error.
    pub fn run<T, F>(mut self, job: F) -> Result<T>
        where F: FnOnce(&mut Session<B>) -> Result<T>
    {
        let outcome = self.bring_up().and_then(|_| job(&mut self));
        if let Err(e) = &outcome {
            if e.is_hardware() {
                log::error!("{}, aborting session", e);
                self.abort();
                return outcome;
            }
        }

        if let Err(e) = self.teardown() {
            log::error!("Error during teardown: {}", e);
            self.abort();
            return match outcome {
                Err(orig) => Err(orig),
                Ok(_) => Err(e),
            };
        }

        self.close()?;
        outcome
    }

    /// Take the FPGA out of the flash's way and identify the flash.
    pub fn bring_up(&mut self) -> Result<JedecId> {
        log::info!("init..");
        self.log_cdone()?;

        log::info!("reset..");
        let bus = self.flash.bus_mut();
        bus.release_reset()?;
        bus.delay(RESET_SETTLE);
        bus.deselect()?;
        bus.delay(DESELECT_SETTLE);
        self.log_cdone()?;

        self.flash.reset()?;
        self.flash.power_up()?;
        let id = self.flash.read_id()?;
        log::info!("Flash: {}", id);
        self.id = Some(id.clone());
        self.state = State::BroughtUp;
        Ok(id)
    }

    /// Flash ID read during bring-up, if bring-up has happened.
    pub fn id(&self) -> Option<&JedecId> {
        self.id.as_ref()
    }

    /// Clear the flash status register, removing block protection.
    pub fn disable_protection(&mut self) -> Result<()> {
        self.flash.write_enable()?;
        self.flash.disable_protection()?;
        self.state = State::ProtectionDisabled;
        Ok(())
    }

    /// Erase the whole chip and wait for it to finish.
    pub fn bulk_erase(&mut self) -> Result<()> {
        log::info!("erase flash..");
        let pb = self.spinner("Erasing");
        self.flash.write_enable()?;
        self.flash.bulk_erase()?;
        self.flash.wait_while_busy()?;
        pb.finish();
        self.state = State::Erased;
        Ok(())
    }

    /// Erase every 64kB block touched by [offset, offset+size).
    pub fn erase(&mut self, offset: u32, size: u32) -> Result<()> {
        check_range(offset, size as u64)?;
        let plan = ErasePlan::new(offset, size);
        log::info!("erase flash..");
        let pb = self.progress_bar(plan.num_blocks() as u64, ERASE_PROGRESS_TPL, "Erasing");
        for addr in plan.blocks() {
            self.flash.write_enable()?;
            self.flash.block_erase_64k(addr)?;
            if self.flash.verbose() {
                log::info!("status after block erase:");
                self.flash.read_status()?;
            }
            self.flash.wait_while_busy()?;
            pb.inc(1);
        }
        pb.finish();
        self.state = State::Erased;
        Ok(())
    }

    /// Erase as requested, write `source` at `offset`, and optionally verify it.
    pub fn program<R: Read + Seek>(&mut self, source: &mut R, offset: u32,
                                   erase: EraseMode, verify: bool) -> Result<()>
    {
        let len = source_len(source)?;
        check_range(offset, len)?;
        match erase {
            EraseMode::Bulk => self.bulk_erase()?,
            EraseMode::Range => self.erase(offset, len as u32)?,
            EraseMode::Skip => log::debug!("Skipping erase"),
        }
        self.write(source, offset)?;
        if verify {
            self.verify(source, offset)?;
        }
        Ok(())
    }

    /// Program the contents of `source` starting at `offset`.
    ///
    /// The flash must already be erased.
    pub fn write<R: Read + Seek>(&mut self, source: &mut R, offset: u32) -> Result<()> {
        let len = source_len(source)?;
        check_range(offset, len)?;
        log::info!("programming..");
        let pb = self.progress_bar(len, DATA_PROGRESS_TPL, "Writing");

        let mut window = PageWindow::new(offset);
        let mut buf = [0u8; PAGE_SIZE];
        loop {
            let chunk = &mut buf[..window.chunk_len()];
            let n = read_fully(source, chunk).map_err(io_error("reading input file"))?;
            if n == 0 {
                break;
            }
            self.flash.write_enable()?;
            self.flash.page_program(window.address(), &chunk[..n])?;
            self.flash.wait_while_busy()?;
            window.advance(n);
            pb.set_position((window.address() - offset) as u64);
        }

        pb.finish();
        self.state = State::Written;
        Ok(())
    }

    /// Compare the flash contents at `offset` against `source`.
    ///
    /// Stops at the first 256-byte chunk which differs.
    pub fn verify<R: Read + Seek>(&mut self, source: &mut R, offset: u32) -> Result<()> {
        let len = source_len(source)?;
        check_range(offset, len)?;
        log::info!("reading..");
        let pb = self.progress_bar(len, DATA_PROGRESS_TPL, "Verifying");

        let mut file_buf = [0u8; PAGE_SIZE];
        let mut flash_buf = [0u8; PAGE_SIZE];
        let mut addr = 0;
        loop {
            let n = read_fully(source, &mut file_buf).map_err(io_error("reading input file"))?;
            if n == 0 {
                break;
            }
            let address = offset + addr;
            self.flash.read_data(address, &mut flash_buf[..n])?;
            if file_buf[..n] != flash_buf[..n] {
                pb.abandon();
                log::error!("Found difference between flash and file!");
                return Err(Error::Verify { address, len: n });
            }
            addr += n as u32;
            pb.set_position(addr as u64);
        }

        pb.finish();
        log::info!("VERIFY OK");
        self.state = State::Verified;
        Ok(())
    }

    /// Read `size` bytes from `offset` into `sink`.
    pub fn read<W: Write>(&mut self, sink: &mut W, offset: u32, size: u32) -> Result<()> {
        check_range(offset, size as u64)?;
        log::info!("reading..");
        let pb = self.progress_bar(size as u64, DATA_PROGRESS_TPL, "Reading");

        let mut buf = [0u8; PAGE_SIZE];
        for addr in (0..size).step_by(PAGE_SIZE) {
            let n = usize::min(PAGE_SIZE, (size - addr) as usize);
            self.flash.read_data(offset + addr, &mut buf[..n])?;
            sink.write_all(&buf[..n]).map_err(io_error("writing output file"))?;
            pb.set_position((addr as usize + n) as u64);
        }
        sink.flush().map_err(io_error("writing output file"))?;

        pb.finish();
        Ok(())
    }

    /// Power down the flash and hand the bus back to the FPGA.
    pub fn teardown(&mut self) -> Result<()> {
        self.flash.power_down()?;
        log::info!("Bye.");
        let bus = self.flash.bus_mut();
        bus.release_reset()?;
        bus.delay(RELEASE_SETTLE);
        self.log_cdone()?;
        self.state = State::PoweredDown;
        Ok(())
    }

    /// Orderly close of the underlying board.
    pub fn close(self) -> Result<()> {
        log::debug!("Closing session in state {:?}", self.state);
        Ok(self.flash.release().close()?)
    }

    /// Emergency release of the underlying board, without further flash traffic.
    pub fn abort(self) {
        log::debug!("Aborting session in state {:?}", self.state);
        self.flash.release().abort();
    }

    fn log_cdone(&mut self) -> Result<()> {
        let cdone = self.flash.bus_mut().cdone()?;
        log::info!("cdone: {}", if cdone { "high" } else { "low" });
        Ok(())
    }

    fn progress_bar(&self, len: u64, template: &str, msg: &'static str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(DATA_PROGRESS_CHARS);
        let pb = ProgressBar::new(len).with_style(style);
        pb.set_message(msg);
        pb
    }

    fn spinner(&self, msg: &'static str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(msg);
        pb
    }
}

/// Fail with a user error if [offset, offset+size) leaves the 24-bit address space.
fn check_range(offset: u32, size: u64) -> Result<()> {
    if offset as u64 + size > ADDRESS_SPACE {
        log::error!("Operation would exceed largest address");
        Err(Error::InvalidAddress { offset, size })
    } else {
        Ok(())
    }
}

/// Find the length of `source` and rewind it.
fn source_len<R: Seek>(source: &mut R) -> Result<u64> {
    let len = source.seek(SeekFrom::End(0)).map_err(io_error("seeking input file"))?;
    source.seek(SeekFrom::Start(0)).map_err(io_error("seeking input file"))?;
    Ok(len)
}

/// Read until `buf` is full or the source is exhausted, returning the count read.
fn read_fully<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn io_error(context: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Io { context, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use crate::sim::{SimFlash, Event};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    #[test]
    fn test_erase_plan_bounds() {
        for &offset in &[0, 1, 10, 0xFFFF, 0x1_0000, 0x1_0001, 0x12_3456, 0xFF_FFFF] {
            for &size in &[0, 1, 255, 300, 0x1_0000, 0x2_0001] {
                let plan = ErasePlan::new(offset, size);
                assert_eq!(plan.begin % BLOCK_SIZE, 0);
                assert_eq!(plan.end % BLOCK_SIZE, 0);
                assert!(plan.begin <= offset);
                assert!(plan.end as u64 <= ADDRESS_SPACE);
                let wanted = offset as u64 + size as u64;
                assert!(plan.end as u64 >= wanted.min(ADDRESS_SPACE));
            }
        }
    }

    #[test]
    fn test_erase_plan_saturates() {
        let plan = ErasePlan::new(0xFF_FFFF, 0x2_0001);
        assert_eq!(plan, ErasePlan { begin: 0xFF_0000, end: 0x100_0000 });
        assert_eq!(plan.num_blocks(), 1);

        let plan = ErasePlan::new(u32::MAX, u32::MAX);
        assert_eq!(plan, ErasePlan { begin: 0x100_0000, end: 0x100_0000 });
        assert_eq!(plan.num_blocks(), 0);
        assert_eq!(plan.blocks().count(), 0);

        let plan = ErasePlan::new(0x10_0000, u32::MAX);
        assert_eq!(plan.end, 0x100_0000);
        assert_eq!(plan.num_blocks(), 0xF0);
    }

    #[test]
    fn test_erase_plan_blocks() {
        assert_eq!(ErasePlan::new(0, 300), ErasePlan { begin: 0, end: 0x1_0000 });
        let plan = ErasePlan::new(0xFFFF, 2);
        assert_eq!(plan, ErasePlan { begin: 0, end: 0x2_0000 });
        assert_eq!(plan.blocks().collect::<Vec<_>>(), vec![0, 0x1_0000]);
        assert_eq!(plan.num_blocks(), 2);
        assert_eq!(ErasePlan::new(0x1_0000, 0x1_0000).blocks().collect::<Vec<_>>(),
                   vec![0x1_0000]);
    }

    #[test]
    fn test_page_window() {
        for &offset in &[0u32, 1, 10, 255, 256, 0x1234] {
            let mut window = PageWindow::new(offset);
            assert_eq!(window.chunk_len(), 256 - (offset as usize % 256));
            let first = window.chunk_len();
            window.advance(first);
            for _ in 0..4 {
                assert_eq!(window.address() % 256, 0);
                assert_eq!(window.chunk_len(), 256);
                window.advance(256);
            }
        }
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, ADDRESS_SPACE).is_ok());
        assert!(check_range(0xFF_FF00, 0x100).is_ok());
        assert!(matches!(check_range(0xFF_FF00, 0x101),
                         Err(Error::InvalidAddress { offset: 0xFF_FF00, size: 0x101 })));
    }

    #[test]
    fn test_exit_codes() {
        let io = Error::Io { context: "reading", source: io::ErrorKind::NotFound.into() };
        assert_eq!(io.exit_code(), 1);
        assert!(!io.is_hardware());
        assert_eq!(Error::InvalidAddress { offset: 0, size: 0 }.exit_code(), 1);
        let verify = Error::Verify { address: 0, len: 1 };
        assert_eq!(verify.exit_code(), 3);
        assert!(!verify.is_hardware());
        let hw = Error::Flash(FlashError::BusyTimeout(Duration::from_secs(1)));
        assert_eq!(hw.exit_code(), 2);
        assert!(hw.is_hardware());
    }

    #[test]
    fn test_bring_up_and_teardown() {
        let sim = SimFlash::new();
        Session::new(sim.clone()).run(|s| {
            assert_eq!(s.state(), State::BroughtUp);
            Ok(())
        }).unwrap();
        assert_eq!(sim.events(), vec![
            Event::Cdone,
            Event::ReleaseReset,
            Event::Deselect,
            Event::Cdone,
            Event::Command(0xFF),
            Event::Command(0xAB),
            Event::Command(0x9F),
            Event::Command(0xB9),
            Event::ReleaseReset,
            Event::Cdone,
            Event::Close,
        ]);
        assert!(sim.reset_released());
        assert_eq!(sim.elapsed(), Duration::from_millis(600));
    }

    #[test]
    fn test_write_300_bytes() {
        let sim = SimFlash::new();
        let data = pattern(300);
        let mut source = Cursor::new(data.clone());
        Session::new(sim.clone())
            .run(|s| s.program(&mut source, 0, EraseMode::Range, true))
            .unwrap();
        assert_eq!(sim.erases(), vec![0]);
        assert_eq!(sim.programs(), vec![(0, 256), (0x100, 44)]);
        assert_eq!(sim.reads(), vec![(0, 256), (0x100, 44)]);
        assert_eq!(sim.memory(0, 300), data);
        assert_eq!(sim.events().last(), Some(&Event::Close));
    }

    #[test]
    fn test_write_unaligned_offset() {
        let sim = SimFlash::new();
        sim.set_busy_polls(3);
        let data = pattern(600);
        let mut source = Cursor::new(data.clone());
        Session::new(sim.clone())
            .run(|s| s.program(&mut source, 10, EraseMode::Range, true))
            .unwrap();
        assert_eq!(sim.programs(), vec![(10, 246), (256, 256), (512, 98)]);
        assert_eq!(sim.reads(), vec![(10, 256), (266, 256), (522, 88)]);
        assert_eq!(sim.memory(10, 600), data);
    }

    #[test]
    fn test_write_each_program_is_enabled_and_awaited() {
        let sim = SimFlash::new();
        let mut source = Cursor::new(pattern(300));
        let mut session = Session::new(sim.clone());
        sim.clear_log();
        session.write(&mut source, 0).unwrap();
        let ops: Vec<u8> = sim.transactions().iter().map(|t| t[0]).collect();
        assert_eq!(ops, vec![0x06, 0x02, 0x05, 0x05, 0x06, 0x02, 0x05, 0x05]);
        assert_eq!(session.state(), State::Written);
    }

    #[test]
    fn test_erase_status_reads() {
        let sim = SimFlash::new();
        let mut session = Session::new(sim.clone());
        sim.clear_log();
        session.erase(0, 1).unwrap();
        let ops: Vec<u8> = sim.transactions().iter().map(|t| t[0]).collect();
        assert_eq!(ops, vec![0x06, 0xD8, 0x05, 0x05]);

        session.set_verbose(true);
        sim.clear_log();
        session.erase(0x1_0000, 1).unwrap();
        let ops: Vec<u8> = sim.transactions().iter().map(|t| t[0]).collect();
        assert_eq!(ops, vec![0x05, 0x06, 0x05, 0xD8, 0x05, 0x05, 0x05]);
        assert_eq!(sim.erases(), vec![0x1_0000]);
    }

    #[test]
    fn test_id_kept_from_bring_up() {
        let sim = SimFlash::new();
        sim.set_jedec(&[0xEF, 0x40, 0x16, 0x00]);
        let id = Session::new(sim.clone()).run(|s| Ok(s.id().cloned())).unwrap().unwrap();
        assert_eq!(id.manufacturer_id, 0xEF);
        assert_eq!(id.device_id, [0x40, 0x16]);
        let id_reads = sim.transactions().iter().filter(|t| t[0] == 0x9F).count();
        assert_eq!(id_reads, 1);
        assert!(Session::new(SimFlash::new()).id().is_none());
    }

    #[test]
    fn test_bulk_erase() {
        let sim = SimFlash::new();
        sim.load(0x8_0000, &[0x00; 16]);
        let mut source = Cursor::new(pattern(16));
        Session::new(sim.clone())
            .run(|s| s.program(&mut source, 0, EraseMode::Bulk, false))
            .unwrap();
        assert!(sim.erases().is_empty());
        assert!(sim.events().contains(&Event::Command(0xC7)));
        assert_eq!(sim.memory(0x8_0000, 16), vec![0xFF; 16]);
        assert!(sim.reads().is_empty());
    }

    #[test]
    fn test_skip_erase() {
        let sim = SimFlash::new();
        let mut source = Cursor::new(pattern(16));
        Session::new(sim.clone())
            .run(|s| s.program(&mut source, 0, EraseMode::Skip, false))
            .unwrap();
        assert!(sim.erases().is_empty());
        assert!(!sim.events().contains(&Event::Command(0xC7)));
        assert_eq!(sim.programs(), vec![(0, 16)]);
    }

    #[test]
    fn test_verify_mismatch_stops_at_chunk() {
        let sim = SimFlash::new();
        let data = pattern(1024);
        let mut source = Cursor::new(data.clone());
        let result = Session::new(sim.clone()).run(|s| {
            s.program(&mut source, 0, EraseMode::Range, false)?;
            sim.load(600, &[!data[600]]);
            s.verify(&mut source, 0)
        });
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Verify { address: 512, len: 256 }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(sim.reads(), vec![(0, 256), (256, 256), (512, 256)]);
        // Verification failures still shut down in order.
        let events = sim.events();
        assert!(events.contains(&Event::Command(0xB9)));
        assert_eq!(events.last(), Some(&Event::Close));
    }

    #[test]
    fn test_verify_identical() {
        let sim = SimFlash::new();
        let data = pattern(700);
        sim.load(0x2000, &data);
        let mut session = Session::new(sim.clone());
        session.verify(&mut Cursor::new(data), 0x2000).unwrap();
        assert_eq!(session.state(), State::Verified);
        assert_eq!(sim.reads(), vec![(0x2000, 256), (0x2100, 256), (0x2200, 188)]);
    }

    #[test]
    fn test_read() {
        let sim = SimFlash::new();
        let data = pattern(600);
        sim.load(0x1000, &data);
        let mut sink = Vec::new();
        Session::new(sim.clone()).run(|s| s.read(&mut sink, 0x1000, 600)).unwrap();
        assert_eq!(sink, data);
        assert_eq!(sim.reads(), vec![(0x1000, 256), (0x1100, 256), (0x1200, 88)]);
    }

    #[test]
    fn test_disable_protection() {
        let sim = SimFlash::new();
        sim.set_status_protect(0b0001_1100);
        let mut session = Session::new(sim.clone());
        session.disable_protection().unwrap();
        assert_eq!(&sim.transactions()[..2], &[vec![0x06], vec![0x01, 0x00]]);
        assert_eq!(session.flash().read_status().unwrap().0, 0x00);
        assert_eq!(session.state(), State::ProtectionDisabled);
    }

    #[test]
    fn test_hardware_error_aborts() {
        let sim = SimFlash::new();
        sim.fail_on(0xD8);
        let mut source = Cursor::new(pattern(300));
        let err = Session::new(sim.clone())
            .run(|s| s.program(&mut source, 0, EraseMode::Range, true))
            .unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(err.exit_code(), 2);
        let events = sim.events();
        assert_eq!(events.last(), Some(&Event::Abort));
        assert!(!events.contains(&Event::Close));
        assert!(!events.contains(&Event::Command(0xB9)));
        assert!(sim.programs().is_empty());
    }

    #[test]
    fn test_bring_up_failure_aborts() {
        let sim = SimFlash::new();
        sim.fail_after(2);
        let err = Session::new(sim.clone()).run(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Board(_)));
        assert_eq!(sim.events(), vec![Event::Cdone, Event::ReleaseReset, Event::Abort]);
    }

    #[test]
    fn test_invalid_address_closes_without_traffic() {
        let sim = SimFlash::new();
        let mut source = Cursor::new(pattern(512));
        let err = Session::new(sim.clone())
            .run(|s| s.program(&mut source, 0xFF_FF00, EraseMode::Range, true))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { offset: 0xFF_FF00, size: 512 }));
        assert_eq!(err.exit_code(), 1);
        assert!(sim.erases().is_empty());
        assert!(sim.programs().is_empty());
        assert_eq!(sim.events().last(), Some(&Event::Close));
    }

    struct BrokenSource;

    impl Read for BrokenSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "broken"))
        }
    }

    impl Seek for BrokenSource {
        fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
            Ok(16)
        }
    }

    #[test]
    fn test_source_error_is_user_error() {
        let sim = SimFlash::new();
        let err = Session::new(sim.clone())
            .run(|s| s.write(&mut BrokenSource, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Io { context: "reading input file", .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(sim.events().last(), Some(&Event::Close));
    }
}
