//! The MPSSE module implements the FTDI Multi-Protocol Synchronous Serial Engine
//! command framing used to clock SPI data and drive GPIO lines, formatting
//! commands into byte streams which are exchanged with the Transport to control
//! the bridge chip.
//!
//! Byte-oriented data commands are framed as an opcode, a zero-based 16-bit
//! little-endian length, and then the payload. Bit-oriented commands carry a
//! zero-based 8-bit length and a single data byte.

use std::time::Duration;
use thiserror::Error;
use num_enum::IntoPrimitive;
use crate::probe::{Transport, BitMode, Error as ProbeError};
use crate::clock::{Clock, StdClock};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error")]
    Probe(#[from] ProbeError),
    #[error("Write error: transport accepted {written} of {expected} bytes.")]
    ShortWrite { written: usize, expected: usize },
    #[error("Internal error: transfer of {0} bytes exceeds a single MPSSE frame.")]
    TransferTooLong(usize),
    #[error("Internal error: bit transfer of {0} bits exceeds 8 bits.")]
    TooManyBits(u8),
    #[error("Engine has already been closed.")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Largest payload that fits the 16-bit zero-based length field.
pub const MAX_FRAME_LEN: usize = 0x1_0000;

/// Fastest latency timer setting, giving 1kHz polling.
const FAST_LATENCY: u8 = 1;

/// Idle wait between polls while waiting for a response byte.
const RECV_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Clock divisor for the full 6MHz SPI clock.
pub const DIVISOR_FULL_RATE: u16 = 0;

/// Clock divisor for the reduced 50kHz SPI clock.
pub const DIVISOR_SLOW: u16 = 119;

/// MPSSE command opcodes.
#[derive(Copy, Clone, Debug, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    SetBitsLow          = 0x80,
    ReadBitsLow         = 0x81,
    SetBitsHigh         = 0x82,
    ReadBitsHigh        = 0x83,
    LoopbackEnable      = 0x84,
    LoopbackDisable     = 0x85,
    SetClockDivisor     = 0x86,
    SendImmediate       = 0x87,
    DisableClockDivide  = 0x8A,
    EnableClockDivide   = 0x8B,
    ClockBits           = 0x8E,
    ClockBytes          = 0x8F,
}

/// Flag bits which combine into a data shifting opcode.
pub mod flags {
    /// Update data out on the negative clock edge.
    pub const DATA_OCN: u8  = 0x01;
    /// Length counts bits rather than bytes.
    pub const DATA_BITS: u8 = 0x02;
    /// Latch data in on the negative clock edge.
    pub const DATA_ICN: u8  = 0x04;
    /// Shift LSB first.
    pub const DATA_LSB: u8  = 0x08;
    /// Shift data out.
    pub const DATA_OUT: u8  = 0x10;
    /// Shift data in.
    pub const DATA_IN: u8   = 0x20;
}

/// Write-only byte transfer, data updated on the negative edge.
pub const OP_SEND_BYTES: u8 = flags::DATA_OUT | flags::DATA_OCN;

/// Full-duplex byte transfer, data updated on the negative edge and read on the positive.
pub const OP_XFER_BYTES: u8 = flags::DATA_IN | flags::DATA_OUT | flags::DATA_OCN;

/// Full-duplex bit transfer.
pub const OP_XFER_BITS: u8 = OP_XFER_BYTES | flags::DATA_BITS;

/// Encode `len` bytes as the zero-based 16-bit little-endian length field.
///
/// Returns None for empty or oversized transfers.
pub fn encode_length(len: usize) -> Option<[u8; 2]> {
    if len == 0 || len > MAX_FRAME_LEN {
        None
    } else {
        Some(((len - 1) as u16).to_le_bytes())
    }
}

/// An open MPSSE session.
///
/// Owns the transport exclusively. The orderly shutdown is `close()`;
/// if the session is dropped without `close()` or `abort()`, the abort
/// path runs instead.
pub struct Mpsse<T: Transport> {
    transport: Option<T>,
    clock: Box<dyn Clock>,
    saved_latency: Option<u8>,
}

impl<T: Transport> Mpsse<T> {
    /// Bring up an MPSSE session on `transport` using the system clock.
    ///
    /// `slow_clock` selects a 50kHz SPI clock instead of 6MHz.
    pub fn open(transport: T, slow_clock: bool) -> Result<Mpsse<T>> {
        Self::open_with_clock(transport, slow_clock, Box::new(StdClock::new()))
    }

    /// Bring up an MPSSE session on `transport` using `clock` for all waits.
    pub fn open_with_clock(transport: T, slow_clock: bool, clock: Box<dyn Clock>)
        -> Result<Mpsse<T>>
    {
        let mut mpsse = Mpsse { transport: Some(transport), clock, saved_latency: None };
        mpsse.init(slow_clock)?;
        Ok(mpsse)
    }

    fn init(&mut self, slow_clock: bool) -> Result<()> {
        log::debug!("Initialising MPSSE, slow_clock={}", slow_clock);
        let transport = self.transport()?;
        transport.reset()?;
        transport.purge()?;
        let latency = transport.latency_timer()?;
        log::trace!("Saved latency timer {}ms", latency);
        transport.set_latency_timer(FAST_LATENCY)?;
        self.saved_latency = Some(latency);

        // Enter MPSSE mode with all pins initially outputs.
        self.transport()?.set_bitmode(0xFF, BitMode::Mpsse)?;

        self.write_all(&[Command::EnableClockDivide.into()])?;
        let divisor = if slow_clock { DIVISOR_SLOW } else { DIVISOR_FULL_RATE };
        self.set_clock_divisor(divisor)?;
        Ok(())
    }

    /// Time source used for all waits in this session.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Select the SPI clock divisor.
    pub fn set_clock_divisor(&mut self, divisor: u16) -> Result<()> {
        log::debug!("Setting clock divisor to {}", divisor);
        let [lo, hi] = divisor.to_le_bytes();
        self.write_all(&[Command::SetClockDivisor.into(), lo, hi])
    }

    fn transport(&mut self) -> Result<&mut T> {
        self.transport.as_mut().ok_or(Error::Closed)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let written = self.transport()?.write(data)?;
        if written != data.len() {
            log::error!("Short write: {} of {} bytes", written, data.len());
            return Err(Error::ShortWrite { written, expected: data.len() });
        }
        Ok(())
    }

    /// Block until one byte is received.
    fn recv_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        loop {
            if self.transport()?.read(&mut buf)? == 1 {
                return Ok(buf[0]);
            }
            self.clock.sleep(RECV_POLL_INTERVAL);
        }
    }

    fn frame(&mut self, opcode: u8, len: usize) -> Result<bool> {
        match encode_length(len) {
            Some([lo, hi]) => {
                self.write_all(&[opcode, lo, hi])?;
                Ok(true)
            },
            None if len == 0 => Ok(false),
            None => {
                log::error!("Attempted MPSSE transfer of {} bytes, maximum is {}",
                            len, MAX_FRAME_LEN);
                Err(Error::TransferTooLong(len))
            },
        }
    }

    /// Clock out `data` without reading anything back.
    ///
    /// Empty `data` performs no I/O.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.frame(OP_SEND_BYTES, data.len())? {
            self.write_all(data)?;
        }
        Ok(())
    }

    /// Clock out `data` while reading back the same number of bytes into `data`.
    ///
    /// Empty `data` performs no I/O.
    pub fn transfer_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        if self.frame(OP_XFER_BYTES, data.len())? {
            self.write_all(data)?;
            for byte in data.iter_mut() {
                *byte = self.recv_byte()?;
            }
        }
        Ok(())
    }

    /// Clock `bits` bits of `data` out while reading the same number back.
    ///
    /// The returned byte holds the received bits as shifted in by the engine.
    pub fn transfer_bits(&mut self, data: u8, bits: u8) -> Result<u8> {
        match bits {
            0 => Ok(0),
            1..=8 => {
                self.write_all(&[OP_XFER_BITS, bits - 1, data])?;
                self.recv_byte()
            },
            _ => Err(Error::TooManyBits(bits)),
        }
    }

    /// Emit `count` bytes worth of clocks with no data.
    pub fn clock_bytes(&mut self, count: usize) -> Result<()> {
        self.frame(Command::ClockBytes.into(), count)?;
        Ok(())
    }

    /// Emit a single clock with no data.
    pub fn clock_bit(&mut self) -> Result<()> {
        self.write_all(&[Command::ClockBits.into(), 0x00])
    }

    /// Set the low GPIO byte value and direction mask.
    pub fn set_gpio(&mut self, value: u8, direction: u8) -> Result<()> {
        log::trace!("Setting GPIO low byte to 0x{:02X}, direction 0x{:02X}", value, direction);
        self.write_all(&[Command::SetBitsLow.into(), value, direction])
    }

    /// Read the low GPIO byte.
    pub fn read_gpio_low(&mut self) -> Result<u8> {
        self.write_all(&[Command::ReadBitsLow.into()])?;
        self.recv_byte()
    }

    /// Read the high GPIO byte.
    pub fn read_gpio_high(&mut self) -> Result<u8> {
        self.write_all(&[Command::ReadBitsHigh.into()])?;
        self.recv_byte()
    }

    /// Orderly teardown: restore the latency timer, leave MPSSE mode,
    /// and release the transport.
    ///
    /// The board must already be in a safe state (flash powered down,
    /// reset released) as no further GPIO writes are made.
    pub fn close(mut self) -> Result<()> {
        log::debug!("Closing MPSSE session");
        let mut transport = self.transport.take().ok_or(Error::Closed)?;
        if let Some(latency) = self.saved_latency.take() {
            transport.set_latency_timer(latency)?;
        }
        transport.set_bitmode(0x00, BitMode::Reset)?;
        transport.close()?;
        Ok(())
    }

    /// Emergency teardown after a hardware error.
    ///
    /// Drains and logs any unexpected pending bytes, restores the latency
    /// timer if it was changed, and releases the transport. All failures
    /// are ignored.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let mut buf = [0u8; 1];
            while let Ok(1) = transport.read(&mut buf) {
                log::error!("Unexpected RX byte: 0x{:02X}", buf[0]);
            }
            log::error!("ABORT.");
            if let Some(latency) = self.saved_latency.take() {
                transport.set_latency_timer(latency).ok();
            }
            transport.close().ok();
        }
    }
}

impl<T: Transport> std::ops::Drop for Mpsse<T> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            log::debug!("MPSSE dropped while open, aborting");
            self.abort_inner();
        }
    }
}
