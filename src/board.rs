//! This module maps SPI bus operations onto the iCE board's wiring: the flash
//! chip-select and the FPGA's CRESET_B line are both low-byte GPIOs driven
//! through the MPSSE engine, and CDONE is read back on another.
//!
//! ADBUS4 (GPIOL0) is flash chip select, active low.
//! ADBUS6 (GPIOL2) is CDONE, an input.
//! ADBUS7 (GPIOL3) is CRESET_B, active low.
//!
//! Chip select may only be asserted while CRESET_B holds the FPGA in reset,
//! otherwise the FPGA and the host would both drive the flash bus.

use std::time::Duration;
use thiserror::Error;
use crate::mpsse::{Mpsse, Error as MpsseError};
use crate::probe::Transport;
use crate::clock::Clock;

#[derive(Error, Debug)]
pub enum Error {
    #[error("MPSSE error")]
    Mpsse(#[from] MpsseError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flash chip select, active low.
pub const GPIO_CS_B: u8 = 1 << 4;

/// FPGA configuration done, input.
pub const GPIO_CDONE: u8 = 1 << 6;

/// FPGA reset, active low.
pub const GPIO_CRESET_B: u8 = 1 << 7;

/// Direction mask for the low GPIO byte, held for the whole session.
pub const GPIO_DIRECTION: u8 = 0x93;

/// Compute the low GPIO byte for the given chip-select and reset line levels.
pub fn gpio_value(cs_b: bool, creset_b: bool) -> u8 {
    let mut gpio = 0;
    if cs_b {
        gpio |= GPIO_CS_B;
    }
    if creset_b {
        gpio |= GPIO_CRESET_B;
    }
    gpio
}

/// Trait for a bus which can carry SPI flash transactions.
///
/// Each transaction is bracketed by `select()` and `deselect()`.
pub trait SpiBus {
    /// Assert chip select.
    fn select(&mut self) -> Result<()>;

    /// Deassert chip select.
    fn deselect(&mut self) -> Result<()>;

    /// Clock out all bytes in `data`, discarding anything received.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Clock out all bytes in `data`, replacing them with the received bytes.
    fn transfer(&mut self, data: &mut [u8]) -> Result<()>;

    /// Time source for waits between bus operations.
    fn clock(&self) -> &dyn Clock;

    /// Wait for `duration` using the bus's clock.
    fn delay(&self, duration: Duration) {
        self.clock().sleep(duration);
    }
}

/// Board-level control needed to bring up and tear down a programming session.
pub trait BoardControl: SpiBus {
    /// Release the FPGA reset, also deasserting chip select.
    fn release_reset(&mut self) -> Result<()>;

    /// Read the CDONE line.
    fn cdone(&mut self) -> Result<bool>;

    /// Orderly shutdown of the underlying engine.
    fn close(self) -> Result<()> where Self: Sized;

    /// Best-effort shutdown after a hardware error.
    fn abort(self) where Self: Sized;
}

/// An iCE board attached through an MPSSE engine.
pub struct Board<T: Transport> {
    mpsse: Mpsse<T>,
}

impl<T: Transport> Board<T> {
    /// Open the MPSSE engine on `transport` and wrap it.
    pub fn open(transport: T, slow_clock: bool) -> Result<Board<T>> {
        Ok(Board::new(Mpsse::open(transport, slow_clock)?))
    }

    pub fn new(mpsse: Mpsse<T>) -> Board<T> {
        Board { mpsse }
    }

    /// Access the underlying engine.
    pub fn mpsse(&mut self) -> &mut Mpsse<T> {
        &mut self.mpsse
    }

    /// Drive chip select and CRESET_B in a single GPIO write.
    pub fn set_cs_creset(&mut self, cs_b: bool, creset_b: bool) -> Result<()> {
        log::trace!("Setting CS_B={} CRESET_B={}", cs_b, creset_b);
        Ok(self.mpsse.set_gpio(gpio_value(cs_b, creset_b), GPIO_DIRECTION)?)
    }

    /// Release the FPGA reset; chip select is deasserted too.
    pub fn flash_release_reset(&mut self) -> Result<()> {
        self.set_cs_creset(true, true)
    }

    /// Deassert chip select, keeping the FPGA in reset.
    pub fn flash_chip_deselect(&mut self) -> Result<()> {
        self.set_cs_creset(true, false)
    }

    /// Assert chip select, keeping the FPGA in reset.
    ///
    /// Only call this while the FPGA is already held in reset.
    pub fn flash_chip_select(&mut self) -> Result<()> {
        self.set_cs_creset(false, false)
    }

    /// Deassert chip select, optionally releasing the FPGA reset as well.
    pub fn deselect_with(&mut self, release_reset: bool) -> Result<()> {
        self.set_cs_creset(true, release_reset)
    }

    /// Read the CDONE line.
    pub fn get_cdone(&mut self) -> Result<bool> {
        Ok(self.mpsse.read_gpio_low()? & GPIO_CDONE != 0)
    }
}

impl<T: Transport> SpiBus for Board<T> {
    fn select(&mut self) -> Result<()> {
        self.flash_chip_select()
    }

    fn deselect(&mut self) -> Result<()> {
        self.flash_chip_deselect()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.mpsse.send_bytes(data)?)
    }

    fn transfer(&mut self, data: &mut [u8]) -> Result<()> {
        Ok(self.mpsse.transfer_bytes(data)?)
    }

    fn clock(&self) -> &dyn Clock {
        self.mpsse.clock()
    }
}

impl<T: Transport> BoardControl for Board<T> {
    fn release_reset(&mut self) -> Result<()> {
        self.flash_release_reset()
    }

    fn cdone(&mut self) -> Result<bool> {
        self.get_cdone()
    }

    fn close(self) -> Result<()> {
        Ok(self.mpsse.close()?)
    }

    fn abort(self) {
        self.mpsse.abort();
    }
}
