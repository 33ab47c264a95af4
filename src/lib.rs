// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! iceprog
//!
//! SPI flash programming for iCE FPGA boards using FTDI MPSSE adapters.

pub mod clock;
pub mod probe;
pub mod mpsse;
pub mod board;
pub mod flash;
pub mod program;

#[cfg(test)]
mod sim;

pub use board::{Board, BoardControl, SpiBus};
pub use flash::{Flash, JedecId, Status};
pub use program::{Session, EraseMode, ErasePlan, PageWindow};
