//! This is the lowest-level module. It is responsible for scanning the USB bus
//! to find an FTDI MPSSE adapter, configuring it with the FTDI vendor requests,
//! and reading and writing raw bytes to the selected interface's bulk endpoints.
//!
//! The rest of the crate only sees the `Transport` trait, so any other byte
//! pipe to an MPSSE engine can be substituted.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use num_enum::IntoPrimitive;
use rusb::{Device, Context, UsbContext};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid specifier, use VID:PID or VID:PID:Serial.")]
    InvalidSpecifier,
    #[error("invalid interface, use A, B, C, or D.")]
    InvalidInterface,
    #[error("specified FTDI device not found.")]
    NotFound,
    #[error("no FTDI devices found (looked for 0403:6010 and 0403:6014).")]
    NoDevicesFound,
    #[error("unexpected response length {0} to control request.")]
    InvalidResponse(usize),
    #[error("USB error")]
    USB(#[from] rusb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bit modes accepted by `Transport::set_bitmode`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum BitMode {
    Reset   = 0x00,
    Mpsse   = 0x02,
}

/// Raw byte-oriented access to an MPSSE-capable USB bridge.
pub trait Transport {
    /// Reset the device's serial engine.
    fn reset(&mut self) -> Result<()>;

    /// Discard anything pending in the device's RX and TX buffers.
    fn purge(&mut self) -> Result<()>;

    /// Read the current latency timer in milliseconds.
    fn latency_timer(&mut self) -> Result<u8>;

    /// Set the latency timer in milliseconds.
    fn set_latency_timer(&mut self, latency: u8) -> Result<()>;

    /// Set the bit mode, with `mask` selecting which pins are outputs.
    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()>;

    /// Write `data`, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    ///
    /// Returns 0 if no data arrived before the transport's poll interval elapsed.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Release the underlying device.
    fn close(&mut self) -> Result<()>;
}

/// Channel of a multi-channel FTDI device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interface {
    A,
    B,
    C,
    D,
}

impl Interface {
    /// USB interface number.
    fn number(&self) -> u8 {
        match self {
            Interface::A => 0,
            Interface::B => 1,
            Interface::C => 2,
            Interface::D => 3,
        }
    }

    /// Index used in the `wIndex` field of vendor control requests.
    fn index(&self) -> u16 {
        self.number() as u16 + 1
    }

    fn out_ep(&self) -> u8 {
        0x02 + 2 * self.number()
    }

    fn in_ep(&self) -> u8 {
        0x81 + 2 * self.number()
    }
}

impl std::str::FromStr for Interface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A" | "a" | "0" => Ok(Interface::A),
            "B" | "b" | "1" => Ok(Interface::B),
            "C" | "c" | "2" => Ok(Interface::C),
            "D" | "d" | "3" => Ok(Interface::D),
            _ => Err(Error::InvalidInterface),
        }
    }
}

/// FTDI vendor request codes.
#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum Request {
    Reset               = 0x00,
    SetLatencyTimer     = 0x09,
    GetLatencyTimer     = 0x0A,
    SetBitMode          = 0x0B,
}

/// `wValue` arguments to the Reset request.
#[derive(Copy, Clone, IntoPrimitive)]
#[repr(u16)]
enum ResetType {
    Sio                 = 0,
    PurgeRx             = 1,
    PurgeTx             = 2,
}

/// Known FTDI MPSSE devices: FT2232H and FT232H.
const KNOWN_IDS: &[(u16, u16)] = &[(0x0403, 0x6010), (0x0403, 0x6014)];

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Length of the modem status header at the start of each IN packet.
const STATUS_BYTES: usize = 2;

/// Handle to an open FTDI interface.
pub struct FtdiDevice {
    handle: rusb::DeviceHandle<Context>,
    interface: Interface,
    max_packet_size: usize,
    rx: VecDeque<u8>,
    claimed: bool,
}

impl FtdiDevice {
    /// Attempt to open `interface` of any known FTDI MPSSE device.
    ///
    /// Fails if none is detected; the first matching device is used
    /// if several are connected.
    pub fn new(interface: Interface) -> Result<FtdiDevice> {
        log::debug!("Attempting to open any connected FTDI device");
        let devices = DeviceInfo::list();
        let first = KNOWN_IDS.iter()
            .find_map(|&(vid, pid)| devices.iter().find(|d| d.vid == vid && d.pid == pid));
        match first {
            Some(info) => info.open(interface),
            None => Err(Error::NoDevicesFound),
        }
    }

    fn from_device(device: Device<Context>, interface: Interface) -> Result<FtdiDevice> {
        log::trace!("Opening FTDI device {:?} interface {:?}", device, interface);
        let handle = device.open()?;

        // Kernel drivers such as ftdi_sio grab the interface by default.
        // Not all platforms support auto-detach, so failure is not fatal.
        handle.set_auto_detach_kernel_driver(true).ok();
        handle.claim_interface(interface.number())?;

        let mut max_packet_size = 64;
        let cdesc = device.config_descriptor(0)?;
        for iface in cdesc.interfaces().filter(|i| i.number() == interface.number()) {
            for idesc in iface.descriptors() {
                for ep in idesc.endpoint_descriptors() {
                    if ep.address() == interface.in_ep() {
                        max_packet_size = ep.max_packet_size() as usize;
                    }
                }
            }
        }
        log::debug!("Opened FTDI device, max packet size {} bytes", max_packet_size);

        Ok(FtdiDevice { handle, interface, max_packet_size, rx: VecDeque::new(), claimed: true })
    }

    fn vendor_out(&self, request: Request, value: u16) -> Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
        self.handle.write_control(request_type, request.into(), value,
                                  self.interface.index(), &[], CONTROL_TIMEOUT)?;
        Ok(())
    }

    fn vendor_in(&self, request: Request, buf: &mut [u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In, rusb::RequestType::Vendor, rusb::Recipient::Device);
        Ok(self.handle.read_control(request_type, request.into(), 0,
                                    self.interface.index(), buf, CONTROL_TIMEOUT)?)
    }

    /// Read one bulk packet, stripping the status header from every
    /// max-packet-sized segment and queueing the payload.
    fn fill_rx(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.max_packet_size];
        let n = match self.handle.read_bulk(self.interface.in_ep(), &mut buf[..], READ_TIMEOUT) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => 0,
            Err(e) => return Err(e.into()),
        };
        for packet in buf[..n].chunks(self.max_packet_size) {
            if packet.len() > STATUS_BYTES {
                log::trace!("RX: {:02X?}", &packet[STATUS_BYTES..]);
                self.rx.extend(&packet[STATUS_BYTES..]);
            }
        }
        Ok(())
    }
}

impl Transport for FtdiDevice {
    fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting FTDI device");
        self.vendor_out(Request::Reset, ResetType::Sio.into())?;
        self.rx.clear();
        Ok(())
    }

    fn purge(&mut self) -> Result<()> {
        log::debug!("Purging FTDI RX and TX buffers");
        self.vendor_out(Request::Reset, ResetType::PurgeRx.into())?;
        self.vendor_out(Request::Reset, ResetType::PurgeTx.into())?;
        self.rx.clear();
        Ok(())
    }

    fn latency_timer(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        match self.vendor_in(Request::GetLatencyTimer, &mut buf)? {
            1 => Ok(buf[0]),
            n => Err(Error::InvalidResponse(n)),
        }
    }

    fn set_latency_timer(&mut self, latency: u8) -> Result<()> {
        log::debug!("Setting latency timer to {}ms", latency);
        self.vendor_out(Request::SetLatencyTimer, latency as u16)
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        log::debug!("Setting bit mode {:?} with mask 0x{:02X}", mode, mask);
        let mode: u8 = mode.into();
        self.vendor_out(Request::SetBitMode, ((mode as u16) << 8) | mask as u16)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        log::trace!("TX: {:02X?}", data);
        Ok(self.handle.write_bulk(self.interface.out_ep(), data, WRITE_TIMEOUT)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.rx.is_empty() {
            self.fill_rx()?;
        }
        let n = usize::min(buf.len(), self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        if self.claimed {
            log::debug!("Releasing FTDI interface {:?}", self.interface);
            self.claimed = false;
            self.handle.release_interface(self.interface.number())?;
        }
        Ok(())
    }
}

/// Metadata about an FTDI device.
///
/// Used to enumerate available devices and to specify
/// a specific device to attempt to connect to.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub vid: u16,
    pub pid: u16,
    pub sn: Option<String>,
}

impl DeviceInfo {
    /// Find all connected FTDI MPSSE devices.
    pub fn list() -> Vec<Self> {
        log::trace!("Searching for FTDI devices");
        match Context::new().and_then(|ctx| ctx.devices()) {
            Ok(devices) => devices.iter().filter_map(|d| Self::from_device(&d)).collect(),
            Err(_) => vec![],
        }
    }

    /// Create a DeviceInfo from a specifier string, `VID:PID` or `VID:PID:Serial`.
    pub fn from_specifier(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::InvalidSpecifier);
        }
        let vid = u16::from_str_radix(parts[0].trim_start_matches("0x"), 16)
            .or(Err(Error::InvalidSpecifier))?;
        let pid = u16::from_str_radix(parts[1].trim_start_matches("0x"), 16)
            .or(Err(Error::InvalidSpecifier))?;
        let sn = parts.get(2).map(|&sn| sn.to_owned());
        Ok(DeviceInfo { name: None, vid, pid, sn })
    }

    /// Attempt to open the given interface of the device matching this DeviceInfo.
    pub fn open(&self, interface: Interface) -> Result<FtdiDevice> {
        log::trace!("Opening device: {}", self);
        let devices = Context::new().and_then(|ctx| ctx.devices())?;
        for device in devices.iter() {
            let ids = match device.device_descriptor() {
                Ok(desc) => (desc.vendor_id(), desc.product_id()),
                Err(_) => continue,
            };
            if ids != (self.vid, self.pid) {
                continue;
            }
            match DeviceInfo::read_info(&device) {
                Some(info) if info.matches(self) => return FtdiDevice::from_device(device, interface),
                _ => continue,
            }
        }
        Err(Error::NotFound)
    }

    /// Create a DeviceInfo from an rusb Device if it is a known FTDI MPSSE device.
    ///
    /// Returns None if the device could not be read or was not a known device.
    fn from_device(device: &Device<Context>) -> Option<DeviceInfo> {
        let desc = device.device_descriptor().ok()?;
        if KNOWN_IDS.contains(&(desc.vendor_id(), desc.product_id())) {
            Self::read_info(device)
        } else {
            None
        }
    }

    /// Read the descriptor and, where permitted, the product and serial strings.
    fn read_info(device: &Device<Context>) -> Option<DeviceInfo> {
        let timeout = Duration::from_millis(100);
        let desc = device.device_descriptor().ok()?;
        let (name, sn) = match device.open() {
            Ok(handle) => match handle.read_languages(timeout).ok().and_then(|l| l.first().cloned()) {
                Some(language) => (
                    handle.read_product_string(language, &desc, timeout).ok(),
                    handle.read_serial_number_string(language, &desc, timeout).ok(),
                ),
                None => (None, None),
            },
            Err(_) => (None, None),
        };
        Some(DeviceInfo { name, vid: desc.vendor_id(), pid: desc.product_id(), sn })
    }

    /// Check if this `DeviceInfo` is valid for `target`.
    ///
    /// Always checks `vid` and `pid`, checks `sn` if not None.
    fn matches(&self, target: &Self) -> bool {
        if self.vid == target.vid && self.pid == target.pid {
            match target.sn {
                None => true,
                Some(_) => self.sn == target.sn,
            }
        } else {
            false
        }
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name.clone().unwrap_or_else(|| "Unknown".to_owned());
        let sn = self.sn.clone().unwrap_or_else(|| "".to_owned());
        write!(f, "{:04x}:{:04x}:{} {}", self.vid, self.pid, sn, name)
    }
}
