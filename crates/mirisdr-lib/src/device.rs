//! Device communication: register bus, USB device trait, libusb backend.
//!
//! Enumeration goes through `nusb`, which reads descriptors and strings
//! without opening the device. An opened session uses `rusb`, which is the
//! only backend here with isochronous transfers.

use std::fmt;
use std::time::Duration;

use rusb::UsbContext;
use serde::Serialize;

use crate::models::find_known_device;
use crate::protocol::*;
use crate::stream::libusb::LibusbTransport;
use crate::stream::transport::IsoTransport;

// ── Error type ──

/// Device communication errors.
///
/// String payloads follow the convention **"context: details"** where
/// *context* names the step (e.g. `"libusb init"`, `"claim interface 0"`).
#[derive(Debug)]
pub enum DeviceError {
    NotFound,
    OpenFailed(String),
    InitFailed(String),
    ControlFailed { register: u8, reason: String },
    Usb(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotFound => write!(f, "No supported Mirics device found"),
            DeviceError::OpenFailed(e) => write!(f, "Failed to open device: {e}"),
            DeviceError::InitFailed(e) => write!(f, "Device init failed: {e}"),
            DeviceError::ControlFailed { register, reason } => {
                write!(f, "Register 0x{register:02x} write failed: {reason}")
            }
            DeviceError::Usb(e) => write!(f, "USB error: {e}"),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type Result<T> = std::result::Result<T, DeviceError>;

// ── Register bus ──

/// Vendor control channel to the MSi2500.
///
/// Implementors only supply [`vendor_request`](Self::vendor_request);
/// register packing is shared.
pub trait RegisterBus {
    /// Zero-length vendor OUT request on the control endpoint.
    fn vendor_request(&self, request: u8, value: u16, index: u16) -> Result<()>;

    /// Write a 24-bit value to an MSi2500 register. No retries.
    fn write_register(&self, reg: u8, value: u32) -> Result<()> {
        let (w_value, w_index) = pack_register_write(reg, value);
        log::debug!("reg 0x{reg:02x} <- 0x{:06x}", value & REGISTER_VALUE_MASK);
        self.vendor_request(REQUEST_WRITE_REGISTER, w_value, w_index)
            .map_err(|e| DeviceError::ControlFailed {
                register: reg,
                reason: e.to_string(),
            })
    }
}

// ── Device info ──

/// A known receiver found on the bus (not necessarily opened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Position among known devices, as accepted by `open`.
    pub index: usize,
    /// Friendly name from the known-device table.
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DiscoveredDevice {
    pub fn path(&self) -> String {
        format!(
            "usb:{:03}/{:03} [{:04x}:{:04x}]",
            self.bus, self.address, self.vid, self.pid
        )
    }

    pub fn usb_strings(&self) -> UsbStrings {
        UsbStrings {
            manufacturer: self.manufacturer.clone(),
            product: self.product.clone(),
            serial: self.serial.clone(),
        }
    }
}

/// USB string descriptors. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsbStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

// ── Device trait ──

/// An SDR bridge that can be configured and streamed from.
pub trait SdrDevice: RegisterBus {
    fn info(&self) -> &DiscoveredDevice;

    /// String descriptors read through the open handle.
    fn usb_strings(&self) -> Result<UsbStrings>;

    fn claim_interface(&mut self) -> Result<()>;

    fn release_interface(&mut self) -> Result<()>;

    /// Select the alternate setting of the streaming interface.
    fn set_alt_setting(&mut self, alt: u8) -> Result<()>;

    /// Isochronous transport bound to this device's handle.
    fn transport(&self) -> Box<dyn IsoTransport + '_>;
}

// ── libusb backend ──

pub struct LibusbDevice {
    context: rusb::Context,
    handle: rusb::DeviceHandle<rusb::Context>,
    info: DiscoveredDevice,
    claimed: bool,
}

impl LibusbDevice {
    /// Open the `index`-th known device.
    ///
    /// The device is located with nusb and then matched to libusb's view by
    /// bus number and address.
    pub fn open(index: usize) -> Result<Self> {
        let info = enumerate_devices()
            .into_iter()
            .nth(index)
            .ok_or(DeviceError::NotFound)?;

        let context =
            rusb::Context::new().map_err(|e| DeviceError::OpenFailed(format!("libusb init: {e}")))?;
        let device = context
            .devices()
            .map_err(|e| DeviceError::OpenFailed(format!("USB enumeration: {e}")))?
            .iter()
            .find(|d| d.bus_number() == info.bus && d.address() == info.address)
            .ok_or_else(|| {
                DeviceError::OpenFailed(format!("{}: not visible to libusb", info.path()))
            })?;

        let mut handle = device
            .open()
            .map_err(|e| DeviceError::OpenFailed(format!("USB open {}: {e}", info.path())))?;

        // Not supported on every platform; claiming will report the real problem.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("auto-detach kernel driver unavailable: {e}");
        }

        log::debug!("opened {} ({})", info.path(), info.name);
        Ok(LibusbDevice {
            context,
            handle,
            info,
            claimed: false,
        })
    }
}

impl RegisterBus for LibusbDevice {
    fn vendor_request(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.handle
            .write_control(
                CTRL_OUT_REQUEST_TYPE,
                request,
                value,
                index,
                &[],
                Duration::from_millis(CTRL_TIMEOUT_MS),
            )
            .map(|_| ())
            .map_err(|e| DeviceError::Usb(format!("control_out(bRequest=0x{request:02x}): {e}")))
    }
}

impl SdrDevice for LibusbDevice {
    fn info(&self) -> &DiscoveredDevice {
        &self.info
    }

    fn usb_strings(&self) -> Result<UsbStrings> {
        let descriptor = self
            .handle
            .device()
            .device_descriptor()
            .map_err(|e| DeviceError::Usb(format!("device descriptor: {e}")))?;
        Ok(UsbStrings {
            manufacturer: self.handle.read_manufacturer_string_ascii(&descriptor).ok(),
            product: self.handle.read_product_string_ascii(&descriptor).ok(),
            serial: self.handle.read_serial_number_string_ascii(&descriptor).ok(),
        })
    }

    fn claim_interface(&mut self) -> Result<()> {
        self.handle
            .claim_interface(STREAM_INTERFACE)
            .map_err(|e| DeviceError::OpenFailed(format!("claim interface {STREAM_INTERFACE}: {e}")))?;
        self.claimed = true;
        Ok(())
    }

    fn release_interface(&mut self) -> Result<()> {
        if !self.claimed {
            return Ok(());
        }
        self.claimed = false;
        self.handle
            .release_interface(STREAM_INTERFACE)
            .map_err(|e| DeviceError::Usb(format!("release interface {STREAM_INTERFACE}: {e}")))
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<()> {
        self.handle
            .set_alternate_setting(STREAM_INTERFACE, alt)
            .map_err(|e| DeviceError::InitFailed(format!("alt setting {alt}: {e}")))
    }

    fn transport(&self) -> Box<dyn IsoTransport + '_> {
        Box::new(LibusbTransport::new(&self.context, &self.handle, ISO_ENDPOINT))
    }
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        if let Err(e) = self.release_interface() {
            log::debug!("{e}");
        }
    }
}

// ── Device enumeration ──

/// Enumerate known receivers, ordered by bus and address.
///
/// Returns an empty list if the USB subsystem cannot be queried.
pub fn enumerate_devices() -> Vec<DiscoveredDevice> {
    let Ok(devices) = nusb::list_devices() else {
        return Vec::new();
    };

    let mut found: Vec<DiscoveredDevice> = devices
        .filter_map(|dev| {
            let known = find_known_device(dev.vendor_id(), dev.product_id())?;
            Some(DiscoveredDevice {
                index: 0,
                name: known.name.to_string(),
                vid: known.vid,
                pid: known.pid,
                bus: dev.bus_number(),
                address: dev.device_address(),
                manufacturer: dev.manufacturer_string().map(str::to_string),
                product: dev.product_string().map(str::to_string),
                serial: dev.serial_number().map(str::to_string),
            })
        })
        .collect();

    found.sort_by_key(|d| (d.bus, d.address));
    for (i, dev) in found.iter_mut().enumerate() {
        dev.index = i;
    }
    found
}

/// Number of known receivers currently attached.
pub fn device_count() -> usize {
    enumerate_devices().len()
}

/// Friendly name of the `index`-th receiver, or `""` if there is none.
pub fn device_name(index: usize) -> &'static str {
    enumerate_devices()
        .get(index)
        .and_then(|d| find_known_device(d.vid, d.pid))
        .map(|k| k.name)
        .unwrap_or("")
}

/// String descriptors of the `index`-th receiver, without opening it.
pub fn device_usb_strings(index: usize) -> Result<UsbStrings> {
    enumerate_devices()
        .get(index)
        .map(DiscoveredDevice::usb_strings)
        .ok_or(DeviceError::NotFound)
}

// ── Mock device for testing ──

/// In-memory mock device for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};

    use crate::stream::mock::{MockStreamScript, MockTransport};

    /// Records every vendor request and serves a scripted isochronous stream.
    pub struct MockDevice {
        info: DiscoveredDevice,
        /// Recorded vendor requests: (bRequest, wValue, wIndex).
        pub requests: RefCell<Vec<(u8, u16, u16)>>,
        /// If set, requests fail once this many have succeeded.
        pub fail_after: Cell<Option<usize>>,
        pub claimed: Cell<bool>,
        pub alt_setting: Cell<u8>,
        pub strings: RefCell<UsbStrings>,
        /// Packets, poll errors and faults served by [`MockTransport`].
        pub stream: RefCell<MockStreamScript>,
    }

    impl Default for MockDevice {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockDevice {
        pub fn new() -> Self {
            MockDevice {
                info: DiscoveredDevice {
                    index: 0,
                    name: "Mirics MSi2500 default (e.g. VTX3D card)".into(),
                    vid: 0x1df7,
                    pid: 0x2500,
                    bus: 1,
                    address: 7,
                    manufacturer: Some("Mirics".into()),
                    product: Some("MSi2500".into()),
                    serial: None,
                },
                requests: RefCell::new(Vec::new()),
                fail_after: Cell::new(None),
                claimed: Cell::new(false),
                alt_setting: Cell::new(0),
                strings: RefCell::new(UsbStrings {
                    manufacturer: Some("Mirics".into()),
                    product: Some("MSi2500".into()),
                    serial: None,
                }),
                stream: RefCell::new(MockStreamScript::default()),
            }
        }

        /// Register writes decoded back out of the recorded requests.
        pub fn register_writes(&self) -> Vec<(u8, u32)> {
            self.requests
                .borrow()
                .iter()
                .filter(|(req, _, _)| *req == REQUEST_WRITE_REGISTER)
                .map(|&(_, w_value, w_index)| {
                    let reg = (w_value & 0xff) as u8;
                    let value = u32::from(w_value >> 8) | u32::from(w_index) << 8;
                    (reg, value)
                })
                .collect()
        }

        /// Values written to the tuner through the bridge's 3-wire register.
        pub fn tuner_writes(&self) -> Vec<u32> {
            self.register_writes()
                .into_iter()
                .filter(|(reg, _)| *reg == REG_TUNER_BUS)
                .map(|(_, value)| value)
                .collect()
        }

        pub fn clear(&self) {
            self.requests.borrow_mut().clear();
        }
    }

    impl RegisterBus for MockDevice {
        fn vendor_request(&self, request: u8, value: u16, index: u16) -> Result<()> {
            if let Some(limit) = self.fail_after.get()
                && self.requests.borrow().len() >= limit
            {
                return Err(DeviceError::Usb("mock: request failure injected".into()));
            }
            self.requests.borrow_mut().push((request, value, index));
            Ok(())
        }
    }

    impl SdrDevice for MockDevice {
        fn info(&self) -> &DiscoveredDevice {
            &self.info
        }

        fn usb_strings(&self) -> Result<UsbStrings> {
            Ok(self.strings.borrow().clone())
        }

        fn claim_interface(&mut self) -> Result<()> {
            self.claimed.set(true);
            Ok(())
        }

        fn release_interface(&mut self) -> Result<()> {
            self.claimed.set(false);
            Ok(())
        }

        fn set_alt_setting(&mut self, alt: u8) -> Result<()> {
            self.alt_setting.set(alt);
            Ok(())
        }

        fn transport(&self) -> Box<dyn IsoTransport + '_> {
            Box::new(MockTransport::new(&self.stream))
        }
    }
}
