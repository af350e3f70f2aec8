//! USB plumbing: device open and bring-up, plus the four asynchronous
//! transfer slots the engine keeps in flight.
//!
//! Device management goes through `rusb`; the overlapping transfers and the
//! event pump are not reachable from its safe API, so the slots talk to
//! `libusb1-sys` directly. All FFI lives in this module and the callback
//! shims in `engine.rs`.

use crate::device::{self, DeviceDesc};
use crate::error::Error;
use libusb1_sys as ffi;
use rusb::UsbContext as _;
use std::os::raw::{c_int, c_void};
use tracing::error;

pub const AUDIO_IN_EP: u8 = 0x83;
pub const AUDIO_OUT_EP: u8 = 0x03;
pub const MIDI_IN_EP: u8 = 0x81;
pub const MIDI_OUT_EP: u8 = 0x01;

const USB_CONFIGURATION: u8 = 1;
// Interface 1 alt 3 carries audio, interface 2 alt 2 MIDI; interface 3 is
// claimed at alt 0 because the device refuses to stream otherwise.
const INTERFACE_ALT_SETTINGS: [(u8, u8); 3] = [(1, 3), (2, 2), (3, 0)];
const ENDPOINTS: [u8; 4] = [AUDIO_IN_EP, AUDIO_OUT_EP, MIDI_IN_EP, MIDI_OUT_EP];

#[cfg(unix)]
const LIBUSB_OPTION_NO_DEVICE_DISCOVERY: u32 = 2;

/// An opened, matched device: libusb context, handle, and the model row.
pub(crate) struct UsbDevice {
    pub context: rusb::Context,
    pub handle: rusb::DeviceHandle<rusb::Context>,
    pub desc: &'static DeviceDesc,
    pub bus: u8,
    pub address: u8,
}

/// Enumerate and open the device sitting at `(bus, address)`, provided its
/// vendor/product pair is in the model table.
pub(crate) fn open_bus_address(bus: u8, address: u8) -> Result<UsbDevice, Error> {
    let context = rusb::Context::new().map_err(|e| {
        error!("libusb init failed: {e}");
        Error::LibusbInitFailed
    })?;
    let devices = context.devices().map_err(|e| {
        error!("error while listing devices: {e}");
        Error::Generic
    })?;
    for dev in devices.iter() {
        let dd = match dev.device_descriptor() {
            Ok(dd) => dd,
            Err(e) => {
                error!("error while getting device description: {e}");
                continue;
            }
        };
        let Some(desc) = device::lookup(dd.vendor_id(), dd.product_id()) else {
            continue;
        };
        if dev.bus_number() != bus || dev.address() != address {
            continue;
        }
        let handle = dev.open().map_err(|e| {
            error!("error while opening device: {e}");
            Error::CantOpenDev
        })?;
        return Ok(UsbDevice {
            context,
            handle,
            desc,
            bus,
            address,
        });
    }
    Err(Error::CantFindDev)
}

/// Wrap a device file descriptor the host already opened (sandboxed hosts
/// cannot enumerate) and match it against the model table.
#[cfg(unix)]
pub(crate) fn open_fd(fd: std::os::fd::RawFd) -> Result<UsbDevice, Error> {
    // Contexts created from here on may live without /dev enumeration.
    unsafe {
        ffi::libusb_set_option(std::ptr::null_mut(), LIBUSB_OPTION_NO_DEVICE_DISCOVERY);
    }
    let context = rusb::Context::new().map_err(|e| {
        error!("libusb init failed: {e}");
        Error::LibusbInitFailed
    })?;
    let mut raw: *mut ffi::libusb_device_handle = std::ptr::null_mut();
    let rc = unsafe { ffi::libusb_wrap_sys_device(context.as_raw(), fd as *mut c_int, &mut raw) };
    let raw = match std::ptr::NonNull::new(raw) {
        Some(raw) if rc == 0 => raw,
        _ => {
            error!("error while wrapping device fd: {}", error_name(rc));
            return Err(Error::LibusbInitFailed);
        }
    };
    let handle = unsafe { rusb::DeviceHandle::from_libusb(context.clone(), raw) };
    let dev = handle.device();
    let dd = dev.device_descriptor().map_err(|e| {
        error!("error while getting device description: {e}");
        Error::Generic
    })?;
    let Some(desc) = device::lookup(dd.vendor_id(), dd.product_id()) else {
        return Err(Error::CantFindDev);
    };
    Ok(UsbDevice {
        bus: dev.bus_number(),
        address: dev.address(),
        context,
        handle,
        desc,
    })
}

/// Select the streaming configuration: set configuration 1, claim the three
/// interfaces with their alternate settings, clear halts on all four
/// endpoints. Interfaces already claimed are released when the handle drops.
pub(crate) fn bring_up(handle: &mut rusb::DeviceHandle<rusb::Context>) -> Result<(), Error> {
    handle
        .set_active_configuration(USB_CONFIGURATION)
        .map_err(|e| {
            error!("error while setting usb configuration: {e}");
            Error::CantSetUsbConfig
        })?;
    for (iface, alt) in INTERFACE_ALT_SETTINGS {
        handle.claim_interface(iface).map_err(|e| {
            error!("error while claiming interface {iface}: {e}");
            Error::CantClaimIf
        })?;
        handle.set_alternate_setting(iface, alt).map_err(|e| {
            error!("error while setting alt setting {alt} on interface {iface}: {e}");
            Error::CantSetAltSetting
        })?;
    }
    for ep in ENDPOINTS {
        handle.clear_halt(ep).map_err(|e| {
            error!("error while clearing endpoint {ep:#04x}: {e}");
            Error::CantClearEp
        })?;
    }
    Ok(())
}

/// One asynchronous transfer handle. The engine owns four of these for the
/// life of the stream; a slot is refilled and resubmitted from the
/// completion callback of its previous flight.
pub(crate) struct TransferSlot {
    ptr: *mut ffi::libusb_transfer,
}

// The pointer is only dereferenced while filling a slot that is not in
// flight; submission itself is thread-safe in libusb.
unsafe impl Send for TransferSlot {}
unsafe impl Sync for TransferSlot {}

impl TransferSlot {
    pub fn alloc() -> Result<Self, Error> {
        let ptr = unsafe { ffi::libusb_alloc_transfer(0) };
        if ptr.is_null() {
            return Err(Error::CantPrepareTransfer);
        }
        Ok(Self { ptr })
    }

    /// Point the slot at a buffer and callback for its next flight.
    ///
    /// SAFETY: `buffer` and `user_data` must stay valid until the callback
    /// has run, and the slot must not currently be in flight.
    pub unsafe fn fill(
        &self,
        handle: *mut ffi::libusb_device_handle,
        endpoint: u8,
        transfer_type: u8,
        buffer: *mut u8,
        length: usize,
        callback: ffi::libusb_transfer_cb_fn,
        user_data: *mut c_void,
    ) {
        let xfr = unsafe { &mut *self.ptr };
        xfr.dev_handle = handle;
        xfr.endpoint = endpoint;
        xfr.transfer_type = transfer_type;
        xfr.flags = 0;
        xfr.timeout = 0;
        xfr.buffer = buffer;
        xfr.length = length as c_int;
        xfr.num_iso_packets = 0;
        xfr.callback = callback;
        xfr.user_data = user_data;
    }

    pub fn submit(&self) -> Result<(), c_int> {
        let rc = unsafe { ffi::libusb_submit_transfer(self.ptr) };
        if rc == 0 { Ok(()) } else { Err(rc) }
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        unsafe { ffi::libusb_free_transfer(self.ptr) };
    }
}

/// Run one iteration of the libusb event pump; completion callbacks fire on
/// the calling thread.
pub(crate) fn handle_events(context: &rusb::Context) {
    let rc = unsafe { ffi::libusb_handle_events_completed(context.as_raw(), std::ptr::null_mut()) };
    if rc != 0 {
        error!("error while handling usb events: {}", error_name(rc));
    }
}

pub(crate) fn error_name(code: c_int) -> &'static str {
    match code {
        0 => "success",
        -1 => "input/output error",
        -2 => "invalid parameter",
        -3 => "access denied",
        -4 => "no such device",
        -5 => "entity not found",
        -6 => "resource busy",
        -7 => "operation timed out",
        -8 => "overflow",
        -9 => "pipe error",
        -10 => "system call interrupted",
        -11 => "insufficient memory",
        -12 => "operation not supported",
        _ => "other error",
    }
}

pub(crate) fn transfer_status_name(status: c_int) -> &'static str {
    match status {
        0 => "completed",
        1 => "error",
        2 => "timed out",
        3 => "cancelled",
        4 => "stall",
        5 => "no device",
        6 => "overflow",
        _ => "unknown",
    }
}
