//! Isochronous transport on raw libusb transfers.
//!
//! `rusb` has no isochronous API, so transfers are driven through its
//! `ffi` re-export of libusb1-sys. Completion callbacks only record the
//! finished transfer; all decoding happens later on the polling thread.

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_int, c_uint, c_void};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::time::Duration;

use rusb::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};
use rusb::{UsbContext, ffi};

use super::StreamError;
use super::pool::{PoolLayout, SlotId};
use super::transport::{Completion, IsoTransport, PacketCompletion, PollError, TransferStatus};
use crate::protocol::ISO_TIMEOUT_MS;

/// Polls granted to outstanding transfers when the transport is dropped.
const DROP_DRAIN_POLLS: usize = 10;
const DROP_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

type DoneQueue = UnsafeCell<Vec<*mut ffi::libusb_transfer>>;

impl TransferStatus {
    fn from_libusb(code: c_int) -> Self {
        match code {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

fn error_name(code: c_int) -> String {
    // SAFETY: libusb_error_name returns a static NUL-terminated string for any code.
    let name = unsafe { CStr::from_ptr(ffi::libusb_error_name(code)) };
    format!("{} ({code})", name.to_string_lossy())
}

extern "system" fn transfer_done(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the owning transport's queue, which outlives
    // every transfer it submits. libusb runs callbacks on the polling thread.
    unsafe {
        let queue = (*transfer).user_data as *const DoneQueue;
        (*(*queue).get()).push(transfer);
    }
}

/// Transfers bound to one open device handle.
///
/// Holds raw pointers into the `rusb` context and handle it was created
/// from; the borrow keeps both alive.
pub struct LibusbTransport<'a> {
    context: *mut ffi::libusb_context,
    handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    packets: u32,
    packet_length: u32,
    transfers: Vec<NonNull<ffi::libusb_transfer>>,
    in_flight: Vec<bool>,
    done: Box<DoneQueue>,
    _device: PhantomData<&'a rusb::Context>,
}

impl<'a> LibusbTransport<'a> {
    pub(crate) fn new(
        context: &'a rusb::Context,
        handle: &'a rusb::DeviceHandle<rusb::Context>,
        endpoint: u8,
    ) -> Self {
        LibusbTransport {
            context: context.as_raw(),
            handle: handle.as_raw(),
            endpoint,
            packets: 0,
            packet_length: 0,
            transfers: Vec::new(),
            in_flight: Vec::new(),
            done: Box::new(UnsafeCell::new(Vec::new())),
            _device: PhantomData,
        }
    }

    fn slot_of(&self, transfer: *mut ffi::libusb_transfer) -> Option<SlotId> {
        self.transfers
            .iter()
            .position(|t| t.as_ptr() == transfer)
            .map(SlotId)
    }

    /// # Safety
    ///
    /// `transfer` must be one of ours and must have completed.
    unsafe fn read_completion(&self, slot: SlotId, transfer: *mut ffi::libusb_transfer) -> Completion {
        // SAFETY: the transfer is back from libusb and nobody else touches it.
        unsafe {
            let count = (*transfer).num_iso_packets.max(0) as usize;
            let descs = ptr::addr_of!((*transfer).iso_packet_desc) as *const ffi::libusb_iso_packet_descriptor;
            let packets = (0..count)
                .map(|i| {
                    let d = &*descs.add(i);
                    PacketCompletion {
                        status: TransferStatus::from_libusb(d.status),
                        actual_length: d.actual_length as usize,
                    }
                })
                .collect();
            Completion {
                slot,
                status: TransferStatus::from_libusb((*transfer).status),
                packets,
            }
        }
    }

    fn free_transfers(&mut self) {
        for (transfer, in_flight) in self.transfers.drain(..).zip(self.in_flight.drain(..)) {
            if in_flight {
                log::warn!("leaking isochronous transfer still owned by libusb");
                continue;
            }
            // SAFETY: allocated by libusb_alloc_transfer and not in flight.
            unsafe { ffi::libusb_free_transfer(transfer.as_ptr()) };
        }
    }
}

impl IsoTransport for LibusbTransport<'_> {
    fn prepare(&mut self, layout: &PoolLayout) -> Result<(), StreamError> {
        if self.in_flight.iter().any(|&f| f) {
            return Err(StreamError::Transport("prepare: transfers still in flight".into()));
        }
        self.free_transfers();

        self.packets = layout.packets_per_transfer;
        self.packet_length = layout.packet_length;
        for _ in 0..layout.transfers {
            // SAFETY: plain allocation; a null return is handled below.
            let raw = unsafe { ffi::libusb_alloc_transfer(self.packets as c_int) };
            let transfer = NonNull::new(raw)
                .ok_or_else(|| StreamError::Allocation("libusb_alloc_transfer returned null".into()))?;
            self.transfers.push(transfer);
            self.in_flight.push(false);
        }
        Ok(())
    }

    unsafe fn submit(&mut self, slot: SlotId, buffer: &mut [u8]) -> Result<(), StreamError> {
        let transfer = self.transfers[slot.0].as_ptr();
        // SAFETY: the transfer was allocated with `self.packets` descriptors and
        // is not in flight; the caller keeps `buffer` alive until completion.
        let rc = unsafe {
            (*transfer).dev_handle = self.handle;
            (*transfer).endpoint = self.endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*transfer).timeout = ISO_TIMEOUT_MS as c_uint;
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).length = buffer.len() as c_int;
            (*transfer).num_iso_packets = self.packets as c_int;
            (*transfer).callback = transfer_done;
            (*transfer).user_data = &*self.done as *const DoneQueue as *mut c_void;

            let descs = ptr::addr_of_mut!((*transfer).iso_packet_desc) as *mut ffi::libusb_iso_packet_descriptor;
            for i in 0..self.packets as usize {
                (*descs.add(i)).length = self.packet_length as c_uint;
            }

            ffi::libusb_submit_transfer(transfer)
        };
        if rc < 0 {
            return Err(StreamError::Submit {
                slot: slot.0,
                reason: error_name(rc),
            });
        }
        self.in_flight[slot.0] = true;
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) -> Result<(), StreamError> {
        // SAFETY: cancelling a transfer we own is always allowed; libusb
        // reports NOT_FOUND if it already completed.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.transfers[slot.0].as_ptr()) };
        if rc < 0 {
            return Err(StreamError::Transport(format!("cancel {slot}: {}", error_name(rc))));
        }
        Ok(())
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<(), PollError> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: context is valid for the transport's lifetime.
        let rc = unsafe { ffi::libusb_handle_events_timeout(self.context, &tv) };
        match rc {
            0 => Ok(()),
            LIBUSB_ERROR_TIMEOUT => Err(PollError::Timeout),
            LIBUSB_ERROR_INTERRUPTED => Err(PollError::Interrupted),
            code => Err(PollError::Fatal(code)),
        }
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        // SAFETY: callbacks only run inside handle_events on this thread.
        let done = std::mem::take(unsafe { &mut *self.done.get() });
        let mut completions = Vec::with_capacity(done.len());
        for transfer in done {
            let Some(slot) = self.slot_of(transfer) else {
                log::warn!("completion for unknown transfer {transfer:p}");
                continue;
            };
            self.in_flight[slot.0] = false;
            // SAFETY: `transfer` is ours and has just completed.
            completions.push(unsafe { self.read_completion(slot, transfer) });
        }
        completions
    }
}

impl Drop for LibusbTransport<'_> {
    fn drop(&mut self) {
        if self.in_flight.iter().any(|&f| f) {
            for slot in 0..self.transfers.len() {
                if self.in_flight[slot] {
                    let _ = self.cancel(SlotId(slot));
                }
            }
            for _ in 0..DROP_DRAIN_POLLS {
                if !self.in_flight.iter().any(|&f| f) {
                    break;
                }
                if let Err(PollError::Fatal(code)) = self.handle_events(DROP_DRAIN_TIMEOUT) {
                    log::debug!("drain poll failed: {}", error_name(code));
                    break;
                }
                self.drain_completions();
            }
        }
        self.free_transfers();
    }
}
