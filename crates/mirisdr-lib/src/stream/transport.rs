//! Transport seam between the streaming engine and the USB stack.
//!
//! The engine owns the buffers; a transport only borrows them while a
//! transfer is in flight and reports completions back by slot.

use std::fmt;
use std::time::Duration;

use super::StreamError;
use super::pool::{PoolLayout, SlotId};

/// Outcome of a transfer or of one isochronous packet within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCompletion {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// A transfer the USB stack has handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    /// Per-packet results, in capture order.
    pub packets: Vec<PacketCompletion>,
}

/// Non-success results of one event-poll iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// Poll primitive reported a timeout. Retried.
    Timeout,
    /// Interrupted by a signal. Retried.
    Interrupted,
    /// Anything else. Ends the session.
    Fatal(i32),
}

/// Isochronous IN pipe driven by a cooperative poll loop.
///
/// Completions are only ever produced from inside [`handle_events`](Self::handle_events),
/// on the calling thread.
pub trait IsoTransport {
    /// Allocate per-slot transfer descriptors for `layout`.
    fn prepare(&mut self, layout: &PoolLayout) -> Result<(), StreamError>;

    /// Queue `buffer` as the transfer for `slot`.
    ///
    /// # Safety
    ///
    /// The transport keeps a raw pointer to `buffer`. The caller must keep
    /// it alive and must not read or write it until `slot` comes back
    /// through [`drain_completions`](Self::drain_completions).
    unsafe fn submit(&mut self, slot: SlotId, buffer: &mut [u8]) -> Result<(), StreamError>;

    /// Ask the stack to abandon `slot`. Its completion still arrives later.
    fn cancel(&mut self, slot: SlotId) -> Result<(), StreamError>;

    /// Run one poll iteration, waiting at most `timeout`.
    fn handle_events(&mut self, timeout: Duration) -> Result<(), PollError>;

    /// Completions gathered by previous polls, oldest first.
    fn drain_completions(&mut self) -> Vec<Completion>;
}
