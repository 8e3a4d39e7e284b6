//! Asynchronous streaming engine.
//!
//! A fixed pool of isochronous transfers is kept in flight against the
//! device. The thread that starts streaming owns the poll loop and blocks in
//! it; completions are decoded and handed to the caller's callback on that
//! same thread. Other threads can only request cancellation, which is a
//! single atomic `Running → Canceling` transition observed on the next poll.
//!
//! ```text
//! Inactive --start--> Running --cancel--> Canceling --all transfers back--> Inactive
//! ```

pub mod libusb;
#[doc(hidden)]
pub mod mock;
pub mod pool;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::decoder::{DecodeOutcome, SampleDecoder};
use crate::protocol::{BUFFER_LENGTH_ALIGN, DEFAULT_BUFFER_LENGTH, POLL_TIMEOUT_MS};
use pool::{PoolLayout, SlotId, TransferPool};
use transport::{Completion, IsoTransport, PacketCompletion, PollError, TransferStatus};

/// Polls allowed for in-flight transfers to come back after a fatal fault.
const TEARDOWN_POLLS: usize = 10;

// ── Error type ──

#[derive(Debug)]
pub enum StreamError {
    AlreadyRunning,
    NotRunning,
    /// Requested buffer length is not a whole number of 512-byte units.
    InvalidBufferLength(u32),
    /// libusb could not allocate a transfer.
    Allocation(String),
    /// A transfer could not be (re)submitted. Fatal.
    Submit { slot: usize, reason: String },
    /// The device went away mid-stream. Fatal.
    Disconnected,
    /// Event polling failed with something other than timeout or signal. Fatal.
    Poll(i32),
    Transport(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::AlreadyRunning => write!(f, "Streaming is already running"),
            StreamError::NotRunning => write!(f, "Streaming is not running"),
            StreamError::InvalidBufferLength(len) => {
                write!(f, "Buffer length {len} is not a multiple of {BUFFER_LENGTH_ALIGN}")
            }
            StreamError::Allocation(e) => write!(f, "Transfer allocation failed: {e}"),
            StreamError::Submit { slot, reason } => {
                write!(f, "Failed to submit transfer #{slot}: {reason}")
            }
            StreamError::Disconnected => write!(f, "Device disconnected while streaming"),
            StreamError::Poll(code) => write!(f, "USB event polling failed: {code}"),
            StreamError::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

pub type Result<T> = std::result::Result<T, StreamError>;

// ── Streaming status ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StreamStatus {
    Inactive = 0,
    Canceling = 1,
    Running = 2,
}

impl StreamStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => StreamStatus::Running,
            1 => StreamStatus::Canceling,
            _ => StreamStatus::Inactive,
        }
    }
}

/// Shared streaming status of one device session.
#[derive(Debug, Clone, Default)]
pub struct StreamState(Arc<AtomicU8>);

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: StreamStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// `Running → Canceling`. Returns `false` if not running.
    pub fn request_cancel(&self) -> bool {
        self.0
            .compare_exchange(
                StreamStatus::Running as u8,
                StreamStatus::Canceling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn handle(&self) -> CancelHandle {
        CancelHandle(self.clone())
    }
}

/// Cross-thread cancellation signal for a streaming session.
///
/// Cancelling never blocks; the streaming call returns once every in-flight
/// transfer has come back.
#[derive(Debug, Clone)]
pub struct CancelHandle(StreamState);

impl CancelHandle {
    pub fn cancel(&self) -> Result<()> {
        if self.0.request_cancel() {
            Ok(())
        } else {
            Err(StreamError::NotRunning)
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.0.status()
    }
}

// ── Options and results ──

/// Optional overrides for the transfer pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Number of transfers kept in flight. `None` or `0` uses the default.
    pub buffer_count: Option<u32>,
    /// Bytes per transfer. Must be a multiple of 512. The device's packet
    /// size is fixed, so a valid value is accepted but not applied.
    pub buffer_length: Option<u32>,
}

impl StreamOptions {
    pub fn layout(&self) -> Result<PoolLayout> {
        let mut layout = PoolLayout::default();
        if let Some(count) = self.buffer_count
            && count > 0
        {
            layout.transfers = count;
        }
        if let Some(len) = self.buffer_length {
            if len == 0 || len % BUFFER_LENGTH_ALIGN != 0 {
                return Err(StreamError::InvalidBufferLength(len));
            }
            if len != DEFAULT_BUFFER_LENGTH {
                log::debug!("buffer length {len} ignored; using {DEFAULT_BUFFER_LENGTH}");
            }
        }
        Ok(layout)
    }
}

/// Decoded samples from one completed transfer.
///
/// Borrowed from the engine's scratch space; copy out anything that must
/// outlive the callback.
#[derive(Debug, Clone, Copy)]
pub struct SampleBatch<'a> {
    samples: &'a [i16],
    bytes: &'a [u8],
}

impl<'a> SampleBatch<'a> {
    pub fn samples(&self) -> &'a [i16] {
        self.samples
    }

    /// The samples as little-endian bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Counters for a finished streaming session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    pub transfers: u64,
    pub batches: u64,
    pub samples: u64,
    pub dropped_packets: u64,
    pub lost_sample_events: u64,
    pub parity_events: u64,
}

impl StreamReport {
    fn record(&mut self, outcome: &DecodeOutcome) {
        self.lost_sample_events += outcome.lost_sample_events() as u64;
        self.parity_events += outcome.parity_events() as u64;
    }
}

// ── Engine ──

/// One streaming session over a transport.
///
/// The transport is declared first so it is dropped before the pool it
/// borrows buffers from.
pub struct StreamingEngine<'t, 'd> {
    transport: Box<dyn IsoTransport + 't>,
    pool: TransferPool,
    decoder: &'d mut SampleDecoder,
    state: StreamState,
    scratch: Vec<i16>,
    bytes: Vec<u8>,
    report: StreamReport,
    fault: Option<StreamError>,
}

impl<'t, 'd> StreamingEngine<'t, 'd> {
    pub fn new(
        transport: Box<dyn IsoTransport + 't>,
        decoder: &'d mut SampleDecoder,
        state: StreamState,
        layout: PoolLayout,
    ) -> Self {
        let max_samples = layout.max_samples_per_transfer();
        StreamingEngine {
            transport,
            pool: TransferPool::new(layout),
            decoder,
            state,
            scratch: Vec::with_capacity(max_samples),
            bytes: Vec::with_capacity(max_samples * 2),
            report: StreamReport::default(),
            fault: None,
        }
    }

    /// Submit every transfer and run the poll loop until the session ends.
    ///
    /// Returns the session counters, or the fatal fault that ended it.
    pub fn run<F>(mut self, mut callback: F) -> Result<StreamReport>
    where
        F: FnMut(SampleBatch<'_>),
    {
        if self.state.status() != StreamStatus::Inactive {
            return Err(StreamError::AlreadyRunning);
        }
        self.transport.prepare(self.pool.layout())?;

        for i in 0..self.pool.len() {
            if let Err(e) = self.submit(SlotId(i)) {
                log::warn!("{e}");
                self.teardown();
                return Err(e);
            }
        }
        self.state.set(StreamStatus::Running);
        log::debug!(
            "streaming: {} transfers x {} packets x {} bytes",
            self.pool.len(),
            self.pool.layout().packets_per_transfer,
            self.pool.layout().packet_length
        );

        let timeout = Duration::from_millis(POLL_TIMEOUT_MS);
        loop {
            match self.transport.handle_events(timeout) {
                Ok(()) => {}
                Err(PollError::Timeout) => log::debug!("event poll timed out, retrying"),
                Err(PollError::Interrupted) => log::debug!("event poll interrupted, retrying"),
                Err(PollError::Fatal(code)) => {
                    log::warn!("event poll failed: {code}");
                    self.fail(StreamError::Poll(code));
                    break;
                }
            }

            for completion in self.transport.drain_completions() {
                self.complete(completion, &mut callback);
            }

            if self.state.status() == StreamStatus::Canceling {
                if !self.pool.has_busy() {
                    break;
                }
                for slot in self.pool.in_flight() {
                    self.cancel_slot(slot);
                }
            }
        }

        self.teardown();
        match self.fault.take() {
            Some(e) => Err(e),
            None => Ok(self.report),
        }
    }

    fn submit(&mut self, slot: SlotId) -> Result<()> {
        let buffer = self.pool.buffer_mut(slot);
        // SAFETY: the pool owns the buffer for the engine's lifetime and the
        // engine does not touch it again until the slot completes.
        unsafe { self.transport.submit(slot, buffer)? };
        self.pool.mark_in_flight(slot);
        Ok(())
    }

    fn cancel_slot(&mut self, slot: SlotId) {
        if let Err(e) = self.transport.cancel(slot) {
            // Usually a transfer that finished in the meantime.
            log::debug!("{e}");
        }
        self.pool.mark_cancel_requested(slot);
    }

    /// Record a fatal fault and stop resubmitting.
    fn fail(&mut self, e: StreamError) {
        if self.fault.is_none() {
            self.fault = Some(e);
        }
        self.state.request_cancel();
    }

    fn complete<F>(&mut self, completion: Completion, callback: &mut F)
    where
        F: FnMut(SampleBatch<'_>),
    {
        let slot = completion.slot;
        self.pool.mark_returned(slot);

        match completion.status {
            TransferStatus::Cancelled => return,
            TransferStatus::NoDevice => {
                self.fail(StreamError::Disconnected);
                return;
            }
            TransferStatus::Completed => {
                self.report.transfers += 1;
                self.deliver(slot, &completion.packets, callback);
            }
            other => {
                log::debug!("transfer {slot} ended: {other}");
                self.report.dropped_packets += completion.packets.len() as u64;
            }
        }

        if self.state.status() == StreamStatus::Running
            && let Err(e) = self.submit(slot)
        {
            log::warn!("{e}");
            self.fail(e);
        }
    }

    /// Decode the good packets of one transfer and invoke the callback once.
    fn deliver<F>(&mut self, slot: SlotId, packets: &[PacketCompletion], callback: &mut F)
    where
        F: FnMut(SampleBatch<'_>),
    {
        self.scratch.clear();
        for (index, packet) in packets.iter().enumerate() {
            if packet.status != TransferStatus::Completed {
                self.report.dropped_packets += 1;
                continue;
            }
            if packet.actual_length == 0 {
                continue;
            }
            let data = self.pool.packet(slot, index, packet.actual_length);
            let outcome = self.decoder.decode(data, &mut self.scratch);
            self.report.record(&outcome);
        }

        if self.scratch.is_empty() || self.state.status() != StreamStatus::Running {
            return;
        }

        self.bytes.clear();
        for s in &self.scratch {
            self.bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.report.batches += 1;
        self.report.samples += self.scratch.len() as u64;
        callback(SampleBatch {
            samples: &self.scratch,
            bytes: &self.bytes,
        });
    }

    /// Bring every transfer home before the pool can be freed.
    fn teardown(&mut self) {
        if self.pool.has_busy() {
            self.state.set(StreamStatus::Canceling);
            for slot in self.pool.in_flight() {
                self.cancel_slot(slot);
            }
            let timeout = Duration::from_millis(POLL_TIMEOUT_MS);
            for _ in 0..TEARDOWN_POLLS {
                if !self.pool.has_busy() {
                    break;
                }
                if let Err(PollError::Fatal(code)) = self.transport.handle_events(timeout) {
                    log::debug!("teardown poll failed: {code}");
                    break;
                }
                for completion in self.transport.drain_completions() {
                    self.pool.mark_returned(completion.slot);
                }
            }
            if self.pool.has_busy() {
                let leaked = self.pool.leak_busy();
                log::warn!("{leaked} transfers never returned; leaking their buffers");
            }
        }
        self.state.set(StreamStatus::Inactive);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::mock::{MockStreamScript, MockTransport};
    use super::*;
    use crate::decoder::{BLOCK_SIZE, SAMPLES_PER_BLOCK};

    fn layout() -> PoolLayout {
        PoolLayout {
            transfers: 4,
            packets_per_transfer: 2,
            packet_length: 2048,
        }
    }

    /// A block with steady parity and the given address.
    fn block(address: u32) -> Vec<u8> {
        let mut b = vec![0u8; BLOCK_SIZE];
        b[1] = address as u8;
        b[2] = (address >> 8) as u8;
        b[3] = (address >> 16) as u8;
        b[5] = 0x40;
        b
    }

    fn engine<'t, 'd>(
        script: &'t RefCell<MockStreamScript>,
        decoder: &'d mut SampleDecoder,
        state: &StreamState,
    ) -> StreamingEngine<'t, 'd> {
        StreamingEngine::new(
            Box::new(MockTransport::new(script)),
            decoder,
            state.clone(),
            layout(),
        )
    }

    #[test]
    fn cancel_from_callback_ends_session() {
        let script = RefCell::new(MockStreamScript::default());
        for a in 0..6 {
            script.borrow_mut().push_packet(block(a));
        }
        let state = StreamState::new();
        let cancel = state.handle();
        let mut decoder = SampleDecoder::new();
        let mut batches = Vec::new();

        let report = engine(&script, &mut decoder, &state)
            .run(|batch| {
                batches.push(batch.len());
                cancel.cancel().unwrap();
            })
            .unwrap();

        // two one-block packets per transfer
        assert_eq!(batches, vec![2 * SAMPLES_PER_BLOCK]);
        assert_eq!(report.batches, 1);
        assert_eq!(state.status(), StreamStatus::Inactive);
        // submit-all, one completing poll, one poll for the cancellations
        assert!(script.borrow().polls <= 3, "polls = {}", script.borrow().polls);
    }

    #[test]
    fn batches_concatenate_packets_of_one_transfer() {
        let script = RefCell::new(MockStreamScript::default());
        let mut two_blocks = block(0);
        two_blocks.extend(block(1));
        script.borrow_mut().push_packet(two_blocks);
        script.borrow_mut().push_packet(block(2));
        let state = StreamState::new();
        let cancel = state.handle();
        let mut decoder = SampleDecoder::new();
        let mut sizes = Vec::new();

        engine(&script, &mut decoder, &state)
            .run(|batch| {
                sizes.push((batch.len(), batch.byte_len()));
                let _ = cancel.cancel();
            })
            .unwrap();

        assert_eq!(sizes, vec![(3 * SAMPLES_PER_BLOCK, 6 * SAMPLES_PER_BLOCK)]);
    }

    #[test]
    fn failed_packets_are_dropped_silently() {
        let script = RefCell::new(MockStreamScript::default());
        script.borrow_mut().push_failed_packet(TransferStatus::Error);
        script.borrow_mut().push_packet(block(0));
        let state = StreamState::new();
        let cancel = state.handle();
        let mut decoder = SampleDecoder::new();
        let mut total = 0;

        let report = engine(&script, &mut decoder, &state)
            .run(|batch| {
                total += batch.len();
                let _ = cancel.cancel();
            })
            .unwrap();

        assert_eq!(total, SAMPLES_PER_BLOCK);
        assert_eq!(report.dropped_packets, 1);
    }

    #[test]
    fn bytes_are_little_endian_samples() {
        let script = RefCell::new(MockStreamScript::default());
        let mut b = block(0);
        // first subgroup, sample3 = 0x0100 after the no-shift flag below
        b[16 + 4] = 0x01;
        let flags = 16 + 160;
        b[flags..flags + 4].copy_from_slice(&[0xff; 4]);
        script.borrow_mut().push_packet(b);
        let state = StreamState::new();
        let cancel = state.handle();
        let mut decoder = SampleDecoder::new();
        let mut first = Vec::new();

        engine(&script, &mut decoder, &state)
            .run(|batch| {
                first = batch.as_bytes()[..8].to_vec();
                let _ = cancel.cancel();
            })
            .unwrap();

        assert_eq!(first, vec![0, 0, 0, 0, 0, 0, 0x00, 0x01]);
    }

    #[test]
    fn poll_timeouts_and_signals_are_retried() {
        let script = RefCell::new(MockStreamScript::default());
        script.borrow_mut().push_packet(block(0));
        script
            .borrow_mut()
            .poll_errors
            .extend([PollError::Timeout, PollError::Interrupted]);
        let state = StreamState::new();
        let cancel = state.handle();
        let mut decoder = SampleDecoder::new();

        let report = engine(&script, &mut decoder, &state)
            .run(|_| {
                let _ = cancel.cancel();
            })
            .unwrap();
        assert_eq!(report.batches, 1);
    }

    #[test]
    fn fatal_poll_error_ends_session_with_fault() {
        let script = RefCell::new(MockStreamScript::default());
        script.borrow_mut().poll_errors.push_back(PollError::Fatal(-99));
        let state = StreamState::new();
        let mut decoder = SampleDecoder::new();

        let err = engine(&script, &mut decoder, &state).run(|_| {}).unwrap_err();
        assert!(matches!(err, StreamError::Poll(-99)));
        assert_eq!(state.status(), StreamStatus::Inactive);
    }

    #[test]
    fn resubmit_failure_is_fatal() {
        let script = RefCell::new(MockStreamScript::default());
        script.borrow_mut().max_submits = Some(4);
        let state = StreamState::new();
        let mut decoder = SampleDecoder::new();

        let err = engine(&script, &mut decoder, &state).run(|_| {}).unwrap_err();
        assert!(matches!(err, StreamError::Submit { slot: 0, .. }), "{err}");
        assert_eq!(state.status(), StreamStatus::Inactive);
    }

    #[test]
    fn initial_submit_failure_returns_error() {
        let script = RefCell::new(MockStreamScript::default());
        script.borrow_mut().max_submits = Some(2);
        let state = StreamState::new();
        let mut decoder = SampleDecoder::new();

        let err = engine(&script, &mut decoder, &state).run(|_| {}).unwrap_err();
        assert!(matches!(err, StreamError::Submit { slot: 2, .. }));
        // the two submitted transfers were cancelled and drained
        assert_eq!(script.borrow().cancels, 2);
        assert_eq!(state.status(), StreamStatus::Inactive);
    }

    #[test]
    fn refuses_to_start_twice() {
        let script = RefCell::new(MockStreamScript::default());
        let state = StreamState::new();
        state.set(StreamStatus::Running);
        let mut decoder = SampleDecoder::new();
        let err = engine(&script, &mut decoder, &state).run(|_| {}).unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning));
        assert_eq!(script.borrow().submits, 0);
    }

    #[test]
    fn cancel_when_inactive_reports_not_running() {
        let state = StreamState::new();
        assert!(matches!(state.handle().cancel(), Err(StreamError::NotRunning)));
        assert_eq!(state.status(), StreamStatus::Inactive);
    }

    #[test]
    fn options_validate_buffer_length() {
        let opts = StreamOptions {
            buffer_length: Some(1000),
            ..Default::default()
        };
        assert!(matches!(opts.layout(), Err(StreamError::InvalidBufferLength(1000))));

        let opts = StreamOptions {
            buffer_length: Some(0),
            ..Default::default()
        };
        assert!(opts.layout().is_err());

        let opts = StreamOptions {
            buffer_length: Some(512 * 8),
            ..Default::default()
        };
        assert_eq!(opts.layout().unwrap(), PoolLayout::default());
    }

    #[test]
    fn options_honor_buffer_count() {
        let opts = StreamOptions {
            buffer_count: Some(4),
            ..Default::default()
        };
        assert_eq!(opts.layout().unwrap().transfers, 4);

        let opts = StreamOptions {
            buffer_count: Some(0),
            ..Default::default()
        };
        assert_eq!(opts.layout().unwrap().transfers, 32);
    }

    #[test]
    fn report_serializes_counters() {
        let report = StreamReport {
            transfers: 3,
            samples: 2304,
            lost_sample_events: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["transfers"], 3);
        assert_eq!(json["samples"], 2304);
        assert_eq!(json["lost_sample_events"], 1);
        assert_eq!(json["dropped_packets"], 0);
        assert_eq!(serde_json::to_value(StreamStatus::Canceling).unwrap(), "Canceling");
    }
}
