//! Device session: one open receiver with its tuner, decoder and stream state.
//!
//! Configuration calls (`set_center_frequency`, gains, sample rate) go
//! straight to the tuner over the register bus. Streaming either blocks the
//! caller in [`Session::start_streaming`] or runs on a worker thread via
//! [`Session::spawn_stream`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, TrySendError};
use serde::Serialize;

use crate::decoder::SampleDecoder;
use crate::device::{LibusbDevice, SdrDevice, UsbStrings};
use crate::error::{MirisdrError, Result};
use crate::protocol::{
    BASEBAND_INIT, DEFAULT_ADC_CLOCK_HZ, LED_CONTROL_LOCK_OFF, REG_LED_CONTROL,
    REQUEST_BASEBAND_RESET, STREAM_ALT_SETTING,
};
use crate::stream::{
    CancelHandle, SampleBatch, StreamError, StreamOptions, StreamReport, StreamState,
    StreamStatus, StreamingEngine,
};
use crate::tuner::{Msi001, Tuner, TunerState};

/// Poll interval while waiting for a stream worker to start.
const STARTUP_POLL: Duration = Duration::from_millis(1);

/// Result of a sample-rate change.
///
/// The ADC clock is never reprogrammed; `adc_reprogrammed` says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRateUpdate {
    pub rate: u32,
    pub adc_reprogrammed: bool,
}

pub struct Session<D: SdrDevice = LibusbDevice> {
    device: D,
    tuner: Box<dyn Tuner>,
    decoder: SampleDecoder,
    state: StreamState,
    freq: u32,
    rate: u32,
    gain: i32,
    manual_gain: bool,
    adc_clock: u32,
    closed: bool,
}

impl Session<LibusbDevice> {
    /// Open the `index`-th attached receiver and bring it up.
    pub fn open(index: usize) -> Result<Self> {
        let device = LibusbDevice::open(index)?;
        Self::with_device(device)
    }
}

impl<D: SdrDevice> Session<D> {
    /// Bring up an already-opened device.
    ///
    /// On failure the interface is released again and no session exists.
    pub fn with_device(mut device: D) -> Result<Self> {
        device.claim_interface()?;
        let mut tuner: Box<dyn Tuner> = Box::new(Msi001::default());

        if let Err(e) = bring_up(&mut device, tuner.as_mut()) {
            if let Err(release) = device.release_interface() {
                log::debug!("{release}");
            }
            return Err(e);
        }
        log::info!("opened {} ({}, tuner {})", device.info().path(), device.info().name, tuner.name());

        Ok(Session {
            device,
            tuner,
            decoder: SampleDecoder::new(),
            state: StreamState::new(),
            freq: 0,
            rate: 0,
            gain: 0,
            manual_gain: false,
            adc_clock: DEFAULT_ADC_CLOCK_HZ,
            closed: false,
        })
    }

    /// Power down the tuner path and release the interface.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let led = self.device.write_register(REG_LED_CONTROL, LED_CONTROL_LOCK_OFF);
        let tuner = self.tuner.exit(&self.device);
        let release = self.device.release_interface();
        led?;
        tuner?;
        release?;
        log::debug!("closed {}", self.device.info().path());
        Ok(())
    }

    // ── Identity ──

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.device.info().name
    }

    pub fn usb_strings(&self) -> Result<UsbStrings> {
        Ok(self.device.usb_strings()?)
    }

    pub fn tuner_name(&self) -> &'static str {
        self.tuner.name()
    }

    pub fn tuner_state(&self) -> Option<&TunerState> {
        self.tuner.state()
    }

    // ── Tuning ──

    /// Tune to `hz`. Returns the synthesized frequency.
    ///
    /// On failure the previous frequency stays recorded.
    pub fn set_center_frequency(&mut self, hz: u32) -> Result<u32> {
        let effective = self.tuner.set_frequency(&self.device, hz)?;
        self.freq = hz;
        Ok(effective)
    }

    /// Last successfully set frequency, 0 if none.
    pub fn center_frequency(&self) -> u32 {
        self.freq
    }

    /// Gain in tenths of a dB.
    pub fn set_tuner_gain(&mut self, gain: i32) -> Result<()> {
        self.tuner.set_gain(&self.device, gain)?;
        self.gain = gain;
        Ok(())
    }

    pub fn tuner_gain(&self) -> i32 {
        self.gain
    }

    pub fn set_tuner_gain_mode(&mut self, manual: bool) -> Result<()> {
        self.tuner.set_gain_mode(&self.device, manual)?;
        self.manual_gain = manual;
        Ok(())
    }

    pub fn tuner_gain_mode(&self) -> bool {
        self.manual_gain
    }

    pub fn tuner_gains(&self) -> &'static [i32] {
        self.tuner.gains()
    }

    /// Record a sample rate and pass it to the tuner as a bandwidth hint.
    ///
    /// The ADC keeps running at [`Session::adc_clock`].
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<SampleRateUpdate> {
        if rate == 0 {
            return Err(MirisdrError::Config("sample rate cannot be zero".into()));
        }
        self.tuner.set_bandwidth(&self.device, rate)?;
        self.rate = rate;
        log::warn!(
            "sample rate {rate} Hz recorded; ADC rate programming is not implemented (still {} Hz)",
            self.adc_clock
        );
        Ok(SampleRateUpdate {
            rate,
            adc_reprogrammed: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    pub fn adc_clock(&self) -> u32 {
        self.adc_clock
    }

    pub fn reset_buffer(&mut self) -> Result<()> {
        Err(MirisdrError::Unsupported("buffer reset"))
    }

    pub fn read_sync(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(MirisdrError::Unsupported("synchronous read"))
    }

    // ── Streaming ──

    pub fn stream_status(&self) -> StreamStatus {
        self.state.status()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.state.handle()
    }

    /// Ask a running stream to stop. Returns immediately.
    pub fn cancel_streaming(&self) -> Result<()> {
        Ok(self.state.handle().cancel()?)
    }

    /// Stream until cancelled or a fatal fault, calling `callback` once per
    /// completed transfer on this thread.
    pub fn start_streaming<F>(&mut self, callback: F, options: StreamOptions) -> Result<StreamReport>
    where
        F: FnMut(SampleBatch<'_>),
    {
        let layout = options.layout()?;
        if self.state.status() != StreamStatus::Inactive {
            return Err(StreamError::AlreadyRunning.into());
        }
        self.decoder.reset();

        let engine = StreamingEngine::new(
            self.device.transport(),
            &mut self.decoder,
            self.state.clone(),
            layout,
        );
        let report = engine.run(callback)?;
        log::debug!(
            "stream ended: {} transfers, {} samples, {} dropped packets",
            report.transfers,
            report.samples,
            report.dropped_packets
        );
        Ok(report)
    }
}

impl<D: SdrDevice + Send + 'static> Session<D> {
    /// Move the session onto a worker thread and stream from there.
    ///
    /// Returns once the worker is streaming (or has already failed), so a
    /// `cancel` on the result is never lost. Batches are queued on a channel
    /// holding at most `depth` of them; when the consumer falls behind, new
    /// batches are dropped and counted.
    pub fn spawn_stream(self, options: StreamOptions, depth: usize) -> Result<SampleStream<D>> {
        options.layout()?;
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        let cancel = self.cancel_handle();
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = {
            let cancel = cancel.clone();
            let dropped = Arc::clone(&dropped);
            let mut session = self;
            thread::Builder::new()
                .name("mirisdr-stream".into())
                .spawn(move || {
                    let result = session.start_streaming(
                        |batch| match tx.try_send(batch.samples().to_vec()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                let _ = cancel.cancel();
                            }
                        },
                        options,
                    );
                    (session, result)
                })?
        };

        while cancel.status() == StreamStatus::Inactive && !worker.is_finished() {
            thread::sleep(STARTUP_POLL);
        }

        Ok(SampleStream {
            rx,
            cancel,
            dropped,
            worker: Some(worker),
        })
    }
}

impl<D: SdrDevice> Drop for Session<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::debug!("close: {e}");
        }
    }
}

fn bring_up<D: SdrDevice>(device: &mut D, tuner: &mut dyn Tuner) -> Result<()> {
    device.vendor_request(REQUEST_BASEBAND_RESET, 0, 0)?;
    for &(reg, value) in BASEBAND_INIT {
        device.write_register(reg, value)?;
    }
    tuner.init(&*device)?;
    device.set_alt_setting(STREAM_ALT_SETTING)?;
    Ok(())
}

/// Decoded batches from a session streaming on a worker thread.
///
/// Iterating blocks until the next batch and ends when the worker stops.
pub struct SampleStream<D: SdrDevice + Send + 'static> {
    rx: Receiver<Vec<i16>>,
    cancel: CancelHandle,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<(Session<D>, Result<StreamReport>)>>,
}

impl<D: SdrDevice + Send + 'static> SampleStream<D> {
    /// Signal the worker to stop. Batches already queued stay readable.
    pub fn cancel(&self) {
        let _ = self.cancel.cancel();
    }

    pub fn status(&self) -> StreamStatus {
        self.cancel.status()
    }

    /// Batches discarded because the channel was full.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker, wait for it and take the session back.
    pub fn finish(mut self) -> (Session<D>, Result<StreamReport>) {
        match self.worker.take() {
            Some(worker) => join_worker(worker, &self.cancel),
            // Only `finish` and `drop` take the worker, and both consume self.
            None => unreachable!("sample stream already finished"),
        }
    }
}

impl<D: SdrDevice + Send + 'static> Iterator for SampleStream<D> {
    type Item = Vec<i16>;

    fn next(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().ok()
    }
}

impl<D: SdrDevice + Send + 'static> Drop for SampleStream<D> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.cancel.cancel();
        match worker.join() {
            Ok((_session, Err(e))) => log::debug!("stream worker: {e}"),
            Ok(_) => {}
            Err(_) => log::warn!("stream worker panicked"),
        }
    }
}

fn join_worker<T>(
    worker: JoinHandle<(T, Result<StreamReport>)>,
    cancel: &CancelHandle,
) -> (T, Result<StreamReport>) {
    let _ = cancel.cancel();
    match worker.join() {
        Ok(out) => out,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
