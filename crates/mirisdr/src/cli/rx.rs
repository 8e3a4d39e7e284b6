//! `rx` subcommand: tune, then stream raw samples to a file or stdout.
//!
//! Samples are written as little-endian signed 16-bit words, interleaved
//! exactly as the bridge delivers them. The stream stops after `--samples`
//! samples, on Ctrl+C, or on a fatal transport fault.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use super::{
    ACTIVE_STREAM, CancelHandle, Config, MirisdrError, RUNNING, Result, RxOutput, Session,
    StreamOptions, StreamReport, format_hz, kv, kv_width, to_json,
};

pub(super) struct RxArgs {
    pub output: String,
    pub freq: Option<u32>,
    pub rate: Option<u32>,
    pub gain: Option<i32>,
    pub samples: Option<u64>,
    pub buffers: Option<u32>,
    pub index: Option<usize>,
}

impl RxArgs {
    /// Fold command-line overrides into the loaded config.
    fn apply(&self, mut config: Config) -> Config {
        if let Some(index) = self.index {
            config.device_index = index;
        }
        if let Some(freq) = self.freq {
            config.center_frequency = freq;
        }
        if let Some(rate) = self.rate {
            config.sample_rate = rate;
        }
        if let Some(gain) = self.gain {
            config.gain = gain;
            config.manual_gain = true;
        }
        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        config
    }

    fn to_stdout(&self) -> bool {
        self.output == "-"
    }
}

fn open_output(path: &str) -> io::Result<Box<dyn Write>> {
    if path == "-" {
        Ok(Box::new(BufWriter::new(io::stdout().lock())))
    } else {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

/// Bytes of `bytes` to keep so that no more than `remaining` samples go out.
fn clamp_to_remaining(bytes: &[u8], remaining: Option<u64>) -> &[u8] {
    match remaining {
        Some(n) => {
            let limit = usize::try_from(n.saturating_mul(2)).unwrap_or(usize::MAX);
            &bytes[..bytes.len().min(limit)]
        }
        None => bytes,
    }
}

fn set_active_stream(handle: Option<CancelHandle>) {
    if let Ok(mut guard) = ACTIVE_STREAM.lock() {
        *guard = handle;
    }
}

pub(super) fn cmd_rx(args: RxArgs, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = args.apply(super::load_config(config_path));
    if let Err(problems) = config.validate() {
        let joined: Vec<String> = problems.iter().map(ToString::to_string).collect();
        return Err(MirisdrError::Config(joined.join("; ")));
    }
    let options: StreamOptions = config.stream_options();

    let mut session = Session::open(config.device_index)?;
    if config.manual_gain {
        session.set_tuner_gain_mode(true)?;
        session.set_tuner_gain(config.gain)?;
    }
    let rate = session.set_sample_rate(config.sample_rate)?;
    let tuned = session.set_center_frequency(config.center_frequency)?;
    log::info!(
        "tuned {} (requested {})",
        format_hz(f64::from(tuned)),
        format_hz(f64::from(config.center_frequency))
    );

    let mut out = open_output(&args.output)?;
    let cancel = session.cancel_handle();
    set_active_stream(Some(cancel.clone()));

    let mut written: u64 = 0;
    let mut write_error: Option<io::Error> = None;
    let result = if RUNNING.load(Ordering::SeqCst) {
        session.start_streaming(
            |batch| {
                if write_error.is_some() {
                    return;
                }
                let remaining = args.samples.map(|limit| limit.saturating_sub(written));
                let bytes = clamp_to_remaining(batch.as_bytes(), remaining);
                if let Err(e) = out.write_all(bytes) {
                    write_error = Some(e);
                    let _ = cancel.cancel();
                    return;
                }
                written += (bytes.len() / 2) as u64;
                let done = args.samples.is_some_and(|limit| written >= limit);
                if done || !RUNNING.load(Ordering::SeqCst) {
                    let _ = cancel.cancel();
                }
            },
            options,
        )
    } else {
        Ok(StreamReport::default())
    };
    set_active_stream(None);

    let report = result?;
    // A closed pipe on stdout is a normal way to stop a capture.
    let pipe_closed = |e: &io::Error| args.to_stdout() && e.kind() == io::ErrorKind::BrokenPipe;
    if let Some(e) = write_error
        && !pipe_closed(&e)
    {
        return Err(e.into());
    }
    if let Err(e) = out.flush()
        && !pipe_closed(&e)
    {
        return Err(e.into());
    }
    drop(out);
    session.close()?;

    let summary = RxOutput {
        output: args.output.clone(),
        center_frequency: tuned,
        sample_rate: rate,
        samples_written: written,
        interrupted: !RUNNING.load(Ordering::SeqCst),
        report,
    };
    print_summary(&summary, json, args.to_stdout())
}

/// Report goes to stderr when the samples themselves went to stdout.
fn print_summary(summary: &RxOutput, json: bool, samples_on_stdout: bool) -> Result<()> {
    if json {
        let text = to_json(summary)?;
        if samples_on_stdout {
            eprintln!("{text}");
        } else {
            println!("{text}");
        }
        return Ok(());
    }

    if samples_on_stdout {
        let r = &summary.report;
        eprintln!(
            "{} samples written, {} transfers, {} dropped packets, {} lost-sample events",
            summary.samples_written, r.transfers, r.dropped_packets, r.lost_sample_events
        );
        return Ok(());
    }

    let r = &summary.report;
    let w = kv_width(
        &[
            "Output:",
            "Frequency:",
            "Sample rate:",
            "Samples:",
            "Transfers:",
            "Dropped packets:",
            "Lost samples:",
            "Parity changes:",
        ],
        &[],
    );
    kv("Output:", &summary.output, w);
    kv("Frequency:", format_hz(f64::from(summary.center_frequency)), w);
    let rate_note = if summary.sample_rate.adc_reprogrammed {
        ""
    } else {
        " (recorded only)"
    };
    kv(
        "Sample rate:",
        format_args!("{}{rate_note}", format_hz(f64::from(summary.sample_rate.rate))),
        w,
    );
    kv("Samples:", summary.samples_written, w);
    kv("Transfers:", r.transfers, w);
    kv("Dropped packets:", r.dropped_packets, w);
    kv("Lost samples:", r.lost_sample_events, w);
    kv("Parity changes:", r.parity_events, w);
    if summary.interrupted {
        println!();
        println!("Interrupted.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RxArgs {
        RxArgs {
            output: "-".into(),
            freq: None,
            rate: None,
            gain: None,
            samples: None,
            buffers: None,
            index: None,
        }
    }

    #[test]
    fn no_overrides_keeps_config() {
        let config = args().apply(Config::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn overrides_replace_config_values() {
        let a = RxArgs {
            freq: Some(433_920_000),
            rate: Some(2_048_000),
            buffers: Some(8),
            index: Some(1),
            ..args()
        };
        let config = a.apply(Config::default());
        assert_eq!(config.center_frequency, 433_920_000);
        assert_eq!(config.sample_rate, 2_048_000);
        assert_eq!(config.buffer_count, 8);
        assert_eq!(config.device_index, 1);
        assert!(!config.manual_gain);
    }

    #[test]
    fn gain_override_enables_manual_gain() {
        let a = RxArgs {
            gain: Some(290),
            ..args()
        };
        let config = a.apply(Config::default());
        assert_eq!(config.gain, 290);
        assert!(config.manual_gain);
    }

    #[test]
    fn clamp_limits_to_whole_samples() {
        let bytes = [0u8; 16];
        assert_eq!(clamp_to_remaining(&bytes, None).len(), 16);
        assert_eq!(clamp_to_remaining(&bytes, Some(3)).len(), 6);
        assert_eq!(clamp_to_remaining(&bytes, Some(100)).len(), 16);
        assert!(clamp_to_remaining(&bytes, Some(0)).is_empty());
    }

    #[test]
    fn stdout_marker() {
        assert!(args().to_stdout());
        let a = RxArgs {
            output: "capture.raw".into(),
            ..args()
        };
        assert!(!a.to_stdout());
    }
}
