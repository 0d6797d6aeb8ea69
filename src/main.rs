// src/main.rs
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use bci_input::{
    BciInput, BciReader, BrainFlowSource, ConnectionState, KeybindMap, ReaderConfig,
    ReadingRecorder, SampleSource, SimulatedMuscles, SimulatedSource,
};

/// ~30 Hz, the frame rate the refresh ratings assume.
const FRAME: Duration = Duration::from_millis(33);
const PROBE_WINDOW: usize = 20;
const SIMULATED_SEED: u64 = 0x5EED;

/// Headless tick loop around a BCI reader.
#[derive(Parser, Debug)]
#[command(name = "bci_input", about = "Reads EMG activations from an OpenBCI board")]
struct Args {
    /// JSON reader config; defaults are used when omitted
    config: Option<PathBuf>,
    /// Use the simulated board instead of BrainFlow
    #[arg(long)]
    simulate: bool,
    /// Run the rest/flex calibration once the link is live
    #[arg(long)]
    calibrate: bool,
    /// Measure how fast the board refreshes its sample window
    #[arg(long)]
    probe: bool,
    /// Write per-tick readings to this CSV file
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,
    /// Stop after this many seconds
    #[arg(long, value_name = "N")]
    seconds: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => ReaderConfig::load(path)?,
        None => ReaderConfig::default(),
    };

    if args.simulate {
        info!("using simulated board");
        let source = SimulatedSource::new(SIMULATED_SEED);
        let muscles = source.muscles();
        run(BciReader::new(source, cfg), &args, Some(muscles))
    } else {
        let source =
            BrainFlowSource::with_board_ids(cfg.link.serial_board_id, cfg.link.wireless_board_id);
        run(BciReader::new(source, cfg), &args, None)
    }
}

fn run<S: SampleSource>(
    mut reader: BciReader<S>,
    args: &Args,
    muscles: Option<SimulatedMuscles>,
) -> Result<()> {
    let started = Instant::now();
    if !reader.connect(started)? {
        bail!("no board connection could be made");
    }
    let mut recorder = match &args.record {
        Some(path) => {
            let rec = ReadingRecorder::create(path, started)
                .with_context(|| format!("cannot record to {}", path.display()))?;
            info!("recording readings to {}", path.display());
            Some(rec)
        }
        None => None,
    };
    if args.probe {
        reader.probe_refresh_rate(PROBE_WINDOW);
    }
    let keys = KeybindMap::car();
    let limit = args.seconds.map(Duration::from_secs);
    let mut calibration_pending = args.calibrate;
    let mut refresh_logged = false;
    let mut last_state = reader.connection_status();
    let mut last_axes = (0, 0);

    loop {
        let now = Instant::now();
        let state = reader.tick(now).context("board session failed")?;
        if state != last_state {
            info!("link {last_state} -> {state}");
            last_state = state;
        }
        if state == ConnectionState::Disconnected {
            warn!("board disconnected, call reconnect to try again");
            break;
        }

        if calibration_pending && state == ConnectionState::Connected {
            reader.start_calibration(now)?;
            calibration_pending = false;
        }
        if let Some(muscles) = &muscles {
            // Act out the prompts, or pulse steering once calibrated.
            match reader.calibration_phase() {
                Some(phase) => muscles.set_all(phase.is_flex()),
                None => {
                    muscles.set_all(false);
                    muscles.set(2, now.duration_since(started).as_secs() % 4 == 0);
                }
            }
        }
        if !refresh_logged {
            if let Some(report) = reader.refresh_report() {
                info!("{report}");
                refresh_logged = true;
            }
        }

        let axes = (keys.axis(&reader, "Horizontal"), keys.axis(&reader, "Vertical"));
        if axes != last_axes && reader.calibration_progress().is_none() {
            info!("steering {:+} throttle {:+}", axes.0, axes.1);
            last_axes = axes;
        }
        if let Some(rec) = recorder.as_mut() {
            if let Err(err) = rec.record(now, reader.classifier()) {
                warn!("recording stopped: {err}");
                recorder = None;
            }
        }

        if limit.map_or(false, |l| now.duration_since(started) >= l) {
            break;
        }
        thread::sleep(FRAME);
    }

    if let Some(report) = reader.last_calibration() {
        for (channel, fit) in report.channels.iter().enumerate() {
            match fit {
                Ok(fit) => info!(
                    "channel {channel}: threshold {:.3}, accuracy {:.1} %",
                    fit.threshold,
                    fit.accuracy * 100.0
                ),
                Err(err) => warn!("channel {channel}: {err}"),
            }
        }
    }
    if let Some(mut rec) = recorder {
        rec.stop().context("failed to flush recording")?;
        info!("recording saved ({} rows)", rec.rows());
    }
    reader.disconnect();
    Ok(())
}
