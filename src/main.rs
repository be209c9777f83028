mod audio;
mod fft;
mod pipeline;
mod spectrum;
mod window;

use audio::CpalOpener;
use pipeline::{FrameSize, Pipeline, SessionState};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    //
    // Initialize logging with default filter set to "info".
    //
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    //
    // Optional frame-size argument, e.g. `micanalyzer 4096`.
    //
    let frame_size = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<usize>().ok().and_then(FrameSize::from_samples) {
            Some(size) => size,
            None => {
                log::error!(
                    "unsupported frame size {:?}; choose one of 512, 1024, 2048, 4096, 8192",
                    arg
                );
                std::process::exit(2);
            }
        },
        None => FrameSize::default(),
    };

    log::info!(
        "Starting microphone spectrum analyzer (frame size {})...",
        frame_size.samples()
    );

    let mut pipeline = Pipeline::new(Arc::new(CpalOpener), frame_size);

    // Desktop environments grant microphone access up front; a mobile shell
    // would push grant/revoke transitions in here instead.
    pipeline.set_permission(true);

    if let Err(err) = pipeline.start() {
        log::error!("failed to start capture: {}", err);
        std::process::exit(1);
    }

    let output = pipeline.output();

    //
    // Report the published snapshot once per second until the process is
    // terminated or the session faults.
    //
    loop {
        thread::sleep(STATS_INTERVAL);

        if pipeline.state() != SessionState::Running {
            match pipeline.take_condition() {
                Some(condition) => log::error!("capture ended: {}", condition),
                None => log::error!("capture ended unexpectedly"),
            }
            std::process::exit(1);
        }

        if let Some(snapshot) = output.latest() {
            let (peak_bin, peak_db) = snapshot
                .bins
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, &v)| (i, v))
                .unwrap_or((0, spectrum::DB_FLOOR));

            let bin_hz = snapshot.sample_rate as f32 / snapshot.frame_size as f32;

            log::info!(
                "DSP | Peak: {:.0} Hz @ {:.1} dBFS | Loudness: {:.1} dBFS | Silent: {}",
                peak_bin as f32 * bin_hz,
                peak_db,
                snapshot.loudness,
                snapshot.silent
            );
        }
    }
}
