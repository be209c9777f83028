use super::{FrameSize, PipelineError, SpectrumOutput, SpectrumSnapshot};
use crate::audio::AudioSource;
use crate::fft::{self, Radix2};
use crate::spectrum;
use crate::window::Window;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Weight of the newest loudness reading against the published value.
const LOUDNESS_SMOOTHING: f32 = 0.2;
/// Weight of the newest spectrum against the published bins.
const SPECTRUM_SMOOTHING: f32 = 0.3;

/// Raw-sample amplitude below which a frame counts as carrying no signal.
const SILENCE_THRESHOLD: f32 = 0.0001;
/// How long the input must stay below the threshold before the published
/// snapshot is flagged silent.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// A device that stays empty this long mid-frame is treated as failed.
const READ_STALL_TIMEOUT: Duration = Duration::from_secs(2);
const READ_RETRY: Duration = Duration::from_millis(1);

/// Granularity at which sleeps notice a stop request.
const STOP_POLL: Duration = Duration::from_millis(5);

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// One capture session: owns the device, the analysis buffers, and the
/// smoothing state, and publishes a snapshot per processed frame.
///
/// Everything here is tied to one frame size; a reconfiguration tears the
/// session down and builds a new one.
pub(crate) struct CaptureLoop {
    source: Box<dyn AudioSource>,
    window: Window,
    plan: Arc<Radix2>,
    output: SpectrumOutput,
    stop: Arc<AtomicBool>,

    frame_size: usize,
    sample_rate: u32,
    frame_interval: Duration,

    //
    // Reused per-iteration buffers; nothing is allocated on the hot path
    // except the published snapshot itself.
    //
    frame: Vec<f32>,
    re: Vec<f32>,
    im: Vec<f32>,
    bins: Vec<f32>,

    //
    // Smoothing and silence-detection state.
    //
    smoothed: Vec<f32>,
    loudness: f32,
    seeded: bool,
    last_signal: Instant,
    silent: bool,

    frames_processed: usize,
    last_stats: Instant,
}

impl CaptureLoop {
    pub(crate) fn new(
        source: Box<dyn AudioSource>,
        frame_size: FrameSize,
        output: SpectrumOutput,
        stop: Arc<AtomicBool>,
        frame_interval: Duration,
    ) -> Self {
        let n = frame_size.samples();
        let sample_rate = source.sample_rate();

        // Supported frame sizes are powers of two by construction.
        let plan = fft::find_plan(n).expect("frame sizes are powers of two");

        Self {
            source,
            window: Window::hann(n),
            plan,
            output,
            stop,
            frame_size: n,
            sample_rate,
            frame_interval,
            frame: vec![0.0; n],
            re: vec![0.0; n],
            im: vec![0.0; n],
            bins: vec![0.0; frame_size.bins()],
            smoothed: vec![0.0; frame_size.bins()],
            loudness: spectrum::DB_FLOOR,
            seeded: false,
            last_signal: Instant::now(),
            silent: true,
            frames_processed: 0,
            last_stats: Instant::now(),
        }
    }

    /// Runs until a stop is requested (`Ok`) or the device fails (`Err`).
    /// The device is released when the loop returns, in either case.
    pub(crate) fn run(mut self) -> Result<(), PipelineError> {
        log::info!(
            "capture loop started: frame size {}, {} Hz",
            self.plan.size(),
            self.sample_rate
        );

        loop {
            if !self.fill_frame()? {
                return Ok(());
            }

            self.process_frame();

            if self.pause() {
                return Ok(());
            }
        }
    }

    //
    // Blocks until the frame buffer holds exactly N samples, retrying
    // partial reads. Returns Ok(false) when a stop was requested mid-fill.
    //
    fn fill_frame(&mut self) -> Result<bool, PipelineError> {
        let mut filled = 0;
        let mut deadline = Instant::now() + READ_STALL_TIMEOUT;

        while filled < self.frame_size {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(false);
            }

            let got = self
                .source
                .read(&mut self.frame[filled..])
                .map_err(|e| PipelineError::UnavailableDevice(e.to_string()))?;

            if got == 0 {
                if Instant::now() >= deadline {
                    return Err(PipelineError::UnavailableDevice(
                        "input stream stalled".into(),
                    ));
                }
                thread::sleep(READ_RETRY);
            } else {
                filled += got;
                deadline = Instant::now() + READ_STALL_TIMEOUT;
            }
        }

        Ok(true)
    }

    fn process_frame(&mut self) {
        //
        // Instantaneous loudness over the raw (unwindowed) frame.
        //
        let loudness = spectrum::rms_dbfs(&self.frame);
        self.loudness = if self.seeded {
            LOUDNESS_SMOOTHING * loudness + (1.0 - LOUDNESS_SMOOTHING) * self.loudness
        } else {
            loudness
        };

        //
        // Silence detection (amplitude threshold, 2-second timeout).
        //
        let peak = self.frame.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        if peak > SILENCE_THRESHOLD {
            self.last_signal = Instant::now();
            self.silent = false;
        } else if self.last_signal.elapsed() > SILENCE_TIMEOUT {
            self.silent = true;
        }

        //
        // Windowed frame into the real channel; imaginary channel zeroed.
        //
        self.window.apply(&self.frame, &mut self.re);
        self.im.fill(0.0);

        self.plan.process(&mut self.re, &mut self.im);

        spectrum::convert(&self.re, &self.im, self.window.coherent_gain(), &mut self.bins);

        //
        // Bin-wise smoothing against the previous published spectrum; the
        // first frame seeds the state directly.
        //
        if self.seeded {
            smooth_into(&mut self.smoothed, &self.bins, SPECTRUM_SMOOTHING);
        } else {
            self.smoothed.copy_from_slice(&self.bins);
        }
        self.seeded = true;

        self.output.publish(SpectrumSnapshot {
            frame_size: self.frame_size,
            sample_rate: self.sample_rate,
            bins: self.smoothed.clone(),
            loudness: self.loudness,
            silent: self.silent,
        });

        //
        // Periodic DSP statistics logging.
        //
        self.frames_processed += 1;
        if self.last_stats.elapsed() > STATS_INTERVAL {
            log::info!(
                "DSP | Frames: {} | Loudness: {:.1} dBFS | Silent: {}",
                self.frames_processed,
                self.loudness,
                self.silent
            );
            self.frames_processed = 0;
            self.last_stats = Instant::now();
        }
    }

    //
    // Inter-frame delay, taken in slices so a stop request is honored
    // within STOP_POLL. Returns true when a stop was requested.
    //
    fn pause(&self) -> bool {
        let mut remaining = self.frame_interval;

        while !remaining.is_zero() {
            if self.stop.load(Ordering::Relaxed) {
                return true;
            }
            let slice = remaining.min(STOP_POLL);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }

        self.stop.load(Ordering::Relaxed)
    }
}

/// Exponential smoothing of `next` into `prev`, bin by bin.
fn smooth_into(prev: &mut [f32], next: &[f32], alpha: f32) {
    debug_assert_eq!(prev.len(), next.len());

    for (p, &x) in prev.iter_mut().zip(next) {
        *p = alpha * x + (1.0 - alpha) * *p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioError;
    use crate::pipeline::testing::ToneSource;
    use crate::pipeline::FrameSize;

    struct FailingSource;

    impl AudioSource for FailingSource {
        fn read(&mut self, _buf: &mut [f32]) -> Result<usize, AudioError> {
            Err(AudioError::ReadFailed("synthetic fault".into()))
        }

        fn sample_rate(&self) -> u32 {
            44100
        }
    }

    struct StalledSource;

    impl AudioSource for StalledSource {
        fn read(&mut self, _buf: &mut [f32]) -> Result<usize, AudioError> {
            Ok(0)
        }

        fn sample_rate(&self) -> u32 {
            44100
        }
    }

    //
    // The loop owns a non-Send source (live streams must stay on their
    // thread), so the session is assembled inside the capture thread.
    //
    fn run_for<F>(
        make_source: F,
        frame_size: FrameSize,
        duration: Duration,
    ) -> (SpectrumOutput, Result<(), PipelineError>)
    where
        F: FnOnce() -> Box<dyn AudioSource> + Send + 'static,
    {
        let output = SpectrumOutput::new();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_output = output.clone();
        let thread_stop = stop.clone();

        let handle = thread::spawn(move || {
            CaptureLoop::new(
                make_source(),
                frame_size,
                thread_output,
                thread_stop,
                Duration::ZERO,
            )
            .run()
        });

        thread::sleep(duration);
        stop.store(true, Ordering::Relaxed);
        let result = handle.join().unwrap();

        (output, result)
    }

    #[test]
    fn smoothing_converges_without_overshoot() {
        let target = vec![0.0f32; 8];
        let mut state = vec![spectrum::DB_FLOOR; 8];
        let mut previous = state[0];

        for _ in 0..100 {
            smooth_into(&mut state, &target, SPECTRUM_SMOOTHING);
            assert!(state[0] >= previous, "smoothing moved away from target");
            assert!(state[0] <= 0.0, "smoothing overshot the target");
            previous = state[0];
        }

        assert!(state.iter().all(|&v| v.abs() < 1e-3));
    }

    #[test]
    fn silence_publishes_floor_spectrum() {
        let (output, result) = run_for(
            || Box::new(ToneSource::new(44100, 1000.0, 0.0)),
            FrameSize::N1024,
            Duration::from_millis(50),
        );
        assert!(result.is_ok());

        // Smoothing of repeated floor values stays at the floor up to
        // rounding of the blend weights.
        let snapshot = output.latest().expect("no snapshot published");
        assert_eq!(snapshot.frame_size, 1024);
        assert_eq!(snapshot.bins.len(), 512);
        assert!(snapshot
            .bins
            .iter()
            .all(|&db| (db - spectrum::DB_FLOOR).abs() < 0.01));
        assert!((snapshot.loudness - spectrum::DB_FLOOR).abs() < 0.01);
        assert!(snapshot.silent);
    }

    #[test]
    fn tone_shows_up_at_its_bin() {
        // 1 kHz at amplitude 0.5, frame size 2048 @ 44100 Hz.
        let (output, result) = run_for(
            || Box::new(ToneSource::new(44100, 1000.0, 0.5)),
            FrameSize::N2048,
            Duration::from_millis(300),
        );
        assert!(result.is_ok());

        let snapshot = output.latest().expect("no snapshot published");
        assert_eq!(snapshot.sample_rate, 44100);
        assert!(!snapshot.silent);

        let expected_bin = (1000.0f32 / (44100.0 / 2048.0)).round() as usize;
        let (peak_bin, peak_db) = snapshot
            .bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &v)| (i, v))
            .unwrap();

        assert_eq!(peak_bin, expected_bin);
        assert!(peak_db < -5.9 && peak_db > -7.6, "peak at {} dB", peak_db);

        // RMS of a 0.5-amplitude sine is 0.5/√2 ≈ -9.03 dBFS.
        assert!((snapshot.loudness - (-9.03)).abs() < 0.5);
    }

    #[test]
    fn read_error_surfaces_as_device_fault() {
        let output = SpectrumOutput::new();
        let stop = Arc::new(AtomicBool::new(false));
        let capture = CaptureLoop::new(
            Box::new(FailingSource),
            FrameSize::N512,
            output,
            stop,
            Duration::ZERO,
        );

        match capture.run() {
            Err(PipelineError::UnavailableDevice(_)) => {}
            other => panic!("expected device fault, got {:?}", other),
        }
    }

    #[test]
    fn stalled_device_times_out() {
        let output = SpectrumOutput::new();
        let stop = Arc::new(AtomicBool::new(false));
        let capture = CaptureLoop::new(
            Box::new(StalledSource),
            FrameSize::N512,
            output,
            stop,
            Duration::ZERO,
        );

        let started = Instant::now();
        match capture.run() {
            Err(PipelineError::UnavailableDevice(_)) => {}
            other => panic!("expected stall fault, got {:?}", other),
        }
        assert!(started.elapsed() >= READ_STALL_TIMEOUT);
    }

    #[test]
    fn stop_interrupts_a_blocked_fill() {
        let output = SpectrumOutput::new();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::spawn(move || {
            CaptureLoop::new(
                Box::new(StalledSource),
                FrameSize::N512,
                output,
                thread_stop,
                Duration::ZERO,
            )
            .run()
        });

        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);

        let started = Instant::now();
        assert!(handle.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
