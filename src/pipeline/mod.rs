pub mod capture;

use crate::audio::{SourceOpener, SAMPLE_RATE_CANDIDATES};
use capture::CaptureLoop;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Delay between processed frames; bounds CPU use and the UI update rate.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(30);

/// How long `start` waits for the capture thread to report device
/// acquisition before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transform sizes selectable from the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameSize {
    N512,
    N1024,
    #[default]
    N2048,
    N4096,
    N8192,
}

impl FrameSize {
    pub const ALL: [FrameSize; 5] = [
        FrameSize::N512,
        FrameSize::N1024,
        FrameSize::N2048,
        FrameSize::N4096,
        FrameSize::N8192,
    ];

    pub fn samples(self) -> usize {
        match self {
            FrameSize::N512 => 512,
            FrameSize::N1024 => 1024,
            FrameSize::N2048 => 2048,
            FrameSize::N4096 => 4096,
            FrameSize::N8192 => 8192,
        }
    }

    /// Number of spectrum bins a frame of this size produces.
    pub fn bins(self) -> usize {
        self.samples() / 2
    }

    pub fn from_samples(n: usize) -> Option<FrameSize> {
        FrameSize::ALL.iter().copied().find(|f| f.samples() == n)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// The device could not be acquired, or failed mid-session. Not retried
    /// automatically; the user must restart explicitly.
    #[error("audio input device unavailable: {0}")]
    UnavailableDevice(String),

    /// Capture permission was revoked while a session was active.
    #[error("capture permission lost")]
    PermissionLost,

    /// `start` was called before permission was granted.
    #[error("capture permission has not been granted")]
    PermissionDenied,

    /// `start` was called outside the `Stopped` state.
    #[error("pipeline is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One published analysis result. Immutable once published; shared with
/// readers as an `Arc`, so a snapshot is always observed whole.
#[derive(Debug, Clone)]
pub struct SpectrumSnapshot {
    pub frame_size: usize,
    pub sample_rate: u32,
    /// `frame_size / 2` dBFS magnitudes covering 0..sample_rate/2.
    pub bins: Vec<f32>,
    /// Smoothed overall level in dBFS.
    pub loudness: f32,
    /// No signal above the detection threshold for a while.
    pub silent: bool,
}

/// Latest-wins handle shared between the capture loop (sole writer) and any
/// number of display readers.
///
/// Publication swaps an `Arc` under a lock held only for the swap, so a
/// reader either gets the previous snapshot or the new one, never a mix,
/// and the writer never waits on a reader's schedule.
#[derive(Clone)]
pub struct SpectrumOutput {
    slot: Arc<Mutex<Option<Arc<SpectrumSnapshot>>>>,
}

impl SpectrumOutput {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// The most recent complete snapshot, if any session has published one.
    pub fn latest(&self) -> Option<Arc<SpectrumSnapshot>> {
        self.slot.lock().clone()
    }

    pub(crate) fn publish(&self, snapshot: SpectrumSnapshot) {
        *self.slot.lock() = Some(Arc::new(snapshot));
    }
}

struct Worker {
    handle: thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owns the capture-session lifecycle: start/stop/reconfigure, permission
/// transitions, and the reportable condition of the last failure.
pub struct Pipeline {
    opener: Arc<dyn SourceOpener>,
    frame_size: FrameSize,
    permission_granted: bool,
    state: Arc<Mutex<SessionState>>,
    fault: Arc<Mutex<Option<PipelineError>>>,
    output: SpectrumOutput,
    worker: Option<Worker>,
}

impl Pipeline {
    /// Permission starts out not granted; the surrounding environment is
    /// the authority and pushes transitions in via `set_permission`.
    pub fn new(opener: Arc<dyn SourceOpener>, frame_size: FrameSize) -> Self {
        Self {
            opener,
            frame_size,
            permission_granted: false,
            state: Arc::new(Mutex::new(SessionState::Stopped)),
            fault: Arc::new(Mutex::new(None)),
            output: SpectrumOutput::new(),
            worker: None,
        }
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    /// Cloneable read handle for the display side.
    pub fn output(&self) -> SpectrumOutput {
        self.output.clone()
    }

    pub fn latest(&self) -> Option<Arc<SpectrumSnapshot>> {
        self.output.latest()
    }

    pub fn state(&mut self) -> SessionState {
        self.reap_finished();
        *self.state.lock()
    }

    /// The latest reportable condition, left in place.
    pub fn condition(&self) -> Option<PipelineError> {
        self.fault.lock().clone()
    }

    /// Takes and clears the latest reportable condition.
    pub fn take_condition(&mut self) -> Option<PipelineError> {
        self.fault.lock().take()
    }

    /// Spawns a capture session. Valid only from `Stopped` with permission
    /// granted. The capture thread acquires the device itself and reports
    /// the result back before this call returns.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.reap_finished();

        if *self.state.lock() != SessionState::Stopped {
            return Err(PipelineError::AlreadyRunning);
        }
        if !self.permission_granted {
            return Err(PipelineError::PermissionDenied);
        }

        *self.state.lock() = SessionState::Starting;
        *self.fault.lock() = None;

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let opener = self.opener.clone();
        let frame_size = self.frame_size;
        let output = self.output.clone();
        let state = self.state.clone();
        let fault = self.fault.clone();
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                //
                // Device acquisition happens on this thread; the stream
                // handle never crosses a thread boundary.
                //
                let source = match opener.open(&SAMPLE_RATE_CANDIDATES) {
                    Ok(source) => {
                        *state.lock() = SessionState::Running;
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let session =
                    CaptureLoop::new(source, frame_size, output, thread_stop, FRAME_INTERVAL);

                if let Err(condition) = session.run() {
                    log::error!("capture session fault: {}", condition);
                    *fault.lock() = Some(condition);
                    *state.lock() = SessionState::Stopped;
                }
                // Source dropped here: the device is released exactly once,
                // on the thread that opened it.
            })
            .expect("failed to spawn capture thread");

        match ready_rx.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(Ok(())) => {
                self.worker = Some(Worker { handle, stop });
                Ok(())
            }
            Ok(Err(open_err)) => {
                let _ = handle.join();
                *self.state.lock() = SessionState::Stopped;
                let err = PipelineError::UnavailableDevice(open_err.to_string());
                *self.fault.lock() = Some(err.clone());
                Err(err)
            }
            Err(_) => {
                //
                // Acquisition never answered; abandon the attempt and let
                // the thread unwind on the stop flag.
                //
                stop.store(true, Ordering::Relaxed);
                let _ = handle.join();
                *self.state.lock() = SessionState::Stopped;
                let err = PipelineError::UnavailableDevice("device acquisition timed out".into());
                *self.fault.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Signals the capture loop to exit, joins it, and returns to
    /// `Stopped`. Loop exit latency is bounded by one stop-poll slice, so
    /// the join is short. No-op when already stopped.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                *self.state.lock() = SessionState::Stopped;
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Starting | SessionState::Running) {
                *state = SessionState::Stopping;
            }
        }

        worker.stop.store(true, Ordering::Relaxed);
        if worker.handle.join().is_err() {
            log::error!("capture thread panicked");
        }

        *self.state.lock() = SessionState::Stopped;
        log::info!("capture stopped");
    }

    /// Switches the frame size by fully quiescing the current session and
    /// starting a fresh one; buffers, window, and plan are all tied to the
    /// size, so there is no in-place resize. The old session's device is
    /// released before the new session opens it.
    pub fn reconfigure(&mut self, frame_size: FrameSize) -> Result<(), PipelineError> {
        let was_active = matches!(
            self.state(),
            SessionState::Starting | SessionState::Running
        );

        self.stop();
        self.frame_size = frame_size;
        log::info!("reconfigured frame size to {}", frame_size.samples());

        if was_active {
            self.start()
        } else {
            Ok(())
        }
    }

    /// Reacts to permission transitions pushed in from the environment.
    /// Revocation mid-session forces a stop and records `PermissionLost`;
    /// granting never starts a session by itself.
    pub fn set_permission(&mut self, granted: bool) {
        if self.permission_granted == granted {
            return;
        }
        self.permission_granted = granted;

        if !granted
            && matches!(
                self.state(),
                SessionState::Starting | SessionState::Running
            )
        {
            log::warn!("capture permission revoked; stopping");
            self.stop();
            *self.fault.lock() = Some(PipelineError::PermissionLost);
        }
    }

    //
    // A session that faulted has already released its device and moved the
    // shared state to Stopped; all that remains is joining the thread.
    //
    fn reap_finished(&mut self) {
        if self
            .worker
            .as_ref()
            .is_some_and(|w| w.handle.is_finished())
        {
            if let Some(worker) = self.worker.take() {
                let _ = worker.handle.join();
            }
            *self.state.lock() = SessionState::Stopped;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
