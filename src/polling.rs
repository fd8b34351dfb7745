//! Fixed-cadence detection loop for live sources.
//!
//! `PollingLoop` samples a [`LiveSource`] every interval, ships the frame to the
//! detector on a worker thread and paints the returned boxes onto the shared
//! overlay. At most one request is outstanding per session: ticks that find a
//! request in flight are skipped, as are ticks while the source is not ready.
//!
//! Every `start` opens a new session identified by a generation number. A
//! request remembers the generation it was issued under and its result is only
//! applied (results stored, overlay repainted) when that generation is still
//! current. `stop` bumps the generation while holding the same lock, so a
//! request that settles after `stop` can never repaint the cleared overlay.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::capture::{Frame, Readiness, SharedSource, LIVE_JPEG_QUALITY};
use crate::detect::{DetectError, DetectionSettings, DetectorBackend, ResultsByModel};
use crate::geometry::{map_detections, DisplayRect};
use crate::overlay::OverlayCanvas;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// A request was handed to a worker.
    Dispatched,
    /// Previous request still in flight.
    Busy,
    /// Source not ready (paused, warming up, no dimensions).
    NotReady,
    /// Loop not enabled.
    Disabled,
    /// Source reached its end; the loop stopped itself.
    Ended,
    /// Capture or encoding failed; the loop keeps running.
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub ticks: u64,
    pub skipped_busy: u64,
    pub skipped_not_ready: u64,
    pub completed: u64,
    pub failed: u64,
    /// Results that settled after their session was stopped.
    pub stale: u64,
}

#[derive(Default)]
struct PollState {
    enabled: bool,
    in_flight: bool,
    generation: u64,
    results: Option<ResultsByModel>,
    frame_dims: Option<(u32, u32)>,
    last_error: Option<DetectError>,
    stats: PollStats,
}

struct PollShared {
    state: Mutex<PollState>,
    settled: Condvar,
    source: SharedSource,
    backend: Arc<dyn DetectorBackend>,
    overlay: Arc<Mutex<OverlayCanvas>>,
    settings: Arc<RwLock<DetectionSettings>>,
    rect: Mutex<DisplayRect>,
}

struct Ticker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PollingLoop {
    shared: Arc<PollShared>,
    interval: Duration,
    ticker: Option<Ticker>,
}

impl PollingLoop {
    pub fn new(
        source: SharedSource,
        backend: Arc<dyn DetectorBackend>,
        overlay: Arc<Mutex<OverlayCanvas>>,
        settings: Arc<RwLock<DetectionSettings>>,
        rect: DisplayRect,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PollShared {
                state: Mutex::new(PollState::default()),
                settled: Condvar::new(),
                source,
                backend,
                overlay,
                settings,
                rect: Mutex::new(rect),
            }),
            interval,
            ticker: None,
        }
    }

    /// Enable the loop, fire one tick right away and schedule the rest.
    /// A no-op while already enabled.
    pub fn start(&mut self) {
        {
            let mut state = self.shared.lock_state();
            if state.enabled {
                log::debug!("PollingLoop: start ignored, already running");
                return;
            }
            state.enabled = true;
            state.in_flight = false;
            state.generation += 1;
        }
        // A ticker left over from a session that ended on its own.
        self.join_ticker();

        log::info!(
            "PollingLoop: started on {} every {:?}",
            self.shared.describe_source(),
            self.interval
        );
        self.shared.tick();

        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let spawned = std::thread::Builder::new()
            .name("wildsnap-poll".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if matches!(shared.tick(), TickOutcome::Ended | TickOutcome::Disabled) {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        match spawned {
            Ok(handle) => self.ticker = Some(Ticker { stop_tx, handle }),
            Err(err) => log::error!("PollingLoop: failed to spawn ticker: {}", err),
        }
    }

    /// Disable the loop, drop stored results and clear the overlay. A request
    /// still in flight is left to finish; its result is discarded.
    pub fn stop(&mut self) {
        let was_enabled = self.shared.shut_down(None);
        self.join_ticker();
        if was_enabled {
            log::info!("PollingLoop: stopped on {}", self.shared.describe_source());
        }
    }

    fn join_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.stop_tx.send(());
            if ticker.handle.join().is_err() {
                log::error!("PollingLoop: ticker thread panicked");
            }
        }
    }

    /// Run one tick on the calling thread.
    pub fn tick(&self) -> TickOutcome {
        self.shared.tick()
    }

    /// Re-map stored results into `rect` and repaint, without a new request.
    pub fn resize(&self, rect: DisplayRect) {
        *lock(&self.shared.rect) = rect;
        let state = self.shared.lock_state();
        if state.enabled {
            self.shared.paint(&state);
        }
    }

    pub fn display_rect(&self) -> DisplayRect {
        *lock(&self.shared.rect)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock_state().enabled
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.lock_state().in_flight
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock_state().generation
    }

    pub fn results(&self) -> Option<ResultsByModel> {
        self.shared.lock_state().results.clone()
    }

    /// Intrinsic size of the frame the stored results belong to.
    pub fn frame_dims(&self) -> Option<(u32, u32)> {
        self.shared.lock_state().frame_dims
    }

    pub fn last_error(&self) -> Option<DetectError> {
        self.shared.lock_state().last_error.clone()
    }

    pub fn stats(&self) -> PollStats {
        self.shared.lock_state().stats
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until `condition` holds for the loop counters or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, condition: impl Fn(&PollStats) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !condition(&state.stats) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.settled.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollShared {
    fn lock_state(&self) -> MutexGuard<'_, PollState> {
        lock(&self.state)
    }

    fn describe_source(&self) -> String {
        lock(&self.source).describe()
    }

    fn tick(self: &Arc<Self>) -> TickOutcome {
        let token = {
            let mut state = self.lock_state();
            if !state.enabled {
                return TickOutcome::Disabled;
            }
            state.stats.ticks += 1;
            if state.in_flight {
                state.stats.skipped_busy += 1;
                log::debug!("PollingLoop: tick skipped, request in flight");
                return TickOutcome::Busy;
            }
            state.in_flight = true;
            state.generation
        };

        let captured = {
            let mut source = lock(&self.source);
            match source.readiness() {
                Readiness::Ready => match source.capture() {
                    Ok(frame) => Ok(frame),
                    Err(_) if source.readiness() == Readiness::Ended => Err(None),
                    Err(err) => Err(Some(err)),
                },
                Readiness::NotReady(reason) => {
                    drop(source);
                    let mut state = self.lock_state();
                    release(&mut state, token);
                    state.stats.skipped_not_ready += 1;
                    log::debug!("PollingLoop: tick skipped, {}", reason);
                    return TickOutcome::NotReady;
                }
                Readiness::Ended => Err(None),
            }
        };

        let frame = match captured {
            Ok(frame) => frame,
            Err(None) => {
                if self.shut_down(Some(token)) {
                    log::info!("PollingLoop: source ended, loop stopped");
                }
                return TickOutcome::Ended;
            }
            Err(Some(err)) => return self.fail(token, format!("capture failed: {:#}", err)),
        };

        self.dispatch(token, frame)
    }

    fn dispatch(self: &Arc<Self>, token: u64, frame: Frame) -> TickOutcome {
        let dims = (frame.width, frame.height);
        let encoded = match frame.encode_jpeg(LIVE_JPEG_QUALITY) {
            Ok(encoded) => encoded,
            Err(err) => return self.fail(token, format!("encode failed: {:#}", err)),
        };
        let settings = *self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("wildsnap-detect".to_string())
            .spawn(move || {
                let result = shared.backend.detect(&encoded, &settings);
                shared.settle(token, dims, result);
            });
        match spawned {
            Ok(_) => TickOutcome::Dispatched,
            Err(err) => self.fail(token, format!("failed to spawn detect worker: {}", err)),
        }
    }

    fn fail(&self, token: u64, message: String) -> TickOutcome {
        log::warn!("PollingLoop: {}", message);
        let mut state = self.lock_state();
        release(&mut state, token);
        state.stats.failed += 1;
        drop(state);
        self.settled.notify_all();
        TickOutcome::Failed
    }

    fn settle(&self, token: u64, dims: (u32, u32), result: Result<ResultsByModel, DetectError>) {
        let mut state = self.lock_state();
        if !state.enabled || state.generation != token {
            state.stats.stale += 1;
            log::debug!("PollingLoop: discarding result from stopped session {}", token);
        } else {
            state.in_flight = false;
            match result {
                Ok(results) => {
                    state.stats.completed += 1;
                    state.results = Some(results);
                    state.frame_dims = Some(dims);
                    state.last_error = None;
                    self.paint(&state);
                }
                Err(err) => {
                    state.stats.failed += 1;
                    log::warn!("PollingLoop: live detection failed: {}", err);
                    state.last_error = Some(err);
                }
            }
        }
        drop(state);
        self.settled.notify_all();
    }

    /// Repaint the overlay from the stored results. Runs under the state lock.
    fn paint(&self, state: &PollState) {
        let (Some(results), Some((width, height))) = (&state.results, state.frame_dims) else {
            return;
        };
        let rect = *lock(&self.rect);
        let key = self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .model
            .key();
        let detections = results
            .for_display(key)
            .map(|result| result.detections.as_slice())
            .unwrap_or(&[]);
        if let Some(mapping) = map_detections(width, height, rect, detections) {
            lock(&self.overlay).render(rect, &mapping.detections);
        }
    }

    /// Disable the loop and wipe its output. With `Some(token)` only the
    /// session with that generation is shut down. Returns whether it was
    /// running.
    fn shut_down(&self, token: Option<u64>) -> bool {
        let mut state = self.lock_state();
        if token.is_some_and(|token| token != state.generation) {
            return false;
        }
        let was_enabled = state.enabled;
        state.enabled = false;
        state.in_flight = false;
        state.generation += 1;
        state.results = None;
        state.frame_dims = None;
        lock(&self.overlay).clear();
        drop(state);
        self.settled.notify_all();
        was_enabled
    }
}

/// Clear `in_flight` if `token` still names the current session.
fn release(state: &mut PollState, token: u64) {
    if state.generation == token {
        state.in_flight = false;
    }
}
