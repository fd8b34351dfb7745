//! View/session state.
//!
//! A `Session` owns whichever capture controller is live (image, webcam or
//! video), the polling loop driving it, the request settings, the last
//! results and the last user-visible error. Only one controller is live at a
//! time: switching mode tears down polling, releases the webcam and unloads
//! any video before the new mode takes over.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{Context, Result};
use image::RgbaImage;
use serde::Serialize;
use thiserror::Error;

use crate::capture::{
    ImageSource, LiveSource, PlaybackState, Readiness, SharedSource, VideoSource, WebcamSource,
};
use crate::config::WildsnapConfig;
use crate::detect::{DetectError, DetectionSettings, DetectorBackend, ModelSelector, ResultsByModel};
use crate::geometry::{map_detections, DisplayRect};
use crate::overlay::OverlayCanvas;
use crate::polling::{PollStats, PollingLoop};
use crate::summary::{summarize, ModelSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CaptureMode {
    Upload,
    Webcam,
    Video,
}

/// Errors shown to the user. Media errors block entry into a capture mode;
/// detection errors come from the one-shot still flow only.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0}")]
    Media(String),
    #[error("{0}")]
    Detection(String),
}

pub struct Session {
    config: WildsnapConfig,
    mode: CaptureMode,
    backend: Arc<dyn DetectorBackend>,
    settings: Arc<RwLock<DetectionSettings>>,
    overlay: Arc<Mutex<OverlayCanvas>>,
    display_rect: DisplayRect,
    image: ImageSource,
    webcam: Option<Arc<Mutex<WebcamSource>>>,
    video: Option<Arc<Mutex<VideoSource>>>,
    polling: Option<PollingLoop>,
    still_results: Option<ResultsByModel>,
    error: Option<SessionError>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    pub fn new(config: WildsnapConfig, backend: Arc<dyn DetectorBackend>) -> Self {
        let overlay = Arc::new(Mutex::new(config.overlay_canvas()));
        let display_rect = DisplayRect::new(
            f64::from(config.webcam.width),
            f64::from(config.webcam.height),
        );
        Self {
            settings: Arc::new(RwLock::new(config.detection)),
            config,
            mode: CaptureMode::Upload,
            backend,
            overlay,
            display_rect,
            image: ImageSource::new(),
            webcam: None,
            video: None,
            polling: None,
            still_results: None,
            error: None,
        }
    }

    /// Session with the backend named by the configuration.
    pub fn from_config(config: WildsnapConfig) -> Self {
        let backend = config.detector();
        Self::new(config, backend)
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn backend(&self) -> &Arc<dyn DetectorBackend> {
        &self.backend
    }

    pub fn overlay(&self) -> Arc<Mutex<OverlayCanvas>> {
        Arc::clone(&self.overlay)
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.error = Some(err.clone());
        err
    }

    fn media_error(&mut self, err: anyhow::Error) -> SessionError {
        self.fail(SessionError::Media(format!("{:#}", err)))
    }

    /// Tear everything down and enter `mode`.
    pub fn switch_mode(&mut self, mode: CaptureMode) {
        self.teardown();
        if self.mode != mode {
            log::info!("Session: mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
    }

    fn teardown(&mut self) {
        self.polling = None;
        if let Some(webcam) = self.webcam.take() {
            lock(&webcam).stop();
        }
        if let Some(video) = self.video.take() {
            lock(&video).unload();
        }
        self.image.clear();
        self.still_results = None;
        self.error = None;
        lock(&self.overlay).clear();
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn settings(&self) -> DetectionSettings {
        *self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_settings(&self, update: impl FnOnce(&mut DetectionSettings)) -> Result<()> {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = *settings;
        update(&mut next);
        next.validate()?;
        *settings = next;
        Ok(())
    }

    pub fn set_model(&self, model: ModelSelector) -> Result<()> {
        self.update_settings(|s| s.model = model)
    }

    pub fn set_confidence(&self, confidence: f64) -> Result<()> {
        self.update_settings(|s| s.confidence = confidence)
    }

    pub fn set_iou(&self, iou: f64) -> Result<()> {
        self.update_settings(|s| s.iou = iou)
    }

    pub fn set_filter_animals(&self, filter_animals: bool) -> Result<()> {
        self.update_settings(|s| s.filter_animals = filter_animals)
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    fn enter_upload(&mut self) {
        if self.mode != CaptureMode::Upload {
            self.switch_mode(CaptureMode::Upload);
        }
    }

    pub fn load_image(&mut self, path: &Path) -> Result<(), SessionError> {
        self.enter_upload();
        match self.image.load_path(path) {
            Ok(_) => {
                self.still_results = None;
                self.error = None;
                Ok(())
            }
            Err(err) => Err(self.media_error(err)),
        }
    }

    pub fn load_image_bytes(&mut self, bytes: Vec<u8>, origin: &str) -> Result<(), SessionError> {
        self.enter_upload();
        match self.image.load_bytes(bytes, origin) {
            Ok(_) => {
                self.still_results = None;
                self.error = None;
                Ok(())
            }
            Err(err) => Err(self.media_error(err)),
        }
    }

    pub fn image(&self) -> &ImageSource {
        &self.image
    }

    /// One-shot detection on the loaded still image. Every failure surfaces.
    pub fn detect_image(&mut self) -> Result<&ResultsByModel, SessionError> {
        let Some(loaded) = self.image.loaded() else {
            return Err(self.fail(SessionError::Media("no image loaded".to_string())));
        };
        let settings = self.settings();
        log::info!(
            "Session: detecting {} with {} (confidence {:.2}, iou {:.2})",
            loaded.origin,
            settings.model,
            settings.confidence,
            settings.iou
        );
        match self.backend.detect(&loaded.encoded, &settings) {
            Ok(results) => {
                self.error = None;
                Ok(self.still_results.insert(results))
            }
            Err(err) => {
                log::error!("Session: detection failed: {}", err);
                let message = detection_message(&err, self.backend.endpoint());
                Err(self.fail(SessionError::Detection(message)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Webcam
    // ------------------------------------------------------------------

    pub fn start_webcam(&mut self) -> Result<(), SessionError> {
        if self.mode != CaptureMode::Webcam {
            self.switch_mode(CaptureMode::Webcam);
        }
        if self.webcam.is_some() {
            return Ok(());
        }
        let mut webcam = WebcamSource::new(self.config.webcam.clone());
        match webcam.start() {
            Ok(()) => {
                self.webcam = Some(Arc::new(Mutex::new(webcam)));
                self.error = None;
                Ok(())
            }
            Err(err) => Err(self.media_error(err)),
        }
    }

    pub fn stop_webcam(&mut self) {
        self.polling = None;
        if let Some(webcam) = self.webcam.take() {
            lock(&webcam).stop();
        }
        lock(&self.overlay).clear();
    }

    pub fn webcam_active(&self) -> bool {
        self.webcam
            .as_ref()
            .is_some_and(|webcam| lock(webcam).is_active())
    }

    /// Capture the current webcam frame as a still image, release the camera
    /// and switch to upload mode.
    pub fn snapshot_webcam(&mut self) -> Result<(), SessionError> {
        let Some(webcam) = self.webcam.clone() else {
            return Err(self.fail(SessionError::Media("webcam is not active".to_string())));
        };
        let frame = {
            let mut webcam = lock(&webcam);
            match webcam.readiness() {
                Readiness::Ready => webcam.capture(),
                Readiness::NotReady(reason) => Err(anyhow::anyhow!("webcam not ready: {}", reason)),
                Readiness::Ended => Err(anyhow::anyhow!("webcam stream ended")),
            }
        };
        let frame = frame.map_err(|err| self.media_error(err))?;

        self.switch_mode(CaptureMode::Upload);
        match self.image.load_frame(frame, "webcam snapshot") {
            Ok(_) => Ok(()),
            Err(err) => Err(self.media_error(err)),
        }
    }

    // ------------------------------------------------------------------
    // Video
    // ------------------------------------------------------------------

    pub fn load_video(&mut self, path: &str) -> Result<(), SessionError> {
        if self.mode != CaptureMode::Video {
            self.switch_mode(CaptureMode::Video);
        }
        self.polling = None;
        let video = Arc::clone(
            self.video
                .get_or_insert_with(|| Arc::new(Mutex::new(VideoSource::new(self.config.video.clone())))),
        );
        let loaded = lock(&video).load(path);
        match loaded {
            Ok(()) => {
                self.error = None;
                Ok(())
            }
            Err(err) => Err(self.media_error(err)),
        }
    }

    pub fn play_video(&mut self) -> Result<(), SessionError> {
        let played = match &self.video {
            Some(video) => lock(video).play(),
            None => Err(anyhow::anyhow!("no video loaded")),
        };
        played.map_err(|err| self.media_error(err))
    }

    pub fn pause_video(&mut self) {
        if let Some(video) = &self.video {
            lock(video).pause();
        }
    }

    /// Natural size of the loaded video.
    pub fn video_rect(&self) -> Option<DisplayRect> {
        self.video
            .as_ref()
            .and_then(|video| lock(video).natural_rect())
    }

    pub fn video_state(&self) -> PlaybackState {
        self.video
            .as_ref()
            .map(|video| lock(video).state())
            .unwrap_or(PlaybackState::Idle)
    }

    // ------------------------------------------------------------------
    // Live detection
    // ------------------------------------------------------------------

    fn live_source(&self) -> Option<SharedSource> {
        match self.mode {
            CaptureMode::Upload => None,
            CaptureMode::Webcam => self
                .webcam
                .as_ref()
                .map(|webcam| Arc::clone(webcam) as SharedSource),
            CaptureMode::Video => self
                .video
                .as_ref()
                .map(|video| Arc::clone(video) as SharedSource),
        }
    }

    /// Start polling the active webcam or video. A no-op while running.
    pub fn start_live_detection(&mut self) -> Result<(), SessionError> {
        if self.polling.as_ref().is_some_and(PollingLoop::is_enabled) {
            return Ok(());
        }
        let Some(source) = self.live_source() else {
            let message = match self.mode {
                CaptureMode::Upload => "live detection needs webcam or video mode",
                CaptureMode::Webcam => "webcam is not active",
                CaptureMode::Video => "no video loaded",
            };
            return Err(self.fail(SessionError::Media(message.to_string())));
        };
        let mut polling = PollingLoop::new(
            source,
            Arc::clone(&self.backend),
            Arc::clone(&self.overlay),
            Arc::clone(&self.settings),
            self.display_rect,
            self.config.polling_interval,
        );
        polling.start();
        self.polling = Some(polling);
        Ok(())
    }

    pub fn stop_live_detection(&mut self) {
        if let Some(mut polling) = self.polling.take() {
            polling.stop();
        }
    }

    pub fn live_detection_running(&self) -> bool {
        self.polling.as_ref().is_some_and(PollingLoop::is_enabled)
    }

    pub fn poll_stats(&self) -> Option<PollStats> {
        self.polling.as_ref().map(PollingLoop::stats)
    }

    pub fn polling(&self) -> Option<&PollingLoop> {
        self.polling.as_ref()
    }

    /// Last live failure. Never promoted to the session error.
    pub fn live_error(&self) -> Option<DetectError> {
        self.polling.as_ref().and_then(PollingLoop::last_error)
    }

    // ------------------------------------------------------------------
    // Display and results
    // ------------------------------------------------------------------

    pub fn display_rect(&self) -> DisplayRect {
        self.display_rect
    }

    /// New viewport size; live overlays re-map without a new request.
    pub fn resize(&mut self, rect: DisplayRect) {
        self.display_rect = rect;
        if let Some(polling) = &self.polling {
            polling.resize(rect);
        }
    }

    pub fn results(&self) -> Option<ResultsByModel> {
        match self.mode {
            CaptureMode::Upload => self.still_results.clone(),
            CaptureMode::Webcam | CaptureMode::Video => {
                self.polling.as_ref().and_then(PollingLoop::results)
            }
        }
    }

    pub fn summary(&self) -> Vec<ModelSummary> {
        self.results()
            .map(|results| summarize(&results))
            .unwrap_or_default()
    }

    /// Pretty-printed results map, as returned by the backend.
    pub fn raw_json(&self) -> Result<Option<String>> {
        match self.results() {
            Some(results) => Ok(Some(serde_json::to_string_pretty(&results)?)),
            None => Ok(None),
        }
    }

    /// Write each model's backend-rendered image to `dir` as `<model>.<ext>`
    /// (`yolov8n.png`, `best.png`). Models without an image are skipped.
    pub fn save_annotated_images(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let Some(results) = self.results() else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut written = Vec::new();
        for (key, result) in results.iter() {
            let Some(bytes) = result
                .decode_annotated_image()
                .with_context(|| format!("annotated image for {}", key))?
            else {
                continue;
            };
            let format = image::guess_format(&bytes)
                .with_context(|| format!("annotated image for {} is not an image", key))?;
            let ext = format.extensions_str().first().copied().unwrap_or("png");
            let path = dir.join(format!("{}.{}", key, ext));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("Session: annotated image for {} written to {}", key, path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// Forget still results and the last error.
    pub fn clear_results(&mut self) {
        self.still_results = None;
        self.error = None;
        if self.polling.is_none() {
            lock(&self.overlay).clear();
        }
    }

    /// Current media with its boxes drawn on top, at the display rect size.
    pub fn compose_current(&self) -> Result<RgbaImage> {
        let rect = self.display_rect;
        match self.mode {
            CaptureMode::Upload => {
                let loaded = self
                    .image
                    .loaded()
                    .ok_or_else(|| anyhow::anyhow!("no image loaded"))?;
                let frame = &loaded.frame;
                let key = self.settings().model.key();
                let detections = self
                    .still_results
                    .as_ref()
                    .and_then(|results| results.for_display(key))
                    .map(|result| result.detections.as_slice())
                    .unwrap_or(&[]);
                let mut overlay = lock(&self.overlay);
                match map_detections(frame.width, frame.height, rect, detections) {
                    Some(mapping) => overlay.render(rect, &mapping.detections),
                    None => overlay.render(rect, &[]),
                }
                overlay.compose(frame, rect)
            }
            CaptureMode::Webcam => {
                let webcam = self
                    .webcam
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("webcam is not active"))?;
                let frame = {
                    let mut webcam = lock(webcam);
                    if webcam.readiness() != Readiness::Ready {
                        anyhow::bail!("{} is not ready", webcam.describe());
                    }
                    webcam.capture()?
                };
                lock(&self.overlay).compose(&frame, rect)
            }
            CaptureMode::Video => {
                let video = self
                    .video
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no video loaded"))?;
                let frame = lock(video).current_frame()?;
                lock(&self.overlay).compose(&frame, rect)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn detection_message(err: &DetectError, endpoint: &str) -> String {
    match err {
        DetectError::Transport { .. } => err.user_message(endpoint),
        DetectError::Backend { .. } | DetectError::Parse(_) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use crate::detect::{DetectError, StubBackend};
    use std::time::Duration;

    fn session(interval: Duration) -> (Session, Arc<StubBackend>) {
        let mut config = WildsnapConfig::default();
        config.polling_interval = interval;
        config.webcam.device = "stub://cam".to_string();
        config.webcam.width = 160;
        config.webcam.height = 120;
        let stub = Arc::new(StubBackend::new());
        (Session::new(config, stub.clone()), stub)
    }

    fn still(session: &mut Session) -> Result<()> {
        let frame = Frame::from_rgb(vec![90; 8 * 6 * 3], 8, 6)?;
        session.image.load_frame(frame, "test frame")?;
        Ok(())
    }

    #[test]
    fn clear_results_forgets_results_and_error() -> Result<()> {
        let (mut session, stub) = session(Duration::from_millis(500));
        still(&mut session)?;
        session.detect_image()?;
        assert!(session.results().is_some());

        stub.push_response(Err(DetectError::Parse("truncated".into())));
        assert!(session.detect_image().is_err());
        assert!(session.error().is_some());

        session.clear_results();
        assert!(session.results().is_none());
        assert!(session.error().is_none());
        assert!(session.image().is_loaded());
        Ok(())
    }

    #[test]
    fn detect_without_image_is_a_media_error() {
        let (mut session, stub) = session(Duration::from_millis(500));
        let err = session.detect_image().unwrap_err();
        assert_eq!(err, SessionError::Media("no image loaded".to_string()));
        assert_eq!(stub.request_count(), 0);
    }

    #[test]
    fn resize_repaints_live_overlay_without_a_request() -> Result<()> {
        let (mut session, stub) = session(Duration::from_secs(60));
        session.start_webcam()?;
        session.start_live_detection()?;
        let polling = session.polling().expect("polling loop");
        assert!(polling.wait_until(Duration::from_secs(5), |stats| stats.completed == 1));
        assert_eq!(session.overlay().lock().unwrap().dimensions(), (160, 120));

        session.resize(DisplayRect::new(320.0, 240.0));
        assert_eq!(session.overlay().lock().unwrap().dimensions(), (320, 240));
        assert!(!session.overlay().lock().unwrap().is_blank());
        assert_eq!(stub.request_count(), 1);
        Ok(())
    }

    #[test]
    fn live_failures_do_not_become_session_errors() -> Result<()> {
        let (mut session, stub) = session(Duration::from_secs(60));
        stub.push_response(Err(DetectError::Backend {
            status: 500,
            message: "model not found".to_string(),
        }));
        session.start_webcam()?;
        session.start_live_detection()?;
        let polling = session.polling().expect("polling loop");
        assert!(polling.wait_until(Duration::from_secs(5), |stats| stats.failed == 1));

        assert!(session.error().is_none());
        assert_eq!(session.live_error().and_then(|e| e.backend_status()), Some(500));
        assert!(session.live_detection_running());
        Ok(())
    }

    #[test]
    fn switching_mode_releases_everything() -> Result<()> {
        let (mut session, _stub) = session(Duration::from_millis(50));
        session.load_video("stub://clip?ms=5000&size=32x24")?;
        session.play_video()?;
        session.start_live_detection()?;
        assert_eq!(session.video_state(), PlaybackState::Playing);

        session.start_webcam()?;
        assert_eq!(session.mode(), CaptureMode::Webcam);
        assert_eq!(session.video_state(), PlaybackState::Idle);
        assert!(!session.live_detection_running());
        assert!(session.webcam_active());

        session.switch_mode(CaptureMode::Upload);
        assert!(!session.webcam_active());
        assert!(session.overlay().lock().unwrap().is_blank());
        Ok(())
    }
}
