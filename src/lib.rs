//! WildSnap
//!
//! Capture, poll and overlay client for a remote animal-detection API.
//!
//! # Architecture
//!
//! Inference runs on an external HTTP service. This crate captures frames,
//! ships them to that service and paints the returned boxes:
//!
//! 1. **Capture**: a still image, a webcam stream or a local video file
//!    produces decoded RGB frames.
//! 2. **Detect**: a frame plus the current settings (model, confidence, IoU,
//!    animal filter) is posted to the backend, which replies with a per-model
//!    result map.
//! 3. **Map**: boxes in intrinsic pixels are letterboxed into the display rect.
//! 4. **Overlay**: boxes and labels are drawn onto a transparent canvas.
//!
//! Live sources run through a polling loop that keeps at most one request in
//! flight and discards results that settle after the loop was stopped.
//!
//! # Module Structure
//!
//! - `capture`: image, webcam and video sources
//! - `detect`: settings, result model, transports and backends
//! - `geometry`: letterbox mapping
//! - `overlay`: box and label rendering
//! - `polling`: live detection loop
//! - `session`: mode switching, settings, results and errors
//! - `summary`: per-model statistics
//! - `config`: layered configuration

pub mod capture;
pub mod config;
pub mod detect;
pub mod geometry;
pub mod overlay;
pub mod polling;
pub mod session;
pub mod summary;
pub mod ui;

pub use capture::{
    EncodedFrame, Frame, ImageSource, LiveSource, PlaybackState, Readiness, VideoConfig,
    VideoSource, WebcamConfig, WebcamSource, WebcamState,
};
pub use config::WildsnapConfig;
pub use detect::{
    DetectError, Detection, DetectionSettings, DetectorBackend, HttpBackend, ModelResult,
    ModelSelector, ResultsByModel, StubBackend, Transport,
};
pub use geometry::{map_detections, DisplayRect, Letterbox, MappedDetection, Mapping};
pub use overlay::{OverlayCanvas, OverlayStyle};
pub use polling::{PollStats, PollingLoop, TickOutcome};
pub use session::{CaptureMode, Session, SessionError};
pub use summary::{summarize, ModelSummary};
