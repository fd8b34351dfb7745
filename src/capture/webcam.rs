//! Webcam source.
//!
//! `WebcamSource` walks `Idle -> Starting -> Active -> Idle`. Starting first
//! tries the preferred constraints (configured device at the configured
//! resolution) and falls back to any available camera at its current format;
//! only when both fail does `start` return an error. Once a stream is open the
//! source warms up by reading one frame, retrying once after a short delay.
//!
//! `stop` releases the device stream. Dropping the source does the same.
//!
//! `stub://` devices are synthetic. Query parameters shape their behaviour in
//! tests: `deny=preferred|all` rejects acquisitions, `warmup_failures=N` makes
//! the first N reads fail.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{synthetic_pixels, Frame, LiveSource, Readiness};

/// Delay before the single warm-up retry.
const WARMUP_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Resolution used by the fallback acquisition of synthetic devices.
const FALLBACK_WIDTH: u32 = 640;
const FALLBACK_HEIGHT: u32 = 480;

/// Configuration for a webcam source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebcamConfig {
    /// Device path (e.g., "/dev/video0") or `stub://name`.
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Requested device frame rate. Zero leaves the driver default.
    pub target_fps: u32,
}

impl Default for WebcamConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebcamState {
    Idle,
    Starting,
    Active,
}

/// Which acquisition attempt is being made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraints {
    /// Configured device at the configured resolution.
    Preferred,
    /// Any camera, whatever format it is already in.
    Fallback,
}

pub struct WebcamSource {
    config: WebcamConfig,
    state: WebcamState,
    stream: Option<WebcamStream>,
    constraints: Option<Constraints>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

enum WebcamStream {
    Synthetic(SyntheticStream),
    #[cfg(feature = "webcam-v4l2")]
    Device(device::DeviceStream),
}

impl WebcamStream {
    fn open(config: &WebcamConfig, constraints: Constraints) -> Result<Self> {
        if config.device.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticStream::open(config, constraints)?));
        }
        #[cfg(feature = "webcam-v4l2")]
        {
            Ok(Self::Device(device::DeviceStream::open(config, constraints)?))
        }
        #[cfg(not(feature = "webcam-v4l2"))]
        {
            Err(anyhow!(
                "webcam capture of {} requires the webcam-v4l2 feature",
                config.device
            ))
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Synthetic(stream) => stream.next_frame(),
            #[cfg(feature = "webcam-v4l2")]
            Self::Device(stream) => stream.next_frame(),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Synthetic(stream) => (stream.width, stream.height),
            #[cfg(feature = "webcam-v4l2")]
            Self::Device(stream) => stream.dimensions(),
        }
    }
}

impl WebcamSource {
    pub fn new(config: WebcamConfig) -> Self {
        Self {
            config,
            state: WebcamState::Idle,
            stream: None,
            constraints: None,
            frame_count: 0,
            active_width: 0,
            active_height: 0,
        }
    }

    pub fn config(&self) -> &WebcamConfig {
        &self.config
    }

    pub fn state(&self) -> WebcamState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == WebcamState::Active
    }

    /// Constraints the running stream was acquired with.
    pub fn constraints(&self) -> Option<Constraints> {
        self.constraints
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    /// Acquire the camera. A no-op while starting or active.
    pub fn start(&mut self) -> Result<()> {
        if self.state != WebcamState::Idle {
            return Ok(());
        }
        self.state = WebcamState::Starting;

        let (stream, constraints) = match WebcamStream::open(&self.config, Constraints::Preferred)
        {
            Ok(stream) => (stream, Constraints::Preferred),
            Err(preferred_err) => {
                log::warn!(
                    "WebcamSource: preferred constraints failed on {}: {}; trying fallback",
                    self.config.device,
                    preferred_err
                );
                match WebcamStream::open(&self.config, Constraints::Fallback) {
                    Ok(stream) => (stream, Constraints::Fallback),
                    Err(fallback_err) => {
                        self.state = WebcamState::Idle;
                        log::error!("WebcamSource: fallback failed: {}", fallback_err);
                        return Err(anyhow!(
                            "Webcam access denied or not available. preferred: {:#}; fallback: {:#}",
                            preferred_err,
                            fallback_err
                        ));
                    }
                }
            }
        };

        let (width, height) = stream.dimensions();
        self.active_width = width;
        self.active_height = height;
        self.stream = Some(stream);
        self.constraints = Some(constraints);
        self.state = WebcamState::Active;
        log::info!(
            "WebcamSource: started {} ({}x{}, {:?} constraints)",
            self.config.device,
            width,
            height,
            constraints
        );

        self.warm_up();
        Ok(())
    }

    /// Make sure frames actually flow, retrying once after a short delay.
    fn warm_up(&mut self) {
        if self.capture_frame().is_ok() {
            return;
        }
        std::thread::sleep(WARMUP_RETRY_DELAY);
        if let Err(err) = self.capture_frame() {
            log::warn!(
                "WebcamSource: {} opened but produced no frame: {}",
                self.config.device,
                err
            );
        }
    }

    /// Release the device stream and return to `Idle`.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::info!(
                "WebcamSource: stopped {} after {} frames",
                self.config.device,
                self.frame_count
            );
        }
        self.state = WebcamState::Idle;
        self.constraints = None;
        self.active_width = 0;
        self.active_height = 0;
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("webcam not started; call start() first"))?;
        let frame = stream.next_frame()?;
        self.frame_count += 1;
        self.active_width = frame.width;
        self.active_height = frame.height;
        Ok(frame)
    }
}

impl LiveSource for WebcamSource {
    fn describe(&self) -> String {
        format!("webcam {}", self.config.device)
    }

    fn readiness(&self) -> Readiness {
        match self.state {
            WebcamState::Idle => Readiness::NotReady("webcam stopped"),
            WebcamState::Starting => Readiness::NotReady("webcam starting"),
            WebcamState::Active if self.active_width == 0 || self.active_height == 0 => {
                Readiness::NotReady("webcam has no frame dimensions yet")
            }
            WebcamState::Active => Readiness::Ready,
        }
    }

    fn capture(&mut self) -> Result<Frame> {
        self.capture_frame()
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticStream {
    width: u32,
    height: u32,
    frame_index: u64,
    failures_left: u32,
}

impl SyntheticStream {
    fn open(config: &WebcamConfig, constraints: Constraints) -> Result<Self> {
        let url = url::Url::parse(&config.device)
            .map_err(|e| anyhow!("invalid stub device '{}': {}", config.device, e))?;
        let mut failures_left = 0;
        for (key, value) in url.query_pairs() {
            match (key.as_ref(), value.as_ref()) {
                ("deny", "all") => return Err(anyhow!("permission denied")),
                ("deny", "preferred") if constraints == Constraints::Preferred => {
                    return Err(anyhow!("constraints not satisfiable"))
                }
                ("warmup_failures", n) => {
                    failures_left = n
                        .parse()
                        .map_err(|_| anyhow!("warmup_failures must be an integer"))?
                }
                _ => {}
            }
        }
        let (width, height) = match constraints {
            Constraints::Preferred => (config.width, config.height),
            Constraints::Fallback => (FALLBACK_WIDTH, FALLBACK_HEIGHT),
        };
        Ok(Self {
            width,
            height,
            frame_index: 0,
            failures_left,
        })
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(anyhow!("synthetic webcam not streaming yet"));
        }
        self.frame_index += 1;
        Frame::from_rgb(
            synthetic_pixels(self.width, self.height, self.frame_index),
            self.width,
            self.height,
        )
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "webcam-v4l2")]
mod device {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::{Constraints, WebcamConfig};
    use crate::capture::normalize::{normalize_to_frame, PixelFormat};
    use crate::capture::Frame;

    pub(super) struct DeviceStream {
        state: DeviceState,
        width: u32,
        height: u32,
        format: PixelFormat,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceStream {
        pub(super) fn open(config: &WebcamConfig, constraints: Constraints) -> Result<Self> {
            use v4l::video::Capture;

            let (device, path) = match constraints {
                Constraints::Preferred => {
                    let device = v4l::Device::with_path(&config.device)
                        .with_context(|| format!("open v4l2 device {}", config.device))?;
                    (device, config.device.clone())
                }
                Constraints::Fallback => open_any_device()?,
            };

            let format = match constraints {
                Constraints::Preferred => {
                    let mut wanted = device.format().context("read v4l2 format")?;
                    wanted.width = config.width;
                    wanted.height = config.height;
                    wanted.fourcc = v4l::FourCC::new(b"RGB3");
                    let applied = device
                        .set_format(&wanted)
                        .with_context(|| format!("set preferred format on {}", path))?;
                    if applied.width != config.width || applied.height != config.height {
                        return Err(anyhow!(
                            "{} cannot deliver {}x{} (got {}x{})",
                            path,
                            config.width,
                            config.height,
                            applied.width,
                            applied.height
                        ));
                    }
                    if config.target_fps > 0 {
                        let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
                        if let Err(err) = device.set_params(&params) {
                            log::warn!("WebcamSource: failed to set fps on {}: {}", path, err);
                        }
                    }
                    applied
                }
                Constraints::Fallback => device.format().context("read v4l2 format")?,
            };

            let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
                anyhow!("{} uses unsupported pixel format {}", path, format.fourcc)
            })?;

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(
                        device,
                        v4l::buffer::Type::VideoCapture,
                        4,
                    )
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            Ok(Self {
                state,
                width: format.width,
                height: format.height,
                format: pixel_format,
            })
        }

        pub(super) fn next_frame(&mut self) -> Result<Frame> {
            use v4l::io::traits::CaptureStream;

            let (width, height, format) = (self.width, self.height, self.format);
            self.state.with_mut(|fields| {
                let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                normalize_to_frame(&buf[..used], width, height, format)
            })
        }

        pub(super) fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }

    fn open_any_device() -> Result<(v4l::Device, String)> {
        for node in v4l::context::enum_devices() {
            let path = node.path().display().to_string();
            match v4l::Device::with_path(node.path()) {
                Ok(device) => return Ok((device, path)),
                Err(err) => log::debug!("WebcamSource: skipping {}: {}", path, err),
            }
        }
        Err(anyhow!("no camera device available"))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(device: &str) -> WebcamConfig {
        WebcamConfig {
            device: device.to_string(),
            width: 320,
            height: 240,
            target_fps: 30,
        }
    }

    #[test]
    fn starts_with_preferred_constraints() -> Result<()> {
        let mut cam = WebcamSource::new(stub_config("stub://front"));
        assert_eq!(cam.readiness(), Readiness::NotReady("webcam stopped"));
        cam.start()?;
        assert_eq!(cam.state(), WebcamState::Active);
        assert_eq!(cam.constraints(), Some(Constraints::Preferred));
        assert_eq!(cam.readiness(), Readiness::Ready);

        let frame = cam.capture()?;
        assert_eq!((frame.width, frame.height), (320, 240));
        Ok(())
    }

    #[test]
    fn falls_back_when_preferred_is_rejected() -> Result<()> {
        let mut cam = WebcamSource::new(stub_config("stub://front?deny=preferred"));
        cam.start()?;
        assert_eq!(cam.constraints(), Some(Constraints::Fallback));
        let frame = cam.capture()?;
        assert_eq!((frame.width, frame.height), (FALLBACK_WIDTH, FALLBACK_HEIGHT));
        Ok(())
    }

    #[test]
    fn errors_only_when_both_attempts_fail() {
        let mut cam = WebcamSource::new(stub_config("stub://front?deny=all"));
        let err = cam.start().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Webcam access denied or not available. preferred: permission denied; fallback: permission denied"
        );
        assert_eq!(cam.state(), WebcamState::Idle);
    }

    #[test]
    fn error_names_both_failed_attempts() {
        let mut cam = WebcamSource::new(stub_config("stub://front?deny=preferred&warmup_failures=x"));
        let err = cam.start().unwrap_err().to_string();
        assert!(err.contains("preferred: constraints not satisfiable"), "{}", err);
        assert!(err.contains("fallback: warmup_failures must be an integer"), "{}", err);
    }

    #[test]
    fn warm_up_retries_once() -> Result<()> {
        let mut cam = WebcamSource::new(stub_config("stub://front?warmup_failures=1"));
        cam.start()?;
        assert_eq!(cam.frames_captured(), 1);
        Ok(())
    }

    #[test]
    fn start_is_idempotent_and_stop_releases() -> Result<()> {
        let mut cam = WebcamSource::new(stub_config("stub://front"));
        cam.start()?;
        cam.start()?;
        assert_eq!(cam.frames_captured(), 1);
        cam.stop();
        assert_eq!(cam.state(), WebcamState::Idle);
        assert!(cam.capture().is_err());
        assert_eq!(cam.readiness(), Readiness::NotReady("webcam stopped"));
        Ok(())
    }
}
