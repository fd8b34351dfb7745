//! Uploaded video source.
//!
//! A `VideoSource` holds at most one decoder. Loading a new file replaces and
//! releases the previous decoder. Playback follows a wall-clock
//! [`PlaybackClock`]; `capture` returns the frame at the current playback
//! position and flips the source to `Ended` once the clip runs out.
//!
//! Only local paths are accepted. `stub://name?ms=N&fps=F&size=WxH` loads a
//! synthetic clip of `N` milliseconds.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::{synthetic_pixels, Frame, LiveSource, Readiness};
use crate::geometry::DisplayRect;

#[cfg(feature = "video-ffmpeg")]
use super::video_ffmpeg::FfmpegClip;

const STUB_DEFAULT_MS: u64 = 2_000;
const STUB_DEFAULT_WIDTH: u32 = 320;
const STUB_DEFAULT_HEIGHT: u32 = 240;

/// Configuration for video playback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoConfig {
    /// Frame rate assumed when a clip carries no timestamps (and for stub clips
    /// that do not name one).
    pub target_fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { target_fps: 30 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing loaded.
    Idle,
    Playing,
    Paused,
    Ended,
}

/// Wall-clock playback position.
#[derive(Clone, Debug, Default)]
pub struct PlaybackClock {
    base: Duration,
    started_at: Option<Instant>,
}

impl PlaybackClock {
    pub fn play(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        self.base = self.position();
        self.started_at = None;
    }

    pub fn reset(&mut self) {
        self.base = Duration::ZERO;
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn position(&self) -> Duration {
        match self.started_at {
            Some(started) => self.base + started.elapsed(),
            None => self.base,
        }
    }
}

enum VideoClip {
    Synthetic(SyntheticClip),
    #[cfg(feature = "video-ffmpeg")]
    Ffmpeg(Box<FfmpegClip>),
}

impl VideoClip {
    fn open(path: &str, config: &VideoConfig) -> Result<Self> {
        if path.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticClip::parse(path, config)?));
        }
        #[cfg(feature = "video-ffmpeg")]
        {
            Ok(Self::Ffmpeg(Box::new(FfmpegClip::open(path, config)?)))
        }
        #[cfg(not(feature = "video-ffmpeg"))]
        {
            Err(anyhow!("video playback requires the video-ffmpeg feature"))
        }
    }

    fn frame_at(&mut self, position: Duration) -> Result<Option<Frame>> {
        match self {
            Self::Synthetic(clip) => clip.frame_at(position),
            #[cfg(feature = "video-ffmpeg")]
            Self::Ffmpeg(clip) => clip.frame_at(position),
        }
    }

    fn duration(&self) -> Option<Duration> {
        match self {
            Self::Synthetic(clip) => Some(clip.duration),
            #[cfg(feature = "video-ffmpeg")]
            Self::Ffmpeg(clip) => clip.duration(),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Synthetic(clip) => (clip.width, clip.height),
            #[cfg(feature = "video-ffmpeg")]
            Self::Ffmpeg(clip) => clip.dimensions(),
        }
    }

    #[cfg_attr(not(feature = "video-ffmpeg"), allow(unused_variables))]
    fn rewind(&mut self, path: &str, config: &VideoConfig) -> Result<()> {
        match self {
            Self::Synthetic(_) => Ok(()),
            #[cfg(feature = "video-ffmpeg")]
            Self::Ffmpeg(_) => {
                *self = Self::open(path, config)?;
                Ok(())
            }
        }
    }
}

pub struct VideoSource {
    config: VideoConfig,
    clip: Option<VideoClip>,
    path: Option<String>,
    state: PlaybackState,
    clock: PlaybackClock,
    frame_count: u64,
}

impl VideoSource {
    pub fn new(config: VideoConfig) -> Self {
        Self {
            config,
            clip: None,
            path: None,
            state: PlaybackState::Idle,
            clock: PlaybackClock::default(),
            frame_count: 0,
        }
    }

    /// Open `path`, releasing any previously loaded clip. A failed load leaves
    /// the previous clip in place.
    pub fn load(&mut self, path: &str) -> Result<()> {
        if !is_local_file_path(path) {
            return Err(anyhow!(
                "video playback only supports local paths (no URL schemes)"
            ));
        }
        let clip = VideoClip::open(path, &self.config)
            .with_context(|| format!("failed to load video '{}'", path))?;
        let (width, height) = clip.dimensions();

        self.unload();
        self.clip = Some(clip);
        self.path = Some(path.to_string());
        self.state = PlaybackState::Paused;
        log::info!("VideoSource: loaded {} ({}x{})", path, width, height);
        Ok(())
    }

    /// Release the current clip, if any.
    pub fn unload(&mut self) {
        if self.clip.take().is_some() {
            log::info!(
                "VideoSource: released {} after {} frames",
                self.path.as_deref().unwrap_or("<unknown>"),
                self.frame_count
            );
        }
        self.path = None;
        self.state = PlaybackState::Idle;
        self.clock.reset();
        self.frame_count = 0;
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state() {
            PlaybackState::Idle => Err(anyhow!("no video loaded")),
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => {
                self.clock.play();
                self.state = PlaybackState::Playing;
                Ok(())
            }
            PlaybackState::Ended => {
                if let (Some(clip), Some(path)) = (self.clip.as_mut(), self.path.as_deref()) {
                    clip.rewind(path, &self.config)?;
                }
                self.clock.reset();
                self.clock.play();
                self.state = PlaybackState::Playing;
                Ok(())
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.clock.pause();
            self.state = PlaybackState::Paused;
        }
    }

    /// Playback state; a clip that played past its end reports `Ended`.
    pub fn state(&self) -> PlaybackState {
        if self.state == PlaybackState::Playing && self.past_end() {
            PlaybackState::Ended
        } else {
            self.state
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn position(&self) -> Duration {
        self.clock.position()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.clip.as_ref().and_then(VideoClip::duration)
    }

    /// Intrinsic frame size, once a clip is loaded.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.clip.as_ref().map(VideoClip::dimensions)
    }

    /// Natural display rect for the loaded clip.
    pub fn natural_rect(&self) -> Option<DisplayRect> {
        self.dimensions()
            .map(|(w, h)| DisplayRect::new(f64::from(w), f64::from(h)))
    }

    /// Frame at the current position, playing or paused. Used for display;
    /// the polling loop goes through `readiness` and `capture`.
    pub fn current_frame(&mut self) -> Result<Frame> {
        match self.state() {
            PlaybackState::Idle => Err(anyhow!("no video loaded")),
            PlaybackState::Ended => Err(anyhow!("video ended")),
            PlaybackState::Playing | PlaybackState::Paused => self.capture(),
        }
    }

    fn past_end(&self) -> bool {
        self.duration()
            .map(|duration| self.clock.position() >= duration)
            .unwrap_or(false)
    }

    fn mark_ended(&mut self) {
        self.clock.pause();
        self.state = PlaybackState::Ended;
        log::info!(
            "VideoSource: {} ended",
            self.path.as_deref().unwrap_or("<unknown>")
        );
    }
}

impl LiveSource for VideoSource {
    fn describe(&self) -> String {
        format!("video {}", self.path.as_deref().unwrap_or("<none>"))
    }

    fn readiness(&self) -> Readiness {
        match self.state {
            PlaybackState::Idle => Readiness::NotReady("no video loaded"),
            PlaybackState::Ended => Readiness::Ended,
            PlaybackState::Paused => Readiness::NotReady("video paused"),
            PlaybackState::Playing if self.past_end() => Readiness::Ended,
            PlaybackState::Playing => match self.dimensions() {
                Some((w, h)) if w > 0 && h > 0 => Readiness::Ready,
                _ => Readiness::NotReady("video has no frame dimensions yet"),
            },
        }
    }

    fn capture(&mut self) -> Result<Frame> {
        if self.state == PlaybackState::Ended {
            return Err(anyhow!("video ended"));
        }
        let position = self.clock.position();
        let clip = self.clip.as_mut().ok_or_else(|| anyhow!("no video loaded"))?;
        match clip.frame_at(position)? {
            Some(frame) => {
                self.frame_count += 1;
                Ok(frame)
            }
            None => {
                self.mark_ended();
                Err(anyhow!("video ended"))
            }
        }
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.unload();
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticClip {
    duration: Duration,
    fps: u32,
    width: u32,
    height: u32,
}

impl SyntheticClip {
    fn parse(path: &str, config: &VideoConfig) -> Result<Self> {
        let url = url::Url::parse(path).map_err(|e| anyhow!("invalid stub clip '{}': {}", path, e))?;
        let mut clip = Self {
            duration: Duration::from_millis(STUB_DEFAULT_MS),
            fps: config.target_fps.max(1),
            width: STUB_DEFAULT_WIDTH,
            height: STUB_DEFAULT_HEIGHT,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ms" => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| anyhow!("stub clip ms must be an integer"))?;
                    clip.duration = Duration::from_millis(ms);
                }
                "fps" => {
                    let fps: u32 = value
                        .parse()
                        .map_err(|_| anyhow!("stub clip fps must be an integer"))?;
                    clip.fps = fps.max(1);
                }
                "size" => {
                    let rect = DisplayRect::parse(&value)?;
                    clip.width = rect.width as u32;
                    clip.height = rect.height as u32;
                }
                _ => {}
            }
        }
        Ok(clip)
    }

    fn frame_at(&mut self, position: Duration) -> Result<Option<Frame>> {
        if position >= self.duration {
            return Ok(None);
        }
        let index = position.as_millis() as u64 * u64::from(self.fps) / 1_000;
        Frame::from_rgb(
            synthetic_pixels(self.width, self.height, index),
            self.width,
            self.height,
        )
        .map(Some)
    }
}
