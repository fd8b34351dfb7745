//! Video file decoding using FFmpeg.
//!
//! Frames are decoded forward only. `frame_at` advances the decoder until the
//! next frame would be later than the requested position and returns the most
//! recent frame at or before it.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::Duration;

use super::video::VideoConfig;
use super::Frame;

pub(crate) struct FfmpegClip {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_interval: Duration,
    duration: Option<Duration>,
    current: Option<(Duration, Frame)>,
    pending: Option<(Duration, Frame)>,
    decoded: u64,
    drained: bool,
}

impl FfmpegClip {
    pub(crate) fn open(path: &str, config: &VideoConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open video '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let duration = match input.duration() {
            d if d > 0 => Some(Duration::from_micros(d as u64)),
            _ => None,
        };
        let fps = config.target_fps.max(1);

        Ok(Self {
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            frame_interval: Duration::from_secs(1) / fps,
            duration,
            current: None,
            pending: None,
            decoded: 0,
            drained: false,
        })
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.decoder.width(), self.decoder.height())
    }

    pub(crate) fn frame_at(&mut self, position: Duration) -> Result<Option<Frame>> {
        if let Some(duration) = self.duration {
            if position >= duration {
                return Ok(None);
            }
        }

        loop {
            if let Some((pts, _)) = &self.pending {
                if *pts > position && self.current.is_some() {
                    break;
                }
                self.current = self.pending.take();
                continue;
            }
            match self.decode_next()? {
                Some(next) => self.pending = Some(next),
                None => break,
            }
        }

        match &self.current {
            Some((pts, frame)) => {
                if self.drained && self.pending.is_none() && position > *pts + self.frame_interval
                {
                    return Ok(None);
                }
                Ok(Some(frame.clone()))
            }
            None => Ok(None),
        }
    }

    fn decode_next(&mut self) -> Result<Option<(Duration, Frame)>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.drained {
                return Ok(None);
            }

            let mut sent = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.drained = true;
            }
        }
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<(Duration, Frame)> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;

        let pts = match decoded.timestamp() {
            Some(ts) if ts >= 0 => Duration::from_secs_f64(ts as f64 * self.time_base),
            _ => self.frame_interval * (self.decoded as u32),
        };
        self.decoded += 1;
        Ok((pts, Frame::from_rgb(pixels, width, height)?))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is smaller than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
