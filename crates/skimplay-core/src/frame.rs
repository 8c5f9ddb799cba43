//! Decoded media frames.
//!
//! A [`Frame`] is either a block of interleaved audio samples or a decoded
//! picture. Both carry the source-timeline timestamp reported by the decoder;
//! logical timestamps are derived from it on demand and never stored.

use std::time::Duration;

/// Which elementary stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Video => write!(f, "video"),
        }
    }
}

/// A decoded RGBA picture with CPU-accessible pixel data.
#[derive(Debug, Clone)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, may include padding.
    pub stride: usize,
    pub data: Vec<u8>,
}

impl Picture {
    /// A picture filled with one colour.
    pub fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let stride = width as usize * 4;
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(stride * height as usize)
            .collect();
        Self {
            width,
            height,
            stride,
            data,
        }
    }
}

/// A block of interleaved `f32` audio samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Source timestamp of the first sample.
    pub source_ts: Duration,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples, `frames() * channels` long.
    pub samples: Vec<f32>,
    /// Set on the first frame after a skip-jump or seek: the input is not
    /// contiguous with whatever came before it.
    pub discontinuity: bool,
}

impl AudioFrame {
    pub fn new(source_ts: Duration, sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            source_ts,
            sample_rate,
            channels,
            samples,
            discontinuity: false,
        }
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }

    pub fn end_ts(&self) -> Duration {
        self.source_ts + self.duration()
    }

    /// Copies out the samples covering the source range `[start, end)`.
    ///
    /// The range is clamped to the frame and rounded to whole sample frames;
    /// returns `None` if nothing is left.
    pub fn slice(&self, start: Duration, end: Duration) -> Option<AudioFrame> {
        let total = self.frames();
        let index_of = |t: Duration| -> usize {
            let offset = t.saturating_sub(self.source_ts).as_secs_f64();
            ((offset * self.sample_rate as f64).round() as usize).min(total)
        };
        let first = index_of(start.max(self.source_ts));
        let last = index_of(end);
        if last <= first {
            return None;
        }

        let channels = self.channels.max(1) as usize;
        Some(AudioFrame {
            source_ts: self.source_ts + frames_to_duration(first, self.sample_rate),
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: self.samples[first * channels..last * channels].to_vec(),
            discontinuity: self.discontinuity && first == 0,
        })
    }
}

/// A decoded video picture.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Source timestamp at which the picture is due.
    pub source_ts: Duration,
    /// How long the picture stays on screen at normal speed.
    pub duration: Duration,
    pub picture: Picture,
    pub discontinuity: bool,
}

impl VideoFrame {
    pub fn new(source_ts: Duration, duration: Duration, picture: Picture) -> Self {
        Self {
            source_ts,
            duration,
            picture,
            discontinuity: false,
        }
    }

    pub fn end_ts(&self) -> Duration {
        self.source_ts + self.duration
    }
}

/// A decoded frame from either stream.
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub fn stream(&self) -> StreamKind {
        match self {
            Frame::Audio(_) => StreamKind::Audio,
            Frame::Video(_) => StreamKind::Video,
        }
    }

    pub fn source_ts(&self) -> Duration {
        match self {
            Frame::Audio(a) => a.source_ts,
            Frame::Video(v) => v.source_ts,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Frame::Audio(a) => a.duration(),
            Frame::Video(v) => v.duration,
        }
    }

    pub fn end_ts(&self) -> Duration {
        self.source_ts() + self.duration()
    }

    pub fn set_discontinuity(&mut self) {
        match self {
            Frame::Audio(a) => a.discontinuity = true,
            Frame::Video(v) => v.discontinuity = true,
        }
    }
}

/// Duration of `frames` sample frames at `sample_rate`.
pub fn frames_to_duration(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frames as u64 * 1_000_000_000 / sample_rate as u64)
}

/// Number of whole sample frames in `duration` at `sample_rate`.
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}
