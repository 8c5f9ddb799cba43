//! Decoded frame sources.
//!
//! [`FrameSource`] is the seam to the native demux/decode library: it hands
//! out decoded frames per stream with source-timeline timestamps and seeks on
//! request. [`RetryPolicy`] wraps source calls so transient failures are
//! retried a bounded number of times before they reach the state machine.
//!
//! [`SyntheticSource`] is a self-contained implementation producing a sine
//! tone and solid-colour pictures, used by the demo and the tests.

use std::thread;
use std::time::Duration;

use crate::error::SourceError;
use crate::frame::{frames_to_duration, AudioFrame, Frame, Picture, StreamKind, VideoFrame};

/// Audio stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Video stream parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
}

/// What an opened source contains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    /// Total source duration, if known (unknown for live streams).
    pub duration: Option<Duration>,
    pub audio: Option<AudioFormat>,
    pub video: Option<VideoFormat>,
}

impl SourceInfo {
    pub fn has_stream(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Audio => self.audio.is_some(),
            StreamKind::Video => self.video.is_some(),
        }
    }
}

/// One step of a stream.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(Frame),
    /// The stream is exhausted. Not an error.
    EndOfStream,
}

/// Trait for decoded frame sources.
pub trait FrameSource: Send {
    /// Opens the media behind `uri`.
    fn open(uri: &str) -> Result<Self, SourceError>
    where
        Self: Sized;

    /// Describes the opened media.
    fn info(&self) -> SourceInfo;

    /// Decodes the next frame of `stream`.
    fn next_frame(&mut self, stream: StreamKind) -> Result<SourceEvent, SourceError>;

    /// Repositions every stream at `source_ts` (or the closest earlier point
    /// the source can decode from).
    fn seek(&mut self, source_ts: Duration) -> Result<(), SourceError>;

    /// Releases native resources. Called once when the session ends.
    fn close(&mut self) {}
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(_uri: &str) -> Result<Self, SourceError>
    where
        Self: Sized,
    {
        // Not supported on boxed trait objects - use concrete types for open
        Err(SourceError::Open(
            "cannot call open() on a boxed source".to_string(),
        ))
    }

    fn info(&self) -> SourceInfo {
        (**self).info()
    }

    fn next_frame(&mut self, stream: StreamKind) -> Result<SourceEvent, SourceError> {
        (**self).next_frame(stream)
    }

    fn seek(&mut self, source_ts: Duration) -> Result<(), SourceError> {
        (**self).seek(source_ts)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Bounded retry with linear backoff around source operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// Errors that are not [transient](SourceError::is_transient) are
    /// returned immediately.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    tracing::error!("{} failed after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying",
                        label,
                        attempt,
                        self.attempts,
                        e
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
            }
        }
    }
}

/// Parameters of a [`SyntheticSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub duration: Duration,
    /// `None` for a video-only source.
    pub audio: Option<AudioFormat>,
    /// `None` for an audio-only source.
    pub video: Option<VideoFormat>,
    /// Audio block length emitted per `next_frame` call.
    pub audio_block: Duration,
    /// Tone frequency in Hz.
    pub tone_hz: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            audio: Some(AudioFormat {
                sample_rate: 8_000,
                channels: 1,
            }),
            video: Some(VideoFormat {
                width: 16,
                height: 9,
                frame_rate: 25.0,
            }),
            audio_block: Duration::from_millis(20),
            tone_hz: 440.0,
        }
    }
}

impl SyntheticConfig {
    /// Parses `synthetic://?duration=60&fps=25&sample_rate=8000&channels=1`.
    ///
    /// Every parameter is optional; `audio=0` or `video=0` drops a stream.
    pub fn from_uri(uri: &str) -> Result<Self, SourceError> {
        let rest = uri
            .strip_prefix("synthetic://")
            .ok_or_else(|| SourceError::Open(format!("not a synthetic uri: {uri}")))?;
        let query = rest.split_once('?').map_or("", |(_, q)| q);

        let mut config = Self::default();
        let mut audio = config.audio.unwrap_or(AudioFormat {
            sample_rate: 8_000,
            channels: 1,
        });
        let mut video = config.video.unwrap_or(VideoFormat {
            width: 16,
            height: 9,
            frame_rate: 25.0,
        });
        let (mut has_audio, mut has_video) = (true, true);

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| SourceError::Open(format!("malformed parameter '{pair}'")))?;
            let bad = || SourceError::Open(format!("bad value for '{key}': {value}"));
            match key {
                "duration" => {
                    let secs: f64 = value.parse().map_err(|_| bad())?;
                    config.duration = Duration::try_from_secs_f64(secs).map_err(|_| bad())?;
                }
                "fps" => video.frame_rate = value.parse().map_err(|_| bad())?,
                "width" => video.width = value.parse().map_err(|_| bad())?,
                "height" => video.height = value.parse().map_err(|_| bad())?,
                "sample_rate" => audio.sample_rate = value.parse().map_err(|_| bad())?,
                "channels" => audio.channels = value.parse().map_err(|_| bad())?,
                "block_ms" => {
                    config.audio_block = Duration::from_millis(value.parse().map_err(|_| bad())?)
                }
                "tone" => config.tone_hz = value.parse().map_err(|_| bad())?,
                "audio" => has_audio = value != "0",
                "video" => has_video = value != "0",
                other => {
                    return Err(SourceError::Open(format!("unknown parameter '{other}'")));
                }
            }
        }

        if video.frame_rate <= 0.0 || audio.sample_rate == 0 || audio.channels == 0 {
            return Err(SourceError::Open(format!("degenerate stream format in {uri}")));
        }
        config.audio = has_audio.then_some(audio);
        config.video = has_video.then_some(video);
        Ok(config)
    }
}

/// A deterministic source of a sine tone and numbered solid-colour pictures.
pub struct SyntheticSource {
    config: SyntheticConfig,
    /// Next audio sample frame index.
    audio_pos: u64,
    /// Next video frame index.
    video_pos: u64,
    seeks: u32,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            audio_pos: 0,
            video_pos: 0,
            seeks: 0,
        }
    }

    /// Number of seeks performed so far.
    pub fn seek_count(&self) -> u32 {
        self.seeks
    }

    fn frame_interval_ns(format: &VideoFormat) -> u64 {
        (1e9 / format.frame_rate as f64).round() as u64
    }

    fn next_audio(&mut self, format: AudioFormat) -> SourceEvent {
        let total = (self.config.duration.as_nanos() * format.sample_rate as u128
            / 1_000_000_000) as u64;
        let block = (self.config.audio_block.as_nanos() * format.sample_rate as u128
            / 1_000_000_000) as u64;
        let frames = block.max(1).min(total.saturating_sub(self.audio_pos));
        if frames == 0 {
            return SourceEvent::EndOfStream;
        }

        let channels = format.channels as usize;
        let step = std::f64::consts::TAU * self.config.tone_hz as f64 / format.sample_rate as f64;
        let mut samples = Vec::with_capacity(frames as usize * channels);
        for n in self.audio_pos..self.audio_pos + frames {
            let value = ((n as f64 * step).sin() * 0.25) as f32;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        let start = frames_to_duration(self.audio_pos as usize, format.sample_rate);
        self.audio_pos += frames;

        SourceEvent::Frame(Frame::Audio(AudioFrame::new(
            start,
            format.sample_rate,
            format.channels,
            samples,
        )))
    }

    fn next_video(&mut self, format: VideoFormat) -> SourceEvent {
        let interval_ns = Self::frame_interval_ns(&format);
        let start = Duration::from_nanos(self.video_pos * interval_ns);
        if start >= self.config.duration {
            return SourceEvent::EndOfStream;
        }
        let shade = (self.video_pos % 256) as u8;
        let picture = Picture::solid_rgba(format.width, format.height, [shade, 64, 255 - shade, 255]);
        self.video_pos += 1;
        SourceEvent::Frame(Frame::Video(VideoFrame::new(
            start,
            Duration::from_nanos(interval_ns),
            picture,
        )))
    }
}

impl FrameSource for SyntheticSource {
    fn open(uri: &str) -> Result<Self, SourceError> {
        let config = SyntheticConfig::from_uri(uri)?;
        tracing::info!(
            "synthetic source: {:?}, audio={:?}, video={:?}",
            config.duration,
            config.audio,
            config.video
        );
        Ok(Self::new(config))
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            duration: Some(self.config.duration),
            audio: self.config.audio,
            video: self.config.video,
        }
    }

    fn next_frame(&mut self, stream: StreamKind) -> Result<SourceEvent, SourceError> {
        match stream {
            StreamKind::Audio => match self.config.audio {
                Some(format) => Ok(self.next_audio(format)),
                None => Ok(SourceEvent::EndOfStream),
            },
            StreamKind::Video => match self.config.video {
                Some(format) => Ok(self.next_video(format)),
                None => Ok(SourceEvent::EndOfStream),
            },
        }
    }

    fn seek(&mut self, source_ts: Duration) -> Result<(), SourceError> {
        let target = source_ts.min(self.config.duration);
        if let Some(format) = self.config.audio {
            self.audio_pos =
                (target.as_nanos() * format.sample_rate as u128 / 1_000_000_000) as u64;
        }
        if let Some(format) = self.config.video {
            self.video_pos = (target.as_nanos() / Self::frame_interval_ns(&format) as u128) as u64;
        }
        self.seeks += 1;
        tracing::debug!("synthetic source: seek to {:?}", target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_frame(event: SourceEvent) -> Frame {
        match event {
            SourceEvent::Frame(frame) => frame,
            SourceEvent::EndOfStream => panic!("unexpected end of stream"),
        }
    }

    #[test]
    fn test_uri_parsing() {
        let config =
            SyntheticConfig::from_uri("synthetic://?duration=60&fps=30&sample_rate=16000&video=0")
                .unwrap();
        assert_eq!(config.duration, Duration::from_secs(60));
        assert_eq!(config.audio.unwrap().sample_rate, 16_000);
        assert!(config.video.is_none());

        assert!(SyntheticConfig::from_uri("file:///tmp/a.mp4").is_err());
        assert!(SyntheticConfig::from_uri("synthetic://?bogus=1").is_err());
        assert!(SyntheticConfig::from_uri("synthetic://?fps=abc").is_err());
    }

    #[test]
    fn test_streams_are_contiguous_and_end() {
        let mut source = SyntheticSource::open("synthetic://?duration=0.1&block_ms=20").unwrap();

        let mut expected = Duration::ZERO;
        let mut blocks = 0;
        while let SourceEvent::Frame(frame) = source.next_frame(StreamKind::Audio).unwrap() {
            assert_eq!(frame.source_ts(), expected);
            expected = frame.end_ts();
            blocks += 1;
        }
        assert_eq!(blocks, 5);
        assert_eq!(expected, Duration::from_millis(100));

        let mut pictures = 0;
        while let SourceEvent::Frame(_) = source.next_frame(StreamKind::Video).unwrap() {
            pictures += 1;
        }
        assert_eq!(pictures, 3);
    }

    #[test]
    fn test_seek_repositions_both_streams() {
        let mut source = SyntheticSource::open("synthetic://?duration=10").unwrap();
        source.seek(Duration::from_secs(4)).unwrap();

        let audio = expect_frame(source.next_frame(StreamKind::Audio).unwrap());
        assert_eq!(audio.source_ts(), Duration::from_secs(4));
        let video = expect_frame(source.next_frame(StreamKind::Video).unwrap());
        assert_eq!(video.source_ts(), Duration::from_secs(4));
        assert_eq!(source.seek_count(), 1);
    }

    #[test]
    fn test_retry_policy_recovers_from_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result = policy.run("next_frame", || {
            calls += 1;
            if calls < 3 {
                Err(SourceError::Transient("timeout".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));

        let mut calls = 0;
        let result: Result<(), _> = policy.run("seek", || {
            calls += 1;
            Err(SourceError::Seek("no index".into()))
        });
        assert_eq!(result, Err(SourceError::Seek("no index".into())));
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result: Result<(), _> = policy.run("open", || {
            calls += 1;
            Err(SourceError::Open("404".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(!SourceError::Open("404".into()).is_transient());
        assert!(SourceError::Unreachable("dns".into()).is_transient());
    }
}
