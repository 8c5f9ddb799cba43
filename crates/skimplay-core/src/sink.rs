//! Output sinks: where finished audio blocks and due video frames go.
//!
//! Audio and video are delivered from separate worker threads, so the two
//! halves are separate traits. Sinks apply backpressure by blocking in
//! `accept_*`; the workers treat a slow accept as the device being busy.
//!
//! [`PacedAudioSink`] and [`RecordingVideoSink`] are headless sinks for hosts
//! without an audio device or a screen. They log what they receive into a
//! shared [`SinkLog`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::frame::{frames_to_duration, VideoFrame};

/// A block of stretched audio ready for the device.
#[derive(Debug, Clone)]
pub struct AudioOutput {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Source range the block was produced from.
    pub source_start: Duration,
    pub source_end: Duration,
    /// The same range on the logical timeline.
    pub logical_start: Duration,
    pub logical_end: Duration,
    /// Rate the block was stretched by.
    pub rate: f64,
}

impl AudioOutput {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// How long the block takes to play.
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }
}

/// A video frame whose presentation time has come.
#[derive(Debug, Clone)]
pub struct VideoOutput {
    pub frame: VideoFrame,
    pub logical_ts: Duration,
    /// Master clock reading when the frame was handed over.
    pub clock: Duration,
}

/// Consumer of audio blocks.
pub trait AudioSink: Send {
    /// Takes a block, blocking while the device has no room for it.
    fn accept_audio(&mut self, block: AudioOutput);

    /// Drops anything queued in the device (seek, map replacement).
    fn flush(&mut self) {}
}

/// Consumer of video frames.
pub trait VideoSink: Send {
    /// Shows a frame. Called at its presentation time.
    fn accept_video(&mut self, frame: VideoOutput);
}

/// What a recorded audio block covered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioRecord {
    pub source_start: Duration,
    pub source_end: Duration,
    pub logical_start: Duration,
    pub logical_end: Duration,
    pub output: Duration,
    pub rate: f64,
    /// Longest run of exact zeros in the block, in frames.
    pub longest_silence: usize,
}

/// What a recorded video frame covered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoRecord {
    pub source_ts: Duration,
    pub logical_ts: Duration,
    pub clock: Duration,
}

#[derive(Debug, Default)]
struct SinkLogInner {
    audio: Vec<AudioRecord>,
    video: Vec<VideoRecord>,
    flushes: u32,
}

/// Shared record of everything the headless sinks received.
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    inner: Arc<Mutex<SinkLogInner>>,
}

impl SinkLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio(&self) -> Vec<AudioRecord> {
        self.inner.lock().audio.clone()
    }

    pub fn video(&self) -> Vec<VideoRecord> {
        self.inner.lock().video.clone()
    }

    pub fn audio_flushes(&self) -> u32 {
        self.inner.lock().flushes
    }

    /// Logical time covered by all recorded audio.
    pub fn audio_logical_duration(&self) -> Duration {
        self.inner
            .lock()
            .audio
            .iter()
            .map(|r| r.logical_end.saturating_sub(r.logical_start))
            .sum()
    }

    /// Playing time of all recorded audio.
    pub fn audio_output_duration(&self) -> Duration {
        self.inner.lock().audio.iter().map(|r| r.output).sum()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.audio.clear();
        inner.video.clear();
        inner.flushes = 0;
    }
}

/// Audio sink that plays nothing but takes as long as playing would.
pub struct PacedAudioSink {
    log: SinkLog,
    time_scale: f64,
}

impl PacedAudioSink {
    /// A sink consuming `time_scale` times faster than real time.
    pub fn new(log: SinkLog, time_scale: f64) -> Self {
        Self {
            log,
            time_scale: if time_scale > 0.0 { time_scale } else { 1.0 },
        }
    }
}

impl AudioSink for PacedAudioSink {
    fn accept_audio(&mut self, block: AudioOutput) {
        let channels = block.channels.max(1) as usize;
        let mut longest_silence = 0;
        let mut run = 0;
        for frame in block.samples.chunks(channels) {
            if frame.iter().all(|s| *s == 0.0) {
                run += 1;
                longest_silence = longest_silence.max(run);
            } else {
                run = 0;
            }
        }

        let output = block.duration();
        self.log.inner.lock().audio.push(AudioRecord {
            source_start: block.source_start,
            source_end: block.source_end,
            logical_start: block.logical_start,
            logical_end: block.logical_end,
            output,
            rate: block.rate,
            longest_silence,
        });
        thread::sleep(output.div_f64(self.time_scale));
    }

    fn flush(&mut self) {
        self.log.inner.lock().flushes += 1;
    }
}

/// Video sink that records presentation times.
pub struct RecordingVideoSink {
    log: SinkLog,
}

impl RecordingVideoSink {
    pub fn new(log: SinkLog) -> Self {
        Self { log }
    }
}

impl VideoSink for RecordingVideoSink {
    fn accept_video(&mut self, output: VideoOutput) {
        tracing::trace!(
            "present {:?} (logical {:?}, clock {:?})",
            output.frame.source_ts,
            output.logical_ts,
            output.clock
        );
        self.log.inner.lock().video.push(VideoRecord {
            source_ts: output.frame.source_ts,
            logical_ts: output.logical_ts,
            clock: output.clock,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Picture;

    #[test]
    fn test_paced_sink_records_blocks() {
        let log = SinkLog::new();
        let mut sink = PacedAudioSink::new(log.clone(), 100.0);
        let mut samples = vec![0.5f32; 200];
        samples[10..40].iter_mut().for_each(|s| *s = 0.0);
        sink.accept_audio(AudioOutput {
            samples,
            sample_rate: 1_000,
            channels: 2,
            source_start: Duration::from_secs(1),
            source_end: Duration::from_millis(1200),
            logical_start: Duration::from_millis(500),
            logical_end: Duration::from_millis(600),
            rate: 2.0,
        });

        let records = log.audio();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output, Duration::from_millis(100));
        assert_eq!(records[0].longest_silence, 15);
        assert_eq!(log.audio_logical_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_recording_video_sink() {
        let log = SinkLog::new();
        let mut sink = RecordingVideoSink::new(log.clone());
        let frame = VideoFrame::new(
            Duration::from_secs(3),
            Duration::from_millis(40),
            Picture::solid_rgba(2, 2, [0, 0, 0, 255]),
        );
        sink.accept_video(VideoOutput {
            frame,
            logical_ts: Duration::from_secs(2),
            clock: Duration::from_millis(1995),
        });
        let video = log.video();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].source_ts, Duration::from_secs(3));

        log.clear();
        assert!(log.video().is_empty());
    }
}
