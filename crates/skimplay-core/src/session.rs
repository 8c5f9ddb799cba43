//! The playback session: state shared by the control thread and the workers.
//!
//! Everything here is either immutable for the life of the session or
//! internally synchronized, so workers hold it behind an `Arc` and never take
//! a session-wide lock.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::buffer::{AudioBuffer, VideoBuffer};
use crate::clock::SyncClock;
use crate::config::PlayerConfig;
use crate::error::{SourceError, StretchError};
use crate::frame::StreamKind;
use crate::player::{PlaybackState, Position};
use crate::segment_map::SegmentMap;
use crate::source::SourceInfo;
use crate::sync_metrics::SyncMetrics;
use crate::timeline::TimelineMapper;

/// Reports from worker threads to the control thread.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerEvent {
    /// The source failed after exhausting its retries.
    SourceFailed(SourceError),
    /// Time-stretching broke down; audio continues unstretched.
    StretchDegraded(StretchError),
}

pub(crate) struct Session {
    pub config: PlayerConfig,
    pub info: SourceInfo,
    pub mapper: TimelineMapper,
    pub audio: AudioBuffer,
    pub video: VideoBuffer,
    pub clock: SyncClock,
    pub metrics: SyncMetrics,
    state: RwLock<PlaybackState>,
    /// Output workers consume only while set.
    playing: AtomicBool,
    stopped: AtomicBool,
    /// The audio worker has delivered its end-of-stream tail.
    audio_finished: AtomicBool,
    /// The decode worker is holding media until the map's scope grows.
    awaiting_analysis: AtomicBool,
}

impl Session {
    pub fn new(config: PlayerConfig, info: SourceInfo, map: SegmentMap) -> Self {
        let session = Self {
            mapper: TimelineMapper::new(map, config.min_skip_jump),
            audio: AudioBuffer::new(StreamKind::Audio, config.audio_buffer),
            video: VideoBuffer::new(StreamKind::Video, config.video_buffer),
            clock: SyncClock::with_time_scale(config.time_scale),
            metrics: SyncMetrics::new(),
            state: RwLock::new(PlaybackState::Opening),
            playing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            audio_finished: AtomicBool::new(info.audio.is_none()),
            awaiting_analysis: AtomicBool::new(false),
            config,
            info,
        };
        session
            .metrics
            .set_using_audio_clock(session.info.audio.is_some());
        session.mark_absent_streams();
        session
    }

    /// Streams the source lacks are permanently at end of stream.
    fn mark_absent_streams(&self) {
        if self.info.audio.is_none() {
            self.audio.set_eos(self.audio.generation());
        }
        if self.info.video.is_none() {
            self.video.set_eos(self.video.generation());
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state.read().clone()
    }

    /// Stores `state`, returning the previous one.
    pub fn set_state(&self, state: PlaybackState) -> PlaybackState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops every worker: buffers wake their waiters and refuse new frames.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        self.audio.stop();
        self.video.stop();
    }

    pub fn audio_finished(&self) -> bool {
        self.audio_finished.load(Ordering::Acquire)
    }

    pub fn set_audio_finished(&self, finished: bool) {
        self.audio_finished.store(finished, Ordering::Release);
    }

    pub fn awaiting_analysis(&self) -> bool {
        self.awaiting_analysis.load(Ordering::Acquire)
    }

    pub fn set_awaiting_analysis(&self, waiting: bool) {
        self.awaiting_analysis.store(waiting, Ordering::Release);
    }

    /// Flushes both buffers, returning their new `(audio, video)` generations.
    pub fn flush_buffers(&self) -> (u64, u64) {
        let generations = (self.audio.flush(), self.video.flush());
        self.mark_absent_streams();
        self.set_audio_finished(self.info.audio.is_none());
        generations
    }

    /// Both buffers can sustain playback.
    pub fn buffers_ready(&self) -> bool {
        self.audio.is_ready() && self.video.is_ready()
    }

    /// Either buffer dropped below its low watermark.
    pub fn buffers_low(&self) -> bool {
        self.audio.is_low() || self.video.is_low()
    }

    /// All media has been decoded and presented.
    pub fn is_ended(&self) -> bool {
        self.audio.is_drained() && self.video.is_drained() && self.audio_finished()
    }

    pub fn position(&self) -> Position {
        let map = self.mapper.map();
        let logical = self.clock.now();
        Position {
            logical,
            source: map.logical_to_source(logical),
            map_version: map.version,
        }
    }
}
