//! Output workers: audio is stretched and handed to the sink, video is paced
//! against the master clock.
//!
//! Both workers consume only while the session is playing. A buffer
//! generation change (seek, map replacement) between two pops means every
//! piece of state derived from earlier frames is stale; the audio worker
//! resets its stretcher and flushes its sink when it sees one.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::StretchError;
use crate::frame::{AudioFrame, VideoFrame};
use crate::segment_map::SegmentKind;
use crate::session::{Session, WorkerEvent};
use crate::sink::{AudioOutput, AudioSink, VideoOutput, VideoSink};
use crate::stretch::{AudioStretcher, StretchedBlock};
use crate::timeline::RateCursor;

/// Sleep while paused or stopped-but-not-joined.
const IDLE: Duration = Duration::from_millis(5);
/// How long the audio worker waits on an empty buffer per poll.
const AUDIO_POLL: Duration = Duration::from_millis(20);
/// How long the video worker sleeps on an empty buffer per poll.
const VIDEO_POLL: Duration = Duration::from_millis(5);
/// Consecutive empty polls that count as an underrun.
const UNDERRUN_POLLS: u32 = 32;
/// Longest single sleep while holding an early frame.
const MAX_HOLD_SLICE: Duration = Duration::from_micros(13_889);

/// Spawns the audio output thread.
pub(crate) fn spawn_audio_worker(
    session: Arc<Session>,
    sink: Box<dyn AudioSink>,
    stretcher: AudioStretcher,
    events: Sender<WorkerEvent>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("skimplay-audio".to_string())
        .spawn(move || AudioWorker::new(session, sink, stretcher, events).run())
}

/// Spawns the video output thread.
pub(crate) fn spawn_video_worker(
    session: Arc<Session>,
    sink: Box<dyn VideoSink>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("skimplay-video".to_string())
        .spawn(move || VideoWorker::new(session, sink).run())
}

struct AudioWorker {
    session: Arc<Session>,
    sink: Box<dyn AudioSink>,
    stretcher: AudioStretcher,
    events: Sender<WorkerEvent>,
    cursor: RateCursor,
    generation: u64,
    empty_polls: u32,
}

impl AudioWorker {
    fn new(
        session: Arc<Session>,
        sink: Box<dyn AudioSink>,
        stretcher: AudioStretcher,
        events: Sender<WorkerEvent>,
    ) -> Self {
        let generation = session.audio.generation();
        Self {
            session,
            sink,
            stretcher,
            events,
            cursor: RateCursor::new(),
            generation,
            empty_polls: 0,
        }
    }

    fn run(&mut self) {
        tracing::debug!("audio output started");
        while !self.session.is_stopped() {
            if !self.session.is_playing() {
                thread::sleep(IDLE);
                continue;
            }

            let before = self.session.audio.generation();
            let popped = self.session.audio.pop_timeout(AUDIO_POLL);
            let after = self.session.audio.generation();
            if before != after {
                // Flushed while we waited; whatever we got is from the old timeline.
                continue;
            }
            if after != self.generation {
                self.restart(after);
            }

            match popped {
                Some(frame) => self.play_frame(frame),
                None => self.on_empty(),
            }
        }
        tracing::debug!("audio output stopped");
    }

    fn restart(&mut self, generation: u64) {
        tracing::debug!("audio output: generation {} -> {}", self.generation, generation);
        self.generation = generation;
        self.stretcher.reset();
        self.cursor.reset();
        self.empty_polls = 0;
        self.sink.flush();
    }

    fn on_empty(&mut self) {
        let session = Arc::clone(&self.session);
        let audio = &session.audio;
        if audio.is_eos() {
            if self.session.audio_finished() {
                return;
            }
            match self.stretcher.finish() {
                Ok(tail) => self.deliver(tail),
                Err(err) => self.degrade(err),
            }
            if audio.generation() == self.generation && audio.is_drained() {
                tracing::debug!("audio output drained");
                self.session.set_audio_finished(true);
                self.session.clock.release_audio();
            }
            return;
        }

        self.empty_polls += 1;
        if self.empty_polls == UNDERRUN_POLLS {
            tracing::debug!("audio buffer ran dry");
            self.session.metrics.record_underrun();
        }
    }

    fn play_frame(&mut self, frame: AudioFrame) {
        self.empty_polls = 0;
        if frame.discontinuity {
            // Skip-jump: what the stretcher still holds belongs before the jump
            // and would play after it. Drop it.
            tracing::trace!("audio discontinuity at {:?}, stretcher reset", frame.source_ts);
            self.stretcher.reset();
        }

        let map = self.session.mapper.map();
        let (start, end) = (frame.source_ts, frame.end_ts());
        match self.cursor.kind_over(&map, start, end) {
            Some(kind) => self.stretch(&frame, kind),
            None => {
                for piece in map.pieces(start, end) {
                    if let Some(slice) = frame.slice(piece.source_start, piece.source_end) {
                        self.stretch(&slice, piece.kind);
                    }
                }
            }
        }
    }

    fn stretch(&mut self, frame: &AudioFrame, kind: SegmentKind) {
        if kind == SegmentKind::Skip {
            // Decoded under an older map.
            self.session.metrics.record_skipped_audio();
            return;
        }
        let rate = self.session.mapper.effective_rate(kind);
        let blocks = match self.stretcher.push(frame, rate) {
            Ok(blocks) => blocks,
            Err(err) => {
                self.degrade(err);
                match self.stretcher.push(frame, rate) {
                    Ok(blocks) => blocks,
                    Err(err) => {
                        tracing::error!("audio block at {:?} dropped: {}", frame.source_ts, err);
                        return;
                    }
                }
            }
        };
        self.deliver(blocks);
    }

    fn degrade(&mut self, err: StretchError) {
        if self.stretcher.is_passthrough() {
            return;
        }
        tracing::warn!("time-stretch failed: {}", err);
        self.stretcher.enable_passthrough();
        let _ = self.events.send(WorkerEvent::StretchDegraded(err));
    }

    /// Hands blocks to the sink, advancing the clock as each is accepted.
    fn deliver(&mut self, blocks: Vec<StretchedBlock>) {
        for block in blocks {
            while !self.session.is_playing() && !self.session.is_stopped() && !self.is_stale() {
                thread::sleep(IDLE);
            }
            if self.session.is_stopped() || self.is_stale() {
                return;
            }

            let map = self.session.mapper.map();
            let logical_start = map.source_to_logical(block.source_start);
            let logical_end = map.source_to_logical(block.source_end).max(logical_start);
            let output = AudioOutput {
                sample_rate: block.sample_rate,
                channels: block.channels,
                source_start: block.source_start,
                source_end: block.source_end,
                logical_start,
                logical_end,
                rate: block.rate,
                samples: block.samples,
            };
            self.session
                .clock
                .update_audio(logical_start, logical_end - logical_start, output.duration());
            self.sink.accept_audio(output);
        }
    }

    fn is_stale(&self) -> bool {
        self.session.audio.generation() != self.generation
    }
}

struct VideoWorker {
    session: Arc<Session>,
    sink: Box<dyn VideoSink>,
    frame_interval: Duration,
    empty_polls: u32,
}

impl VideoWorker {
    fn new(session: Arc<Session>, sink: Box<dyn VideoSink>) -> Self {
        let fps = session
            .info
            .video
            .map(|format| format.frame_rate as f64)
            .filter(|fps| *fps > 0.0)
            .unwrap_or(30.0);
        Self {
            session,
            sink,
            frame_interval: Duration::from_secs_f64(1.0 / fps),
            empty_polls: 0,
        }
    }

    fn run(&mut self) {
        tracing::debug!("video output started");
        let time_scale = self.session.clock.time_scale();
        let hold_slice = (self.frame_interval / 3).min(MAX_HOLD_SLICE).div_f64(time_scale);
        let poll = VIDEO_POLL.div_f64(time_scale).max(Duration::from_micros(500));

        while !self.session.is_stopped() {
            if !self.session.is_playing() {
                thread::sleep(IDLE);
                continue;
            }

            let generation = self.session.video.generation();
            let Some(source_ts) = self.session.video.peek_ts() else {
                self.on_empty();
                thread::sleep(poll);
                continue;
            };
            self.empty_polls = 0;

            let map = self.session.mapper.map();
            let logical = map.source_to_logical(source_ts);
            let now = self.session.clock.now();
            let tolerance = self.session.config.sync_tolerance;

            if logical + tolerance < now {
                if self.session.video.pop_head(source_ts, generation).is_some() {
                    tracing::trace!("late frame {:?} (logical {:?}, clock {:?})", source_ts, logical, now);
                    self.session.metrics.record_late_drop();
                }
                continue;
            }

            if logical > now + tolerance {
                if logical - now > self.session.config.video_buffer.capacity {
                    if self.session.video.pop_head(source_ts, generation).is_some() {
                        tracing::debug!("frame {:?} too far ahead of clock {:?}", logical, now);
                        self.session.metrics.record_overflow_drop();
                    }
                    continue;
                }
                thread::sleep(hold_slice);
                continue;
            }

            if let Some(frame) = self.take_latest_due(source_ts, generation, now, tolerance) {
                self.present(frame, now);
            }
        }
        tracing::debug!("video output stopped");
    }

    /// Pops the peeked head frame, skipping ahead to the newest frame that is
    /// also due. Gives up if the buffer is flushed meanwhile.
    fn take_latest_due(
        &mut self,
        head_ts: Duration,
        generation: u64,
        now: Duration,
        tolerance: Duration,
    ) -> Option<VideoFrame> {
        let video = &self.session.video;
        let mut frame = video.pop_head(head_ts, generation)?;
        loop {
            let Some(next_ts) = video.peek_ts() else {
                return Some(frame);
            };
            let next_logical = self.session.mapper.map().source_to_logical(next_ts);
            if next_logical > now + tolerance || next_ts <= frame.source_ts {
                return Some(frame);
            }
            let Some(next) = video.pop_head(next_ts, generation) else {
                // Flushed under us: the frame in hand is from the old timeline.
                return (video.generation() == generation).then_some(frame);
            };
            self.session.metrics.record_late_drop();
            frame = next;
        }
    }

    fn present(&mut self, frame: VideoFrame, now: Duration) {
        let logical = self.session.mapper.map().source_to_logical(frame.source_ts);
        self.session.metrics.record_frame(logical, now);
        self.sink.accept_video(VideoOutput {
            frame,
            logical_ts: logical,
            clock: now,
        });
    }

    fn on_empty(&mut self) {
        if self.session.video.is_eos() {
            return;
        }
        self.empty_polls += 1;
        if self.empty_polls == UNDERRUN_POLLS {
            tracing::debug!("video buffer ran dry");
            self.session.metrics.record_underrun();
        }
    }
}
