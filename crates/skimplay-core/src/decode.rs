//! Decode worker: pulls frames from the source into the elastic buffers.
//!
//! The worker always decodes the stream that is furthest behind and still
//! has room, so audio and video stay within a frame of each other and a
//! skip-jump finds both streams at the same place. Every decoded frame is run
//! through [`TimelineMapper::plan`] before it is queued: frames inside a short
//! skip are dropped, audio straddling a skip edge is cut to the sample, and
//! reaching a long skip seeks the source past it.
//!
//! A partial segment map stops decoding at its analysis scope. Media past the
//! scope is held back, not queued, until the map is extended: its skips and
//! speeds are unknown, and playing it at normal speed would need a flush once
//! they arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::PushOutcome;
use crate::frame::{Frame, StreamKind};
use crate::session::{Session, WorkerEvent};
use crate::source::{FrameSource, RetryPolicy, SourceEvent};
use crate::sync_metrics::StallType;
use crate::timeline::{FramePlan, SkipJump};

/// How long to wait for a command when no stream can be decoded.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Commands sent to the decode thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeCommand {
    /// Reposition the source. Frames decoded afterwards are pushed under the
    /// given buffer generations.
    Seek {
        source_ts: Duration,
        audio_generation: u64,
        video_generation: u64,
    },
    /// The segment map's scope grew; held-back frames may now be planned.
    ScopeExtended,
    /// Stop the decode thread
    Stop,
}

/// A decode thread that fills the session's buffers.
pub(crate) struct DecodeThread {
    handle: Option<JoinHandle<()>>,
    command_tx: Sender<DecodeCommand>,
    stop_flag: Arc<AtomicBool>,
}

impl DecodeThread {
    /// Starts decoding from the beginning of the source.
    pub fn spawn(
        source: Box<dyn FrameSource>,
        session: Arc<Session>,
        events: Sender<WorkerEvent>,
    ) -> std::io::Result<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_flag);

        let handle = thread::Builder::new()
            .name("skimplay-decode".to_string())
            .spawn(move || {
                let mut worker = DecodeWorker::new(source, session, events);
                worker.run(&command_rx, &stop);
                worker.source.close();
            })?;

        Ok(Self {
            handle: Some(handle),
            command_tx,
            stop_flag,
        })
    }

    /// Sender for commands; the control thread keeps a clone.
    pub fn commands(&self) -> Sender<DecodeCommand> {
        self.command_tx.clone()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.command_tx.send(DecodeCommand::Stop);
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Per-stream decode progress.
#[derive(Debug, Default)]
struct StreamState {
    /// End of the last frame decoded.
    head: Duration,
    /// Duration of the last frame, used to check for room before decoding.
    last_duration: Duration,
    eos: bool,
    /// The next frame follows a seek or skip-jump.
    discontinuity: bool,
    /// Decoded media beyond the analysis scope.
    held: Option<Frame>,
}

struct DecodeWorker {
    source: Box<dyn FrameSource>,
    session: Arc<Session>,
    events: Sender<WorkerEvent>,
    retry: RetryPolicy,
    audio: StreamState,
    video: StreamState,
    audio_generation: u64,
    video_generation: u64,
    /// Frames ending before this position are left over from a seek.
    seek_floor: Duration,
}

enum Step {
    Continue,
    Stop,
}

impl DecodeWorker {
    fn new(source: Box<dyn FrameSource>, session: Arc<Session>, events: Sender<WorkerEvent>) -> Self {
        let retry = RetryPolicy::new(session.config.source_retries, session.config.retry_backoff);
        let info = source.info();
        Self {
            audio: StreamState {
                eos: info.audio.is_none(),
                ..StreamState::default()
            },
            video: StreamState {
                eos: info.video.is_none(),
                ..StreamState::default()
            },
            audio_generation: session.audio.generation(),
            video_generation: session.video.generation(),
            seek_floor: Duration::ZERO,
            source,
            session,
            events,
            retry,
        }
    }

    fn stream(&self, kind: StreamKind) -> &StreamState {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }

    fn has_room(&self, kind: StreamKind) -> bool {
        let needed = self.stream(kind).last_duration;
        match kind {
            StreamKind::Audio => self.session.audio.has_space_for(needed),
            StreamKind::Video => self.session.video.has_space_for(needed),
        }
    }

    /// The least-advanced stream that is not finished, full or held back.
    fn next_stream(&self) -> Option<StreamKind> {
        [StreamKind::Audio, StreamKind::Video]
            .into_iter()
            .filter(|&kind| {
                let state = self.stream(kind);
                !state.eos && state.held.is_none() && self.has_room(kind)
            })
            .min_by_key(|&kind| self.stream(kind).head)
    }

    fn run(&mut self, command_rx: &Receiver<DecodeCommand>, stop_flag: &AtomicBool) {
        loop {
            if stop_flag.load(Ordering::Acquire) || self.session.is_stopped() {
                break;
            }

            while let Ok(cmd) = command_rx.try_recv() {
                if let Step::Stop = self.process_command(cmd) {
                    return;
                }
            }
            if let Step::Stop = self.release_held() {
                return;
            }

            if self.audio.eos && self.video.eos {
                // Nothing left to decode until the next seek.
                match command_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(cmd) => {
                        if let Step::Stop = self.process_command(cmd) {
                            return;
                        }
                    }
                    Err(_) => continue,
                }
                continue;
            }

            let Some(kind) = self.next_stream() else {
                // Buffers full or waiting on analysis; a seek or scope
                // extension wakes us early.
                if let Ok(cmd) = command_rx.recv_timeout(IDLE_WAIT) {
                    if let Step::Stop = self.process_command(cmd) {
                        return;
                    }
                }
                continue;
            };

            if let Step::Stop = self.decode_one(kind) {
                return;
            }
        }
    }

    fn process_command(&mut self, cmd: DecodeCommand) -> Step {
        match cmd {
            DecodeCommand::Stop => Step::Stop,
            DecodeCommand::ScopeExtended => {
                tracing::trace!("decode: scope now {:?}", self.session.mapper.map().scope());
                Step::Continue
            }
            DecodeCommand::Seek {
                source_ts,
                audio_generation,
                video_generation,
            } => {
                self.audio_generation = audio_generation;
                self.video_generation = video_generation;
                self.seek_to(source_ts)
            }
        }
    }

    fn seek_to(&mut self, source_ts: Duration) -> Step {
        let info = self.source.info();
        let source = &mut self.source;
        if let Err(e) = self.retry.run("seek", || source.seek(source_ts)) {
            let _ = self.events.send(WorkerEvent::SourceFailed(e));
            return Step::Stop;
        }

        for (kind, present) in [
            (StreamKind::Audio, info.audio.is_some()),
            (StreamKind::Video, info.video.is_some()),
        ] {
            let state = self.stream_mut(kind);
            state.head = source_ts;
            state.eos = !present;
            state.discontinuity = true;
            state.held = None;
        }
        self.seek_floor = source_ts;
        self.session.set_awaiting_analysis(false);
        tracing::debug!("decode: seeked to {:?}", source_ts);
        Step::Continue
    }

    fn decode_one(&mut self, kind: StreamKind) -> Step {
        let source = &mut self.source;
        let mut attempts = 0;
        let result = self.retry.run("decode", || {
            attempts += 1;
            source.next_frame(kind)
        });
        if attempts > 1 {
            self.session.metrics.record_stall(StallType::Decode);
        }
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                let _ = self.events.send(WorkerEvent::SourceFailed(e));
                return Step::Stop;
            }
        };

        match event {
            SourceEvent::EndOfStream => {
                tracing::debug!("decode: {} end of stream at {:?}", kind, self.stream(kind).head);
                self.stream_mut(kind).eos = true;
                match kind {
                    StreamKind::Audio => self.session.audio.set_eos(self.audio_generation),
                    StreamKind::Video => self.session.video.set_eos(self.video_generation),
                }
                Step::Continue
            }
            SourceEvent::Frame(frame) if frame.stream() != kind => {
                tracing::warn!("decode: asked for {} but got {}", kind, frame.stream());
                Step::Continue
            }
            SourceEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Step {
        let kind = frame.stream();
        let (start, end) = (frame.source_ts(), frame.end_ts());
        {
            let state = self.stream_mut(kind);
            state.head = end;
            state.last_duration = frame.duration();
        }

        // Sources seek to the closest earlier point they can decode from.
        let floor = self.seek_floor;
        if end <= floor {
            tracing::trace!("decode: dropping pre-roll {} at {:?}", kind, start);
            return Step::Continue;
        }
        let frame = match frame {
            Frame::Audio(audio) if start < floor => match audio.slice(floor, end) {
                Some(tail) => Frame::Audio(tail),
                None => return Step::Continue,
            },
            Frame::Video(mut video) if start < floor => {
                video.source_ts = floor;
                video.duration = end - floor;
                Frame::Video(video)
            }
            other => other,
        };
        self.admit(frame)
    }

    /// Plans a decoded frame against the current map and queues what survives.
    fn admit(&mut self, frame: Frame) -> Step {
        let map = self.session.mapper.map();
        let Some(frame) = self.hold_beyond_scope(frame, map.scope()) else {
            return Step::Continue;
        };
        let kind = frame.stream();
        let (start, end) = (frame.source_ts(), frame.end_ts());
        let plan = self.session.mapper.plan(&map, kind, start, end);
        match plan {
            FramePlan::Keep => self.push(frame),
            FramePlan::Drop => {
                tracing::trace!("decode: {} at {:?} falls in a short skip", kind, start);
                if kind == StreamKind::Audio {
                    self.session.metrics.record_skipped_audio();
                }
                Step::Continue
            }
            FramePlan::Trim(ranges) => match frame {
                Frame::Audio(audio) => {
                    for (from, to) in ranges {
                        if let Some(piece) = audio.slice(from, to) {
                            if let Step::Stop = self.push(Frame::Audio(piece)) {
                                return Step::Stop;
                            }
                        }
                    }
                    Step::Continue
                }
                video => self.push(video),
            },
            FramePlan::Jump(jump) => self.skip_jump(jump),
        }
    }

    /// Splits `frame` at `scope`, holding back the part analysis has not
    /// reached yet. Returns the part that may be queued now.
    fn hold_beyond_scope(&mut self, frame: Frame, scope: Option<Duration>) -> Option<Frame> {
        let Some(scope) = scope else {
            return Some(frame);
        };
        let (start, end) = (frame.source_ts(), frame.end_ts());
        if end <= scope {
            return Some(frame);
        }
        let kind = frame.stream();
        tracing::debug!("decode: {} waits for analysis at {:?}", kind, scope);
        self.session.set_awaiting_analysis(true);
        if start >= scope {
            self.stream_mut(kind).held = Some(frame);
            return None;
        }

        let (now, later) = match frame {
            Frame::Audio(audio) => (
                audio.slice(start, scope).map(Frame::Audio),
                audio.slice(scope, end).map(Frame::Audio),
            ),
            Frame::Video(video) => {
                let mut later = video.clone();
                later.source_ts = scope;
                later.duration = end - scope;
                later.discontinuity = false;
                let mut now = video;
                now.duration = scope - start;
                (Some(Frame::Video(now)), Some(Frame::Video(later)))
            }
        };
        self.stream_mut(kind).held = later;
        now
    }

    /// Plans held-back frames whose position the map now covers.
    fn release_held(&mut self) -> Step {
        let map = self.session.mapper.map();
        for kind in [StreamKind::Audio, StreamKind::Video] {
            let covered = self
                .stream(kind)
                .held
                .as_ref()
                .map_or(false, |frame| map.covers(frame.source_ts()));
            if !covered {
                continue;
            }
            if let Some(frame) = self.stream_mut(kind).held.take() {
                tracing::debug!("decode: analysis reached {:?}, {} resumes", frame.source_ts(), kind);
                if let Step::Stop = self.admit(frame) {
                    return Step::Stop;
                }
            }
        }
        self.session
            .set_awaiting_analysis(self.audio.held.is_some() || self.video.held.is_some());
        Step::Continue
    }

    /// Seeks past a skip region, discarding anything already queued inside it.
    fn skip_jump(&mut self, jump: SkipJump) -> Step {
        let dropped = self.session.audio.discard_range(jump.skip_start, jump.skip_end)
            + self.session.video.discard_range(jump.skip_start, jump.skip_end);
        tracing::debug!(
            "skip-jump over [{:?}, {:?}), {} queued frames discarded",
            jump.skip_start,
            jump.skip_end,
            dropped
        );
        self.seek_to(jump.skip_end)
    }

    fn push(&mut self, mut frame: Frame) -> Step {
        let kind = frame.stream();
        if std::mem::take(&mut self.stream_mut(kind).discontinuity) {
            frame.set_discontinuity();
        }

        let outcome = match frame {
            Frame::Audio(audio) => self.session.audio.push(audio, self.audio_generation),
            Frame::Video(video) => self.session.video.push(video, self.video_generation),
        };
        match outcome {
            PushOutcome::Queued => Step::Continue,
            // A seek is waiting in the command queue.
            PushOutcome::Stale => Step::Continue,
            PushOutcome::Stopped => Step::Stop,
        }
    }
}
