//! Headless nonlinear player.
//!
//! [`Player`] owns a playback session and four threads: decode, audio output,
//! video output and control. The control thread runs the
//! [`PlaybackController`] state machine and is the only place commands are
//! executed, so a seek can never interleave with a map swap or a buffering
//! transition.
//!
//! # State Machine
//!
//! ```text
//! open()                           → Opening
//! buffers ready [Opening/Buffering] → Playing if play requested, else Paused
//! buffering timeout                → Error (terminal)
//!
//! play()  [Paused]                 → Playing
//! pause() [Playing]                → Paused
//! buffer below low watermark [Playing] → Buffering
//! seek()                           → Seeking → Buffering
//! set_segment_map()                → Seeking → Buffering (re-seek to current source position)
//!
//! source exhausted, buffers drained [Playing] → Ended (terminal)
//! source failure                   → Error (terminal)
//! stop()                           → Stopped (terminal)
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::config::PlayerConfig;
use crate::decode::{DecodeCommand, DecodeThread};
use crate::error::{ErrorReport, PlayerError, Result, SourceError};
use crate::output::{spawn_audio_worker, spawn_video_worker};
use crate::segment_map::{Segment, SegmentKind, SegmentMap};
use crate::session::{Session, WorkerEvent};
use crate::sink::{AudioSink, VideoSink};
use crate::source::{FrameSource, RetryPolicy, SourceInfo};
use crate::stretch::{AudioStretcher, StretchBackend};
use crate::sync_metrics::{StallType, SyncMetrics, SyncMetricsSnapshot};
use crate::timeline::VersionedMap;

/// Capacity of the notification channel; events beyond it are dropped.
const EVENT_CAPACITY: usize = 1024;
/// Control-thread tick when no command arrives.
const TICK: Duration = Duration::from_millis(10);
/// Presented frames after a seek that are left out of the drift maxima.
const SEEK_GRACE_FRAMES: u64 = 5;

/// Playback state of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Stopped,
    /// Waiting for the initial buffer fill.
    Opening,
    /// Output is paused until both buffers refill.
    Buffering,
    Playing,
    Paused,
    /// A seek is being issued; always followed by `Buffering`.
    Seeking,
    /// All media has been presented.
    Ended,
    Error(ErrorReport),
}

impl PlaybackState {
    /// Terminal states ignore everything but `stop`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlaybackState::Stopped | PlaybackState::Ended | PlaybackState::Error(_)
        )
    }
}

/// Where playback is, on both timelines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub logical: Duration,
    pub source: Duration,
    /// Version of the segment map the two positions were related under.
    pub map_version: u64,
}

/// Target of a seek.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    /// A position on the logical (post skip/speed) timeline.
    Logical(Duration),
    /// A position in the source media. Inside a skip, playback resumes at
    /// the skip's end.
    Source(Duration),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    /// Periodic position while playing.
    Position(Position),
    SegmentMapChanged {
        version: u64,
    },
    /// Playback continues at reduced quality (stretching disabled).
    Degraded(String),
    Error(ErrorReport),
}

/// Output sinks for a player.
pub struct Sinks {
    pub audio: Box<dyn AudioSink>,
    pub video: Box<dyn VideoSink>,
}

impl Sinks {
    pub fn new(audio: impl AudioSink + 'static, video: impl VideoSink + 'static) -> Self {
        Self {
            audio: Box::new(audio),
            video: Box::new(video),
        }
    }
}

/// Commands executed on the control thread.
enum Command {
    Play,
    Pause,
    Seek(SeekTarget),
    SetSegmentMap {
        segments: Vec<Segment>,
        scope: Option<Duration>,
        reply: Sender<Result<u64>>,
    },
    ExtendSegmentMap {
        segments: Vec<Segment>,
        scope: Option<Duration>,
        reply: Sender<Result<u64>>,
    },
    SetRateOverride {
        rate: Option<f64>,
        reply: Sender<Result<()>>,
    },
    Stop,
}

/// The playback state machine. Runs on the control thread.
pub(crate) struct PlaybackController {
    session: Arc<Session>,
    decode: Sender<DecodeCommand>,
    events: Sender<PlayerEvent>,
    play_requested: bool,
    /// When the current Opening/Buffering phase began.
    buffering_since: Option<Instant>,
    last_position_event: Option<Instant>,
}

impl PlaybackController {
    pub fn new(
        session: Arc<Session>,
        decode: Sender<DecodeCommand>,
        events: Sender<PlayerEvent>,
    ) -> Self {
        Self {
            session,
            decode,
            events,
            play_requested: false,
            buffering_since: Some(Instant::now()),
            last_position_event: None,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if self.events.try_send(event).is_err() {
            tracing::trace!("event channel full, notification dropped");
        }
    }

    fn transition(&mut self, to: PlaybackState) {
        let from = self.session.set_state(to.clone());
        if from != to {
            tracing::info!("playback state: {:?} -> {:?}", from, to);
            self.emit(PlayerEvent::StateChanged { from, to });
        }
    }

    fn start_output(&self) {
        self.session.clock.resume();
        self.session.set_playing(true);
    }

    fn stop_output(&self) {
        self.session.set_playing(false);
        self.session.clock.pause();
    }

    fn fail(&mut self, error: PlayerError) {
        let report = ErrorReport::from(error);
        tracing::error!("playback failed: {}", report);
        self.stop_output();
        self.session.stop();
        let _ = self.decode.send(DecodeCommand::Stop);
        self.transition(PlaybackState::Error(report.clone()));
        self.emit(PlayerEvent::Error(report));
    }

    /// Executes one command. Returns false once the session is stopped.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Seek(target) => self.seek(target),
            Command::SetSegmentMap {
                segments,
                scope,
                reply,
            } => {
                let _ = reply.send(self.set_segment_map(segments, scope));
            }
            Command::ExtendSegmentMap {
                segments,
                scope,
                reply,
            } => {
                let _ = reply.send(self.extend_segment_map(segments, scope));
            }
            Command::SetRateOverride { rate, reply } => {
                let _ = reply.send(self.set_rate_override(rate));
            }
            Command::Stop => {
                self.stop();
                return false;
            }
        }
        true
    }

    pub fn play(&mut self) {
        let state = self.session.state();
        if state.is_terminal() {
            tracing::debug!("play ignored in {:?}", state);
            return;
        }
        self.play_requested = true;
        if state == PlaybackState::Paused {
            self.start_output();
            self.transition(PlaybackState::Playing);
        }
    }

    pub fn pause(&mut self) {
        let state = self.session.state();
        if state.is_terminal() {
            return;
        }
        self.play_requested = false;
        if state == PlaybackState::Playing {
            self.stop_output();
            self.transition(PlaybackState::Paused);
        }
    }

    pub fn seek(&mut self, target: SeekTarget) {
        let state = self.session.state();
        if state.is_terminal() {
            tracing::debug!("seek ignored in {:?}", state);
            return;
        }

        let map = self.session.mapper.map();
        let mut source = match target {
            SeekTarget::Logical(logical) => map.logical_to_source(logical),
            SeekTarget::Source(source) => source,
        };
        if let Some(skip) = map.skip_at(source) {
            source = skip.source_end;
        }
        let logical = map.source_to_logical(source);
        tracing::debug!("seek to {:?} (source {:?})", logical, source);

        self.transition(PlaybackState::Seeking);
        self.stop_output();
        let (audio_generation, video_generation) = self.session.flush_buffers();
        self.session.clock.reset(logical);
        self.session.metrics.set_grace_period(SEEK_GRACE_FRAMES);
        if self
            .decode
            .send(DecodeCommand::Seek {
                source_ts: source,
                audio_generation,
                video_generation,
            })
            .is_err()
        {
            self.fail(PlayerError::Internal("decode thread is gone".to_string()));
            return;
        }

        self.buffering_since = Some(Instant::now());
        self.transition(PlaybackState::Buffering);
    }

    /// Replaces the map and re-seeks to the source position playing now.
    pub fn set_segment_map(
        &mut self,
        segments: Vec<Segment>,
        scope: Option<Duration>,
    ) -> Result<u64> {
        let map = match scope {
            Some(scope) => SegmentMap::with_scope(segments, scope)?,
            None => SegmentMap::new(segments)?,
        };
        let source = self.session.position().source;
        let version = self.session.mapper.replace(map);
        self.emit(PlayerEvent::SegmentMapChanged { version });
        self.reseek(source);
        Ok(version)
    }

    /// Appends incremental analysis and wakes the decoder if it was waiting
    /// on the old scope.
    ///
    /// Nothing past the old scope was ever queued, and appended segments start
    /// at or after it, so the buffers stay valid and no flush is needed.
    pub fn extend_segment_map(
        &mut self,
        segments: Vec<Segment>,
        scope: Option<Duration>,
    ) -> Result<u64> {
        let map = self.session.mapper.map().map.extended(segments, scope)?;
        let version = self.session.mapper.replace(map);
        self.emit(PlayerEvent::SegmentMapChanged { version });
        tracing::debug!("segment map v{} extended to {:?}", version, scope);
        if self.decode.send(DecodeCommand::ScopeExtended).is_err() {
            tracing::debug!("decode thread gone, scope extension not delivered");
        }
        Ok(version)
    }

    fn reseek(&mut self, source: Duration) {
        if self.session.state().is_terminal() {
            return;
        }
        tracing::debug!("hard flush after map change, resuming at source {:?}", source);
        self.seek(SeekTarget::Source(source));
    }

    pub fn set_rate_override(&mut self, rate: Option<f64>) -> Result<()> {
        self.session.mapper.set_rate_override(rate)?;
        tracing::info!("rate override: {:?}", rate);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop_output();
        self.session.stop();
        let _ = self.decode.send(DecodeCommand::Stop);
        self.transition(PlaybackState::Stopped);
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::SourceFailed(error) => {
                if !self.session.state().is_terminal() {
                    self.fail(error.into());
                }
            }
            WorkerEvent::StretchDegraded(error) => {
                tracing::warn!("playing unstretched audio: {}", error);
                self.emit(PlayerEvent::Degraded(error.to_string()));
            }
        }
    }

    /// Advances time-driven transitions. Called after every command and at
    /// least every [`TICK`].
    pub fn tick(&mut self) {
        match self.session.state() {
            PlaybackState::Opening | PlaybackState::Buffering => self.tick_buffering(),
            PlaybackState::Playing => self.tick_playing(),
            _ => {}
        }
    }

    fn tick_buffering(&mut self) {
        if self.session.is_ended() {
            self.buffering_since = None;
            self.transition(PlaybackState::Ended);
            return;
        }
        if self.session.buffers_ready() {
            self.buffering_since = None;
            if self.play_requested {
                self.start_output();
                self.transition(PlaybackState::Playing);
            } else {
                self.transition(PlaybackState::Paused);
            }
            return;
        }

        if self.session.awaiting_analysis() {
            // Waiting on the segment map, not on the source.
            self.buffering_since = Some(Instant::now());
            return;
        }
        let since = *self.buffering_since.get_or_insert_with(Instant::now);
        let stalled_for = since.elapsed();
        if stalled_for > self.session.config.buffering_timeout {
            self.fail(PlayerError::BufferingTimeout { stalled_for });
        }
    }

    fn tick_playing(&mut self) {
        if self.session.is_ended() {
            self.stop_output();
            self.transition(PlaybackState::Ended);
            return;
        }
        if self.session.buffers_low() {
            tracing::debug!(
                "buffer low (audio {:?}, video {:?})",
                self.session.audio.queued_duration(),
                self.session.video.queued_duration()
            );
            self.stop_output();
            self.session.metrics.record_stall(StallType::Buffering);
            self.buffering_since = Some(Instant::now());
            self.transition(PlaybackState::Buffering);
            return;
        }

        if !self.session.clock.is_audio_master() {
            // The wall clock runs on the logical timeline, where the map's own
            // rate is already accounted for; only an override changes its pace.
            let map = self.session.mapper.map();
            let source = map.logical_to_source(self.session.clock.now());
            let map_rate = map.rate_at(source);
            let rate = self.session.mapper.effective_rate(SegmentKind::Speed(map_rate));
            self.session.clock.set_speed(rate / map_rate);
        }

        let due = self
            .last_position_event
            .map_or(true, |at| at.elapsed() >= self.session.config.position_interval);
        if due {
            self.last_position_event = Some(Instant::now());
            self.emit(PlayerEvent::Position(self.session.position()));
        }
    }

    fn run(mut self, commands: Receiver<Command>, worker_events: Receiver<WorkerEvent>) {
        tracing::debug!("control thread started");
        let closed = crossbeam_channel::never();
        let mut workers_open = true;
        loop {
            let workers = if workers_open { &worker_events } else { &closed };
            crossbeam_channel::select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        self.stop();
                        break;
                    }
                },
                recv(workers) -> event => match event {
                    Ok(event) => self.on_worker_event(event),
                    Err(_) => workers_open = false,
                },
                default(TICK) => {}
            }
            self.tick();
        }
        tracing::debug!("control thread stopped");
    }
}

/// A nonlinear media player over one source.
///
/// Commands return immediately and are executed in order on the control
/// thread; map updates wait for the validation result.
pub struct Player {
    session: Arc<Session>,
    commands: Sender<Command>,
    events: Receiver<PlayerEvent>,
    control: Option<JoinHandle<()>>,
    decode: Option<DecodeThread>,
    outputs: Vec<JoinHandle<()>>,
}

impl Player {
    /// Opens `uri` with source type `S` and starts filling buffers.
    ///
    /// Playback starts once [`play`](Self::play) is called and the buffers
    /// are ready.
    pub fn open<S: FrameSource + 'static>(uri: &str, sinks: Sinks, config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::new(config.source_retries, config.retry_backoff);
        let source = retry.run("open", || S::open(uri))?;
        Self::with_source(Box::new(source), sinks, config)
    }

    /// Starts a session over an already opened source, stretching with the
    /// built-in backend.
    pub fn with_source(source: Box<dyn FrameSource>, sinks: Sinks, config: PlayerConfig) -> Result<Self> {
        Self::start(source, None, sinks, config)
    }

    /// Starts a session that stretches audio with `backend`.
    pub fn with_stretch_backend(
        source: Box<dyn FrameSource>,
        backend: Box<dyn StretchBackend>,
        sinks: Sinks,
        config: PlayerConfig,
    ) -> Result<Self> {
        Self::start(source, Some(backend), sinks, config)
    }

    fn start(
        source: Box<dyn FrameSource>,
        backend: Option<Box<dyn StretchBackend>>,
        sinks: Sinks,
        config: PlayerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let info = source.info();
        if info.audio.is_none() && info.video.is_none() {
            return Err(PlayerError::Source(SourceError::Open(
                "source has neither audio nor video".to_string(),
            )));
        }
        tracing::info!(
            "opening session: duration={:?}, audio={:?}, video={:?}",
            info.duration,
            info.audio,
            info.video
        );

        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let session = Arc::new(Session::new(config, info.clone(), SegmentMap::empty()));
        let spawn_err = |e: std::io::Error| PlayerError::Internal(format!("failed to spawn thread: {e}"));

        let mut outputs = Vec::new();
        if let Some(format) = info.audio {
            let stretcher = match backend {
                Some(backend) => AudioStretcher::new(
                    backend,
                    format.sample_rate,
                    format.channels,
                    &session.config,
                ),
                None => match AudioStretcher::with_default_backend(
                    format.sample_rate,
                    format.channels,
                    &session.config,
                ) {
                    Ok(stretcher) => stretcher,
                    Err(e) => {
                        tracing::warn!("no time-stretch for this stream: {}", e);
                        let _ = event_tx.try_send(PlayerEvent::Degraded(e.to_string()));
                        AudioStretcher::new_passthrough(
                            format.sample_rate,
                            format.channels,
                            &session.config,
                        )
                    }
                },
            };
            outputs.push(
                spawn_audio_worker(Arc::clone(&session), sinks.audio, stretcher, worker_tx.clone())
                    .map_err(spawn_err)?,
            );
        }
        if info.video.is_some() {
            outputs.push(spawn_video_worker(Arc::clone(&session), sinks.video).map_err(spawn_err)?);
        }

        let decode = DecodeThread::spawn(source, Arc::clone(&session), worker_tx).map_err(spawn_err)?;
        let controller = PlaybackController::new(Arc::clone(&session), decode.commands(), event_tx);
        let control = thread::Builder::new()
            .name("skimplay-control".to_string())
            .spawn(move || controller.run(command_rx, worker_rx))
            .map_err(spawn_err)?;

        Ok(Self {
            session,
            commands: command_tx,
            events: event_rx,
            control: Some(control),
            decode: Some(decode),
            outputs,
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("control thread is gone, command dropped");
        }
    }

    /// Starts playback, or plays as soon as buffering completes.
    pub fn play(&self) {
        self.send(Command::Play);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn seek(&self, target: SeekTarget) {
        self.send(Command::Seek(target));
    }

    /// Ends the session. Every worker exits; the player only answers queries.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Replaces the segment map with a complete one.
    ///
    /// A malformed map is rejected and playback continues under the old map.
    /// An accepted map hard-flushes and resumes at the source position that
    /// was playing. Returns the new map version.
    pub fn set_segment_map(&self, segments: Vec<Segment>) -> Result<u64> {
        self.request(|reply| Command::SetSegmentMap {
            segments,
            scope: None,
            reply,
        })
    }

    /// Replaces the segment map with one covering the source up to `scope`.
    pub fn set_partial_segment_map(&self, segments: Vec<Segment>, scope: Duration) -> Result<u64> {
        self.request(|reply| Command::SetSegmentMap {
            segments,
            scope: Some(scope),
            reply,
        })
    }

    /// Appends segments found by incremental analysis and moves the scope
    /// to `scope` (`None` once analysis is complete).
    pub fn extend_segment_map(&self, segments: Vec<Segment>, scope: Option<Duration>) -> Result<u64> {
        self.request(|reply| Command::ExtendSegmentMap {
            segments,
            scope,
            reply,
        })
    }

    /// Plays every non-skipped region at `rate` instead of the map's rate.
    pub fn set_rate_override(&self, rate: Option<f64>) -> Result<()> {
        self.request(|reply| Command::SetRateOverride { rate, reply })
    }

    fn request<T>(&self, command: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(command(reply_tx))
            .map_err(|_| PlayerError::Internal("control thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| PlayerError::Internal("control thread dropped the request".to_string()))?
    }

    pub fn state(&self) -> PlaybackState {
        self.session.state()
    }

    pub fn position(&self) -> Position {
        self.session.position()
    }

    pub fn info(&self) -> &SourceInfo {
        &self.session.info
    }

    /// Snapshot of the active segment map.
    pub fn segment_map(&self) -> Arc<VersionedMap> {
        self.session.mapper.map()
    }

    /// State, position and quality notifications.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn sync_metrics(&self) -> &SyncMetrics {
        &self.session.metrics
    }

    pub fn sync_metrics_snapshot(&self) -> SyncMetricsSnapshot {
        self.session.metrics.snapshot()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(control) = self.control.take() {
            let _ = control.join();
        }
        self.session.stop();
        self.decode.take();
        for output in self.outputs.drain(..) {
            let _ = output.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PushOutcome;
    use crate::error::{ErrorReason, SegmentMapError, StretchError};
    use crate::frame::{AudioFrame, Picture, VideoFrame};
    use crate::source::{AudioFormat, VideoFormat};

    struct Harness {
        session: Arc<Session>,
        controller: PlaybackController,
        decode_rx: Receiver<DecodeCommand>,
        events: Receiver<PlayerEvent>,
    }

    fn harness(config: PlayerConfig) -> Harness {
        let info = SourceInfo {
            duration: Some(Duration::from_secs(60)),
            audio: Some(AudioFormat {
                sample_rate: 8_000,
                channels: 1,
            }),
            video: Some(VideoFormat {
                width: 4,
                height: 4,
                frame_rate: 25.0,
            }),
        };
        let session = Arc::new(Session::new(config, info, SegmentMap::empty()));
        let (decode_tx, decode_rx) = crossbeam_channel::unbounded();
        let (event_tx, events) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let controller = PlaybackController::new(Arc::clone(&session), decode_tx, event_tx);
        Harness {
            session,
            controller,
            decode_rx,
            events,
        }
    }

    /// Queues `ms` of both streams starting at `from_ms`.
    fn fill(session: &Session, from_ms: u64, ms: u64) {
        let audio_generation = session.audio.generation();
        let video_generation = session.video.generation();
        for t in (from_ms..from_ms + ms).step_by(20) {
            let frame = AudioFrame::new(Duration::from_millis(t), 8_000, 1, vec![0.1; 160]);
            assert_eq!(session.audio.push(frame, audio_generation), PushOutcome::Queued);
        }
        for t in (from_ms..from_ms + ms).step_by(40) {
            let frame = VideoFrame::new(
                Duration::from_millis(t),
                Duration::from_millis(40),
                Picture::solid_rgba(4, 4, [0, 0, 0, 255]),
            );
            assert_eq!(session.video.push(frame, video_generation), PushOutcome::Queued);
        }
    }

    fn states(events: &Receiver<PlayerEvent>) -> Vec<PlaybackState> {
        events
            .try_iter()
            .filter_map(|event| match event {
                PlayerEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_opening_resolves_to_paused_then_plays() {
        let mut h = harness(PlayerConfig::default());
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Opening);

        fill(&h.session, 0, 280);
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Paused);
        assert!(!h.session.is_playing());

        h.controller.play();
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert!(h.session.is_playing());
        assert!(!h.session.clock.is_paused());
        assert_eq!(
            states(&h.events),
            vec![PlaybackState::Paused, PlaybackState::Playing]
        );
    }

    #[test]
    fn test_play_during_opening_is_remembered() {
        let mut h = harness(PlayerConfig::default());
        h.controller.play();
        assert_eq!(h.session.state(), PlaybackState::Opening);

        fill(&h.session, 0, 280);
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Playing);

        h.controller.pause();
        assert_eq!(h.session.state(), PlaybackState::Paused);
        assert!(h.session.clock.is_paused());
    }

    #[test]
    fn test_seek_flushes_and_commands_decoder() {
        let mut h = harness(PlayerConfig::default());
        h.controller
            .set_segment_map(vec![Segment::skip(Duration::from_secs(10), Duration::from_secs(20))], None)
            .unwrap();
        let _ = h.decode_rx.try_iter().count();
        fill(&h.session, 0, 280);
        let generation = h.session.audio.generation();

        // Logical 15s lies past the skip: source 25s.
        h.controller.seek(SeekTarget::Logical(Duration::from_secs(15)));
        assert_eq!(h.session.state(), PlaybackState::Buffering);
        assert!(h.session.audio.is_empty() && h.session.video.is_empty());
        assert_eq!(h.session.audio.generation(), generation + 1);
        assert_eq!(h.session.clock.now(), Duration::from_secs(15));

        let Ok(DecodeCommand::Seek { source_ts, audio_generation, .. }) = h.decode_rx.try_recv() else {
            panic!("expected a seek command");
        };
        assert_eq!(source_ts, Duration::from_secs(25));
        assert_eq!(audio_generation, generation + 1);

        // A source target inside the skip resumes at its end.
        h.controller.seek(SeekTarget::Source(Duration::from_secs(12)));
        let Ok(DecodeCommand::Seek { source_ts, .. }) = h.decode_rx.try_recv() else {
            panic!("expected a seek command");
        };
        assert_eq!(source_ts, Duration::from_secs(20));
        assert_eq!(h.session.clock.now(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejected_map_leaves_playback_alone() {
        let mut h = harness(PlayerConfig::default());
        fill(&h.session, 0, 280);
        h.controller.tick();

        let result = h.controller.set_segment_map(
            vec![
                Segment::skip(Duration::from_secs(5), Duration::from_secs(8)),
                Segment::speed(Duration::from_secs(7), Duration::from_secs(9), 2.0),
            ],
            None,
        );
        assert!(matches!(result, Err(PlayerError::SegmentMap(_))));
        assert_eq!(h.session.mapper.version(), 0);
        assert_eq!(h.session.state(), PlaybackState::Paused);
        assert!(!h.session.audio.is_empty());
        assert!(h.decode_rx.try_recv().is_err());
    }

    #[test]
    fn test_map_replacement_reseeks_current_source_position() {
        let mut h = harness(PlayerConfig::default());
        h.session.clock.reset(Duration::from_secs(4));

        let version = h
            .controller
            .set_segment_map(vec![Segment::speed(Duration::ZERO, Duration::from_secs(10), 2.0)], None)
            .unwrap();
        assert_eq!(version, 1);

        let Ok(DecodeCommand::Seek { source_ts, .. }) = h.decode_rx.try_recv() else {
            panic!("expected a seek command");
        };
        assert_eq!(source_ts, Duration::from_secs(4));
        // Source 4s now plays at logical 2s.
        assert_eq!(h.session.clock.now(), Duration::from_secs(2));
        assert!(h
            .events
            .try_iter()
            .any(|e| e == PlayerEvent::SegmentMapChanged { version: 1 }));
    }

    #[test]
    fn test_extension_wakes_decoder_without_flush() {
        let mut h = harness(PlayerConfig::default());
        h.controller
            .set_segment_map(vec![Segment::skip(Duration::from_secs(1), Duration::from_secs(2))], Some(Duration::from_secs(10)))
            .unwrap();
        let _ = h.decode_rx.try_iter().count();
        fill(&h.session, 0, 280);
        let generation = h.session.audio.generation();

        h.controller
            .extend_segment_map(vec![Segment::skip(Duration::from_secs(12), Duration::from_secs(14))], Some(Duration::from_secs(20)))
            .unwrap();
        assert_eq!(h.decode_rx.try_recv(), Ok(DecodeCommand::ScopeExtended));
        assert!(!h.session.audio.is_empty());
        assert_eq!(h.session.audio.generation(), generation);
        assert_eq!(h.session.mapper.map().scope(), Some(Duration::from_secs(20)));

        h.controller
            .extend_segment_map(vec![Segment::speed(Duration::from_secs(20), Duration::from_secs(25), 2.0)], None)
            .unwrap();
        assert_eq!(h.decode_rx.try_recv(), Ok(DecodeCommand::ScopeExtended));
        assert_eq!(h.session.mapper.map().scope(), None);
        assert_eq!(h.session.audio.generation(), generation);

        // Segments inside the analysed scope are rejected.
        assert!(h
            .controller
            .extend_segment_map(vec![Segment::skip(Duration::from_secs(30), Duration::from_secs(31))], None)
            .is_err());
    }

    #[test]
    fn test_waiting_on_analysis_does_not_time_out() {
        let mut config = PlayerConfig::default();
        config.buffering_timeout = Duration::from_millis(1);
        let mut h = harness(config);
        h.session.set_awaiting_analysis(true);
        thread::sleep(Duration::from_millis(5));
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Opening);

        h.session.set_awaiting_analysis(false);
        thread::sleep(Duration::from_millis(5));
        h.controller.tick();
        assert!(matches!(h.session.state(), PlaybackState::Error(_)));
    }

    #[test]
    fn test_unplayable_speed_rejected_without_side_effects() {
        let mut h = harness(PlayerConfig::default());
        fill(&h.session, 0, 280);
        h.controller.tick();

        for factor in [1e-20, 1e20] {
            let result = h.controller.set_segment_map(
                vec![Segment::speed(Duration::ZERO, Duration::from_secs(10), factor)],
                None,
            );
            assert!(matches!(
                result,
                Err(PlayerError::SegmentMap(SegmentMapError::InvalidSegment { .. }))
            ));
        }
        assert_eq!(h.session.mapper.version(), 0);
        assert_eq!(h.session.state(), PlaybackState::Paused);
        assert!(h.decode_rx.try_recv().is_err());
    }

    #[test]
    fn test_playing_drops_to_buffering_when_low() {
        let mut h = harness(PlayerConfig::default());
        fill(&h.session, 0, 280);
        h.controller.play();
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Playing);

        while h.session.audio.queued_duration() >= h.session.config.audio_buffer.low_watermark {
            h.session.audio.pop();
        }
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Buffering);
        assert!(!h.session.is_playing());
        assert_eq!(h.session.metrics.snapshot().buffering_stall_count, 1);

        let generation = h.session.audio.generation();
        for t in (280..580).step_by(20) {
            let frame = AudioFrame::new(Duration::from_millis(t), 8_000, 1, vec![0.1; 160]);
            h.session.audio.push(frame, generation);
        }
        h.controller.tick();
        assert_eq!(h.session.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_buffering_timeout_fails_session() {
        let mut config = PlayerConfig::default();
        config.buffering_timeout = Duration::from_millis(1);
        let mut h = harness(config);
        thread::sleep(Duration::from_millis(5));
        h.controller.tick();

        let PlaybackState::Error(report) = h.session.state() else {
            panic!("expected the error state");
        };
        assert_eq!(report.reason, ErrorReason::SourceUnreachable);
        assert!(matches!(report.error, PlayerError::BufferingTimeout { .. }));
        assert!(h.session.is_stopped());

        // Terminal: nothing moves it.
        h.controller.play();
        h.controller.seek(SeekTarget::Source(Duration::ZERO));
        assert!(matches!(h.session.state(), PlaybackState::Error(_)));
    }

    #[test]
    fn test_worker_events() {
        let mut h = harness(PlayerConfig::default());
        h.controller
            .on_worker_event(WorkerEvent::StretchDegraded(StretchError::Failure("boom".into())));
        assert_eq!(h.session.state(), PlaybackState::Opening);
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, PlayerEvent::Degraded(_))));

        h.controller
            .on_worker_event(WorkerEvent::SourceFailed(SourceError::Decode("bad packet".into())));
        let PlaybackState::Error(report) = h.session.state() else {
            panic!("expected the error state");
        };
        assert_eq!(report.reason, ErrorReason::DecodeFailure);
    }

    #[test]
    fn test_rate_override_validation() {
        let mut h = harness(PlayerConfig::default());
        assert!(matches!(
            h.controller.set_rate_override(Some(-1.0)),
            Err(PlayerError::InvalidRate(_))
        ));
        h.controller.set_rate_override(Some(2.0)).unwrap();
        assert_eq!(h.session.mapper.rate_override(), Some(2.0));
    }
}
