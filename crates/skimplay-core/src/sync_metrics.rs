//! Presentation drift and playback health counters.
//!
//! Every video frame handed to the sink is compared against the master clock
//! on the logical timeline. The difference is folded into a [`DriftTracker`];
//! discrete incidents (late or overflow drops, audio discarded by a skip,
//! underruns and stalls) go into a small counter table. Both are lock-free so
//! the output workers can record from their hot loops.
//!
//! ```ignore
//! let metrics = SyncMetrics::new();
//! metrics.record_frame(frame_logical_ts, clock.now());
//! if !metrics.snapshot().passed_sync_test() { ... }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A frame further than this from the clock is out of sync.
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 40;

/// Frames drifting past this are reported in the log.
pub const SYNC_DRIFT_WARNING_MS: i64 = 100;

/// Any drift past this fails [`SyncMetricsSnapshot::passed_sync_test`].
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Largest share of out-of-sync frames a passing session may have.
const MAX_OUT_OF_SYNC_PERCENT: f64 = 5.0;

/// Fewer presented frames than this never pass.
const MIN_FRAMES_FOR_VERDICT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallType {
    /// The source stopped yielding frames
    Decode,
    /// A buffer emptied during playback
    Buffering,
}

#[derive(Clone, Copy)]
enum Incident {
    LateDrop,
    OverflowDrop,
    SkippedAudio,
    Underrun,
    DecodeStall,
    BufferingStall,
}

const INCIDENT_KINDS: usize = 6;

/// Signed drift statistics, all in microseconds. Positive means the frame
/// was presented ahead of the clock.
struct DriftTracker {
    latest: AtomicI64,
    peak_ahead: AtomicI64,
    peak_behind: AtomicI64,
    abs_sum: AtomicU64,
    frames: AtomicU64,
    out_of_sync: AtomicU64,
    last_frame_us: AtomicU64,
    last_clock_us: AtomicU64,
    /// Frames still excluded from the peaks (set after a seek)
    grace: AtomicU64,
}

impl DriftTracker {
    fn new() -> Self {
        Self {
            latest: AtomicI64::new(0),
            peak_ahead: AtomicI64::new(0),
            peak_behind: AtomicI64::new(0),
            abs_sum: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            out_of_sync: AtomicU64::new(0),
            last_frame_us: AtomicU64::new(0),
            last_clock_us: AtomicU64::new(0),
            grace: AtomicU64::new(0),
        }
    }

    fn take_grace(&self) -> bool {
        self.grace
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .is_ok()
    }

    /// Folds one frame in and returns the signed drift.
    fn observe(&self, frame_us: u64, clock_us: u64) -> i64 {
        let drift = frame_us as i64 - clock_us as i64;
        self.last_frame_us.store(frame_us, Ordering::Relaxed);
        self.last_clock_us.store(clock_us, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.abs_sum.fetch_add(drift.unsigned_abs(), Ordering::Relaxed);

        if !self.take_grace() {
            self.latest.store(drift, Ordering::Relaxed);
            if drift > 0 {
                self.peak_ahead.fetch_max(drift, Ordering::Relaxed);
            } else {
                self.peak_behind.fetch_min(drift, Ordering::Relaxed);
            }
        }
        if drift.unsigned_abs() / 1000 > SYNC_DRIFT_THRESHOLD_MS as u64 {
            self.out_of_sync.fetch_add(1, Ordering::Relaxed);
        }
        drift
    }
}

/// Shared handle; clones record into the same counters.
#[derive(Clone)]
pub struct SyncMetrics {
    shared: Arc<Shared>,
}

struct Shared {
    drift: DriftTracker,
    incidents: [AtomicU64; INCIDENT_KINDS],
    audio_master: AtomicBool,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                drift: DriftTracker::new(),
                incidents: std::array::from_fn(|_| AtomicU64::new(0)),
                audio_master: AtomicBool::new(false),
            }),
        }
    }

    fn bump(&self, incident: Incident) -> u64 {
        self.shared.incidents[incident as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    fn count(&self, incident: Incident) -> u64 {
        self.shared.incidents[incident as usize].load(Ordering::Relaxed)
    }

    /// Marks whether the audio position or the wall clock is the master.
    pub fn set_using_audio_clock(&self, audio_master: bool) {
        self.shared
            .audio_master
            .store(audio_master, Ordering::Relaxed);
    }

    /// Records a frame presented at logical `frame_ts` while the master clock
    /// read `clock`. Returns how far the frame was early, zero if it was late.
    pub fn record_frame(&self, frame_ts: Duration, clock: Duration) -> Duration {
        let frame_us = frame_ts.as_micros() as u64;
        let clock_us = clock.as_micros() as u64;
        let drift = self.shared.drift.observe(frame_us, clock_us);

        if drift.abs() / 1000 > SYNC_DRIFT_WARNING_MS {
            tracing::warn!(
                frame_ts = ?frame_ts,
                clock = ?clock,
                drift_ms = drift / 1000,
                "video frame presented off the master clock"
            );
        }
        Duration::from_micros(drift.max(0) as u64)
    }

    pub fn record_late_drop(&self) {
        self.bump(Incident::LateDrop);
    }

    pub fn record_overflow_drop(&self) {
        self.bump(Incident::OverflowDrop);
    }

    /// Counts an audio block discarded because it fell inside a skip.
    pub fn record_skipped_audio(&self) {
        self.bump(Incident::SkippedAudio);
    }

    pub fn record_underrun(&self) {
        let n = self.bump(Incident::Underrun);
        tracing::debug!(underruns = n, "output found its buffer empty");
    }

    pub fn record_stall(&self, stall_type: StallType) {
        let n = match stall_type {
            StallType::Decode => self.bump(Incident::DecodeStall),
            StallType::Buffering => self.bump(Incident::BufferingStall),
        };
        tracing::warn!(kind = ?stall_type, occurrences = n, "playback stalled");
    }

    /// Keeps the next `frames` presentations out of the drift peaks.
    pub fn set_grace_period(&self, frames: u64) {
        self.shared.drift.grace.store(frames, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let d = &self.shared.drift;
        let sample_count = d.frames.load(Ordering::Relaxed);
        let avg_drift_us = d
            .abs_sum
            .load(Ordering::Relaxed)
            .checked_div(sample_count)
            .unwrap_or(0) as i64;
        let decode_stall_count = self.count(Incident::DecodeStall);
        let buffering_stall_count = self.count(Incident::BufferingStall);

        SyncMetricsSnapshot {
            current_drift_us: d.latest.load(Ordering::Relaxed),
            max_drift_ahead_us: d.peak_ahead.load(Ordering::Relaxed),
            max_drift_behind_us: d.peak_behind.load(Ordering::Relaxed),
            avg_drift_us,
            sample_count,
            out_of_sync_count: d.out_of_sync.load(Ordering::Relaxed),
            last_video_ts: Duration::from_micros(d.last_frame_us.load(Ordering::Relaxed)),
            last_clock: Duration::from_micros(d.last_clock_us.load(Ordering::Relaxed)),
            using_audio_clock: self.shared.audio_master.load(Ordering::Relaxed),
            late_drops: self.count(Incident::LateDrop),
            overflow_drops: self.count(Incident::OverflowDrop),
            skipped_audio_blocks: self.count(Incident::SkippedAudio),
            underrun_count: self.count(Incident::Underrun),
            stall_count: decode_stall_count + buffering_stall_count,
            decode_stall_count,
            buffering_stall_count,
        }
    }

    /// Emits one debug line summarising the session so far.
    pub fn log_status(&self) {
        let s = self.snapshot();
        tracing::debug!(
            frames = s.sample_count,
            drift_ms = s.current_drift_ms(),
            peak_ms = s.max_drift_ms(),
            mean_ms = s.avg_drift_us / 1000,
            out_of_sync = s.out_of_sync_count,
            late_drops = s.late_drops,
            overflow_drops = s.overflow_drops,
            skipped_audio = s.skipped_audio_blocks,
            audio_master = s.using_audio_clock,
            "sync status"
        );
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SyncMetricsSnapshot {
    /// Drift of the most recent frame outside the grace window
    pub current_drift_us: i64,
    pub max_drift_ahead_us: i64,
    /// Zero or negative
    pub max_drift_behind_us: i64,
    /// Mean of |drift| over every recorded frame
    pub avg_drift_us: i64,
    pub sample_count: u64,
    pub out_of_sync_count: u64,
    pub last_video_ts: Duration,
    pub last_clock: Duration,
    pub using_audio_clock: bool,
    pub late_drops: u64,
    pub overflow_drops: u64,
    pub skipped_audio_blocks: u64,
    pub underrun_count: u64,
    pub stall_count: u64,
    pub decode_stall_count: u64,
    pub buffering_stall_count: u64,
}

impl SyncMetricsSnapshot {
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    /// Largest drift seen in either direction, in milliseconds.
    pub fn max_drift_ms(&self) -> i64 {
        self.max_drift_ahead_us.max(-self.max_drift_behind_us) / 1000
    }

    pub fn out_of_sync_percentage(&self) -> f64 {
        match self.sample_count {
            0 => 0.0,
            n => self.out_of_sync_count as f64 * 100.0 / n as f64,
        }
    }

    pub fn passed_sync_test(&self) -> bool {
        self.sample_count >= MIN_FRAMES_FOR_VERDICT
            && self.max_drift_ms() < SYNC_DRIFT_SEVERE_MS
            && self.out_of_sync_percentage() < MAX_OUT_OF_SYNC_PERCENT
    }

    /// One-line human verdict, e.g. for the end of a demo run.
    pub fn quality_summary(&self) -> String {
        let peak = self.max_drift_ms();
        let grade = match peak {
            p if p < SYNC_DRIFT_THRESHOLD_MS => "tight",
            p if p < SYNC_DRIFT_WARNING_MS => "acceptable",
            p if p < SYNC_DRIFT_SEVERE_MS => "loose",
            _ => "broken",
        };
        format!(
            "{grade}: {} frames, peak {peak}ms, mean {}ms, {:.1}% off-sync; \
             drops {} late / {} overflow, {} underruns, {} stalls",
            self.sample_count,
            self.avg_drift_us / 1000,
            self.out_of_sync_percentage(),
            self.late_drops,
            self.overflow_drops,
            self.underrun_count,
            self.stall_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_early_and_late_frames() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.record_frame(ms(1_010), ms(1_000)), ms(10));
        assert_eq!(metrics.record_frame(ms(1_985), ms(2_000)), Duration::ZERO);

        let snap = metrics.snapshot();
        assert_eq!(snap.sample_count, 2);
        assert_eq!(snap.max_drift_ahead_us, 10_000);
        assert_eq!(snap.max_drift_behind_us, -15_000);
        assert_eq!(snap.current_drift_ms(), -15);
        assert_eq!(snap.max_drift_ms(), 15);
        assert_eq!(snap.avg_drift_us, 12_500);
        assert_eq!(snap.last_video_ts, ms(1_985));
    }

    #[test]
    fn test_verdict_needs_enough_frames() {
        let metrics = SyncMetrics::new();
        for i in 0..MIN_FRAMES_FOR_VERDICT - 1 {
            metrics.record_frame(ms(i * 40), ms(i * 40));
        }
        assert!(!metrics.snapshot().passed_sync_test());
        metrics.record_frame(ms(400), ms(400));
        assert!(metrics.snapshot().passed_sync_test());
    }

    #[test]
    fn test_severe_drift_fails_session() {
        let metrics = SyncMetrics::new();
        for i in 0..30 {
            metrics.record_frame(ms(i * 40), ms(i * 40));
        }
        metrics.record_frame(ms(1_500), ms(1_250));

        let snap = metrics.snapshot();
        assert_eq!(snap.out_of_sync_count, 1);
        assert_eq!(snap.max_drift_ms(), 250);
        assert!(!snap.passed_sync_test());
        assert!(snap.quality_summary().starts_with("broken"));
    }

    #[test]
    fn test_grace_window_after_seek() {
        let metrics = SyncMetrics::new();
        metrics.set_grace_period(2);
        metrics.record_frame(ms(9_000), Duration::ZERO);
        metrics.record_frame(Duration::ZERO, ms(9_000));
        assert_eq!(metrics.snapshot().max_drift_ms(), 0);
        // Averages still see grace frames.
        assert_eq!(metrics.snapshot().sample_count, 2);

        metrics.record_frame(ms(20), Duration::ZERO);
        assert_eq!(metrics.snapshot().max_drift_ms(), 20);
    }

    #[test]
    fn test_incident_counters() {
        let metrics = SyncMetrics::new();
        let worker = metrics.clone();
        worker.record_late_drop();
        worker.record_late_drop();
        worker.record_overflow_drop();
        worker.record_skipped_audio();
        worker.record_underrun();
        worker.record_stall(StallType::Buffering);
        worker.record_stall(StallType::Buffering);
        worker.record_stall(StallType::Decode);
        metrics.set_using_audio_clock(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.late_drops, 2);
        assert_eq!(snap.overflow_drops, 1);
        assert_eq!(snap.skipped_audio_blocks, 1);
        assert_eq!(snap.underrun_count, 1);
        assert_eq!(snap.buffering_stall_count, 2);
        assert_eq!(snap.decode_stall_count, 1);
        assert_eq!(snap.stall_count, 3);
        assert!(snap.using_audio_clock);
        assert_eq!(snap.sample_count, 0);
        assert_eq!(snap.out_of_sync_percentage(), 0.0);
    }
}
