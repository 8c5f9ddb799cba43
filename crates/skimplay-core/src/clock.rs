//! Master clock for A/V sync, on the logical timeline.
//!
//! When the source has audio, the clock follows what the audio sink has
//! accepted: the logical start of the last accepted block plus the time since
//! it was accepted, never running past the end of that block. Without audio
//! (or after the audio stream has drained) a [`WallClock`] takes over from
//! wherever the audio left it.
//!
//! Only the audio output worker calls [`SyncClock::update_audio`]; everyone
//! else reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A pausable, seekable clock driven by `Instant`, advancing at `speed`.
#[derive(Debug, Clone)]
pub struct WallClock {
    base: Duration,
    started: Option<Instant>,
    speed: f64,
}

impl WallClock {
    /// A paused clock at `at`.
    pub fn new(at: Duration) -> Self {
        Self {
            base: at,
            started: None,
            speed: 1.0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn position(&self) -> Duration {
        self.position_at(Instant::now())
    }

    pub fn position_at(&self, now: Instant) -> Duration {
        match self.started {
            Some(started) => {
                self.base + now.saturating_duration_since(started).mul_f64(self.speed)
            }
            None => self.base,
        }
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub fn pause_at(&mut self, now: Instant) {
        self.base = self.position_at(now);
        self.started = None;
    }

    /// Jumps to `at`, keeping the running state.
    pub fn seek(&mut self, at: Duration) {
        self.seek_at(at, Instant::now());
    }

    pub fn seek_at(&mut self, at: Duration, now: Instant) {
        self.base = at;
        if self.started.is_some() {
            self.started = Some(now);
        }
    }

    /// Changes the rate at which the clock advances from now on.
    pub fn set_speed(&mut self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) || speed == self.speed {
            return;
        }
        let now = Instant::now();
        self.base = self.position_at(now);
        if self.started.is_some() {
            self.started = Some(now);
        }
        self.speed = speed;
    }
}

/// The last audio block the sink accepted.
#[derive(Debug, Clone, Copy)]
struct AudioAnchor {
    logical_start: Duration,
    logical_len: Duration,
    /// How long the block takes to play out at the rate it was stretched to.
    output_len: Duration,
    accepted_at: Instant,
}

impl AudioAnchor {
    fn position_at(&self, now: Instant) -> Duration {
        if self.output_len.is_zero() {
            return self.logical_start + self.logical_len;
        }
        let elapsed = now.saturating_duration_since(self.accepted_at).as_secs_f64();
        let progress = (elapsed / self.output_len.as_secs_f64()).min(1.0);
        self.logical_start + self.logical_len.mul_f64(progress)
    }

    fn logical_end(&self) -> Duration {
        self.logical_start + self.logical_len
    }
}

struct ClockShared {
    audio: Option<AudioAnchor>,
    wall: WallClock,
    paused: bool,
}

impl ClockShared {
    fn position_at(&self, now: Instant) -> Duration {
        match (&self.audio, self.paused) {
            (Some(anchor), false) => anchor.position_at(now),
            _ => self.wall.position_at(now),
        }
    }
}

/// Shared master clock.
#[derive(Clone)]
pub struct SyncClock {
    inner: Arc<SyncClockInner>,
}

struct SyncClockInner {
    shared: Mutex<ClockShared>,
    /// Logical duration of all audio accepted since the last reset
    audio_consumed_us: AtomicU64,
    /// Clock position minus the start of the newest block, at acceptance
    last_drift_us: AtomicI64,
    /// Sink consumption speed relative to real time
    time_scale: f64,
}

impl SyncClock {
    /// A paused clock at zero.
    pub fn new() -> Self {
        Self::with_time_scale(1.0)
    }

    /// A paused clock at zero whose sinks run `time_scale` times real time.
    pub fn with_time_scale(time_scale: f64) -> Self {
        let time_scale = if time_scale.is_finite() && time_scale > 0.0 {
            time_scale
        } else {
            1.0
        };
        let mut wall = WallClock::new(Duration::ZERO);
        wall.set_speed(time_scale);
        Self {
            inner: Arc::new(SyncClockInner {
                shared: Mutex::new(ClockShared {
                    audio: None,
                    wall,
                    paused: true,
                }),
                audio_consumed_us: AtomicU64::new(0),
                last_drift_us: AtomicI64::new(0),
                time_scale,
            }),
        }
    }

    pub fn time_scale(&self) -> f64 {
        self.inner.time_scale
    }

    /// Current logical position.
    pub fn now(&self) -> Duration {
        self.inner.shared.lock().position_at(Instant::now())
    }

    /// Whether audio currently drives the clock.
    pub fn is_audio_master(&self) -> bool {
        self.inner.shared.lock().audio.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.shared.lock().paused
    }

    /// Records that the sink accepted a block covering
    /// `[logical_start, logical_start + logical_len)` that plays for `output_len`.
    pub fn update_audio(&self, logical_start: Duration, logical_len: Duration, output_len: Duration) {
        let now = Instant::now();
        let mut shared = self.inner.shared.lock();
        if let Some(previous) = shared.audio {
            let expected = previous.position_at(now);
            let drift = expected.as_micros() as i64 - logical_start.as_micros() as i64;
            self.inner.last_drift_us.store(drift, Ordering::Relaxed);
        }
        shared.audio = Some(AudioAnchor {
            logical_start,
            logical_len,
            output_len: output_len.div_f64(self.inner.time_scale),
            accepted_at: now,
        });
        if !shared.paused {
            shared.wall.seek_at(logical_start, now);
        }
        self.inner
            .audio_consumed_us
            .fetch_add(logical_len.as_micros() as u64, Ordering::Relaxed);
    }

    /// Hands the clock to the wall clock at its current position (audio drained).
    pub fn release_audio(&self) {
        let now = Instant::now();
        let mut shared = self.inner.shared.lock();
        if shared.audio.is_none() {
            return;
        }
        let position = shared.position_at(now);
        shared.audio = None;
        shared.wall.seek_at(position, now);
        tracing::debug!("clock released by audio at {:?}", position);
    }

    pub fn pause(&self) {
        let now = Instant::now();
        let mut shared = self.inner.shared.lock();
        if shared.paused {
            return;
        }
        let position = shared.position_at(now);
        shared.wall.seek_at(position, now);
        shared.wall.pause_at(now);
        shared.paused = true;
    }

    pub fn resume(&self) {
        let now = Instant::now();
        let mut shared = self.inner.shared.lock();
        if !shared.paused {
            return;
        }
        let base = shared.wall.position_at(now);
        if let Some(anchor) = shared.audio.as_mut() {
            // Re-anchor the unplayed remainder of the block at `base`.
            let end = anchor.logical_end().max(base);
            let remaining = end - base;
            let scale = if anchor.logical_len.is_zero() {
                0.0
            } else {
                remaining.as_secs_f64() / anchor.logical_len.as_secs_f64()
            };
            *anchor = AudioAnchor {
                logical_start: base,
                logical_len: remaining,
                output_len: anchor.output_len.mul_f64(scale),
                accepted_at: now,
            };
        }
        shared.wall.resume_at(now);
        shared.paused = false;
    }

    /// Drops audio state and jumps to `at` (seek, map replacement).
    pub fn reset(&self, at: Duration) {
        let mut shared = self.inner.shared.lock();
        shared.audio = None;
        shared.wall.seek(at);
        self.inner.audio_consumed_us.store(0, Ordering::Relaxed);
        self.inner.last_drift_us.store(0, Ordering::Relaxed);
    }

    /// Wall-clock rate in logical time per second (rate override over map rate).
    pub fn set_speed(&self, speed: f64) {
        self.inner
            .shared
            .lock()
            .wall
            .set_speed(speed * self.inner.time_scale);
    }

    pub fn audio_consumed(&self) -> Duration {
        Duration::from_micros(self.inner.audio_consumed_us.load(Ordering::Relaxed))
    }

    /// Signed drift in microseconds seen at the last audio update.
    pub fn last_drift_us(&self) -> i64 {
        self.inner.last_drift_us.load(Ordering::Relaxed)
    }
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_pause_resume_seek() {
        let t0 = Instant::now();
        let mut clock = WallClock::new(Duration::from_secs(1));
        assert_eq!(clock.position_at(t0 + Duration::from_secs(5)), Duration::from_secs(1));

        clock.resume_at(t0);
        assert_eq!(clock.position_at(t0 + Duration::from_secs(2)), Duration::from_secs(3));

        clock.pause_at(t0 + Duration::from_secs(2));
        assert_eq!(clock.position_at(t0 + Duration::from_secs(9)), Duration::from_secs(3));

        clock.seek_at(Duration::from_secs(10), t0 + Duration::from_secs(9));
        clock.resume_at(t0 + Duration::from_secs(9));
        assert_eq!(
            clock.position_at(t0 + Duration::from_secs(10)),
            Duration::from_secs(11)
        );
    }

    #[test]
    fn test_audio_anchor_caps_at_block_end() {
        let t0 = Instant::now();
        let anchor = AudioAnchor {
            logical_start: Duration::from_secs(4),
            logical_len: Duration::from_millis(100),
            output_len: Duration::from_millis(200),
            accepted_at: t0,
        };
        assert_eq!(
            anchor.position_at(t0 + Duration::from_millis(100)),
            Duration::from_millis(4050)
        );
        assert_eq!(
            anchor.position_at(t0 + Duration::from_secs(3)),
            Duration::from_millis(4100)
        );
    }

    #[test]
    fn test_audio_drives_clock() {
        let clock = SyncClock::new();
        clock.resume();
        clock.update_audio(
            Duration::from_secs(7),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(clock.is_audio_master());
        let now = clock.now();
        assert!(now >= Duration::from_secs(7) && now < Duration::from_secs(8));
        assert_eq!(clock.audio_consumed(), Duration::from_secs(60));
    }

    #[test]
    fn test_pause_freezes_audio_clock() {
        let clock = SyncClock::new();
        clock.resume();
        clock.update_audio(Duration::from_secs(2), Duration::from_secs(1), Duration::from_secs(1));
        clock.pause();
        let frozen = clock.now();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.now(), frozen);

        clock.resume();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.now() > frozen);
    }

    #[test]
    fn test_time_scale_speeds_up_wall_clock() {
        let clock = SyncClock::with_time_scale(10.0);
        clock.resume();
        std::thread::sleep(Duration::from_millis(50));
        assert!(clock.now() >= Duration::from_millis(500));
    }

    #[test]
    fn test_reset_and_release() {
        let clock = SyncClock::new();
        clock.update_audio(Duration::from_secs(3), Duration::from_millis(50), Duration::from_millis(50));
        clock.reset(Duration::from_secs(30));
        assert!(!clock.is_audio_master());
        assert_eq!(clock.now(), Duration::from_secs(30));
        assert_eq!(clock.audio_consumed(), Duration::ZERO);

        clock.resume();
        clock.update_audio(Duration::from_secs(31), Duration::ZERO, Duration::ZERO);
        clock.release_audio();
        assert!(!clock.is_audio_master());
        let now = clock.now();
        assert!(now >= Duration::from_secs(31) && now < Duration::from_millis(31_500));
    }
}
