//! Engine configuration.

use std::time::Duration;

use crate::error::PlayerError;

/// Capacity and watermarks of one elastic buffer, all measured in media time.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferConfig {
    /// The producer blocks once this much media is queued.
    pub capacity: Duration,
    /// Dropping below this while playing enters `Buffering`.
    pub low_watermark: Duration,
    /// `Buffering` ends once the queue holds at least this much.
    pub resume_watermark: Duration,
}

impl BufferConfig {
    /// 500ms of audio; buffering below 100ms, resuming at 250ms.
    pub fn for_audio() -> Self {
        Self {
            capacity: Duration::from_millis(500),
            low_watermark: Duration::from_millis(100),
            resume_watermark: Duration::from_millis(250),
        }
    }

    /// 300ms of video; buffering below 40ms (about one frame), resuming at 120ms.
    pub fn for_video() -> Self {
        Self {
            capacity: Duration::from_millis(300),
            low_watermark: Duration::from_millis(40),
            resume_watermark: Duration::from_millis(120),
        }
    }

    fn validate(&self, name: &str) -> Result<(), PlayerError> {
        if self.capacity.is_zero() {
            return Err(PlayerError::InvalidConfig(format!(
                "{name} buffer capacity must be non-zero"
            )));
        }
        if self.low_watermark > self.resume_watermark || self.resume_watermark > self.capacity {
            return Err(PlayerError::InvalidConfig(format!(
                "{name} buffer needs low <= resume <= capacity, got {:?} / {:?} / {:?}",
                self.low_watermark, self.resume_watermark, self.capacity
            )));
        }
        Ok(())
    }
}

/// Tunables for a [`Player`](crate::player::Player).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PlayerConfig {
    pub audio_buffer: BufferConfig,
    pub video_buffer: BufferConfig,
    /// Half-width of the window in which a video frame counts as on time.
    pub sync_tolerance: Duration,
    /// How long `Buffering` may last before the session fails.
    pub buffering_timeout: Duration,
    /// Attempts per source operation before an error surfaces.
    pub source_retries: u32,
    /// Pause between source retries.
    pub retry_backoff: Duration,
    /// Skips shorter than this are decoded and discarded instead of seeked over.
    pub min_skip_jump: Duration,
    /// Frames per stretch block handed to the audio sink.
    pub stretch_block_frames: usize,
    /// Accumulated stretch drift that triggers a correction.
    pub drift_fix_threshold: Duration,
    /// Largest relative ratio correction applied per block (0.1 = 10%).
    pub max_drift_fix: f64,
    /// Ramp length used to hide cuts in the audio stream.
    pub transition_smoothing: Duration,
    /// Interval between position notifications while playing.
    pub position_interval: Duration,
    /// How fast the sinks consume media relative to real time. Headless
    /// hosts that pace their sinks faster than real time set this so the
    /// wall clock and the video pacing keep up.
    pub time_scale: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            audio_buffer: BufferConfig::for_audio(),
            video_buffer: BufferConfig::for_video(),
            sync_tolerance: Duration::from_millis(20),
            buffering_timeout: Duration::from_secs(10),
            source_retries: 3,
            retry_backoff: Duration::from_millis(50),
            min_skip_jump: Duration::from_millis(250),
            stretch_block_frames: 1024,
            drift_fix_threshold: Duration::from_millis(50),
            max_drift_fix: 0.1,
            transition_smoothing: Duration::from_millis(5),
            position_interval: Duration::from_millis(100),
            time_scale: 1.0,
        }
    }
}

impl PlayerConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), PlayerError> {
        self.audio_buffer.validate("audio")?;
        self.video_buffer.validate("video")?;
        if self.sync_tolerance.is_zero() {
            return Err(PlayerError::InvalidConfig(
                "sync tolerance must be non-zero".to_string(),
            ));
        }
        if self.stretch_block_frames == 0 {
            return Err(PlayerError::InvalidConfig(
                "stretch block must hold at least one frame".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.max_drift_fix) {
            return Err(PlayerError::InvalidConfig(format!(
                "max drift fix {} must be in [0, 1)",
                self.max_drift_fix
            )));
        }
        if !(self.time_scale.is_finite() && self.time_scale > 0.0) {
            return Err(PlayerError::InvalidConfig(format!(
                "time scale {} must be finite and positive",
                self.time_scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio_buffer.capacity, Duration::from_millis(500));
        assert_eq!(config.video_buffer.capacity, Duration::from_millis(300));
        assert_eq!(config.sync_tolerance, Duration::from_millis(20));
    }

    #[test]
    fn test_watermark_above_capacity_rejected() {
        let mut config = PlayerConfig::default();
        config.video_buffer.resume_watermark = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(PlayerError::InvalidConfig(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_config_from_json() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{"source_retries": 7}"#).unwrap();
        assert_eq!(config.source_retries, 7);
        assert_eq!(config.min_skip_jump, Duration::from_millis(250));
    }
}
