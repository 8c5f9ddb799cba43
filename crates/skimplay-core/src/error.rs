//! Error types for the playback core.
//!
//! Each concern owns a small `thiserror` enum; [`PlayerError`] wraps them for
//! the control surface. Every error that can park a session in the `Error`
//! state maps onto an [`ErrorReason`] so hosts can decide between retrying,
//! notifying the user, or filing a bug without parsing messages.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

/// Rejections raised while building or extending a segment map.
///
/// A rejected map never reaches the timeline mapper, so current playback is
/// unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentMapError {
    /// A single segment is unusable on its own (zero length, bad factor).
    #[error("invalid segment #{index}: {reason}")]
    InvalidSegment { index: usize, reason: String },

    /// Segments are out of order or overlap each other.
    #[error("malformed segment map at segment #{index}: {reason}")]
    MalformedSegmentMap { index: usize, reason: String },

    /// An extension tried to move the analysed scope backwards.
    #[error("segment map scope cannot shrink from {current:?} to {requested:?}")]
    ScopeRegression {
        current: Duration,
        requested: Duration,
    },
}

/// Errors reported by a [`FrameSource`](crate::source::FrameSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    Open(String),

    #[error("seek failed: {0}")]
    Seek(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// A hiccup worth retrying (network timeout, interrupted read).
    #[error("transient I/O error: {0}")]
    Transient(String),
}

impl SourceError {
    /// Returns true if retrying the same operation may succeed. Only a failed
    /// open is final; the media may still come back after a seek, decode or
    /// network error.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Open(_))
    }
}

/// Errors reported by a time-stretch backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StretchError {
    /// The backend hit an unrecoverable internal error.
    #[error("time-stretch failure: {0}")]
    Failure(String),

    #[error("unsupported audio format: {sample_rate} Hz, {channels} channels")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },
}

/// Top-level error for the player control surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlayerError {
    #[error(transparent)]
    SegmentMap(#[from] SegmentMapError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Stretch(#[from] StretchError),

    #[error("buffering stalled for {stalled_for:?}")]
    BufferingTimeout { stalled_for: Duration },

    #[error("invalid playback rate {0}: must be finite and greater than zero")]
    InvalidRate(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine lost track of its own state (a worker died, a channel closed).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Structured cause attached to every transition into the `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// The source could not be reached or stopped delivering data.
    SourceUnreachable,
    /// The source was reachable but produced undecodable data.
    DecodeFailure,
    /// The engine itself is inconsistent.
    InternalInconsistency,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorReason::SourceUnreachable => write!(f, "source unreachable"),
            ErrorReason::DecodeFailure => write!(f, "decode failure"),
            ErrorReason::InternalInconsistency => write!(f, "internal inconsistency"),
        }
    }
}

impl PlayerError {
    /// Classifies this error for hosts reacting to the `Error` state.
    pub fn reason(&self) -> ErrorReason {
        match self {
            PlayerError::Source(SourceError::Open(_))
            | PlayerError::Source(SourceError::Unreachable(_))
            | PlayerError::Source(SourceError::Transient(_))
            | PlayerError::BufferingTimeout { .. } => ErrorReason::SourceUnreachable,
            PlayerError::Source(SourceError::Seek(_))
            | PlayerError::Source(SourceError::Decode(_))
            | PlayerError::Stretch(_) => ErrorReason::DecodeFailure,
            PlayerError::SegmentMap(_)
            | PlayerError::InvalidRate(_)
            | PlayerError::InvalidConfig(_)
            | PlayerError::Internal(_) => ErrorReason::InternalInconsistency,
        }
    }
}

/// The payload of the `Error` state: what happened and how to classify it.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub reason: ErrorReason,
    pub error: PlayerError,
}

impl From<PlayerError> for ErrorReport {
    fn from(error: PlayerError) -> Self {
        Self {
            reason: error.reason(),
            error,
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_classification() {
        let open: PlayerError = SourceError::Open("404".into()).into();
        assert_eq!(open.reason(), ErrorReason::SourceUnreachable);

        let decode: PlayerError = SourceError::Decode("bad nal".into()).into();
        assert_eq!(decode.reason(), ErrorReason::DecodeFailure);

        let timeout = PlayerError::BufferingTimeout {
            stalled_for: Duration::from_secs(10),
        };
        assert_eq!(timeout.reason(), ErrorReason::SourceUnreachable);

        let internal = PlayerError::Internal("decode worker exited".into());
        assert_eq!(internal.reason(), ErrorReason::InternalInconsistency);
    }

    #[test]
    fn test_report_display() {
        let report = ErrorReport::from(PlayerError::from(SourceError::Seek("eof".into())));
        assert_eq!(report.to_string(), "decode failure: seek failed: eof");
    }
}
