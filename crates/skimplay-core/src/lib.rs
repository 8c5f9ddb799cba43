//! skimplay-core: nonlinear media playback.
//!
//! Plays audio/video along a *logical timeline* derived from a segment map
//! that marks regions of the source to skip or to play faster or slower.
//! Audio is time-stretched without changing pitch and drives the master
//! clock; video is paced against it.
//!
//! - Timeline: [`segment_map`], [`timeline`]
//! - Media plumbing: [`frame`], [`source`], [`buffer`], [`sink`]
//! - Audio: [`stretch`]
//! - Sync: [`clock`], [`sync_metrics`]
//! - Control: [`player`], which runs the decode and output workers
//!
//! This crate does no demuxing, decoding or device output of its own; those
//! plug in through [`source::FrameSource`], [`sink::AudioSink`] and
//! [`sink::VideoSink`].

pub mod buffer;
pub mod clock;
pub mod config;
mod decode;
pub mod error;
pub mod frame;
mod output;
pub mod player;
pub mod segment_map;
mod session;
pub mod sink;
pub mod source;
pub mod stretch;
pub mod sync_metrics;
pub mod timeline;

pub use config::{BufferConfig, PlayerConfig};
pub use error::{ErrorReason, ErrorReport, PlayerError, Result, SegmentMapError, SourceError, StretchError};
pub use player::{PlaybackState, Player, PlayerEvent, Position, SeekTarget, Sinks};
pub use segment_map::{Segment, SegmentKind, SegmentMap};
pub use source::{FrameSource, SyntheticConfig, SyntheticSource};
pub use sync_metrics::{SyncMetrics, SyncMetricsSnapshot};
