//! Timeline mapper: the live, swappable view of the segment map.
//!
//! Readers take an `Arc` snapshot of the current [`VersionedMap`] and work on
//! it without holding any lock, so a swap never tears a computation in half;
//! the old map stays alive until its last reader drops it.
//!
//! The mapper also decides, frame by frame, what the decode context must do
//! with freshly decoded media: keep it, cut skipped samples out of it, throw
//! it away, or jump the source past a skip region.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::PlayerError;
use crate::frame::StreamKind;
use crate::segment_map::{is_valid_speed, SegmentKind, SegmentMap};

/// A segment map tagged with the version it was installed under.
#[derive(Debug)]
pub struct VersionedMap {
    pub version: u64,
    pub map: SegmentMap,
}

impl std::ops::Deref for VersionedMap {
    type Target = SegmentMap;

    fn deref(&self) -> &SegmentMap {
        &self.map
    }
}

/// Copy-on-write holder for the active segment map.
pub struct SharedSegmentMap {
    current: RwLock<Arc<VersionedMap>>,
}

impl SharedSegmentMap {
    pub fn new(map: SegmentMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(VersionedMap { version: 0, map })),
        }
    }

    /// Snapshot of the current map.
    pub fn load(&self) -> Arc<VersionedMap> {
        Arc::clone(&self.current.read())
    }

    /// Installs `map` and returns its version.
    pub fn swap(&self, map: SegmentMap) -> u64 {
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(VersionedMap { version, map });
        version
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }
}

/// Engine-initiated seek past a skip region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipJump {
    pub skip_start: Duration,
    pub skip_end: Duration,
}

/// What the decode context does with one decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePlan {
    /// Nothing in the frame is skipped.
    Keep,
    /// Only the listed source ranges survive (audio cut at a skip edge).
    Trim(Vec<(Duration, Duration)>),
    /// The frame lies in a skip too short to seek over; discard it.
    Drop,
    /// The frame lies in a long skip; seek the source past it.
    Jump(SkipJump),
}

/// Shared mapping state: the active map, the rate override and jump policy.
pub struct TimelineMapper {
    maps: SharedSegmentMap,
    /// `f64` bits of the manual rate override, 0 when unset.
    rate_override: AtomicU64,
    min_skip_jump: Duration,
}

impl TimelineMapper {
    pub fn new(map: SegmentMap, min_skip_jump: Duration) -> Self {
        Self {
            maps: SharedSegmentMap::new(map),
            rate_override: AtomicU64::new(0),
            min_skip_jump,
        }
    }

    pub fn map(&self) -> Arc<VersionedMap> {
        self.maps.load()
    }

    pub fn version(&self) -> u64 {
        self.maps.version()
    }

    /// Atomically replaces the active map, returning the new version.
    pub fn replace(&self, map: SegmentMap) -> u64 {
        let version = self.maps.swap(map);
        tracing::debug!("segment map v{} installed", version);
        version
    }

    pub fn source_to_logical(&self, source_ts: Duration) -> Duration {
        self.maps.load().source_to_logical(source_ts)
    }

    pub fn logical_to_source(&self, logical_ts: Duration) -> Duration {
        self.maps.load().logical_to_source(logical_ts)
    }

    /// Sets or clears the manual rate override.
    pub fn set_rate_override(&self, rate: Option<f64>) -> Result<(), PlayerError> {
        let bits = match rate {
            Some(r) if !is_valid_speed(r) => return Err(PlayerError::InvalidRate(r)),
            Some(r) => r.to_bits(),
            None => 0,
        };
        self.rate_override.store(bits, Ordering::Release);
        Ok(())
    }

    pub fn rate_override(&self) -> Option<f64> {
        match self.rate_override.load(Ordering::Acquire) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Rate a piece of the given kind plays at, honouring the override.
    pub fn effective_rate(&self, kind: SegmentKind) -> f64 {
        match (kind, self.rate_override()) {
            (SegmentKind::Skip, _) => 1.0,
            (SegmentKind::Speed(_), Some(rate)) => rate,
            (SegmentKind::Speed(factor), None) => factor,
        }
    }

    /// Decides what to do with a decoded frame spanning `[start, end)`.
    ///
    /// Video frames are judged by their start only: a picture that begins
    /// before a skip stays on screen until the next one.
    pub fn plan(&self, map: &SegmentMap, stream: StreamKind, start: Duration, end: Duration) -> FramePlan {
        if let Some(skip) = map.skip_at(start) {
            let skips_whole_frame = stream == StreamKind::Video || end <= skip.source_end;
            if skip.source_end - start >= self.min_skip_jump {
                return FramePlan::Jump(SkipJump {
                    skip_start: skip.source_start,
                    skip_end: skip.source_end,
                });
            }
            if skips_whole_frame {
                return FramePlan::Drop;
            }
        } else if stream == StreamKind::Video {
            return FramePlan::Keep;
        }

        let pieces = map.pieces(start, end);
        if pieces.iter().all(|p| p.kind != SegmentKind::Skip) {
            return FramePlan::Keep;
        }
        let kept: Vec<_> = pieces
            .iter()
            .filter(|p| p.kind != SegmentKind::Skip)
            .map(|p| (p.source_start, p.source_end))
            .collect();
        if kept.is_empty() {
            FramePlan::Drop
        } else {
            FramePlan::Trim(kept)
        }
    }
}

/// Caches `rate_at` for a consumer walking forward through the source.
///
/// The rate is recomputed only when the position leaves the piece it was
/// computed for, or when a different map version is installed.
#[derive(Debug, Default)]
pub struct RateCursor {
    version: Option<u64>,
    valid_from: Duration,
    valid_until: Option<Duration>,
    kind: Option<SegmentKind>,
}

impl RateCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment kind in force at `source_ts`.
    pub fn kind_at(&mut self, map: &VersionedMap, source_ts: Duration) -> SegmentKind {
        let in_range = source_ts >= self.valid_from
            && self.valid_until.map_or(true, |until| source_ts < until);
        match self.kind {
            Some(kind) if self.version == Some(map.version) && in_range => kind,
            _ => {
                let kind = map
                    .segment_at(source_ts)
                    .map_or(SegmentKind::Speed(1.0), |s| s.kind);
                self.version = Some(map.version);
                self.valid_from = map
                    .segment_at(source_ts)
                    .map_or(source_ts, |s| s.source_start);
                self.valid_until = map.next_boundary_after(source_ts);
                self.kind = Some(kind);
                tracing::trace!(
                    "rate cursor: {:?} from {:?} until {:?}",
                    kind,
                    self.valid_from,
                    self.valid_until
                );
                kind
            }
        }
    }

    /// Segment kind in force over all of `[start, end)`, or `None` if the
    /// range crosses a boundary and has to be split.
    pub fn kind_over(
        &mut self,
        map: &VersionedMap,
        start: Duration,
        end: Duration,
    ) -> Option<SegmentKind> {
        let kind = self.kind_at(map, start);
        match self.valid_until {
            Some(until) if end > until => None,
            _ => Some(kind),
        }
    }

    /// Forgets the cached piece; the next lookup recomputes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment_map::Segment;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn mapper(segments: Vec<Segment>) -> TimelineMapper {
        TimelineMapper::new(
            SegmentMap::new(segments).unwrap(),
            Duration::from_millis(250),
        )
    }

    #[test]
    fn test_swap_bumps_version_and_keeps_old_snapshot() {
        let mapper = mapper(vec![]);
        let before = mapper.map();
        assert_eq!(before.version, 0);

        let v = mapper.replace(SegmentMap::new(vec![Segment::skip(secs(1.0), secs(2.0))]).unwrap());
        assert_eq!(v, 1);
        assert_eq!(mapper.version(), 1);
        // The old snapshot is still intact for whoever holds it.
        assert!(before.is_empty());
        assert_eq!(mapper.map().len(), 1);
    }

    #[test]
    fn test_plan_long_skip_jumps() {
        let mapper = mapper(vec![Segment::skip(secs(20.0), secs(30.0))]);
        let map = mapper.map();
        let plan = mapper.plan(&map, StreamKind::Audio, secs(20.0), secs(20.02));
        assert_eq!(
            plan,
            FramePlan::Jump(SkipJump {
                skip_start: secs(20.0),
                skip_end: secs(30.0)
            })
        );
        assert_eq!(
            mapper.plan(&map, StreamKind::Video, secs(25.0), secs(25.04)),
            FramePlan::Jump(SkipJump {
                skip_start: secs(20.0),
                skip_end: secs(30.0)
            })
        );
    }

    #[test]
    fn test_plan_short_skip_drops() {
        let mapper = mapper(vec![Segment::skip(secs(1.0), secs(1.1))]);
        let map = mapper.map();
        assert_eq!(
            mapper.plan(&map, StreamKind::Video, secs(1.04), secs(1.08)),
            FramePlan::Drop
        );
        assert_eq!(
            mapper.plan(&map, StreamKind::Audio, secs(1.0), secs(1.05)),
            FramePlan::Drop
        );
    }

    #[test]
    fn test_plan_trims_audio_at_skip_edges() {
        let mapper = mapper(vec![Segment::skip(secs(1.0), secs(5.0))]);
        let map = mapper.map();
        assert_eq!(
            mapper.plan(&map, StreamKind::Audio, secs(0.99), secs(1.01)),
            FramePlan::Trim(vec![(secs(0.99), secs(1.0))])
        );
        // Video frames starting before the skip are kept whole.
        assert_eq!(
            mapper.plan(&map, StreamKind::Video, secs(0.99), secs(1.03)),
            FramePlan::Keep
        );
        assert_eq!(
            mapper.plan(&map, StreamKind::Audio, secs(0.5), secs(0.6)),
            FramePlan::Keep
        );
    }

    #[test]
    fn test_rate_override() {
        let mapper = mapper(vec![
            Segment::speed(secs(0.0), secs(10.0), 1.5),
            Segment::skip(secs(10.0), secs(20.0)),
        ]);
        assert_eq!(mapper.effective_rate(SegmentKind::Speed(1.5)), 1.5);

        mapper.set_rate_override(Some(3.0)).unwrap();
        assert_eq!(mapper.effective_rate(SegmentKind::Speed(1.5)), 3.0);
        assert_eq!(mapper.effective_rate(SegmentKind::Skip), 1.0);

        assert!(mapper.set_rate_override(Some(0.0)).is_err());
        assert!(mapper.set_rate_override(Some(f64::NAN)).is_err());
        assert!(mapper.set_rate_override(Some(1e-20)).is_err());
        assert_eq!(mapper.rate_override(), Some(3.0));

        mapper.set_rate_override(None).unwrap();
        assert_eq!(mapper.rate_override(), None);
    }

    #[test]
    fn test_rate_cursor_recomputes_on_crossing_and_swap() {
        let mapper = mapper(vec![Segment::speed(secs(2.0), secs(4.0), 2.0)]);
        let mut cursor = RateCursor::new();

        let map = mapper.map();
        assert_eq!(cursor.kind_at(&map, secs(1.0)), SegmentKind::Speed(1.0));
        assert_eq!(cursor.kind_at(&map, secs(2.5)), SegmentKind::Speed(2.0));
        assert_eq!(cursor.kind_at(&map, secs(4.0)), SegmentKind::Speed(1.0));

        mapper.replace(SegmentMap::new(vec![Segment::speed(secs(0.0), secs(10.0), 1.25)]).unwrap());
        let map = mapper.map();
        assert_eq!(cursor.kind_at(&map, secs(4.5)), SegmentKind::Speed(1.25));
    }
}
