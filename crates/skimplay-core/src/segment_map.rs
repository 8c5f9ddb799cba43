//! Skip/speed segment maps and the piecewise source <-> logical time mapping.
//!
//! A [`SegmentMap`] is an immutable, validated list of [`Segment`]s sorted by
//! `source_start`. Gaps between segments play at normal speed. The map
//! precomputes the logical start of every segment, so both mapping directions
//! are a binary search plus one multiply.
//!
//! ```text
//! source:  0 ---- 10 ==skip== 20 --x2-- 30 ---- 40
//! logical: 0 ---- 10          10 -----  15 ---- 25
//! ```
//!
//! Maps are never mutated once built. Replacing the active map is the job of
//! [`SharedSegmentMap`](crate::timeline::SharedSegmentMap).

use std::time::Duration;

use crate::error::SegmentMapError;

/// Slowest speed a segment may request.
pub const MIN_SPEED_FACTOR: f64 = 0.01;

/// Fastest speed a segment may request.
pub const MAX_SPEED_FACTOR: f64 = 100.0;

/// Returns true if `factor` is a playable speed multiplier.
pub fn is_valid_speed(factor: f64) -> bool {
    (MIN_SPEED_FACTOR..=MAX_SPEED_FACTOR).contains(&factor)
}

/// What happens to the source media inside a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SegmentKind {
    /// The region is never played.
    Skip,
    /// The region plays `factor` times faster than normal (`factor > 0`).
    Speed(f64),
}

impl SegmentKind {
    /// Logical duration produced by `source` worth of this kind.
    pub fn logical_len(&self, source: Duration) -> Duration {
        match *self {
            SegmentKind::Skip => Duration::ZERO,
            SegmentKind::Speed(factor) => source.div_f64(factor),
        }
    }

    /// Like [`logical_len`](Self::logical_len), but `None` instead of
    /// overflowing `Duration`.
    fn checked_logical_len(&self, source: Duration) -> Option<Duration> {
        match *self {
            SegmentKind::Skip => Some(Duration::ZERO),
            SegmentKind::Speed(factor) => {
                Duration::try_from_secs_f64(source.as_secs_f64() / factor).ok()
            }
        }
    }
}

/// A tagged region of the source timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    #[cfg_attr(feature = "serde", serde(rename = "start", with = "serde_secs"))]
    pub source_start: Duration,
    #[cfg_attr(feature = "serde", serde(rename = "end", with = "serde_secs"))]
    pub source_end: Duration,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new(source_start: Duration, source_end: Duration, kind: SegmentKind) -> Self {
        Self {
            source_start,
            source_end,
            kind,
        }
    }

    pub fn skip(source_start: Duration, source_end: Duration) -> Self {
        Self::new(source_start, source_end, SegmentKind::Skip)
    }

    pub fn speed(source_start: Duration, source_end: Duration, factor: f64) -> Self {
        Self::new(source_start, source_end, SegmentKind::Speed(factor))
    }

    /// Source duration covered by the segment.
    pub fn duration(&self) -> Duration {
        self.source_end.saturating_sub(self.source_start)
    }

    /// Returns true if `source_ts` lies in `[source_start, source_end)`.
    pub fn contains(&self, source_ts: Duration) -> bool {
        self.source_start <= source_ts && source_ts < self.source_end
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.kind, SegmentKind::Skip)
    }

    fn validate(&self, index: usize) -> Result<(), SegmentMapError> {
        if self.source_end <= self.source_start {
            return Err(SegmentMapError::InvalidSegment {
                index,
                reason: format!(
                    "zero-length segment [{:?}, {:?})",
                    self.source_start, self.source_end
                ),
            });
        }
        if let SegmentKind::Speed(factor) = self.kind {
            if !is_valid_speed(factor) {
                return Err(SegmentMapError::InvalidSegment {
                    index,
                    reason: format!(
                        "speed factor {factor} outside [{MIN_SPEED_FACTOR}, {MAX_SPEED_FACTOR}]"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A contiguous slice of the source timeline with a single playback kind.
///
/// Produced by [`SegmentMap::pieces`]; unlike [`Segment`] this also covers the
/// implicit normal-speed gaps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPiece {
    pub source_start: Duration,
    pub source_end: Duration,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone)]
struct Entry {
    segment: Segment,
    logical_start: Duration,
    logical_end: Duration,
}

/// Immutable, validated, ordered set of segments.
#[derive(Debug, Clone, Default)]
pub struct SegmentMap {
    entries: Vec<Entry>,
    /// Furthest source position covered by analysis; `None` means the map is complete.
    scope: Option<Duration>,
}

impl SegmentMap {
    /// A map with no segments: logical time equals source time.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validates `segments` and builds a complete map.
    ///
    /// Touching segments of the same kind are merged.
    pub fn new(segments: Vec<Segment>) -> Result<Self, SegmentMapError> {
        Self::build(segments, None)
    }

    /// Builds a partial map whose analysis only reaches `scope`.
    ///
    /// The scope is raised to the end of the last segment if it falls short.
    pub fn with_scope(segments: Vec<Segment>, scope: Duration) -> Result<Self, SegmentMapError> {
        Self::build(segments, Some(scope))
    }

    fn build(segments: Vec<Segment>, scope: Option<Duration>) -> Result<Self, SegmentMapError> {
        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());

        for (index, segment) in segments.into_iter().enumerate() {
            segment.validate(index)?;

            if let Some(prev) = merged.last_mut() {
                if segment.source_start < prev.source_start {
                    return Err(SegmentMapError::MalformedSegmentMap {
                        index,
                        reason: format!(
                            "starts at {:?}, before the previous segment at {:?}",
                            segment.source_start, prev.source_start
                        ),
                    });
                }
                if segment.source_start < prev.source_end {
                    return Err(SegmentMapError::MalformedSegmentMap {
                        index,
                        reason: format!(
                            "overlaps the previous segment ending at {:?}",
                            prev.source_end
                        ),
                    });
                }
                if segment.source_start == prev.source_end && segment.kind == prev.kind {
                    prev.source_end = segment.source_end;
                    continue;
                }
            }
            merged.push(segment);
        }

        let mut entries = Vec::with_capacity(merged.len());
        let mut source_cursor = Duration::ZERO;
        let mut logical_cursor = Duration::ZERO;
        for (index, segment) in merged.into_iter().enumerate() {
            let logical_start = logical_cursor.checked_add(segment.source_start - source_cursor);
            let logical_end = logical_start.and_then(|start| {
                segment
                    .kind
                    .checked_logical_len(segment.duration())
                    .and_then(|len| start.checked_add(len))
            });
            let (Some(logical_start), Some(logical_end)) = (logical_start, logical_end) else {
                return Err(SegmentMapError::InvalidSegment {
                    index,
                    reason: format!(
                        "logical length of [{:?}, {:?}) overflows",
                        segment.source_start, segment.source_end
                    ),
                });
            };
            entries.push(Entry {
                segment,
                logical_start,
                logical_end,
            });
            source_cursor = segment.source_end;
            logical_cursor = logical_end;
        }

        let scope = scope.map(|scope| scope.max(source_cursor));
        Ok(Self { entries, scope })
    }

    /// Appends the results of incremental analysis.
    ///
    /// New segments must start at or after the current scope, and the scope
    /// can only grow. Passing `None` as the new scope marks the map complete.
    pub fn extended(
        &self,
        segments: Vec<Segment>,
        new_scope: Option<Duration>,
    ) -> Result<Self, SegmentMapError> {
        let Some(current) = self.scope else {
            return Err(SegmentMapError::MalformedSegmentMap {
                index: 0,
                reason: "map already covers the whole source".to_string(),
            });
        };
        if let Some(requested) = new_scope {
            if requested < current {
                return Err(SegmentMapError::ScopeRegression { current, requested });
            }
        }

        let existing = self.entries.len();
        for (offset, segment) in segments.iter().enumerate() {
            if segment.source_start < current {
                return Err(SegmentMapError::MalformedSegmentMap {
                    index: existing + offset,
                    reason: format!(
                        "appended segment starts at {:?}, inside the analysed scope {:?}",
                        segment.source_start, current
                    ),
                });
            }
        }

        let all = self
            .entries
            .iter()
            .map(|e| e.segment)
            .chain(segments)
            .collect();
        Self::build(all, new_scope)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.entries.iter().map(|e| &e.segment)
    }

    pub fn scope(&self) -> Option<Duration> {
        self.scope
    }

    /// Returns true if analysis has covered `source_ts`.
    pub fn covers(&self, source_ts: Duration) -> bool {
        self.scope.map_or(true, |scope| source_ts < scope)
    }

    /// Index of the last entry starting at or before `source_ts`.
    fn entry_index_at(&self, source_ts: Duration) -> Option<usize> {
        let idx = self
            .entries
            .partition_point(|e| e.segment.source_start <= source_ts);
        idx.checked_sub(1)
    }

    /// The segment containing `source_ts`, if any.
    pub fn segment_at(&self, source_ts: Duration) -> Option<&Segment> {
        self.entry_index_at(source_ts)
            .map(|i| &self.entries[i].segment)
            .filter(|s| s.contains(source_ts))
    }

    /// The skip segment containing `source_ts`, if any.
    pub fn skip_at(&self, source_ts: Duration) -> Option<&Segment> {
        self.segment_at(source_ts).filter(|s| s.is_skip())
    }

    /// Maps a source position onto the logical timeline.
    ///
    /// Non-decreasing in `source_ts`; constant across a skip.
    pub fn source_to_logical(&self, source_ts: Duration) -> Duration {
        let Some(i) = self.entry_index_at(source_ts) else {
            return source_ts;
        };
        let entry = &self.entries[i];
        if source_ts < entry.segment.source_end {
            entry.logical_start
                + entry
                    .segment
                    .kind
                    .logical_len(source_ts - entry.segment.source_start)
        } else {
            entry.logical_end + (source_ts - entry.segment.source_end)
        }
    }

    /// Maps a logical position back onto the source timeline.
    ///
    /// A logical instant at the edge of a skip resolves to the skip's end.
    pub fn logical_to_source(&self, logical_ts: Duration) -> Duration {
        let idx = self.entries.partition_point(|e| e.logical_start <= logical_ts);
        let Some(i) = idx.checked_sub(1) else {
            return logical_ts;
        };
        let entry = &self.entries[i];
        match entry.segment.kind {
            SegmentKind::Speed(factor) if logical_ts < entry.logical_end => {
                entry.segment.source_start + (logical_ts - entry.logical_start).mul_f64(factor)
            }
            _ => entry.segment.source_end + (logical_ts - entry.logical_end),
        }
    }

    /// Playback speed multiplier at `source_ts`.
    ///
    /// Never zero: skip regions are jumped rather than played, so asking
    /// inside one yields the neutral rate.
    pub fn rate_at(&self, source_ts: Duration) -> f64 {
        match self.segment_at(source_ts).map(|s| s.kind) {
            Some(SegmentKind::Speed(factor)) => factor,
            Some(SegmentKind::Skip) | None => 1.0,
        }
    }

    /// First segment boundary strictly after `source_ts`.
    pub fn next_boundary_after(&self, source_ts: Duration) -> Option<Duration> {
        let start = self.entry_index_at(source_ts).unwrap_or(0);
        self.entries[start..]
            .iter()
            .flat_map(|e| [e.segment.source_start, e.segment.source_end])
            .find(|&b| b > source_ts)
    }

    /// Logical length of a source of the given duration.
    pub fn logical_duration(&self, source_duration: Duration) -> Duration {
        self.source_to_logical(source_duration)
    }

    /// Splits `[start, end)` into pieces of uniform kind, gaps included.
    pub fn pieces(&self, start: Duration, end: Duration) -> Vec<MapPiece> {
        let mut pieces = Vec::new();
        if end <= start {
            return pieces;
        }

        let first = self.entry_index_at(start).unwrap_or(0);
        let mut cursor = start;
        for entry in &self.entries[first..] {
            let seg = &entry.segment;
            if seg.source_end <= cursor {
                continue;
            }
            if seg.source_start >= end {
                break;
            }
            if seg.source_start > cursor {
                pieces.push(MapPiece {
                    source_start: cursor,
                    source_end: seg.source_start,
                    kind: SegmentKind::Speed(1.0),
                });
                cursor = seg.source_start;
            }
            let piece_end = seg.source_end.min(end);
            pieces.push(MapPiece {
                source_start: cursor,
                source_end: piece_end,
                kind: seg.kind,
            });
            cursor = piece_end;
        }
        if cursor < end {
            pieces.push(MapPiece {
                source_start: cursor,
                source_end: end,
                kind: SegmentKind::Speed(1.0),
            });
        }
        pieces
    }
}

/// Serializes durations as fractional seconds, the unit analysis tools emit.
#[cfg(feature = "serde")]
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff < Duration::from_micros(10),
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_empty_map_is_identity() {
        let map = SegmentMap::empty();
        assert_eq!(map.source_to_logical(secs(12.5)), secs(12.5));
        assert_eq!(map.logical_to_source(secs(12.5)), secs(12.5));
        assert_eq!(map.rate_at(secs(3.0)), 1.0);
    }

    #[test]
    fn test_skip_correctness() {
        let map = SegmentMap::new(vec![Segment::skip(secs(10.0), secs(20.0))]).unwrap();

        assert_eq!(
            map.source_to_logical(secs(25.0)),
            map.source_to_logical(secs(20.0)) + secs(5.0)
        );
        assert_eq!(
            map.source_to_logical(secs(15.0)),
            map.source_to_logical(secs(10.0))
        );
        assert_eq!(map.source_to_logical(secs(25.0)), secs(15.0));
    }

    #[test]
    fn test_speed_correctness() {
        let map = SegmentMap::new(vec![Segment::speed(secs(0.0), secs(10.0), 2.0)]).unwrap();
        assert_close(map.source_to_logical(secs(10.0)), secs(5.0));
        assert_close(map.source_to_logical(secs(4.0)), secs(2.0));
        assert_close(map.logical_to_source(secs(2.0)), secs(4.0));
        assert_eq!(map.rate_at(secs(1.0)), 2.0);
        assert_eq!(map.rate_at(secs(11.0)), 1.0);
    }

    #[test]
    fn test_logical_inside_skip_resolves_to_skip_end() {
        let map = SegmentMap::new(vec![
            Segment::skip(secs(10.0), secs(20.0)),
            Segment::speed(secs(20.0), secs(30.0), 2.0),
        ])
        .unwrap();

        assert_close(map.logical_to_source(secs(10.0)), secs(20.0));
        assert_close(map.logical_to_source(secs(12.0)), secs(24.0));
        assert_close(map.logical_to_source(secs(16.0)), secs(31.0));
        assert_close(map.source_to_logical(secs(31.0)), secs(16.0));
    }

    #[test]
    fn test_zero_length_segment_rejected() {
        let err = SegmentMap::new(vec![Segment::skip(secs(5.0), secs(5.0))]).unwrap_err();
        assert!(matches!(err, SegmentMapError::InvalidSegment { index: 0, .. }));

        let err = SegmentMap::new(vec![Segment::speed(secs(0.0), secs(1.0), 0.0)]).unwrap_err();
        assert!(matches!(err, SegmentMapError::InvalidSegment { .. }));
    }

    #[test]
    fn test_out_of_range_speed_rejected() {
        for factor in [1e-20, 0.001, 1e3, 1e300, f64::NAN, f64::INFINITY, -2.0] {
            let result = SegmentMap::new(vec![Segment::speed(secs(0.0), secs(10.0), factor)]);
            assert!(
                matches!(result, Err(SegmentMapError::InvalidSegment { index: 0, .. })),
                "factor {factor} accepted"
            );
        }
        assert!(SegmentMap::new(vec![Segment::speed(secs(0.0), secs(10.0), MIN_SPEED_FACTOR)]).is_ok());
        assert!(SegmentMap::new(vec![Segment::speed(secs(0.0), secs(10.0), MAX_SPEED_FACTOR)]).is_ok());
    }

    #[test]
    fn test_overflowing_logical_length_rejected() {
        let huge = Duration::from_secs(u64::MAX / 2);
        let result = SegmentMap::new(vec![Segment::speed(huge, Duration::MAX, MIN_SPEED_FACTOR)]);
        assert!(matches!(result, Err(SegmentMapError::InvalidSegment { .. })));
    }

    #[test]
    fn test_overlap_and_order_rejected() {
        let err = SegmentMap::new(vec![
            Segment::skip(secs(0.0), secs(10.0)),
            Segment::speed(secs(5.0), secs(15.0), 1.5),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            SegmentMapError::MalformedSegmentMap { index: 1, .. }
        ));

        let err = SegmentMap::new(vec![
            Segment::skip(secs(10.0), secs(20.0)),
            Segment::skip(secs(0.0), secs(5.0)),
        ])
        .unwrap_err();
        assert!(matches!(err, SegmentMapError::MalformedSegmentMap { .. }));
    }

    #[test]
    fn test_touching_segments_merge() {
        let map = SegmentMap::new(vec![
            Segment::skip(secs(0.0), secs(5.0)),
            Segment::skip(secs(5.0), secs(8.0)),
            Segment::speed(secs(8.0), secs(9.0), 2.0),
        ])
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.segment_at(secs(6.0)).unwrap().source_end, secs(8.0));
    }

    #[test]
    fn test_pieces_include_gaps() {
        let map = SegmentMap::new(vec![
            Segment::skip(secs(2.0), secs(3.0)),
            Segment::speed(secs(4.0), secs(6.0), 1.5),
        ])
        .unwrap();

        let pieces = map.pieces(secs(1.0), secs(5.0));
        let kinds: Vec<_> = pieces.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Speed(1.0),
                SegmentKind::Skip,
                SegmentKind::Speed(1.0),
                SegmentKind::Speed(1.5),
            ]
        );
        assert_eq!(pieces.first().unwrap().source_start, secs(1.0));
        assert_eq!(pieces.last().unwrap().source_end, secs(5.0));
    }

    #[test]
    fn test_next_boundary_after() {
        let map = SegmentMap::new(vec![Segment::speed(secs(2.0), secs(3.0), 1.5)]).unwrap();
        assert_eq!(map.next_boundary_after(secs(0.0)), Some(secs(2.0)));
        assert_eq!(map.next_boundary_after(secs(2.0)), Some(secs(3.0)));
        assert_eq!(map.next_boundary_after(secs(3.0)), None);
    }

    #[test]
    fn test_extend_partial_map() {
        let map = SegmentMap::with_scope(vec![Segment::skip(secs(1.0), secs(2.0))], secs(5.0))
            .unwrap();
        assert!(map.covers(secs(4.0)));
        assert!(!map.covers(secs(6.0)));

        let extended = map
            .extended(vec![Segment::skip(secs(6.0), secs(7.0))], Some(secs(10.0)))
            .unwrap();
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.scope(), Some(secs(10.0)));

        let err = map
            .extended(vec![Segment::skip(secs(4.0), secs(7.0))], Some(secs(10.0)))
            .unwrap_err();
        assert!(matches!(err, SegmentMapError::MalformedSegmentMap { .. }));

        let err = map.extended(vec![], Some(secs(3.0))).unwrap_err();
        assert!(matches!(err, SegmentMapError::ScopeRegression { .. }));

        let complete = extended.extended(vec![], None).unwrap();
        assert_eq!(complete.scope(), None);
        assert!(complete.extended(vec![], None).is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_segments_from_json() {
        let json = r#"[
            {"start": 20.0, "end": 30.0, "kind": "skip"},
            {"start": 40.0, "end": 50.0, "kind": {"speed": 1.5}}
        ]"#;
        let segments: Vec<Segment> = serde_json::from_str(json).unwrap();
        let map = SegmentMap::new(segments).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.rate_at(secs(45.0)), 1.5);
    }
}
