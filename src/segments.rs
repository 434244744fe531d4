//! # Received Segment Tracking
//!
//! The destination handler records every file data segment it receives in a
//! [ReceivedSegments] store. The store keeps the received byte ranges sorted by start offset,
//! merges overlapping or adjacent ranges and derives the missing ranges which are requested
//! with NAK PDUs.
use smallvec::SmallVec;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum SegmentError {
    #[error("segment is empty")]
    EmptySegment,
    #[error("segment start {0} is larger than segment end {1}")]
    StartLargerThanEnd(u64, u64),
}

/// Missing segments are usually few, so they are kept inline.
pub type MissingSegments = SmallVec<[(u64, u64); 8]>;

/// Ordered set of half-open byte ranges `[start, end)` which were received.
///
/// The ranges are ascending, non-overlapping and never adjacent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceivedSegments {
    list: Vec<(u64, u64)>,
}

impl ReceivedSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.list.iter().copied()
    }

    #[inline]
    pub fn number_of_segments(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn reset(&mut self) {
        self.list.clear();
    }

    /// End offset of the highest received range, or 0 if nothing was received yet.
    pub fn highest_offset(&self) -> u64 {
        self.list.last().map(|&(_, end)| end).unwrap_or(0)
    }

    /// Total amount of received bytes.
    pub fn bytes_received(&self) -> u64 {
        self.list.iter().map(|&(start, end)| end - start).sum()
    }

    /// Checks whether the segment is fully covered by the received ranges.
    pub fn contains(&self, segment: (u64, u64)) -> bool {
        self.list
            .iter()
            .any(|&(start, end)| start <= segment.0 && segment.1 <= end)
    }

    /// Add a received range and merge it with overlapping or adjacent ranges.
    ///
    /// Returns whether any previously missing byte was added.
    pub fn add(&mut self, start: u64, end: u64) -> Result<bool, SegmentError> {
        if start == end {
            return Err(SegmentError::EmptySegment);
        }
        if start > end {
            return Err(SegmentError::StartLargerThanEnd(start, end));
        }
        if self.contains((start, end)) {
            return Ok(false);
        }
        let insert_idx = self.list.partition_point(|&(s, _)| s < start);
        self.list.insert(insert_idx, (start, end));
        self.coalesce();
        Ok(true)
    }

    // In-place merge of overlapping or adjacent ranges. The list is sorted by start offset.
    fn coalesce(&mut self) {
        if self.list.len() <= 1 {
            return;
        }
        let mut w = 0usize;
        for i in 1..self.list.len() {
            let (s, e) = self.list[i];
            if s <= self.list[w].1 {
                self.list[w].1 = self.list[w].1.max(e);
            } else {
                w += 1;
                self.list[w] = (s, e);
            }
        }
        self.list.truncate(w + 1);
    }

    /// Missing ranges in the scope `[0, end_of_scope)`, ascending by start offset.
    pub fn missing_segments(&self, end_of_scope: u64) -> MissingSegments {
        let mut missing = MissingSegments::new();
        let mut cursor = 0;
        for &(start, end) in &self.list {
            if start >= end_of_scope {
                break;
            }
            if start > cursor {
                missing.push((cursor, start));
            }
            cursor = end;
        }
        if cursor < end_of_scope {
            missing.push((cursor, end_of_scope));
        }
        missing
    }

    /// The file is complete if all bytes in `[0, file_size)` were received.
    pub fn is_complete(&self, file_size: u64) -> bool {
        if file_size == 0 {
            return true;
        }
        matches!(self.list.first(), Some(&(0, end)) if end >= file_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let segments = ReceivedSegments::new();
        assert!(segments.is_empty());
        assert_eq!(segments.highest_offset(), 0);
        assert!(segments.is_complete(0));
        assert!(!segments.is_complete(1));
        assert_eq!(segments.missing_segments(10).as_slice(), &[(0, 10)]);
    }

    #[test]
    fn test_invalid_segments() {
        let mut segments = ReceivedSegments::new();
        assert_eq!(segments.add(5, 5), Err(SegmentError::EmptySegment));
        assert_eq!(
            segments.add(10, 5),
            Err(SegmentError::StartLargerThanEnd(10, 5))
        );
        assert!(segments.is_empty());
    }

    #[test]
    fn test_in_order_reception_merges() {
        let mut segments = ReceivedSegments::new();
        for i in 0..4 {
            assert!(segments.add(i * 10, (i + 1) * 10).unwrap());
        }
        assert_eq!(segments.number_of_segments(), 1);
        assert_eq!(segments.iter().next(), Some((0, 40)));
        assert!(segments.is_complete(40));
        assert!(segments.missing_segments(40).is_empty());
    }

    #[test]
    fn test_gap_detection() {
        let mut segments = ReceivedSegments::new();
        segments.add(0, 10).unwrap();
        segments.add(20, 30).unwrap();
        segments.add(40, 50).unwrap();
        assert_eq!(segments.number_of_segments(), 3);
        assert_eq!(segments.bytes_received(), 30);
        assert_eq!(segments.highest_offset(), 50);
        assert_eq!(
            segments.missing_segments(60).as_slice(),
            &[(10, 20), (30, 40), (50, 60)]
        );
        assert_eq!(segments.missing_segments(25).as_slice(), &[(10, 20)]);
        assert!(!segments.is_complete(50));
    }

    #[test]
    fn test_out_of_order_fill() {
        let mut segments = ReceivedSegments::new();
        segments.add(20, 30).unwrap();
        segments.add(0, 10).unwrap();
        segments.add(10, 20).unwrap();
        assert_eq!(segments.number_of_segments(), 1);
        assert!(segments.is_complete(30));
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let mut segments = ReceivedSegments::new();
        segments.add(0, 10).unwrap();
        assert!(!segments.add(2, 8).unwrap());
        assert!(segments.add(5, 15).unwrap());
        assert_eq!(segments.iter().collect::<Vec<_>>(), vec![(0, 15)]);
        segments.add(30, 40).unwrap();
        segments.add(12, 35).unwrap();
        assert_eq!(segments.iter().collect::<Vec<_>>(), vec![(0, 40)]);
        assert!(segments.contains((20, 30)));
        segments.reset();
        assert!(segments.is_empty());
    }
}
