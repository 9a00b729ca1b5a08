use std::fmt;

/// A half-open interval `[start, end)` of 64-bit addresses.
///
/// Shifting with [`Range::add`] and [`Range::subtract`] wraps, matching the
/// unsigned address arithmetic used when relating ELF virtual addresses to
/// mapped memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    start: u64,
    end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "invalid range [{start:#x}, {end:#x})");
        Range { start, end }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `addr` lies inside the interval. An empty range contains
    /// nothing, not even its start point.
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn contains_range(&self, other: Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the ranges overlap: one contains the other's start point.
    /// Equivalent to `intersect` returning something. A zero-size range
    /// overlaps a range that contains its point (`[2, 6)` overlaps
    /// `[2, 2)`) but never overlaps anything when the point is outside,
    /// and touching non-empty ranges do not overlap.
    pub fn overlaps(&self, other: Range) -> bool {
        self.contains(other.start) || other.contains(self.start)
    }

    /// The common subrange, or `None` when the ranges do not overlap.
    ///
    /// `[2, 6) ∩ [2, 2)` is `[2, 2)`, but `[2, 6) ∩ [0, 2)` and
    /// `[2, 6) ∩ [6, 6)` are `None`.
    pub fn intersect(&self, other: Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Range::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }

    pub fn add(&self, v: u64) -> Range {
        Range {
            start: self.start.wrapping_add(v),
            end: self.end.wrapping_add(v),
        }
    }

    pub fn subtract(&self, v: u64) -> Range {
        Range {
            start: self.start.wrapping_sub(v),
            end: self.end.wrapping_sub(v),
        }
    }

    /// Clip away everything below `v`. Collapses to `[v, v)` when `v` is
    /// beyond the end.
    pub fn truncate_below(&self, v: u64) -> Range {
        Range {
            start: self.start.max(v),
            end: self.end.max(v),
        }
    }

    /// Clip away everything at or above `v`.
    pub fn truncate_above(&self, v: u64) -> Range {
        Range {
            start: self.start.min(v),
            end: self.end.min(v),
        }
    }

    /// The union of two ranges, when they overlap or touch.
    pub fn merge(&self, other: Range) -> Option<Range> {
        if self.start.max(other.start) <= self.end.min(other.end) {
            Some(Range::new(
                self.start.min(other.start),
                self.end.max(other.end),
            ))
        } else {
            None
        }
    }

    /// Merge a list of ranges in any order into a sorted list in which no
    /// two entries overlap or touch. Idempotent.
    pub fn merge_list(ranges: &[Range]) -> Vec<Range> {
        let mut sorted = ranges.to_vec();
        sorted.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(sorted.len());
        for r in sorted {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        merged
    }

    /// The gaps of `ranges` within `self`: every address of `self` is in
    /// exactly one of `invert_list` and the merged, clipped input.
    pub fn invert_list(&self, ranges: &[Range]) -> Vec<Range> {
        let mut result = Vec::new();
        let mut cursor = self.start;
        for r in Range::merge_list(ranges) {
            let Some(clipped) = r.intersect(*self) else {
                continue;
            };
            if clipped.start > cursor {
                result.push(Range::new(cursor, clipped.start));
            }
            cursor = cursor.max(clipped.end);
        }
        if cursor < self.end {
            result.push(Range::new(cursor, self.end));
        }
        result
    }

    /// True iff any two distinct entries overlap.
    pub fn any_overlap(ranges: &[Range]) -> bool {
        let mut sorted = ranges.to_vec();
        sorted.sort();
        sorted.windows(2).any(|w| w[0].overlaps(w[1]))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}
