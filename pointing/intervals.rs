// ========================================================================================
//                                 Observing intervals
// ========================================================================================

use std::ops::RangeInclusive;

/// An inclusive range of sample indices `[first, last]` belonging to a valid
/// observation. The layout is fixed so that interval tables can be handed to the
/// device as raw memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub first: i64,
    pub last: i64,
}

impl Interval {
    #[inline]
    pub const fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    /// Number of samples covered. An interval with `first > last` covers none, and a
    /// span wider than `usize` saturates at `usize::MAX`.
    #[inline]
    pub fn len(&self) -> usize {
        if self.last < self.first {
            return 0;
        }
        usize::try_from(self.last.abs_diff(self.first))
            .map_or(usize::MAX, |span| span.saturating_add(1))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    #[inline]
    pub fn contains(&self, sample: i64) -> bool {
        sample >= self.first && sample <= self.last
    }

    /// The sample indices of this interval, in order.
    #[inline]
    pub fn samples(&self) -> RangeInclusive<i64> {
        self.first..=self.last
    }
}

/// Builds the intervals of consecutive samples whose flags have no bit of `mask` set.
pub fn from_flags(flags: &[u8], mask: u8) -> Vec<Interval> {
    let mut intervals = Vec::new();
    let mut open: Option<i64> = None;

    for (isamp, &flag) in flags.iter().enumerate() {
        let good = flag & mask == 0;
        match (open, good) {
            (None, true) => open = Some(isamp as i64),
            (Some(first), false) => {
                intervals.push(Interval::new(first, isamp as i64 - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(first) = open {
        intervals.push(Interval::new(first, flags.len() as i64 - 1));
    }
    intervals
}

/// Total number of samples across all intervals, counting overlaps once per interval.
pub fn total_samples(intervals: &[Interval]) -> usize {
    intervals
        .iter()
        .fold(0usize, |total, view| total.saturating_add(view.len()))
}

/// Returns the first non-empty interval that reaches outside `[0, n_samp)`.
pub fn find_out_of_bounds(intervals: &[Interval], n_samp: usize) -> Option<(usize, Interval)> {
    intervals.iter().copied().enumerate().find(|(_, view)| {
        !view.is_empty() && (view.first < 0 || view.last >= n_samp as i64)
    })
}
