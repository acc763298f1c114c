// vim: tw=80
//! Byte extents and sorted extent lists

use std::{
    cmp,
    fmt::{self, Display, Formatter},
    iter,
    slice,
};

use crate::util::{round_down, round_up};

/// A half-open byte range `[start, end)`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Extent {
    pub start: u64,
    pub end: u64
}

impl Extent {
    /// Construct an extent from an offset and length.
    ///
    /// Returns `None` if the end would overflow.
    pub fn new(start: u64, len: u64) -> Option<Self> {
        start.checked_add(len).map(|end| Extent{start, end})
    }

    /// Does this extent entirely contain `other`?
    pub fn covers(&self, other: &Extent) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let start = cmp::max(self.start, other.start);
        let end = cmp::min(self.end, other.end);
        (start < end).then_some(Extent{start, end})
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Grow the extent outward to the nearest multiples of `align`.
    pub fn round_out(&self, align: u64) -> Extent {
        Extent {
            start: round_down(self.start, align),
            end: round_up(self.end, align)
        }
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// A sorted list of non-overlapping, non-adjacent extents.
///
/// Inserting an extent merges it with every extent it overlaps or abuts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtentList(Vec<Extent>);

impl ExtentList {
    pub fn new() -> Self {
        ExtentList(Vec::new())
    }

    /// Return the portion of this list that lies within `bound`.
    pub fn clip(&self, bound: &Extent) -> ExtentList {
        ExtentList(self.0.iter()
            .filter_map(|e| e.intersect(bound))
            .collect())
    }

    /// Is `ext` entirely covered by this list?
    pub fn covers(&self, ext: &Extent) -> bool {
        let i = self.0.partition_point(|e| e.end <= ext.start);
        self.0.get(i).map(|e| e.covers(ext)).unwrap_or(false)
    }

    pub fn insert(&mut self, ext: Extent) {
        if ext.is_empty() {
            return;
        }
        let mut merged = ext;
        let lo = self.0.partition_point(|e| e.end < merged.start);
        let mut hi = lo;
        while hi < self.0.len() && self.0[hi].start <= merged.end {
            merged.start = cmp::min(merged.start, self.0[hi].start);
            merged.end = cmp::max(merged.end, self.0[hi].end);
            hi += 1;
        }
        self.0.splice(lo..hi, iter::once(merged));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Extent> {
        self.0.iter()
    }

    /// Number of disjoint extents
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The smallest single extent that covers the whole list
    pub fn span(&self) -> Option<Extent> {
        match (self.0.first(), self.0.last()) {
            (Some(first), Some(last)) => Some(Extent {
                start: first.start,
                end: last.end
            }),
            _ => None
        }
    }

    /// Total number of bytes covered
    pub fn total(&self) -> u64 {
        self.0.iter().map(Extent::len).sum()
    }
}

impl FromIterator<Extent> for ExtentList {
    fn from_iter<I: IntoIterator<Item=Extent>>(iter: I) -> Self {
        let mut el = ExtentList::new();
        for ext in iter {
            el.insert(ext);
        }
        el
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// LCOV_EXCL_STOP
