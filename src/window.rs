use serde::{Deserialize, Serialize};
use std::fmt;

/// Trip identifier; the partition and windowing key of the engine.
pub type TripId = i64;

/// A closed-open key range: [start, end).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: TripId,
    pub end: TripId,
}

impl KeyRange {
    #[inline]
    pub fn new(start: TripId, end: TripId) -> Self {
        debug_assert!(end >= start);
        Self { start, end }
    }

    /// Smallest range covering every key in `keys`, or `None` when empty.
    pub fn covering(keys: impl IntoIterator<Item = TripId>) -> Option<Self> {
        let mut it = keys.into_iter();
        let first = it.next()?;
        let (lo, hi) = it.fold((first, first), |(lo, hi), k| (lo.min(k), hi.max(k)));
        Some(Self::new(lo, hi.saturating_add(1)))
    }

    #[inline]
    pub fn contains(&self, key: TripId) -> bool {
        key >= self.start && key < self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn len(&self) -> u64 {
        if self.is_empty() { 0 } else { self.end.abs_diff(self.start) }
    }

    /// The aligned window [k*size, (k+1)*size) that contains `key`.
    /// `size` > 0.
    #[inline]
    pub fn aligned(key: TripId, size: i64) -> Self {
        debug_assert!(size > 0);
        let start = div_floor(key, size) * size;
        Self::new(start, start.saturating_add(size))
    }

    /// Split this range into consecutive disjoint windows of `size` keys,
    /// aligned to multiples of `size`. The first and last windows are clipped
    /// to this range so their union is exactly `self`.
    pub fn windows(&self, size: i64) -> KeyWindows {
        KeyWindows {
            range: *self,
            size: size.max(1),
            next: self.start,
        }
    }

    /// The aligned windows of `size` keys that together cover this range.
    /// Unlike [`windows`](Self::windows) nothing is clipped, so a window's
    /// bounds depend only on `size` and never on where the range ends.
    pub fn aligned_windows(&self, size: i64) -> KeyWindows {
        let size = size.max(1);
        let range = if self.is_empty() {
            *self
        } else {
            let first = Self::aligned(self.start, size);
            let last = Self::aligned(self.end - 1, size);
            Self::new(first.start, last.end)
        };
        range.windows(size)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Iterator returned by [`KeyRange::windows`].
#[derive(Clone, Debug)]
pub struct KeyWindows {
    range: KeyRange,
    size: i64,
    next: TripId,
}

impl Iterator for KeyWindows {
    type Item = KeyRange;

    fn next(&mut self) -> Option<KeyRange> {
        if self.next >= self.range.end {
            return None;
        }
        let aligned = KeyRange::aligned(self.next, self.size);
        let w = KeyRange::new(self.next, aligned.end.min(self.range.end));
        self.next = w.end;
        Some(w)
    }
}

/// Floor division for i64 (unlike `/` which truncates toward zero).
#[inline]
fn div_floor(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if (r != 0) && ((r > 0) != (b > 0)) { q - 1 } else { q }
}
