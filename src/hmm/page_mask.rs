//! Per-page bitmaps over a single VA block.

use crate::utils::PAGES_PER_BLOCK;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

const WORDS: usize = PAGES_PER_BLOCK / 64;

/// Half-open range of page indices `[first, outer)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRegion {
    pub first: usize,
    pub outer: usize,
}

impl PageRegion {
    #[must_use]
    pub const fn new(first: usize, outer: usize) -> Self {
        Self { first, outer }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.outer - self.first
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first >= self.outer
    }

    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        self.first <= index && index < self.outer
    }

    /// Intersection, empty if disjoint.
    #[must_use]
    pub fn intersect(&self, other: Self) -> Self {
        let first = self.first.max(other.first);
        let outer = self.outer.min(other.outer).max(first);
        Self { first, outer }
    }
}

/// One bit per page of a block.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PageMask {
    bits: [u64; WORDS],
}

impl PageMask {
    #[must_use]
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    #[must_use]
    pub fn from_region(region: PageRegion) -> Self {
        let mut mask = Self::new();
        mask.fill_region(region);
        mask
    }

    pub fn set(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits[index / 64] &= !(1 << (index % 64));
    }

    #[must_use]
    pub const fn test(&self, index: usize) -> bool {
        index < PAGES_PER_BLOCK && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn fill_region(&mut self, region: PageRegion) {
        for index in region.first..region.outer.min(PAGES_PER_BLOCK) {
            self.set(index);
        }
    }

    pub fn clear_region(&mut self, region: PageRegion) {
        for index in region.first..region.outer.min(PAGES_PER_BLOCK) {
            self.clear(index);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Set page indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(word_index, &word)| {
            let mut word = word;
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                Some(word_index * 64 + bit)
            })
        })
    }

    /// Maximal runs of set pages.
    pub fn runs(&self) -> impl Iterator<Item = PageRegion> + '_ {
        let mut pages = self.iter().peekable();
        std::iter::from_fn(move || {
            let first = pages.next()?;
            let mut outer = first + 1;
            while pages.next_if_eq(&outer).is_some() {
                outer += 1;
            }
            Some(PageRegion::new(first, outer))
        })
    }

    #[must_use]
    pub fn andnot(&self, other: &Self) -> Self {
        let mut out = *self;
        for (w, o) in out.bits.iter_mut().zip(other.bits) {
            *w &= !o;
        }
        out
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.bits.iter().zip(other.bits).any(|(a, b)| a & b != 0)
    }

    /// Keep only pages inside `region`.
    #[must_use]
    pub fn restricted(&self, region: PageRegion) -> Self {
        *self & Self::from_region(region)
    }

    /// Page `n + i` becomes page `i`; pages below `n` are dropped.
    #[must_use]
    pub fn shift_down(&self, n: usize) -> Self {
        let mut out = Self::new();
        for index in self.iter().filter(|&i| i >= n) {
            out.set(index - n);
        }
        out
    }

    /// Clear every page at or above `outer`.
    pub fn truncate(&mut self, outer: usize) {
        self.clear_region(PageRegion::new(outer, PAGES_PER_BLOCK));
    }
}

impl BitOr for PageMask {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        self |= rhs;
        self
    }
}

impl BitOrAssign for PageMask {
    fn bitor_assign(&mut self, rhs: Self) {
        for (w, o) in self.bits.iter_mut().zip(rhs.bits) {
            *w |= o;
        }
    }
}

impl BitAnd for PageMask {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        self &= rhs;
        self
    }
}

impl BitAndAssign for PageMask {
    fn bitand_assign(&mut self, rhs: Self) {
        for (w, o) in self.bits.iter_mut().zip(rhs.bits) {
            *w &= o;
        }
    }
}

impl FromIterator<usize> for PageMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::new();
        for index in iter {
            mask.set(index);
        }
        mask
    }
}

impl fmt::Debug for PageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for run in self.runs() {
            if run.len() == 1 {
                list.entry(&run.first);
            } else {
                list.entry(&format_args!("{}..{}", run.first, run.outer));
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_and_debug() {
        let mask: PageMask = [1, 2, 3, 64, 65, 511].into_iter().collect();
        let runs: Vec<_> = mask.runs().collect();
        assert_eq!(
            runs,
            vec![
                PageRegion::new(1, 4),
                PageRegion::new(64, 66),
                PageRegion::new(511, 512)
            ]
        );
        assert_eq!(format!("{mask:?}"), "[1..4, 64..66, 511]");
        assert_eq!(mask.count(), 6);
    }

    #[test]
    fn set_operations() {
        let a = PageMask::from_region(PageRegion::new(0, 10));
        let b = PageMask::from_region(PageRegion::new(5, 15));
        assert_eq!((a & b).count(), 5);
        assert_eq!((a | b).count(), 15);
        assert_eq!(a.andnot(&b).iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(a.intersects(&b));
        assert_eq!(b.shift_down(10).iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let mut c = b;
        c.truncate(8);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![5, 6, 7]);
        assert!(!c.test(PAGES_PER_BLOCK));
    }
}
