//! Fixed-capacity port bit-sets.
//!
//! [`PortVector`] is the value type every "which ports" question in the
//! engine is answered with. [`AtomicPortVector`] is the shared, in-place
//! mutable flavour embedded in published records: single bits are flipped
//! by the control plane while the data plane keeps reading, and a reader
//! takes a [`PortVector`] copy with [`AtomicPortVector::load`] before doing
//! any set arithmetic.
//!
//! Every operation is defined over exactly [`MAX_PORTS`] bits. Passing an
//! index outside `[0, MAX_PORTS)` is a programming error and panics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of ports a bridge can hold, including the local port 0.
pub const MAX_PORTS: usize = 256;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_PORTS / WORD_BITS;

/// Small integer naming a port slot. Index 0 is the bridge itself.
pub type PortIndex = usize;

#[inline]
fn locate(index: PortIndex) -> (usize, u64) {
    assert!(
        index < MAX_PORTS,
        "port index {index} out of range (MAX_PORTS = {MAX_PORTS})"
    );
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}

/// An ordered set of port indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<PortIndex>", into = "Vec<PortIndex>")]
pub struct PortVector([u64; WORDS]);

impl PortVector {
    /// The empty set.
    pub const fn zero() -> Self {
        Self([0; WORDS])
    }

    /// Every index in `[0, MAX_PORTS)`.
    pub const fn full() -> Self {
        Self([u64::MAX; WORDS])
    }

    /// A set holding exactly `index`.
    pub fn single(index: PortIndex) -> Self {
        let mut v = Self::zero();
        v.set(index);
        v
    }

    pub fn set(&mut self, index: PortIndex) {
        let (word, mask) = locate(index);
        self.0[word] |= mask;
    }

    pub fn clear(&mut self, index: PortIndex) {
        let (word, mask) = locate(index);
        self.0[word] &= !mask;
    }

    pub fn test(&self, index: PortIndex) -> bool {
        let (word, mask) = locate(index);
        self.0[word] & mask != 0
    }

    /// Sets every bit.
    pub fn fill(&mut self) {
        self.0 = [u64::MAX; WORDS];
    }

    /// Clears every bit.
    pub fn zero_all(&mut self) {
        self.0 = [0; WORDS];
    }

    pub fn and(&self, other: &PortVector) -> PortVector {
        let mut out = *self;
        out &= *other;
        out
    }

    pub fn or(&self, other: &PortVector) -> PortVector {
        let mut out = *self;
        out |= *other;
        out
    }

    /// `self AND NOT other`.
    pub fn and_not(&self, other: &PortVector) -> PortVector {
        let mut out = *self;
        for (w, o) in out.0.iter_mut().zip(other.0.iter()) {
            *w &= !o;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if every bit of `self` is also set in `other`.
    pub fn is_subset(&self, other: &PortVector) -> bool {
        self.and_not(other).is_empty()
    }

    /// Lowest set index, or [`MAX_PORTS`] when the set is empty.
    pub fn first_set(&self) -> PortIndex {
        self.next_set(0)
    }

    /// Lowest clear index, if any.
    pub fn first_zero(&self) -> Option<PortIndex> {
        self.0.iter().enumerate().find_map(|(i, w)| {
            (*w != u64::MAX).then(|| i * WORD_BITS + w.trailing_ones() as usize)
        })
    }

    /// Lowest set index `>= from`, or [`MAX_PORTS`].
    fn next_set(&self, from: PortIndex) -> PortIndex {
        if from >= MAX_PORTS {
            return MAX_PORTS;
        }
        let mut word = from / WORD_BITS;
        let mut bits = self.0[word] & (u64::MAX << (from % WORD_BITS));
        loop {
            if bits != 0 {
                return word * WORD_BITS + bits.trailing_zeros() as usize;
            }
            word += 1;
            if word == WORDS {
                return MAX_PORTS;
            }
            bits = self.0[word];
        }
    }

    /// Ascending iteration over set indices.
    pub fn iter(&self) -> Iter<'_> {
        Iter { vec: self, next: 0 }
    }
}

/// Iterator over the set bits of a [`PortVector`], lowest first.
pub struct Iter<'a> {
    vec: &'a PortVector,
    next: PortIndex,
}

impl Iterator for Iter<'_> {
    type Item = PortIndex;

    fn next(&mut self) -> Option<PortIndex> {
        let found = self.vec.next_set(self.next);
        if found == MAX_PORTS {
            self.next = MAX_PORTS;
            return None;
        }
        self.next = found + 1;
        Some(found)
    }
}

impl<'a> IntoIterator for &'a PortVector {
    type Item = PortIndex;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<PortIndex> for PortVector {
    fn from_iter<I: IntoIterator<Item = PortIndex>>(iter: I) -> Self {
        let mut v = PortVector::zero();
        for index in iter {
            v.set(index);
        }
        v
    }
}

impl BitAndAssign for PortVector {
    fn bitand_assign(&mut self, rhs: PortVector) {
        for (w, o) in self.0.iter_mut().zip(rhs.0.iter()) {
            *w &= o;
        }
    }
}

impl BitOrAssign for PortVector {
    fn bitor_assign(&mut self, rhs: PortVector) {
        for (w, o) in self.0.iter_mut().zip(rhs.0.iter()) {
            *w |= o;
        }
    }
}

impl BitAnd for PortVector {
    type Output = PortVector;

    fn bitand(mut self, rhs: PortVector) -> PortVector {
        self &= rhs;
        self
    }
}

impl BitOr for PortVector {
    type Output = PortVector;

    fn bitor(mut self, rhs: PortVector) -> PortVector {
        self |= rhs;
        self
    }
}

impl Not for PortVector {
    type Output = PortVector;

    fn not(mut self) -> PortVector {
        for w in self.0.iter_mut() {
            *w = !*w;
        }
        self
    }
}

impl fmt::Debug for PortVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl TryFrom<Vec<PortIndex>> for PortVector {
    type Error = String;

    fn try_from(ports: Vec<PortIndex>) -> Result<Self, Self::Error> {
        if let Some(bad) = ports.iter().find(|p| **p >= MAX_PORTS) {
            return Err(format!("port index {bad} out of range"));
        }
        Ok(ports.into_iter().collect())
    }
}

impl From<PortVector> for Vec<PortIndex> {
    fn from(v: PortVector) -> Self {
        v.iter().collect()
    }
}

/// A [`PortVector`] whose bits can be flipped through a shared reference.
///
/// Single-bit updates are individually atomic. A multi-word [`load`] is not a
/// snapshot across words; callers only rely on per-bit freshness.
///
/// [`load`]: AtomicPortVector::load
#[derive(Default)]
pub struct AtomicPortVector([AtomicU64; WORDS]);

impl AtomicPortVector {
    pub fn new(init: PortVector) -> Self {
        Self(init.0.map(AtomicU64::new))
    }

    pub fn load(&self) -> PortVector {
        let mut out = [0u64; WORDS];
        for (o, w) in out.iter_mut().zip(self.0.iter()) {
            *o = w.load(Ordering::Acquire);
        }
        PortVector(out)
    }

    pub fn store(&self, v: &PortVector) {
        for (w, n) in self.0.iter().zip(v.0.iter()) {
            w.store(*n, Ordering::Release);
        }
    }

    pub fn set(&self, index: PortIndex) {
        let (word, mask) = locate(index);
        self.0[word].fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear(&self, index: PortIndex) {
        let (word, mask) = locate(index);
        self.0[word].fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn test(&self, index: PortIndex) -> bool {
        let (word, mask) = locate(index);
        self.0[word].load(Ordering::Acquire) & mask != 0
    }

    /// Replaces the contents with exactly `index`, clearing the old bits
    /// before the new one becomes visible.
    pub fn store_single(&self, index: PortIndex) {
        let (target, mask) = locate(index);
        for (i, w) in self.0.iter().enumerate() {
            if i == target {
                w.fetch_and(mask, Ordering::AcqRel);
            } else {
                w.store(0, Ordering::Release);
            }
        }
        self.0[target].fetch_or(mask, Ordering::AcqRel);
    }
}

impl fmt::Debug for AtomicPortVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> PortVector {
        [0, 3, 63, 64, 200, 255].into_iter().collect()
    }

    #[test]
    fn test_and_idempotent() {
        let a = sample();
        assert_eq!(a & a, a);
        assert_eq!(a.and(&a), a);
    }

    #[test]
    fn test_or_zero_identity() {
        let a = sample();
        assert_eq!(a | PortVector::zero(), a);
        assert_eq!(a.or(&PortVector::zero()), a);
    }

    #[test]
    fn test_set_then_test_every_index() {
        for i in 0..MAX_PORTS {
            let mut a = sample();
            a.set(i);
            assert!(a.test(i));
            a.clear(i);
            assert!(!a.test(i));
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_set_panics() {
        PortVector::zero().set(MAX_PORTS);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_test_panics() {
        PortVector::full().test(MAX_PORTS + 7);
    }

    #[test]
    fn test_first_set_sentinel() {
        assert_eq!(PortVector::zero().first_set(), MAX_PORTS);
        assert_eq!(PortVector::single(130).first_set(), 130);
        assert_eq!(sample().first_set(), 0);
    }

    #[test]
    fn test_first_zero() {
        let mut v = PortVector::zero();
        assert_eq!(v.first_zero(), Some(0));
        for i in 0..70 {
            v.set(i);
        }
        assert_eq!(v.first_zero(), Some(70));
        assert_eq!(PortVector::full().first_zero(), None);
    }

    #[test]
    fn test_iteration_ascending() {
        let ports: Vec<_> = sample().iter().collect();
        assert_eq!(ports, vec![0, 3, 63, 64, 200, 255]);
        assert_eq!(PortVector::full().iter().count(), MAX_PORTS);
        assert_eq!(PortVector::zero().iter().next(), None);
    }

    #[test]
    fn test_and_not_and_subset() {
        let a = sample();
        let b: PortVector = [3, 64].into_iter().collect();
        let diff = a.and_not(&b);
        assert!(!diff.test(3));
        assert!(!diff.test(64));
        assert_eq!(diff.count(), 4);
        assert!(b.is_subset(&a));
        assert!(!a.is_subset(&b));
        assert_eq!(!PortVector::zero(), PortVector::full());
    }

    #[test]
    fn test_fill_and_zero_all() {
        let mut v = PortVector::zero();
        v.fill();
        assert_eq!(v.count(), MAX_PORTS);
        v.zero_all();
        assert!(v.is_empty());
    }

    #[test]
    fn test_atomic_store_single() {
        let v = AtomicPortVector::new(sample());
        v.store_single(64);
        assert_eq!(v.load(), PortVector::single(64));
        v.store_single(1);
        assert_eq!(v.load(), PortVector::single(1));
    }

    #[test]
    fn test_atomic_set_clear() {
        let v = AtomicPortVector::default();
        v.set(5);
        v.set(250);
        assert!(v.test(5));
        v.clear(5);
        assert!(!v.test(5));
        assert_eq!(v.load(), PortVector::single(250));
    }

    #[test]
    fn test_serde_as_index_list() {
        let v: PortVector = [1, 2, 9].into_iter().collect();
        let as_list: Vec<PortIndex> = v.into();
        assert_eq!(as_list, vec![1, 2, 9]);
        assert!(PortVector::try_from(vec![1, MAX_PORTS]).is_err());
    }
}
