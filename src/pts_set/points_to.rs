// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;
use std::slice;

pub(crate) const SMALL_SET_CAPACITY: usize = 16;

pub trait PointsToSet<T> {
    type Iter<'a>: Iterator<Item = T>
    where
        Self: 'a;

    fn new() -> Self;
    fn clear(&mut self);
    fn count(&self) -> usize;
    fn contains(&self, elem: T) -> bool;
    fn is_empty(&self) -> bool;
    fn superset(&self, other: &Self) -> bool;
    fn insert(&mut self, elem: T) -> bool;
    fn remove(&mut self, elem: T) -> bool;
    fn union(&mut self, other: &Self) -> bool;
    fn subtract(&mut self, other: &Self) -> bool;
    fn iter<'a>(&'a self) -> Self::Iter<'a>;
}

/// Hybrid implementation of points to set,
/// which uses a sorted array for small sets, and a btree for large sets.
/// Both representations iterate in ascending order.
#[derive(Clone)]
pub struct HybridPointsToSet<T> {
    points_to: HybridSet<T>,
}

impl<T: Ord + Copy + fmt::Debug> fmt::Debug for HybridPointsToSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T: Ord + Copy> PartialEq for HybridPointsToSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.count() == other.count() && self.iter().eq(other.iter())
    }
}

impl<T: Ord + Copy> Eq for HybridPointsToSet<T> {}

impl<T: Ord + Copy> Default for HybridPointsToSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// IntoIterator
impl<'a, T: Ord + Copy> IntoIterator for &'a HybridPointsToSet<T> {
    type Item = T;
    type IntoIter = HybridIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Ord + Copy> FromIterator<T> for HybridPointsToSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = HybridPointsToSet::new();
        for elem in iter {
            set.insert(elem);
        }
        set
    }
}

impl<T: Ord + Copy> PointsToSet<T> for HybridPointsToSet<T> {
    fn new() -> Self {
        HybridPointsToSet {
            points_to: HybridSet::SmallSet(Vec::new()),
        }
    }

    /// Clear all elements.
    fn clear(&mut self) {
        self.points_to = HybridSet::SmallSet(Vec::new());
    }

    /// Count the number of elements in the set.
    fn count(&self) -> usize {
        match &self.points_to {
            HybridSet::SmallSet(small) => small.len(),
            HybridSet::LargeSet(large) => large.len(),
        }
    }

    /// Returns `true` if `self` contains `elem`.
    fn contains(&self, elem: T) -> bool {
        match &self.points_to {
            HybridSet::SmallSet(small) => small.binary_search(&elem).is_ok(),
            HybridSet::LargeSet(large) => large.contains(&elem),
        }
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Is `self` is a superset of `other`?
    fn superset(&self, other: &HybridPointsToSet<T>) -> bool {
        match (&self.points_to, &other.points_to) {
            (HybridSet::LargeSet(self_large), HybridSet::LargeSet(other_large)) => {
                self_large.is_superset(other_large)
            }
            _ => other.count() <= self.count() && other.iter().all(|elem| self.contains(elem)),
        }
    }

    /// Adds `elem` to this set, returns true if n was not already in this set.
    fn insert(&mut self, elem: T) -> bool {
        match &mut self.points_to {
            HybridSet::SmallSet(small) => match small.binary_search(&elem) {
                Ok(_) => false,
                Err(pos) if small.len() < SMALL_SET_CAPACITY => {
                    small.insert(pos, elem);
                    true
                }
                Err(_) => {
                    // The set is small and full. Convert to a large set.
                    let mut large: BTreeSet<T> = small.iter().copied().collect();
                    large.insert(elem);
                    self.points_to = HybridSet::LargeSet(large);
                    true
                }
            },
            HybridSet::LargeSet(large) => large.insert(elem),
        }
    }

    fn remove(&mut self, elem: T) -> bool {
        // Note: we currently don't bother going from Large back to Small.
        match &mut self.points_to {
            HybridSet::SmallSet(small) => match small.binary_search(&elem) {
                Ok(pos) => {
                    small.remove(pos);
                    true
                }
                Err(_) => false,
            },
            HybridSet::LargeSet(large) => large.remove(&elem),
        }
    }

    fn union(&mut self, other: &HybridPointsToSet<T>) -> bool {
        if let HybridSet::LargeSet(other_large) = &other.points_to {
            if let HybridSet::LargeSet(self_large) = &mut self.points_to {
                let before = self_large.len();
                self_large.extend(other_large.iter().copied());
                return self_large.len() != before;
            }
        }
        let mut changed = false;
        for elem in other.iter() {
            changed |= self.insert(elem);
        }
        changed
    }

    fn subtract(&mut self, other: &HybridPointsToSet<T>) -> bool {
        match &mut self.points_to {
            HybridSet::SmallSet(small) => {
                let before = small.len();
                small.retain(|elem| !other.contains(*elem));
                before != small.len()
            }
            HybridSet::LargeSet(large) => {
                let mut changed = false;
                for elem in other.iter() {
                    changed |= large.remove(&elem);
                }
                changed
            }
        }
    }

    type Iter<'a> = HybridIter<'a, T> where Self: 'a;
    fn iter(&self) -> HybridIter<'_, T> {
        match &self.points_to {
            HybridSet::SmallSet(small) => HybridIter::SmallIter(small.iter()),
            HybridSet::LargeSet(large) => HybridIter::LargeIter(large.iter()),
        }
    }
}

#[derive(Clone)]
enum HybridSet<T> {
    SmallSet(Vec<T>),
    LargeSet(BTreeSet<T>),
}

pub enum HybridIter<'a, T> {
    SmallIter(slice::Iter<'a, T>),
    LargeIter(btree_set::Iter<'a, T>),
}

impl<'a, T: Copy> Iterator for HybridIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self {
            HybridIter::SmallIter(small) => small.next().copied(),
            HybridIter::LargeIter(large) => large.next().copied(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use rand::Rng;
    use super::{HybridPointsToSet, HybridSet, PointsToSet, SMALL_SET_CAPACITY};

    fn random_set(len: usize) -> BTreeSet<u32> {
        let mut rng = rand::thread_rng();
        let mut set = BTreeSet::new();
        while set.len() < len {
            let x = rng.gen_range(1..1000);
            set.insert(x);
        }
        set
    }

    fn random_value_from_set(set: &BTreeSet<u32>) -> u32 {
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..set.len());
        set.iter().nth(index).cloned().unwrap()
    }

    #[test]
    fn small_set_test() {
        let rand_set = random_set(8);
        let mut small_set = HybridPointsToSet::<u32>::new();
        for x in rand_set.iter() {
            small_set.insert(*x);
        }
        assert_eq!(small_set.count(), 8);
        assert!(matches!(small_set.points_to, HybridSet::SmallSet(_)));
        // Iteration is ordered.
        assert_eq!(small_set.iter().collect::<Vec<_>>(), rand_set.iter().copied().collect::<Vec<_>>());

        let rand_val = random_value_from_set(&rand_set);
        assert!(small_set.contains(rand_val));
        assert!(small_set.remove(rand_val));
        assert!(!small_set.contains(rand_val));
        assert_eq!(small_set.count(), 7);
    }

    #[test]
    fn large_set_test() {
        let rand_set = random_set(SMALL_SET_CAPACITY + 3);
        let large_set: HybridPointsToSet<u32> = rand_set.iter().copied().collect();
        assert_eq!(large_set.count(), SMALL_SET_CAPACITY + 3);
        assert!(matches!(large_set.points_to, HybridSet::LargeSet(_)));
        assert_eq!(large_set.iter().collect::<Vec<_>>(), rand_set.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn union_subtract_test() {
        let a = random_set(10);
        let b = random_set(30);
        let mut small: HybridPointsToSet<u32> = a.iter().copied().collect();
        let large: HybridPointsToSet<u32> = b.iter().copied().collect();
        let changed = small.union(&large);
        assert_eq!(changed, !a.is_superset(&b));
        assert!(small.superset(&large));
        let expected: BTreeSet<u32> = a.union(&b).copied().collect();
        assert_eq!(small.iter().collect::<BTreeSet<_>>(), expected);

        small.subtract(&large);
        let expected: BTreeSet<u32> = a.difference(&b).copied().collect();
        assert_eq!(small.iter().collect::<BTreeSet<_>>(), expected);
    }

    #[test]
    fn equality_ignores_representation_test() {
        let values = random_set(SMALL_SET_CAPACITY + 1);
        let mut grown: HybridPointsToSet<u32> = values.iter().copied().collect();
        let last = *values.iter().next_back().unwrap();
        grown.remove(last);
        let small: HybridPointsToSet<u32> = values.iter().copied().filter(|v| *v != last).collect();
        assert!(matches!(grown.points_to, HybridSet::LargeSet(_)));
        assert!(matches!(small.points_to, HybridSet::SmallSet(_)));
        assert_eq!(grown, small);
    }
}
