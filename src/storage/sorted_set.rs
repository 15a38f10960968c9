//! Score-ordered member set.
//!
//! Backs both sorted sets and geo sets (where the score is a geohash).
//! Members are kept in a hash map for O(1) score lookup and in a B-tree
//! ordered by `(score, member)` for rank queries.

use bytes::Bytes;
use ordered_float::OrderedFloat;
use std::collections::{BTreeSet, HashMap};

/// Approximate per-member bookkeeping cost (map slot + tree node).
const MEMBER_OVERHEAD: usize = 48;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    ordered: BTreeSet<(OrderedFloat<f64>, Bytes)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a member. Returns `true` if the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                if old != score {
                    self.ordered.remove(&(OrderedFloat(old), member.clone()));
                    self.ordered.insert((OrderedFloat(score), member));
                }
                false
            }
            None => {
                self.ordered.insert((OrderedFloat(score), member));
                true
            }
        }
    }

    /// Removes a member. Returns `true` if it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered
                    .remove(&(OrderedFloat(score), Bytes::copy_from_slice(member)));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.scores.contains_key(member)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members in ascending score order (ties broken by member bytes).
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.ordered.iter().map(|(score, member)| (member, score.0))
    }

    /// Members with rank in `start..=stop`; negative indices count from the end.
    pub fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        match super::object::normalize_range(start, stop, self.len()) {
            Some((from, to)) => self
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(member, score)| (member.clone(), score))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Estimated heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        self.scores
            .keys()
            .map(|member| 2 * member.len() + MEMBER_OVERHEAD)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_update() {
        let mut set = SortedSet::new();
        assert!(set.insert(Bytes::from("a"), 2.0));
        assert!(set.insert(Bytes::from("b"), 1.0));
        assert!(!set.insert(Bytes::from("a"), 0.5));

        let order: Vec<_> = set.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(order, vec![Bytes::from("a"), Bytes::from("b")]);
        assert_eq!(set.score(b"a"), Some(0.5));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut set = SortedSet::new();
        set.insert(Bytes::from("a"), 1.0);
        assert!(set.remove(b"a"));
        assert!(!set.remove(b"a"));
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn test_range_by_rank() {
        let mut set = SortedSet::new();
        for (i, name) in ["one", "two", "three", "four"].iter().enumerate() {
            set.insert(Bytes::from(*name), i as f64);
        }

        let first_two = set.range_by_rank(0, 1);
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].0, Bytes::from("one"));

        let last = set.range_by_rank(-1, -1);
        assert_eq!(last, vec![(Bytes::from("four"), 3.0)]);

        assert!(set.range_by_rank(5, 10).is_empty());
    }
}
