//! Sorted set: ordered index paired with a hash index.
//!
//! Members are unique byte strings, each with an `f64` score. Range queries
//! are ordered by `(score, name)` with a lexicographic tie-break on the
//! name. The ordered side is a `BTreeMap` keyed by `(OrderedFloat, name)`;
//! the hash side maps name to score for O(1) lookups.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use ordered_float::OrderedFloat;

#[derive(Debug, Default)]
pub struct ZSet {
    tree: BTreeMap<(OrderedFloat<f64>, Vec<u8>), ()>,
    scores: HashMap<Vec<u8>, f64>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Insert a member or update its score. Returns true only when the
    /// member was newly added.
    pub fn insert(&mut self, name: &[u8], score: f64) -> bool {
        match self.scores.get_mut(name) {
            Some(old) => {
                if *old != score {
                    self.tree.remove(&(OrderedFloat(*old), name.to_vec()));
                    self.tree.insert((OrderedFloat(score), name.to_vec()), ());
                    *old = score;
                }
                false
            }
            None => {
                self.scores.insert(name.to_vec(), score);
                self.tree.insert((OrderedFloat(score), name.to_vec()), ());
                true
            }
        }
    }

    /// Remove a member by name. Returns true when it existed.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        match self.scores.remove(name) {
            Some(score) => {
                let removed = self.tree.remove(&(OrderedFloat(score), name.to_vec()));
                debug_assert!(removed.is_some());
                true
            }
            None => false,
        }
    }

    pub fn score(&self, name: &[u8]) -> Option<f64> {
        self.scores.get(name).copied()
    }

    /// Range query: seek to the least `(score, name)` pair greater than or
    /// equal to the given one, advance the cursor by `offset` positions
    /// (negative moves backward), then collect up to `limit` pairs walking
    /// forward. A cursor that walks off either end yields nothing.
    pub fn range_query(
        &self,
        score: f64,
        name: &[u8],
        offset: i64,
        limit: i64,
    ) -> Vec<(&[u8], f64)> {
        if limit <= 0 {
            return Vec::new();
        }
        let pivot = (OrderedFloat(score), name.to_vec());
        let forward = |pivot: (OrderedFloat<f64>, Vec<u8>)| {
            self.tree
                .range((Bound::Included(pivot), Bound::Unbounded))
                .map(|(k, _)| k)
        };
        let iter: Box<dyn Iterator<Item = &(OrderedFloat<f64>, Vec<u8>)> + '_> = if offset >= 0 {
            Box::new(forward(pivot).skip(offset as usize))
        } else {
            let back = offset.unsigned_abs() as usize;
            let mut behind: Vec<_> = self
                .tree
                .range((Bound::Unbounded, Bound::Excluded(pivot.clone())))
                .rev()
                .map(|(k, _)| k)
                .take(back)
                .collect();
            if behind.len() < back {
                return Vec::new(); // cursor fell off the front
            }
            behind.reverse();
            Box::new(behind.into_iter().chain(forward(pivot)))
        };
        iter.take(limit as usize)
            .map(|(s, n)| (n.as_slice(), s.0))
            .collect()
    }

    /// In-order iteration over `(name, score)`, lowest pair first.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], f64)> {
        self.tree.keys().map(|(s, n)| (n.as_slice(), s.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ZSet {
        let mut z = ZSet::new();
        z.insert(b"a", 1.0);
        z.insert(b"b", 2.0);
        z.insert(b"c", 2.0);
        z
    }

    fn names(pairs: &[(&[u8], f64)]) -> Vec<Vec<u8>> {
        pairs.iter().map(|(n, _)| n.to_vec()).collect()
    }

    #[test]
    fn insert_reports_new_vs_update() {
        let mut z = ZSet::new();
        assert!(z.insert(b"a", 1.0));
        assert!(!z.insert(b"a", 1.0));
        assert!(!z.insert(b"a", 5.0));
        assert_eq!(z.score(b"a"), Some(5.0));
        assert_eq!(z.len(), 1);
    }

    #[test]
    fn update_moves_the_member_in_order() {
        let mut z = sample();
        z.insert(b"a", 9.0);
        let all: Vec<_> = z.iter().collect();
        assert_eq!(names(&all), vec![b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn remove_both_indexes() {
        let mut z = sample();
        assert!(z.remove(b"b"));
        assert!(!z.remove(b"b"));
        assert_eq!(z.score(b"b"), None);
        assert_eq!(z.iter().count(), 2);
    }

    #[test]
    fn ties_order_by_name() {
        let z = sample();
        let all: Vec<_> = z.iter().collect();
        assert_eq!(names(&all), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn seek_ge_lands_on_the_boundary() {
        let z = sample();
        let got = z.range_query(2.0, b"", 0, 10);
        assert_eq!(names(&got), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(got[0].1, 2.0);
    }

    #[test]
    fn negative_offset_walks_backward() {
        let z = sample();
        let got = z.range_query(2.0, b"", -1, 10);
        assert_eq!(
            names(&got),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn offset_off_the_front_yields_nothing() {
        let z = sample();
        assert!(z.range_query(2.0, b"", -2, 10).is_empty());
    }

    #[test]
    fn offset_off_the_back_yields_nothing() {
        let z = sample();
        assert!(z.range_query(1.0, b"", 5, 10).is_empty());
    }

    #[test]
    fn limit_caps_the_result() {
        let z = sample();
        assert_eq!(z.range_query(0.0, b"", 0, 2).len(), 2);
        assert!(z.range_query(0.0, b"", 0, 0).is_empty());
        assert!(z.range_query(0.0, b"", 0, -3).is_empty());
    }

    #[test]
    fn seek_past_a_name_on_equal_score() {
        let z = sample();
        // (2.0, "b") itself is >= the pivot (2.0, "b"); (2.0, "bb") would not be.
        let got = z.range_query(2.0, b"b", 0, 10);
        assert_eq!(names(&got), vec![b"b".to_vec(), b"c".to_vec()]);
        let got = z.range_query(2.0, b"bz", 0, 10);
        assert_eq!(names(&got), vec![b"c".to_vec()]);
    }
}
