//! Loopless generation of multiset permutations (Williams' "cool-lex" prefix-shift algorithm),
//! optionally filtered by positional constraints.

use crate::common::LayerDim;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A temporal loop prime factor: the dimension and the factor.
pub type Lpf = (LayerDim, u64);

/// Restricts which permutations of loop prime factors are acceptable. Positions may be negative,
/// counting from the outermost loop (`-1` is the last position).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum PermutationConstraint {
    /// The loop at each position must iterate over the given dimension.
    StaticPositions(IndexMap<isize, LayerDim>),
    /// The loop at each position must have the given dimension and size.
    StaticPositionsAndSizes(IndexMap<isize, Lpf>),
}

impl PermutationConstraint {
    pub fn is_empty(&self) -> bool {
        match self {
            PermutationConstraint::StaticPositions(m) => m.is_empty(),
            PermutationConstraint::StaticPositionsAndSizes(m) => m.is_empty(),
        }
    }

    pub fn is_valid(&self, permutation: &[Lpf]) -> bool {
        let at = |pos: isize| -> Option<&Lpf> {
            let idx = if pos < 0 {
                permutation.len().checked_sub(pos.unsigned_abs())?
            } else {
                pos.unsigned_abs()
            };
            permutation.get(idx)
        };
        match self {
            PermutationConstraint::StaticPositions(m) => m
                .iter()
                .all(|(&pos, dim)| at(pos).is_some_and(|(d, _)| d == dim)),
            PermutationConstraint::StaticPositionsAndSizes(m) => m
                .iter()
                .all(|(&pos, lpf)| at(pos).is_some_and(|l| l == lpf)),
        }
    }
}

/// Iterates over all distinct permutations of a multiset.
///
/// The first permutation is the multiset in non-increasing order. The list is kept as an
/// arena-backed singly-linked list so each step is O(1) apart from copying out the result.
pub struct MultisetPermutations<T> {
    values: Vec<T>,
    next: Vec<Option<usize>>,
    head: usize,
    i: usize,
    j: usize,
    started: bool,
    done: bool,
}

impl<T: Ord + Clone> MultisetPermutations<T> {
    pub fn new(mut multiset: Vec<T>) -> Self {
        multiset.sort();
        let len = multiset.len();
        // Node k points to node k-1, so the last (largest) node is the head.
        let next = (0..len)
            .map(|k| if k == 0 { None } else { Some(k - 1) })
            .collect::<Vec<_>>();
        let head = len.saturating_sub(1);
        let mut perms = MultisetPermutations {
            values: multiset,
            next,
            head,
            i: head,
            j: head,
            started: false,
            done: len == 0,
        };
        perms.i = perms.nth(len.saturating_sub(2));
        perms.j = perms.nth(len.saturating_sub(1));
        perms
    }

    fn nth(&self, n: usize) -> usize {
        let mut o = self.head;
        for _ in 0..n {
            match self.next[o] {
                Some(n) => o = n,
                None => break,
            }
        }
        o
    }

    fn visit(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.values.len());
        let mut o = Some(self.head);
        while let Some(idx) = o {
            out.push(self.values[idx].clone());
            o = self.next[idx];
        }
        out
    }

    fn step(&mut self) -> Option<()> {
        let (h, i, j) = (self.head, self.i, self.j);
        let s = match self.next[j] {
            Some(jn) if self.values[i] >= self.values[jn] => j,
            _ => i,
        };
        let t = self.next[s]?;
        self.next[s] = self.next[t];
        self.next[t] = Some(h);
        if self.values[t] < self.values[h] {
            self.i = t;
        }
        self.j = self.next[self.i]?;
        self.head = t;
        Some(())
    }
}

impl<T: Ord + Clone> Iterator for MultisetPermutations<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.visit());
        }
        let j = self.j;
        if self.next[j].is_none() && self.values[j] >= self.values[self.head] {
            self.done = true;
            return None;
        }
        if self.step().is_none() {
            self.done = true;
            return None;
        }
        Some(self.visit())
    }
}

/// Permutations of `multiset` satisfying every constraint.
pub fn constrained_permutations(
    multiset: Vec<Lpf>,
    constraints: Vec<PermutationConstraint>,
) -> impl Iterator<Item = Vec<Lpf>> {
    MultisetPermutations::new(multiset)
        .filter(move |perm| constraints.iter().all(|c| c.is_valid(perm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::factorial;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_permutations_of_distinct_items() {
        let perms: Vec<_> = MultisetPermutations::new(vec![1, 2, 3]).collect();
        assert_eq!(perms.len(), 6);
        assert_eq!(perms[0], vec![3, 2, 1]);
        let unique: HashSet<_> = perms.iter().cloned().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_permutations_of_one_and_none() {
        assert_eq!(
            MultisetPermutations::new(vec![7]).collect::<Vec<_>>(),
            vec![vec![7]]
        );
        assert_eq!(MultisetPermutations::<u8>::new(vec![]).count(), 0);
    }

    #[test]
    fn test_constraints_with_negative_positions() {
        let k = LayerDim::new("K");
        let c = LayerDim::new("C");
        let lpfs = vec![(k.clone(), 2), (k.clone(), 2), (c.clone(), 3)];
        let constraints = vec![
            PermutationConstraint::StaticPositions([(-1, c.clone())].into_iter().collect()),
            PermutationConstraint::StaticPositionsAndSizes(IndexMap::new()),
        ];
        let perms: Vec<_> = constrained_permutations(lpfs, constraints).collect();
        assert_eq!(perms, vec![vec![(k.clone(), 2), (k, 2), (c, 3)]]);
    }

    #[test]
    fn test_out_of_range_position_is_invalid() {
        let k = LayerDim::new("K");
        let constraint =
            PermutationConstraint::StaticPositions([(5, k.clone())].into_iter().collect());
        assert!(!constraint.is_valid(&[(k, 2)]));
    }

    proptest! {
        #[test]
        fn test_multiset_permutations_are_distinct_and_complete(
            items in proptest::collection::vec(0u8..4, 1..=6)
        ) {
            let perms: Vec<_> = MultisetPermutations::new(items.clone()).collect();
            let unique: HashSet<_> = perms.iter().cloned().collect();
            prop_assert_eq!(unique.len(), perms.len());

            let mut counts = std::collections::BTreeMap::new();
            for i in &items {
                *counts.entry(*i).or_insert(0u64) += 1;
            }
            let expected = counts
                .values()
                .fold(factorial(items.len() as u64), |acc, &c| acc / factorial(c));
            prop_assert_eq!(perms.len() as u128, expected);

            let mut sorted = items.clone();
            sorted.sort();
            for p in &perms {
                let mut q = p.clone();
                q.sort();
                prop_assert_eq!(&q, &sorted);
            }
        }
    }
}
