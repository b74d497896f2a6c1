//! Sorted outer join.

use footfall_error::Result;

use crate::Source;

/// Full outer join of two streams sorted by the same key under the same
/// total order. Emits one `(left, right)` pair per distinct key; with
/// unique keys on both sides each slot holds at most one record.
pub struct OuterJoin<L: Source, R: Source, KL, KR> {
    left: L,
    right: R,
    key_left: KL,
    key_right: KR,
    left_head: Option<L::Item>,
    right_head: Option<R::Item>,
    primed: bool,
}

/// Build an [`OuterJoin`] over `left` and `right`.
pub fn outer_join<L, R, K, KL, KR>(
    left: L,
    right: R,
    key_left: KL,
    key_right: KR,
) -> OuterJoin<L, R, KL, KR>
where
    L: Source,
    R: Source,
    K: Ord,
    KL: FnMut(&L::Item) -> K,
    KR: FnMut(&R::Item) -> K,
{
    OuterJoin {
        left,
        right,
        key_left,
        key_right,
        left_head: None,
        right_head: None,
        primed: false,
    }
}

impl<L, R, K, KL, KR> Source for OuterJoin<L, R, KL, KR>
where
    L: Source,
    R: Source,
    K: Ord,
    KL: FnMut(&L::Item) -> K,
    KR: FnMut(&R::Item) -> K,
{
    type Item = (Option<L::Item>, Option<R::Item>);

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if !self.primed {
            self.left_head = self.left.next()?;
            self.right_head = self.right.next()?;
            self.primed = true;
        }

        use std::cmp::Ordering;
        let order = match (&self.left_head, &self.right_head) {
            (None, None) => return Ok(None),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(l), Some(r)) => (self.key_left)(l).cmp(&(self.key_right)(r)),
        };

        let left = if order != Ordering::Greater {
            let item = self.left_head.take();
            self.left_head = self.left.next()?;
            item
        } else {
            None
        };
        let right = if order != Ordering::Less {
            let item = self.right_head.take();
            self.right_head = self.right.next()?;
            item
        } else {
            None
        };
        Ok(Some((left, right)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SourceExt, VecSource};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn join_keys(left: Vec<u32>, right: Vec<u32>) -> Vec<(Option<u32>, Option<u32>)> {
        outer_join(
            VecSource::new(left),
            VecSource::new(right),
            |l: &u32| *l,
            |r: &u32| *r,
        )
        .collect_vec()
        .unwrap()
    }

    #[test]
    fn pairs_matching_keys_and_passes_singles() {
        let out = join_keys(vec![1, 3, 4], vec![2, 3, 5]);
        assert_eq!(
            out,
            vec![
                (Some(1), None),
                (None, Some(2)),
                (Some(3), Some(3)),
                (Some(4), None),
                (None, Some(5)),
            ]
        );
    }

    #[test]
    fn empty_sides() {
        assert_eq!(join_keys(vec![], vec![]), vec![]);
        assert_eq!(join_keys(vec![7], vec![]), vec![(Some(7), None)]);
        assert_eq!(join_keys(vec![], vec![7]), vec![(None, Some(7))]);
    }

    proptest! {
        /// Every key from either side appears exactly once, keys present
        /// on both sides are paired, and the output follows key order.
        #[test]
        fn join_is_exhaustive_and_ordered(
            left_keys in prop::collection::btree_set(0u32..60, 0..30),
            right_keys in prop::collection::btree_set(0u32..60, 0..30),
        ) {
            let left: Vec<u32> = left_keys.iter().copied().collect();
            let right: Vec<u32> = right_keys.iter().copied().collect();
            let out = join_keys(left, right);

            let all: BTreeSet<u32> = left_keys.union(&right_keys).copied().collect();
            prop_assert_eq!(out.len(), all.len());

            let mut previous = None;
            for (l, r) in &out {
                let key = l.or(*r).expect("at least one side is populated");
                prop_assert_eq!(l.is_some(), left_keys.contains(&key));
                prop_assert_eq!(r.is_some(), right_keys.contains(&key));
                if let Some(previous) = previous {
                    prop_assert!(previous < key);
                }
                previous = Some(key);
            }
        }
    }
}
