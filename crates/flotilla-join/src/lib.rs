//! Join primitives — key-based matching between two collections.
//!
//! Every reconciliation step in the system is a diff between a desired
//! collection and an observed one: blueprint machines against store
//! rows, store rows against cloud machines, blueprint containers
//! against scheduled ones. All of them reduce to one of two joins:
//!
//! - [`score_join`] pairs elements greedily using a cost function,
//!   for collections without a shared identity.
//! - [`hash_join`] pairs elements on exact key equality in
//!   O(|L| + |R|), for collections with stable IDs.
//!
//! Both return the matched pairs plus the unmatched residue of each
//! side, preserving input order.

/// The outcome of a join: matched pairs and the unmatched leftovers.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined<L, R> {
    pub pairs: Vec<(L, R)>,
    pub left_only: Vec<L>,
    pub right_only: Vec<R>,
}

impl<L, R> Default for Joined<L, R> {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            left_only: Vec::new(),
            right_only: Vec::new(),
        }
    }
}

/// Greedily join two collections with a score function.
///
/// `score(l, r)` returns a match cost: lower is better, negative means
/// the pair is incompatible. Each left element, in input order, takes
/// the best-scoring unmatched right element; ties go to the earlier
/// right element. O(|L| * |R|).
pub fn score_join<L, R, F>(lefts: Vec<L>, rights: Vec<R>, score: F) -> Joined<L, R>
where
    F: Fn(&L, &R) -> i32,
{
    let mut result = Joined::default();
    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();

    for l in lefts {
        let mut best: Option<(usize, i32)> = None;
        for (i, slot) in rights.iter().enumerate() {
            let Some(r) = slot else { continue };
            let s = score(&l, r);
            if s < 0 {
                continue;
            }
            if best.map_or(true, |(_, bs)| s < bs) {
                best = Some((i, s));
            }
        }

        match best {
            Some((i, _)) => {
                let r = rights[i].take().unwrap();
                result.pairs.push((l, r));
            }
            None => result.left_only.push(l),
        }
    }

    result.right_only = rights.into_iter().flatten().collect();
    result
}

/// Join two collections on exact key equality.
///
/// Right elements are indexed by key; on duplicate right keys the later
/// element wins the index and earlier ones fall through to
/// `right_only`. O(|L| + |R|).
pub fn hash_join<L, R, K, KL, KR>(lefts: Vec<L>, rights: Vec<R>, lkey: KL, rkey: KR) -> Joined<L, R>
where
    K: std::hash::Hash + Eq,
    KL: Fn(&L) -> K,
    KR: Fn(&R) -> K,
{
    let mut result = Joined::default();
    let mut index = std::collections::HashMap::with_capacity(rights.len());
    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();

    for (i, slot) in rights.iter().enumerate() {
        let r = slot.as_ref().unwrap();
        index.insert(rkey(r), i);
    }

    for l in lefts {
        match index.remove(&lkey(&l)) {
            Some(i) => {
                let r = rights[i].take().unwrap();
                result.pairs.push((l, r));
            }
            None => result.left_only.push(l),
        }
    }

    result.right_only = rights.into_iter().flatten().collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_join_pairs_best_match() {
        // Each left takes the lowest-scoring right.
        let joined = score_join(vec![10i32, 20], vec![19i32, 11], |l, r| (l - r).abs());
        assert_eq!(joined.pairs, vec![(10, 11), (20, 19)]);
        assert!(joined.left_only.is_empty());
        assert!(joined.right_only.is_empty());
    }

    #[test]
    fn score_join_negative_means_no_match() {
        let joined = score_join(vec![1, 2, 3], vec![2, 3, 4], |l, r| {
            if l == r {
                0
            } else {
                -1
            }
        });
        assert_eq!(joined.pairs, vec![(2, 2), (3, 3)]);
        assert_eq!(joined.left_only, vec![1]);
        assert_eq!(joined.right_only, vec![4]);
    }

    #[test]
    fn score_join_ties_go_to_earlier_right() {
        let joined = score_join(vec!["l"], vec!["r1", "r2"], |_, _| 5);
        assert_eq!(joined.pairs, vec![("l", "r1")]);
        assert_eq!(joined.right_only, vec!["r2"]);
    }

    #[test]
    fn score_join_is_greedy_in_left_order() {
        // The first left takes the shared best match even though the
        // second left would have scored it better.
        let joined = score_join(vec![5i32, 4], vec![4i32], |l, r| (l - r).abs());
        assert_eq!(joined.pairs, vec![(5, 4)]);
        assert_eq!(joined.left_only, vec![4]);
    }

    #[test]
    fn score_join_empty_sides() {
        let joined: Joined<i32, i32> = score_join(vec![], vec![1, 2], |_, _| 0);
        assert!(joined.pairs.is_empty());
        assert_eq!(joined.right_only, vec![1, 2]);

        let joined = score_join(vec![1, 2], vec![], |_: &i32, _: &i32| 0);
        assert_eq!(joined.left_only, vec![1, 2]);
    }

    #[test]
    fn hash_join_exact_keys() {
        let lefts = vec![("a", 1), ("b", 2), ("c", 3)];
        let rights = vec![("b", 20), ("d", 40), ("a", 10)];
        let joined = hash_join(lefts, rights, |l| l.0, |r| r.0);

        assert_eq!(joined.pairs, vec![(("a", 1), ("a", 10)), (("b", 2), ("b", 20))]);
        assert_eq!(joined.left_only, vec![("c", 3)]);
        assert_eq!(joined.right_only, vec![("d", 40)]);
    }

    #[test]
    fn hash_join_duplicate_right_keys() {
        // The later duplicate wins the index; the earlier one is
        // reported unmatched.
        let joined = hash_join(vec![1], vec![(1, "first"), (1, "second")], |l| *l, |r| r.0);
        assert_eq!(joined.pairs, vec![(1, (1, "second"))]);
        assert_eq!(joined.right_only, vec![(1, "first")]);
    }

    #[test]
    fn hash_join_preserves_order() {
        let joined = hash_join(vec![3, 1, 2], vec![2, 3], |l| *l, |r| *r);
        assert_eq!(joined.pairs, vec![(3, 3), (2, 2)]);
        assert_eq!(joined.left_only, vec![1]);
    }
}
