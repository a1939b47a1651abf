//! kelda-join — the diff primitive every reconciler is built on.
//!
//! Both joins take a desired collection and an observed collection and
//! partition them into `pairs` (keep), `left` (create), and `right`
//! (destroy). `hash_join` matches on key equality; `score_join` greedily
//! pairs the lowest-scoring compatible items when structural equality is
//! too strict, e.g. matching a machine spec to any booted machine of the
//! same size.

use std::collections::HashMap;
use std::hash::Hash;

/// The three-way partition produced by a join.
///
/// Every left input lands in exactly one of `pairs` (as the first element)
/// or `left`, and likewise for right inputs. Output order is unspecified.
#[derive(Debug, Clone)]
pub struct Joined<L, R> {
    pub pairs: Vec<(L, R)>,
    pub left: Vec<L>,
    pub right: Vec<R>,
}

impl<L, R> Default for Joined<L, R> {
    fn default() -> Self {
        Joined {
            pairs: Vec::new(),
            left: Vec::new(),
            right: Vec::new(),
        }
    }
}

/// Join two collections on key equality.
///
/// When several left items share a key, each consumes at most one matching
/// right item; the leftovers fall through to `left`.
pub fn hash_join<L, R, K, KL, KR>(
    lefts: impl IntoIterator<Item = L>,
    rights: impl IntoIterator<Item = R>,
    left_key: KL,
    right_key: KR,
) -> Joined<L, R>
where
    K: Hash + Eq,
    KL: Fn(&L) -> K,
    KR: Fn(&R) -> K,
{
    let mut by_key: HashMap<K, Vec<R>> = HashMap::new();
    for r in rights {
        by_key.entry(right_key(&r)).or_default().push(r);
    }

    let mut joined = Joined::default();
    for l in lefts {
        match by_key.get_mut(&left_key(&l)).and_then(|rs| rs.pop()) {
            Some(r) => joined.pairs.push((l, r)),
            None => joined.left.push(l),
        }
    }
    joined.right = by_key.into_values().flatten().collect();
    joined
}

/// Join two collections by greedily pairing minimum-score items.
///
/// `score` returns 0 for a perfect pair, a positive value for a workable
/// one, and a negative value for an incompatible one. No global optimum is
/// attempted; the cheapest available pair always wins.
pub fn score_join<L, R, S>(lefts: Vec<L>, rights: Vec<R>, score: S) -> Joined<L, R>
where
    S: Fn(&L, &R) -> i32,
{
    let mut candidates = Vec::new();
    for (li, l) in lefts.iter().enumerate() {
        for (ri, r) in rights.iter().enumerate() {
            let s = score(l, r);
            if s >= 0 {
                candidates.push((s, li, ri));
            }
        }
    }
    candidates.sort_unstable();

    let mut left_used = vec![false; lefts.len()];
    let mut right_used = vec![false; rights.len()];
    let mut matches: Vec<(usize, usize)> = Vec::new();
    for (_, li, ri) in candidates {
        if !left_used[li] && !right_used[ri] {
            left_used[li] = true;
            right_used[ri] = true;
            matches.push((li, ri));
        }
    }

    let mut joined = Joined::default();
    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut paired_right: HashMap<usize, usize> = matches.iter().map(|&(l, r)| (l, r)).collect();
    for (li, l) in lefts.into_iter().enumerate() {
        match paired_right.remove(&li) {
            Some(ri) => {
                let r = rights[ri].take().unwrap();
                joined.pairs.push((l, r));
            }
            None => joined.left.push(l),
        }
    }
    joined.right = rights.into_iter().flatten().collect();
    joined
}
