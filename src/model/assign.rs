use crate::model::TreeParams;
use crate::rank::{ideal_dcg, invert_ranks, rank_top_k};
use crate::{LabelFreqTable, LabelVec};
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

/// A left/right assignment initializer: produces the initial partition of
/// one node's entries from their label rows and a seeded generator.
pub type AssignInitializer = fn(&[&LabelVec], &TreeParams, &mut StdRng) -> Vec<bool>;

/// A left/right assignment optimizer: refines the partition in place, using
/// the incoming values as the starting point.
pub type Assigner = fn(&[&LabelVec], &mut [bool]);

/// Look up an assignment initializer by its registry name.
pub fn assign_initializer(name: &str) -> Option<AssignInitializer> {
    match name {
        "uniform" => Some(initialize_uniform),
        _ => None,
    }
}

/// Look up an assignment optimizer by its registry name.
pub fn assigner(name: &str) -> Option<Assigner> {
    match name {
        "greedy_bottom_ranks" => Some(assign_greedy_bottom_ranks),
        "ndcg" => Some(assign_ndcg),
        "none" => Some(assign_none),
        _ => None,
    }
}

/// Initialize each entry's side with a fair coin flip.
fn initialize_uniform(labels: &[&LabelVec], _params: &TreeParams, rng: &mut StdRng) -> Vec<bool> {
    labels.iter().map(|_| rng.gen::<f32>() >= 0.5).collect()
}

fn count_label_freq(labels: &[&LabelVec]) -> LabelFreqTable {
    let mut label_freq = LabelFreqTable::new();
    for yi in labels {
        for &label in yi.iter() {
            *label_freq.entry(label).or_insert(0.0) += 1.0;
        }
    }
    label_freq
}

/// Reassign each side as maximizing the summed nDCG-style utility of both
/// sides' ranked label distributions, iterating until no further improvement.
///
/// The DCG weights use base-2 logarithms for precision.
fn assign_ndcg(labels: &[&LabelVec], delta: &mut [bool]) {
    let mut delta0: Vec<bool> = delta.to_vec();
    let mut delta1 = vec![false; delta.len()];
    let mut objval0 = 0f32;
    loop {
        // Construct the left/right label distributions r^- and r^+, each
        // entry's contribution normalized by its ideal DCG.
        let mut left_freq = LabelFreqTable::new();
        let mut right_freq = LabelFreqTable::new();
        for (i, yi) in labels.iter().enumerate() {
            let freq = if delta0[i] {
                &mut right_freq
            } else {
                &mut left_freq
            };
            let z = 1.0 / ideal_dcg(yi.len());
            for &label in yi.iter() {
                *freq.entry(label).or_insert(0.0) += z;
            }
        }
        let left_inv_ranks = invert_ranks(&rank_top_k(&left_freq, left_freq.len()));
        let right_inv_ranks = invert_ranks(&rank_top_k(&right_freq, right_freq.len()));
        // Move each entry to the side where its labels rank better.
        let mut objval = 0f32;
        for (i, yi) in labels.iter().enumerate() {
            let (mut vn, mut vp) = (0f32, 0f32);
            for label in yi.iter() {
                if let Some(&rank) = left_inv_ranks.get(label) {
                    vn += 1.0 / (1.0 + rank as f32).log2();
                }
                if let Some(&rank) = right_inv_ranks.get(label) {
                    vp += 1.0 / (1.0 + rank as f32).log2();
                }
            }
            if vn < vp {
                delta1[i] = true;
                objval += vp;
            } else {
                delta1[i] = false;
                objval += vn;
            }
        }
        debug!("assign_ndcg: objval={} -> {}", objval0, objval);
        if objval0 >= objval {
            break;
        }
        std::mem::swap(&mut delta0, &mut delta1);
        objval0 = objval;
    }
    delta.copy_from_slice(&delta0);
}

/// Move every entry carrying the current bottom-ranked label to the right,
/// label by label from the rarest up, until the sides balance.
fn assign_greedy_bottom_ranks(labels: &[&LabelVec], delta: &mut [bool]) {
    for d in delta.iter_mut() {
        *d = false;
    }
    let label_freq = count_label_freq(labels);
    let ranked = rank_top_k(&label_freq, label_freq.len());
    let n = labels.len();
    let (mut n_lefts, mut n_rights) = (n, 0);
    let mut k = ranked.len();
    while n_lefts > n / 2 && k > 0 {
        k -= 1;
        let label = ranked[k];
        debug!(
            "assign_greedy_bottom_ranks: moving label {} with {} in left and {} in right",
            label, n_lefts, n_rights
        );
        for (i, yi) in labels.iter().enumerate() {
            if delta[i] {
                continue;
            }
            if yi.contains(&label) {
                delta[i] = true;
                n_lefts -= 1;
                n_rights += 1;
            }
        }
    }
}

/// Keep the initializer's assignment untouched.
fn assign_none(_labels: &[&LabelVec], _delta: &mut [bool]) {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    // The reference partitions below are defined up to polarity: an
    // assignment and its negation describe the same split.
    fn assert_assignment_matches(expected: &[bool], got: &[bool]) {
        assert_eq!(expected.len(), got.len());
        if expected[0] == got[0] {
            assert_eq!(expected, got);
        } else {
            let negated: Vec<bool> = expected.iter().map(|&b| !b).collect();
            assert_eq!(negated, got);
        }
    }

    fn interleaved(patterns: &[LabelVec], copies: usize) -> Vec<LabelVec> {
        let mut labels = Vec::with_capacity(patterns.len() * copies);
        for _ in 0..copies {
            labels.extend(patterns.iter().cloned());
        }
        labels
    }

    // Half-and-half starting point, matching none of the patterns' groups.
    fn halved(n: usize) -> Vec<bool> {
        (0..n).map(|i| i >= n / 2).collect()
    }

    fn run_assigner(name: &str, labels: &[LabelVec], delta: &mut [bool]) {
        let rows: Vec<&LabelVec> = labels.iter().collect();
        assigner(name).unwrap()(&rows, delta);
    }

    #[test]
    fn test_assigner_lookup() {
        assert!(assigner("ndcg").is_some());
        assert!(assigner("greedy_bottom_ranks").is_some());
        assert!(assigner("none").is_some());
        assert!(assigner("bogus").is_none());
        assert!(assign_initializer("uniform").is_some());
        assert!(assign_initializer("bogus").is_none());
    }

    #[test]
    fn test_initialize_uniform() {
        let labels: Vec<LabelVec> = (0..64).map(|_| vec![0]).collect();
        let rows: Vec<&LabelVec> = labels.iter().collect();
        let params = TreeParams::default();
        let delta = initialize_uniform(&rows, &params, &mut StdRng::seed_from_u64(7));
        assert_eq!(64, delta.len());
        // Both sides occupied with overwhelming probability, and the draw is
        // reproducible from the seed.
        assert!(delta.iter().any(|&d| d) && delta.iter().any(|&d| !d));
        assert_eq!(
            delta,
            initialize_uniform(&rows, &params, &mut StdRng::seed_from_u64(7))
        );
    }

    #[test]
    fn test_assign_ndcg_separates_disjoint_labels() {
        let labels = interleaved(&[vec![0, 2], vec![1, 3]], 25);
        let expected: Vec<bool> = (0..50).map(|i| i % 2 == 1).collect();
        let mut delta = halved(50);
        run_assigner("ndcg", &labels, &mut delta);
        assert_assignment_matches(&expected, &delta);
    }

    #[test]
    fn test_assign_ndcg_separates_shared_top_label() {
        let labels = interleaved(&[vec![0, 1], vec![0, 2]], 25);
        let expected: Vec<bool> = (0..50).map(|i| i % 2 == 1).collect();
        let mut delta = halved(50);
        run_assigner("ndcg", &labels, &mut delta);
        assert_assignment_matches(&expected, &delta);
    }

    #[test]
    fn test_assign_ndcg_separates_label_hierarchy() {
        let labels = interleaved(
            &[vec![0, 1, 3], vec![0, 1, 4], vec![0, 2, 5], vec![0, 2, 6]],
            25,
        );
        let expected: Vec<bool> = (0..100).map(|i| i % 4 >= 2).collect();
        let mut delta = halved(100);
        run_assigner("ndcg", &labels, &mut delta);
        assert_assignment_matches(&expected, &delta);
    }

    #[test]
    fn test_assign_greedy_bottom_ranks() {
        let labels = interleaved(&[vec![0, 2], vec![1, 3]], 25);
        let expected: Vec<bool> = (0..50).map(|i| i % 2 == 1).collect();
        let mut delta = halved(50);
        run_assigner("greedy_bottom_ranks", &labels, &mut delta);
        assert_assignment_matches(&expected, &delta);

        let labels = interleaved(
            &[vec![0, 1, 3], vec![0, 1, 4], vec![0, 2, 5], vec![0, 2, 6]],
            25,
        );
        let expected: Vec<bool> = (0..100).map(|i| i % 4 >= 2).collect();
        let mut delta = halved(100);
        run_assigner("greedy_bottom_ranks", &labels, &mut delta);
        assert_assignment_matches(&expected, &delta);
    }

    #[test]
    fn test_assign_none() {
        let labels = interleaved(&[vec![0], vec![1]], 2);
        let mut delta = vec![false, true, false, true];
        run_assigner("none", &labels, &mut delta);
        assert_eq!(vec![false, true, false, true], delta);
    }
}
