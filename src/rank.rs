use crate::{Label, LabelFreqTable};
use hashbrown::HashMap;
use std::cmp::Ordering;

/// Sentinel label id padding top-K results when fewer candidates exist.
pub const NO_LABEL: Label = !0;

/// The canonical ranking order of label-frequency entries: frequency
/// descending, ties broken by ascending label id.
fn by_freq_then_label(l: &(Label, f32), r: &(Label, f32)) -> Ordering {
    r.1.partial_cmp(&l.1)
        .unwrap()
        .then_with(|| l.0.cmp(&r.0))
}

/// Rank the top-K labels of the given frequency table.
///
/// The result always has exactly `k` entries, padded with `NO_LABEL` when the
/// table is smaller. When asked for a large fraction of a non-trivial table,
/// a full sort is cheaper than selecting; both strategies use the same
/// comparator and therefore agree on every input.
pub fn rank_top_k(label_freq: &LabelFreqTable, k: usize) -> Vec<Label> {
    if k == 0 {
        return Vec::new();
    }
    let mut pairs: Vec<(Label, f32)> = label_freq.iter().map(|(&l, &f)| (l, f)).collect();
    if pairs.len() < 10 * k && pairs.len() > 25 {
        pairs.sort_unstable_by(by_freq_then_label);
    } else if k < pairs.len() {
        order_stat::kth_by(&mut pairs, k - 1, by_freq_then_label);
        pairs.truncate(k);
        pairs.sort_unstable_by(by_freq_then_label);
    } else {
        pairs.sort_unstable_by(by_freq_then_label);
    }
    pairs.truncate(k);

    let mut ranked: Vec<Label> = pairs.into_iter().map(|(l, _)| l).collect();
    ranked.resize(k, NO_LABEL);
    ranked
}

/// Invert a ranked label list into a map from label to 1-based rank.
pub fn invert_ranks(ranked: &[Label]) -> HashMap<Label, usize> {
    let mut inv_ranks = HashMap::with_capacity(ranked.len());
    for (rank, &label) in ranked.iter().enumerate() {
        if label != NO_LABEL {
            inv_ranks.insert(label, rank + 1);
        }
    }
    inv_ranks
}

/// The ideal DCG@K, `sum_{k=1}^K 1/log2(1+k)`, which is the maximum of the
/// possible DCG@K values. Undefined at K = 0, where NaN is returned.
pub fn ideal_dcg(k: usize) -> f32 {
    if k == 0 {
        return f32::NAN;
    }
    (1..=k).map(|i| 1.0 / ((1 + i) as f32).log2()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn table(pairs: &[(Label, f32)]) -> LabelFreqTable {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_rank_top_k() {
        assert_eq!(Vec::<Label>::new(), rank_top_k(&table(&[]), 0));
        assert_eq!(vec![NO_LABEL, NO_LABEL], rank_top_k(&table(&[]), 2));

        let t = table(&[(1, 3.), (2, 5.), (3, 1.), (4, 5.)]);
        assert_eq!(vec![2], rank_top_k(&t, 1));
        assert_eq!(vec![2, 4], rank_top_k(&t, 2));
        assert_eq!(vec![2, 4, 1], rank_top_k(&t, 3));
        assert_eq!(vec![2, 4, 1, 3], rank_top_k(&t, 4));
        assert_eq!(vec![2, 4, 1, 3, NO_LABEL, NO_LABEL], rank_top_k(&t, 6));
    }

    #[test]
    fn test_rank_top_k_tie_break() {
        // Equal frequencies rank the smaller label id first.
        let t = table(&[(7, 1.), (3, 1.), (5, 1.), (1, 2.)]);
        assert_eq!(vec![1, 3, 5, 7], rank_top_k(&t, 4));
    }

    #[test]
    fn test_rank_top_k_strategies_agree() {
        // 30 labels with heavy ties: k = 3 selects, k = 29 sorts. Both paths
        // must produce the same prefix.
        let pairs: Vec<(Label, f32)> = (0..30).map(|l| (l, (l % 5) as f32)).collect();
        let t = table(&pairs);
        let sorted = rank_top_k(&t, 29);
        for k in 1..=29 {
            assert_eq!(sorted[..k].to_vec(), rank_top_k(&t, k));
        }
    }

    #[test]
    fn test_invert_ranks() {
        let inv = invert_ranks(&[5, 2, NO_LABEL, NO_LABEL]);
        assert_eq!(2, inv.len());
        assert_eq!(Some(&1), inv.get(&5));
        assert_eq!(Some(&2), inv.get(&2));
    }

    #[test]
    fn test_ideal_dcg() {
        assert!(ideal_dcg(0).is_nan());
        assert_approx_eq!(1.0, ideal_dcg(1));
        assert_approx_eq!(1.0 + 1.0 / 3f32.log2(), ideal_dcg(2));
        assert_approx_eq!(
            1.0 + 1.0 / 3f32.log2() + 0.5,
            ideal_dcg(3)
        );
    }
}
