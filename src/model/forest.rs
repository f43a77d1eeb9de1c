use crate::data::Dataset;
use crate::model::sample::DatasetEntrySubSampler;
use crate::model::tree::{train_label_tree, LabelTree};
use crate::model::{TrainError, TreeParams};
use crate::rank::rank_top_k;
use crate::{Feature, FeatureVec, Label, LabelFreqTable, LeafId};
use hashbrown::HashMap;
use log::{debug, error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Histograms over the per-tree sub-samples: how many sampled trees touched
/// each training entry, feature occurrence and label occurrence, keyed by
/// that count. Bucket 0 holds the never-touched remainder. Diagnostics only;
/// prediction never reads them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForestSummary {
    pub data_hist: HashMap<u64, u64>,
    pub feature_hist: HashMap<u64, u64>,
    pub label_hist: HashMap<u64, u64>,
}

/// An ensemble of label trees trained on independent entry sub-samples,
/// in the lineage of FastXML (Prabhu+ 2014).
///
/// References:
///
/// (Prabhu+ 2014) Y. Prabhu, and M. Varma. "FastXML: A Fast, Accurate and
/// Stable Tree-Classifier for Extreme Multi-Label Learning." Proceedings of
/// the 20th ACM SIGKDD International Conference on Knowledge Discovery and
/// Data Mining, pp. 263--272, 2014.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelForest {
    /// The parameters every tree was trained with.
    pub params: TreeParams,
    pub trees: Vec<LabelTree>,
    pub summary: ForestSummary,
}

/// Counters of how often each entry index, feature and label occurred across
/// the drawn sub-samples. The only mutable state shared between workers.
#[derive(Default)]
struct OccurrenceCounts {
    data: HashMap<usize, u64>,
    features: HashMap<Feature, u64>,
    labels: HashMap<Label, u64>,
}

/// Train a label forest of `n_trees` trees concurrently.
///
/// A pool of `n_workers` workers (0 meaning the available parallelism)
/// claims tree indices dynamically, so unequal induction costs stay
/// load-balanced. Tree `t` is trained with seed `t << 48` on the entry
/// sub-sample drawn with seed `t`. The build is all-or-nothing: the first
/// tree failure is kept, later-dispatched workers skip their work, and the
/// error is returned once every worker has drained.
pub fn train_label_forest(
    dataset: &Dataset,
    n_trees: usize,
    sub_sampler: &dyn DatasetEntrySubSampler,
    params: &TreeParams,
    n_workers: usize,
) -> Result<LabelForest, TrainError> {
    let n_workers = if n_workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        n_workers
    };
    info!("training {} tree(s) with {} worker(s)", n_trees, n_workers);

    let counts = Mutex::new(OccurrenceCounts::default());
    let first_err: RwLock<Option<TrainError>> = RwLock::new(None);
    let next_tree = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<LabelTree>>> = (0..n_trees).map(|_| Mutex::new(None)).collect();

    rayon::scope(|scope| {
        for _ in 0..n_workers {
            scope.spawn(|_| loop {
                let t = next_tree.fetch_add(1, Ordering::SeqCst);
                if t >= n_trees {
                    break;
                }
                if first_err.read().unwrap().is_some() {
                    debug!("skipping tree #{} after an earlier failure", t);
                    continue;
                }
                debug!("training tree #{} ...", t);
                let indices = sub_sampler.sub_sample(dataset, t as u64);
                let sub_dataset = dataset.sub_set(&indices);
                {
                    let mut counts = counts.lock().unwrap();
                    for &i in &indices {
                        *counts.data.entry(i).or_insert(0) += 1;
                    }
                    for xi in &sub_dataset.features {
                        for &(feature, _) in xi {
                            *counts.features.entry(feature).or_insert(0) += 1;
                        }
                    }
                    for yi in &sub_dataset.labels {
                        for &label in yi {
                            *counts.labels.entry(label).or_insert(0) += 1;
                        }
                    }
                }
                match train_label_tree(&sub_dataset, params, (t as u64) << 48) {
                    Ok(tree) => {
                        *slots[t].lock().unwrap() = Some(tree);
                        debug!("trained tree #{}", t);
                    }
                    Err(source) => {
                        let err = TrainError::Tree {
                            tree_index: t,
                            source: Box::new(source),
                        };
                        error!("{}", err);
                        let mut cell = first_err.write().unwrap();
                        if cell.is_none() {
                            *cell = Some(err);
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = first_err.into_inner().unwrap() {
        return Err(err);
    }

    info!("building the sub-sampling summary ...");
    let counts = counts.into_inner().unwrap();
    let mut summary = ForestSummary::default();
    for &count in counts.data.values() {
        *summary.data_hist.entry(count).or_insert(0) += 1;
    }
    summary
        .data_hist
        .insert(0, (dataset.size() - counts.data.len()) as u64);
    for &count in counts.features.values() {
        *summary.feature_hist.entry(count).or_insert(0) += 1;
    }
    summary
        .feature_hist
        .insert(0, (dataset.feature_dim() - counts.features.len()) as u64);
    for &count in counts.labels.values() {
        *summary.label_hist.entry(count).or_insert(0) += 1;
    }
    summary
        .label_hist
        .insert(0, (dataset.label_dim() - counts.labels.len()) as u64);

    let trees = slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .unwrap()
                .expect("every tree slot is filled on success")
        })
        .collect();
    Ok(LabelForest {
        params: params.clone(),
        trees,
        summary,
    })
}

impl LabelForest {
    /// The per-tree terminal leaf ids for the given feature vector.
    pub fn classify(&self, x: &[(Feature, f32)]) -> Vec<LeafId> {
        self.trees.iter().map(|tree| tree.classify(x)).collect()
    }

    /// The per-tree terminal leaf ids and path weights for the given feature
    /// vector.
    pub fn classify_with_weight(&self, x: &[(Feature, f32)]) -> (Vec<LeafId>, Vec<f32>) {
        self.trees
            .iter()
            .map(|tree| tree.classify_with_weight(x))
            .unzip()
    }

    pub fn classify_all(&self, xs: &[FeatureVec]) -> Vec<Vec<LeafId>> {
        xs.iter().map(|x| self.classify(x)).collect()
    }

    pub fn classify_all_with_weight(&self, xs: &[FeatureVec]) -> (Vec<Vec<LeafId>>, Vec<Vec<f32>>) {
        xs.iter().map(|x| self.classify_with_weight(x)).unzip()
    }

    /// The top-K labels under the sum of each tree's normalized leaf label
    /// distribution. Summation is order-independent, so trees contribute
    /// commutatively.
    pub fn predict(&self, leaf_ids: &[LeafId], k: usize) -> Vec<Label> {
        self.predict_dist(leaf_ids, |_| 1.0, k)
    }

    /// As `predict`, but each tree's contribution is scaled by its path
    /// weight.
    pub fn predict_with_weight(&self, leaf_ids: &[LeafId], weights: &[f32], k: usize) -> Vec<Label> {
        self.predict_dist(leaf_ids, |tree_index| weights[tree_index], k)
    }

    fn predict_dist(
        &self,
        leaf_ids: &[LeafId],
        tree_weight: impl Fn(usize) -> f32,
        k: usize,
    ) -> Vec<Label> {
        let mut label_dist = LabelFreqTable::new();
        for (tree_index, (tree, &leaf_id)) in self.trees.iter().zip(leaf_ids).enumerate() {
            if let Some(label_freq) = tree.label_freqs.get(&leaf_id) {
                let z: f32 = label_freq.values().sum();
                for (&label, &freq) in label_freq {
                    *label_dist.entry(label).or_insert(0.0) += freq / z * tree_weight(tree_index);
                }
            }
        }
        rank_top_k(&label_dist, k)
    }

    pub fn predict_all(&self, leaf_ids_slice: &[Vec<LeafId>], k: usize) -> Vec<Vec<Label>> {
        leaf_ids_slice
            .iter()
            .map(|leaf_ids| self.predict(leaf_ids, k))
            .collect()
    }

    pub fn predict_all_with_weight(
        &self,
        leaf_ids_slice: &[Vec<LeafId>],
        weights_slice: &[Vec<f32>],
        k: usize,
    ) -> Vec<Vec<Label>> {
        leaf_ids_slice
            .iter()
            .zip(weights_slice)
            .map(|(leaf_ids, weights)| self.predict_with_weight(leaf_ids, weights, k))
            .collect()
    }
}
