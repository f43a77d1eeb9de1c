use crate::data::Dataset;
use crate::linear::{
    classifier_trainer, BinaryClassifier, ClassifierTrainer, SplitStats, TrainedClassifier,
};
use crate::model::assign::{assign_initializer, assigner, AssignInitializer, Assigner};
use crate::model::sample::{feature_sub_sampler, FeatureSample, FeatureSubSampler};
use crate::model::{TrainError, TreeParams};
use crate::rank::rank_top_k;
use crate::{FeatureVec, Label, LabelFreqTable, LabelVec, LeafId};
use hashbrown::HashMap;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// The leaf id of the root of the implicit binary tree.
pub const ROOT_LEAF: LeafId = 0x1;

#[inline]
pub fn left_child(leaf_id: LeafId) -> LeafId {
    2 * leaf_id
}

#[inline]
pub fn right_child(leaf_id: LeafId) -> LeafId {
    2 * leaf_id + 1
}

/// A leaf id with the top bit set cannot address children: the implicit tree
/// is capped at 63 splits.
#[inline]
pub fn leaf_overflows(leaf_id: LeafId) -> bool {
    leaf_id >> 63 == 1
}

/// A supporting training entry captured from a dual solver's coefficients.
#[derive(Clone, Debug, PartialEq)]
pub struct SupportEntry {
    pub coef: f32,
    pub features: FeatureVec,
    /// The entry's labels, sorted.
    pub labels: LabelVec,
    /// The side the assignment optimizer put the entry on.
    pub assigned_right: bool,
}

/// Best-effort diagnostics recorded at each internal leaf; inspected by
/// tooling, never consulted by prediction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSummary {
    /// Confusion counts of the trained splitter against the optimizer's
    /// assignment.
    pub split_stats: SplitStats,
    /// Top supporting entries by dual coefficient, when the trainer exposed
    /// one.
    pub support_entries: Option<Vec<SupportEntry>>,
}

/// One tree of a label forest.
///
/// Leaves are addressed by the implicit scheme: the root is 1, the children
/// of `k` are `2k` and `2k+1`. A leaf is valid iff it has a label-frequency
/// table; a valid leaf with no splitter is terminal. The maps are sparse, so
/// absent subtrees cost nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelTree {
    /// The splitter deciding whether an entry goes left or right, present
    /// only at internal leaves.
    pub splitters: HashMap<LeafId, BinaryClassifier>,
    /// The label-frequency table of each valid leaf, truncated to the top-K
    /// labels seen in the training sub-dataset.
    pub label_freqs: HashMap<LeafId, LabelFreqTable>,
    /// Split diagnostics of internal leaves.
    pub summaries: HashMap<LeafId, NodeSummary>,
}

impl LabelTree {
    /// Whether the leaf id is backed by a label-frequency table.
    pub fn is_valid_leaf(&self, leaf_id: LeafId) -> bool {
        self.label_freqs.contains_key(&leaf_id)
    }

    /// Whether the leaf has no splitter, so classification stops there.
    pub fn is_terminal_leaf(&self, leaf_id: LeafId) -> bool {
        !self.splitters.contains_key(&leaf_id)
    }

    /// Route a feature vector down the tree and return the terminal leaf id.
    pub fn classify(&self, x: &[(u32, f32)]) -> LeafId {
        let mut leaf_id = ROOT_LEAF;
        while let Some(splitter) = self.splitters.get(&leaf_id) {
            leaf_id = if crate::linear::classify_to_binary(splitter.predict(x)) {
                right_child(leaf_id)
            } else {
                left_child(leaf_id)
            };
        }
        leaf_id
    }

    /// Route a feature vector down the tree and return the terminal leaf id
    /// together with the path weight: the minimum, over the splitters used,
    /// of the number of weight features shared with `x`. The weight only
    /// matters when aggregating over a forest.
    pub fn classify_with_weight(&self, x: &[(u32, f32)]) -> (LeafId, f32) {
        let (mut leaf_id, mut min_weight) = (ROOT_LEAF, f32::INFINITY);
        while let Some(splitter) = self.splitters.get(&leaf_id) {
            let (z, count) = splitter.predict_and_count(x);
            leaf_id = if crate::linear::classify_to_binary(z) {
                right_child(leaf_id)
            } else {
                left_child(leaf_id)
            };
            min_weight = min_weight.min(count as f32);
        }
        (leaf_id, min_weight)
    }

    pub fn classify_all(&self, xs: &[FeatureVec]) -> Vec<LeafId> {
        xs.iter().map(|x| self.classify(x)).collect()
    }

    pub fn classify_all_with_weight(&self, xs: &[FeatureVec]) -> (Vec<LeafId>, Vec<f32>) {
        xs.iter().map(|x| self.classify_with_weight(x)).unzip()
    }

    /// The top-K labels of the given leaf, under its label-frequency table
    /// normalized to sum to 1.
    pub fn predict(&self, leaf_id: LeafId, k: usize) -> Vec<Label> {
        let mut label_dist = LabelFreqTable::new();
        if let Some(label_freq) = self.label_freqs.get(&leaf_id) {
            let z: f32 = label_freq.values().sum();
            for (&label, &freq) in label_freq {
                *label_dist.entry(label).or_insert(0.0) += freq / z;
            }
        }
        rank_top_k(&label_dist, k)
    }

    pub fn predict_all(&self, leaf_ids: &[LeafId], k: usize) -> Vec<Vec<Label>> {
        leaf_ids.iter().map(|&id| self.predict(id, k)).collect()
    }
}

/// One node's slice of the training data. Feature rows are absent when the
/// parent's split left this side too small to subdivide further.
struct NodeData<'a> {
    features: Option<Vec<&'a FeatureVec>>,
    labels: Vec<&'a LabelVec>,
}

/// The collaborators named in the parameters, resolved once per tree.
struct Collaborators {
    trainer: ClassifierTrainer,
    initializer: AssignInitializer,
    assigner: Assigner,
    feature_sampler: FeatureSubSampler,
}

impl Collaborators {
    fn resolve(params: &TreeParams) -> Result<Self, TrainError> {
        Ok(Self {
            trainer: classifier_trainer(&params.classifier_trainer).ok_or_else(|| {
                TrainError::UnknownClassifierTrainer(params.classifier_trainer.clone())
            })?,
            initializer: assign_initializer(&params.assign_initializer).ok_or_else(|| {
                TrainError::UnknownAssignInitializer(params.assign_initializer.clone())
            })?,
            assigner: assigner(&params.assigner)
                .ok_or_else(|| TrainError::UnknownAssigner(params.assigner.clone()))?,
            feature_sampler: feature_sub_sampler(&params.feature_sub_sampler).ok_or_else(
                || TrainError::UnknownFeatureSubSampler(params.feature_sub_sampler.clone()),
            )?,
        })
    }
}

/// Train one label tree on the given dataset.
///
/// The 16 most significant bits of the seed identify the tree in debug logs;
/// per-leaf randomness derives from the remaining bits. Building is iterative
/// and depth-first: children are pushed right then left, so the left subtree
/// is induced first and the whole order is fixed by the seed.
pub fn train_label_tree(
    dataset: &Dataset,
    params: &TreeParams,
    seed: u64,
) -> Result<LabelTree, TrainError> {
    let collaborators = Collaborators::resolve(params)?;
    debug!(
        "train_label_tree(seed>>48={}): starting on {} entries",
        seed >> 48,
        dataset.size()
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = LabelTree::default();
    let root = NodeData {
        features: Some(dataset.features.iter().collect()),
        labels: dataset.labels.iter().collect(),
    };
    let mut stack = vec![(ROOT_LEAF, root)];
    while let Some((leaf_id, node)) = stack.pop() {
        let children = induce_node(
            &mut tree,
            leaf_id,
            node,
            params,
            &collaborators,
            seed,
            &mut rng,
        )?;
        if let Some((left, right)) = children {
            stack.push((right_child(leaf_id), right));
            stack.push((left_child(leaf_id), left));
        }
    }
    debug!("train_label_tree(seed>>48={}): finished", seed >> 48);
    Ok(tree)
}

/// Decide the fate of one leaf: record its label-frequency table, and either
/// stop (terminal) or train a splitter and hand back the two child
/// sub-datasets.
fn induce_node<'a>(
    tree: &mut LabelTree,
    leaf_id: LeafId,
    node: NodeData<'a>,
    params: &TreeParams,
    collaborators: &Collaborators,
    seed: u64,
    rng: &mut StdRng,
) -> Result<Option<(NodeData<'a>, NodeData<'a>)>, TrainError> {
    // The leaf keeps its top-K label-frequency table no matter what follows.
    let mut label_freq = LabelFreqTable::new();
    for yi in &node.labels {
        for &label in yi.iter() {
            *label_freq.entry(label).or_insert(0.0) += 1.0;
        }
    }
    let k = params.k.min(label_freq.len());
    let mut label_freq_top_k = LabelFreqTable::with_capacity(k);
    for &label in &rank_top_k(&label_freq, k) {
        label_freq_top_k.insert(label, label_freq[&label]);
    }
    tree.label_freqs.insert(leaf_id, label_freq_top_k);

    // A labels-only sub-dataset marks a side the parent's split left too
    // small for further subdivision: the leaf stays terminal.
    let features = match node.features {
        Some(features) => features,
        None => return Ok(None),
    };

    let sampled = (collaborators.feature_sampler)(&features, seed.wrapping_add(leaf_id));

    debug!(
        "train_label_tree(seed>>48={},leaf_id={:#b}): optimizing the left/right assignment of {} entries",
        seed >> 48,
        leaf_id,
        node.labels.len()
    );
    let mut delta = (collaborators.initializer)(&node.labels, params, rng);
    (collaborators.assigner)(&node.labels, &mut delta);
    let n_rights = delta.iter().filter(|&&d| d).count();
    if n_rights == 0 || n_rights == delta.len() {
        // Nothing to split.
        return Ok(None);
    }

    debug!(
        "train_label_tree(seed>>48={},leaf_id={:#b}): training the splitter: {} in left and {} in right",
        seed >> 48,
        leaf_id,
        delta.len() - n_rights,
        n_rights
    );
    let sampled_rows: Vec<&FeatureVec> = match &sampled {
        FeatureSample::Full => features.clone(),
        FeatureSample::Subset(rows) => rows.iter().collect(),
    };
    let TrainedClassifier {
        classifier: splitter,
        dual_coefs,
    } = (collaborators.trainer)(&sampled_rows, &delta, params.c, params.epsilon)
        .map_err(|source| TrainError::Splitter { leaf_id, source })?;

    // Re-score the full rows: the sub-sampled features may not realize the
    // same partition as the full feature set.
    let (split_stats, _, pred_delta) = splitter.report_performance(&features, &delta);
    let n_pred_rights = pred_delta.iter().filter(|&&d| d).count();
    if n_pred_rights == 0 || n_pred_rights == pred_delta.len() {
        return Ok(None);
    }
    let n_pred_lefts = pred_delta.len() - n_pred_rights;

    debug!(
        "train_label_tree(seed>>48={},leaf_id={:#b}): recording the split summary (TN={},FN={},FP={},TP={})",
        seed >> 48,
        leaf_id,
        split_stats.true_neg,
        split_stats.false_neg,
        split_stats.false_pos,
        split_stats.true_pos
    );
    // Dual coefficients are only worth a compact summary; they are dropped
    // here because keeping one per training entry is memory-expensive.
    let support_entries = dual_coefs.map(|coefs| {
        collect_support_entries(&features, &node.labels, &delta, &coefs, params.supp_vec_k)
    });
    tree.summaries.insert(
        leaf_id,
        NodeSummary {
            split_stats,
            support_entries,
        },
    );
    tree.splitters.insert(leaf_id, splitter);

    if leaf_overflows(leaf_id) {
        return Err(TrainError::HeightOverflow { leaf_id });
    }

    // Balance forcing: only when BOTH sides keep at least max_entries_in_leaf
    // rows do the children receive feature vectors; otherwise they carry
    // labels only and stop when visited.
    let keep_features = n_pred_lefts >= params.max_entries_in_leaf
        && n_pred_rights >= params.max_entries_in_leaf;
    let mut left = NodeData {
        features: keep_features.then(|| Vec::with_capacity(n_pred_lefts)),
        labels: Vec::with_capacity(n_pred_lefts),
    };
    let mut right = NodeData {
        features: keep_features.then(|| Vec::with_capacity(n_pred_rights)),
        labels: Vec::with_capacity(n_pred_rights),
    };
    for (i, &goes_right) in pred_delta.iter().enumerate() {
        let side = if goes_right { &mut right } else { &mut left };
        side.labels.push(node.labels[i]);
        if let Some(rows) = side.features.as_mut() {
            rows.push(features[i]);
        }
    }
    Ok(Some((left, right)))
}

/// The top entries by dual coefficient, ties broken by entry index.
fn collect_support_entries(
    features: &[&FeatureVec],
    labels: &[&LabelVec],
    delta: &[bool],
    coefs: &[f32],
    supp_vec_k: usize,
) -> Vec<SupportEntry> {
    let mut ranked: Vec<(usize, f32)> = coefs.iter().copied().enumerate().collect();
    ranked.sort_unstable_by(|l, r| {
        r.1.partial_cmp(&l.1)
            .unwrap()
            .then_with(|| l.0.cmp(&r.0))
    });
    ranked.truncate(supp_vec_k);
    ranked
        .into_iter()
        .map(|(i, coef)| {
            let mut entry_labels = labels[i].clone();
            entry_labels.sort_unstable();
            SupportEntry {
                coef,
                features: features[i].clone(),
                labels: entry_labels,
                assigned_right: delta[i],
            }
        })
        .collect()
}
