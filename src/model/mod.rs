pub mod assign;
pub mod codec;
pub mod forest;
pub mod sample;
pub mod tree;

pub use codec::{decode_forest, decode_tree, encode_forest, encode_tree, DecodeError};
pub use forest::{train_label_forest, ForestSummary, LabelForest};
pub use sample::{
    DatasetEntrySubSampler, DeterministicEntrySubSampler, RandomEntrySubSampler,
};
pub use tree::{train_label_tree, LabelTree, NodeSummary, SupportEntry};

use crate::linear::ClassifierError;
use crate::LeafId;
use thiserror::Error;

/// Parameters shared by every tree in a label forest.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeParams {
    /// Registry name of the left/right assignment optimizer.
    pub assigner: String,
    /// Registry name of the left/right assignment initializer.
    pub assign_initializer: String,
    /// Registry name of the binary classifier trainer fitting each splitter.
    pub classifier_trainer: String,
    /// Inverse penalty parameter passed to the classifier trainer.
    pub c: f32,
    /// Convergence tolerance passed to the classifier trainer.
    pub epsilon: f32,
    /// Registry name of the per-node feature sub-sampler.
    pub feature_sub_sampler: String,
    /// Maximum number of labels kept in each leaf's frequency table.
    pub k: usize,
    /// Both sides of a split must keep at least this many entries for the
    /// children to be considered for further splitting.
    pub max_entries_in_leaf: usize,
    /// Maximum number of supporting entries kept in a split summary.
    pub supp_vec_k: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            assigner: "ndcg".to_owned(),
            assign_initializer: "uniform".to_owned(),
            classifier_trainer: "l1svc_primal_sgd".to_owned(),
            c: 1.0,
            epsilon: 0.01,
            feature_sub_sampler: "none".to_owned(),
            k: 20,
            max_entries_in_leaf: 100,
            supp_vec_k: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("unknown binary classifier trainer: {0}")]
    UnknownClassifierTrainer(String),
    #[error("unknown left/right assigner: {0}")]
    UnknownAssigner(String),
    #[error("unknown left/right assignment initializer: {0}")]
    UnknownAssignInitializer(String),
    #[error("unknown feature sub-sampler: {0}")]
    UnknownFeatureSubSampler(String),
    #[error("tree height cannot exceed 63 splits (leaf id {leaf_id:#x})")]
    HeightOverflow { leaf_id: LeafId },
    #[error("training the splitter at leaf {leaf_id:#x}: {source}")]
    Splitter {
        leaf_id: LeafId,
        source: ClassifierError,
    },
    #[error("training tree #{tree_index}: {source}")]
    Tree {
        tree_index: usize,
        source: Box<TrainError>,
    },
}
