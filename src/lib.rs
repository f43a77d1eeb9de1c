pub type Feature = u32;
pub type Label = u32;
pub type LeafId = u64;
pub type FeatureVec = Vec<(Feature, f32)>;
pub type LabelVec = Vec<Label>;
pub type LabelFreqTable = hashbrown::HashMap<Label, f32>;

pub mod data;
pub mod linear;
pub mod model;
pub mod rank;

pub use data::Dataset;
pub use model::{LabelForest, LabelTree, TrainError, TreeParams};
