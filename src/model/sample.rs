use crate::data::Dataset;
use crate::{Feature, FeatureVec};
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A feature-sub-sampled view of one node's feature rows.
pub enum FeatureSample {
    /// All features kept; the node's own rows can be used as-is.
    Full,
    /// Rows rebuilt over the sampled feature subset.
    Subset(Vec<FeatureVec>),
}

/// A feature sub-sampler: derives a (possibly identity) feature-restricted
/// view of one node's rows, deterministically from the seed.
pub type FeatureSubSampler = fn(&[&FeatureVec], u64) -> FeatureSample;

/// Look up a feature sub-sampler by its registry name.
pub fn feature_sub_sampler(name: &str) -> Option<FeatureSubSampler> {
    match name {
        "none" => Some(sample_all_features),
        "sqrt" => Some(sample_sqrt_features),
        _ => None,
    }
}

fn sample_all_features(_rows: &[&FeatureVec], _seed: u64) -> FeatureSample {
    FeatureSample::Full
}

/// Keep floor(sqrt(J)) of the J features used by the rows, drawn without
/// replacement.
fn sample_sqrt_features(rows: &[&FeatureVec], seed: u64) -> FeatureSample {
    let mut used = HashSet::new();
    for xi in rows {
        for &(feature, _) in xi.iter() {
            used.insert(feature);
        }
    }
    let max_j = (used.len() as f32).sqrt() as usize;
    let mut features: Vec<Feature> = used.into_iter().collect();
    // Hash-set iteration order is arbitrary; sort before drawing so the
    // sample depends only on the seed.
    features.sort_unstable();
    let mut rng = StdRng::seed_from_u64(seed);
    for j in 0..max_j {
        let j_ = j + rng.gen_range(0..features.len() - j);
        features.swap(j, j_);
    }
    features.truncate(max_j);
    let kept: HashSet<Feature> = features.into_iter().collect();
    FeatureSample::Subset(
        rows.iter()
            .map(|xi| {
                xi.iter()
                    .filter(|(feature, _)| kept.contains(feature))
                    .cloned()
                    .collect()
            })
            .collect(),
    )
}

/// An entry sub-sampler drawing the per-tree training subset.
pub trait DatasetEntrySubSampler: Sync {
    /// The entry indices contained in the sub-sample with the given seed.
    fn sub_sample(&self, dataset: &Dataset, seed: u64) -> Vec<usize>;
}

/// Deterministic entry sub-sampler: returns consecutive blocks of the given
/// size in dataset order, the seed selecting the block.
pub struct DeterministicEntrySubSampler {
    n: usize,
}

impl DeterministicEntrySubSampler {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl DatasetEntrySubSampler for DeterministicEntrySubSampler {
    fn sub_sample(&self, dataset: &Dataset, seed: u64) -> Vec<usize> {
        if dataset.size() == 0 {
            return Vec::new();
        }
        let max_seed = (dataset.size() + self.n - 1) / self.n;
        let start = (seed as usize % max_seed) * self.n;
        let end = (start + self.n).min(dataset.size());
        (start..end).collect()
    }
}

/// Random entry sub-sampler: draws the given number of entries with
/// replacement, the seed seeding the generator.
pub struct RandomEntrySubSampler {
    n: usize,
}

impl RandomEntrySubSampler {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl DatasetEntrySubSampler for RandomEntrySubSampler {
    fn sub_sample(&self, dataset: &Dataset, seed: u64) -> Vec<usize> {
        if dataset.size() == 0 {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        (0..self.n)
            .map(|_| rng.gen_range(0..dataset.size()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(features: &[FeatureVec]) -> Vec<&FeatureVec> {
        features.iter().collect()
    }

    fn dataset(n: usize) -> Dataset {
        Dataset {
            features: (0..n).map(|i| vec![(i as Feature, 1.0)]).collect(),
            labels: (0..n).map(|i| vec![i as u32]).collect(),
        }
    }

    #[test]
    fn test_feature_sub_sampler_lookup() {
        assert!(feature_sub_sampler("none").is_some());
        assert!(feature_sub_sampler("sqrt").is_some());
        assert!(feature_sub_sampler("bogus").is_none());
    }

    #[test]
    fn test_sample_all_features() {
        let features = vec![vec![(0, 1.0)], vec![(1, 2.0)]];
        assert!(matches!(
            sample_all_features(&rows(&features), 42),
            FeatureSample::Full
        ));
    }

    #[test]
    fn test_sample_sqrt_features() {
        // 9 distinct features, one per row, so exactly 3 survive.
        let features: Vec<FeatureVec> = (0..9).map(|f| vec![(f, 1.0)]).collect();
        let sampled = match sample_sqrt_features(&rows(&features), 42) {
            FeatureSample::Subset(sampled) => sampled,
            FeatureSample::Full => panic!("sqrt sampling returns an explicit subset"),
        };
        assert_eq!(9, sampled.len());
        let n_kept: usize = sampled.iter().map(|xi| xi.len()).sum();
        assert_eq!(3, n_kept);
        // Same seed, same subset; surviving rows keep their pairs intact.
        match sample_sqrt_features(&rows(&features), 42) {
            FeatureSample::Subset(again) => assert_eq!(sampled, again),
            FeatureSample::Full => panic!("sqrt sampling returns an explicit subset"),
        }
        for (xi, orig) in sampled.iter().zip(&features) {
            assert!(xi.is_empty() || xi == orig);
        }
    }

    #[test]
    fn test_sample_sqrt_features_no_features() {
        let features = vec![FeatureVec::new(), FeatureVec::new()];
        match sample_sqrt_features(&rows(&features), 0) {
            FeatureSample::Subset(sampled) => {
                assert_eq!(vec![FeatureVec::new(), FeatureVec::new()], sampled)
            }
            FeatureSample::Full => panic!("sqrt sampling returns an explicit subset"),
        }
    }

    #[test]
    fn test_deterministic_entry_sub_sampler() {
        let ds = dataset(10);
        let sampler = DeterministicEntrySubSampler::new(4);
        assert_eq!(vec![0, 1, 2, 3], sampler.sub_sample(&ds, 0));
        assert_eq!(vec![4, 5, 6, 7], sampler.sub_sample(&ds, 1));
        // The last block is truncated at the dataset size.
        assert_eq!(vec![8, 9], sampler.sub_sample(&ds, 2));
        // Seeds wrap around the block count.
        assert_eq!(vec![0, 1, 2, 3], sampler.sub_sample(&ds, 3));
        assert!(sampler.sub_sample(&dataset(0), 0).is_empty());
    }

    #[test]
    fn test_random_entry_sub_sampler() {
        let ds = dataset(10);
        let sampler = RandomEntrySubSampler::new(16);
        let indices = sampler.sub_sample(&ds, 7);
        assert_eq!(16, indices.len());
        assert!(indices.iter().all(|&i| i < 10));
        assert_eq!(indices, sampler.sub_sample(&ds, 7));
        assert_ne!(indices, sampler.sub_sample(&ds, 8));
        assert!(sampler.sub_sample(&dataset(0), 0).is_empty());
    }
}
