use crate::{Feature, FeatureVec, Label, LabelVec};
use hashbrown::HashSet;
use itertools::Itertools;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, Error, ErrorKind, Result};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Instant;

pub trait IndexValuePairs: Deref<Target = [(Feature, f32)]> {
    fn is_valid_sparse_vec(&self, length: usize) -> bool {
        // If empty, always valid
        if self.is_empty() {
            return true;
        }
        // Check if:
        // - All indices are smaller than max index
        // - Pairs are sorted by indices
        // - There are no duplicate indices
        if self[0].0 as usize >= length {
            return false;
        }
        if self.len() > 1 {
            for ((i, _), (j, _)) in self.iter().skip(1).zip(self.iter()) {
                if *i as usize >= length || i <= j {
                    return false;
                }
            }
        }

        true
    }
}

impl<PairsT> IndexValuePairs for PairsT where PairsT: Deref<Target = [(Feature, f32)]> {}

pub trait IndexValuePairsMut: DerefMut<Target = [(Feature, f32)]> {
    fn sort_by_index(&mut self) {
        self.sort_unstable_by(|l, r| l.0.cmp(&r.0));
    }
}

impl<PairsT> IndexValuePairsMut for PairsT where PairsT: DerefMut<Target = [(Feature, f32)]> {}

/// Compute the inner product of two index-sorted sparse vectors, along with
/// the size of the intersection of their supports.
pub fn dot_count(x: &[(Feature, f32)], y: &[(Feature, f32)]) -> (f32, u32) {
    let (mut xi, mut yi) = (0, 0);
    let (mut d, mut count) = (0f32, 0u32);
    while xi < x.len() && yi < y.len() {
        if x[xi].0 == y[yi].0 {
            d += x[xi].1 * y[yi].1;
            count += 1;
            xi += 1;
            yi += 1;
        } else if x[xi].0 < y[yi].0 {
            xi += 1;
        } else {
            yi += 1;
        }
    }
    (d, count)
}

/// A collection of training entries, pairing one sparse feature vector with
/// one label vector per entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub features: Vec<FeatureVec>,
    pub labels: Vec<LabelVec>,
}

impl Dataset {
    pub fn size(&self) -> usize {
        self.features.len()
    }

    /// The number of feature columns, i.e. the largest feature id plus 1.
    pub fn feature_dim(&self) -> usize {
        self.features
            .iter()
            .flatten()
            .map(|&(feature, _)| feature as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// The number of label columns, i.e. the largest label id plus 1.
    pub fn label_dim(&self) -> usize {
        self.labels
            .iter()
            .flatten()
            .map(|&label| label as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Copy out the entries selected by the given indices, in order.
    /// Indices may repeat, e.g. when sub-sampling with replacement.
    pub fn sub_set(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i].clone()).collect(),
        }
    }

    /// Copy out the dataset restricted to the given feature columns.
    pub fn feature_sub_set(&self, features: &HashSet<Feature>) -> Dataset {
        Dataset {
            features: self
                .features
                .iter()
                .map(|xi| {
                    xi.iter()
                        .filter(|(feature, _)| features.contains(feature))
                        .cloned()
                        .collect()
                })
                .collect(),
            labels: self.labels.clone(),
        }
    }

    /// Parse a dataset in the plain-text format of the Extreme Classification
    /// Repository.
    ///
    /// The first line carries the numbers of entries, features and labels.
    /// Every other line encodes one entry as
    /// `label1,label2,...labelk ft1:ft1_val ft2:ft2_val ... ftd:ftd_val`.
    pub fn read_text<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();

        let (n_entries, n_features, n_labels) = {
            let header_line = lines.next().ok_or(ErrorKind::InvalidData)??;
            let tokens = header_line.split_whitespace().collect_vec();
            if tokens.len() != 3 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Expect header line with 3 space-separated tokens, found {} instead",
                        tokens.len()
                    ),
                ));
            }
            let n_entries = tokens[0]
                .parse::<usize>()
                .map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to parse entry count"))?;
            let n_features = tokens[1]
                .parse::<usize>()
                .map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to parse feature count"))?;
            let n_labels = tokens[2]
                .parse::<usize>()
                .map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to parse label count"))?;
            (n_entries, n_features, n_labels)
        };

        let mut dataset = Dataset {
            features: Vec::with_capacity(n_entries),
            labels: Vec::with_capacity(n_entries),
        };
        for line in lines {
            let line = line?;
            let (features, labels) = Self::parse_text_line(&line, n_features, n_labels)?;
            dataset.features.push(features);
            dataset.labels.push(labels);
        }

        if n_entries != dataset.size() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Expected {} entries, but read {}", n_entries, dataset.size()),
            ));
        }
        Ok(dataset)
    }

    /// Load a text-format dataset from the given path.
    pub fn load_text_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Loading data from {}", path.as_ref().display());
        let start_t = Instant::now();

        let dataset = Self::read_text(BufReader::new(File::open(path)?))?;

        info!(
            "Loaded {} entries; it took {:.2}s",
            dataset.size(),
            start_t.elapsed().as_secs_f64()
        );
        Ok(dataset)
    }

    fn parse_text_line(
        line: &str,
        n_features: usize,
        n_labels: usize,
    ) -> Result<(FeatureVec, LabelVec)> {
        let mut token_iter = line.split(' ');

        let mut labels = LabelVec::new();
        let labels_str = token_iter.next().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Failed to find labels in line \"{}\"", line),
            )
        })?;
        for label_str in labels_str.split(',') {
            if !label_str.is_empty() {
                let label = label_str.parse::<Label>().map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse label {} in line \"{}\"", label_str, line),
                    )
                })?;
                if label as usize >= n_labels {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Label {} is out of range in line \"{}\"", label, line),
                    ));
                }
                labels.push(label);
            }
        }

        let mut features = FeatureVec::new();
        for feature_value_pair_str in token_iter {
            let mut feature_value_pair_iter = feature_value_pair_str.split(':');
            let feature = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<Feature>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature {}", feature_value_pair_str),
                    )
                })?;
            let value = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<f32>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature value {}", feature_value_pair_str),
                    )
                })?;
            if feature_value_pair_iter.next().is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Failed to parse feature {}", feature_value_pair_str),
                ));
            }
            features.push((feature, value));
        }
        features.sort_by_index();
        if !features.is_valid_sparse_vec(n_features) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Feature vector is invalid in line \"{}\"", line),
            ));
        }

        Ok((features, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_is_valid_sparse_vec() {
        assert!(FeatureVec::new().is_valid_sparse_vec(0));
        assert!(FeatureVec::new().is_valid_sparse_vec(123));

        assert!(vec![(123, 123.)].is_valid_sparse_vec(124));
        assert!(!vec![(123, 123.)].is_valid_sparse_vec(123));

        assert!(vec![(1, 0.), (3, 0.), (5, 0.)].is_valid_sparse_vec(6));
        assert!(!vec![(1, 0.), (3, 0.), (5, 0.)].is_valid_sparse_vec(5));
        assert!(!vec![(1, 0.), (5, 0.), (3, 0.)].is_valid_sparse_vec(6));
        assert!(!vec![(1, 0.), (1, 1.)].is_valid_sparse_vec(6));
    }

    #[test]
    fn test_sort_by_index() {
        let mut pairs = vec![(1, 123.), (3, 321.), (2, 213.), (4, 432.)];
        pairs.sort_by_index();
        assert_eq!(vec![(1, 123.), (2, 213.), (3, 321.), (4, 432.)], pairs);
    }

    #[test]
    fn test_dot_count() {
        assert_eq!((0., 0), dot_count(&[], &[(0, 1.)]));
        assert_eq!(
            (2. * 3. + 10. * 3., 2),
            dot_count(
                &[(1, 2.), (4, 5.), (6, 3.), (7, 10.)],
                &[(1, 3.), (5, 5.), (7, 3.), (8, 10.), (10, 100.)],
            )
        );
        // Keys in the intersection count even when a value is zero.
        assert_eq!((0., 1), dot_count(&[(0, 0.)], &[(0, 1.)]));
    }

    #[test]
    fn test_parse_text_line() {
        assert_eq!(
            (vec![(21, 1.), (23, 2.), (24, 3.)], vec![11, 12]),
            Dataset::parse_text_line("11,12 21:1 23:2 24:3", 25, 13).unwrap()
        );
        assert!(Dataset::parse_text_line("11,12 21:1 23:2 24:3", 24, 13).is_err());
        assert!(Dataset::parse_text_line("11,13 21:1", 25, 13).is_err());
        assert!(Dataset::parse_text_line("11 21:1:9", 25, 13).is_err());
    }

    #[test]
    fn test_read_text() {
        let text = "3 4 3\n0,1 0:1 2:2.5\n2 1:1\n 3:-1\n";
        let dataset = Dataset::read_text(Cursor::new(text)).unwrap();
        assert_eq!(
            Dataset {
                features: vec![vec![(0, 1.), (2, 2.5)], vec![(1, 1.)], vec![(3, -1.)]],
                labels: vec![vec![0, 1], vec![2], vec![]],
            },
            dataset
        );
        assert_eq!(4, dataset.feature_dim());
        assert_eq!(3, dataset.label_dim());

        assert!(Dataset::read_text(Cursor::new("2 4 3\n0 0:1\n")).is_err());
        assert!(Dataset::read_text(Cursor::new("1 4\n0 0:1\n")).is_err());
    }

    #[test]
    fn test_sub_set() {
        let dataset = Dataset {
            features: vec![vec![(0, 1.)], vec![(1, 2.)], vec![(2, 3.)]],
            labels: vec![vec![0], vec![1], vec![2]],
        };
        assert_eq!(
            Dataset {
                features: vec![vec![(2, 3.)], vec![(0, 1.)], vec![(2, 3.)]],
                labels: vec![vec![2], vec![0], vec![2]],
            },
            dataset.sub_set(&[2, 0, 2])
        );
    }

    #[test]
    fn test_feature_sub_set() {
        let dataset = Dataset {
            features: vec![vec![(0, 1.), (1, 2.)], vec![(1, 2.), (2, 3.)]],
            labels: vec![vec![0], vec![1]],
        };
        let kept: HashSet<Feature> = [1].iter().cloned().collect();
        assert_eq!(
            Dataset {
                features: vec![vec![(1, 2.)], vec![(1, 2.)]],
                labels: vec![vec![0], vec![1]],
            },
            dataset.feature_sub_set(&kept)
        );
    }
}
