//! Bit-exact binary serialization for label trees and forests.
//!
//! Trees are written in a fixed pre-order over the leaves that exist: every
//! visited leaf contributes one flags byte announcing which components and
//! children are present, then each present component in flag order. Absent
//! subtrees cost nothing, so the encoding grows with the realized tree shape
//! rather than with `2^depth`. Decoding mirrors the traversal exactly and
//! never exposes a partial structure on error.
//!
//! All scalars are little-endian; map entries are sorted before writing so
//! the bytes never depend on map iteration order.

use crate::linear::{BinaryClassifier, SplitStats};
use crate::model::forest::{ForestSummary, LabelForest};
use crate::model::tree::{
    leaf_overflows, left_child, right_child, LabelTree, NodeSummary, SupportEntry, ROOT_LEAF,
};
use crate::model::TreeParams;
use crate::{FeatureVec, Label, LabelFreqTable, LabelVec, LeafId};
use hashbrown::HashMap;
use itertools::Itertools;
use std::io::{Read, Result, Write};
use thiserror::Error;

/// Magic bytes identifying a label-forest model file.
pub const MAGIC: &[u8; 4] = b"KZLF";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

const HAS_SPLITTER: u8 = 1 << 0;
const HAS_LABEL_FREQ: u8 = 1 << 1;
const HAS_SUMMARY: u8 = 1 << 2;
const HAS_LEFT: u8 = 1 << 3;
const HAS_RIGHT: u8 = 1 << 4;
const KNOWN_FLAGS: u8 = HAS_SPLITTER | HAS_LABEL_FREQ | HAS_SUMMARY | HAS_LEFT | HAS_RIGHT;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a label-forest model file")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("leaf {leaf_id:#x}: unknown bits in node header {flags:#04x}")]
    InvalidNodeHeader { leaf_id: LeafId, flags: u8 },
    #[error("leaf {leaf_id:#x}: malformed {what}")]
    InvalidComponent { leaf_id: LeafId, what: &'static str },
    #[error("tree height cannot exceed 63 splits (leaf id {leaf_id:#x})")]
    HeightOverflow { leaf_id: LeafId },
    #[error("malformed tree parameters: {0}")]
    BadParams(String),
}

fn write_u8<W: Write>(writer: &mut W, v: u8) -> Result<()> {
    writer.write_all(&[v])
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, v: u64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())
}

fn write_f32<W: Write>(writer: &mut W, v: f32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())
}

fn write_bool<W: Write>(writer: &mut W, v: bool) -> Result<()> {
    write_u8(writer, v as u8)
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    write_u32(writer, s.len() as u32)?;
    writer.write_all(s.as_bytes())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> std::result::Result<String, DecodeError> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| DecodeError::BadParams(e.to_string()))
}

fn write_index_value_pairs<W: Write>(writer: &mut W, pairs: &[(u32, f32)]) -> Result<()> {
    write_u32(writer, pairs.len() as u32)?;
    for &(index, value) in pairs {
        write_u32(writer, index)?;
        write_f32(writer, value)?;
    }
    Ok(())
}

fn read_index_value_pairs<R: Read>(
    reader: &mut R,
    leaf_id: LeafId,
    what: &'static str,
) -> std::result::Result<Vec<(u32, f32)>, DecodeError> {
    let len = read_u32(reader)? as usize;
    let mut pairs = Vec::with_capacity(len);
    for _ in 0..len {
        let index = read_u32(reader)?;
        let value = read_f32(reader)?;
        if let Some(&(prev, _)) = pairs.last() {
            if index <= prev {
                return Err(DecodeError::InvalidComponent { leaf_id, what });
            }
        }
        pairs.push((index, value));
    }
    Ok(pairs)
}

fn read_bool<R: Read>(
    reader: &mut R,
    leaf_id: LeafId,
    what: &'static str,
) -> std::result::Result<bool, DecodeError> {
    match read_u8(reader)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::InvalidComponent { leaf_id, what }),
    }
}

fn write_splitter<W: Write>(writer: &mut W, splitter: &BinaryClassifier) -> Result<()> {
    write_f32(writer, splitter.bias)?;
    write_index_value_pairs(writer, &splitter.weights)
}

fn read_splitter<R: Read>(
    reader: &mut R,
    leaf_id: LeafId,
) -> std::result::Result<BinaryClassifier, DecodeError> {
    let bias = read_f32(reader)?;
    let weights: FeatureVec = read_index_value_pairs(reader, leaf_id, "splitter weights")?;
    Ok(BinaryClassifier { bias, weights })
}

fn write_label_freq<W: Write>(writer: &mut W, label_freq: &LabelFreqTable) -> Result<()> {
    let pairs: Vec<(Label, f32)> = label_freq
        .iter()
        .map(|(&label, &freq)| (label, freq))
        .sorted_by_key(|&(label, _)| label)
        .collect();
    write_index_value_pairs(writer, &pairs)
}

fn read_label_freq<R: Read>(
    reader: &mut R,
    leaf_id: LeafId,
) -> std::result::Result<LabelFreqTable, DecodeError> {
    let pairs = read_index_value_pairs(reader, leaf_id, "label-frequency table")?;
    Ok(pairs.into_iter().collect())
}

fn write_summary<W: Write>(writer: &mut W, summary: &NodeSummary) -> Result<()> {
    let stats = &summary.split_stats;
    write_u64(writer, stats.true_neg)?;
    write_u64(writer, stats.false_neg)?;
    write_u64(writer, stats.false_pos)?;
    write_u64(writer, stats.true_pos)?;
    write_bool(writer, summary.support_entries.is_some())?;
    if let Some(entries) = &summary.support_entries {
        write_u32(writer, entries.len() as u32)?;
        for entry in entries {
            write_f32(writer, entry.coef)?;
            write_bool(writer, entry.assigned_right)?;
            write_index_value_pairs(writer, &entry.features)?;
            write_u32(writer, entry.labels.len() as u32)?;
            for &label in &entry.labels {
                write_u32(writer, label)?;
            }
        }
    }
    Ok(())
}

fn read_summary<R: Read>(
    reader: &mut R,
    leaf_id: LeafId,
) -> std::result::Result<NodeSummary, DecodeError> {
    let split_stats = SplitStats {
        true_neg: read_u64(reader)?,
        false_neg: read_u64(reader)?,
        false_pos: read_u64(reader)?,
        true_pos: read_u64(reader)?,
    };
    let support_entries = if read_bool(reader, leaf_id, "summary presence byte")? {
        let len = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let coef = read_f32(reader)?;
            let assigned_right = read_bool(reader, leaf_id, "support-entry side byte")?;
            let features = read_index_value_pairs(reader, leaf_id, "support-entry features")?;
            let n_labels = read_u32(reader)? as usize;
            let mut labels = LabelVec::with_capacity(n_labels);
            for _ in 0..n_labels {
                labels.push(read_u32(reader)?);
            }
            entries.push(SupportEntry {
                coef,
                features,
                labels,
                assigned_right,
            });
        }
        Some(entries)
    } else {
        None
    };
    Ok(NodeSummary {
        split_stats,
        support_entries,
    })
}

/// Encode a label tree in the sparse pre-order format.
pub fn encode_tree<W: Write>(tree: &LabelTree, writer: &mut W) -> Result<()> {
    let mut stack = vec![ROOT_LEAF];
    while let Some(leaf_id) = stack.pop() {
        let splitter = tree.splitters.get(&leaf_id);
        let label_freq = tree.label_freqs.get(&leaf_id);
        let summary = tree.summaries.get(&leaf_id);
        let has_left = tree.label_freqs.contains_key(&left_child(leaf_id));
        let has_right = tree.label_freqs.contains_key(&right_child(leaf_id));
        let mut flags = 0u8;
        if splitter.is_some() {
            flags |= HAS_SPLITTER;
        }
        if label_freq.is_some() {
            flags |= HAS_LABEL_FREQ;
        }
        if summary.is_some() {
            flags |= HAS_SUMMARY;
        }
        if has_left {
            flags |= HAS_LEFT;
        }
        if has_right {
            flags |= HAS_RIGHT;
        }
        write_u8(writer, flags)?;
        if let Some(splitter) = splitter {
            write_splitter(writer, splitter)?;
        }
        if let Some(label_freq) = label_freq {
            write_label_freq(writer, label_freq)?;
        }
        if let Some(summary) = summary {
            write_summary(writer, summary)?;
        }
        if has_left {
            stack.push(left_child(leaf_id));
        }
        if has_right {
            stack.push(right_child(leaf_id));
        }
    }
    Ok(())
}

/// Decode a label tree from the sparse pre-order format.
pub fn decode_tree<R: Read>(reader: &mut R) -> std::result::Result<LabelTree, DecodeError> {
    let mut tree = LabelTree::default();
    let mut stack = vec![ROOT_LEAF];
    while let Some(leaf_id) = stack.pop() {
        let flags = read_u8(reader)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::InvalidNodeHeader { leaf_id, flags });
        }
        if flags & HAS_SPLITTER != 0 {
            tree.splitters.insert(leaf_id, read_splitter(reader, leaf_id)?);
        }
        if flags & HAS_LABEL_FREQ != 0 {
            tree.label_freqs
                .insert(leaf_id, read_label_freq(reader, leaf_id)?);
        }
        if flags & HAS_SUMMARY != 0 {
            tree.summaries.insert(leaf_id, read_summary(reader, leaf_id)?);
        }
        if leaf_overflows(leaf_id) {
            return Err(DecodeError::HeightOverflow { leaf_id });
        }
        if flags & HAS_LEFT != 0 {
            stack.push(left_child(leaf_id));
        }
        if flags & HAS_RIGHT != 0 {
            stack.push(right_child(leaf_id));
        }
    }
    Ok(tree)
}

fn write_params<W: Write>(writer: &mut W, params: &TreeParams) -> Result<()> {
    write_str(writer, &params.assigner)?;
    write_str(writer, &params.assign_initializer)?;
    write_str(writer, &params.classifier_trainer)?;
    write_f32(writer, params.c)?;
    write_f32(writer, params.epsilon)?;
    write_str(writer, &params.feature_sub_sampler)?;
    write_u64(writer, params.k as u64)?;
    write_u64(writer, params.max_entries_in_leaf as u64)?;
    write_u64(writer, params.supp_vec_k as u64)
}

fn read_params<R: Read>(reader: &mut R) -> std::result::Result<TreeParams, DecodeError> {
    Ok(TreeParams {
        assigner: read_string(reader)?,
        assign_initializer: read_string(reader)?,
        classifier_trainer: read_string(reader)?,
        c: read_f32(reader)?,
        epsilon: read_f32(reader)?,
        feature_sub_sampler: read_string(reader)?,
        k: read_u64(reader)? as usize,
        max_entries_in_leaf: read_u64(reader)? as usize,
        supp_vec_k: read_u64(reader)? as usize,
    })
}

fn write_histogram<W: Write>(writer: &mut W, histogram: &HashMap<u64, u64>) -> Result<()> {
    write_u64(writer, histogram.len() as u64)?;
    for (&bucket, &count) in histogram
        .iter()
        .sorted_by_key(|&(&bucket, _)| bucket)
    {
        write_u64(writer, bucket)?;
        write_u64(writer, count)?;
    }
    Ok(())
}

fn read_histogram<R: Read>(reader: &mut R) -> std::result::Result<HashMap<u64, u64>, DecodeError> {
    let len = read_u64(reader)? as usize;
    let mut histogram = HashMap::with_capacity(len);
    for _ in 0..len {
        let bucket = read_u64(reader)?;
        let count = read_u64(reader)?;
        histogram.insert(bucket, count);
    }
    Ok(histogram)
}

/// Encode a label forest: magic and version, the shared tree parameters, the
/// tree count, each tree, then the sub-sampling summary.
pub fn encode_forest<W: Write>(forest: &LabelForest, writer: &mut W) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u8(writer, FORMAT_VERSION)?;
    write_params(writer, &forest.params)?;
    write_u64(writer, forest.trees.len() as u64)?;
    for tree in &forest.trees {
        encode_tree(tree, writer)?;
    }
    write_histogram(writer, &forest.summary.data_hist)?;
    write_histogram(writer, &forest.summary.feature_hist)?;
    write_histogram(writer, &forest.summary.label_hist)
}

/// Decode a label forest.
pub fn decode_forest<R: Read>(reader: &mut R) -> std::result::Result<LabelForest, DecodeError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = read_u8(reader)?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let params = read_params(reader)?;
    let n_trees = read_u64(reader)? as usize;
    let mut trees = Vec::with_capacity(n_trees);
    for _ in 0..n_trees {
        trees.push(decode_tree(reader)?);
    }
    let summary = ForestSummary {
        data_hist: read_histogram(reader)?,
        feature_hist: read_histogram(reader)?,
        label_hist: read_histogram(reader)?,
    };
    Ok(LabelForest {
        params,
        trees,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample::DeterministicEntrySubSampler;
    use crate::model::{train_label_forest, train_label_tree};
    use crate::rank::NO_LABEL;
    use crate::Dataset;

    fn freq(pairs: &[(Label, f32)]) -> LabelFreqTable {
        pairs.iter().cloned().collect()
    }

    fn roundtrip_tree(tree: &LabelTree) -> LabelTree {
        let mut buf = Vec::new();
        encode_tree(tree, &mut buf).unwrap();
        let decoded = decode_tree(&mut buf.as_slice()).unwrap();
        // Re-encoding the decoded tree reproduces the bytes exactly.
        let mut buf2 = Vec::new();
        encode_tree(&decoded, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
        decoded
    }

    #[test]
    fn test_tree_roundtrip_single_leaf() {
        let mut tree = LabelTree::default();
        tree.label_freqs.insert(0x1, freq(&[(0, 3.), (7, 1.)]));
        assert_eq!(tree, roundtrip_tree(&tree));

        // Even a tree with an empty root table survives.
        let mut empty = LabelTree::default();
        empty.label_freqs.insert(0x1, LabelFreqTable::new());
        assert_eq!(empty, roundtrip_tree(&empty));
    }

    #[test]
    fn test_tree_roundtrip_with_splits() {
        let mut tree = LabelTree::default();
        tree.splitters.insert(
            0x1,
            BinaryClassifier {
                bias: -0.25,
                weights: vec![(0, 1.0), (5, -2.0)],
            },
        );
        tree.splitters.insert(
            0x3,
            BinaryClassifier {
                bias: 0.5,
                weights: vec![(2, 0.75)],
            },
        );
        tree.label_freqs.insert(0x1, freq(&[(0, 4.), (1, 2.)]));
        tree.label_freqs.insert(0x2, freq(&[(0, 2.)]));
        tree.label_freqs.insert(0x3, freq(&[(1, 2.), (2, 2.)]));
        tree.label_freqs.insert(0x6, freq(&[(1, 2.)]));
        tree.label_freqs.insert(0x7, freq(&[(2, 2.)]));
        tree.summaries.insert(
            0x1,
            NodeSummary {
                split_stats: SplitStats {
                    true_neg: 2,
                    false_neg: 0,
                    false_pos: 1,
                    true_pos: 3,
                },
                support_entries: Some(vec![
                    SupportEntry {
                        coef: 0.75,
                        features: vec![(0, 1.0), (5, 0.5)],
                        labels: vec![0, 1],
                        assigned_right: true,
                    },
                    SupportEntry {
                        coef: 0.25,
                        features: vec![],
                        labels: vec![2],
                        assigned_right: false,
                    },
                ]),
            },
        );
        tree.summaries.insert(
            0x3,
            NodeSummary {
                split_stats: SplitStats::default(),
                support_entries: None,
            },
        );
        assert_eq!(tree, roundtrip_tree(&tree));
    }

    #[test]
    fn test_tree_roundtrip_trained() {
        let mut dataset = Dataset::default();
        for _ in 0..50 {
            dataset.features.push(vec![(0, 1.0)]);
            dataset.features.push(vec![(0, -1.0)]);
            dataset.labels.push(vec![0, 2]);
            dataset.labels.push(vec![1, 3]);
        }
        let params = TreeParams {
            assigner: "greedy_bottom_ranks".to_owned(),
            classifier_trainer: "l1svc_dual_cd".to_owned(),
            max_entries_in_leaf: 50,
            ..TreeParams::default()
        };
        let tree = train_label_tree(&dataset, &params, 0).unwrap();
        assert!(!tree.splitters.is_empty());
        assert_eq!(tree, roundtrip_tree(&tree));
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let err = decode_tree(&mut [0xe0u8].as_slice()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidNodeHeader { leaf_id: 0x1, flags: 0xe0 }
        ));
    }

    #[test]
    fn test_decode_rejects_unsorted_weights() {
        let mut tree = LabelTree::default();
        tree.splitters.insert(
            0x1,
            BinaryClassifier {
                bias: 0.0,
                weights: vec![(1, 1.0), (2, 2.0)],
            },
        );
        tree.label_freqs.insert(0x1, freq(&[(0, 1.)]));
        tree.label_freqs.insert(0x2, freq(&[(0, 1.)]));
        tree.label_freqs.insert(0x3, freq(&[(0, 1.)]));
        let mut buf = Vec::new();
        encode_tree(&tree, &mut buf).unwrap();
        // The weight ids sit at offsets 9 and 17, after the flags byte, the
        // bias and the pair count; swapping them breaks the
        // strictly-ascending requirement.
        buf[9..13].copy_from_slice(&2u32.to_le_bytes());
        buf[17..21].copy_from_slice(&1u32.to_le_bytes());
        let err = decode_tree(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidComponent {
                leaf_id: 0x1,
                what: "splitter weights",
            }
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut tree = LabelTree::default();
        tree.label_freqs.insert(0x1, freq(&[(0, 1.), (1, 2.)]));
        let mut buf = Vec::new();
        encode_tree(&tree, &mut buf).unwrap();
        for len in 0..buf.len() {
            assert!(decode_tree(&mut &buf[..len]).is_err());
        }
    }

    fn sample_forest() -> LabelForest {
        let mut dataset = Dataset::default();
        for block in 0..2u32 {
            for _ in 0..10 {
                dataset.features.push(vec![(0, 0.0)]);
                dataset.labels.push(vec![block]);
            }
        }
        let sub_sampler = DeterministicEntrySubSampler::new(10);
        train_label_forest(&dataset, 2, &sub_sampler, &TreeParams::default(), 1).unwrap()
    }

    #[test]
    fn test_forest_roundtrip() {
        let forest = sample_forest();
        let mut buf = Vec::new();
        encode_forest(&forest, &mut buf).unwrap();
        let decoded = decode_forest(&mut buf.as_slice()).unwrap();
        assert_eq!(forest, decoded);
        let mut buf2 = Vec::new();
        encode_forest(&decoded, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn test_forest_decode_rejects_bad_magic() {
        let forest = sample_forest();
        let mut buf = Vec::new();
        encode_forest(&forest, &mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            decode_forest(&mut buf.as_slice()).unwrap_err(),
            DecodeError::BadMagic
        ));
    }

    #[test]
    fn test_forest_decode_rejects_unsupported_version() {
        let forest = sample_forest();
        let mut buf = Vec::new();
        encode_forest(&forest, &mut buf).unwrap();
        buf[4] = FORMAT_VERSION + 1;
        assert!(matches!(
            decode_forest(&mut buf.as_slice()).unwrap_err(),
            DecodeError::UnsupportedVersion(v) if v == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn test_decoded_tables_never_hold_the_sentinel() {
        let forest = sample_forest();
        let mut buf = Vec::new();
        encode_forest(&forest, &mut buf).unwrap();
        let decoded = decode_forest(&mut buf.as_slice()).unwrap();
        for tree in &decoded.trees {
            for table in tree.label_freqs.values() {
                assert!(!table.contains_key(&NO_LABEL));
            }
        }
    }

    #[test]
    fn test_decode_rejects_overflowed_leaf() {
        // A hand-built chain of right children descending 64 levels: every
        // record flags a label table and a right child until the id's top
        // bit is reached.
        let mut buf = Vec::new();
        for _ in 0..64 {
            buf.push(HAS_LABEL_FREQ | HAS_RIGHT);
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
        let err = decode_tree(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DecodeError::HeightOverflow { .. }));
    }
}
