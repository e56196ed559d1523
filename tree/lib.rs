/*!
This crate evaluates ensembles of oblivious decision trees, the symmetric trees where every node at one depth tests the same split. Because of that symmetry a document's leaf is not found by walking from the root. Instead each level contributes one bit to the leaf index, and the bits for a whole block of documents can be computed with a few vectorizable loops.

Evaluation happens in three stages:

1. **Binarization**: Raw feature values are read through caller supplied accessors and turned into one byte per feature bucket and document. Float features and ctr features count how many borders they exceed, and one hot features record which candidate value they match. See [`binarize_features`](fn.binarize_features.html).
2. **Leaf indexes**: For each tree, every split compares a bucket byte with the split's border and the resulting bits are composed into a leaf index. See [`calc_indexes`](fn.calc_indexes.html).
3. **Accumulation**: The leaf values selected by the indexes are added into the caller's results. See [`TreeCalcer`](struct.TreeCalcer.html).

Documents are processed in blocks of [`BLOCK_SIZE`](constant.BLOCK_SIZE.html) so that a block's binary codes stay in cache while all trees are applied to it. [`calc_generic`](fn.calc_generic.html) evaluates a tree range once, [`FeatureCachedTreeEvaluator`](struct.FeatureCachedTreeEvaluator.html) keeps the binary codes of a fixed document set around for repeated evaluations, and [`calc_tree_intervals_generic`](fn.calc_tree_intervals_generic.html) produces staged predictions.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod binarize;
mod cached;
mod calc;
mod calc_trees;
mod ctr;
mod error;
mod intervals;
mod model;
mod parallel;
mod predict;
#[cfg(test)]
mod testing;

pub use self::binarize::{binarize_features, BinarizationScratch, BinaryCodeBlock};
pub use self::cached::FeatureCachedTreeEvaluator;
pub use self::calc::calc_generic;
pub use self::calc_trees::{calc_indexes, CalcTreesStrategy, TreeCalcer};
pub use self::ctr::{
	calc_hash, projection_hash, CtrProviderError, CtrStats, CtrValueTable, StaticCtrProvider,
	StatisticsProvider,
};
pub use self::error::PreconditionError;
pub use self::intervals::calc_tree_intervals_generic;
pub use self::model::*;
pub use self::parallel::calc_generic_parallel;
pub use self::predict::{predict, predict_staged};

use serde::Deserialize;

/// This is the number of documents binarized and evaluated together.
pub const BLOCK_SIZE: usize = 128;

/// These are the options passed to every evaluation entry point.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorOptions {
	/// The number of documents in a block. Larger blocks amortize more per tree work but may not fit in cache.
	pub block_size: usize,
	/// If true, each split's `xor_mask` is applied to the bucket byte before it is compared with the split's border. Models whose splits all have a zero mask evaluate the same either way.
	pub apply_xor_mask: bool,
}

impl Default for EvaluatorOptions {
	fn default() -> EvaluatorOptions {
		EvaluatorOptions {
			block_size: BLOCK_SIZE,
			apply_xor_mask: true,
		}
	}
}

impl EvaluatorOptions {
	/// The block size to use for `doc_count` documents.
	pub(crate) fn effective_block_size(&self, doc_count: usize) -> Result<usize, PreconditionError> {
		if self.block_size == 0 {
			return Err(PreconditionError::ZeroBlockSize);
		}
		Ok(self.block_size.min(doc_count).max(1))
	}
}

#[test]
fn test_options_from_json() {
	let options: EvaluatorOptions = serde_json::from_str(r#"{ "block_size": 64 }"#).unwrap();
	assert_eq!(
		options,
		EvaluatorOptions {
			block_size: 64,
			apply_xor_mask: true,
		}
	);
	let options: EvaluatorOptions = serde_json::from_str("{}").unwrap();
	assert_eq!(options, EvaluatorOptions::default());
}

#[test]
fn test_effective_block_size() {
	let options = EvaluatorOptions::default();
	assert_eq!(options.effective_block_size(1000).unwrap(), BLOCK_SIZE);
	assert_eq!(options.effective_block_size(3).unwrap(), 3);
	assert_eq!(options.effective_block_size(0).unwrap(), 1);
	let options = EvaluatorOptions {
		block_size: 0,
		..Default::default()
	};
	assert_eq!(
		options.effective_block_size(10).unwrap_err(),
		PreconditionError::ZeroBlockSize
	);
}
