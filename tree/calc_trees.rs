use crate::{
	binarize::BinaryCodeBlock,
	error::{check_result_size, check_tree_range, PreconditionError},
	model::{BinarySplit, ObliviousModel},
};

/**
Compute the leaf index of every document in `codes` for a tree with the given `splits`.

Level `depth` contributes the bit `(code ^ xor_mask) >= border` at position `depth`, where `code` is the document's byte in the split's bucket and `xor_mask` is the split's mask if `apply_xor_mask` is true and 0 otherwise. The loop runs level by level across all documents so that the inner loop is a branch free pass over one contiguous bucket.
*/
pub fn calc_indexes(
	apply_xor_mask: bool,
	codes: &BinaryCodeBlock,
	splits: &[BinarySplit],
	indexes: &mut [u32],
) {
	if apply_xor_mask {
		calc_indexes_impl::<true>(codes, splits, indexes)
	} else {
		calc_indexes_impl::<false>(codes, splits, indexes)
	}
}

#[inline]
fn calc_indexes_impl<const XOR: bool>(
	codes: &BinaryCodeBlock,
	splits: &[BinarySplit],
	indexes: &mut [u32],
) {
	indexes.iter_mut().for_each(|index| *index = 0);
	for (depth, split) in splits.iter().enumerate() {
		let xor_mask = if XOR { split.xor_mask } else { 0 };
		let bucket = codes.bucket(split.bucket.into());
		for (index, code) in indexes.iter_mut().zip(bucket) {
			*index |= u32::from((code ^ xor_mask) >= split.border) << depth;
		}
	}
}

/// The accumulation routines a `TreeCalcer` chooses between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalcTreesStrategy {
	/// Every block holds a single document. Leaf indexes are composed per document and no index buffer is used.
	SingleDocument,
	/// Blocks of many documents with one value per document.
	Blocked,
	/// Blocks of many documents with several values per document, interleaved per leaf.
	BlockedMultiDimension,
}

/// A `TreeCalcer` adds the leaf values of a range of trees to the results of a block of documents. It is chosen once per evaluation, based on the block size and the model's approx dimension, and reused for every block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeCalcer {
	strategy: CalcTreesStrategy,
	apply_xor_mask: bool,
}

impl TreeCalcer {
	pub fn new(model: &ObliviousModel, doc_count_in_block: usize, apply_xor_mask: bool) -> TreeCalcer {
		let strategy = if doc_count_in_block == 1 {
			CalcTreesStrategy::SingleDocument
		} else if model.approx_dimension() == 1 {
			CalcTreesStrategy::Blocked
		} else {
			CalcTreesStrategy::BlockedMultiDimension
		};
		TreeCalcer {
			strategy,
			apply_xor_mask,
		}
	}

	pub fn strategy(&self) -> CalcTreesStrategy {
		self.strategy
	}

	pub fn apply_xor_mask(&self) -> bool {
		self.apply_xor_mask
	}

	/**
	Add the leaf values of trees `tree_start..tree_end` to `results` for every document in `codes`. `results` holds `approx_dimension` values per document. `indexes` is scratch space for one leaf index per document and may be empty for the `SingleDocument` strategy.

	Leaf values are already scaled by the learning rate, so this is a plain sum in tree order.
	*/
	pub fn calc(
		&self,
		model: &ObliviousModel,
		codes: &BinaryCodeBlock,
		indexes: &mut [u32],
		tree_start: usize,
		tree_end: usize,
		results: &mut [f64],
	) -> Result<(), PreconditionError> {
		check_tree_range(tree_start, tree_end, model.tree_count())?;
		let doc_count = codes.doc_count();
		check_result_size(doc_count * model.approx_dimension(), results.len())?;
		if codes.bucket_count() != model.effective_bucket_count() {
			return Err(PreconditionError::BucketCountMismatch {
				expected: model.effective_bucket_count(),
				actual: codes.bucket_count(),
			});
		}
		if self.strategy != CalcTreesStrategy::SingleDocument && indexes.len() < doc_count {
			return Err(PreconditionError::ScratchBufferTooSmall {
				buffer: "leaf index",
				capacity: indexes.len(),
				required: doc_count,
			});
		}
		match (self.strategy, self.apply_xor_mask) {
			(CalcTreesStrategy::SingleDocument, true) => {
				calc_trees_single_document::<true>(model, codes, tree_start, tree_end, results)
			}
			(CalcTreesStrategy::SingleDocument, false) => {
				calc_trees_single_document::<false>(model, codes, tree_start, tree_end, results)
			}
			(CalcTreesStrategy::Blocked, true) => calc_trees_blocked::<true>(
				model,
				codes,
				&mut indexes[..doc_count],
				tree_start,
				tree_end,
				results,
			),
			(CalcTreesStrategy::Blocked, false) => calc_trees_blocked::<false>(
				model,
				codes,
				&mut indexes[..doc_count],
				tree_start,
				tree_end,
				results,
			),
			(CalcTreesStrategy::BlockedMultiDimension, true) => {
				calc_trees_blocked_multi_dimension::<true>(
					model,
					codes,
					&mut indexes[..doc_count],
					tree_start,
					tree_end,
					results,
				)
			}
			(CalcTreesStrategy::BlockedMultiDimension, false) => {
				calc_trees_blocked_multi_dimension::<false>(
					model,
					codes,
					&mut indexes[..doc_count],
					tree_start,
					tree_end,
					results,
				)
			}
		}
		Ok(())
	}
}

fn calc_trees_single_document<const XOR: bool>(
	model: &ObliviousModel,
	codes: &BinaryCodeBlock,
	tree_start: usize,
	tree_end: usize,
	results: &mut [f64],
) {
	let approx_dimension = model.approx_dimension();
	for (doc, result) in results.chunks_exact_mut(approx_dimension).enumerate() {
		for tree in tree_start..tree_end {
			let mut index = 0usize;
			for (depth, split) in model.tree_splits(tree).iter().enumerate() {
				let xor_mask = if XOR { split.xor_mask } else { 0 };
				let code = codes.bucket(split.bucket.into())[doc];
				index |= usize::from((code ^ xor_mask) >= split.border) << depth;
			}
			let leaf_values = &model.tree_leaf_values(tree)
				[index * approx_dimension..(index + 1) * approx_dimension];
			for (result, leaf_value) in result.iter_mut().zip(leaf_values) {
				*result += leaf_value;
			}
		}
	}
}

fn calc_trees_blocked<const XOR: bool>(
	model: &ObliviousModel,
	codes: &BinaryCodeBlock,
	indexes: &mut [u32],
	tree_start: usize,
	tree_end: usize,
	results: &mut [f64],
) {
	for tree in tree_start..tree_end {
		calc_indexes_impl::<XOR>(codes, model.tree_splits(tree), indexes);
		let leaf_values = model.tree_leaf_values(tree);
		for (result, index) in results.iter_mut().zip(indexes.iter()) {
			*result += leaf_values[*index as usize];
		}
	}
}

fn calc_trees_blocked_multi_dimension<const XOR: bool>(
	model: &ObliviousModel,
	codes: &BinaryCodeBlock,
	indexes: &mut [u32],
	tree_start: usize,
	tree_end: usize,
	results: &mut [f64],
) {
	let approx_dimension = model.approx_dimension();
	for tree in tree_start..tree_end {
		calc_indexes_impl::<XOR>(codes, model.tree_splits(tree), indexes);
		let leaf_values = model.tree_leaf_values(tree);
		for (result, index) in results
			.chunks_exact_mut(approx_dimension)
			.zip(indexes.iter())
		{
			let leaf_start = *index as usize * approx_dimension;
			for (result, leaf_value) in result
				.iter_mut()
				.zip(&leaf_values[leaf_start..leaf_start + approx_dimension])
			{
				*result += leaf_value;
			}
		}
	}
}

#[cfg(test)]
fn polarity_codes() -> BinaryCodeBlock {
	BinaryCodeBlock::from_codes(2, 4, vec![0, 1, 2, 3, 5, 0, 5, 0])
}

#[test]
fn test_calc_indexes() {
	let codes = polarity_codes();
	let splits = [
		BinarySplit::greater_or_equal(0, 2),
		BinarySplit::greater_or_equal(1, 1),
	];
	let mut indexes = vec![0; 4];
	calc_indexes(true, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![2, 0, 3, 1]);
	calc_indexes(false, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![2, 0, 3, 1]);
}

#[test]
fn test_calc_indexes_inverted_polarity() {
	let codes = polarity_codes();
	// `(code ^ 0xff) >= 254` holds exactly when `code < 2`, the inverse of the first level above.
	let splits = [
		BinarySplit {
			bucket: 0,
			border: 254,
			xor_mask: 0xff,
		},
		BinarySplit::greater_or_equal(1, 1),
	];
	let mut indexes = vec![0; 4];
	calc_indexes(true, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![3, 1, 2, 0]);
	// Inverting the first level flips bit 0 of every index.
	let plain: Vec<u32> = vec![2, 0, 3, 1];
	assert_eq!(
		indexes,
		plain.iter().map(|index| index ^ 1).collect::<Vec<_>>()
	);
	// Without the mask the first level compares the raw code with 254.
	calc_indexes(false, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![2, 0, 2, 0]);
}

#[test]
fn test_calc_indexes_equality_split() {
	let codes = polarity_codes();
	let splits = [BinarySplit::equal(1, 5), BinarySplit::equal(0, 2)];
	let mut indexes = vec![0; 4];
	calc_indexes(true, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![1, 0, 3, 0]);
	calc_indexes(false, &codes, &splits, &mut indexes);
	assert_eq!(indexes, vec![0, 0, 0, 0]);
}

#[test]
fn test_strategy_selection() {
	let model = crate::testing::single_split_model();
	assert_eq!(
		TreeCalcer::new(&model, 1, true).strategy(),
		CalcTreesStrategy::SingleDocument
	);
	assert_eq!(
		TreeCalcer::new(&model, 128, true).strategy(),
		CalcTreesStrategy::Blocked
	);
	let model = crate::testing::multi_dimension_model();
	assert_eq!(
		TreeCalcer::new(&model, 1, false).strategy(),
		CalcTreesStrategy::SingleDocument
	);
	let calcer = TreeCalcer::new(&model, 7, false);
	assert_eq!(calcer.strategy(), CalcTreesStrategy::BlockedMultiDimension);
	assert!(!calcer.apply_xor_mask());
	assert!(TreeCalcer::new(&model, 7, true).apply_xor_mask());
}

#[test]
fn test_calc_multi_dimension() {
	let model = crate::testing::multi_dimension_model();
	let codes = BinaryCodeBlock::from_codes(1, 3, vec![0, 1, 2]);
	let mut expected = None;
	for doc_count_in_block in &[1, 3] {
		let calcer = TreeCalcer::new(&model, *doc_count_in_block, true);
		let mut indexes = vec![0; 3];
		let mut results = vec![0.0; 6];
		calcer
			.calc(&model, &codes, &mut indexes, 0, 2, &mut results)
			.unwrap();
		// Tree 0 splits on code >= 1 and tree 1 on code >= 2.
		assert_eq!(results, vec![11.0, 22.0, 13.0, 24.0, 13.0, 34.0]);
		if let Some(expected) = &expected {
			assert_eq!(&results, expected);
		}
		expected = Some(results);
	}
}

#[test]
fn test_calc_preconditions() {
	let model = crate::testing::single_split_model();
	let codes = BinaryCodeBlock::from_codes(1, 2, vec![0, 2]);
	let calcer = TreeCalcer::new(&model, 2, true);
	let mut indexes = vec![0; 2];
	let mut results = vec![0.0; 2];
	assert_eq!(
		calcer.calc(&model, &codes, &mut indexes, 0, 2, &mut results),
		Err(PreconditionError::TreeRangeOutOfBounds {
			tree_start: 0,
			tree_end: 2,
			tree_count: 1
		})
	);
	let mut short_results = vec![0.0; 1];
	assert_eq!(
		calcer.calc(&model, &codes, &mut indexes, 0, 1, &mut short_results),
		Err(PreconditionError::ResultSizeMismatch {
			expected: 2,
			actual: 1
		})
	);
	assert_eq!(
		calcer.calc(&model, &codes, &mut [], 0, 1, &mut results),
		Err(PreconditionError::ScratchBufferTooSmall {
			buffer: "leaf index",
			capacity: 0,
			required: 2
		})
	);
	calcer
		.calc(&model, &codes, &mut indexes, 0, 1, &mut results)
		.unwrap();
	assert_eq!(results, vec![10.0, 20.0]);
	// An empty tree range adds nothing.
	calcer
		.calc(&model, &codes, &mut indexes, 1, 1, &mut results)
		.unwrap();
	assert_eq!(results, vec![10.0, 20.0]);
}
