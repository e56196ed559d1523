use crate::{
	binarize::{binarize_features, BinarizationScratch, BinaryCodeBlock},
	calc_trees::TreeCalcer,
	error::{check_result_size, check_tree_range, PreconditionError},
	model::{FloatFeature, ObliviousModel},
	EvaluatorOptions,
};
use anyhow::Result;

/**
Evaluate trees `tree_start..tree_end` of `model` on documents `0..doc_count` and write the sums to `results`.

`results` must hold `doc_count * approx_dimension` values, with the values of one document next to each other. It is zeroed before any tree is added. Documents are binarized and evaluated one block at a time, reusing one set of scratch buffers for every block, so memory use does not grow with `doc_count`.

`float_accessor(feature, doc)` returns the value of a float feature and `cat_accessor(slot, doc)` returns the hash of the categorical feature in the given slot of the model's categorical features. Errors from either accessor or from the model's statistics provider abort the evaluation and are returned unchanged. `results` is zeroed again before an error is returned, so no partial sums are left behind.
*/
#[allow(clippy::too_many_arguments)]
pub fn calc_generic<F, C>(
	model: &ObliviousModel,
	float_accessor: &F,
	cat_accessor: &C,
	doc_count: usize,
	tree_start: usize,
	tree_end: usize,
	results: &mut [f64],
	options: &EvaluatorOptions,
) -> Result<()>
where
	F: Fn(&FloatFeature, usize) -> Result<f32>,
	C: Fn(usize, usize) -> Result<i32>,
{
	let block_size = check_calc_arguments(
		model,
		doc_count,
		tree_start,
		tree_end,
		results.len(),
		options,
	)?;
	results.iter_mut().for_each(|result| *result = 0.0);
	if doc_count == 0 {
		return Ok(());
	}
	let evaluated = calc_blocks(
		model,
		float_accessor,
		cat_accessor,
		doc_count,
		block_size,
		tree_start,
		tree_end,
		results,
		options,
	);
	if evaluated.is_err() {
		results.iter_mut().for_each(|result| *result = 0.0);
	}
	evaluated
}

#[allow(clippy::too_many_arguments)]
fn calc_blocks<F, C>(
	model: &ObliviousModel,
	float_accessor: &F,
	cat_accessor: &C,
	doc_count: usize,
	block_size: usize,
	tree_start: usize,
	tree_end: usize,
	results: &mut [f64],
	options: &EvaluatorOptions,
) -> Result<()>
where
	F: Fn(&FloatFeature, usize) -> Result<f32>,
	C: Fn(usize, usize) -> Result<i32>,
{
	let approx_dimension = model.approx_dimension();
	let calcer = TreeCalcer::new(model, block_size, options.apply_xor_mask);
	let mut codes = BinaryCodeBlock::new(model, block_size);
	let mut scratch = BinarizationScratch::new(model, block_size);
	if doc_count == 1 {
		binarize_features(
			model,
			float_accessor,
			cat_accessor,
			0,
			1,
			&mut codes,
			&mut scratch,
		)?;
		calcer.calc(model, &codes, &mut [], tree_start, tree_end, results)?;
		return Ok(());
	}
	let mut indexes = vec![0; block_size];
	for (block_index, results) in results
		.chunks_mut(block_size * approx_dimension)
		.enumerate()
	{
		let start = block_index * block_size;
		let end = start + results.len() / approx_dimension;
		log::trace!("evaluating documents {}..{}", start, end);
		binarize_features(
			model,
			float_accessor,
			cat_accessor,
			start,
			end,
			&mut codes,
			&mut scratch,
		)?;
		calcer.calc(model, &codes, &mut indexes, tree_start, tree_end, results)?;
	}
	Ok(())
}

/// Validate the arguments shared by the batch evaluations and return the block size to use.
pub(crate) fn check_calc_arguments(
	model: &ObliviousModel,
	doc_count: usize,
	tree_start: usize,
	tree_end: usize,
	result_count: usize,
	options: &EvaluatorOptions,
) -> Result<usize, PreconditionError> {
	check_tree_range(tree_start, tree_end, model.tree_count())?;
	check_result_size(doc_count * model.approx_dimension(), result_count)?;
	options.effective_block_size(doc_count)
}

#[cfg(test)]
pub(crate) fn calc_matrix(
	model: &ObliviousModel,
	floats: &ndarray::Array2<f32>,
	cats: &ndarray::Array2<i32>,
	tree_start: usize,
	tree_end: usize,
	options: &EvaluatorOptions,
) -> Vec<f64> {
	let doc_count = floats.nrows();
	let mut results = vec![0.0; doc_count * model.approx_dimension()];
	calc_generic(
		model,
		&crate::testing::float_accessor(floats),
		&crate::testing::cat_accessor(cats),
		doc_count,
		tree_start,
		tree_end,
		&mut results,
		options,
	)
	.unwrap();
	results
}

#[test]
fn test_calc_generic_single_split() {
	let model = crate::testing::single_split_model();
	let values = [0.3f32, 2.0];
	let mut results = vec![0.0; 2];
	calc_generic(
		&model,
		&|_: &FloatFeature, doc: usize| Ok(values[doc]),
		&|_: usize, _: usize| Ok(0),
		2,
		0,
		1,
		&mut results,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	insta::assert_debug_snapshot!(results, @r###"
 [
     10.0,
     20.0,
 ]
 "###);
}

#[test]
fn test_calc_generic_xor_mask() {
	let model = crate::testing::float_and_one_hot_model();
	let floats = ndarray::arr2(&[[0.3, -1.0], [2.0, 0.0], [1.0, 5.0]]);
	let cats = ndarray::arr2(&[[7], [3], [11]]);
	let results = calc_matrix(&model, &floats, &cats, 0, 3, &EvaluatorOptions::default());
	assert_eq!(results, vec![103.25, 102.5, 102.5]);
	// Without the mask the equality split never holds.
	let options = EvaluatorOptions {
		apply_xor_mask: false,
		..Default::default()
	};
	let results = calc_matrix(&model, &floats, &cats, 0, 3, &options);
	assert_eq!(results, vec![101.25, 102.5, 102.5]);
}

#[test]
fn test_calc_generic_ctr() {
	let model = crate::testing::ctr_model();
	let floats = ndarray::Array2::zeros((3, 0));
	let cats = ndarray::arr2(&[[1, 2], [1, 3], [4, 2]]);
	let results = calc_matrix(&model, &floats, &cats, 0, 1, &EvaluatorOptions::default());
	assert_eq!(results, vec![3.0, 0.0, 2.0]);
}

#[test]
fn test_calc_generic_block_invariance() {
	for approx_dimension in &[1, 3] {
		let model = crate::testing::random_model(1, *approx_dimension, 40);
		let (floats, cats) = crate::testing::random_documents(2, 300);
		let expected = calc_matrix(&model, &floats, &cats, 0, 40, &EvaluatorOptions::default());
		for block_size in &[1, 2, 7, 16, 17, 300, 1000] {
			let options = EvaluatorOptions {
				block_size: *block_size,
				..Default::default()
			};
			assert_eq!(calc_matrix(&model, &floats, &cats, 0, 40, &options), expected);
		}
		// Evaluating contiguous sub ranges separately gives the same values.
		let split = 113 * approx_dimension;
		let head = calc_matrix(
			&model,
			&floats.slice(ndarray::s![..113, ..]).to_owned(),
			&cats.slice(ndarray::s![..113, ..]).to_owned(),
			0,
			40,
			&EvaluatorOptions::default(),
		);
		let tail = calc_matrix(
			&model,
			&floats.slice(ndarray::s![113.., ..]).to_owned(),
			&cats.slice(ndarray::s![113.., ..]).to_owned(),
			0,
			40,
			&EvaluatorOptions::default(),
		);
		assert_eq!(&head[..], &expected[..split]);
		assert_eq!(&tail[..], &expected[split..]);
	}
}

#[test]
fn test_calc_generic_single_document() {
	let model = crate::testing::random_model(3, 2, 25);
	let (floats, cats) = crate::testing::random_documents(4, 40);
	let expected = calc_matrix(&model, &floats, &cats, 0, 25, &EvaluatorOptions::default());
	for doc in 0..40 {
		let results = calc_matrix(
			&model,
			&floats.slice(ndarray::s![doc..doc + 1, ..]).to_owned(),
			&cats.slice(ndarray::s![doc..doc + 1, ..]).to_owned(),
			0,
			25,
			&EvaluatorOptions::default(),
		);
		assert_eq!(&results[..], &expected[doc * 2..doc * 2 + 2]);
	}
}

#[test]
fn test_calc_generic_tree_ranges() {
	let model = crate::testing::random_model(5, 1, 30);
	let (floats, cats) = crate::testing::random_documents(6, 50);
	let options = EvaluatorOptions::default();
	let all = calc_matrix(&model, &floats, &cats, 0, 30, &options);
	assert_eq!(calc_matrix(&model, &floats, &cats, 0, 30, &options), all);
	let head = calc_matrix(&model, &floats, &cats, 0, 12, &options);
	let tail = calc_matrix(&model, &floats, &cats, 12, 30, &options);
	use itertools::izip;
	for (all, head, tail) in izip!(&all, &head, &tail) {
		assert!((all - (head + tail)).abs() < 1e-9);
	}
	let empty = calc_matrix(&model, &floats, &cats, 7, 7, &options);
	assert!(empty.iter().all(|value| *value == 0.0));
}

#[test]
fn test_calc_generic_preconditions() {
	let model = crate::testing::single_split_model();
	let float_accessor = |_: &FloatFeature, _: usize| -> Result<f32> { Ok(0.0) };
	let cat_accessor = |_: usize, _: usize| -> Result<i32> { Ok(0) };
	let options = EvaluatorOptions::default();
	let mut results = vec![0.0; 3];
	let error = calc_generic(
		&model,
		&float_accessor,
		&cat_accessor,
		2,
		0,
		1,
		&mut results,
		&options,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ResultSizeMismatch {
			expected: 2,
			actual: 3
		})
	);
	let error = calc_generic(
		&model,
		&float_accessor,
		&cat_accessor,
		3,
		0,
		2,
		&mut results,
		&options,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::TreeRangeOutOfBounds {
			tree_start: 0,
			tree_end: 2,
			tree_count: 1
		})
	);
	let mut results = vec![];
	calc_generic(
		&model,
		&float_accessor,
		&cat_accessor,
		0,
		0,
		1,
		&mut results,
		&options,
	)
	.unwrap();
}

#[test]
fn test_calc_generic_provider_error() {
	use crate::{ctr::StatisticsProvider, model::*};
	use ndarray::prelude::*;
	use std::sync::Arc;

	#[derive(Debug, thiserror::Error, PartialEq)]
	#[error("the statistics store is offline")]
	struct Offline;

	#[derive(Debug)]
	struct OfflineProvider;

	impl StatisticsProvider for OfflineProvider {
		fn compute_statistics(
			&self,
			_ctrs: &[ModelCtr],
			_binary_codes: ArrayView2<u8>,
			_hashed_cat_features: ArrayView2<i32>,
			_statistics: ArrayViewMut2<f32>,
		) -> Result<()> {
			Err(Offline.into())
		}
	}

	let model = ObliviousModel::new(ObliviousModelParts {
		cat_features: vec![CatFeature { index: 0 }],
		ctr_features: vec![CtrFeature {
			ctr: ModelCtr {
				base: ModelCtrBase {
					projection: vec![0],
					ctr_type: CtrType::Counter,
					target_border_index: 0,
				},
				prior_numerator: 0.0,
				prior_denominator: 1.0,
				shift: 0.0,
				scale: 1.0,
			},
			borders: vec![0.5],
		}],
		approx_dimension: 1,
		tree_sizes: vec![1],
		tree_splits: vec![BinarySplit::greater_or_equal(0, 1)],
		leaf_values: vec![-1.0, 1.0],
		statistics_provider: Some(Arc::new(OfflineProvider)),
		..Default::default()
	})
	.unwrap();
	let mut results = vec![0.0; 4];
	let error = calc_generic(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|_: usize, doc: usize| Ok(doc as i32),
		4,
		0,
		1,
		&mut results,
		&EvaluatorOptions::default(),
	)
	.unwrap_err();
	assert_eq!(error.downcast_ref::<Offline>(), Some(&Offline));
}

#[test]
fn test_calc_generic_error_clears_results() {
	#[derive(Debug, thiserror::Error, PartialEq)]
	#[error("document {0} is unavailable")]
	struct Unavailable(usize);
	let model = crate::testing::single_split_model();
	let mut results = vec![f64::NAN; 300];
	let error = calc_generic(
		&model,
		&|_: &FloatFeature, doc: usize| {
			if doc == 200 {
				Err(Unavailable(doc).into())
			} else {
				Ok(2.0)
			}
		},
		&|_: usize, _: usize| Ok(0),
		300,
		0,
		1,
		&mut results,
		&EvaluatorOptions::default(),
	)
	.unwrap_err();
	assert_eq!(error.downcast_ref::<Unavailable>(), Some(&Unavailable(200)));
	// The first block was evaluated before the failure, but its sums are not kept.
	assert!(results.iter().all(|result| *result == 0.0));
}
