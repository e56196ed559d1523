use crate::{
	binarize::{binarize_features, BinarizationScratch, BinaryCodeBlock},
	calc_trees::TreeCalcer,
	error::PreconditionError,
	model::{FloatFeature, ObliviousModel},
	EvaluatorOptions,
};
use anyhow::Result;
use ndarray::prelude::*;

/**
Compute staged predictions. Checkpoint `i` is the sum of trees `0..min((i + 1) * increment_step, tree_count)`, so the returned array has shape `(doc_count, ceil(tree_count / increment_step))` and its last column is the prediction of the whole model.

The model must have an approx dimension of 1. Each block keeps a running sum that is extended by one step of trees per checkpoint, adding the trees in the same order as a full evaluation would, so every checkpoint equals `calc_generic` over its tree prefix.
*/
pub fn calc_tree_intervals_generic<F, C>(
	model: &ObliviousModel,
	float_accessor: &F,
	cat_accessor: &C,
	doc_count: usize,
	increment_step: usize,
	options: &EvaluatorOptions,
) -> Result<Array2<f64>>
where
	F: Fn(&FloatFeature, usize) -> Result<f32>,
	C: Fn(usize, usize) -> Result<i32>,
{
	if model.approx_dimension() != 1 {
		return Err(PreconditionError::ApproxDimensionNotOne(model.approx_dimension()).into());
	}
	if increment_step == 0 {
		return Err(PreconditionError::ZeroIncrementStep.into());
	}
	let block_size = options.effective_block_size(doc_count)?;
	let tree_count = model.tree_count();
	let checkpoint_count = (tree_count + increment_step - 1) / increment_step;
	log::debug!(
		"evaluating {} checkpoints of {} trees for {} documents",
		checkpoint_count,
		increment_step,
		doc_count,
	);
	// (n_docs, n_checkpoints)
	let mut table = Array2::zeros((doc_count, checkpoint_count));
	if doc_count == 0 || checkpoint_count == 0 {
		return Ok(table);
	}
	let calcer = TreeCalcer::new(model, block_size, options.apply_xor_mask);
	let mut codes = BinaryCodeBlock::new(model, block_size);
	let mut scratch = BinarizationScratch::new(model, block_size);
	let mut indexes = vec![0; block_size];
	let mut block_results = vec![0.0; block_size];
	for (block_index, mut block_table) in table
		.axis_chunks_iter_mut(Axis(0), block_size)
		.enumerate()
	{
		let start = block_index * block_size;
		let end = start + block_table.nrows();
		log::trace!("evaluating checkpoints for documents {}..{}", start, end);
		binarize_features(
			model,
			float_accessor,
			cat_accessor,
			start,
			end,
			&mut codes,
			&mut scratch,
		)?;
		let block_results = &mut block_results[..end - start];
		block_results.iter_mut().for_each(|result| *result = 0.0);
		for (checkpoint, mut column) in block_table.axis_iter_mut(Axis(1)).enumerate() {
			let tree_start = checkpoint * increment_step;
			let tree_end = (tree_start + increment_step).min(tree_count);
			calcer.calc(
				model,
				&codes,
				&mut indexes,
				tree_start,
				tree_end,
				block_results,
			)?;
			for (value, result) in column.iter_mut().zip(block_results.iter()) {
				*value = *result;
			}
		}
	}
	Ok(table)
}

#[test]
fn test_interval_additivity() {
	use crate::testing::{cat_accessor, float_accessor, random_documents, random_model};
	let model = random_model(13, 1, 23);
	let (floats, cats) = random_documents(14, 150);
	for increment_step in &[1, 5, 23, 40] {
		for block_size in &[1, 32, 128] {
			let options = EvaluatorOptions {
				block_size: *block_size,
				..Default::default()
			};
			let table = calc_tree_intervals_generic(
				&model,
				&float_accessor(&floats),
				&cat_accessor(&cats),
				150,
				*increment_step,
				&options,
			)
			.unwrap();
			let checkpoint_count = (23 + increment_step - 1) / increment_step;
			assert_eq!(table.dim(), (150, checkpoint_count));
			for (checkpoint, column) in table.axis_iter(Axis(1)).enumerate() {
				let tree_end = ((checkpoint + 1) * increment_step).min(23);
				let mut expected = vec![0.0; 150];
				crate::calc::calc_generic(
					&model,
					&float_accessor(&floats),
					&cat_accessor(&cats),
					150,
					0,
					tree_end,
					&mut expected,
					&options,
				)
				.unwrap();
				assert_eq!(column.to_vec(), expected);
			}
		}
	}
}

#[test]
fn test_interval_single_split() {
	let model = crate::testing::single_split_model();
	let values = [0.3f32, 2.0];
	let table = calc_tree_intervals_generic(
		&model,
		&|_: &FloatFeature, doc: usize| Ok(values[doc]),
		&|_: usize, _: usize| Ok(0),
		2,
		1,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	insta::assert_debug_snapshot!(table.into_raw_vec(), @r###"
 [
     10.0,
     20.0,
 ]
 "###);
}

#[test]
fn test_interval_preconditions() {
	let float_accessor = |_: &FloatFeature, _: usize| -> Result<f32> { Ok(0.0) };
	let cat_accessor = |_: usize, _: usize| -> Result<i32> { Ok(0) };
	let options = EvaluatorOptions::default();
	let model = crate::testing::multi_dimension_model();
	let error =
		calc_tree_intervals_generic(&model, &float_accessor, &cat_accessor, 4, 1, &options)
			.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ApproxDimensionNotOne(2))
	);
	let model = crate::testing::single_split_model();
	let error =
		calc_tree_intervals_generic(&model, &float_accessor, &cat_accessor, 4, 0, &options)
			.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ZeroIncrementStep)
	);
	let table =
		calc_tree_intervals_generic(&model, &float_accessor, &cat_accessor, 0, 3, &options)
			.unwrap();
	assert_eq!(table.dim(), (0, 1));
}
