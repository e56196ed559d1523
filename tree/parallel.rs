use crate::{
	binarize::{binarize_features, BinarizationScratch, BinaryCodeBlock},
	calc::check_calc_arguments,
	calc_trees::TreeCalcer,
	model::{FloatFeature, ObliviousModel},
	EvaluatorOptions,
};
use anyhow::Result;
use rayon::prelude::*;

/// Zip any number of indexed parallel iterators, for example `pzip!(&blocks, results.par_chunks_mut(n))`.
#[macro_export]
macro_rules! pzip {
	($($e:expr),* $(,)*) => {
		rayon::iter::IntoParallelIterator::into_par_iter(($($e,)*))
	};
}

/**
Evaluate trees `tree_start..tree_end` on documents `0..doc_count`, processing blocks on the rayon thread pool. The arguments and results are the same as for [`calc_generic`](fn.calc_generic.html), and so are the values: blocks are independent and each document's trees are summed in the same order.

Each worker owns its own binary code block and scratch buffers. The accessors may be called from several threads at once. `results` is zeroed again before an error is returned.
*/
#[allow(clippy::too_many_arguments)]
pub fn calc_generic_parallel<F, C>(
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
	F: Fn(&FloatFeature, usize) -> Result<f32> + Sync,
	C: Fn(usize, usize) -> Result<i32> + Sync,
{
	let block_size = check_calc_arguments(
		model,
		doc_count,
		tree_start,
		tree_end,
		results.len(),
		options,
	)?;
	let approx_dimension = model.approx_dimension();
	results.par_iter_mut().for_each(|result| *result = 0.0);
	if doc_count == 0 {
		return Ok(());
	}
	let calcer = TreeCalcer::new(model, block_size, options.apply_xor_mask);
	let evaluated = results
		.par_chunks_mut(block_size * approx_dimension)
		.enumerate()
		.try_for_each_init(
			|| {
				(
					BinaryCodeBlock::new(model, block_size),
					BinarizationScratch::new(model, block_size),
					vec![0; block_size],
				)
			},
			|(codes, scratch, indexes), (block_index, results)| -> Result<()> {
				let start = block_index * block_size;
				let end = start + results.len() / approx_dimension;
				binarize_features(
					model,
					float_accessor,
					cat_accessor,
					start,
					end,
					codes,
					scratch,
				)?;
				calcer.calc(model, codes, indexes, tree_start, tree_end, results)?;
				Ok(())
			},
		);
	if evaluated.is_err() {
		results.par_iter_mut().for_each(|result| *result = 0.0);
	}
	evaluated
}

#[test]
fn test_parallel_matches_serial() {
	use crate::testing::{cat_accessor, float_accessor, random_documents, random_model};
	for approx_dimension in &[1, 2] {
		let model = random_model(7, *approx_dimension, 50);
		let (floats, cats) = random_documents(8, 517);
		let doc_count = floats.nrows();
		for block_size in &[1, 16, 128, 1024] {
			let options = EvaluatorOptions {
				block_size: *block_size,
				..Default::default()
			};
			let mut serial = vec![0.0; doc_count * approx_dimension];
			crate::calc::calc_generic(
				&model,
				&float_accessor(&floats),
				&cat_accessor(&cats),
				doc_count,
				5,
				50,
				&mut serial,
				&options,
			)
			.unwrap();
			let mut parallel = vec![1.0; doc_count * approx_dimension];
			calc_generic_parallel(
				&model,
				&float_accessor(&floats),
				&cat_accessor(&cats),
				doc_count,
				5,
				50,
				&mut parallel,
				&options,
			)
			.unwrap();
			assert_eq!(parallel, serial);
		}
	}
}

#[test]
fn test_parallel_accessor_error() {
	#[derive(Debug, thiserror::Error, PartialEq)]
	#[error("no hash for document {0}")]
	struct MissingHash(usize);
	let model = crate::testing::float_and_one_hot_model();
	let mut results = vec![0.0; 1000];
	let error = calc_generic_parallel(
		&model,
		&|_: &FloatFeature, _: usize| Ok(1.0),
		&|_: usize, doc: usize| {
			if doc == 731 {
				Err(MissingHash(doc).into())
			} else {
				Ok(3)
			}
		},
		1000,
		0,
		3,
		&mut results,
		&EvaluatorOptions::default(),
	)
	.unwrap_err();
	assert_eq!(error.downcast_ref::<MissingHash>(), Some(&MissingHash(731)));
	assert!(results.iter().all(|result| *result == 0.0));
}

#[test]
fn test_pzip() {
	let a = vec![1, 2, 3];
	let mut b = vec![0; 3];
	pzip!(&a, &mut b).for_each(|(a, b)| *b = a * 10);
	assert_eq!(b, vec![10, 20, 30]);
}
