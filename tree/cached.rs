use crate::{
	binarize::{binarize_features, BinarizationScratch, BinaryCodeBlock},
	calc_trees::TreeCalcer,
	error::{check_result_size, check_tree_range},
	model::{FloatFeature, ObliviousModel},
	pzip, EvaluatorOptions,
};
use anyhow::Result;
use itertools::izip;
use rayon::prelude::*;

/**
A `FeatureCachedTreeEvaluator` binarizes a fixed set of documents once, on construction, and keeps every block's binary codes so that later evaluations over different tree ranges only run the trees.

The retained codes are never modified after construction, so `calc` may be called concurrently on the same evaluator.
*/
#[derive(Debug)]
pub struct FeatureCachedTreeEvaluator<'a> {
	model: &'a ObliviousModel,
	calcer: TreeCalcer,
	blocks: Vec<BinaryCodeBlock>,
	doc_count: usize,
	block_size: usize,
}

impl<'a> FeatureCachedTreeEvaluator<'a> {
	/// Binarize documents `0..doc_count`. Errors from the accessors or the statistics provider are returned unchanged and no evaluator is created.
	pub fn new<F, C>(
		model: &'a ObliviousModel,
		float_accessor: &F,
		cat_accessor: &C,
		doc_count: usize,
		options: &EvaluatorOptions,
	) -> Result<FeatureCachedTreeEvaluator<'a>>
	where
		F: Fn(&FloatFeature, usize) -> Result<f32>,
		C: Fn(usize, usize) -> Result<i32>,
	{
		let block_size = options.effective_block_size(doc_count)?;
		let block_count = (doc_count + block_size - 1) / block_size;
		let mut scratch = BinarizationScratch::new(model, block_size);
		let mut blocks = Vec::with_capacity(block_count);
		for block_index in 0..block_count {
			let start = block_index * block_size;
			let end = (start + block_size).min(doc_count);
			let mut codes = BinaryCodeBlock::new(model, end - start);
			binarize_features(
				model,
				float_accessor,
				cat_accessor,
				start,
				end,
				&mut codes,
				&mut scratch,
			)?;
			blocks.push(codes);
		}
		log::debug!(
			"cached {} blocks of binary codes for {} documents, {} bytes",
			blocks.len(),
			doc_count,
			blocks.iter().map(|codes| codes.capacity()).sum::<usize>(),
		);
		Ok(FeatureCachedTreeEvaluator {
			model,
			calcer: TreeCalcer::new(model, block_size, options.apply_xor_mask),
			blocks,
			doc_count,
			block_size,
		})
	}

	pub fn doc_count(&self) -> usize {
		self.doc_count
	}

	pub fn block_count(&self) -> usize {
		self.blocks.len()
	}

	/// Evaluate trees `tree_start..tree_end` on the cached documents. `results` must hold `doc_count * approx_dimension` values and is zeroed first. It is left untouched when the arguments are rejected, and zeroed again if a later error is returned.
	pub fn calc(&self, tree_start: usize, tree_end: usize, results: &mut [f64]) -> Result<()> {
		self.check_arguments(tree_start, tree_end, results)?;
		let mut indexes = vec![0; self.block_size];
		let evaluated = izip!(&self.blocks, results.chunks_mut(self.chunk_size())).try_for_each(
			|(codes, results)| {
				self.calcer
					.calc(self.model, codes, &mut indexes, tree_start, tree_end, results)
			},
		);
		clear_on_error(results, evaluated.map_err(Into::into))
	}

	/// The same as `calc`, with the blocks evaluated on the rayon thread pool.
	pub fn calc_parallel(
		&self,
		tree_start: usize,
		tree_end: usize,
		results: &mut [f64],
	) -> Result<()> {
		self.check_arguments(tree_start, tree_end, results)?;
		let evaluated = pzip!(&self.blocks, results.par_chunks_mut(self.chunk_size()))
			.try_for_each_init(
				|| vec![0; self.block_size],
				|indexes, (codes, results)| {
					self.calcer
						.calc(self.model, codes, indexes, tree_start, tree_end, results)
				},
			);
		clear_on_error(results, evaluated.map_err(Into::into))
	}

	fn chunk_size(&self) -> usize {
		self.block_size * self.model.approx_dimension()
	}

	fn check_arguments(&self, tree_start: usize, tree_end: usize, results: &mut [f64]) -> Result<()> {
		check_tree_range(tree_start, tree_end, self.model.tree_count())?;
		check_result_size(self.doc_count * self.model.approx_dimension(), results.len())?;
		results.iter_mut().for_each(|result| *result = 0.0);
		Ok(())
	}
}

fn clear_on_error(results: &mut [f64], evaluated: Result<()>) -> Result<()> {
	if evaluated.is_err() {
		results.iter_mut().for_each(|result| *result = 0.0);
	}
	evaluated
}

#[test]
fn test_cache_equivalence() {
	use crate::testing::{cat_accessor, float_accessor, random_documents, random_model};
	for approx_dimension in &[1, 4] {
		let model = random_model(9, *approx_dimension, 60);
		let (floats, cats) = random_documents(10, 333);
		for block_size in &[1, 64, 128] {
			let options = EvaluatorOptions {
				block_size: *block_size,
				..Default::default()
			};
			let evaluator = FeatureCachedTreeEvaluator::new(
				&model,
				&float_accessor(&floats),
				&cat_accessor(&cats),
				333,
				&options,
			)
			.unwrap();
			assert_eq!(evaluator.doc_count(), 333);
			assert_eq!(evaluator.block_count(), (333 + block_size - 1) / block_size);
			for (tree_start, tree_end) in &[(0, 60), (0, 1), (17, 42), (60, 60)] {
				let mut expected = vec![0.0; 333 * approx_dimension];
				crate::calc::calc_generic(
					&model,
					&float_accessor(&floats),
					&cat_accessor(&cats),
					333,
					*tree_start,
					*tree_end,
					&mut expected,
					&options,
				)
				.unwrap();
				let mut results = vec![f64::NAN; 333 * approx_dimension];
				evaluator.calc(*tree_start, *tree_end, &mut results).unwrap();
				assert_eq!(results, expected);
				let mut results = vec![f64::NAN; 333 * approx_dimension];
				evaluator
					.calc_parallel(*tree_start, *tree_end, &mut results)
					.unwrap();
				assert_eq!(results, expected);
			}
		}
	}
}

#[test]
fn test_cache_concurrent_calls() {
	use crate::testing::{cat_accessor, float_accessor, random_documents, random_model};
	let model = random_model(11, 1, 20);
	let (floats, cats) = random_documents(12, 200);
	let evaluator = FeatureCachedTreeEvaluator::new(
		&model,
		&float_accessor(&floats),
		&cat_accessor(&cats),
		200,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	let mut expected = vec![0.0; 200];
	evaluator.calc(0, 20, &mut expected).unwrap();
	let results: Vec<Vec<f64>> = (0..8)
		.into_par_iter()
		.map(|_| {
			let mut results = vec![0.0; 200];
			evaluator.calc(0, 20, &mut results).unwrap();
			results
		})
		.collect();
	for results in results {
		assert_eq!(results, expected);
	}
}

#[test]
fn test_cache_empty_and_invalid() {
	use crate::error::PreconditionError;
	let model = crate::testing::single_split_model();
	let evaluator = FeatureCachedTreeEvaluator::new(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|_: usize, _: usize| Ok(0),
		0,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	assert_eq!(evaluator.block_count(), 0);
	evaluator.calc(0, 1, &mut []).unwrap();
	let evaluator = FeatureCachedTreeEvaluator::new(
		&model,
		&|_: &FloatFeature, doc: usize| Ok(doc as f32),
		&|_: usize, _: usize| Ok(0),
		3,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	let mut results = vec![0.0; 3];
	evaluator.calc(0, 1, &mut results).unwrap();
	assert_eq!(results, vec![10.0, 20.0, 20.0]);
	let mut short = vec![7.0; 2];
	let error = evaluator.calc(0, 1, &mut short).unwrap_err();
	assert_eq!(short, vec![7.0; 2]);
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ResultSizeMismatch {
			expected: 3,
			actual: 2
		})
	);
	let error = evaluator.calc_parallel(1, 2, &mut results).unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::TreeRangeOutOfBounds {
			tree_start: 1,
			tree_end: 2,
			tree_count: 1
		})
	);
}

#[test]
fn test_cache_clear_on_error() {
	#[derive(Debug, thiserror::Error)]
	#[error("block failed")]
	struct BlockFailed;
	let mut results = vec![1.0, 2.0, 3.0];
	clear_on_error(&mut results, Ok(())).unwrap();
	assert_eq!(results, vec![1.0, 2.0, 3.0]);
	let error = clear_on_error(&mut results, Err(BlockFailed.into())).unwrap_err();
	assert!(error.downcast_ref::<BlockFailed>().is_some());
	assert_eq!(results, vec![0.0; 3]);
}
