use crate::{
	error::PreconditionError,
	model::{FloatFeature, ModelError, ObliviousModel},
};
use anyhow::Result;
use itertools::izip;
use ndarray::prelude::*;
#[cfg(feature = "simd")]
use wide::{f32x8, i32x8, CmpGt};

/// With the `simd` feature, float features are binarized 16 documents at a time in two `f32x8` registers.
#[cfg(feature = "simd")]
const WIDE_LANES: usize = 16;

/// Without the `simd` feature, float features are binarized 8 documents at a time with eight byte counters packed in a `u64`.
#[cfg_attr(feature = "simd", allow(dead_code))]
const PACKED_LANES: usize = 8;

/**
A `BinaryCodeBlock` holds the binarized features of a block of documents. It is laid out bucket major: the codes of all documents for one bucket are contiguous, and the stride between buckets is the number of documents currently in the block. Each code is the bin index of the document's value for that bucket.
*/
#[derive(Clone, Debug)]
pub struct BinaryCodeBlock {
	// (n_buckets, n_docs), only the first n_buckets * n_docs values are in use.
	codes: Vec<u8>,
	bucket_count: usize,
	doc_count: usize,
}

impl BinaryCodeBlock {
	/// Allocate a block large enough for `doc_capacity` documents of `model`.
	pub fn new(model: &ObliviousModel, doc_capacity: usize) -> BinaryCodeBlock {
		BinaryCodeBlock {
			codes: vec![0; model.effective_bucket_count() * doc_capacity],
			bucket_count: 0,
			doc_count: 0,
		}
	}

	#[cfg(test)]
	pub(crate) fn from_codes(bucket_count: usize, doc_count: usize, codes: Vec<u8>) -> BinaryCodeBlock {
		assert_eq!(codes.len(), bucket_count * doc_count);
		BinaryCodeBlock {
			codes,
			bucket_count,
			doc_count,
		}
	}

	pub fn bucket_count(&self) -> usize {
		self.bucket_count
	}

	pub fn doc_count(&self) -> usize {
		self.doc_count
	}

	/// The number of codes the block can hold.
	pub fn capacity(&self) -> usize {
		self.codes.len()
	}

	/// The codes of all documents in the block for one bucket.
	pub fn bucket(&self, bucket: usize) -> &[u8] {
		&self.codes[bucket * self.doc_count..(bucket + 1) * self.doc_count]
	}

	fn bucket_mut(&mut self, bucket: usize) -> &mut [u8] {
		&mut self.codes[bucket * self.doc_count..(bucket + 1) * self.doc_count]
	}

	pub fn view(&self) -> Result<ArrayView2<u8>> {
		let len = self.bucket_count * self.doc_count;
		Ok(ArrayView2::from_shape(
			(self.bucket_count, self.doc_count),
			&self.codes[..len],
		)?)
	}

	/// Prepare the block for `doc_count` documents and zero the codes in use.
	fn reset(&mut self, bucket_count: usize, doc_count: usize) -> Result<(), PreconditionError> {
		let required = bucket_count * doc_count;
		if required > self.codes.len() {
			return Err(PreconditionError::ScratchBufferTooSmall {
				buffer: "binary code",
				capacity: self.codes.len(),
				required,
			});
		}
		self.bucket_count = bucket_count;
		self.doc_count = doc_count;
		self.codes[..required].iter_mut().for_each(|code| *code = 0);
		Ok(())
	}
}

/// The buffers `binarize_features` needs besides the `BinaryCodeBlock`. Reuse one per block loop to avoid allocating for every block.
#[derive(Clone, Debug)]
pub struct BinarizationScratch {
	// (n_cat_features, n_docs)
	hashed_cat_features: Vec<i32>,
	// (n_ctrs, n_docs)
	ctr_values: Vec<f32>,
}

impl BinarizationScratch {
	pub fn new(model: &ObliviousModel, doc_capacity: usize) -> BinarizationScratch {
		BinarizationScratch {
			hashed_cat_features: vec![0; model.cat_features().len() * doc_capacity],
			ctr_values: vec![0.0; model.used_ctrs().len() * doc_capacity],
		}
	}
}

/**
Binarize the documents in `start..end` into `codes`.

1. Float features are binned by counting the borders each value exceeds.
2. Categorical hashes are transposed to be feature major, then one hot features record the 1-based index of the candidate value each document matches.
3. The statistics provider computes the ctr values from the transposed hashes, and they are binned like float features.

Errors returned by the accessors or the statistics provider are returned unchanged. The contents of `codes` and `scratch` are unspecified after an error.
*/
pub fn binarize_features<F, C>(
	model: &ObliviousModel,
	float_accessor: &F,
	cat_accessor: &C,
	start: usize,
	end: usize,
	codes: &mut BinaryCodeBlock,
	scratch: &mut BinarizationScratch,
) -> Result<()>
where
	F: Fn(&FloatFeature, usize) -> Result<f32>,
	C: Fn(usize, usize) -> Result<i32>,
{
	if start > end {
		return Err(PreconditionError::InvalidDocumentRange { start, end }.into());
	}
	let doc_count = end - start;
	let cat_count = model.cat_features().len();
	let ctr_count = model.used_ctrs().len();
	check_scratch("hashed cat feature", scratch.hashed_cat_features.len(), cat_count * doc_count)?;
	check_scratch("ctr value", scratch.ctr_values.len(), ctr_count * doc_count)?;
	codes.reset(model.effective_bucket_count(), doc_count)?;
	if doc_count == 0 {
		return Ok(());
	}
	let mut bucket = 0;
	for feature in model.float_features() {
		binarize_floats(
			|doc| float_accessor(feature, start + doc),
			&feature.borders,
			codes.bucket_mut(bucket),
		)?;
		bucket += 1;
	}
	if cat_count == 0 {
		return Ok(());
	}
	let hashed_cat_features = &mut scratch.hashed_cat_features[..cat_count * doc_count];
	for doc in 0..doc_count {
		for slot in 0..cat_count {
			hashed_cat_features[slot * doc_count + doc] = cat_accessor(slot, start + doc)?;
		}
	}
	for (feature, slot) in izip!(model.one_hot_features(), model.one_hot_cat_slots()) {
		one_hot_bins(
			&feature.values,
			&hashed_cat_features[slot * doc_count..(slot + 1) * doc_count],
			codes.bucket_mut(bucket),
		);
		bucket += 1;
	}
	if ctr_count == 0 {
		return Ok(());
	}
	let provider = model
		.statistics_provider()
		.ok_or(ModelError::MissingStatisticsProvider)?;
	let ctr_values = &mut scratch.ctr_values[..ctr_count * doc_count];
	provider.compute_statistics(
		model.used_ctrs(),
		codes.view()?,
		ArrayView2::from_shape((cat_count, doc_count), &*hashed_cat_features)?,
		ArrayViewMut2::from_shape((ctr_count, doc_count), &mut *ctr_values)?,
	)?;
	for (feature, values) in izip!(model.ctr_features(), ctr_values.chunks_exact(doc_count)) {
		binarize_floats(|doc| Ok(values[doc]), &feature.borders, codes.bucket_mut(bucket))?;
		bucket += 1;
	}
	Ok(())
}

fn check_scratch(buffer: &'static str, capacity: usize, required: usize) -> Result<(), PreconditionError> {
	if capacity < required {
		return Err(PreconditionError::ScratchBufferTooSmall {
			buffer,
			capacity,
			required,
		});
	}
	Ok(())
}

/// Write the number of `borders` that `accessor(doc)` strictly exceeds to `result[doc]`. Values that are NaN exceed no border.
fn binarize_floats<A>(accessor: A, borders: &[f32], result: &mut [u8]) -> Result<()>
where
	A: Fn(usize) -> Result<f32>,
{
	#[cfg(feature = "simd")]
	let vectorized_doc_count = binarize_floats_wide(&accessor, borders, result)?;
	#[cfg(not(feature = "simd"))]
	let vectorized_doc_count = binarize_floats_packed(&accessor, borders, result)?;
	binarize_floats_scalar(
		&accessor,
		borders,
		&mut result[vectorized_doc_count..],
		vectorized_doc_count,
	)
}

/// Binarize whole groups of 16 documents and return how many documents were written.
#[cfg(feature = "simd")]
fn binarize_floats_wide<A>(accessor: &A, borders: &[f32], result: &mut [u8]) -> Result<usize>
where
	A: Fn(usize) -> Result<f32>,
{
	let wide_doc_count = result.len() - result.len() % WIDE_LANES;
	for (chunk_index, codes) in result[..wide_doc_count]
		.chunks_exact_mut(WIDE_LANES)
		.enumerate()
	{
		let doc_offset = chunk_index * WIDE_LANES;
		let mut low = [0.0f32; 8];
		let mut high = [0.0f32; 8];
		for (lane, (low, high)) in low.iter_mut().zip(high.iter_mut()).enumerate() {
			*low = accessor(doc_offset + lane)?;
			*high = accessor(doc_offset + 8 + lane)?;
		}
		let low = f32x8::from(low);
		let high = f32x8::from(high);
		// A true comparison is all ones, which is -1 as an i32 lane, so subtracting the mask counts it.
		let mut low_counts = i32x8::splat(0);
		let mut high_counts = i32x8::splat(0);
		for border in borders {
			let border = f32x8::splat(*border);
			low_counts = low_counts - bytemuck::cast::<f32x8, i32x8>(low.cmp_gt(border));
			high_counts = high_counts - bytemuck::cast::<f32x8, i32x8>(high.cmp_gt(border));
		}
		let low_counts = low_counts.to_array();
		let high_counts = high_counts.to_array();
		for (code, count) in codes
			.iter_mut()
			.zip(low_counts.iter().chain(high_counts.iter()))
		{
			*code = *count as u8;
		}
	}
	Ok(wide_doc_count)
}

/// Binarize whole groups of 8 documents and return how many documents were written.
#[cfg_attr(feature = "simd", allow(dead_code))]
fn binarize_floats_packed<A>(accessor: &A, borders: &[f32], result: &mut [u8]) -> Result<usize>
where
	A: Fn(usize) -> Result<f32>,
{
	let packed_doc_count = result.len() - result.len() % PACKED_LANES;
	for (chunk_index, codes) in result[..packed_doc_count]
		.chunks_exact_mut(PACKED_LANES)
		.enumerate()
	{
		let doc_offset = chunk_index * PACKED_LANES;
		let mut values = [0.0f32; PACKED_LANES];
		for (lane, value) in values.iter_mut().enumerate() {
			*value = accessor(doc_offset + lane)?;
		}
		// One byte counter per lane. A counter never exceeds 255, so it never carries into the next lane.
		let mut counts = 0u64;
		for border in borders {
			for (lane, value) in values.iter().enumerate() {
				counts += u64::from(*value > *border) << (8 * lane);
			}
		}
		codes.copy_from_slice(&counts.to_le_bytes());
	}
	Ok(packed_doc_count)
}

fn binarize_floats_scalar<A>(
	accessor: &A,
	borders: &[f32],
	result: &mut [u8],
	doc_offset: usize,
) -> Result<()>
where
	A: Fn(usize) -> Result<f32>,
{
	for (doc, code) in result.iter_mut().enumerate() {
		let value = accessor(doc_offset + doc)?;
		let mut count = 0u8;
		for border in borders {
			count += u8::from(value > *border);
		}
		*code = count;
	}
	Ok(())
}

/// Or the 1-based index of the candidate value each hash matches into `result`. The candidate values are distinct, so at most one matches.
fn one_hot_bins(values: &[i32], hashes: &[i32], result: &mut [u8]) {
	for (code, hash) in result.iter_mut().zip(hashes) {
		for (value_index, value) in values.iter().enumerate() {
			*code |= u8::from(hash == value) * (value_index + 1) as u8;
		}
	}
}

#[cfg(test)]
fn binarize_floats_all_lanes(values: &[f32], borders: &[f32]) -> Vec<Vec<u8>> {
	let accessor = |doc: usize| -> Result<f32> { Ok(values[doc]) };
	let mut scalar = vec![0; values.len()];
	binarize_floats_scalar(&accessor, borders, &mut scalar, 0).unwrap();
	let mut packed = vec![0; values.len()];
	let packed_doc_count = binarize_floats_packed(&accessor, borders, &mut packed).unwrap();
	binarize_floats_scalar(
		&accessor,
		borders,
		&mut packed[packed_doc_count..],
		packed_doc_count,
	)
	.unwrap();
	let mut dispatched = vec![0; values.len()];
	binarize_floats(&accessor, borders, &mut dispatched).unwrap();
	#[allow(unused_mut)]
	let mut results = vec![scalar, packed, dispatched];
	#[cfg(feature = "simd")]
	{
		let mut wide = vec![0; values.len()];
		let wide_doc_count = binarize_floats_wide(&accessor, borders, &mut wide).unwrap();
		binarize_floats_scalar(&accessor, borders, &mut wide[wide_doc_count..], wide_doc_count)
			.unwrap();
		results.push(wide);
	}
	results
}

#[test]
fn test_binarize_floats() {
	let borders = [0.5, 1.5];
	let values = [
		0.3,
		0.5,
		1.0,
		1.5,
		2.0,
		f32::NAN,
		f32::NEG_INFINITY,
		f32::INFINITY,
		-3.0,
		1.6,
		0.6,
		0.4,
		7.0,
		1.5,
		0.5,
		0.0,
		2.0,
	];
	for result in binarize_floats_all_lanes(&values, &borders) {
		assert_eq!(
			result,
			vec![0, 0, 1, 1, 2, 0, 0, 2, 0, 2, 1, 0, 2, 1, 0, 0, 2]
		);
	}
}

#[test]
fn test_binarize_floats_lanes_agree() {
	use rand::{Rng, SeedableRng};
	use rand_xoshiro::Xoshiro256Plus;
	let mut rng = Xoshiro256Plus::seed_from_u64(0);
	for doc_count in &[0, 1, 7, 8, 9, 15, 16, 17, 31, 33, 100, 128] {
		for border_count in &[0, 1, 3, 64, 255] {
			let mut borders: Vec<f32> = (0..*border_count)
				.map(|_| rng.gen_range(-10.0..10.0))
				.collect();
			borders.sort_by(|a, b| a.partial_cmp(b).unwrap());
			let values: Vec<f32> = (0..*doc_count)
				.map(|_| rng.gen_range(-12.0..12.0))
				.collect();
			let results = binarize_floats_all_lanes(&values, &borders);
			for result in &results[1..] {
				assert_eq!(result, &results[0]);
			}
			for (value, code) in values.iter().zip(&results[0]) {
				let expected = borders.iter().filter(|border| value > *border).count();
				assert_eq!(usize::from(*code), expected);
			}
		}
	}
}

#[test]
fn test_one_hot_bins() {
	let mut result = vec![0; 5];
	one_hot_bins(&[10, 20, 30], &[20, 5, 30, 10, -1], &mut result);
	assert_eq!(result, vec![2, 0, 3, 1, 0]);
}

#[test]
fn test_binarize_features_layout() {
	let model = crate::testing::float_and_one_hot_model();
	let floats = [[0.3, -1.0], [2.0, 0.0], [1.0, 5.0]];
	let cats = [7, 3, 11];
	let mut codes = BinaryCodeBlock::new(&model, 3);
	let mut scratch = BinarizationScratch::new(&model, 3);
	binarize_features(
		&model,
		&|feature: &FloatFeature, doc: usize| Ok(floats[doc][feature.index]),
		&|_slot: usize, doc: usize| Ok(cats[doc]),
		0,
		3,
		&mut codes,
		&mut scratch,
	)
	.unwrap();
	assert_eq!(codes.bucket_count(), 3);
	assert_eq!(codes.doc_count(), 3);
	assert_eq!(codes.bucket(0), &[0, 2, 1]);
	assert_eq!(codes.bucket(1), &[0, 1, 1]);
	assert_eq!(codes.bucket(2), &[2, 1, 0]);
	// Binarizing a sub range reads the accessors at the absolute document index.
	binarize_features(
		&model,
		&|feature: &FloatFeature, doc: usize| Ok(floats[doc][feature.index]),
		&|_slot: usize, doc: usize| Ok(cats[doc]),
		1,
		3,
		&mut codes,
		&mut scratch,
	)
	.unwrap();
	assert_eq!(codes.doc_count(), 2);
	assert_eq!(codes.bucket(0), &[2, 1]);
	assert_eq!(codes.bucket(1), &[1, 1]);
	assert_eq!(codes.bucket(2), &[1, 0]);
}

#[test]
fn test_binarize_features_ctr() {
	let model = crate::testing::ctr_model();
	let cats = [[1, 2], [1, 3], [4, 2]];
	let mut codes = BinaryCodeBlock::new(&model, 3);
	let mut scratch = BinarizationScratch::new(&model, 3);
	binarize_features(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|slot: usize, doc: usize| Ok(cats[doc][slot]),
		0,
		3,
		&mut codes,
		&mut scratch,
	)
	.unwrap();
	// The ctr values are 0.8, 0.5 and 0.5 with borders at 0.25 and 0.75.
	assert_eq!(codes.bucket(codes.bucket_count() - 1), &[2, 1, 1]);
}

#[test]
fn test_binarize_features_accessor_error() {
	#[derive(Debug, thiserror::Error, PartialEq)]
	#[error("document {0} is unavailable")]
	struct Unavailable(usize);
	let model = crate::testing::float_and_one_hot_model();
	let mut codes = BinaryCodeBlock::new(&model, 20);
	let mut scratch = BinarizationScratch::new(&model, 20);
	let error = binarize_features(
		&model,
		&|_: &FloatFeature, doc: usize| {
			if doc == 13 {
				Err(Unavailable(doc).into())
			} else {
				Ok(0.0)
			}
		},
		&|_: usize, _: usize| Ok(0),
		0,
		20,
		&mut codes,
		&mut scratch,
	)
	.unwrap_err();
	assert_eq!(error.downcast_ref::<Unavailable>(), Some(&Unavailable(13)));
}

#[test]
fn test_binarize_features_undersized_scratch() {
	let model = crate::testing::float_and_one_hot_model();
	let mut codes = BinaryCodeBlock::new(&model, 2);
	let mut scratch = BinarizationScratch::new(&model, 4);
	let error = binarize_features(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|_: usize, _: usize| Ok(0),
		0,
		4,
		&mut codes,
		&mut scratch,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ScratchBufferTooSmall {
			buffer: "binary code",
			capacity: 6,
			required: 12,
		})
	);
	let mut codes = BinaryCodeBlock::new(&model, 4);
	let mut scratch = BinarizationScratch::new(&model, 1);
	let error = binarize_features(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|_: usize, _: usize| Ok(0),
		0,
		4,
		&mut codes,
		&mut scratch,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::ScratchBufferTooSmall {
			buffer: "hashed cat feature",
			capacity: 1,
			required: 4,
		})
	);
}

#[test]
fn test_binarize_features_without_cat_features() {
	let model = crate::testing::single_split_model();
	assert!(model.cat_features().is_empty());
	let values = [0.3f32, 2.0, 1.0];
	let mut codes = BinaryCodeBlock::new(&model, 3);
	let mut scratch = BinarizationScratch::new(&model, 3);
	// A model without categorical features never asks for a hash.
	binarize_features(
		&model,
		&|_: &FloatFeature, doc: usize| Ok(values[doc]),
		&|slot: usize, doc: usize| -> Result<i32> {
			Err(anyhow::anyhow!("no hash for slot {} of document {}", slot, doc))
		},
		0,
		3,
		&mut codes,
		&mut scratch,
	)
	.unwrap();
	assert_eq!(codes.bucket_count(), 1);
	assert_eq!(codes.bucket(0), &[0, 2, 1]);
}

#[test]
fn test_binarize_features_statistics_provider_calls() {
	use crate::{ctr::StatisticsProvider, model::*, EvaluatorOptions};
	use std::sync::{Arc, Mutex};

	#[derive(Debug, Default)]
	struct RecordingProvider {
		calls: Mutex<Vec<(Array2<u8>, Array2<i32>)>>,
	}

	impl StatisticsProvider for RecordingProvider {
		fn compute_statistics(
			&self,
			_ctrs: &[ModelCtr],
			binary_codes: ArrayView2<u8>,
			hashed_cat_features: ArrayView2<i32>,
			mut statistics: ArrayViewMut2<f32>,
		) -> Result<()> {
			self.calls
				.lock()
				.unwrap()
				.push((binary_codes.to_owned(), hashed_cat_features.to_owned()));
			statistics.fill(0.5);
			Ok(())
		}
	}

	let provider = Arc::new(RecordingProvider::default());
	let shared: Arc<dyn StatisticsProvider> = provider.clone();
	let model = ObliviousModel::new(ObliviousModelParts {
		cat_features: vec![CatFeature { index: 0 }, CatFeature { index: 1 }],
		one_hot_features: vec![OneHotFeature {
			cat_feature_index: 1,
			values: vec![2],
		}],
		ctr_features: vec![CtrFeature {
			ctr: ModelCtr {
				base: ModelCtrBase {
					projection: vec![0, 1],
					ctr_type: CtrType::Borders,
					target_border_index: 0,
				},
				prior_numerator: 0.0,
				prior_denominator: 1.0,
				shift: 0.0,
				scale: 1.0,
			},
			borders: vec![0.25, 0.75],
		}],
		approx_dimension: 1,
		tree_sizes: vec![2],
		tree_splits: vec![BinarySplit::equal(0, 1), BinarySplit::greater_or_equal(1, 1)],
		leaf_values: vec![0.0, 1.0, 2.0, 3.0],
		statistics_provider: Some(shared),
		..Default::default()
	})
	.unwrap();
	let mut results = vec![0.0; 300];
	crate::calc::calc_generic(
		&model,
		&|_: &FloatFeature, _: usize| Ok(0.0),
		&|slot: usize, doc: usize| Ok(if slot == 0 { doc as i32 } else { (doc % 3) as i32 }),
		300,
		0,
		1,
		&mut results,
		&EvaluatorOptions {
			block_size: 128,
			..Default::default()
		},
	)
	.unwrap();
	let calls = provider.calls.lock().unwrap();
	assert_eq!(calls.len(), 3);
	for (block_index, (binary_codes, hashed_cat_features)) in calls.iter().enumerate() {
		let start = block_index * 128;
		let doc_count = if block_index == 2 { 44 } else { 128 };
		let docs = start..start + doc_count;
		// The one hot bucket is written before the provider runs and the ctr bucket after.
		assert_eq!(binary_codes.dim(), (2, doc_count));
		let one_hot_codes: Vec<u8> = docs.clone().map(|doc| (doc % 3 == 2) as u8).collect();
		assert_eq!(binary_codes.row(0).to_vec(), one_hot_codes);
		assert!(binary_codes.row(1).iter().all(|code| *code == 0));
		assert_eq!(hashed_cat_features.dim(), (2, doc_count));
		let slot_0: Vec<i32> = docs.clone().map(|doc| doc as i32).collect();
		let slot_1: Vec<i32> = docs.map(|doc| (doc % 3) as i32).collect();
		assert_eq!(hashed_cat_features.row(0).to_vec(), slot_0);
		assert_eq!(hashed_cat_features.row(1).to_vec(), slot_1);
	}
	// Every ctr value is 0.5, which is code 1, so only the one hot match decides the leaf.
	for (doc, result) in results.iter().enumerate() {
		assert_eq!(*result, if doc % 3 == 2 { 3.0 } else { 2.0 });
	}
}
