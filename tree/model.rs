use crate::ctr::StatisticsProvider;
use itertools::Itertools;
use std::sync::Arc;
use thiserror::Error;

/// A bucket code is a single byte, so a feature may have at most this many borders.
pub const MAX_BORDERS_PER_FEATURE: usize = 255;

/// Leaf indexes are `u32`s with one bit per tree level.
pub const MAX_TREE_DEPTH: usize = 31;

/// A number feature. Values are binned by counting how many of the `borders` they strictly exceed, so the borders must be sorted ascending.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatFeature {
	/// This is the index of the feature in the caller's feature space.
	pub index: usize,
	pub borders: Vec<f32>,
}

/// A categorical feature. Its values reach the evaluator as integer hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatFeature {
	pub index: usize,
}

/// A categorical feature binned by exact match against a small set of candidate hashes. A document whose hash equals `values[i]` gets the bucket code `i + 1`, and every other document gets 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OneHotFeature {
	/// The `index` of the `CatFeature` this feature reads.
	pub cat_feature_index: usize,
	pub values: Vec<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CtrType {
	Borders,
	Buckets,
	Counter,
	FloatTargetMeanValue,
}

/// The part of a ctr that identifies its value table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelCtrBase {
	/// Categorical slots, that is positions in the model's `CatFeature` list, whose hashes are combined into the table key.
	pub projection: Vec<usize>,
	pub ctr_type: CtrType,
	pub target_border_index: usize,
}

/// A categorical statistic requested from the statistics provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelCtr {
	pub base: ModelCtrBase,
	pub prior_numerator: f32,
	pub prior_denominator: f32,
	pub shift: f32,
	pub scale: f32,
}

impl ModelCtr {
	/// Apply the priors, then the shift and scale, to raw counts.
	pub fn calc(&self, numerator: f32, denominator: f32) -> f32 {
		let raw = (numerator + self.prior_numerator) / (denominator + self.prior_denominator);
		(raw + self.shift) * self.scale
	}
}

/// A continuous feature computed by the statistics provider and binned exactly like a `FloatFeature`.
#[derive(Clone, Debug, PartialEq)]
pub struct CtrFeature {
	pub ctr: ModelCtr,
	pub borders: Vec<f32>,
}

/// One level of an oblivious tree. The level's bit is `(code ^ xor_mask) >= border` where `code` is the document's byte in bucket `bucket`. The mask only takes part when the caller asks for it, see `EvaluatorOptions::apply_xor_mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinarySplit {
	pub bucket: u16,
	pub border: u8,
	pub xor_mask: u8,
}

impl BinarySplit {
	/// A split whose bit is set when the code is at least `border`.
	pub fn greater_or_equal(bucket: u16, border: u8) -> BinarySplit {
		BinarySplit {
			bucket,
			border,
			xor_mask: 0,
		}
	}

	/// A split whose bit is set when the code equals `value`. `(code ^ !value)` is `0xff` only when `code == value`, so the comparison against `0xff` is an equality test.
	pub fn equal(bucket: u16, value: u8) -> BinarySplit {
		BinarySplit {
			bucket,
			border: 0xff,
			xor_mask: !value,
		}
	}

	#[inline]
	pub fn bit(self, code: u8, apply_xor_mask: bool) -> bool {
		let xor_mask = if apply_xor_mask { self.xor_mask } else { 0 };
		(code ^ xor_mask) >= self.border
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
	#[error("the approx dimension must be at least 1")]
	ZeroApproxDimension,
	#[error("the borders of {kind} feature {feature} are not finite and sorted ascending")]
	UnsortedBorders { kind: &'static str, feature: usize },
	#[error("{kind} feature {feature} has {count} borders but at most 255 are supported")]
	TooManyBorders {
		kind: &'static str,
		feature: usize,
		count: usize,
	},
	#[error("one hot feature {feature} has {count} values but at most 255 are supported")]
	TooManyOneHotValues { feature: usize, count: usize },
	#[error("one hot feature {feature} references unknown cat feature {cat_feature_index}")]
	UnknownCatFeature {
		feature: usize,
		cat_feature_index: usize,
	},
	#[error("ctr feature {feature} has a projection that does not fit {cat_feature_count} cat features")]
	InvalidCtrProjection {
		feature: usize,
		cat_feature_count: usize,
	},
	#[error("the model has ctr features but no statistics provider")]
	MissingStatisticsProvider,
	#[error("tree {tree} has depth {depth} but at most 31 is supported")]
	TreeTooDeep { tree: usize, depth: usize },
	#[error("tree {tree} splits on bucket {bucket} but there are only {bucket_count} buckets")]
	SplitBucketOutOfRange {
		tree: usize,
		bucket: usize,
		bucket_count: usize,
	},
	#[error("the tree sizes add up to {expected} splits but {actual} were given")]
	SplitCountMismatch { expected: usize, actual: usize },
	#[error("the trees need {expected} leaf values but {actual} were given")]
	LeafValueCountMismatch { expected: usize, actual: usize },
}

/// Everything needed to assemble an `ObliviousModel`.
#[derive(Debug, Default)]
pub struct ObliviousModelParts {
	pub float_features: Vec<FloatFeature>,
	pub cat_features: Vec<CatFeature>,
	pub one_hot_features: Vec<OneHotFeature>,
	pub ctr_features: Vec<CtrFeature>,
	pub approx_dimension: usize,
	/// The depth of each tree.
	pub tree_sizes: Vec<usize>,
	/// The splits of all trees, concatenated in tree order, root level first.
	pub tree_splits: Vec<BinarySplit>,
	/// The leaf values of all trees, concatenated in tree order. A tree of depth `d` has `2^d * approx_dimension` values, with the dimensions of one leaf next to each other.
	pub leaf_values: Vec<f64>,
	pub statistics_provider: Option<Arc<dyn StatisticsProvider>>,
}

/// An ensemble of oblivious trees over binarized features. It is validated once on construction and immutable afterward, so any number of evaluations may share it.
#[derive(Debug)]
pub struct ObliviousModel {
	float_features: Vec<FloatFeature>,
	cat_features: Vec<CatFeature>,
	one_hot_features: Vec<OneHotFeature>,
	ctr_features: Vec<CtrFeature>,
	approx_dimension: usize,
	tree_sizes: Vec<usize>,
	tree_splits: Vec<BinarySplit>,
	leaf_values: Vec<f64>,
	statistics_provider: Option<Arc<dyn StatisticsProvider>>,
	// (n_trees + 1)
	tree_split_offsets: Vec<usize>,
	// (n_trees + 1)
	tree_leaf_offsets: Vec<usize>,
	// (n_one_hot_features)
	one_hot_cat_slots: Vec<usize>,
	used_ctrs: Vec<ModelCtr>,
}

impl ObliviousModel {
	pub fn new(parts: ObliviousModelParts) -> Result<ObliviousModel, ModelError> {
		let ObliviousModelParts {
			float_features,
			cat_features,
			one_hot_features,
			ctr_features,
			approx_dimension,
			tree_sizes,
			tree_splits,
			leaf_values,
			statistics_provider,
		} = parts;
		if approx_dimension == 0 {
			return Err(ModelError::ZeroApproxDimension);
		}
		for (feature, float_feature) in float_features.iter().enumerate() {
			validate_borders("float", feature, &float_feature.borders)?;
		}
		for (feature, ctr_feature) in ctr_features.iter().enumerate() {
			validate_borders("ctr", feature, &ctr_feature.borders)?;
			let projection = &ctr_feature.ctr.base.projection;
			if projection.is_empty() || projection.iter().any(|slot| *slot >= cat_features.len()) {
				return Err(ModelError::InvalidCtrProjection {
					feature,
					cat_feature_count: cat_features.len(),
				});
			}
		}
		if !ctr_features.is_empty() && statistics_provider.is_none() {
			return Err(ModelError::MissingStatisticsProvider);
		}
		let one_hot_cat_slots = one_hot_features
			.iter()
			.enumerate()
			.map(|(feature, one_hot_feature)| {
				if one_hot_feature.values.len() > MAX_BORDERS_PER_FEATURE {
					return Err(ModelError::TooManyOneHotValues {
						feature,
						count: one_hot_feature.values.len(),
					});
				}
				cat_features
					.iter()
					.position(|cat_feature| cat_feature.index == one_hot_feature.cat_feature_index)
					.ok_or(ModelError::UnknownCatFeature {
						feature,
						cat_feature_index: one_hot_feature.cat_feature_index,
					})
			})
			.collect::<Result<Vec<_>, _>>()?;
		let bucket_count = float_features.len() + one_hot_features.len() + ctr_features.len();
		let mut tree_split_offsets = Vec::with_capacity(tree_sizes.len() + 1);
		let mut tree_leaf_offsets = Vec::with_capacity(tree_sizes.len() + 1);
		let mut split_offset = 0;
		let mut leaf_offset = 0;
		tree_split_offsets.push(split_offset);
		tree_leaf_offsets.push(leaf_offset);
		for (tree, depth) in tree_sizes.iter().copied().enumerate() {
			if depth > MAX_TREE_DEPTH {
				return Err(ModelError::TreeTooDeep { tree, depth });
			}
			split_offset += depth;
			leaf_offset += (1 << depth) * approx_dimension;
			tree_split_offsets.push(split_offset);
			tree_leaf_offsets.push(leaf_offset);
		}
		if split_offset != tree_splits.len() {
			return Err(ModelError::SplitCountMismatch {
				expected: split_offset,
				actual: tree_splits.len(),
			});
		}
		if leaf_offset != leaf_values.len() {
			return Err(ModelError::LeafValueCountMismatch {
				expected: leaf_offset,
				actual: leaf_values.len(),
			});
		}
		for (tree, (start, end)) in tree_split_offsets.iter().tuple_windows().enumerate() {
			if let Some(split) = tree_splits[*start..*end]
				.iter()
				.find(|split| usize::from(split.bucket) >= bucket_count)
			{
				return Err(ModelError::SplitBucketOutOfRange {
					tree,
					bucket: split.bucket.into(),
					bucket_count,
				});
			}
		}
		let used_ctrs = ctr_features
			.iter()
			.map(|ctr_feature| ctr_feature.ctr.clone())
			.collect();
		log::debug!(
			"loaded oblivious model with {} trees, {} buckets and approx dimension {}",
			tree_sizes.len(),
			bucket_count,
			approx_dimension,
		);
		Ok(ObliviousModel {
			float_features,
			cat_features,
			one_hot_features,
			ctr_features,
			approx_dimension,
			tree_sizes,
			tree_splits,
			leaf_values,
			statistics_provider,
			tree_split_offsets,
			tree_leaf_offsets,
			one_hot_cat_slots,
			used_ctrs,
		})
	}

	pub fn float_features(&self) -> &[FloatFeature] {
		&self.float_features
	}

	pub fn cat_features(&self) -> &[CatFeature] {
		&self.cat_features
	}

	pub fn one_hot_features(&self) -> &[OneHotFeature] {
		&self.one_hot_features
	}

	pub fn ctr_features(&self) -> &[CtrFeature] {
		&self.ctr_features
	}

	/// The number of values produced for each document.
	pub fn approx_dimension(&self) -> usize {
		self.approx_dimension
	}

	pub fn tree_count(&self) -> usize {
		self.tree_sizes.len()
	}

	pub fn tree_depth(&self, tree: usize) -> usize {
		self.tree_sizes[tree]
	}

	pub fn tree_splits(&self, tree: usize) -> &[BinarySplit] {
		&self.tree_splits[self.tree_split_offsets[tree]..self.tree_split_offsets[tree + 1]]
	}

	pub fn tree_leaf_values(&self, tree: usize) -> &[f64] {
		&self.leaf_values[self.tree_leaf_offsets[tree]..self.tree_leaf_offsets[tree + 1]]
	}

	/// The number of byte buckets in a binary code block: one per float feature, one per one hot feature and one per ctr feature, in that order.
	pub fn effective_bucket_count(&self) -> usize {
		self.float_features.len() + self.one_hot_features.len() + self.ctr_features.len()
	}

	/// The ctrs the statistics provider is asked for, one per ctr feature.
	pub fn used_ctrs(&self) -> &[ModelCtr] {
		&self.used_ctrs
	}

	/// The categorical slot read by each one hot feature.
	pub fn one_hot_cat_slots(&self) -> &[usize] {
		&self.one_hot_cat_slots
	}

	pub fn statistics_provider(&self) -> Option<&dyn StatisticsProvider> {
		self.statistics_provider.as_deref()
	}
}

fn validate_borders(kind: &'static str, feature: usize, borders: &[f32]) -> Result<(), ModelError> {
	if borders.len() > MAX_BORDERS_PER_FEATURE {
		return Err(ModelError::TooManyBorders {
			kind,
			feature,
			count: borders.len(),
		});
	}
	let sorted = borders.iter().all(|border| border.is_finite())
		&& borders.iter().tuple_windows().all(|(a, b)| a <= b);
	if !sorted {
		return Err(ModelError::UnsortedBorders { kind, feature });
	}
	Ok(())
}

#[cfg(test)]
fn single_float_parts() -> ObliviousModelParts {
	ObliviousModelParts {
		float_features: vec![FloatFeature {
			index: 0,
			borders: vec![0.5, 1.5],
		}],
		approx_dimension: 1,
		tree_sizes: vec![1],
		tree_splits: vec![BinarySplit::greater_or_equal(0, 1)],
		leaf_values: vec![10.0, 20.0],
		..Default::default()
	}
}

#[test]
fn test_offsets() {
	let model = ObliviousModel::new(ObliviousModelParts {
		float_features: vec![
			FloatFeature {
				index: 0,
				borders: vec![0.5],
			},
			FloatFeature {
				index: 3,
				borders: vec![-1.0, 1.0],
			},
		],
		approx_dimension: 2,
		tree_sizes: vec![0, 2, 1],
		tree_splits: vec![
			BinarySplit::greater_or_equal(0, 1),
			BinarySplit::greater_or_equal(1, 2),
			BinarySplit::greater_or_equal(1, 1),
		],
		leaf_values: (0..14).map(f64::from).collect(),
		..Default::default()
	})
	.unwrap();
	assert_eq!(model.tree_count(), 3);
	assert_eq!(
		(0..3).map(|tree| model.tree_depth(tree)).collect::<Vec<_>>(),
		vec![0, 2, 1]
	);
	assert_eq!(model.effective_bucket_count(), 2);
	assert!(model.tree_splits(0).is_empty());
	assert_eq!(model.tree_leaf_values(0), &[0.0, 1.0]);
	assert_eq!(model.tree_splits(1).len(), 2);
	assert_eq!(model.tree_leaf_values(1), &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
	assert_eq!(model.tree_splits(2), &[BinarySplit::greater_or_equal(1, 1)]);
	assert_eq!(model.tree_leaf_values(2), &[10.0, 11.0, 12.0, 13.0]);
}

#[test]
fn test_rejects_invalid_models() {
	let mut parts = single_float_parts();
	parts.float_features[0].borders = vec![1.5, 0.5];
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::UnsortedBorders {
			kind: "float",
			feature: 0
		}
	);
	let mut parts = single_float_parts();
	parts.float_features[0].borders = vec![0.5, f32::NAN];
	assert!(matches!(
		ObliviousModel::new(parts),
		Err(ModelError::UnsortedBorders { .. })
	));
	let mut parts = single_float_parts();
	parts.float_features[0].borders = (0..256).map(|i| i as f32).collect();
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::TooManyBorders {
			kind: "float",
			feature: 0,
			count: 256
		}
	);
	let mut parts = single_float_parts();
	parts.leaf_values.push(30.0);
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::LeafValueCountMismatch {
			expected: 2,
			actual: 3
		}
	);
	let mut parts = single_float_parts();
	parts.tree_splits[0].bucket = 1;
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::SplitBucketOutOfRange {
			tree: 0,
			bucket: 1,
			bucket_count: 1
		}
	);
	let mut parts = single_float_parts();
	parts.approx_dimension = 0;
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::ZeroApproxDimension
	);
	let mut parts = single_float_parts();
	parts.one_hot_features = vec![OneHotFeature {
		cat_feature_index: 7,
		values: vec![1, 2],
	}];
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::UnknownCatFeature {
			feature: 0,
			cat_feature_index: 7
		}
	);
	let mut parts = single_float_parts();
	parts.cat_features = vec![CatFeature { index: 1 }];
	parts.ctr_features = vec![CtrFeature {
		ctr: ModelCtr {
			base: ModelCtrBase {
				projection: vec![0],
				ctr_type: CtrType::Borders,
				target_border_index: 0,
			},
			prior_numerator: 0.0,
			prior_denominator: 1.0,
			shift: 0.0,
			scale: 1.0,
		},
		borders: vec![0.5],
	}];
	assert_eq!(
		ObliviousModel::new(parts).unwrap_err(),
		ModelError::MissingStatisticsProvider
	);
}

#[test]
fn test_one_hot_slots() {
	let mut parts = single_float_parts();
	parts.cat_features = vec![CatFeature { index: 4 }, CatFeature { index: 2 }];
	parts.one_hot_features = vec![
		OneHotFeature {
			cat_feature_index: 2,
			values: vec![7],
		},
		OneHotFeature {
			cat_feature_index: 4,
			values: vec![9, 11],
		},
	];
	let model = ObliviousModel::new(parts).unwrap();
	assert_eq!(model.one_hot_cat_slots(), &[1, 0]);
	assert_eq!(model.effective_bucket_count(), 3);
}

#[test]
fn test_split_bits() {
	let split = BinarySplit::greater_or_equal(0, 2);
	assert!(!split.bit(1, true));
	assert!(split.bit(2, true));
	let split = BinarySplit::equal(0, 3);
	assert!(split.bit(3, true));
	assert!(!split.bit(2, true));
	assert!(!split.bit(4, true));
	assert!(!split.bit(0, true));
	// Without the mask the equality split degenerates to `code >= 0xff`.
	assert!(!split.bit(3, false));
}
