use crate::{
	ctr::{projection_hash, CtrStats, CtrValueTable, StaticCtrProvider},
	model::*,
};
use anyhow::Result;
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use std::{collections::HashMap, sync::Arc};

/// One float feature with borders at 0.5 and 1.5 and a single tree that splits on codes of at least 1, with leaves 10 and 20.
pub fn single_split_model() -> ObliviousModel {
	ObliviousModel::new(ObliviousModelParts {
		float_features: vec![FloatFeature {
			index: 0,
			borders: vec![0.5, 1.5],
		}],
		approx_dimension: 1,
		tree_sizes: vec![1],
		tree_splits: vec![BinarySplit::greater_or_equal(0, 1)],
		leaf_values: vec![10.0, 20.0],
		..Default::default()
	})
	.unwrap()
}

/// One float feature with borders at 0.5 and 1.5, an approx dimension of 2 and two single split trees on codes 1 and 2.
pub fn multi_dimension_model() -> ObliviousModel {
	ObliviousModel::new(ObliviousModelParts {
		float_features: vec![FloatFeature {
			index: 0,
			borders: vec![0.5, 1.5],
		}],
		approx_dimension: 2,
		tree_sizes: vec![1, 1],
		tree_splits: vec![
			BinarySplit::greater_or_equal(0, 1),
			BinarySplit::greater_or_equal(0, 2),
		],
		leaf_values: vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 10.0, 30.0],
		..Default::default()
	})
	.unwrap()
}

/// Two float features and a one hot feature over the categorical feature with index 2.
pub fn float_and_one_hot_model() -> ObliviousModel {
	ObliviousModel::new(ObliviousModelParts {
		float_features: vec![
			FloatFeature {
				index: 0,
				borders: vec![0.5, 1.5],
			},
			FloatFeature {
				index: 1,
				borders: vec![-0.5],
			},
		],
		cat_features: vec![CatFeature { index: 2 }],
		one_hot_features: vec![OneHotFeature {
			cat_feature_index: 2,
			values: vec![3, 7],
		}],
		approx_dimension: 1,
		tree_sizes: vec![2, 1, 0],
		tree_splits: vec![
			BinarySplit::greater_or_equal(0, 1),
			BinarySplit::equal(2, 2),
			BinarySplit::greater_or_equal(1, 1),
		],
		leaf_values: vec![1.0, 2.0, 3.0, 4.0, 0.25, 0.5, 100.0],
		..Default::default()
	})
	.unwrap()
}

/// Two categorical features, a one hot feature over the second and a borders ctr over both. The ctr's table only knows the key for the hashes (1, 2).
pub fn ctr_model() -> ObliviousModel {
	let ctr = ModelCtr {
		base: ModelCtrBase {
			projection: vec![0, 1],
			ctr_type: CtrType::Borders,
			target_border_index: 0,
		},
		prior_numerator: 0.5,
		prior_denominator: 1.0,
		shift: 0.0,
		scale: 1.0,
	};
	let mut stats = HashMap::new();
	stats.insert(projection_hash(vec![1, 2]), CtrStats { sum: 3.5, count: 4.0 });
	let mut provider = StaticCtrProvider::new();
	provider.insert_table(
		ctr.base.clone(),
		CtrValueTable {
			stats,
			counter_denominator: 0.0,
		},
	);
	ObliviousModel::new(ObliviousModelParts {
		cat_features: vec![CatFeature { index: 0 }, CatFeature { index: 1 }],
		one_hot_features: vec![OneHotFeature {
			cat_feature_index: 1,
			values: vec![2],
		}],
		ctr_features: vec![CtrFeature {
			ctr,
			borders: vec![0.25, 0.75],
		}],
		approx_dimension: 1,
		tree_sizes: vec![2],
		tree_splits: vec![
			BinarySplit::greater_or_equal(1, 2),
			BinarySplit::equal(0, 1),
		],
		leaf_values: vec![0.0, 1.0, 2.0, 3.0],
		statistics_provider: Some(Arc::new(provider)),
		..Default::default()
	})
	.unwrap()
}

const RANDOM_FLOAT_FEATURE_COUNT: usize = 3;
const RANDOM_CAT_FEATURE_COUNT: usize = 2;
const RANDOM_CAT_VALUE_COUNT: i32 = 6;

/// A model with every kind of feature, random borders, trees of depth 0 through 6, equality splits and splits with an inverting mask. Float features use the indexes 0 through 2 and categorical features 3 and 4.
pub fn random_model(seed: u64, approx_dimension: usize, tree_count: usize) -> ObliviousModel {
	let mut rng = Xoshiro256Plus::seed_from_u64(seed);
	let float_features: Vec<FloatFeature> = (0..RANDOM_FLOAT_FEATURE_COUNT)
		.map(|index| {
			let border_count = rng.gen_range(0..20);
			FloatFeature {
				index,
				borders: sorted_borders(&mut rng, border_count, -2.0, 2.0),
			}
		})
		.collect();
	let cat_features = vec![CatFeature { index: 3 }, CatFeature { index: 4 }];
	let one_hot_features = vec![
		OneHotFeature {
			cat_feature_index: 3,
			values: vec![0, 1, 2],
		},
		OneHotFeature {
			cat_feature_index: 4,
			values: vec![5, 1],
		},
	];
	let borders_ctr = ModelCtr {
		base: ModelCtrBase {
			projection: vec![0, 1],
			ctr_type: CtrType::Borders,
			target_border_index: 0,
		},
		prior_numerator: 0.5,
		prior_denominator: 1.0,
		shift: 0.0,
		scale: 1.0,
	};
	let counter_ctr = ModelCtr {
		base: ModelCtrBase {
			projection: vec![1],
			ctr_type: CtrType::Counter,
			target_border_index: 0,
		},
		prior_numerator: 0.0,
		prior_denominator: 1.0,
		shift: -0.5,
		scale: 2.0,
	};
	let mut provider = StaticCtrProvider::new();
	let mut stats = HashMap::new();
	for a in 0..RANDOM_CAT_VALUE_COUNT {
		for b in 0..RANDOM_CAT_VALUE_COUNT {
			if rng.gen_bool(0.7) {
				stats.insert(
					projection_hash(vec![a, b]),
					CtrStats {
						sum: rng.gen_range(0.0..5.0),
						count: 5.0,
					},
				);
			}
		}
	}
	provider.insert_table(
		borders_ctr.base.clone(),
		CtrValueTable {
			stats,
			counter_denominator: 0.0,
		},
	);
	let mut stats = HashMap::new();
	for b in 0..RANDOM_CAT_VALUE_COUNT {
		stats.insert(
			projection_hash(vec![b]),
			CtrStats {
				sum: 0.0,
				count: f32::from(rng.gen_range(0u8..10)),
			},
		);
	}
	provider.insert_table(
		counter_ctr.base.clone(),
		CtrValueTable {
			stats,
			counter_denominator: 9.0,
		},
	);
	let ctr_features = vec![
		CtrFeature {
			ctr: borders_ctr,
			borders: sorted_borders(&mut rng, 5, 0.0, 1.0),
		},
		CtrFeature {
			ctr: counter_ctr,
			borders: sorted_borders(&mut rng, 8, -1.0, 1.0),
		},
	];
	// The largest code each bucket can take.
	let max_codes: Vec<u8> = float_features
		.iter()
		.map(|feature| feature.borders.len())
		.chain(one_hot_features.iter().map(|feature| feature.values.len()))
		.chain(ctr_features.iter().map(|feature| feature.borders.len()))
		.map(|max_code| max_code as u8)
		.collect();
	let one_hot_buckets = float_features.len()..float_features.len() + one_hot_features.len();
	let mut tree_sizes = Vec::with_capacity(tree_count);
	let mut tree_splits = Vec::new();
	let mut leaf_values = Vec::new();
	for _ in 0..tree_count {
		let depth: usize = rng.gen_range(0..=6);
		tree_sizes.push(depth);
		for _ in 0..depth {
			let bucket = rng.gen_range(0..max_codes.len());
			let max_code = max_codes[bucket];
			let code = rng.gen_range(0..=max_code);
			let split = if one_hot_buckets.contains(&bucket) && rng.gen_bool(0.5) {
				BinarySplit::equal(bucket as u16, code)
			} else if rng.gen_bool(0.2) {
				BinarySplit {
					bucket: bucket as u16,
					border: 0xff - code,
					xor_mask: 0xff,
				}
			} else {
				BinarySplit::greater_or_equal(bucket as u16, code)
			};
			tree_splits.push(split);
		}
		for _ in 0..(1 << depth) * approx_dimension {
			leaf_values.push(rng.gen_range(-1.0..1.0));
		}
	}
	ObliviousModel::new(ObliviousModelParts {
		float_features,
		cat_features,
		one_hot_features,
		ctr_features,
		approx_dimension,
		tree_sizes,
		tree_splits,
		leaf_values,
		statistics_provider: Some(Arc::new(provider)),
	})
	.unwrap()
}

fn sorted_borders(rng: &mut Xoshiro256Plus, count: usize, low: f32, high: f32) -> Vec<f32> {
	let mut borders: Vec<f32> = (0..count).map(|_| rng.gen_range(low..high)).collect();
	borders.sort_by(|a, b| a.partial_cmp(b).unwrap());
	borders
}

/// Documents for `random_model`. The float matrix has one column per float feature index and about one value in twenty is NaN. The categorical matrix has one column per categorical slot.
pub fn random_documents(seed: u64, doc_count: usize) -> (Array2<f32>, Array2<i32>) {
	let mut rng = Xoshiro256Plus::seed_from_u64(seed);
	let floats = Array2::from_shape_fn((doc_count, RANDOM_FLOAT_FEATURE_COUNT), |_| {
		if rng.gen_bool(0.05) {
			f32::NAN
		} else {
			rng.gen_range(-2.5..2.5)
		}
	});
	let cats = Array2::from_shape_fn((doc_count, RANDOM_CAT_FEATURE_COUNT), |_| {
		rng.gen_range(0..RANDOM_CAT_VALUE_COUNT)
	});
	(floats, cats)
}

/// An accessor reading float features from a row major matrix by feature index.
pub fn float_accessor(
	floats: &Array2<f32>,
) -> impl Fn(&FloatFeature, usize) -> Result<f32> + Sync + '_ {
	move |feature: &FloatFeature, doc: usize| Ok(floats[[doc, feature.index]])
}

/// An accessor reading categorical hashes from a row major matrix by slot.
pub fn cat_accessor(cats: &Array2<i32>) -> impl Fn(usize, usize) -> Result<i32> + Sync + '_ {
	move |slot: usize, doc: usize| Ok(cats[[doc, slot]])
}
