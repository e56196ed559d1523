use crate::model::{CtrType, ModelCtr, ModelCtrBase};
use anyhow::Result;
use ndarray::prelude::*;
use std::{collections::HashMap, fmt::Debug};
use thiserror::Error;

/// A `StatisticsProvider` computes continuous ctr values from the hashed categorical features of a block of documents. It is called once per block, after the float and one hot buckets of the block have been written.
pub trait StatisticsProvider: Debug + Send + Sync {
	fn compute_statistics(
		&self,
		ctrs: &[ModelCtr],
		// (n_buckets, n_docs)
		binary_codes: ArrayView2<u8>,
		// (n_cat_features, n_docs)
		hashed_cat_features: ArrayView2<i32>,
		// (n_ctrs, n_docs)
		statistics: ArrayViewMut2<f32>,
	) -> Result<()>;
}

const MAGIC_MULT: u64 = 0x4906_ba49_4954_cb65;

/// Combine two hashes.
pub fn calc_hash(a: u64, b: u64) -> u64 {
	MAGIC_MULT.wrapping_mul(a.wrapping_add(MAGIC_MULT.wrapping_mul(b)))
}

/// Compute the table key for a document from the hashes of the categorical features in a ctr's projection, in projection order.
pub fn projection_hash(values: impl IntoIterator<Item = i32>) -> u64 {
	values
		.into_iter()
		.fold(0, |hash, value| calc_hash(hash, u64::from(value as u32)))
}

/// For `Borders`, `Buckets` and `FloatTargetMeanValue` ctrs, `sum / count` is the raw statistic. `Counter` ctrs only use `count`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CtrStats {
	pub sum: f32,
	pub count: f32,
}

#[derive(Clone, Debug, Default)]
pub struct CtrValueTable {
	pub stats: HashMap<u64, CtrStats>,
	/// `Counter` ctrs divide by this instead of the per key count.
	pub counter_denominator: f32,
}

#[derive(Debug, Error, PartialEq)]
pub enum CtrProviderError {
	#[error("there is no value table for ctr {0:?}")]
	MissingTable(ModelCtrBase),
	#[error("the statistics buffer has shape {actual:?} but {expected:?} was expected")]
	ShapeMismatch {
		expected: (usize, usize),
		actual: (usize, usize),
	},
}

/// A `StatisticsProvider` backed by in memory value tables, one per `ModelCtrBase`.
#[derive(Debug, Default)]
pub struct StaticCtrProvider {
	tables: HashMap<ModelCtrBase, CtrValueTable>,
}

impl StaticCtrProvider {
	pub fn new() -> StaticCtrProvider {
		StaticCtrProvider::default()
	}

	pub fn insert_table(&mut self, base: ModelCtrBase, table: CtrValueTable) -> Option<CtrValueTable> {
		self.tables.insert(base, table)
	}

	pub fn table(&self, base: &ModelCtrBase) -> Option<&CtrValueTable> {
		self.tables.get(base)
	}
}

impl StatisticsProvider for StaticCtrProvider {
	fn compute_statistics(
		&self,
		ctrs: &[ModelCtr],
		_binary_codes: ArrayView2<u8>,
		hashed_cat_features: ArrayView2<i32>,
		mut statistics: ArrayViewMut2<f32>,
	) -> Result<()> {
		let expected = (ctrs.len(), hashed_cat_features.ncols());
		if statistics.dim() != expected {
			return Err(CtrProviderError::ShapeMismatch {
				expected,
				actual: statistics.dim(),
			}
			.into());
		}
		for (ctr, mut values) in ctrs.iter().zip(statistics.axis_iter_mut(Axis(0))) {
			let table = self
				.tables
				.get(&ctr.base)
				.ok_or_else(|| CtrProviderError::MissingTable(ctr.base.clone()))?;
			for (doc, value) in values.iter_mut().enumerate() {
				let key = projection_hash(
					ctr.base
						.projection
						.iter()
						.map(|slot| hashed_cat_features[[*slot, doc]]),
				);
				let stats = table.stats.get(&key).copied().unwrap_or_default();
				*value = match ctr.base.ctr_type {
					CtrType::Counter => ctr.calc(stats.count, table.counter_denominator),
					CtrType::Borders | CtrType::Buckets | CtrType::FloatTargetMeanValue => {
						ctr.calc(stats.sum, stats.count)
					}
				};
			}
		}
		Ok(())
	}
}

#[cfg(test)]
fn borders_ctr(projection: Vec<usize>) -> ModelCtr {
	ModelCtr {
		base: ModelCtrBase {
			projection,
			ctr_type: CtrType::Borders,
			target_border_index: 0,
		},
		prior_numerator: 1.0,
		prior_denominator: 2.0,
		shift: 0.0,
		scale: 1.0,
	}
}

#[test]
fn test_projection_hash() {
	assert_eq!(projection_hash(vec![]), 0);
	assert_eq!(projection_hash(vec![5]), calc_hash(0, 5));
	assert_ne!(projection_hash(vec![1, 2]), projection_hash(vec![2, 1]));
	assert_eq!(projection_hash(vec![-1]), calc_hash(0, u64::from(u32::MAX)));
}

#[test]
fn test_static_provider() {
	let ctr = borders_ctr(vec![0, 1]);
	let mut counter_ctr = borders_ctr(vec![1]);
	counter_ctr.base.ctr_type = CtrType::Counter;
	counter_ctr.prior_numerator = 0.0;
	counter_ctr.prior_denominator = 0.0;
	let mut provider = StaticCtrProvider::new();
	let mut stats = HashMap::new();
	stats.insert(projection_hash(vec![7, 3]), CtrStats { sum: 3.0, count: 4.0 });
	provider.insert_table(
		ctr.base.clone(),
		CtrValueTable {
			stats,
			counter_denominator: 0.0,
		},
	);
	let mut stats = HashMap::new();
	stats.insert(projection_hash(vec![3]), CtrStats { sum: 0.0, count: 5.0 });
	provider.insert_table(
		counter_ctr.base.clone(),
		CtrValueTable {
			stats,
			counter_denominator: 10.0,
		},
	);
	assert_eq!(provider.table(&ctr.base).map(|table| table.stats.len()), Some(1));
	assert_eq!(
		provider
			.table(&counter_ctr.base)
			.map(|table| table.counter_denominator),
		Some(10.0)
	);
	assert!(provider.table(&borders_ctr(vec![1, 0]).base).is_none());
	let hashed_cat_features = arr2(&[[7, 8], [3, 3]]);
	let binary_codes = Array2::<u8>::zeros((0, 2));
	let mut statistics = Array2::<f32>::zeros((2, 2));
	provider
		.compute_statistics(
			&[ctr, counter_ctr],
			binary_codes.view(),
			hashed_cat_features.view(),
			statistics.view_mut(),
		)
		.unwrap();
	// (3 + 1) / (4 + 2) for the known key and (0 + 1) / (0 + 2) for the unknown one.
	assert_eq!(statistics, arr2(&[[4.0 / 6.0, 0.5], [0.5, 0.5]]));
}

#[test]
fn test_static_provider_missing_table() {
	let provider = StaticCtrProvider::new();
	let ctr = borders_ctr(vec![0]);
	let hashed_cat_features = arr2(&[[1]]);
	let binary_codes = Array2::<u8>::zeros((0, 1));
	let mut statistics = Array2::<f32>::zeros((1, 1));
	let error = provider
		.compute_statistics(
			&[ctr.clone()],
			binary_codes.view(),
			hashed_cat_features.view(),
			statistics.view_mut(),
		)
		.unwrap_err();
	assert_eq!(
		error.downcast_ref::<CtrProviderError>(),
		Some(&CtrProviderError::MissingTable(ctr.base))
	);
}
