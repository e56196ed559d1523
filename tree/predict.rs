use crate::{
	error::PreconditionError,
	intervals::calc_tree_intervals_generic,
	model::{FloatFeature, ObliviousModel},
	parallel::calc_generic_parallel,
	EvaluatorOptions,
};
use anyhow::Result;
use ndarray::prelude::*;

/**
Make predictions for the documents in the rows of `float_features` and `cat_features` with every tree of `model`. Column `j` of `float_features` is read for the float feature whose `index` is `j`, and column `k` of `cat_features` holds the hashes of the model's `k`th categorical feature. The output has one row per document and `approx_dimension` columns. Blocks are evaluated in parallel.
*/
pub fn predict(
	model: &ObliviousModel,
	float_features: ArrayView2<f32>,
	cat_features: ArrayView2<i32>,
	options: &EvaluatorOptions,
) -> Result<Array2<f64>> {
	let doc_count = check_feature_matrices(model, float_features, cat_features)?;
	let approx_dimension = model.approx_dimension();
	let mut predictions = vec![0.0; doc_count * approx_dimension];
	calc_generic_parallel(
		model,
		&|feature: &FloatFeature, doc: usize| Ok(float_features[[doc, feature.index]]),
		&|slot: usize, doc: usize| Ok(cat_features[[doc, slot]]),
		doc_count,
		0,
		model.tree_count(),
		&mut predictions,
		options,
	)?;
	Ok(Array2::from_shape_vec(
		(doc_count, approx_dimension),
		predictions,
	)?)
}

/// Make staged predictions, one column per `increment_step` trees. See [`calc_tree_intervals_generic`](fn.calc_tree_intervals_generic.html).
pub fn predict_staged(
	model: &ObliviousModel,
	float_features: ArrayView2<f32>,
	cat_features: ArrayView2<i32>,
	increment_step: usize,
	options: &EvaluatorOptions,
) -> Result<Array2<f64>> {
	let doc_count = check_feature_matrices(model, float_features, cat_features)?;
	calc_tree_intervals_generic(
		model,
		&|feature: &FloatFeature, doc: usize| Ok(float_features[[doc, feature.index]]),
		&|slot: usize, doc: usize| Ok(cat_features[[doc, slot]]),
		doc_count,
		increment_step,
		options,
	)
}

/// Check that every column the model reads is present and return the number of documents.
fn check_feature_matrices(
	model: &ObliviousModel,
	float_features: ArrayView2<f32>,
	cat_features: ArrayView2<i32>,
) -> Result<usize, PreconditionError> {
	let doc_count = float_features.nrows();
	if cat_features.nrows() != doc_count {
		return Err(PreconditionError::DocumentCountMismatch {
			expected: doc_count,
			actual: cat_features.nrows(),
		});
	}
	if let Some(feature) = model
		.float_features()
		.iter()
		.find(|feature| feature.index >= float_features.ncols())
	{
		return Err(PreconditionError::MissingFeatureColumn {
			kind: "float",
			index: feature.index,
			column_count: float_features.ncols(),
		});
	}
	let cat_count = model.cat_features().len();
	if cat_count > cat_features.ncols() {
		return Err(PreconditionError::MissingFeatureColumn {
			kind: "cat",
			index: cat_count - 1,
			column_count: cat_features.ncols(),
		});
	}
	Ok(doc_count)
}

#[test]
fn test_predict() {
	let model = crate::testing::single_split_model();
	let float_features = arr2(&[[0.3], [2.0], [f32::NAN], [1.0]]);
	let cat_features = Array2::<i32>::zeros((4, 0));
	let predictions = predict(
		&model,
		float_features.view(),
		cat_features.view(),
		&EvaluatorOptions::default(),
	)
	.unwrap();
	insta::assert_debug_snapshot!(predictions.into_raw_vec(), @r###"
 [
     10.0,
     20.0,
     10.0,
     20.0,
 ]
 "###);
}

#[test]
fn test_predict_matches_calc() {
	use crate::testing::{cat_accessor, float_accessor, random_documents, random_model};
	let model = random_model(15, 3, 35);
	let (floats, cats) = random_documents(16, 260);
	let predictions = predict(
		&model,
		floats.view(),
		cats.view(),
		&EvaluatorOptions::default(),
	)
	.unwrap();
	assert_eq!(predictions.dim(), (260, 3));
	let mut expected = vec![0.0; 260 * 3];
	crate::calc::calc_generic(
		&model,
		&float_accessor(&floats),
		&cat_accessor(&cats),
		260,
		0,
		35,
		&mut expected,
		&EvaluatorOptions::default(),
	)
	.unwrap();
	assert_eq!(predictions.into_raw_vec(), expected);
}

#[test]
fn test_predict_staged() {
	use crate::testing::{random_documents, random_model};
	let model = random_model(17, 1, 12);
	let (floats, cats) = random_documents(18, 90);
	let options = EvaluatorOptions::default();
	let staged = predict_staged(&model, floats.view(), cats.view(), 5, &options).unwrap();
	assert_eq!(staged.dim(), (90, 3));
	let predictions = predict(&model, floats.view(), cats.view(), &options).unwrap();
	assert_eq!(staged.column(2), predictions.column(0));
}

#[test]
fn test_predict_missing_columns() {
	let model = crate::testing::float_and_one_hot_model();
	let options = EvaluatorOptions::default();
	let error = predict(
		&model,
		Array2::<f32>::zeros((3, 1)).view(),
		Array2::<i32>::zeros((3, 1)).view(),
		&options,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::MissingFeatureColumn {
			kind: "float",
			index: 1,
			column_count: 1
		})
	);
	let error = predict(
		&model,
		Array2::<f32>::zeros((3, 2)).view(),
		Array2::<i32>::zeros((3, 0)).view(),
		&options,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::MissingFeatureColumn {
			kind: "cat",
			index: 0,
			column_count: 0
		})
	);
	let error = predict_staged(
		&model,
		Array2::<f32>::zeros((3, 2)).view(),
		Array2::<i32>::zeros((2, 1)).view(),
		1,
		&options,
	)
	.unwrap_err();
	assert_eq!(
		error.downcast_ref::<PreconditionError>(),
		Some(&PreconditionError::DocumentCountMismatch {
			expected: 3,
			actual: 2
		})
	);
}
