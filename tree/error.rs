use thiserror::Error;

/// A `PreconditionError` means the caller passed arguments the evaluation cannot work with. It is raised before any computation begins and aborts the whole call.
#[derive(Debug, Error, PartialEq)]
pub enum PreconditionError {
	#[error("the results buffer has {actual} values but {expected} were expected")]
	ResultSizeMismatch { expected: usize, actual: usize },
	#[error("the tree range {tree_start}..{tree_end} is not within 0..{tree_count}")]
	TreeRangeOutOfBounds {
		tree_start: usize,
		tree_end: usize,
		tree_count: usize,
	},
	#[error("this evaluation requires an approx dimension of 1 but the model has {0}")]
	ApproxDimensionNotOne(usize),
	#[error("the increment step must be at least 1")]
	ZeroIncrementStep,
	#[error("the block size must be at least 1")]
	ZeroBlockSize,
	#[error("the {buffer} buffer holds {capacity} values but {required} are required")]
	ScratchBufferTooSmall {
		buffer: &'static str,
		capacity: usize,
		required: usize,
	},
	#[error("the binary codes have {actual} buckets but the model has {expected}")]
	BucketCountMismatch { expected: usize, actual: usize },
	#[error("the document range {start}..{end} is reversed")]
	InvalidDocumentRange { start: usize, end: usize },
	#[error("expected {expected} documents but got {actual}")]
	DocumentCountMismatch { expected: usize, actual: usize },
	#[error("{kind} feature column {index} is missing, there are {column_count} columns")]
	MissingFeatureColumn {
		kind: &'static str,
		index: usize,
		column_count: usize,
	},
}

pub(crate) fn check_tree_range(
	tree_start: usize,
	tree_end: usize,
	tree_count: usize,
) -> Result<(), PreconditionError> {
	if tree_start > tree_end || tree_end > tree_count {
		return Err(PreconditionError::TreeRangeOutOfBounds {
			tree_start,
			tree_end,
			tree_count,
		});
	}
	Ok(())
}

pub(crate) fn check_result_size(expected: usize, actual: usize) -> Result<(), PreconditionError> {
	if expected != actual {
		return Err(PreconditionError::ResultSizeMismatch { expected, actual });
	}
	Ok(())
}

#[test]
fn test_tree_range() {
	assert!(check_tree_range(0, 0, 0).is_ok());
	assert!(check_tree_range(2, 5, 5).is_ok());
	assert_eq!(
		check_tree_range(3, 2, 5),
		Err(PreconditionError::TreeRangeOutOfBounds {
			tree_start: 3,
			tree_end: 2,
			tree_count: 5
		})
	);
	assert!(check_tree_range(0, 6, 5).is_err());
}
