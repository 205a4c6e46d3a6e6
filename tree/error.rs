use thiserror::Error;

pub type Result<T, E = ExplainError> = std::result::Result<T, E>;

/// Everything that can stop an explanation before it starts. Nothing here is raised once per-instance work has begun, so a batch either fails up front or produces every row.
#[derive(Debug, Error)]
pub enum ExplainError {
	#[error("the ensemble has no trees")]
	EmptyEnsemble,
	#[error("expected {name} to have length {expected}, but it has length {actual}")]
	LengthMismatch {
		name: &'static str,
		expected: usize,
		actual: usize,
	},
	#[error("tree {tree} node {node} points to child {child}, which is outside 0..{max_nodes}")]
	DanglingChild {
		tree: usize,
		node: usize,
		child: i32,
		max_nodes: usize,
	},
	#[error("tree {tree} node {node} is neither a leaf (all children -1) nor a branch (left, right, and default children set)")]
	MalformedNode { tree: usize, node: usize },
	#[error("tree {tree} node {node} is reachable along more than one path")]
	NotATree { tree: usize, node: usize },
	#[error("tree {tree} node {node} splits on feature {feature}, but the data has {n_features} features")]
	FeatureOutOfRange {
		tree: usize,
		node: usize,
		feature: i32,
		n_features: usize,
	},
	#[error("tree {tree} node {node} has sample weight {weight}, which is negative or not finite")]
	InvalidSampleWeight { tree: usize, node: usize, weight: f32 },
	#[error("{0}")]
	UnsupportedCombination(&'static str),
	#[error("{0} requires a background dataset")]
	MissingBackground(&'static str),
	#[error("the estimated cost of {estimated} node visits exceeds the limit of {limit}")]
	CostLimitExceeded { estimated: u64, limit: u64 },
	#[error("output {output} is out of range for an ensemble with {n_outputs} outputs")]
	OutputOutOfRange { output: usize, n_outputs: usize },
}
