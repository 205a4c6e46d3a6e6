use ndarray::prelude::*;

/**
`Contributions` holds one attribution per feature, per output, for every explained instance, in an array of shape `[n_instances, n_features + 1, n_outputs]`. The last entry along the feature axis is the bias: the expected value of the model, which the feature contributions move the prediction away from.

Each instance's contributions are contiguous, with feature `f` and output `o` at offset `f * n_outputs + o`.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct Contributions {
	pub values: Array3<f32>,
}

/// `InteractionContributions` holds pairwise interaction values in an array of shape `[n_instances, n_features + 1, n_features + 1, n_outputs]`. Off the diagonal, `[i, j, k]` and `[j, i, k]` each hold half of the interaction between features `i` and `j`. The diagonal holds each feature's main effect, and `[n_features, n_features]` holds the bias.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionContributions {
	pub values: Array4<f32>,
}

impl Contributions {
	pub fn zeros(n_instances: usize, n_features: usize, n_outputs: usize) -> Self {
		Self {
			values: Array3::zeros((n_instances, n_features + 1, n_outputs)),
		}
	}

	pub fn n_instances(&self) -> usize {
		self.values.len_of(Axis(0))
	}

	pub fn n_features(&self) -> usize {
		self.values.len_of(Axis(1)) - 1
	}

	pub fn n_outputs(&self) -> usize {
		self.values.len_of(Axis(2))
	}

	/// The contributions of one instance, with shape `[n_features + 1, n_outputs]`.
	pub fn instance(&self, instance: usize) -> ArrayView2<f32> {
		self.values.index_axis(Axis(0), instance)
	}

	pub fn bias(&self, instance: usize, output: usize) -> f32 {
		self.values[[instance, self.n_features(), output]]
	}

	/// The sum of every feature contribution and the bias, which equals the explained prediction.
	pub fn row_sum(&self, instance: usize, output: usize) -> f32 {
		self.values
			.slice(s![instance, .., output])
			.iter()
			.sum::<f32>()
	}

	/// The row size used by the explainers when writing each instance's contributions in parallel.
	pub(crate) fn row_size(&self) -> usize {
		self.values.len_of(Axis(1)) * self.values.len_of(Axis(2))
	}

	pub(crate) fn as_slice_mut(&mut self) -> &mut [f32] {
		self.values
			.as_slice_mut()
			.expect("contributions are always in standard layout")
	}
}

impl InteractionContributions {
	pub fn zeros(n_instances: usize, n_features: usize, n_outputs: usize) -> Self {
		Self {
			values: Array4::zeros((n_instances, n_features + 1, n_features + 1, n_outputs)),
		}
	}

	pub fn n_instances(&self) -> usize {
		self.values.len_of(Axis(0))
	}

	pub fn n_features(&self) -> usize {
		self.values.len_of(Axis(1)) - 1
	}

	pub fn n_outputs(&self) -> usize {
		self.values.len_of(Axis(3))
	}

	pub fn bias(&self, instance: usize, output: usize) -> f32 {
		let n_features = self.n_features();
		self.values[[instance, n_features, n_features, output]]
	}

	/// Sum each feature's row of interactions, which recovers its plain contribution.
	pub fn row_sums(&self) -> Contributions {
		Contributions {
			values: self.values.sum_axis(Axis(2)),
		}
	}

	pub(crate) fn row_size(&self) -> usize {
		self.values.len_of(Axis(1)) * self.values.len_of(Axis(2)) * self.values.len_of(Axis(3))
	}

	pub(crate) fn as_slice_mut(&mut self) -> &mut [f32] {
		self.values
			.as_slice_mut()
			.expect("interaction contributions are always in standard layout")
	}
}

#[test]
fn test_contributions() {
	let mut contributions = Contributions::zeros(2, 1, 1);
	contributions
		.as_slice_mut()
		.copy_from_slice(&[-0.75, 1.75, 0.5, 1.0]);
	assert_eq!(contributions.row_size(), 2);
	assert_eq!(contributions.bias(0, 0), 1.75);
	assert_eq!(contributions.row_sum(0, 0), 1.0);
	assert_eq!(contributions.row_sum(1, 0), 1.5);
	assert_eq!(contributions.instance(1), arr2(&[[0.5], [1.0]]));
}

#[test]
fn test_interaction_row_sums() {
	let mut interactions = InteractionContributions::zeros(1, 1, 1);
	interactions
		.as_slice_mut()
		.copy_from_slice(&[0.25, 0.5, 0.5, 2.0]);
	let contributions = interactions.row_sums();
	assert_eq!(contributions.values, ndarray::arr3(&[[[0.75], [2.5]]]));
	assert_eq!(interactions.bias(0, 0), 2.0);
}
