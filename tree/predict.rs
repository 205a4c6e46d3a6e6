use crate::{
	dataset::{ExplanationDataset, Instance},
	ensemble::{FinalizedTreeEnsemble, Node, TreeView},
	error::Result,
	pzip,
	transform::ModelTransform,
};
use ndarray::prelude::*;
use rayon::prelude::*;

/// Make a prediction for a single tree, returning the values of the leaf the instance lands in.
pub fn tree_predict<'a>(tree: &TreeView<'a>, instance: &Instance) -> &'a [f32] {
	// Start at the root node.
	let mut node_index = 0;
	// Traverse the tree until we get to a leaf.
	loop {
		match tree.node(node_index) {
			Node::Branch(branch) => node_index = branch.next(instance),
			Node::Leaf(leaf) => return leaf.value,
		}
	}
}

/// The raw margin of the ensemble for one output: `base_offset` plus every tree's leaf value.
pub fn margin(ensemble: &FinalizedTreeEnsemble, instance: &Instance, output: usize) -> f32 {
	ensemble.base_offset()
		+ ensemble
			.trees()
			.map(|tree| tree_predict(&tree, instance)[output])
			.sum::<f32>()
}

/// Predict every instance in `data`, returning an array of shape `[n_instances, n_outputs]`. The transform reads each instance's label, or 0 if the dataset has none.
pub fn dense_tree_predict(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	transform: ModelTransform,
) -> Result<Array2<f32>> {
	ensemble.check_n_features(data.n_features())?;
	let n_outputs = ensemble.n_outputs();
	let mut predictions = Array2::<f32>::zeros((data.n_instances(), n_outputs));
	pzip!(
		predictions.axis_iter_mut(Axis(0)),
		(0..data.n_instances()).into_par_iter(),
	)
	.for_each(|(mut prediction, instance_index)| {
		let instance = data.instance(instance_index);
		prediction.fill(ensemble.base_offset());
		for tree in ensemble.trees() {
			for (p, v) in prediction.iter_mut().zip(tree_predict(&tree, &instance)) {
				*p += v;
			}
		}
		let label = data.label(instance_index);
		prediction.mapv_inplace(|margin| transform.apply(margin, label));
	});
	Ok(predictions)
}

#[cfg(test)]
use crate::testing::{branch, branch_default_right, finalized, leaf, multi_output_leaf};

#[test]
fn test_tree_predict() {
	let ensemble = finalized(
		&[vec![
			branch_default_right(0, 0.5, 1, 2, 4.0),
			leaf(1.0, 3.0),
			leaf(4.0, 1.0),
		]],
		0.0,
	);
	let tree = ensemble.tree(0);
	let missing = [false];
	assert_eq!(tree_predict(&tree, &Instance::new(&[0.5], &missing)), &[1.0]);
	assert_eq!(tree_predict(&tree, &Instance::new(&[0.6], &missing)), &[4.0]);
	// A missing value takes the default child regardless of its value.
	assert_eq!(tree_predict(&tree, &Instance::new(&[0.0], &[true])), &[4.0]);
}

#[test]
fn test_dense_tree_predict() {
	let ensemble = finalized(
		&[
			vec![
				branch(0, 0.5, 1, 2, 4.0),
				multi_output_leaf(vec![1.0, -1.0], 3.0),
				multi_output_leaf(vec![4.0, 2.0], 1.0),
			],
			vec![
				branch(1, 0.5, 1, 2, 4.0),
				multi_output_leaf(vec![0.5, 0.5], 2.0),
				multi_output_leaf(vec![-0.5, 1.0], 2.0),
			],
		],
		0.25,
	);
	let x = [0.2, 0.8, 0.7, 0.1];
	let x_missing = [false; 4];
	let data = ExplanationDataset::new(&x, &x_missing, 2).unwrap();
	let predictions = dense_tree_predict(&ensemble, &data, ModelTransform::Identity).unwrap();
	assert_eq!(predictions, arr2(&[[0.75, 0.25], [4.75, 2.75]]));
	assert_eq!(margin(&ensemble, &data.instance(1), 1), 2.75);
	let labels = [1.0, 2.0];
	let data = data.with_labels(&labels).unwrap();
	let losses = dense_tree_predict(&ensemble, &data, ModelTransform::SquaredLoss).unwrap();
	assert_eq!(losses, arr2(&[[0.0625, 0.5625], [7.5625, 0.5625]]));
}
