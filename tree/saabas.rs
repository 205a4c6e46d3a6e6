use crate::{
	dataset::{ExplanationDataset, Instance},
	ensemble::{FinalizedTreeEnsemble, Node, TreeView},
	error::Result,
	Contributions,
};
use rayon::prelude::*;
use treeshap_progress::ProgressCounter;

/// Walk the instance's decision path and credit each change in expected value to the feature split on. This is fast but only approximates the SHAP values.
pub fn tree_saabas(tree: &TreeView, instance: &Instance, phi: &mut [f32]) {
	let n_outputs = tree.n_outputs();
	let mut node_index = 0;
	while let Node::Branch(branch) = tree.node(node_index) {
		let next_index = branch.next(instance);
		let offset = branch.feature_index * n_outputs;
		for (phi, (next_value, value)) in phi[offset..offset + n_outputs]
			.iter_mut()
			.zip(tree.value(next_index).iter().zip(branch.value))
		{
			*phi += next_value - value;
		}
		node_index = next_index;
	}
}

/// Approximate the contributions of every instance in `data`. Like the exact algorithms, the bias is `base_offset` plus the expected value of every tree, so each row sums to the prediction.
pub fn dense_tree_saabas(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	progress_counter: &ProgressCounter,
) -> Result<Contributions> {
	ensemble.check_n_features(data.n_features())?;
	let n_features = data.n_features();
	let n_outputs = ensemble.n_outputs();
	let mut contributions = Contributions::zeros(data.n_instances(), n_features, n_outputs);
	let row_size = contributions.row_size();
	contributions
		.as_slice_mut()
		.par_chunks_mut(row_size)
		.enumerate()
		.for_each(|(instance_index, phi)| {
			let instance = data.instance(instance_index);
			let (phi, bias) = phi.split_at_mut(n_features * n_outputs);
			bias.iter_mut().for_each(|b| *b = ensemble.base_offset());
			for tree in ensemble.trees() {
				tree_saabas(&tree, &instance, phi);
				for (b, value) in bias.iter_mut().zip(tree.value(0)) {
					*b += value;
				}
			}
			progress_counter.inc(1);
		});
	Ok(contributions)
}

#[cfg(test)]
use crate::{
	path_dependent::dense_tree_path_dependent,
	predict::margin,
	testing::{assert_close, branch, finalized, leaf},
};

#[test]
fn test_saabas_differs_from_exact() {
	let ensemble = finalized(
		&[vec![
			branch(0, 0.5, 1, 2, 10.0),
			branch(1, 0.5, 3, 4, 8.0),
			leaf(10.0, 2.0),
			leaf(0.0, 6.0),
			leaf(8.0, 2.0),
		]],
		0.0,
	);
	let x = [0.2, 0.8];
	let x_missing = [false; 2];
	let data = ExplanationDataset::new(&x, &x_missing, 2).unwrap();
	let saabas = dense_tree_saabas(&ensemble, &data, &ProgressCounter::new(1)).unwrap();
	let exact = dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(1)).unwrap();
	assert_close(saabas.values.as_slice().unwrap(), &[-1.6, 6.0, 3.6], 1e-6);
	assert_close(exact.values.as_slice().unwrap(), &[-1.0, 5.4, 3.6], 1e-5);
	let difference = saabas.values.clone() - &exact.values;
	assert_close(difference.as_slice().unwrap(), &[-0.6, 0.6, 0.0], 1e-5);
	let prediction = margin(&ensemble, &data.instance(0), 0);
	assert_eq!(prediction, 8.0);
	assert_close(&[saabas.row_sum(0, 0)], &[prediction], 1e-6);
}
