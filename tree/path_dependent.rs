use crate::{
	dataset::{ExplanationDataset, Instance},
	ensemble::{FinalizedTreeEnsemble, Node, TreeView},
	error::Result,
	path::{extend_path, unwind_path, unwound_path_sum, PathBuffer, PathElement},
	Contributions,
};
use rayon::prelude::*;
use treeshap_progress::ProgressCounter;

/// Computing interaction values reruns the recursion with one feature held fixed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Condition {
	Unconditioned,
	/// The feature always follows the instance.
	Present(usize),
	/// The feature never follows the instance.
	Absent(usize),
}

impl Condition {
	fn feature_index(self) -> Option<usize> {
		match self {
			Condition::Unconditioned => None,
			Condition::Present(feature_index) | Condition::Absent(feature_index) => {
				Some(feature_index)
			}
		}
	}
}

/**
Add the exact path dependent SHAP values of a single tree for `instance` to `phi`, which holds `(n_features + 1) * n_outputs` values laid out as in [`Contributions`]. When unconditioned, the tree's expected value is added to the bias entry.
*/
pub fn tree_shap(
	tree: &TreeView,
	instance: &Instance,
	phi: &mut [f32],
	condition: Condition,
	buffer: &mut PathBuffer,
) {
	let n_outputs = tree.n_outputs();
	if condition == Condition::Unconditioned {
		let bias_offset = phi.len() - n_outputs;
		for (bias, value) in phi[bias_offset..].iter_mut().zip(tree.value(0)) {
			*bias += value;
		}
	}
	let path = buffer.path(tree.depth());
	tree_shap_recursive(tree, instance, phi, condition, 0, path, 0, 1.0, 1.0, None, 1.0);
}

#[allow(clippy::too_many_arguments)]
fn tree_shap_recursive(
	tree: &TreeView,
	instance: &Instance,
	phi: &mut [f32],
	condition: Condition,
	node_index: usize,
	path: &mut [PathElement],
	unique_depth: usize,
	parent_zero_fraction: f32,
	parent_one_fraction: f32,
	parent_feature_index: Option<usize>,
	condition_fraction: f32,
) {
	// Nothing reaches this node.
	if condition_fraction == 0.0 {
		return;
	}
	let extend = condition.feature_index().is_none()
		|| condition.feature_index() != parent_feature_index;
	if extend {
		// A child no sample reaches and the instance does not follow contributes exactly zero.
		if parent_zero_fraction == 0.0 && parent_one_fraction == 0.0 {
			return;
		}
		extend_path(
			path,
			unique_depth,
			parent_zero_fraction,
			parent_one_fraction,
			parent_feature_index,
		);
	}
	let n_outputs = tree.n_outputs();
	let branch = match tree.node(node_index) {
		Node::Leaf(leaf) => {
			for path_index in 1..=unique_depth {
				let weight = unwound_path_sum(path, unique_depth, path_index);
				let element = &path[path_index];
				let scale =
					weight * (element.one_fraction - element.zero_fraction) * condition_fraction;
				// Every element past the root has a feature.
				let offset = element.feature_index.unwrap() * n_outputs;
				for (phi, value) in phi[offset..offset + n_outputs].iter_mut().zip(leaf.value) {
					*phi += scale * value;
				}
			}
			return;
		}
		Node::Branch(branch) => branch,
	};
	let (hot_child_index, cold_child_index) = branch.hot_cold(instance);
	let (hot_zero_fraction, cold_zero_fraction) = if branch.sample_weight > 0.0 {
		(
			tree.sample_weight(hot_child_index) / branch.sample_weight,
			tree.sample_weight(cold_child_index) / branch.sample_weight,
		)
	} else {
		(0.0, 0.0)
	};
	let feature_index = branch.feature_index;
	let mut unique_depth = unique_depth;
	let mut incoming_zero_fraction = 1.0;
	let mut incoming_one_fraction = 1.0;
	// Undo an earlier split on the same feature so the two splits count as one.
	if let Some(path_index) =
		(1..=unique_depth).find(|i| path[*i].feature_index == Some(feature_index))
	{
		incoming_zero_fraction = path[path_index].zero_fraction;
		incoming_one_fraction = path[path_index].one_fraction;
		unwind_path(path, unique_depth, path_index);
		unique_depth -= 1;
	}
	let mut hot_condition_fraction = condition_fraction;
	let mut cold_condition_fraction = condition_fraction;
	let mut child_depth = unique_depth + 1;
	match condition {
		Condition::Present(f) if f == feature_index => {
			cold_condition_fraction = 0.0;
			child_depth -= 1;
		}
		Condition::Absent(f) if f == feature_index => {
			hot_condition_fraction *= hot_zero_fraction;
			cold_condition_fraction *= cold_zero_fraction;
			child_depth -= 1;
		}
		_ => {}
	}
	let (parent_path, child_path) = path.split_at_mut(unique_depth + 1);
	child_path[..parent_path.len()].copy_from_slice(parent_path);
	tree_shap_recursive(
		tree,
		instance,
		phi,
		condition,
		hot_child_index,
		child_path,
		child_depth,
		hot_zero_fraction * incoming_zero_fraction,
		incoming_one_fraction,
		Some(feature_index),
		hot_condition_fraction,
	);
	child_path[..parent_path.len()].copy_from_slice(parent_path);
	tree_shap_recursive(
		tree,
		instance,
		phi,
		condition,
		cold_child_index,
		child_path,
		child_depth,
		cold_zero_fraction * incoming_zero_fraction,
		0.0,
		Some(feature_index),
		cold_condition_fraction,
	);
}

/// Explain every instance in `data` with the path dependent algorithm. The bias of each instance is `base_offset` plus the expected value of every tree.
pub fn dense_tree_path_dependent(
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
		.for_each_init(
			|| PathBuffer::new(ensemble.max_depth()),
			|buffer, (instance_index, phi)| {
				let instance = data.instance(instance_index);
				for tree in ensemble.trees() {
					tree_shap(&tree, &instance, phi, Condition::Unconditioned, buffer);
				}
				for bias in phi[n_features * n_outputs..].iter_mut() {
					*bias += ensemble.base_offset();
				}
				progress_counter.inc(1);
			},
		);
	Ok(contributions)
}

#[cfg(test)]
use crate::{
	predict::margin,
	testing::{assert_close, branch, brute, finalized, leaf, random_ensemble, random_rows},
};
#[cfg(test)]
use rand::SeedableRng;
#[cfg(test)]
use rand_xoshiro::Xoshiro256Plus;

#[test]
fn test_single_split() {
	let ensemble = finalized(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.0,
	);
	let x = [0.2];
	let x_missing = [false];
	let data = ExplanationDataset::new(&x, &x_missing, 1).unwrap();
	let contributions =
		dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(1)).unwrap();
	insta::assert_debug_snapshot!(contributions.values.iter().collect::<Vec<_>>(), @r###"
 [
     -0.75,
     1.75,
 ]
 "###);
	assert_eq!(contributions.row_sum(0, 0), 1.0);
}

#[test]
fn test_matches_brute_force() {
	let mut rng = Xoshiro256Plus::seed_from_u64(0);
	let n_features = 4;
	for _ in 0..20 {
		let ensemble = random_ensemble(&mut rng, 3, n_features, 4, 2);
		let (x, x_missing) = random_rows(&mut rng, 5, n_features);
		let data = ExplanationDataset::new(&x, &x_missing, n_features).unwrap();
		let contributions =
			dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(5)).unwrap();
		for instance_index in 0..data.n_instances() {
			let instance = data.instance(instance_index);
			for output in 0..2 {
				let expected = brute::path_dependent(&ensemble, &instance, n_features, output);
				let actual = contributions
					.instance(instance_index)
					.column(output)
					.to_vec();
				assert_close(&actual, &expected, 1e-4);
				let prediction = margin(&ensemble, &instance, output);
				assert_close(&[contributions.row_sum(instance_index, output)], &[prediction], 1e-4);
			}
		}
	}
}

#[test]
fn test_order_independence() {
	let mut rng = Xoshiro256Plus::seed_from_u64(1);
	let n_features = 3;
	let ensemble = random_ensemble(&mut rng, 4, n_features, 3, 1);
	let reversed = {
		let mut ensemble = ensemble.clone().into_inner();
		let max_nodes = ensemble.max_nodes;
		let n_outputs = ensemble.n_outputs;
		let reverse = |values: &mut Vec<f32>, width: usize| {
			let mut chunks = values.chunks(width).map(|c| c.to_vec()).collect::<Vec<_>>();
			chunks.reverse();
			*values = chunks.concat();
		};
		let reverse_i32 = |values: &mut Vec<i32>| {
			let mut chunks = values.chunks(max_nodes).map(|c| c.to_vec()).collect::<Vec<_>>();
			chunks.reverse();
			*values = chunks.concat();
		};
		reverse_i32(&mut ensemble.children_left);
		reverse_i32(&mut ensemble.children_right);
		reverse_i32(&mut ensemble.children_default);
		reverse_i32(&mut ensemble.features);
		reverse(&mut ensemble.thresholds, max_nodes);
		reverse(&mut ensemble.node_sample_weights, max_nodes);
		reverse(&mut ensemble.values, max_nodes * n_outputs);
		ensemble.finalize(&Default::default()).unwrap()
	};
	let (x, x_missing) = random_rows(&mut rng, 8, n_features);
	let data = ExplanationDataset::new(&x, &x_missing, n_features).unwrap();
	let forward = dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(8)).unwrap();
	let backward = dense_tree_path_dependent(&reversed, &data, &ProgressCounter::new(8)).unwrap();
	assert_close(
		forward.values.as_slice().unwrap(),
		backward.values.as_slice().unwrap(),
		1e-5,
	);
}

#[test]
fn test_dummy_feature() {
	let mut rng = Xoshiro256Plus::seed_from_u64(2);
	// Feature 3 is never split on.
	let ensemble = random_ensemble(&mut rng, 5, 3, 4, 1);
	let (x, x_missing) = random_rows(&mut rng, 10, 4);
	let data = ExplanationDataset::new(&x, &x_missing, 4).unwrap();
	let contributions =
		dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(10)).unwrap();
	for instance_index in 0..10 {
		assert_eq!(contributions.values[[instance_index, 3, 0]], 0.0);
	}
}

#[test]
fn test_zero_weight_branch() {
	// No training sample reached node 2, but the instance does.
	let ensemble = finalized(
		&[vec![
			branch(0, 0.5, 1, 2, 4.0),
			leaf(1.0, 4.0),
			branch(1, 0.5, 3, 4, 0.0),
			leaf(5.0, 0.0),
			leaf(7.0, 0.0),
		]],
		0.0,
	);
	let x = [0.9, 0.1, 0.1, 0.9];
	let x_missing = [false; 4];
	let data = ExplanationDataset::new(&x, &x_missing, 2).unwrap();
	let contributions =
		dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(2)).unwrap();
	assert!(contributions.values.iter().all(|v| v.is_finite()));
	assert_eq!(contributions.bias(0, 0), 1.0);
	assert_eq!(contributions.row_sum(1, 0), 1.0);
	let progress_counter = ProgressCounter::new(2);
	dense_tree_path_dependent(&ensemble, &data, &progress_counter).unwrap();
	assert_eq!(progress_counter.get(), 2);
}
