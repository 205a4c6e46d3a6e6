//! Builders for small hand-written and random ensembles, and brute force Shapley values to check the fast algorithms against.

use crate::{
	dataset::Instance,
	ensemble::{FinalizeOptions, FinalizedTreeEnsemble, Node, TreeEnsemble, TreeView},
};
use num_traits::ToPrimitive;
use rand::Rng;

pub enum TestNode {
	Branch {
		feature: usize,
		threshold: f32,
		left: usize,
		right: usize,
		default_left: bool,
		weight: f32,
	},
	Leaf {
		values: Vec<f32>,
		weight: f32,
	},
}

/// A branch whose missing values go left.
pub fn branch(feature: usize, threshold: f32, left: usize, right: usize, weight: f32) -> TestNode {
	TestNode::Branch {
		feature,
		threshold,
		left,
		right,
		default_left: true,
		weight,
	}
}

pub fn branch_default_right(
	feature: usize,
	threshold: f32,
	left: usize,
	right: usize,
	weight: f32,
) -> TestNode {
	TestNode::Branch {
		feature,
		threshold,
		left,
		right,
		default_left: false,
		weight,
	}
}

pub fn leaf(value: f32, weight: f32) -> TestNode {
	TestNode::Leaf {
		values: vec![value],
		weight,
	}
}

pub fn multi_output_leaf(values: Vec<f32>, weight: f32) -> TestNode {
	TestNode::Leaf { values, weight }
}

/// Flatten trees given as lists of nodes, with the root first, into an ensemble. Branch values start at 0 and are filled in by computing expectations.
pub fn ensemble(trees: &[Vec<TestNode>], base_offset: f32) -> TreeEnsemble {
	let max_nodes = trees.iter().map(|tree| tree.len()).max().unwrap();
	let n_outputs = trees
		.iter()
		.flatten()
		.find_map(|node| match node {
			TestNode::Leaf { values, .. } => Some(values.len()),
			_ => None,
		})
		.unwrap();
	let mut ensemble = TreeEnsemble::new(trees.len(), max_nodes, n_outputs, base_offset);
	for (tree_index, tree) in trees.iter().enumerate() {
		for (node_index, node) in tree.iter().enumerate() {
			let offset = tree_index * max_nodes + node_index;
			match node {
				TestNode::Branch {
					feature,
					threshold,
					left,
					right,
					default_left,
					weight,
				} => {
					ensemble.children_left[offset] = left.to_i32().unwrap();
					ensemble.children_right[offset] = right.to_i32().unwrap();
					ensemble.children_default[offset] = if *default_left {
						left.to_i32().unwrap()
					} else {
						right.to_i32().unwrap()
					};
					ensemble.features[offset] = feature.to_i32().unwrap();
					ensemble.thresholds[offset] = *threshold;
					ensemble.node_sample_weights[offset] = *weight;
				}
				TestNode::Leaf { values, weight } => {
					ensemble.values[offset * n_outputs..(offset + 1) * n_outputs]
						.copy_from_slice(values);
					ensemble.node_sample_weights[offset] = *weight;
				}
			}
		}
	}
	ensemble
}

pub fn finalized(trees: &[Vec<TestNode>], base_offset: f32) -> FinalizedTreeEnsemble {
	ensemble(trees, base_offset)
		.finalize(&FinalizeOptions::default())
		.unwrap()
}

/// Build an ensemble of random trees with consistent sample weights, thresholds in (0, 1), and missing values sent in random directions.
pub fn random_ensemble(
	rng: &mut impl Rng,
	n_trees: usize,
	n_features: usize,
	max_depth: usize,
	n_outputs: usize,
) -> FinalizedTreeEnsemble {
	let trees = (0..n_trees)
		.map(|_| {
			let mut nodes = Vec::new();
			random_node(rng, &mut nodes, n_features, max_depth, n_outputs);
			nodes
		})
		.collect::<Vec<_>>();
	let base_offset = rng.gen_range(-1.0, 1.0);
	finalized(&trees, base_offset)
}

/// Push a random subtree onto `nodes` and return its weight.
fn random_node(
	rng: &mut impl Rng,
	nodes: &mut Vec<TestNode>,
	n_features: usize,
	depth: usize,
	n_outputs: usize,
) -> f32 {
	let index = nodes.len();
	if depth == 0 || (index > 0 && rng.gen_bool(0.25)) {
		let weight = rng.gen_range(1u8, 6u8).to_f32().unwrap();
		let values = (0..n_outputs).map(|_| rng.gen_range(-2.0, 2.0)).collect();
		nodes.push(TestNode::Leaf { values, weight });
		return weight;
	}
	nodes.push(leaf(0.0, 0.0));
	let feature = rng.gen_range(0, n_features);
	let threshold = rng.gen_range(0.1, 0.9);
	let default_left = rng.gen_bool(0.5);
	let left = nodes.len();
	let left_weight = random_node(rng, nodes, n_features, depth - 1, n_outputs);
	let right = nodes.len();
	let right_weight = random_node(rng, nodes, n_features, depth - 1, n_outputs);
	let weight = left_weight + right_weight;
	nodes[index] = TestNode::Branch {
		feature,
		threshold,
		left,
		right,
		default_left,
		weight,
	};
	weight
}

/// Random rows with values in [0, 1) and roughly one value in ten missing.
pub fn random_rows(rng: &mut impl Rng, n_rows: usize, n_features: usize) -> (Vec<f32>, Vec<bool>) {
	let n = n_rows * n_features;
	let x = (0..n).map(|_| rng.gen::<f32>()).collect();
	let x_missing = (0..n).map(|_| rng.gen_bool(0.1)).collect();
	(x, x_missing)
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
	assert_eq!(actual.len(), expected.len());
	for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
		let scale = a.abs().max(e.abs()).max(1.0);
		assert!(
			(a - e).abs() <= tolerance * scale,
			"index {}: {} != {} (actual {:?}, expected {:?})",
			index,
			a,
			e,
			actual,
			expected,
		);
	}
}

/// Shapley values by enumerating every subset of features. Each returned vector has one value per feature followed by the bias.
pub mod brute {
	use super::*;

	/// The path dependent value of a coalition: features in the coalition follow the instance, and every other split is averaged over its children by sample weight.
	fn conditional_expectation(
		tree: &TreeView,
		node: usize,
		instance: &Instance,
		coalition: &[bool],
		output: usize,
	) -> f32 {
		match tree.node(node) {
			Node::Leaf(leaf) => leaf.value[output],
			Node::Branch(branch) => {
				if coalition[branch.feature_index] {
					conditional_expectation(tree, branch.next(instance), instance, coalition, output)
				} else {
					let left = branch.left_child_index;
					let right = branch.right_child_index;
					let left_weight = tree.sample_weight(left);
					let right_weight = tree.sample_weight(right);
					(left_weight
						* conditional_expectation(tree, left, instance, coalition, output)
						+ right_weight
							* conditional_expectation(tree, right, instance, coalition, output))
						/ (left_weight + right_weight)
				}
			}
		}
	}

	fn leaf_value(tree: &TreeView, instance: &Instance, output: usize) -> f32 {
		let mut node = 0;
		loop {
			match tree.node(node) {
				Node::Leaf(leaf) => return leaf.value[output],
				Node::Branch(branch) => node = branch.next(instance),
			}
		}
	}

	pub fn path_dependent(
		ensemble: &FinalizedTreeEnsemble,
		instance: &Instance,
		n_features: usize,
		output: usize,
	) -> Vec<f32> {
		shapley(n_features, ensemble.base_offset(), |coalition| {
			ensemble
				.trees()
				.map(|tree| conditional_expectation(&tree, 0, instance, coalition, output))
				.sum::<f32>()
		})
	}

	/// The interventional value of a coalition: the mean prediction over the background rows, with the coalition's features taken from the instance.
	pub fn independent(
		ensemble: &FinalizedTreeEnsemble,
		instance: &Instance,
		background: &[Instance],
		n_features: usize,
		output: usize,
	) -> Vec<f32> {
		let n_background = background.len().to_f32().unwrap();
		shapley(n_features, ensemble.base_offset(), |coalition| {
			let mut total = 0.0;
			for reference in background {
				let values = (0..n_features)
					.map(|i| {
						if coalition[i] {
							instance.values[i]
						} else {
							reference.values[i]
						}
					})
					.collect::<Vec<_>>();
				let missing = (0..n_features)
					.map(|i| {
						if coalition[i] {
							instance.missing[i]
						} else {
							reference.missing[i]
						}
					})
					.collect::<Vec<_>>();
				let hybrid = Instance::new(&values, &missing);
				total += ensemble
					.trees()
					.map(|tree| leaf_value(&tree, &hybrid, output))
					.sum::<f32>();
			}
			total / n_background
		})
	}

	fn shapley(n_features: usize, base_offset: f32, value: impl Fn(&[bool]) -> f32) -> Vec<f32> {
		let mut phi = vec![0.0f64; n_features + 1];
		let mut coalition = vec![false; n_features];
		for subset in 0..(1usize << n_features) {
			for (i, member) in coalition.iter_mut().enumerate() {
				*member = subset & (1 << i) != 0;
			}
			let size = subset.count_ones() as usize;
			let v = value(&coalition).to_f64().unwrap();
			for i in 0..n_features {
				// Each subset contributes positively to the features in it and negatively to the rest.
				if coalition[i] {
					phi[i] += weight(size - 1, n_features) * v;
				} else {
					phi[i] -= weight(size, n_features) * v;
				}
			}
		}
		coalition.iter_mut().for_each(|member| *member = false);
		phi[n_features] = value(&coalition).to_f64().unwrap() + base_offset.to_f64().unwrap();
		phi.into_iter().map(|v| v.to_f32().unwrap()).collect()
	}

	/// |S|! (M - |S| - 1)! / M!
	fn weight(subset_size: usize, n_features: usize) -> f64 {
		factorial(subset_size) * factorial(n_features - subset_size - 1) / factorial(n_features)
	}

	fn factorial(n: usize) -> f64 {
		(1..=n).map(|i| i.to_f64().unwrap()).product()
	}
}
