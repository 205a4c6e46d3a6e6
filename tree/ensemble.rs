use crate::{
	dataset::{ExplanationDataset, Instance},
	error::{ExplainError, Result},
};
use std::collections::BTreeSet;

/**
A `TreeEnsemble` is a forest of decision trees flattened into parallel arrays. Node `node` of tree `tree` lives at index `tree * max_nodes + node` of every per-node array, and its output values live at `(tree * max_nodes + node) * n_outputs..` in `values`.

A node is a leaf when all three of its child indexes are -1. Otherwise it is a branch: an instance whose split feature is missing goes to `children_default`, an instance whose value is `<= thresholds[i]` goes to `children_left`, and every other instance goes to `children_right`. Slots past the last node of a tree are never reached and are ignored.

A `TreeEnsemble` is filled in by an adapter and then consumed by [`TreeEnsemble::finalize`], which validates it and produces the read-only [`FinalizedTreeEnsemble`] every explanation takes.
*/
#[derive(Clone, Debug)]
pub struct TreeEnsemble {
	pub n_trees: usize,
	pub max_nodes: usize,
	pub n_outputs: usize,
	/// This value is added to every prediction, before any transform.
	pub base_offset: f32,
	pub children_left: Vec<i32>,
	pub children_right: Vec<i32>,
	pub children_default: Vec<i32>,
	pub features: Vec<i32>,
	pub thresholds: Vec<f32>,
	pub values: Vec<f32>,
	/// The number of training (or background) samples that reached each node.
	pub node_sample_weights: Vec<f32>,
}

#[derive(Clone, Copy, Debug)]
pub struct FinalizeOptions {
	/// If true, every branch's values are replaced with the sample weighted average of its children's values, bottom up. Explanations read the root's values as the expected value of each tree, so adapters that do not already store expectations on branches should leave this on.
	pub compute_expectations: bool,
}

impl Default for FinalizeOptions {
	fn default() -> Self {
		Self {
			compute_expectations: true,
		}
	}
}

/// A validated, read-only `TreeEnsemble`, safe to share across threads.
#[derive(Clone, Debug)]
pub struct FinalizedTreeEnsemble {
	ensemble: TreeEnsemble,
	tree_depths: Vec<usize>,
	unique_features: Vec<Vec<usize>>,
	max_depth: usize,
	max_feature_index: Option<usize>,
}

/// A checked view of a single tree in a `FinalizedTreeEnsemble`.
#[derive(Clone, Copy, Debug)]
pub struct TreeView<'a> {
	children_left: &'a [i32],
	children_right: &'a [i32],
	children_default: &'a [i32],
	features: &'a [i32],
	thresholds: &'a [f32],
	values: &'a [f32],
	node_sample_weights: &'a [f32],
	n_outputs: usize,
	depth: usize,
	unique_features: &'a [usize],
}

/// A node is either a branch or a leaf.
#[derive(Clone, Copy, Debug)]
pub enum Node<'a> {
	Branch(BranchNode<'a>),
	Leaf(LeafNode<'a>),
}

#[derive(Clone, Copy, Debug)]
pub struct BranchNode<'a> {
	pub left_child_index: usize,
	pub right_child_index: usize,
	pub default_child_index: usize,
	pub feature_index: usize,
	pub threshold: f32,
	pub value: &'a [f32],
	pub sample_weight: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct LeafNode<'a> {
	pub value: &'a [f32],
	pub sample_weight: f32,
}

impl TreeEnsemble {
	/// Create an ensemble in which every node of every tree is a leaf with value 0 and sample weight 0.
	pub fn new(n_trees: usize, max_nodes: usize, n_outputs: usize, base_offset: f32) -> Self {
		let n_nodes = n_trees * max_nodes;
		Self {
			n_trees,
			max_nodes,
			n_outputs,
			base_offset,
			children_left: vec![-1; n_nodes],
			children_right: vec![-1; n_nodes],
			children_default: vec![-1; n_nodes],
			features: vec![-1; n_nodes],
			thresholds: vec![0.0; n_nodes],
			values: vec![0.0; n_nodes * n_outputs],
			node_sample_weights: vec![0.0; n_nodes],
		}
	}

	pub fn finalize(mut self, options: &FinalizeOptions) -> Result<FinalizedTreeEnsemble> {
		self.validate()?;
		let mut tree_depths = Vec::with_capacity(self.n_trees);
		let mut unique_features = Vec::with_capacity(self.n_trees);
		for tree in 0..self.n_trees {
			let mut features = BTreeSet::new();
			let depth =
				self.finalize_node(tree, 0, options.compute_expectations, &mut features)?;
			tree_depths.push(depth);
			unique_features.push(features.into_iter().collect::<Vec<_>>());
		}
		let max_depth = tree_depths.iter().copied().max().unwrap_or(0);
		let max_feature_index = unique_features
			.iter()
			.filter_map(|features| features.last().copied())
			.max();
		Ok(FinalizedTreeEnsemble {
			ensemble: self,
			tree_depths,
			unique_features,
			max_depth,
			max_feature_index,
		})
	}

	/// Set every node's sample weight to 0, before recomputing the weights with `accumulate_node_sample_weights`.
	pub fn clear_node_sample_weights(&mut self) {
		self.node_sample_weights.iter_mut().for_each(|w| *w = 0.0);
	}

	/// Add 1 to the sample weight of every node each instance in `data` passes through, in every tree.
	pub fn accumulate_node_sample_weights(&mut self, data: &ExplanationDataset) -> Result<()> {
		self.validate()?;
		// Check every reachable split first, so an error leaves the weights unchanged.
		let mut stack = Vec::new();
		for tree in 0..self.n_trees {
			stack.push(0);
			while let Some(node) = stack.pop() {
				let offset = tree * self.max_nodes + node;
				if self.children_left[offset] < 0 {
					continue;
				}
				let feature = self.features[offset];
				if feature as usize >= data.n_features() {
					return Err(ExplainError::FeatureOutOfRange {
						tree,
						node,
						feature,
						n_features: data.n_features(),
					});
				}
				stack.push(self.children_right[offset] as usize);
				stack.push(self.children_left[offset] as usize);
			}
		}
		for instance in data.instances() {
			for tree in 0..self.n_trees {
				let mut node = 0;
				loop {
					let offset = tree * self.max_nodes + node;
					self.node_sample_weights[offset] += 1.0;
					if self.children_left[offset] < 0 {
						break;
					}
					let feature = self.features[offset];
					node = next_child(
						self.children_left[offset],
						self.children_right[offset],
						self.children_default[offset],
						self.thresholds[offset],
						feature as usize,
						&instance,
					);
				}
			}
		}
		Ok(())
	}

	fn validate(&self) -> Result<()> {
		if self.n_trees == 0 || self.max_nodes == 0 {
			return Err(ExplainError::EmptyEnsemble);
		}
		if self.n_outputs == 0 {
			return Err(ExplainError::LengthMismatch {
				name: "n_outputs",
				expected: 1,
				actual: 0,
			});
		}
		let n_nodes = self.n_trees * self.max_nodes;
		check_len("children_left", n_nodes, self.children_left.len())?;
		check_len("children_right", n_nodes, self.children_right.len())?;
		check_len("children_default", n_nodes, self.children_default.len())?;
		check_len("features", n_nodes, self.features.len())?;
		check_len("thresholds", n_nodes, self.thresholds.len())?;
		check_len("node_sample_weights", n_nodes, self.node_sample_weights.len())?;
		check_len("values", n_nodes * self.n_outputs, self.values.len())?;
		// Walk each tree from its root, so a node reached twice means a shared subtree or a cycle.
		let mut visited = vec![false; self.max_nodes];
		let mut stack = Vec::new();
		for tree in 0..self.n_trees {
			visited.iter_mut().for_each(|v| *v = false);
			stack.clear();
			stack.push(0);
			while let Some(node) = stack.pop() {
				if visited[node] {
					return Err(ExplainError::NotATree { tree, node });
				}
				visited[node] = true;
				let offset = tree * self.max_nodes + node;
				let left = self.children_left[offset];
				let right = self.children_right[offset];
				let default = self.children_default[offset];
				if left == -1 && right == -1 && default == -1 {
					if self.features[offset] != -1 {
						return Err(ExplainError::MalformedNode { tree, node });
					}
					continue;
				}
				for &child in &[left, right, default] {
					if child == -1 {
						return Err(ExplainError::MalformedNode { tree, node });
					}
					if child < 0 || child as usize >= self.max_nodes {
						return Err(ExplainError::DanglingChild {
							tree,
							node,
							child,
							max_nodes: self.max_nodes,
						});
					}
				}
				if left == right || (default != left && default != right) {
					return Err(ExplainError::MalformedNode { tree, node });
				}
				if self.features[offset] < 0 {
					return Err(ExplainError::MalformedNode { tree, node });
				}
				stack.push(right as usize);
				stack.push(left as usize);
			}
		}
		Ok(())
	}

	/// Check the sample weight of a validated node, record its split feature, optionally replace its values with the expectation of its children, and return the depth of the subtree rooted at it.
	fn finalize_node(
		&mut self,
		tree: usize,
		node: usize,
		compute_expectations: bool,
		features: &mut BTreeSet<usize>,
	) -> Result<usize> {
		let offset = tree * self.max_nodes + node;
		let weight = self.node_sample_weights[offset];
		if !weight.is_finite() || weight < 0.0 {
			return Err(ExplainError::InvalidSampleWeight { tree, node, weight });
		}
		if self.children_left[offset] < 0 {
			return Ok(0);
		}
		features.insert(self.features[offset] as usize);
		let left = self.children_left[offset] as usize;
		let right = self.children_right[offset] as usize;
		let left_depth = self.finalize_node(tree, left, compute_expectations, features)?;
		let right_depth = self.finalize_node(tree, right, compute_expectations, features)?;
		if compute_expectations {
			let left_offset = tree * self.max_nodes + left;
			let right_offset = tree * self.max_nodes + right;
			let left_weight = self.node_sample_weights[left_offset];
			let right_weight = self.node_sample_weights[right_offset];
			let total_weight = left_weight + right_weight;
			for output in 0..self.n_outputs {
				self.values[offset * self.n_outputs + output] = if total_weight > 0.0 {
					(left_weight * self.values[left_offset * self.n_outputs + output]
						+ right_weight * self.values[right_offset * self.n_outputs + output])
						/ total_weight
				} else {
					0.0
				};
			}
		}
		Ok(left_depth.max(right_depth) + 1)
	}
}

impl FinalizedTreeEnsemble {
	pub fn n_trees(&self) -> usize {
		self.ensemble.n_trees
	}

	pub fn max_nodes(&self) -> usize {
		self.ensemble.max_nodes
	}

	pub fn n_outputs(&self) -> usize {
		self.ensemble.n_outputs
	}

	pub fn base_offset(&self) -> f32 {
		self.ensemble.base_offset
	}

	/// The depth of the deepest tree. A tree that is a single leaf has depth 0.
	pub fn max_depth(&self) -> usize {
		self.max_depth
	}

	pub fn tree_depth(&self, tree: usize) -> usize {
		self.tree_depths[tree]
	}

	/// The sorted, deduplicated features tree `tree` splits on.
	pub fn unique_features(&self, tree: usize) -> &[usize] {
		&self.unique_features[tree]
	}

	/// The largest feature index any tree splits on, or `None` if every tree is a single leaf.
	pub fn max_feature_index(&self) -> Option<usize> {
		self.max_feature_index
	}

	pub fn tree(&self, tree: usize) -> TreeView {
		let max_nodes = self.ensemble.max_nodes;
		let n_outputs = self.ensemble.n_outputs;
		let nodes = tree * max_nodes..(tree + 1) * max_nodes;
		TreeView {
			children_left: &self.ensemble.children_left[nodes.clone()],
			children_right: &self.ensemble.children_right[nodes.clone()],
			children_default: &self.ensemble.children_default[nodes.clone()],
			features: &self.ensemble.features[nodes.clone()],
			thresholds: &self.ensemble.thresholds[nodes.clone()],
			values: &self.ensemble.values[nodes.start * n_outputs..nodes.end * n_outputs],
			node_sample_weights: &self.ensemble.node_sample_weights[nodes],
			n_outputs,
			depth: self.tree_depths[tree],
			unique_features: &self.unique_features[tree],
		}
	}

	pub fn trees(&self) -> impl Iterator<Item = TreeView> {
		(0..self.n_trees()).map(move |tree| self.tree(tree))
	}

	/// Return an error naming the first node that splits on a feature the data does not have.
	pub fn check_n_features(&self, n_features: usize) -> Result<()> {
		match self.max_feature_index {
			Some(max_feature_index) if max_feature_index >= n_features => {}
			_ => return Ok(()),
		}
		for (tree_index, tree) in self.trees().enumerate() {
			for node_index in 0..tree.n_nodes() {
				if let Some(Node::Branch(branch)) = tree.reachable_node(node_index) {
					if branch.feature_index >= n_features {
						return Err(ExplainError::FeatureOutOfRange {
							tree: tree_index,
							node: node_index,
							feature: branch.feature_index as i32,
							n_features,
						});
					}
				}
			}
		}
		Ok(())
	}

	/// Go back to the built phase, for example to recompute the sample weights.
	pub fn into_inner(self) -> TreeEnsemble {
		self.ensemble
	}
}

impl<'a> TreeView<'a> {
	/// The number of node slots, including unreachable ones.
	pub fn n_nodes(&self) -> usize {
		self.children_left.len()
	}

	pub fn n_outputs(&self) -> usize {
		self.n_outputs
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	pub fn unique_features(&self) -> &'a [usize] {
		self.unique_features
	}

	pub fn is_leaf(&self, index: usize) -> bool {
		self.children_left[index] < 0
	}

	pub fn value(&self, index: usize) -> &'a [f32] {
		&self.values[index * self.n_outputs..(index + 1) * self.n_outputs]
	}

	pub fn sample_weight(&self, index: usize) -> f32 {
		self.node_sample_weights[index]
	}

	pub fn node(&self, index: usize) -> Node<'a> {
		let value = self.value(index);
		let sample_weight = self.node_sample_weights[index];
		if self.is_leaf(index) {
			Node::Leaf(LeafNode {
				value,
				sample_weight,
			})
		} else {
			Node::Branch(BranchNode {
				left_child_index: self.children_left[index] as usize,
				right_child_index: self.children_right[index] as usize,
				default_child_index: self.children_default[index] as usize,
				feature_index: self.features[index] as usize,
				threshold: self.thresholds[index],
				value,
				sample_weight,
			})
		}
	}

	fn reachable_node(&self, index: usize) -> Option<Node<'a>> {
		let mut stack = vec![0];
		while let Some(current) = stack.pop() {
			if current == index {
				return Some(self.node(index));
			}
			if let Node::Branch(branch) = self.node(current) {
				stack.push(branch.left_child_index);
				stack.push(branch.right_child_index);
			}
		}
		None
	}
}

impl<'a> Node<'a> {
	pub fn value(&self) -> &'a [f32] {
		match self {
			Node::Branch(BranchNode { value, .. }) => value,
			Node::Leaf(LeafNode { value, .. }) => value,
		}
	}

	pub fn sample_weight(&self) -> f32 {
		match self {
			Node::Branch(BranchNode { sample_weight, .. }) => *sample_weight,
			Node::Leaf(LeafNode { sample_weight, .. }) => *sample_weight,
		}
	}
}

impl<'a> BranchNode<'a> {
	/// The child `instance` goes to.
	#[inline]
	pub fn next(&self, instance: &Instance) -> usize {
		if instance.is_missing(self.feature_index) {
			self.default_child_index
		} else if instance.value(self.feature_index) <= self.threshold {
			self.left_child_index
		} else {
			self.right_child_index
		}
	}

	/// The child `instance` goes to, followed by the other child.
	#[inline]
	pub fn hot_cold(&self, instance: &Instance) -> (usize, usize) {
		let hot = self.next(instance);
		if hot == self.left_child_index {
			(self.left_child_index, self.right_child_index)
		} else {
			(self.right_child_index, self.left_child_index)
		}
	}
}

fn next_child(
	left: i32,
	right: i32,
	default: i32,
	threshold: f32,
	feature_index: usize,
	instance: &Instance,
) -> usize {
	let child = if instance.is_missing(feature_index) {
		default
	} else if instance.value(feature_index) <= threshold {
		left
	} else {
		right
	};
	child as usize
}

fn check_len(name: &'static str, expected: usize, actual: usize) -> Result<()> {
	if expected != actual {
		return Err(ExplainError::LengthMismatch {
			name,
			expected,
			actual,
		});
	}
	Ok(())
}

#[cfg(test)]
use crate::testing::{branch, ensemble, leaf};

#[test]
fn test_compute_expectations() {
	let ensemble = ensemble(
		&[vec![
			branch(0, 0.5, 1, 2, 10.0),
			branch(1, 0.5, 3, 4, 8.0),
			leaf(10.0, 2.0),
			leaf(0.0, 6.0),
			leaf(8.0, 2.0),
		]],
		0.0,
	)
	.finalize(&FinalizeOptions::default())
	.unwrap();
	let tree = ensemble.tree(0);
	let values = (0..5).map(|i| tree.value(i)[0]).collect::<Vec<_>>();
	insta::assert_debug_snapshot!(values, @r###"
 [
     3.6,
     2.0,
     10.0,
     0.0,
     8.0,
 ]
 "###);
	assert_eq!(ensemble.max_depth(), 2);
	assert_eq!(ensemble.unique_features(0), &[0, 1]);
	assert_eq!(ensemble.max_feature_index(), Some(1));
	assert!(ensemble.check_n_features(2).is_ok());
	assert!(matches!(
		ensemble.check_n_features(1),
		Err(ExplainError::FeatureOutOfRange {
			tree: 0,
			node: 1,
			feature: 1,
			n_features: 1,
		})
	));
}

#[test]
fn test_zero_weight_children() {
	let ensemble = ensemble(
		&[vec![
			branch(0, 0.5, 1, 2, 0.0),
			leaf(1.0, 0.0),
			leaf(2.0, 0.0),
		]],
		0.0,
	)
	.finalize(&FinalizeOptions::default())
	.unwrap();
	assert_eq!(ensemble.tree(0).value(0), &[0.0]);
}

#[test]
fn test_structural_errors() {
	let valid = ensemble(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.0,
	);

	let mut dangling = valid.clone();
	dangling.children_right[0] = 7;
	assert!(matches!(
		dangling.finalize(&FinalizeOptions::default()),
		Err(ExplainError::DanglingChild { child: 7, .. })
	));

	let mut half_leaf = valid.clone();
	half_leaf.children_right[0] = -1;
	assert!(matches!(
		half_leaf.finalize(&FinalizeOptions::default()),
		Err(ExplainError::MalformedNode { tree: 0, node: 0 })
	));

	let mut bad_default = valid.clone();
	bad_default.children_left[1] = 1;
	bad_default.children_right[1] = 2;
	bad_default.children_default[1] = 0;
	bad_default.features[1] = 0;
	assert!(matches!(
		bad_default.finalize(&FinalizeOptions::default()),
		Err(ExplainError::MalformedNode { tree: 0, node: 1 })
	));

	let mut cycle = valid.clone();
	cycle.children_left[2] = 0;
	cycle.children_right[2] = 1;
	cycle.children_default[2] = 0;
	cycle.features[2] = 0;
	assert!(matches!(
		cycle.finalize(&FinalizeOptions::default()),
		Err(ExplainError::NotATree { .. })
	));

	let mut short = valid.clone();
	short.values.pop();
	assert!(matches!(
		short.finalize(&FinalizeOptions::default()),
		Err(ExplainError::LengthMismatch { name: "values", .. })
	));

	let mut negative_weight = valid.clone();
	negative_weight.node_sample_weights[2] = -1.0;
	assert!(matches!(
		negative_weight.finalize(&FinalizeOptions::default()),
		Err(ExplainError::InvalidSampleWeight { tree: 0, node: 2, .. })
	));

	let mut leaf_with_feature = valid.clone();
	leaf_with_feature.features[1] = 0;
	assert!(matches!(
		leaf_with_feature.finalize(&FinalizeOptions::default()),
		Err(ExplainError::MalformedNode { tree: 0, node: 1 })
	));

	assert!(matches!(
		TreeEnsemble::new(0, 3, 1, 0.0).finalize(&FinalizeOptions::default()),
		Err(ExplainError::EmptyEnsemble)
	));

	assert!(valid.finalize(&FinalizeOptions::default()).is_ok());
}

#[test]
fn test_accumulate_node_sample_weights() {
	let mut ensemble = ensemble(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.0,
	);
	let x = [0.2, 0.9, 0.0, 0.4];
	let x_missing = [false, false, true, false];
	let data = ExplanationDataset::new(&x, &x_missing, 1).unwrap();
	ensemble.clear_node_sample_weights();
	ensemble.accumulate_node_sample_weights(&data).unwrap();
	// The missing value takes the default child, which is the left child.
	assert_eq!(ensemble.node_sample_weights, vec![4.0, 3.0, 1.0]);
}

#[test]
fn test_accumulate_node_sample_weights_feature_out_of_range() {
	let mut ensemble = ensemble(
		&[
			vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)],
			vec![branch(1, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)],
		],
		0.0,
	);
	let before = ensemble.node_sample_weights.clone();
	let x = [0.2];
	let x_missing = [false];
	let data = ExplanationDataset::new(&x, &x_missing, 1).unwrap();
	assert!(matches!(
		ensemble.accumulate_node_sample_weights(&data),
		Err(ExplainError::FeatureOutOfRange {
			tree: 1,
			node: 0,
			feature: 1,
			n_features: 1,
		})
	));
	assert_eq!(ensemble.node_sample_weights, before);
}
