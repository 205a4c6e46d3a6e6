/*!
SHAP values under the assumption that features are independent, computed against an explicit background dataset.

For one instance `x` and one background row `r`, a single traversal walks every node either of them, or any mix of them, can reach. At a split where `x` and `r` go different ways, the split feature is claimed by whichever side's child is being visited, and `feat_hist` remembers the claim so later splits on the same feature follow the same side. `n` counts the distinct features claimed along the current path and `m` counts those claimed by `x`. At each leaf, the leaf's value is weighted by the share of feature orderings that produce that mix, and on the way back up, the difference between the `x` side and the `r` side of each split is credited to its feature.
*/

#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	dataset::{ExplanationDataset, Instance},
	ensemble::{FinalizedTreeEnsemble, Node, TreeView},
	error::{ExplainError, Result},
	predict::margin,
	transform::ModelTransform,
	Contributions,
};
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use treeshap_progress::ProgressCounter;

/// A node of a single tree and output, with a link to its parent's split feature so the traversal can release a claim on the way back up.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndependentNode {
	pub is_leaf: bool,
	pub left_child_index: usize,
	pub right_child_index: usize,
	pub default_child_index: usize,
	pub feature_index: usize,
	pub threshold: f32,
	pub value: f32,
	pub parent_index: usize,
	pub parent_feature_index: Option<usize>,
}

impl IndependentNode {
	/// Copy one output of a tree into a vector of nodes with parent links. Unreachable slots are left as default leaves.
	pub fn reformat(tree: &TreeView, output: usize) -> Vec<IndependentNode> {
		let mut nodes = vec![IndependentNode::default(); tree.n_nodes()];
		let mut stack = vec![0];
		while let Some(node_index) = stack.pop() {
			let node = &mut nodes[node_index];
			node.value = tree.value(node_index)[output];
			match tree.node(node_index) {
				Node::Leaf(_) => node.is_leaf = true,
				Node::Branch(branch) => {
					node.left_child_index = branch.left_child_index;
					node.right_child_index = branch.right_child_index;
					node.default_child_index = branch.default_child_index;
					node.feature_index = branch.feature_index;
					node.threshold = branch.threshold;
					for &child_index in &[branch.left_child_index, branch.right_child_index] {
						nodes[child_index].parent_index = node_index;
						nodes[child_index].parent_feature_index = Some(branch.feature_index);
						stack.push(child_index);
					}
				}
			}
		}
		nodes
	}

	#[inline]
	fn next(&self, instance: &Instance) -> usize {
		if instance.is_missing(self.feature_index) {
			self.default_child_index
		} else if instance.value(self.feature_index) <= self.threshold {
			self.left_child_index
		} else {
			self.right_child_index
		}
	}
}

/// Which side's claim the traversal made when it entered a node.
#[derive(Clone, Copy, Debug, PartialEq)]
enum FromFlag {
	Neither,
	XNotR,
	RNotX,
}

/// The per-thread state of the traversal. Nothing in here is shared between concurrent explanations.
pub struct IndependentScratch {
	from_flag: Vec<FromFlag>,
	pos: Vec<f32>,
	neg: Vec<f32>,
	feat_hist: Vec<i32>,
	node_stack: Vec<usize>,
}

impl IndependentScratch {
	pub fn new(max_nodes: usize, n_features: usize, max_depth: usize) -> Self {
		Self {
			from_flag: vec![FromFlag::Neither; max_nodes],
			pos: vec![0.0; max_nodes],
			neg: vec![0.0; max_nodes],
			feat_hist: vec![0; n_features],
			node_stack: Vec::with_capacity(max_depth + 1),
		}
	}
}

/// `weights[[n, m]]` is `1 / (n * C(n - 1, m))`, the share of orderings of `n` features in which a given feature comes right after exactly `m` of the others. Entries with `n == 0` or `m >= n` are 0.
pub fn binomial_weights(max_depth: usize) -> Array2<f32> {
	let mut weights = Array2::zeros((max_depth + 1, max_depth + 1));
	for n in 1..=max_depth {
		for m in 0..n {
			let n_choose = binomial_coefficient(n - 1, m);
			weights[[n, m]] = (1.0 / (n.to_f64().unwrap() * n_choose)).to_f32().unwrap();
		}
	}
	weights
}

fn binomial_coefficient(n: usize, k: usize) -> f64 {
	let k = k.min(n - k);
	(0..k).fold(1.0, |acc, i| {
		acc * (n - i).to_f64().unwrap() / (i + 1).to_f64().unwrap()
	})
}

struct Counters {
	n: usize,
	m: usize,
}

/// Release the claim made on the way into `node_index`, as the traversal returns to its parent.
fn leave(
	nodes: &[IndependentNode],
	node_index: usize,
	scratch: &mut IndependentScratch,
	counters: &mut Counters,
) {
	let parent_feature_index = match nodes[node_index].parent_feature_index {
		Some(parent_feature_index) => parent_feature_index,
		None => return,
	};
	let hist = &mut scratch.feat_hist[parent_feature_index];
	if *hist > 0 {
		*hist -= 1;
	} else if *hist < 0 {
		*hist += 1;
	}
	if *hist == 0 {
		match scratch.from_flag[node_index] {
			FromFlag::XNotR => {
				counters.n -= 1;
				counters.m -= 1;
			}
			FromFlag::RNotX => counters.n -= 1,
			FromFlag::Neither => {}
		}
	}
}

/// Claim the split feature of `node` for the side that goes to `child_index`, where `x` and `r` disagree.
fn enter(
	node: &IndependentNode,
	child_index: usize,
	next_x: usize,
	next_r: usize,
	scratch: &mut IndependentScratch,
	counters: &mut Counters,
) {
	if next_x == child_index {
		counters.m += 1;
		counters.n += 1;
		scratch.feat_hist[node.feature_index] += 1;
	} else if next_r == child_index {
		counters.n += 1;
		scratch.feat_hist[node.feature_index] -= 1;
	}
}

/**
Add the independent SHAP values of one tree, for instance `x` against background row `r`, to `phi`, which has one entry per feature followed by the bias. The bias receives the tree's value for `r`.
*/
pub fn tree_shap_independent(
	nodes: &[IndependentNode],
	x: &Instance,
	r: &Instance,
	weights: &Array2<f32>,
	phi: &mut [f32],
	scratch: &mut IndependentScratch,
) {
	let n_features = phi.len() - 1;
	scratch.feat_hist.iter_mut().for_each(|h| *h = 0);
	scratch.node_stack.clear();
	let mut counters = Counters { n: 0, m: 0 };
	let mut node_index = 0;
	let mut from_child: Option<usize> = None;
	loop {
		let node = &nodes[node_index];
		if node.is_leaf {
			let (n, m) = (counters.n, counters.m);
			if m == 0 {
				phi[n_features] += node.value;
			}
			scratch.pos[node_index] = if n != 0 && m != 0 {
				node.value * weights[[n, m - 1]]
			} else {
				0.0
			};
			scratch.neg[node_index] = if n != 0 && m != n {
				-node.value * weights[[n, m]]
			} else {
				0.0
			};
			let parent_index = match scratch.node_stack.pop() {
				Some(parent_index) => parent_index,
				None => break,
			};
			leave(nodes, node_index, scratch, &mut counters);
			from_child = Some(node_index);
			node_index = parent_index;
			continue;
		}
		let next_x = node.next(x);
		let next_r = node.next(r);
		if next_x != next_r {
			scratch.from_flag[next_x] = FromFlag::XNotR;
			scratch.from_flag[next_r] = FromFlag::RNotX;
		} else {
			scratch.from_flag[next_x] = FromFlag::Neither;
		}
		let feature_index = node.feature_index;
		let child_index = match from_child {
			// Arriving from the parent.
			None => {
				scratch.node_stack.push(node_index);
				let hist = scratch.feat_hist[feature_index];
				if hist > 0 {
					scratch.feat_hist[feature_index] += 1;
					node_index = next_x;
				} else if hist < 0 {
					scratch.feat_hist[feature_index] -= 1;
					node_index = next_r;
				} else if next_x == next_r {
					node_index = next_x;
				} else {
					enter(
						node,
						node.left_child_index,
						next_x,
						next_r,
						scratch,
						&mut counters,
					);
					node_index = node.left_child_index;
				}
				continue;
			}
			Some(child_index) => child_index,
		};
		// Returning from a child.
		if next_x == next_r || scratch.feat_hist[feature_index] != 0 {
			// Only one child was visited, so its totals pass straight through.
			scratch.pos[node_index] = scratch.pos[child_index];
			scratch.neg[node_index] = scratch.neg[child_index];
		} else if child_index == node.left_child_index {
			scratch.node_stack.push(node_index);
			enter(
				node,
				node.right_child_index,
				next_x,
				next_r,
				scratch,
				&mut counters,
			);
			from_child = None;
			node_index = node.right_child_index;
			continue;
		} else {
			// Both children were visited. The feature is credited with the x side's positive terms and the r side's negative terms.
			let (x_child, r_child) = (next_x, next_r);
			let pos_x = scratch.pos[x_child];
			let neg_x = scratch.neg[x_child];
			let pos_r = scratch.pos[r_child];
			let neg_r = scratch.neg[r_child];
			phi[feature_index] += pos_x + neg_r;
			scratch.pos[node_index] = pos_x + pos_r;
			scratch.neg[node_index] = neg_x + neg_r;
		}
		if scratch.node_stack.pop().is_none() {
			break;
		}
		leave(nodes, node_index, scratch, &mut counters);
		from_child = Some(node_index);
		node_index = node.parent_index;
	}
}

/**
Explain every instance in `data` against every background row, assuming features are independent.

The ensemble's outputs are explained one at a time. For each instance and background row, the contributions are computed on the margin and then scaled by the slope of `transform` between the two margins, so they sum to the difference between the transformed predictions. The bias for each pair is the transformed prediction for the background row, and every entry is averaged over the background rows.
*/
pub fn dense_independent(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	transform: ModelTransform,
	progress_counter: &ProgressCounter,
) -> Result<Contributions> {
	ensemble.check_n_features(data.n_features())?;
	if !data.has_background() {
		return Err(ExplainError::MissingBackground(
			"independent feature dependence",
		));
	}
	#[cfg(not(feature = "timing"))]
	let contributions = independent_contributions(ensemble, data, transform, progress_counter);
	#[cfg(feature = "timing")]
	let contributions =
		independent_contributions(ensemble, data, transform, progress_counter, &Timing::new());
	Ok(contributions)
}

/// The body of `dense_independent`, for callers that have already checked the features and the background.
pub(crate) fn independent_contributions(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	transform: ModelTransform,
	progress_counter: &ProgressCounter,
	#[cfg(feature = "timing")] timing: &Timing,
) -> Contributions {
	let n_features = data.n_features();
	let n_outputs = ensemble.n_outputs();
	let n_background = data.n_background().to_f32().unwrap();
	let weights = binomial_weights(ensemble.max_depth());
	let mut contributions = Contributions::zeros(data.n_instances(), n_features, n_outputs);
	let row_size = contributions.row_size();
	for output in 0..n_outputs {
		#[cfg(feature = "timing")]
		let start = std::time::Instant::now();
		let trees = ensemble
			.trees()
			.map(|tree| IndependentNode::reformat(&tree, output))
			.collect::<Vec<_>>();
		#[cfg(feature = "timing")]
		timing.independent_reformat.inc(start.elapsed());

		#[cfg(feature = "timing")]
		let start = std::time::Instant::now();
		let background_margins = data
			.background_rows()
			.map(|r| margin(ensemble, &r, output))
			.collect::<Vec<_>>();
		#[cfg(feature = "timing")]
		timing
			.independent_background_margins
			.inc(start.elapsed());

		#[cfg(feature = "timing")]
		let start = std::time::Instant::now();
		contributions
			.as_slice_mut()
			.par_chunks_mut(row_size)
			.enumerate()
			.for_each_init(
				|| {
					(
						IndependentScratch::new(
							ensemble.max_nodes(),
							n_features,
							ensemble.max_depth(),
						),
						vec![0.0; n_features + 1],
					)
				},
				|(scratch, phi), (instance_index, out)| {
					let x = data.instance(instance_index);
					let label = data.label(instance_index);
					let margin_x = if transform.is_identity() {
						0.0
					} else {
						margin(ensemble, &x, output)
					};
					for (r, margin_r) in data.background_rows().zip(background_margins.iter()) {
						phi.iter_mut().for_each(|v| *v = 0.0);
						for nodes in trees.iter() {
							tree_shap_independent(nodes, &x, &r, &weights, phi, scratch);
						}
						let rescale = transform.rescale(margin_x, *margin_r, label);
						for feature_index in 0..n_features {
							out[feature_index * n_outputs + output] += phi[feature_index] * rescale;
						}
						out[n_features * n_outputs + output] +=
							transform.apply(ensemble.base_offset() + phi[n_features], label);
					}
					for feature_index in 0..=n_features {
						out[feature_index * n_outputs + output] /= n_background;
					}
					progress_counter.inc(1);
				},
			);
		#[cfg(feature = "timing")]
		timing.independent_output_pass.inc(start.elapsed());
	}
	contributions
}

#[cfg(test)]
use crate::{
	ensemble::FinalizeOptions,
	path_dependent::dense_tree_path_dependent,
	testing::{assert_close, branch, brute, finalized, leaf, random_ensemble, random_rows},
};
#[cfg(test)]
use rand::SeedableRng;
#[cfg(test)]
use rand_xoshiro::Xoshiro256Plus;

#[test]
fn test_binomial_weights() {
	let weights = binomial_weights(3);
	insta::assert_debug_snapshot!(weights.row(3).to_vec(), @r###"
 [
     0.33333334,
     0.16666667,
     0.33333334,
     0.0,
 ]
 "###);
	assert_eq!(weights[[1, 0]], 1.0);
	assert_eq!(weights[[2, 0]], 0.5);
	assert_eq!(weights[[2, 2]], 0.0);
	assert_eq!(weights[[0, 0]], 0.0);
}

#[test]
fn test_single_split() {
	let ensemble = finalized(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.5,
	);
	let x = [0.2];
	let x_missing = [false];
	let r = [0.9, 0.1];
	let r_missing = [false; 2];
	let data = ExplanationDataset::new(&x, &x_missing, 1)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let contributions = dense_independent(
		&ensemble,
		&data,
		ModelTransform::Identity,
		&ProgressCounter::new(1),
	)
	.unwrap();
	// Against r = 0.9 the feature moves the prediction from 4.5 to 1.5, and against r = 0.1 it does nothing.
	assert_eq!(contributions.values, ndarray::arr3(&[[[-1.5], [3.0]]]));
}

#[test]
fn test_matches_brute_force() {
	let mut rng = Xoshiro256Plus::seed_from_u64(4);
	let n_features = 4;
	for _ in 0..20 {
		let ensemble = random_ensemble(&mut rng, 3, n_features, 4, 2);
		let (x, x_missing) = random_rows(&mut rng, 4, n_features);
		let (r, r_missing) = random_rows(&mut rng, 3, n_features);
		let data = ExplanationDataset::new(&x, &x_missing, n_features)
			.unwrap()
			.with_background(&r, &r_missing)
			.unwrap();
		let contributions = dense_independent(
			&ensemble,
			&data,
			ModelTransform::Identity,
			&ProgressCounter::new(8),
		)
		.unwrap();
		let background = data.background_rows().collect::<Vec<_>>();
		for instance_index in 0..data.n_instances() {
			let instance = data.instance(instance_index);
			for output in 0..2 {
				let expected =
					brute::independent(&ensemble, &instance, &background, n_features, output);
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
fn test_transform_local_accuracy() {
	let mut rng = Xoshiro256Plus::seed_from_u64(5);
	let n_features = 3;
	let ensemble = random_ensemble(&mut rng, 4, n_features, 3, 1);
	let (x, x_missing) = random_rows(&mut rng, 5, n_features);
	let (r, r_missing) = random_rows(&mut rng, 4, n_features);
	let labels = [0.0, 1.0, 1.0, 0.0, 1.0];
	let data = ExplanationDataset::new(&x, &x_missing, n_features)
		.unwrap()
		.with_labels(&labels)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	for &transform in &[
		ModelTransform::Logistic,
		ModelTransform::LogisticNlogloss,
		ModelTransform::SquaredLoss,
	] {
		let contributions =
			dense_independent(&ensemble, &data, transform, &ProgressCounter::new(5)).unwrap();
		for instance_index in 0..data.n_instances() {
			let prediction = transform.apply(
				margin(&ensemble, &data.instance(instance_index), 0),
				labels[instance_index],
			);
			assert_close(&[contributions.row_sum(instance_index, 0)], &[prediction], 1e-4);
		}
	}
}

#[test]
fn test_reduces_to_path_dependent() {
	let mut rng = Xoshiro256Plus::seed_from_u64(6);
	let n_features = 4;
	let ensemble = random_ensemble(&mut rng, 3, n_features, 4, 1);
	let (row, row_missing) = random_rows(&mut rng, 1, n_features);
	let data = ExplanationDataset::new(&row, &row_missing, n_features)
		.unwrap()
		.with_background(&row, &row_missing)
		.unwrap();
	// Reweight the trees as if the row were the only training sample.
	let mut reweighted = ensemble.clone().into_inner();
	reweighted.clear_node_sample_weights();
	reweighted.accumulate_node_sample_weights(&data).unwrap();
	let reweighted = reweighted.finalize(&FinalizeOptions::default()).unwrap();
	let independent = dense_independent(
		&ensemble,
		&data,
		ModelTransform::Identity,
		&ProgressCounter::new(1),
	)
	.unwrap();
	let path_dependent =
		dense_tree_path_dependent(&reweighted, &data, &ProgressCounter::new(1)).unwrap();
	assert_close(
		independent.values.as_slice().unwrap(),
		path_dependent.values.as_slice().unwrap(),
		1e-5,
	);
}

#[test]
fn test_dummy_feature() {
	let mut rng = Xoshiro256Plus::seed_from_u64(7);
	// Feature 3 is never split on.
	let ensemble = random_ensemble(&mut rng, 4, 3, 4, 2);
	let (x, x_missing) = random_rows(&mut rng, 5, 4);
	let (r, r_missing) = random_rows(&mut rng, 6, 4);
	let data = ExplanationDataset::new(&x, &x_missing, 4)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let contributions = dense_independent(
		&ensemble,
		&data,
		ModelTransform::Identity,
		&ProgressCounter::new(10),
	)
	.unwrap();
	for instance_index in 0..5 {
		for output in 0..2 {
			assert_eq!(contributions.values[[instance_index, 3, output]], 0.0);
		}
	}
}

#[test]
fn test_requires_background() {
	let ensemble = finalized(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.0,
	);
	let data = ExplanationDataset::new(&[0.2], &[false], 1).unwrap();
	assert!(matches!(
		dense_independent(
			&ensemble,
			&data,
			ModelTransform::Identity,
			&ProgressCounter::new(1)
		),
		Err(ExplainError::MissingBackground(_))
	));
}
