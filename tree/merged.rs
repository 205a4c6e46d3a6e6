use crate::{
	dataset::{ExplanationDataset, Instance},
	ensemble::{FinalizeOptions, FinalizedTreeEnsemble, Node, TreeEnsemble},
	error::{ExplainError, Result},
	path::PathBuffer,
	path_dependent::{tree_shap, Condition},
	Contributions,
};
use num_traits::ToPrimitive;
use rayon::prelude::*;
use treeshap_progress::ProgressCounter;

/**
Collapse the ensemble into a single tree that makes the same prediction as the whole ensemble for every explained instance and every background row in `data`.

The rows are partitioned by each tree's splits in turn. When a row set reaches a leaf of one tree, the leaf's value is carried along and the rows continue from the root of the next tree. Splits that send every row the same way are skipped, so the merged tree has at most `2 * (n_instances + n_background) - 1` nodes. The sample weight of each node is the number of background rows that reach it, and node values are the expectations over those rows. The base offset is not folded into the leaves.
*/
pub fn build_merged_tree(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
) -> Result<FinalizedTreeEnsemble> {
	ensemble.check_n_features(data.n_features())?;
	if !data.has_background() {
		return Err(ExplainError::MissingBackground("global path dependent"));
	}
	let rows = data
		.instances()
		.chain(data.background_rows())
		.collect::<Vec<_>>();
	let max_nodes = 2 * rows.len() - 1;
	let mut builder = MergedTreeBuilder {
		ensemble,
		rows: &rows,
		n_instances: data.n_instances(),
		merged: TreeEnsemble::new(1, max_nodes, ensemble.n_outputs(), 0.0),
	};
	let mut indices = (0..rows.len()).collect::<Vec<_>>();
	let leaf_value = vec![0.0; ensemble.n_outputs()];
	builder.build(&mut indices, data.n_background(), 0, 0, 0, leaf_value);
	builder.merged.finalize(&FinalizeOptions {
		compute_expectations: true,
	})
}

struct MergedTreeBuilder<'a, 'b> {
	ensemble: &'a FinalizedTreeEnsemble,
	rows: &'a [Instance<'b>],
	/// Rows before this index are explained instances and carry no weight.
	n_instances: usize,
	merged: TreeEnsemble,
}

impl<'a, 'b> MergedTreeBuilder<'a, 'b> {
	/// Write the subtree for `indices` starting at node `position` of the merged tree and return the last position written.
	fn build(
		&mut self,
		indices: &mut [usize],
		n_background: usize,
		mut tree_index: usize,
		mut node_index: usize,
		position: usize,
		mut leaf_value: Vec<f32>,
	) -> usize {
		let ensemble = self.ensemble;
		loop {
			let tree = ensemble.tree(tree_index);
			let branch = match tree.node(node_index) {
				Node::Leaf(leaf) => {
					for (accumulated, value) in leaf_value.iter_mut().zip(leaf.value) {
						*accumulated += value;
					}
					if tree_index + 1 == ensemble.n_trees() {
						self.write_leaf(position, &leaf_value, n_background);
						return position;
					}
					tree_index += 1;
					node_index = 0;
					continue;
				}
				Node::Branch(branch) => branch,
			};
			// Partition the rows in place, left rows first.
			let mut n_left = 0;
			let mut n_left_background = 0;
			for i in 0..indices.len() {
				let row = indices[i];
				if branch.next(&self.rows[row]) == branch.left_child_index {
					indices.swap(i, n_left);
					n_left += 1;
					if row >= self.n_instances {
						n_left_background += 1;
					}
				}
			}
			if n_left == 0 {
				node_index = branch.right_child_index;
				continue;
			}
			if n_left == indices.len() {
				node_index = branch.left_child_index;
				continue;
			}
			let (left_indices, right_indices) = indices.split_at_mut(n_left);
			let left_end = self.build(
				left_indices,
				n_left_background,
				tree_index,
				branch.left_child_index,
				position + 1,
				leaf_value.clone(),
			);
			let right_position = left_end + 1;
			let offset = position;
			self.merged.children_left[offset] = (position + 1).to_i32().unwrap();
			self.merged.children_right[offset] = right_position.to_i32().unwrap();
			self.merged.children_default[offset] =
				if branch.default_child_index == branch.left_child_index {
					self.merged.children_left[offset]
				} else {
					self.merged.children_right[offset]
				};
			self.merged.features[offset] = branch.feature_index.to_i32().unwrap();
			self.merged.thresholds[offset] = branch.threshold;
			self.merged.node_sample_weights[offset] = n_background.to_f32().unwrap();
			return self.build(
				right_indices,
				n_background - n_left_background,
				tree_index,
				branch.right_child_index,
				right_position,
				leaf_value,
			);
		}
	}

	fn write_leaf(&mut self, position: usize, value: &[f32], n_background: usize) {
		let n_outputs = self.merged.n_outputs;
		self.merged.values[position * n_outputs..(position + 1) * n_outputs]
			.copy_from_slice(value);
		self.merged.node_sample_weights[position] = n_background.to_f32().unwrap();
	}
}

/// Explain every instance in `data` with the path dependent algorithm applied to the merged tree, so the expectations come from the background rows rather than the training cover. Each bias is `base_offset` plus the mean margin over the background rows.
pub fn dense_global_path_dependent(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	progress_counter: &ProgressCounter,
) -> Result<Contributions> {
	let merged = build_merged_tree(ensemble, data)?;
	Ok(explain_merged_tree(ensemble, &merged, data, progress_counter))
}

pub(crate) fn explain_merged_tree(
	ensemble: &FinalizedTreeEnsemble,
	merged: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	progress_counter: &ProgressCounter,
) -> Contributions {
	let n_features = data.n_features();
	let n_outputs = ensemble.n_outputs();
	let mut contributions = Contributions::zeros(data.n_instances(), n_features, n_outputs);
	let row_size = contributions.row_size();
	let tree = merged.tree(0);
	contributions
		.as_slice_mut()
		.par_chunks_mut(row_size)
		.enumerate()
		.for_each_init(
			|| PathBuffer::new(merged.max_depth()),
			|buffer, (instance_index, phi)| {
				let instance = data.instance(instance_index);
				tree_shap(&tree, &instance, phi, Condition::Unconditioned, buffer);
				for bias in phi[n_features * n_outputs..].iter_mut() {
					*bias += ensemble.base_offset();
				}
				progress_counter.inc(1);
			},
		);
	contributions
}

#[cfg(test)]
use crate::{
	predict::margin,
	testing::{assert_close, branch, finalized, leaf, random_ensemble, random_rows},
};
#[cfg(test)]
use rand::SeedableRng;
#[cfg(test)]
use rand_xoshiro::Xoshiro256Plus;

#[test]
fn test_single_split() {
	// The training cover says the left leaf is common, but the background says otherwise.
	let ensemble = finalized(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.5,
	);
	let x = [0.2];
	let x_missing = [false];
	let r = [0.9, 0.1, 0.8];
	let r_missing = [false; 3];
	let data = ExplanationDataset::new(&x, &x_missing, 1)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let contributions =
		dense_global_path_dependent(&ensemble, &data, &ProgressCounter::new(1)).unwrap();
	assert_close(contributions.values.as_slice().unwrap(), &[-2.0, 3.5], 1e-6);
}

#[test]
fn test_merged_tree_predicts_like_the_ensemble() {
	let mut rng = Xoshiro256Plus::seed_from_u64(11);
	let n_features = 3;
	let ensemble = random_ensemble(&mut rng, 3, n_features, 3, 2);
	let (x, x_missing) = random_rows(&mut rng, 5, n_features);
	let (r, r_missing) = random_rows(&mut rng, 8, n_features);
	let data = ExplanationDataset::new(&x, &x_missing, n_features)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let merged = build_merged_tree(&ensemble, &data).unwrap();
	assert_eq!(merged.n_trees(), 1);
	assert_eq!(merged.tree(0).sample_weight(0), 8.0);
	for instance in data.instances().chain(data.background_rows()) {
		for output in 0..2 {
			let expected = margin(&ensemble, &instance, output);
			let actual = margin(&merged, &instance, output) + ensemble.base_offset();
			assert_close(&[actual], &[expected], 1e-5);
		}
	}
}

#[test]
fn test_local_accuracy() {
	let mut rng = Xoshiro256Plus::seed_from_u64(12);
	let n_features = 4;
	let ensemble = random_ensemble(&mut rng, 4, n_features, 3, 1);
	let (x, x_missing) = random_rows(&mut rng, 6, n_features);
	let (r, r_missing) = random_rows(&mut rng, 10, n_features);
	let data = ExplanationDataset::new(&x, &x_missing, n_features)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let contributions =
		dense_global_path_dependent(&ensemble, &data, &ProgressCounter::new(6)).unwrap();
	let mean_background_margin = data
		.background_rows()
		.map(|row| margin(&ensemble, &row, 0))
		.sum::<f32>()
		/ 10.0;
	for (instance_index, instance) in data.instances().enumerate() {
		assert_close(
			&[contributions.row_sum(instance_index, 0)],
			&[margin(&ensemble, &instance, 0)],
			1e-4,
		);
		assert_close(
			&[contributions.bias(instance_index, 0)],
			&[mean_background_margin],
			1e-4,
		);
	}
}

#[test]
fn test_dummy_feature() {
	let mut rng = Xoshiro256Plus::seed_from_u64(13);
	// Feature 3 is never split on.
	let ensemble = random_ensemble(&mut rng, 4, 3, 3, 2);
	let (x, x_missing) = random_rows(&mut rng, 6, 4);
	let (r, r_missing) = random_rows(&mut rng, 8, 4);
	let data = ExplanationDataset::new(&x, &x_missing, 4)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let contributions =
		dense_global_path_dependent(&ensemble, &data, &ProgressCounter::new(6)).unwrap();
	for instance_index in 0..6 {
		for output in 0..2 {
			assert_eq!(contributions.values[[instance_index, 3, output]], 0.0);
		}
	}
}

#[test]
fn test_requires_background() {
	let ensemble = finalized(&[vec![leaf(1.0, 1.0)]], 0.0);
	let x = [0.2];
	let x_missing = [false];
	let data = ExplanationDataset::new(&x, &x_missing, 1).unwrap();
	let result = dense_global_path_dependent(&ensemble, &data, &ProgressCounter::new(1));
	assert!(matches!(result, Err(ExplainError::MissingBackground(_))));
}
