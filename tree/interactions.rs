use crate::{
	dataset::ExplanationDataset,
	ensemble::FinalizedTreeEnsemble,
	error::Result,
	path::PathBuffer,
	path_dependent::{tree_shap, Condition},
	InteractionContributions,
};
use itertools::izip;
use rayon::prelude::*;
use treeshap_progress::ProgressCounter;

struct InteractionScratch {
	buffer: PathBuffer,
	diagonal: Vec<f32>,
	present: Vec<f32>,
	absent: Vec<f32>,
}

/**
Compute SHAP interaction values for every instance in `data`.

For each feature `f` a tree splits on, the tree is explained twice more, once with `f` always following the instance and once with `f` never following it. Half the difference between the two is `f`'s interaction with every other feature. The diagonal starts at the plain SHAP values and absorbs whatever the off-diagonal entries take, so each row still sums to the plain SHAP value.
*/
pub fn dense_tree_interactions_path_dependent(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	progress_counter: &ProgressCounter,
) -> Result<InteractionContributions> {
	ensemble.check_n_features(data.n_features())?;
	let n_features = data.n_features();
	let n_outputs = ensemble.n_outputs();
	let phi_size = (n_features + 1) * n_outputs;
	let mut interactions =
		InteractionContributions::zeros(data.n_instances(), n_features, n_outputs);
	let row_size = interactions.row_size();
	interactions
		.as_slice_mut()
		.par_chunks_mut(row_size)
		.enumerate()
		.for_each_init(
			|| InteractionScratch {
				buffer: PathBuffer::new(ensemble.max_depth()),
				diagonal: vec![0.0; phi_size],
				present: vec![0.0; phi_size],
				absent: vec![0.0; phi_size],
			},
			|scratch, (instance_index, out)| {
				let instance = data.instance(instance_index);
				for tree in ensemble.trees() {
					scratch.diagonal.iter_mut().for_each(|v| *v = 0.0);
					tree_shap(
						&tree,
						&instance,
						&mut scratch.diagonal,
						Condition::Unconditioned,
						&mut scratch.buffer,
					);
					for &feature_index in tree.unique_features() {
						scratch.present.iter_mut().for_each(|v| *v = 0.0);
						scratch.absent.iter_mut().for_each(|v| *v = 0.0);
						tree_shap(
							&tree,
							&instance,
							&mut scratch.present,
							Condition::Present(feature_index),
							&mut scratch.buffer,
						);
						tree_shap(
							&tree,
							&instance,
							&mut scratch.absent,
							Condition::Absent(feature_index),
							&mut scratch.buffer,
						);
						let row = &mut out[feature_index * phi_size..(feature_index + 1) * phi_size];
						for (interaction, diagonal, present, absent) in izip!(
							row[..n_features * n_outputs].iter_mut(),
							scratch.diagonal.iter_mut(),
							scratch.present.iter(),
							scratch.absent.iter(),
						) {
							let value = (present - absent) / 2.0;
							*interaction += value;
							*diagonal -= value;
						}
					}
					for feature_index in 0..=n_features {
						let offset = feature_index * phi_size + feature_index * n_outputs;
						let diagonal = &scratch.diagonal
							[feature_index * n_outputs..(feature_index + 1) * n_outputs];
						for (interaction, diagonal) in
							out[offset..offset + n_outputs].iter_mut().zip(diagonal)
						{
							*interaction += diagonal;
						}
					}
				}
				let bias_offset = n_features * phi_size + n_features * n_outputs;
				for bias in out[bias_offset..bias_offset + n_outputs].iter_mut() {
					*bias += ensemble.base_offset();
				}
				progress_counter.inc(1);
			},
		);
	Ok(interactions)
}

#[cfg(test)]
use crate::{
	path_dependent::dense_tree_path_dependent,
	testing::{assert_close, random_ensemble, random_rows},
};
#[cfg(test)]
use ndarray::prelude::*;
#[cfg(test)]
use rand::SeedableRng;
#[cfg(test)]
use rand_xoshiro::Xoshiro256Plus;

#[test]
fn test_interactions() {
	let mut rng = Xoshiro256Plus::seed_from_u64(3);
	let n_features = 4;
	let n_outputs = 2;
	let ensemble = random_ensemble(&mut rng, 4, n_features, 4, n_outputs);
	let (x, x_missing) = random_rows(&mut rng, 6, n_features);
	let data = ExplanationDataset::new(&x, &x_missing, n_features).unwrap();
	let interactions =
		dense_tree_interactions_path_dependent(&ensemble, &data, &ProgressCounter::new(6))
			.unwrap();
	let contributions =
		dense_tree_path_dependent(&ensemble, &data, &ProgressCounter::new(6)).unwrap();
	// Each row of interactions sums to the plain contribution.
	let row_sums = interactions.row_sums();
	assert_close(
		row_sums.values.as_slice().unwrap(),
		contributions.values.as_slice().unwrap(),
		1e-4,
	);
	for instance_index in 0..data.n_instances() {
		for output in 0..n_outputs {
			let matrix = interactions
				.values
				.slice(s![instance_index, .., .., output]);
			// The matrix is symmetric.
			for i in 0..=n_features {
				for j in 0..i {
					assert_close(&[matrix[[i, j]]], &[matrix[[j, i]]], 1e-4);
				}
			}
			// The bias only appears in the corner.
			for feature_index in 0..n_features {
				assert_eq!(matrix[[feature_index, n_features]], 0.0);
				assert_eq!(matrix[[n_features, feature_index]], 0.0);
			}
			assert_close(
				&[interactions.bias(instance_index, output)],
				&[contributions.bias(instance_index, output)],
				1e-5,
			);
		}
	}
}
