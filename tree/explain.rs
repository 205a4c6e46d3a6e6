#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	dataset::ExplanationDataset,
	ensemble::FinalizedTreeEnsemble,
	error::{ExplainError, Result},
	independent::independent_contributions,
	interactions::dense_tree_interactions_path_dependent,
	merged::{build_merged_tree, explain_merged_tree},
	path_dependent::dense_tree_path_dependent,
	saabas::dense_tree_saabas,
	transform::ModelTransform,
	Contributions, InteractionContributions,
};
use num_traits::ToPrimitive;
use serde::Deserialize;
use treeshap_progress::ProgressCounter;

/// How absent features are filled in when a coalition leaves them out.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDependence {
	/// Absent features take their values from each background row in turn, as if features were independent.
	Independent,
	/// Absent features follow each split in proportion to the sample weights recorded in the trees.
	TreePathDependent,
	/// Like `TreePathDependent`, but the sample weights are recomputed from the background rows after merging the ensemble into a single tree.
	GlobalPathDependent,
}

impl Default for FeatureDependence {
	fn default() -> Self {
		FeatureDependence::TreePathDependent
	}
}

/// These are the options passed to `explain`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExplainOptions {
	pub feature_dependence: FeatureDependence,
	/// If true, compute the pairwise interaction values instead of the contributions.
	pub interactions: bool,
	/// If true, compute the fast Saabas approximation instead of exact SHAP values.
	pub approximate: bool,
	/// The function of the margin to explain. Only the independent feature dependence supports a transform other than the identity.
	pub model_transform: ModelTransform,
	/// If set, refuse to explain when `estimate_cost` exceeds this many node visits.
	pub max_cost: Option<u64>,
}

impl Default for ExplainOptions {
	fn default() -> Self {
		Self {
			feature_dependence: FeatureDependence::default(),
			interactions: false,
			approximate: false,
			model_transform: ModelTransform::default(),
			max_cost: None,
		}
	}
}

#[derive(Debug)]
pub enum Explanation {
	Contributions(Contributions),
	Interactions(InteractionContributions),
}

impl Explanation {
	/// The per feature contributions. Interaction values are summed over each row.
	pub fn into_contributions(self) -> Contributions {
		match self {
			Explanation::Contributions(contributions) => contributions,
			Explanation::Interactions(interactions) => interactions.row_sums(),
		}
	}
}

#[derive(Clone, Debug)]
pub enum ExplainProgress {
	BuildingMergedTree,
	Explaining(ProgressCounter),
}

/**
Estimate the number of node visits `explain` will make, before doing any of the work.

The estimate is an upper bound on the work per instance for each algorithm. The path dependent recursion visits each node of a tree once and does work proportional to the tree's depth there. The interaction values repeat that twice for every feature a tree splits on. The independent algorithm visits each node once per background row and output. The merged tree has at most two nodes per row and is as deep as all the trees stacked.
*/
pub fn estimate_cost(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	options: &ExplainOptions,
) -> u64 {
	let n_instances = data.n_instances().to_u64().unwrap();
	let n_background = data.n_background().to_u64().unwrap();
	let n_outputs = ensemble.n_outputs().to_u64().unwrap();
	let max_nodes = ensemble.max_nodes().to_u64().unwrap();
	let depths = (0..ensemble.n_trees()).map(|tree| ensemble.tree_depth(tree).to_u64().unwrap());
	let per_instance: u64 = if options.approximate {
		depths.sum()
	} else {
		match options.feature_dependence {
			FeatureDependence::TreePathDependent => (0..ensemble.n_trees())
				.map(|tree| {
					let depth = ensemble.tree_depth(tree).to_u64().unwrap();
					let cost = n_nodes_bound(depth, max_nodes).saturating_mul(depth + 1);
					if options.interactions {
						let n_features = ensemble.unique_features(tree).len().to_u64().unwrap();
						cost.saturating_mul(2 * n_features + 1)
					} else {
						cost
					}
				})
				.fold(0, u64::saturating_add),
			FeatureDependence::Independent => (0..ensemble.n_trees())
				.map(|tree| {
					n_nodes_bound(ensemble.tree_depth(tree).to_u64().unwrap(), max_nodes)
				})
				.fold(0, u64::saturating_add)
				.saturating_mul(n_background)
				.saturating_mul(n_outputs),
			FeatureDependence::GlobalPathDependent => {
				let depth = depths.sum::<u64>();
				let n_rows = n_instances + n_background;
				let merged_nodes = (2 * n_rows).saturating_sub(1);
				merged_nodes.saturating_mul(depth + 1)
			}
		}
	};
	per_instance.saturating_mul(n_instances)
}

/// A tree of depth `depth` has at most `2^(depth + 1) - 1` nodes.
fn n_nodes_bound(depth: u64, max_nodes: u64) -> u64 {
	let full = 1u64
		.checked_shl((depth + 1).to_u32().unwrap_or(u32::MAX))
		.filter(|n| *n > 0)
		.map(|n| n - 1)
		.unwrap_or(u64::MAX);
	full.min(max_nodes)
}

/**
Explain every instance in `data` with the algorithm `options` selects.

Everything that can go wrong is checked before any instance is explained: the data must have every feature the ensemble splits on, the combination of options must be supported, a background dataset must be present for the independent and global path dependent algorithms, and the estimated cost must be within `options.max_cost`.
*/
pub fn explain(
	ensemble: &FinalizedTreeEnsemble,
	data: &ExplanationDataset,
	options: &ExplainOptions,
	update_progress: &mut dyn FnMut(ExplainProgress),
) -> Result<Explanation> {
	#[cfg(feature = "timing")]
	let timing = Timing::new();
	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();

	ensemble.check_n_features(data.n_features())?;
	check_options(options)?;
	match options.feature_dependence {
		FeatureDependence::Independent if !data.has_background() => {
			return Err(ExplainError::MissingBackground(
				"independent feature dependence",
			));
		}
		FeatureDependence::GlobalPathDependent if !data.has_background() => {
			return Err(ExplainError::MissingBackground("global path dependent"));
		}
		_ => {}
	}
	if let Some(limit) = options.max_cost {
		let estimated = estimate_cost(ensemble, data, options);
		if estimated > limit {
			return Err(ExplainError::CostLimitExceeded { estimated, limit });
		}
	}

	let n_instances = data.n_instances().to_u64().unwrap();
	let explanation = match options.feature_dependence {
		FeatureDependence::TreePathDependent => {
			let progress_counter = ProgressCounter::new(n_instances);
			update_progress(ExplainProgress::Explaining(progress_counter.clone()));
			#[cfg(feature = "timing")]
			let start = std::time::Instant::now();
			if options.interactions {
				let interactions =
					dense_tree_interactions_path_dependent(ensemble, data, &progress_counter)?;
				#[cfg(feature = "timing")]
				timing.interactions.inc(start.elapsed());
				Explanation::Interactions(interactions)
			} else if options.approximate {
				let contributions = dense_tree_saabas(ensemble, data, &progress_counter)?;
				#[cfg(feature = "timing")]
				timing.saabas.inc(start.elapsed());
				Explanation::Contributions(contributions)
			} else {
				let contributions = dense_tree_path_dependent(ensemble, data, &progress_counter)?;
				#[cfg(feature = "timing")]
				timing.tree_path_dependent.inc(start.elapsed());
				Explanation::Contributions(contributions)
			}
		}
		FeatureDependence::Independent => {
			let n_outputs = ensemble.n_outputs().to_u64().unwrap();
			let progress_counter = ProgressCounter::new(n_instances * n_outputs);
			update_progress(ExplainProgress::Explaining(progress_counter.clone()));
			#[cfg(not(feature = "timing"))]
			let contributions = independent_contributions(
				ensemble,
				data,
				options.model_transform,
				&progress_counter,
			);
			#[cfg(feature = "timing")]
			let contributions = independent_contributions(
				ensemble,
				data,
				options.model_transform,
				&progress_counter,
				&timing,
			);
			Explanation::Contributions(contributions)
		}
		FeatureDependence::GlobalPathDependent => {
			update_progress(ExplainProgress::BuildingMergedTree);
			#[cfg(feature = "timing")]
			let start = std::time::Instant::now();
			let merged = build_merged_tree(ensemble, data)?;
			#[cfg(feature = "timing")]
			timing.build_merged_tree.inc(start.elapsed());
			let progress_counter = ProgressCounter::new(n_instances);
			update_progress(ExplainProgress::Explaining(progress_counter.clone()));
			#[cfg(feature = "timing")]
			let start = std::time::Instant::now();
			let contributions = explain_merged_tree(ensemble, &merged, data, &progress_counter);
			#[cfg(feature = "timing")]
			timing.explain_merged_tree.inc(start.elapsed());
			Explanation::Contributions(contributions)
		}
	};

	#[cfg(feature = "timing")]
	{
		timing.total.inc(start.elapsed());
		eprintln!("{:?}", timing);
	}

	Ok(explanation)
}

fn check_options(options: &ExplainOptions) -> Result<()> {
	let feature_dependence = options.feature_dependence;
	if options.interactions && feature_dependence == FeatureDependence::Independent {
		return Err(ExplainError::UnsupportedCombination(
			"the independent feature dependence does not support interactions",
		));
	}
	if options.interactions && feature_dependence == FeatureDependence::GlobalPathDependent {
		return Err(ExplainError::UnsupportedCombination(
			"the global path dependent feature dependence does not support interactions",
		));
	}
	if options.approximate
		&& (options.interactions || feature_dependence != FeatureDependence::TreePathDependent)
	{
		return Err(ExplainError::UnsupportedCombination(
			"approximate explanations require the tree path dependent feature dependence without interactions",
		));
	}
	if !options.model_transform.is_identity() && feature_dependence != FeatureDependence::Independent
	{
		return Err(ExplainError::UnsupportedCombination(
			"a model transform other than the identity requires the independent feature dependence",
		));
	}
	Ok(())
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
fn test_dispatch() {
	let ensemble = finalized(
		&[vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)]],
		0.0,
	);
	let x = [0.2];
	let x_missing = [false];
	let r = [0.9, 0.1, 0.8];
	let r_missing = [false; 3];
	let data = ExplanationDataset::new(&x, &x_missing, 1)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let run = |options: ExplainOptions| {
		explain(&ensemble, &data, &options, &mut |_| {})
			.unwrap()
			.into_contributions()
			.values
			.iter()
			.copied()
			.collect::<Vec<_>>()
	};
	let path_dependent = run(ExplainOptions::default());
	assert_close(&path_dependent, &[-0.75, 1.75], 1e-6);
	let approximate = run(ExplainOptions {
		approximate: true,
		..Default::default()
	});
	assert_close(&approximate, &[-0.75, 1.75], 1e-6);
	let interactions = run(ExplainOptions {
		interactions: true,
		..Default::default()
	});
	assert_close(&interactions, &[-0.75, 1.75], 1e-6);
	let global = run(ExplainOptions {
		feature_dependence: FeatureDependence::GlobalPathDependent,
		..Default::default()
	});
	assert_close(&global, &[-2.0, 3.0], 1e-6);
	let independent = run(ExplainOptions {
		feature_dependence: FeatureDependence::Independent,
		..Default::default()
	});
	assert_close(&independent, &[-2.0, 3.0], 1e-6);
}

#[test]
fn test_unsupported_combinations() {
	let ensemble = finalized(&[vec![leaf(1.0, 1.0)]], 0.0);
	let x = [0.2];
	let x_missing = [false];
	let data = ExplanationDataset::new(&x, &x_missing, 1)
		.unwrap()
		.with_background(&x, &x_missing)
		.unwrap();
	let unsupported = vec![
		ExplainOptions {
			feature_dependence: FeatureDependence::Independent,
			interactions: true,
			..Default::default()
		},
		ExplainOptions {
			feature_dependence: FeatureDependence::GlobalPathDependent,
			interactions: true,
			..Default::default()
		},
		ExplainOptions {
			approximate: true,
			interactions: true,
			..Default::default()
		},
		ExplainOptions {
			feature_dependence: FeatureDependence::Independent,
			approximate: true,
			..Default::default()
		},
		ExplainOptions {
			model_transform: ModelTransform::Logistic,
			..Default::default()
		},
	];
	for options in unsupported {
		let result = explain(&ensemble, &data, &options, &mut |_| {});
		assert!(
			matches!(result, Err(ExplainError::UnsupportedCombination(_))),
			"{:?}",
			options
		);
	}
}

#[test]
fn test_missing_background() {
	let ensemble = finalized(&[vec![leaf(1.0, 1.0)]], 0.0);
	let x = [0.2];
	let x_missing = [false];
	let data = ExplanationDataset::new(&x, &x_missing, 1).unwrap();
	for &feature_dependence in &[
		FeatureDependence::Independent,
		FeatureDependence::GlobalPathDependent,
	] {
		let options = ExplainOptions {
			feature_dependence,
			..Default::default()
		};
		let result = explain(&ensemble, &data, &options, &mut |_| {});
		assert!(matches!(result, Err(ExplainError::MissingBackground(_))));
	}
}

#[test]
fn test_feature_out_of_range() {
	let ensemble = finalized(
		&[vec![branch(3, 0.5, 1, 2, 2.0), leaf(0.0, 1.0), leaf(1.0, 1.0)]],
		0.0,
	);
	let x = [0.2, 0.3];
	let x_missing = [false; 2];
	let data = ExplanationDataset::new(&x, &x_missing, 2).unwrap();
	let result = explain(&ensemble, &data, &ExplainOptions::default(), &mut |_| {});
	assert!(matches!(
		result,
		Err(ExplainError::FeatureOutOfRange { feature: 3, .. })
	));
}

#[test]
fn test_cost_limit() {
	let mut rng = Xoshiro256Plus::seed_from_u64(21);
	let ensemble = random_ensemble(&mut rng, 5, 4, 4, 1);
	let (x, x_missing) = random_rows(&mut rng, 10, 4);
	let (r, r_missing) = random_rows(&mut rng, 20, 4);
	let data = ExplanationDataset::new(&x, &x_missing, 4)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let path_dependent = estimate_cost(&ensemble, &data, &ExplainOptions::default());
	let independent = estimate_cost(
		&ensemble,
		&data,
		&ExplainOptions {
			feature_dependence: FeatureDependence::Independent,
			..Default::default()
		},
	);
	let approximate = estimate_cost(
		&ensemble,
		&data,
		&ExplainOptions {
			approximate: true,
			..Default::default()
		},
	);
	assert!(approximate < path_dependent);
	assert!(path_dependent > 0);
	assert!(independent > 0);
	let options = ExplainOptions {
		feature_dependence: FeatureDependence::Independent,
		max_cost: Some(independent - 1),
		..Default::default()
	};
	let result = explain(&ensemble, &data, &options, &mut |_| {});
	assert!(matches!(
		result,
		Err(ExplainError::CostLimitExceeded { estimated, .. }) if estimated == independent
	));
	let options = ExplainOptions {
		max_cost: Some(path_dependent),
		..Default::default()
	};
	assert!(explain(&ensemble, &data, &options, &mut |_| {}).is_ok());
}

#[test]
fn test_progress() {
	let mut rng = Xoshiro256Plus::seed_from_u64(22);
	let ensemble = random_ensemble(&mut rng, 3, 3, 3, 2);
	let (x, x_missing) = random_rows(&mut rng, 4, 3);
	let (r, r_missing) = random_rows(&mut rng, 5, 3);
	let data = ExplanationDataset::new(&x, &x_missing, 3)
		.unwrap()
		.with_background(&r, &r_missing)
		.unwrap();
	let mut counters = Vec::new();
	let mut built_merged_tree = false;
	let options = ExplainOptions {
		feature_dependence: FeatureDependence::GlobalPathDependent,
		..Default::default()
	};
	let explanation = explain(&ensemble, &data, &options, &mut |progress| match progress {
		ExplainProgress::BuildingMergedTree => built_merged_tree = true,
		ExplainProgress::Explaining(counter) => counters.push(counter),
	})
	.unwrap()
	.into_contributions();
	assert!(built_merged_tree);
	assert_eq!(counters.len(), 1);
	assert_eq!(counters[0].get(), 4);
	assert_eq!(counters[0].total(), 4);
	for (instance_index, instance) in data.instances().enumerate() {
		for output in 0..2 {
			assert_close(
				&[explanation.row_sum(instance_index, output)],
				&[margin(&ensemble, &instance, output)],
				1e-4,
			);
		}
	}
	counters.clear();
	let options = ExplainOptions {
		feature_dependence: FeatureDependence::Independent,
		..Default::default()
	};
	explain(&ensemble, &data, &options, &mut |progress| {
		if let ExplainProgress::Explaining(counter) = progress {
			counters.push(counter)
		}
	})
	.unwrap();
	assert_eq!(counters[0].get(), 8);
}
