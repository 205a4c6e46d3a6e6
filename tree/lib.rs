/*!
This crate computes SHAP values for ensembles of decision trees: exact per feature contributions that, together with a bias term, add up to the model's prediction for each instance.

An ensemble is loaded into a flat [`TreeEnsemble`] by a model specific adapter and then finalized, which validates it and replaces every branch's value with the expectation of its children. The finalized ensemble is shared read-only between threads.

```ignore
let ensemble = ensemble.finalize(&FinalizeOptions::default())?;
let data = ExplanationDataset::new(&x, &x_missing, n_features)?;
let explanation = explain(&ensemble, &data, &ExplainOptions::default(), &mut |_| {})?;
```

Three ways of handling absent features are supported, see [`FeatureDependence`]. The tree path dependent algorithm can also compute pairwise interaction values, or a fast approximation that follows only the instance's own decision path.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod config;
mod contributions;
mod dataset;
mod ensemble;
mod error;
mod explain;
mod explainer;
mod independent;
mod interactions;
mod merged;
mod path;
mod path_dependent;
mod predict;
mod saabas;
#[cfg(test)]
mod testing;
#[cfg(feature = "timing")]
mod timing;
mod transform;

pub use self::config::{load_config, Config};
pub use self::contributions::{Contributions, InteractionContributions};
pub use self::dataset::{missing_mask, ExplanationDataset, Instance};
pub use self::ensemble::{
	BranchNode, FinalizeOptions, FinalizedTreeEnsemble, LeafNode, Node, TreeEnsemble, TreeView,
};
pub use self::error::{ExplainError, Result};
pub use self::explain::{
	estimate_cost, explain, ExplainOptions, ExplainProgress, Explanation, FeatureDependence,
};
pub use self::explainer::TreeExplainer;
pub use self::independent::{
	binomial_weights, dense_independent, tree_shap_independent, IndependentNode, IndependentScratch,
};
pub use self::interactions::dense_tree_interactions_path_dependent;
pub use self::merged::{build_merged_tree, dense_global_path_dependent};
pub use self::path::{extend_path, unwind_path, unwound_path_sum, PathBuffer, PathElement};
pub use self::path_dependent::{dense_tree_path_dependent, tree_shap, Condition};
pub use self::predict::{dense_tree_predict, margin, tree_predict};
pub use self::saabas::{dense_tree_saabas, tree_saabas};
pub use self::transform::ModelTransform;

/// Zip parallel iterators.
#[macro_export]
macro_rules! pzip {
	($($e:expr),* $(,)*) => {
		rayon::iter::IntoParallelIterator::into_par_iter(($($e,)*))
	};
}
