use crate::{
	dataset::{missing_mask, ExplanationDataset},
	ensemble::FinalizedTreeEnsemble,
	error::{ExplainError, Result},
	explain::{explain, ExplainOptions},
};
use ndarray::prelude::*;
use std::collections::BTreeMap;

/**
A `TreeExplainer` explains rows of raw feature values and names each contribution by its feature.

Missing values are marked in the rows themselves with `missing_value`, which defaults to NaN. Each explained row becomes a map from feature name to contribution for the output channel `output`, with the bias stored under `bias_name`.
*/
#[derive(Debug)]
pub struct TreeExplainer {
	pub ensemble: FinalizedTreeEnsemble,
	pub feature_names: Vec<String>,
	pub options: ExplainOptions,
	pub missing_value: f32,
	pub bias_name: String,
	pub output: usize,
	/// The background rows, required by the independent and global path dependent feature dependences.
	pub background: Option<Array2<f32>>,
}

impl TreeExplainer {
	pub fn new(ensemble: FinalizedTreeEnsemble, feature_names: Vec<String>) -> Self {
		Self {
			ensemble,
			feature_names,
			options: ExplainOptions::default(),
			missing_value: std::f32::NAN,
			bias_name: "bias".to_owned(),
			output: 0,
			background: None,
		}
	}

	pub fn n_features(&self) -> usize {
		self.feature_names.len()
	}

	/// Explain each row of `rows`, which has one column per feature name.
	pub fn explain_rows(&self, rows: ArrayView2<f32>) -> Result<Vec<BTreeMap<String, f32>>> {
		self.explain_rows_with_labels(rows, None)
	}

	/// Like `explain_rows`, but with one label per row for the loss transforms.
	pub fn explain_rows_with_labels(
		&self,
		rows: ArrayView2<f32>,
		labels: Option<ArrayView1<f32>>,
	) -> Result<Vec<BTreeMap<String, f32>>> {
		let n_features = self.n_features();
		if self.output >= self.ensemble.n_outputs() {
			return Err(ExplainError::OutputOutOfRange {
				output: self.output,
				n_outputs: self.ensemble.n_outputs(),
			});
		}
		check_n_columns("rows", n_features, rows.ncols())?;
		let x = rows.as_standard_layout();
		let x = x.as_slice().unwrap();
		let x_missing = missing_mask(x, self.missing_value);
		let labels = labels.map(|labels| labels.to_vec());
		let background = match &self.background {
			Some(background) => {
				check_n_columns("background", n_features, background.ncols())?;
				let r = background.as_standard_layout().into_owned();
				let r_missing = missing_mask(r.as_slice().unwrap(), self.missing_value);
				Some((r, r_missing))
			}
			None => None,
		};
		let mut data = ExplanationDataset::new(x, &x_missing, n_features)?;
		if let Some(labels) = &labels {
			data = data.with_labels(labels)?;
		}
		if let Some((r, r_missing)) = &background {
			data = data.with_background(r.as_slice().unwrap(), r_missing)?;
		}
		let contributions = explain(&self.ensemble, &data, &self.options, &mut |_| {})?
			.into_contributions();
		let explained = contributions
			.values
			.outer_iter()
			.map(|row| {
				let mut map = self
					.feature_names
					.iter()
					.cloned()
					.zip(row.column(self.output).iter().copied())
					.collect::<BTreeMap<_, _>>();
				map.insert(self.bias_name.clone(), row[[n_features, self.output]]);
				map
			})
			.collect();
		Ok(explained)
	}

	/// The `n` contributions with the largest magnitude, largest first. The bias is left out.
	pub fn top_contributions<'a>(
		&self,
		contributions: &'a BTreeMap<String, f32>,
		n: usize,
	) -> Vec<(&'a str, f32)> {
		let mut top = contributions
			.iter()
			.filter(|(name, _)| **name != self.bias_name)
			.map(|(name, value)| (name.as_str(), *value))
			.collect::<Vec<_>>();
		top.sort_by(|(_, a), (_, b)| {
			b.abs()
				.partial_cmp(&a.abs())
				.unwrap_or(std::cmp::Ordering::Equal)
		});
		top.truncate(n);
		top
	}
}

fn check_n_columns(name: &'static str, expected: usize, actual: usize) -> Result<()> {
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
use crate::{
	explain::FeatureDependence,
	testing::{branch, finalized, leaf},
	transform::ModelTransform,
};
#[cfg(test)]
use maplit::btreemap;

#[cfg(test)]
fn explainer() -> TreeExplainer {
	let ensemble = finalized(
		&[
			vec![branch(0, 0.5, 1, 2, 4.0), leaf(1.0, 3.0), leaf(4.0, 1.0)],
			vec![branch(1, 0.5, 1, 2, 4.0), leaf(-1.0, 2.0), leaf(1.0, 2.0)],
		],
		0.0,
	);
	TreeExplainer::new(ensemble, vec!["age".to_owned(), "height".to_owned()])
}

#[cfg(test)]
fn assert_maps_close(actual: &BTreeMap<String, f32>, expected: &BTreeMap<String, f32>) {
	assert_eq!(
		actual.keys().collect::<Vec<_>>(),
		expected.keys().collect::<Vec<_>>()
	);
	for (name, value) in expected {
		assert!((actual[name] - value).abs() < 1e-6, "{}: {:?}", name, actual);
	}
}

#[test]
fn test_explain_rows() {
	let explainer = explainer();
	let rows = array![[0.2, 0.8], [std::f32::NAN, 0.1]];
	let explained = explainer.explain_rows(rows.view()).unwrap();
	assert_eq!(explained.len(), 2);
	assert_maps_close(
		&explained[0],
		&btreemap! {
			"age".to_owned() => -0.75,
			"height".to_owned() => 1.0,
			"bias".to_owned() => 1.75,
		},
	);
	// The missing value follows the default child, which is the left child.
	assert_maps_close(
		&explained[1],
		&btreemap! {
			"age".to_owned() => -0.75,
			"height".to_owned() => -1.0,
			"bias".to_owned() => 1.75,
		},
	);
	let top = explainer.top_contributions(&explained[0], 1);
	assert_eq!(top.len(), 1);
	assert_eq!(top[0].0, "height");
}

#[test]
fn test_custom_missing_value_and_bias_name() {
	let mut explainer = explainer();
	explainer.missing_value = -999.0;
	explainer.bias_name = "expected_value".to_owned();
	let rows = array![[0.9, -999.0]];
	let explained = explainer.explain_rows(rows.view()).unwrap();
	assert_maps_close(
		&explained[0],
		&btreemap! {
			"age".to_owned() => 2.25,
			"height".to_owned() => -1.0,
			"expected_value".to_owned() => 1.75,
		},
	);
}

#[test]
fn test_independent_with_labels() {
	let mut explainer = explainer();
	explainer.options.feature_dependence = FeatureDependence::Independent;
	explainer.options.model_transform = ModelTransform::SquaredLoss;
	explainer.background = Some(array![[0.2, 0.2]]);
	let rows = array![[0.9, 0.9]];
	let labels = array![5.0];
	let explained = explainer
		.explain_rows_with_labels(rows.view(), Some(labels.view()))
		.unwrap();
	// The margin goes from 0 to 5, so the loss goes from 25 to 0.
	let total = explained[0].values().sum::<f32>();
	assert!((total - 0.0).abs() < 1e-5);
	assert!((explained[0]["bias"] - 25.0).abs() < 1e-5);
	let top = explainer.top_contributions(&explained[0], 2);
	assert_eq!(top[0].0, "age");
}

#[test]
fn test_errors() {
	let mut explainer = explainer();
	let rows = array![[0.2, 0.8, 0.5]];
	assert!(matches!(
		explainer.explain_rows(rows.view()),
		Err(ExplainError::LengthMismatch { expected: 2, actual: 3, .. })
	));
	explainer.output = 1;
	let rows = array![[0.2, 0.8]];
	assert!(matches!(
		explainer.explain_rows(rows.view()),
		Err(ExplainError::OutputOutOfRange { output: 1, n_outputs: 1 })
	));
}
