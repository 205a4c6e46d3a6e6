use crate::error::{ExplainError, Result};

/**
An `ExplanationDataset` borrows the instances to explain and, for the background-based variants, the background rows. Every matrix is row-major with `n_features` columns, and every value has a matching entry in a missingness mask.
*/
#[derive(Clone, Copy, Debug)]
pub struct ExplanationDataset<'a> {
	x: &'a [f32],
	x_missing: &'a [bool],
	n_instances: usize,
	n_features: usize,
	labels: Option<&'a [f32]>,
	background: Option<Background<'a>>,
}

#[derive(Clone, Copy, Debug)]
struct Background<'a> {
	r: &'a [f32],
	r_missing: &'a [bool],
	n_rows: usize,
}

/// A zero-copy view of a single row.
#[derive(Clone, Copy, Debug)]
pub struct Instance<'a> {
	pub values: &'a [f32],
	pub missing: &'a [bool],
}

impl<'a> Instance<'a> {
	pub fn new(values: &'a [f32], missing: &'a [bool]) -> Self {
		Self { values, missing }
	}

	#[inline]
	pub fn value(&self, feature_index: usize) -> f32 {
		self.values[feature_index]
	}

	#[inline]
	pub fn is_missing(&self, feature_index: usize) -> bool {
		self.missing[feature_index]
	}
}

impl<'a> ExplanationDataset<'a> {
	pub fn new(x: &'a [f32], x_missing: &'a [bool], n_features: usize) -> Result<Self> {
		let n_instances = rows(x, n_features, "x")?;
		check_len("x_missing", x.len(), x_missing.len())?;
		Ok(Self {
			x,
			x_missing,
			n_instances,
			n_features,
			labels: None,
			background: None,
		})
	}

	/// Attach one label per instance. Labels are only read by the loss transforms.
	pub fn with_labels(mut self, labels: &'a [f32]) -> Result<Self> {
		check_len("labels", self.n_instances, labels.len())?;
		self.labels = Some(labels);
		Ok(self)
	}

	pub fn with_background(mut self, r: &'a [f32], r_missing: &'a [bool]) -> Result<Self> {
		let n_rows = rows(r, self.n_features, "r")?;
		check_len("r_missing", r.len(), r_missing.len())?;
		self.background = Some(Background {
			r,
			r_missing,
			n_rows,
		});
		Ok(self)
	}

	pub fn n_instances(&self) -> usize {
		self.n_instances
	}

	pub fn n_features(&self) -> usize {
		self.n_features
	}

	pub fn n_background(&self) -> usize {
		self.background.map(|b| b.n_rows).unwrap_or(0)
	}

	pub fn has_background(&self) -> bool {
		self.n_background() > 0
	}

	pub fn instance(&self, index: usize) -> Instance<'a> {
		let range = index * self.n_features..(index + 1) * self.n_features;
		Instance {
			values: &self.x[range.clone()],
			missing: &self.x_missing[range],
		}
	}

	/// The label of an instance, or 0 when the dataset has no labels.
	pub fn label(&self, index: usize) -> f32 {
		self.labels.map(|labels| labels[index]).unwrap_or(0.0)
	}

	/// # Panics
	///
	/// Panics if the dataset has no background or `index` is out of range.
	pub fn background_row(&self, index: usize) -> Instance<'a> {
		let background = self.background.as_ref().expect("dataset has no background");
		let range = index * self.n_features..(index + 1) * self.n_features;
		Instance {
			values: &background.r[range.clone()],
			missing: &background.r_missing[range],
		}
	}

	pub fn instances(&self) -> impl Iterator<Item = Instance<'a>> + '_ {
		(0..self.n_instances).map(move |index| self.instance(index))
	}

	pub fn background_rows(&self) -> impl Iterator<Item = Instance<'a>> + '_ {
		(0..self.n_background()).map(move |index| self.background_row(index))
	}
}

/// Build a missingness mask by comparing every value against a sentinel. A NaN sentinel marks every NaN as missing.
pub fn missing_mask(values: &[f32], missing_value: f32) -> Vec<bool> {
	if missing_value.is_nan() {
		values.iter().map(|value| value.is_nan()).collect()
	} else {
		values.iter().map(|value| *value == missing_value).collect()
	}
}

fn rows(values: &[f32], n_features: usize, name: &'static str) -> Result<usize> {
	if n_features == 0 {
		return if values.is_empty() {
			Ok(0)
		} else {
			Err(ExplainError::LengthMismatch {
				name,
				expected: 0,
				actual: values.len(),
			})
		};
	}
	if values.len() % n_features != 0 {
		return Err(ExplainError::LengthMismatch {
			name,
			expected: (values.len() / n_features + 1) * n_features,
			actual: values.len(),
		});
	}
	Ok(values.len() / n_features)
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

#[test]
fn test_instance_views() {
	let x = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
	let x_missing = [false, false, true, false, false, false];
	let data = ExplanationDataset::new(&x, &x_missing, 3).unwrap();
	assert_eq!(data.n_instances(), 2);
	let instance = data.instance(1);
	assert_eq!(instance.values, &[3.0, 4.0, 5.0]);
	assert!(data.instance(0).is_missing(2));
	assert!(!data.has_background());
	assert_eq!(data.label(0), 0.0);
}

#[test]
fn test_mismatched_lengths() {
	let x = [0.0, 1.0, 2.0, 3.0];
	let x_missing = [false; 3];
	assert!(matches!(
		ExplanationDataset::new(&x, &x_missing, 2),
		Err(ExplainError::LengthMismatch {
			name: "x_missing",
			..
		})
	));
	assert!(ExplanationDataset::new(&x, &[false; 4], 3).is_err());
	let data = ExplanationDataset::new(&x, &[false; 4], 2).unwrap();
	assert!(data.with_labels(&[1.0]).is_err());
	assert!(data.with_background(&[0.0, 1.0, 2.0], &[false; 3]).is_err());
}

#[test]
fn test_missing_mask() {
	assert_eq!(
		missing_mask(&[1.0, f32::NAN, -1.0], f32::NAN),
		vec![false, true, false]
	);
	assert_eq!(
		missing_mask(&[1.0, f32::NAN, -1.0], -1.0),
		vec![false, false, true]
	);
}
