use serde::Deserialize;

/// A `ModelTransform` maps a raw margin, and optionally a label, to the quantity being explained.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTransform {
	Identity,
	/// The probability of the positive class, `1 / (1 + e^-margin)`.
	Logistic,
	/// The log loss of a binary classifier, `ln(1 + e^margin) - label * margin`.
	LogisticNlogloss,
	/// `(margin - label)^2`.
	SquaredLoss,
}

impl Default for ModelTransform {
	fn default() -> Self {
		ModelTransform::Identity
	}
}

impl ModelTransform {
	pub fn apply(self, margin: f32, label: f32) -> f32 {
		match self {
			ModelTransform::Identity => margin,
			ModelTransform::Logistic => 1.0 / (1.0 + (-margin).exp()),
			ModelTransform::LogisticNlogloss => softplus(margin) - label * margin,
			ModelTransform::SquaredLoss => (margin - label) * (margin - label),
		}
	}

	pub fn is_identity(self) -> bool {
		self == ModelTransform::Identity
	}

	/// The slope of the secant between two margins, used to rescale contributions computed in margin space. The identity and equal margins have slope 1.
	pub fn rescale(self, margin_x: f32, margin_r: f32, label: f32) -> f32 {
		if self.is_identity() || margin_x == margin_r {
			return 1.0;
		}
		(self.apply(margin_x, label) - self.apply(margin_r, label)) / (margin_x - margin_r)
	}
}

/// `ln(1 + e^x)`, without overflowing for large `x`.
fn softplus(x: f32) -> f32 {
	if x > 20.0 {
		x + (-x).exp().ln_1p()
	} else {
		x.exp().ln_1p()
	}
}

#[test]
fn test_apply() {
	assert_eq!(ModelTransform::Identity.apply(1.5, 3.0), 1.5);
	assert_eq!(ModelTransform::Logistic.apply(0.0, 0.0), 0.5);
	assert_eq!(ModelTransform::SquaredLoss.apply(1.5, 3.0), 2.25);
	let loss = ModelTransform::LogisticNlogloss.apply(0.0, 1.0);
	assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
	assert!(ModelTransform::LogisticNlogloss.apply(100.0, 1.0).abs() < 1e-4);
}

#[test]
fn test_rescale() {
	assert_eq!(ModelTransform::Identity.rescale(2.0, -1.0, 0.0), 1.0);
	assert_eq!(ModelTransform::Logistic.rescale(0.5, 0.5, 0.0), 1.0);
	assert_eq!(ModelTransform::SquaredLoss.rescale(3.0, 1.0, 0.0), 4.0);
}

#[test]
fn test_deserialize() {
	let transform: ModelTransform = serde_yaml::from_str("logistic_nlogloss").unwrap();
	assert_eq!(transform, ModelTransform::LogisticNlogloss);
	assert!(serde_yaml::from_str::<ModelTransform>("softmax").is_err());
}
