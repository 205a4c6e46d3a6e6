/*!
This module defines the `Config` struct, which configures a [`TreeExplainer`](../explainer/struct.TreeExplainer.html) from a YAML or JSON file.

```yaml
feature_dependence: independent
model_transform: logistic
max_cost: 1000000000
missing_value: -1
bias_name: expected_value
```

Every field is optional, and an unknown field is an error.
*/

use crate::{
	ensemble::FinalizedTreeEnsemble,
	explain::{ExplainOptions, FeatureDependence},
	explainer::TreeExplainer,
	transform::ModelTransform,
};
use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Default, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub feature_dependence: Option<FeatureDependence>,
	pub interactions: Option<bool>,
	pub approximate: Option<bool>,
	pub model_transform: Option<ModelTransform>,
	pub max_cost: Option<u64>,
	/// A sentinel marking missing values in explained rows. When absent, NaN marks missing values.
	pub missing_value: Option<f32>,
	pub bias_name: Option<String>,
	pub output: Option<usize>,
}

/// Read a config from `config_path`, parsed as JSON if the extension is `.json` and as YAML otherwise.
pub fn load_config(config_path: Option<&Path>) -> Result<Option<Config>> {
	if let Some(config_path) = config_path {
		let config = std::fs::read_to_string(config_path)
			.with_context(|| format!("failed to read config file {}", config_path.display()))?;
		let is_json = config_path
			.extension()
			.map(|extension| extension == "json")
			.unwrap_or(false);
		let config = if is_json {
			serde_json::from_str(&config)
				.with_context(|| format!("failed to parse config file {}", config_path.display()))?
		} else {
			serde_yaml::from_str(&config)
				.with_context(|| format!("failed to parse config file {}", config_path.display()))?
		};
		Ok(Some(config))
	} else {
		Ok(None)
	}
}

impl ExplainOptions {
	pub fn from_config(config: &Config) -> ExplainOptions {
		let default = ExplainOptions::default();
		ExplainOptions {
			feature_dependence: config
				.feature_dependence
				.unwrap_or(default.feature_dependence),
			interactions: config.interactions.unwrap_or(default.interactions),
			approximate: config.approximate.unwrap_or(default.approximate),
			model_transform: config.model_transform.unwrap_or(default.model_transform),
			max_cost: config.max_cost.or(default.max_cost),
		}
	}
}

impl TreeExplainer {
	pub fn from_config(
		ensemble: FinalizedTreeEnsemble,
		feature_names: Vec<String>,
		config: &Config,
	) -> TreeExplainer {
		let mut explainer = TreeExplainer::new(ensemble, feature_names);
		explainer.options = ExplainOptions::from_config(config);
		if let Some(missing_value) = config.missing_value {
			explainer.missing_value = missing_value;
		}
		if let Some(bias_name) = &config.bias_name {
			explainer.bias_name = bias_name.clone();
		}
		if let Some(output) = config.output {
			explainer.output = output;
		}
		explainer
	}
}

#[cfg(test)]
use crate::testing::{finalized, leaf};

#[test]
fn test_parse_yaml() {
	let config: Config = serde_yaml::from_str(
		"
feature_dependence: global_path_dependent
model_transform: identity
max_cost: 1000
bias_name: expected_value
",
	)
	.unwrap();
	let options = ExplainOptions::from_config(&config);
	insta::assert_debug_snapshot!(options, @r###"
 ExplainOptions {
     feature_dependence: GlobalPathDependent,
     interactions: false,
     approximate: false,
     model_transform: Identity,
     max_cost: Some(
         1000,
     ),
 }
 "###);
	let ensemble = finalized(&[vec![leaf(1.0, 1.0)]], 0.0);
	let explainer = TreeExplainer::from_config(ensemble, vec!["a".to_owned()], &config);
	assert_eq!(explainer.bias_name, "expected_value");
	assert!(explainer.missing_value.is_nan());
	assert_eq!(explainer.output, 0);
}

#[test]
fn test_unknown_field() {
	let result = serde_yaml::from_str::<Config>("check_additivity: true");
	assert!(result.is_err());
	let result = serde_yaml::from_str::<Config>("feature_dependence: interventional");
	assert!(result.is_err());
}

#[test]
fn test_load_config() {
	assert!(load_config(None).unwrap().is_none());
	let dir = std::env::temp_dir().join(format!("treeshap_config_{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let json_path = dir.join("config.json");
	std::fs::write(
		&json_path,
		r#"{"interactions": true, "missing_value": -1.0, "output": 2}"#,
	)
	.unwrap();
	let config = load_config(Some(&json_path)).unwrap().unwrap();
	assert_eq!(
		config,
		Config {
			interactions: Some(true),
			missing_value: Some(-1.0),
			output: Some(2),
			..Default::default()
		}
	);
	let yaml_path = dir.join("config.yaml");
	std::fs::write(&yaml_path, "approximate: yes please").unwrap();
	let error = load_config(Some(&yaml_path)).unwrap_err();
	assert!(error.to_string().contains("failed to parse config file"));
	let error = load_config(Some(&dir.join("missing.yaml"))).unwrap_err();
	assert!(error.to_string().contains("failed to read config file"));
	std::fs::remove_dir_all(&dir).unwrap();
}
