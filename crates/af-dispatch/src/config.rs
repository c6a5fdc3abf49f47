//! Pipeline configuration parsed from string compile options or JSON.

use af_core::{CompatibilityMode, DEFAULT_OVERLAP_ENUMERATION_LIMIT, Primitive};
use af_functionalize::CollectOptions;
use af_partition::{PartitionOptions, PartitionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const KNOWN_OPTION_KEYS: &[&str] = &[
    "mode",
    "backend",
    "partition_policy",
    "keep_inference_input_mutations",
    "overlap_enumeration_limit",
    "recompute_allowlist",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown compile option `{key}` rejected in strict mode")]
    UnknownKey { key: String },
    #[error("compile option `{key}` has invalid value `{value}`, expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("recompute allowlist names unknown primitive `{0}`")]
    UnknownPrimitive(String),
    #[error("malformed pipeline config json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: CompatibilityMode,
    /// Registered backend name; `None` picks the registry default.
    pub backend: Option<String>,
    pub partition_policy: PartitionPolicy,
    pub keep_inference_input_mutations: bool,
    pub overlap_enumeration_limit: usize,
    /// Primitive names that replace the default cheap-to-recompute set.
    pub recompute_allowlist: Option<Vec<String>>,
    /// Option keys a hardened-mode parse skipped.
    #[serde(skip)]
    pub ignored_options: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: CompatibilityMode::Strict,
            backend: None,
            partition_policy: PartitionPolicy::Default,
            keep_inference_input_mutations: false,
            overlap_enumeration_limit: DEFAULT_OVERLAP_ENUMERATION_LIMIT,
            recompute_allowlist: None,
            ignored_options: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse string options. `mode` is read first so that it governs how
    /// unknown keys are treated regardless of map order.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(mode) = options.get("mode") {
            config.mode = parse_mode(mode)?;
        }
        for (key, value) in options {
            match key.as_str() {
                "mode" => {}
                "backend" => {
                    let trimmed = value.trim();
                    config.backend = (!trimmed.is_empty()).then(|| trimmed.to_owned());
                }
                "partition_policy" => config.partition_policy = parse_policy(value)?,
                "keep_inference_input_mutations" => {
                    config.keep_inference_input_mutations = parse_bool(key, value)?;
                }
                "overlap_enumeration_limit" => {
                    config.overlap_enumeration_limit =
                        value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                            key: key.clone(),
                            value: value.clone(),
                            expected: "a non-negative integer",
                        })?;
                }
                "recompute_allowlist" => {
                    config.recompute_allowlist = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(str::to_owned)
                            .collect(),
                    );
                }
                _ => match config.mode {
                    CompatibilityMode::Strict => {
                        return Err(ConfigError::UnknownKey { key: key.clone() });
                    }
                    CompatibilityMode::Hardened => {
                        tracing::debug!(key = %key, "ignoring unknown compile option");
                        config.ignored_options.push(key.clone());
                    }
                },
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Json(e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.recompute_primitives().map(|_| ())
    }

    pub fn recompute_primitives(&self) -> Result<Option<Vec<Primitive>>, ConfigError> {
        self.recompute_allowlist
            .as_ref()
            .map(|names| {
                names
                    .iter()
                    .map(|name| {
                        Primitive::from_name(name)
                            .ok_or_else(|| ConfigError::UnknownPrimitive(name.clone()))
                    })
                    .collect()
            })
            .transpose()
    }

    #[must_use]
    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            keep_inference_input_mutations: self.keep_inference_input_mutations,
            overlap_enumeration_limit: self.overlap_enumeration_limit,
            tracked_views: Vec::new(),
        }
    }

    pub fn partition_options(&self) -> Result<PartitionOptions, ConfigError> {
        Ok(PartitionOptions {
            policy: self.partition_policy,
            recompute_allowlist: self.recompute_primitives()?,
        })
    }

    /// Canonical options that change what gets compiled, for cache keys.
    #[must_use]
    pub fn canonical_options(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(
            "partition_policy".to_owned(),
            self.partition_policy.as_str().to_owned(),
        );
        out.insert(
            "keep_inference_input_mutations".to_owned(),
            self.keep_inference_input_mutations.to_string(),
        );
        out.insert(
            "overlap_enumeration_limit".to_owned(),
            self.overlap_enumeration_limit.to_string(),
        );
        if let Some(allowlist) = &self.recompute_allowlist {
            let mut names = allowlist.clone();
            names.sort();
            names.dedup();
            out.insert("recompute_allowlist".to_owned(), names.join(","));
        }
        out
    }
}

fn parse_mode(value: &str) -> Result<CompatibilityMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "strict" => Ok(CompatibilityMode::Strict),
        "hardened" => Ok(CompatibilityMode::Hardened),
        _ => Err(ConfigError::InvalidValue {
            key: "mode".to_owned(),
            value: value.to_owned(),
            expected: "`strict` or `hardened`",
        }),
    }
}

fn parse_policy(value: &str) -> Result<PartitionPolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "default" => Ok(PartitionPolicy::Default),
        "min_cut" | "mincut" => Ok(PartitionPolicy::MinCut),
        _ => Err(ConfigError::InvalidValue {
            key: "partition_policy".to_owned(),
            value: value.to_owned(),
            expected: "`default` or `min_cut`",
        }),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
            expected: "a boolean",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn empty_options_give_defaults() {
        let config = PipelineConfig::from_options(&BTreeMap::new()).expect("config");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.mode, CompatibilityMode::Strict);
    }

    #[test]
    fn parses_every_known_key() {
        let config = PipelineConfig::from_options(&options(&[
            ("backend", "cpu"),
            ("partition_policy", "min_cut"),
            ("keep_inference_input_mutations", "true"),
            ("overlap_enumeration_limit", "128"),
            ("recompute_allowlist", "add, mul"),
        ]))
        .expect("config");
        assert_eq!(config.backend.as_deref(), Some("cpu"));
        assert_eq!(config.partition_policy, PartitionPolicy::MinCut);
        assert!(config.keep_inference_input_mutations);
        assert_eq!(config.overlap_enumeration_limit, 128);
        assert_eq!(
            config.partition_options().expect("partition").recompute_allowlist,
            Some(vec![Primitive::Add, Primitive::Mul])
        );
        assert_eq!(KNOWN_OPTION_KEYS.len(), 6);
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let err = PipelineConfig::from_options(&options(&[("fuse_everything", "yes")]))
            .expect_err("strict");
        assert_eq!(
            err,
            ConfigError::UnknownKey {
                key: "fuse_everything".to_owned()
            }
        );
    }

    #[test]
    fn hardened_mode_records_unknown_keys() {
        let config = PipelineConfig::from_options(&options(&[
            ("fuse_everything", "yes"),
            ("mode", "hardened"),
        ]))
        .expect("hardened");
        assert_eq!(config.ignored_options, vec!["fuse_everything".to_owned()]);
    }

    #[test]
    fn malformed_values_are_reported() {
        let err = PipelineConfig::from_options(&options(&[("partition_policy", "greedy")]))
            .expect_err("policy");
        assert!(err.to_string().contains("greedy"));
        let err = PipelineConfig::from_options(&options(&[("overlap_enumeration_limit", "-1")]))
            .expect_err("limit");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = PipelineConfig::from_options(&options(&[("recompute_allowlist", "matmul")]))
            .expect_err("allowlist");
        assert_eq!(err, ConfigError::UnknownPrimitive("matmul".to_owned()));
    }

    #[test]
    fn json_round_trip_preserves_settings() {
        let config = PipelineConfig {
            partition_policy: PartitionPolicy::MinCut,
            recompute_allowlist: Some(vec!["relu".to_owned()]),
            ..PipelineConfig::default()
        };
        let json = config.to_json().expect("json");
        assert!(json.contains("\"min_cut\""));
        assert_eq!(PipelineConfig::from_json(&json).expect("parse"), config);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = PipelineConfig::from_json(r#"{"mode":"hardened"}"#).expect("parse");
        assert_eq!(config.mode, CompatibilityMode::Hardened);
        assert_eq!(config.overlap_enumeration_limit, DEFAULT_OVERLAP_ENUMERATION_LIMIT);
        assert!(PipelineConfig::from_json("{").is_err());
    }

    #[test]
    fn canonical_options_ignore_allowlist_order() {
        let a = PipelineConfig {
            recompute_allowlist: Some(vec!["mul".to_owned(), "add".to_owned()]),
            ..PipelineConfig::default()
        };
        let b = PipelineConfig {
            recompute_allowlist: Some(vec!["add".to_owned(), "mul".to_owned()]),
            ..PipelineConfig::default()
        };
        assert_eq!(a.canonical_options(), b.canonical_options());
    }
}
