//! Typed views over the workflow `settings` map and the enforcement policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Global enforcement posture for the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Deny everything outside the declared contract.
    #[default]
    Strict,
    /// Log violations but allow them through.
    Permissive,
    /// Observe only.
    Advisory,
}

impl std::fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnforcementMode::Strict => write!(f, "strict"),
            EnforcementMode::Permissive => write!(f, "permissive"),
            EnforcementMode::Advisory => write!(f, "advisory"),
        }
    }
}

/// Policy controlling manual-gate behavior.
///
/// | Mode        | Manual gate behavior                          |
/// |-------------|-----------------------------------------------|
/// | `Supervised`| Block until a human approves                  |
/// | `ZeroHuman` | Auto-skip with a logged warning               |
/// | `Hybrid`    | Reserved; blocks like supervised for now      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionMode {
    #[default]
    Supervised,
    ZeroHuman,
    Hybrid,
}

impl std::str::FromStr for SupervisionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supervised" => Ok(SupervisionMode::Supervised),
            "zero_human" => Ok(SupervisionMode::ZeroHuman),
            "hybrid" => Ok(SupervisionMode::Hybrid),
            _ => anyhow::bail!(
                "Invalid supervision mode '{}'. Valid values: supervised, zero_human, hybrid",
                s
            ),
        }
    }
}

/// Advisory review settings consumed by the external review collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_reviews")]
    pub minimum_required: u32,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_insufficient_reviews: Option<String>,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_required: default_min_reviews(),
            fallbacks: Vec::new(),
            on_insufficient_reviews: None,
        }
    }
}

/// Recognized settings extracted from the free-form map. Unrecognized keys
/// stay available for template substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub supervision_mode: SupervisionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke_test_command: Option<String>,
    /// External critique collaborator toggle, on by default.
    #[serde(default = "default_true")]
    pub phase_critique: bool,
    #[serde(default)]
    pub review: ReviewSettings,
}

impl WorkflowSettings {
    /// Build typed settings from the raw map, ignoring keys we don't know.
    pub fn from_map(map: &BTreeMap<String, serde_yaml::Value>) -> Self {
        let value = serde_yaml::to_value(map).unwrap_or(serde_yaml::Value::Null);
        serde_yaml::from_value(value).unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_min_reviews() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_from_yaml(yaml: &str) -> BTreeMap<String, serde_yaml::Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_are_supervised_with_critique_on() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.supervision_mode, SupervisionMode::Supervised);
        assert!(settings.phase_critique);
        assert!(settings.review.enabled);
    }

    #[test]
    fn from_map_reads_recognized_keys() {
        let map = map_from_yaml(
            r#"
supervision_mode: zero_human
test_command: cargo test
phase_critique: false
review:
  enabled: true
  minimum_required: 2
"#,
        );
        let settings = WorkflowSettings::from_map(&map);
        assert_eq!(settings.supervision_mode, SupervisionMode::ZeroHuman);
        assert_eq!(settings.test_command.as_deref(), Some("cargo test"));
        assert!(!settings.phase_critique);
        assert_eq!(settings.review.minimum_required, 2);
    }

    #[test]
    fn from_map_ignores_unknown_keys() {
        let map = map_from_yaml("custom_key: custom_value\ntest_command: make test\n");
        let settings = WorkflowSettings::from_map(&map);
        assert_eq!(settings.test_command.as_deref(), Some("make test"));
    }

    #[test]
    fn supervision_mode_parses_from_str() {
        assert_eq!(
            "zero_human".parse::<SupervisionMode>().unwrap(),
            SupervisionMode::ZeroHuman
        );
        assert!("full_auto".parse::<SupervisionMode>().is_err());
    }
}
