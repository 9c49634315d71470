//! Raw play-transform configuration shapes
//!
//! The config file accepts several convenience spellings (a lone hook or an
//! array of hooks, a bare string rule or a full search/replace object, a
//! boolean or `"all"` for logging). These types capture the accepted JSON
//! exactly; [`super::PlayTransform::compile`] normalizes them into the rule
//! tree the workers run against, so none of this flexibility is interpreted
//! on the hot path.

use serde::{Deserialize, Serialize};

/// One value or an array of values, accepted interchangeably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(t) => vec![t],
            OneOrMany::Many(v) => v,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(t) => std::slice::from_ref(t),
            OneOrMany::Many(v) => v,
        }
    }
}

/// `playTransform` as written in a source or client config entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayTransformConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_compare: Option<OneOrMany<HookConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare: Option<CompareHooksConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_compare: Option<OneOrMany<HookConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// Hooks that only the comparator sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareHooksConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<OneOrMany<HookConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<OneOrMany<HookConfig>>,
}

/// One hook: optional `when` guards plus per-field rule lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<Vec<WhenClauseConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Vec<RuleConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artists: Option<Vec<RuleConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<Vec<RuleConfig>>,
}

/// A rule: a bare string means match-and-remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Remove(String),
    Replace {
        search: String,
        replace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Vec<WhenClauseConfig>>,
    },
}

/// All present fields must match (AND); the clause array is OR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhenClauseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// `log: false | true | "all"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogConfig {
    Flag(bool),
    Mode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_stage_accepts_scalar_or_array() {
        let scalar: PlayTransformConfig = serde_json::from_str(
            r#"{"preCompare": {"title": ["(Album Version)"]}}"#,
        )
        .unwrap();
        assert_eq!(scalar.pre_compare.as_ref().unwrap().as_slice().len(), 1);

        let array: PlayTransformConfig = serde_json::from_str(
            r#"{"preCompare": [{"title": ["a"]}, {"title": ["b"]}]}"#,
        )
        .unwrap();
        assert_eq!(array.pre_compare.as_ref().unwrap().as_slice().len(), 2);
    }

    #[test]
    fn rule_accepts_string_or_object() {
        let rules: Vec<RuleConfig> = serde_json::from_str(
            r#"["noise", {"search": "a", "replace": "b"}]"#,
        )
        .unwrap();

        assert_eq!(rules[0], RuleConfig::Remove("noise".to_string()));
        assert_eq!(
            rules[1],
            RuleConfig::Replace {
                search: "a".to_string(),
                replace: "b".to_string(),
                when: None,
            }
        );
    }

    #[test]
    fn log_accepts_bool_or_all() {
        let cfg: PlayTransformConfig = serde_json::from_str(r#"{"log": true}"#).unwrap();
        assert_eq!(cfg.log, Some(LogConfig::Flag(true)));

        let cfg: PlayTransformConfig = serde_json::from_str(r#"{"log": "all"}"#).unwrap();
        assert_eq!(cfg.log, Some(LogConfig::Mode("all".to_string())));
    }

    #[test]
    fn compare_hooks_parse() {
        let cfg: PlayTransformConfig = serde_json::from_str(
            r#"{"compare": {"candidate": {"title": ["x"]}, "existing": {"album": ["y"]}}}"#,
        )
        .unwrap();
        let compare = cfg.compare.unwrap();
        assert!(compare.candidate.is_some());
        assert!(compare.existing.is_some());
    }
}
