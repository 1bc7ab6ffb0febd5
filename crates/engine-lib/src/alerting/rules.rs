//! Alert rule definitions, validation and loading
//!
//! Definitions arrive as loosely typed records (from a rule file or an API
//! call) and are validated into immutable [`AlertRule`]s grouped in a
//! [`RuleSet`]. A rule set is never mutated after construction; the engine
//! swaps whole sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Message used when a definition carries no template of its own
pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "[{{state}}] {{rule}} on {{node}}: {{metric}} = {{value}} ({{condition}} {{threshold}})";

/// Comparison applied between the current value and the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
    GreaterEqual,
    LessEqual,
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "greater_than" | "gt" | ">" => Ok(Self::GreaterThan),
            "less_than" | "lt" | "<" => Ok(Self::LessThan),
            "equals" | "eq" | "==" => Ok(Self::Equals),
            "greater_equal" | "gte" | ">=" => Ok(Self::GreaterEqual),
            "less_equal" | "lte" | "<=" => Ok(Self::LessEqual),
            other => Err(format!("unknown condition operator: {other}")),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GreaterThan => write!(f, "greater_than"),
            Self::LessThan => write!(f, "less_than"),
            Self::Equals => write!(f, "equals"),
            Self::GreaterEqual => write!(f, "greater_equal"),
            Self::LessEqual => write!(f, "less_equal"),
        }
    }
}

impl Condition {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::Equals => {
                let scale = value.abs().max(threshold.abs()).max(1.0);
                (value - threshold).abs() <= f64::EPSILON * scale
            }
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
        }
    }
}

fn default_interval_secs() -> i64 {
    60
}

fn default_consecutive_required() -> u32 {
    1
}

/// A rule as written by a human, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metric: String,
    pub threshold: f64,
    pub condition: String,
    #[serde(default = "default_interval_secs")]
    pub evaluation_interval_secs: i64,
    #[serde(default = "default_consecutive_required")]
    pub consecutive_required: u32,
    #[serde(default)]
    pub message: Option<String>,
}

/// Top-level layout of a rule file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Why a single definition was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationErrorKind {
    #[error("rule name is empty")]
    EmptyName,
    #[error("metric name is empty")]
    EmptyMetric,
    #[error("unknown condition operator '{0}'")]
    UnknownCondition(String),
    #[error("evaluation interval must be positive, got {0}s")]
    NonPositiveInterval(i64),
    #[error("consecutive_required must be at least 1")]
    ZeroConsecutiveRequired,
    #[error("threshold must be a finite number")]
    NonFiniteThreshold,
    #[error("duplicate rule name")]
    DuplicateName,
}

/// A rejected definition, identified by position and name
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("rule #{index} '{name}': {kind}")]
pub struct RuleValidationError {
    pub index: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_display")]
    pub kind: ValidationErrorKind,
}

fn serialize_display<S: serde::Serializer>(
    kind: &ValidationErrorKind,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(kind)
}

/// Failure to obtain a usable rule set
#[derive(Debug, thiserror::Error)]
pub enum RuleSetError {
    #[error("failed to load rules from {path}: {message}")]
    Source { path: String, message: String },

    #[error("rule set rejected: {} invalid rule(s)", .0.len())]
    Invalid(Vec<RuleValidationError>),
}

impl RuleSetError {
    /// Per-rule validation errors, if that is why the set was rejected
    pub fn validation_errors(&self) -> &[RuleValidationError] {
        match self {
            RuleSetError::Invalid(errors) => errors,
            RuleSetError::Source { .. } => &[],
        }
    }
}

/// A validated, immutable alert rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub condition: Condition,
    pub evaluation_interval: Duration,
    pub consecutive_required: u32,
    pub message_template: String,
}

impl AlertRule {
    /// Validate one definition
    pub fn from_definition(
        index: usize,
        def: &RuleDefinition,
    ) -> Result<Self, RuleValidationError> {
        let reject = |kind| RuleValidationError {
            index,
            name: def.name.clone(),
            kind,
        };

        if def.name.trim().is_empty() {
            return Err(reject(ValidationErrorKind::EmptyName));
        }
        if def.metric.trim().is_empty() {
            return Err(reject(ValidationErrorKind::EmptyMetric));
        }
        let condition = def
            .condition
            .parse::<Condition>()
            .map_err(|_| reject(ValidationErrorKind::UnknownCondition(def.condition.clone())))?;
        if def.evaluation_interval_secs <= 0 {
            return Err(reject(ValidationErrorKind::NonPositiveInterval(
                def.evaluation_interval_secs,
            )));
        }
        if def.consecutive_required == 0 {
            return Err(reject(ValidationErrorKind::ZeroConsecutiveRequired));
        }
        if !def.threshold.is_finite() {
            return Err(reject(ValidationErrorKind::NonFiniteThreshold));
        }

        Ok(Self {
            name: def.name.trim().to_string(),
            metric: def.metric.trim().to_string(),
            threshold: def.threshold,
            condition,
            evaluation_interval: Duration::from_secs(def.evaluation_interval_secs as u64),
            consecutive_required: def.consecutive_required,
            message_template: def
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string()),
        })
    }
}

/// Immutable snapshot of the active rules
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Arc<AlertRule>>,
    version: u64,
    loaded_at: DateTime<Utc>,
}

impl RuleSet {
    pub fn new(rules: Vec<AlertRule>, version: u64) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            version,
            loaded_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    /// Validate every definition, returning the valid rules and the errors
    /// for the rest. A repeated name rejects every occurrence after the first.
    pub fn validate(defs: &[RuleDefinition]) -> (Vec<AlertRule>, Vec<RuleValidationError>) {
        let mut rules = Vec::with_capacity(defs.len());
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (index, def) in defs.iter().enumerate() {
            match AlertRule::from_definition(index, def) {
                Ok(rule) if !seen.insert(rule.name.clone()) => {
                    errors.push(RuleValidationError {
                        index,
                        name: rule.name,
                        kind: ValidationErrorKind::DuplicateName,
                    });
                }
                Ok(rule) => rules.push(rule),
                Err(e) => errors.push(e),
            }
        }

        (rules, errors)
    }

    /// Build a set from the valid definitions only (startup semantics)
    pub fn load_partial(defs: &[RuleDefinition], version: u64) -> (Self, Vec<RuleValidationError>) {
        let (rules, errors) = Self::validate(defs);
        (Self::new(rules, version), errors)
    }

    /// Build a set only if every definition is valid (reload semantics)
    pub fn try_from_definitions(defs: &[RuleDefinition], version: u64) -> Result<Self, RuleSetError> {
        let (rules, errors) = Self::validate(defs);
        if !errors.is_empty() {
            return Err(RuleSetError::Invalid(errors));
        }
        Ok(Self::new(rules, version))
    }

    pub fn rules(&self) -> &[Arc<AlertRule>] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AlertRule>> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Read rule definitions from a TOML, YAML or JSON file (format inferred
/// from the extension)
pub fn read_rule_file(path: &Path) -> Result<Vec<RuleDefinition>, RuleSetError> {
    let source_error = |e: config::ConfigError| RuleSetError::Source {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    let file: RuleFile = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(source_error)?
        .try_deserialize()
        .map_err(source_error)?;

    Ok(file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn definition(name: &str, metric: &str, condition: &str) -> RuleDefinition {
        RuleDefinition {
            name: name.to_string(),
            metric: metric.to_string(),
            threshold: 100.0,
            condition: condition.to_string(),
            evaluation_interval_secs: 30,
            consecutive_required: 1,
            message: None,
        }
    }

    #[test]
    fn test_condition_parsing() {
        assert_eq!("greater_than".parse::<Condition>(), Ok(Condition::GreaterThan));
        assert_eq!("<".parse::<Condition>(), Ok(Condition::LessThan));
        assert_eq!("eq".parse::<Condition>(), Ok(Condition::Equals));
        assert!("between".parse::<Condition>().is_err());
    }

    #[test]
    fn test_condition_check() {
        assert!(Condition::GreaterThan.check(101.0, 100.0));
        assert!(!Condition::GreaterThan.check(100.0, 100.0));
        assert!(Condition::LessThan.check(99.0, 100.0));
        assert!(Condition::Equals.check(0.1 + 0.2, 0.3));
        assert!(!Condition::Equals.check(100.5, 100.0));
        assert!(Condition::GreaterEqual.check(100.0, 100.0));
        assert!(Condition::LessEqual.check(100.0, 100.0));
    }

    #[test]
    fn test_valid_definition() {
        let mut def = definition("rx-high", "network_receive_bytes", "gt");
        def.consecutive_required = 3;
        let rule = AlertRule::from_definition(0, &def).unwrap();

        assert_eq!(rule.condition, Condition::GreaterThan);
        assert_eq!(rule.evaluation_interval, Duration::from_secs(30));
        assert_eq!(rule.consecutive_required, 3);
        assert_eq!(rule.message_template, DEFAULT_MESSAGE_TEMPLATE);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (definition("", "rx", "gt"), ValidationErrorKind::EmptyName),
            (definition("r", " ", "gt"), ValidationErrorKind::EmptyMetric),
            (
                definition("r", "rx", "between"),
                ValidationErrorKind::UnknownCondition("between".to_string()),
            ),
            (
                RuleDefinition {
                    evaluation_interval_secs: 0,
                    ..definition("r", "rx", "gt")
                },
                ValidationErrorKind::NonPositiveInterval(0),
            ),
            (
                RuleDefinition {
                    consecutive_required: 0,
                    ..definition("r", "rx", "gt")
                },
                ValidationErrorKind::ZeroConsecutiveRequired,
            ),
            (
                RuleDefinition {
                    threshold: f64::NAN,
                    ..definition("r", "rx", "gt")
                },
                ValidationErrorKind::NonFiniteThreshold,
            ),
        ];

        for (def, expected) in cases {
            let err = AlertRule::from_definition(4, &def).unwrap_err();
            assert_eq!(err.kind, expected);
            assert_eq!(err.index, 4);
        }
    }

    #[test]
    fn test_partial_load_skips_invalid() {
        let defs = vec![
            definition("a", "rx", "gt"),
            definition("", "rx", "gt"),
            definition("b", "tx", "lt"),
            definition("a", "tx", "gt"),
        ];

        let (set, errors) = RuleSet::load_partial(&defs, 1);
        assert_eq!(set.len(), 2);
        assert!(set.contains("a"));
        assert!(set.contains("b"));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, ValidationErrorKind::EmptyName);
        assert_eq!(errors[1].kind, ValidationErrorKind::DuplicateName);
    }

    #[test]
    fn test_all_or_nothing_load() {
        let defs = vec![definition("a", "rx", "gt"), definition("", "rx", "gt")];
        let err = RuleSet::try_from_definitions(&defs, 2).unwrap_err();
        assert_eq!(err.validation_errors().len(), 1);

        let ok = RuleSet::try_from_definitions(&defs[..1], 2).unwrap();
        assert_eq!(ok.version(), 2);
    }

    #[test]
    fn test_read_toml_rule_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[rules]]
name = "rx-saturation"
metric = "network_receive_bytes"
threshold = 1.0e9
condition = "greater_than"
evaluation_interval_secs = 15
consecutive_required = 3
message = "{{{{node}}}} receive {{{{value}}}}"

[[rules]]
name = "drops"
metric = "network_receive_drops"
threshold = 0
condition = "gt"
"#
        )
        .unwrap();

        let defs = read_rule_file(file.path()).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "rx-saturation");
        assert_eq!(defs[0].consecutive_required, 3);
        assert_eq!(defs[0].message.as_deref(), Some("{{node}} receive {{value}}"));
        assert_eq!(defs[1].evaluation_interval_secs, 60);
        assert_eq!(defs[1].threshold, 0.0);
    }

    #[test]
    fn test_read_missing_rule_file() {
        let err = read_rule_file(Path::new("/nonexistent/rules.toml")).unwrap_err();
        assert!(matches!(err, RuleSetError::Source { .. }));
    }
}
