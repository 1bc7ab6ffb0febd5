//! Threshold alerting
//!
//! Rules compare the latest value of a metric on every node against a
//! threshold. Each (rule, node) pair moves through a hysteresis state
//! machine so a single noisy evaluation neither fires nor resolves an alert.

mod engine;
mod rules;
mod state;
mod watcher;


pub use engine::{
    ActiveAlert, AlertRuleEngine, AlertStateView, MaintenanceReport, RuleEngineConfig,
};
pub use rules::{
    read_rule_file, AlertRule, Condition, RuleDefinition, RuleFile, RuleSet, RuleSetError,
    RuleValidationError, ValidationErrorKind, DEFAULT_MESSAGE_TEMPLATE,
};
pub use state::{AlertState, AlertStatus, Transition};
pub use watcher::{RuleFileWatcher, WatcherHandle};
