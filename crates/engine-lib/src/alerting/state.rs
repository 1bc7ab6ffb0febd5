//! Per (rule, node) alert lifecycle with hysteresis
//!
//! ```text
//!   Normal ──true──▶ Pending ──true x N──▶ Firing ──false──▶ Resolving
//!     ▲                 │                    ▲                   │
//!     └─────false───────┘                    └──────true─────────┤
//!     ▲                                                  false x N
//!     └──────────────── next false ◀──── Resolved ◀──────────────┘
//! ```
//!
//! Only the Firing and Resolved edges produce notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Normal,
    Pending,
    Firing,
    Resolving,
    Resolved,
}

impl AlertStatus {
    /// Firing, or firing but counting towards resolution
    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Firing | AlertStatus::Resolving)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertStatus::Normal => "normal",
            AlertStatus::Pending => "pending",
            AlertStatus::Firing => "firing",
            AlertStatus::Resolving => "resolving",
            AlertStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Edge that must be notified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Fired,
    Resolved,
}

/// Lifecycle of one rule on one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub rule: String,
    pub node: String,
    pub status: AlertStatus,
    pub consecutive_true: u32,
    pub consecutive_false: u32,
    /// Start of the current run of true evaluations
    pub first_true_at: Option<DateTime<Utc>>,
    /// When the current status was entered
    pub since: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
}

impl AlertState {
    pub fn new(rule: impl Into<String>, node: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            rule: rule.into(),
            node: node.into(),
            status: AlertStatus::Normal,
            consecutive_true: 0,
            consecutive_false: 0,
            first_true_at: None,
            since: now,
            last_evaluated_at: None,
            last_value: None,
        }
    }

    fn enter(&mut self, status: AlertStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.since = now;
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_true = 0;
        self.consecutive_false = 0;
        self.first_true_at = None;
    }

    /// Advance the state machine by one evaluation
    pub fn apply(
        &mut self,
        condition_true: bool,
        value: f64,
        required: u32,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let required = required.max(1);
        self.last_evaluated_at = Some(now);
        self.last_value = Some(value);

        if condition_true {
            self.consecutive_false = 0;
            if self.consecutive_true == 0 {
                self.first_true_at = Some(now);
            }
            self.consecutive_true = self.consecutive_true.saturating_add(1);

            match self.status {
                AlertStatus::Normal | AlertStatus::Pending | AlertStatus::Resolved => {
                    if self.consecutive_true >= required {
                        self.enter(AlertStatus::Firing, now);
                        return Some(Transition::Fired);
                    }
                    self.enter(AlertStatus::Pending, now);
                }
                AlertStatus::Resolving => self.enter(AlertStatus::Firing, now),
                AlertStatus::Firing => {}
            }
            return None;
        }

        self.consecutive_true = 0;
        self.first_true_at = None;

        match self.status {
            AlertStatus::Normal => {}
            AlertStatus::Pending | AlertStatus::Resolved => {
                self.reset_counters();
                self.enter(AlertStatus::Normal, now);
            }
            AlertStatus::Firing | AlertStatus::Resolving => {
                self.consecutive_false = self.consecutive_false.saturating_add(1);
                if self.consecutive_false >= required {
                    self.reset_counters();
                    self.enter(AlertStatus::Resolved, now);
                    return Some(Transition::Resolved);
                }
                self.enter(AlertStatus::Resolving, now);
            }
        }
        None
    }
}
