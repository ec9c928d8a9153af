//! Precondition declarations.
//!
//! Only the shape lives here; evaluation is in [`crate::precondition`].

use serde::{Deserialize, Serialize};

use super::change::Literal;

/// What to do when a precondition fails or cannot be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailAction {
    /// Stop the run.
    #[default]
    Halt,
    /// Skip the change set for this run; it stays pending.
    Continue,
    /// Record the change set as ran without executing it.
    MarkRan,
    /// Emit a warning and execute anyway.
    Warn,
}

impl FailAction {
    /// Parse the textual form used in changelog files.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HALT" => Some(FailAction::Halt),
            "CONTINUE" => Some(FailAction::Continue),
            "MARK_RAN" => Some(FailAction::MarkRan),
            "WARN" => Some(FailAction::Warn),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailAction::Halt => write!(f, "HALT"),
            FailAction::Continue => write!(f, "CONTINUE"),
            FailAction::MarkRan => write!(f, "MARK_RAN"),
            FailAction::Warn => write!(f, "WARN"),
        }
    }
}

/// A single assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    /// A table exists.
    #[serde(rename_all = "camelCase")]
    TableExists {
        /// Table name.
        table_name: String,
    },
    /// A column exists.
    #[serde(rename_all = "camelCase")]
    ColumnExists {
        /// Table name.
        table_name: String,
        /// Column name.
        column_name: String,
    },
    /// An index exists.
    #[serde(rename_all = "camelCase")]
    IndexExists {
        /// Index name.
        index_name: String,
    },
    /// A view exists.
    #[serde(rename_all = "camelCase")]
    ViewExists {
        /// View name.
        view_name: String,
    },
    /// A query's single result equals the expected value.
    #[serde(rename_all = "camelCase")]
    SqlCheck {
        /// Expected first column of the first row.
        expected_result: Literal,
        /// Query text.
        sql: String,
    },
    /// The target database product is one of a comma-separated list.
    Dbms {
        /// Product names, e.g. `sqlite, postgresql`.
        #[serde(rename = "type")]
        dbms_type: String,
    },
    /// Another change set has been executed.
    #[serde(rename_all = "camelCase")]
    ChangeSetExecuted {
        /// Change set id.
        id: String,
        /// Change set author.
        author: String,
        /// Changelog path; the declaring file when unset.
        #[serde(default)]
        changelog_file: Option<String>,
    },
    /// None of the nested conditions hold.
    Not(Vec<Precondition>),
    /// All nested conditions hold.
    And(Vec<Precondition>),
    /// At least one nested condition holds.
    Or(Vec<Precondition>),
}

impl Precondition {
    /// Whether this condition can be decided without looking at the schema.
    ///
    /// Static conditions are resolved by the planner; everything else waits
    /// until the change set is about to run.
    pub fn is_static(&self) -> bool {
        match self {
            Precondition::Dbms { .. } | Precondition::ChangeSetExecuted { .. } => true,
            Precondition::Not(inner) | Precondition::And(inner) | Precondition::Or(inner) => {
                inner.iter().all(Precondition::is_static)
            }
            _ => false,
        }
    }

    /// Short description for reports.
    pub fn describe(&self) -> String {
        match self {
            Precondition::TableExists { table_name } => format!("tableExists({})", table_name),
            Precondition::ColumnExists {
                table_name,
                column_name,
            } => format!("columnExists({}.{})", table_name, column_name),
            Precondition::IndexExists { index_name } => format!("indexExists({})", index_name),
            Precondition::ViewExists { view_name } => format!("viewExists({})", view_name),
            Precondition::SqlCheck { expected_result, .. } => {
                format!("sqlCheck(expected={})", expected_result.to_plain_string())
            }
            Precondition::Dbms { dbms_type } => format!("dbms({})", dbms_type),
            Precondition::ChangeSetExecuted { id, author, .. } => {
                format!("changeSetExecuted({}::{})", id, author)
            }
            Precondition::Not(inner) => format!("not({})", describe_all(inner)),
            Precondition::And(inner) => format!("and({})", describe_all(inner)),
            Precondition::Or(inner) => format!("or({})", describe_all(inner)),
        }
    }
}

fn describe_all(conditions: &[Precondition]) -> String {
    conditions
        .iter()
        .map(Precondition::describe)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Preconditions attached to a change set. The conditions are combined with
/// AND.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    /// Action when a condition is false.
    #[serde(default)]
    pub on_fail: FailAction,
    /// Action when evaluating a condition raises an error.
    #[serde(default)]
    pub on_error: FailAction,
    /// Message used in reports when the conditions fail.
    #[serde(default)]
    pub on_fail_message: Option<String>,
    /// Conditions.
    #[serde(default)]
    pub conditions: Vec<Precondition>,
}

impl Preconditions {
    /// Create a set with the given failure action.
    pub fn new(on_fail: FailAction) -> Self {
        Self {
            on_fail,
            ..Self::default()
        }
    }

    /// Add a condition.
    pub fn with_condition(mut self, condition: Precondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Conditions decidable at planning time.
    pub fn static_conditions(&self) -> impl Iterator<Item = &Precondition> {
        self.conditions.iter().filter(|c| c.is_static())
    }

    /// Conditions that must wait for execution.
    pub fn dynamic_conditions(&self) -> impl Iterator<Item = &Precondition> {
        self.conditions.iter().filter(|c| !c.is_static())
    }

    /// Check for an empty set.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
