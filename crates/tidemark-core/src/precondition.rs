//! Precondition evaluation.
//!
//! Static conditions (`dbms`, `changeSetExecuted` and boolean combinations
//! of them) are decided by the planner from history alone. Everything else
//! needs the live schema and is evaluated by the executor right before the
//! change set runs, inside its transaction.

use std::collections::HashSet;

use serde::Serialize;

use crate::changelog::{ChangeSetId, FailAction, Precondition, Preconditions};
use crate::connection::Connection;

/// What a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    /// Target database product name.
    pub dbms: &'a str,
    /// Change sets that count as executed.
    pub executed: &'a HashSet<ChangeSetId>,
    /// Changelog file of the change set owning the conditions.
    pub changelog_path: &'a str,
}

/// Result of checking a change set's preconditions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PreconditionOutcome {
    /// Every condition holds.
    Passed,
    /// A condition is false.
    Failed {
        /// Configured `onFail` action.
        action: FailAction,
        /// Explanation.
        message: String,
    },
    /// A condition could not be evaluated.
    Errored {
        /// Configured `onError` action.
        action: FailAction,
        /// Explanation.
        message: String,
    },
}

impl PreconditionOutcome {
    /// The action to take, `None` when the conditions passed.
    pub fn action(&self) -> Option<FailAction> {
        match self {
            PreconditionOutcome::Passed => None,
            PreconditionOutcome::Failed { action, .. } | PreconditionOutcome::Errored { action, .. } => {
                Some(*action)
            }
        }
    }

    /// Explanation, empty when the conditions passed.
    pub fn message(&self) -> &str {
        match self {
            PreconditionOutcome::Passed => "",
            PreconditionOutcome::Failed { message, .. } | PreconditionOutcome::Errored { message, .. } => {
                message
            }
        }
    }
}

/// Check the static conditions of a set.
pub fn check_static(preconditions: &Preconditions, ctx: &ConditionContext<'_>) -> PreconditionOutcome {
    check(preconditions, preconditions.static_conditions(), ctx, None)
}

/// Check the conditions that need the database.
pub fn check_dynamic(
    preconditions: &Preconditions,
    ctx: &ConditionContext<'_>,
    conn: &mut dyn Connection,
) -> PreconditionOutcome {
    check(preconditions, preconditions.dynamic_conditions(), ctx, Some(conn))
}

fn check<'p>(
    preconditions: &Preconditions,
    conditions: impl Iterator<Item = &'p Precondition>,
    ctx: &ConditionContext<'_>,
    mut conn: Option<&mut dyn Connection>,
) -> PreconditionOutcome {
    for condition in conditions {
        match evaluate(condition, ctx, &mut conn) {
            Ok(true) => {}
            Ok(false) => {
                let message = match &preconditions.on_fail_message {
                    Some(message) => message.clone(),
                    None => format!("precondition failed: {}", condition.describe()),
                };
                return PreconditionOutcome::Failed {
                    action: preconditions.on_fail,
                    message,
                };
            }
            Err(message) => {
                return PreconditionOutcome::Errored {
                    action: preconditions.on_error,
                    message: format!("precondition {} errored: {}", condition.describe(), message),
                }
            }
        }
    }
    PreconditionOutcome::Passed
}

/// Evaluate one condition. Dynamic conditions need a connection.
pub fn evaluate(
    condition: &Precondition,
    ctx: &ConditionContext<'_>,
    conn: &mut Option<&mut dyn Connection>,
) -> Result<bool, String> {
    match condition {
        Precondition::Dbms { dbms_type } => Ok(dbms_matches(dbms_type, ctx.dbms)),
        Precondition::ChangeSetExecuted {
            id,
            author,
            changelog_file,
        } => {
            let path = changelog_file.as_deref().unwrap_or(ctx.changelog_path);
            Ok(ctx.executed.contains(&ChangeSetId::new(
                id.as_str(),
                author.as_str(),
                crate::changelog::paths::normalize(path),
            )))
        }
        Precondition::Not(inner) => {
            for c in inner {
                if evaluate(c, ctx, conn)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Precondition::And(inner) => {
            for c in inner {
                if !evaluate(c, ctx, conn)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Precondition::Or(inner) => {
            for c in inner {
                if evaluate(c, ctx, conn)? {
                    return Ok(true);
                }
            }
            Ok(inner.is_empty())
        }
        dynamic => match conn.as_deref_mut() {
            Some(conn) => evaluate_dynamic(dynamic, conn).map_err(|e| e.to_string()),
            None => Err("needs a database connection".to_string()),
        },
    }
}

fn evaluate_dynamic(
    condition: &Precondition,
    conn: &mut dyn Connection,
) -> Result<bool, crate::connection::DbError> {
    match condition {
        Precondition::TableExists { table_name } => conn.table_exists(table_name),
        Precondition::ColumnExists {
            table_name,
            column_name,
        } => conn.column_exists(table_name, column_name),
        Precondition::IndexExists { index_name } => conn.index_exists(index_name),
        Precondition::ViewExists { view_name } => conn.view_exists(view_name),
        Precondition::SqlCheck {
            expected_result,
            sql,
        } => {
            let rows = conn.query(sql, &[])?;
            let actual = rows
                .first()
                .and_then(|row| row.get(0))
                .map(|value| value.to_display_string());
            match actual {
                Some(actual) => Ok(actual.trim() == expected_result.to_plain_string().trim()),
                None => Err(crate::connection::DbError::new(
                    crate::connection::DbErrorKind::Other,
                    "sqlCheck query returned no rows",
                )),
            }
        }
        _ => Ok(true),
    }
}

/// Match a `dbms` list such as `sqlite, postgresql` or `!mysql`.
fn dbms_matches(list: &str, dbms: &str) -> bool {
    let dbms = dbms.to_ascii_lowercase();
    let mut has_positive = false;
    let mut matched = false;
    for entry in list.split(',').map(|e| e.trim().to_ascii_lowercase()) {
        if entry.is_empty() {
            continue;
        }
        if let Some(excluded) = entry.strip_prefix('!') {
            if excluded.trim() == dbms {
                return false;
            }
        } else {
            has_positive = true;
            if entry == dbms || entry == "all" {
                matched = true;
            }
        }
    }
    !has_positive || matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::Literal;

    fn ctx<'a>(executed: &'a HashSet<ChangeSetId>) -> ConditionContext<'a> {
        ConditionContext {
            dbms: "sqlite",
            executed,
            changelog_path: "db/main.json",
        }
    }

    #[test]
    fn test_dbms_matching() {
        assert!(dbms_matches("sqlite", "sqlite"));
        assert!(dbms_matches("postgresql, SQLite", "sqlite"));
        assert!(!dbms_matches("postgresql", "sqlite"));
        assert!(!dbms_matches("!sqlite", "sqlite"));
        assert!(dbms_matches("!mysql", "sqlite"));
        assert!(dbms_matches("all", "sqlite"));
    }

    #[test]
    fn test_change_set_executed_defaults_to_own_file() {
        let mut executed = HashSet::new();
        executed.insert(ChangeSetId::new("1", "alice", "db/main.json"));
        let ctx = ctx(&executed);

        let own_file = Precondition::ChangeSetExecuted {
            id: "1".into(),
            author: "alice".into(),
            changelog_file: None,
        };
        let other_file = Precondition::ChangeSetExecuted {
            id: "1".into(),
            author: "alice".into(),
            changelog_file: Some("db/other.json".into()),
        };
        assert_eq!(evaluate(&own_file, &ctx, &mut None), Ok(true));
        assert_eq!(evaluate(&other_file, &ctx, &mut None), Ok(false));
        assert_eq!(evaluate(&Precondition::Not(vec![other_file]), &ctx, &mut None), Ok(true));
    }

    #[test]
    fn test_static_outcome_uses_on_fail() {
        let executed = HashSet::new();
        let pre = Preconditions::new(FailAction::MarkRan)
            .with_condition(Precondition::Dbms {
                dbms_type: "postgresql".into(),
            })
            .with_condition(Precondition::TableExists {
                table_name: "ignored_here".into(),
            });
        let outcome = check_static(&pre, &ctx(&executed));
        assert_eq!(outcome.action(), Some(FailAction::MarkRan));
        assert!(outcome.message().contains("dbms(postgresql)"));
    }

    #[test]
    fn test_dynamic_without_connection_errors() {
        let executed = HashSet::new();
        let table = Precondition::TableExists {
            table_name: "t".into(),
        };
        assert!(evaluate(&table, &ctx(&executed), &mut None).is_err());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_dynamic_conditions() {
        use crate::connection::SqliteConnection;

        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE person (id INTEGER, name TEXT)", &[])
            .unwrap();
        let executed = HashSet::new();
        let ctx = ctx(&executed);

        let pre = Preconditions::new(FailAction::Halt)
            .with_condition(Precondition::TableExists {
                table_name: "person".into(),
            })
            .with_condition(Precondition::ColumnExists {
                table_name: "person".into(),
                column_name: "name".into(),
            })
            .with_condition(Precondition::SqlCheck {
                expected_result: Literal::Integer(0),
                sql: "SELECT COUNT(*) FROM person".into(),
            });
        assert_eq!(check_dynamic(&pre, &ctx, &mut conn), PreconditionOutcome::Passed);

        let mut failing = Preconditions::new(FailAction::Continue).with_condition(
            Precondition::ViewExists {
                view_name: "v_person".into(),
            },
        );
        failing.on_fail_message = Some("view missing".into());
        assert_eq!(
            check_dynamic(&failing, &ctx, &mut conn),
            PreconditionOutcome::Failed {
                action: FailAction::Continue,
                message: "view missing".into()
            }
        );

        let mut broken = Preconditions::new(FailAction::Halt).with_condition(Precondition::SqlCheck {
            expected_result: Literal::Integer(0),
            sql: "SELECT COUNT(*) FROM nowhere".into(),
        });
        broken.on_error = FailAction::Warn;
        assert_eq!(check_dynamic(&broken, &ctx, &mut conn).action(), Some(FailAction::Warn));
    }
}
