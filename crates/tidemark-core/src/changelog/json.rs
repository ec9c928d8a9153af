//! JSON changelog documents.
//!
//! ```json
//! {"databaseChangeLog": [
//!   {"changeSet": {"id": "001", "author": "alice", "changes": [...], "rollback": "DROP TABLE t"}},
//!   {"include": {"file": "v2/changes.json", "relativeToChangelogFile": true}},
//!   {"includeAll": {"path": "patches"}}
//! ]}
//! ```

use serde::Deserialize;
use serde_json::Value;

use super::error::ParseError;
use super::parser::Entry;
use super::{Change, ChangeSet, ContextExpr, Preconditions};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRollback {
    Sql(String),
    Changes(Vec<Change>),
    Change(Change),
}

impl RawRollback {
    fn into_changes(self) -> Vec<Change> {
        match self {
            RawRollback::Sql(sql) if sql.trim().is_empty() => Vec::new(),
            RawRollback::Sql(sql) => vec![Change::sql(sql)],
            RawRollback::Changes(changes) => changes,
            RawRollback::Change(change) => vec![change],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawChangeSet {
    id: String,
    author: String,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default)]
    run_always: bool,
    #[serde(default = "default_true")]
    fail_on_error: bool,
    #[serde(default = "default_true")]
    run_in_transaction: bool,
    #[serde(default, alias = "contexts")]
    context: Option<String>,
    #[serde(default)]
    labels: Option<OneOrMany>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default, rename = "validCheckSum")]
    valid_checksum: Option<OneOrMany>,
    #[serde(default, rename = "preConditions")]
    preconditions: Option<Preconditions>,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    rollback: Option<RawRollback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInclude {
    file: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncludeAll {
    path: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum RawEntry {
    ChangeSet(RawChangeSet),
    Include(RawInclude),
    IncludeAll(RawIncludeAll),
}

/// Parse one JSON document. Problems are appended to `problems`; entries
/// that could be read are returned even when others could not.
pub(crate) fn parse_document(path: &str, text: &str, problems: &mut Vec<ParseError>) -> Vec<Entry> {
    let root: Value = match serde_json::from_str(text) {
        Ok(root) => root,
        Err(e) => {
            problems.push(ParseError::syntax(path, Some(e.line()), e.to_string()));
            return Vec::new();
        }
    };

    let items = match root.get("databaseChangeLog") {
        Some(Value::Array(items)) => items,
        Some(_) => {
            problems.push(ParseError::syntax(path, None, "databaseChangeLog must be an array"));
            return Vec::new();
        }
        None => {
            problems.push(ParseError::syntax(path, None, "missing databaseChangeLog"));
            return Vec::new();
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let raw = match RawEntry::deserialize(item) {
            Ok(raw) => raw,
            Err(e) => {
                problems.push(ParseError::syntax(
                    path,
                    None,
                    format!("entry {}: {}", index + 1, e),
                ));
                continue;
            }
        };

        match raw {
            RawEntry::ChangeSet(raw) => match convert_change_set(path, raw) {
                Ok(change_set) => entries.push(Entry::ChangeSet(change_set)),
                Err(message) => problems.push(ParseError::syntax(
                    path,
                    None,
                    format!("entry {}: {}", index + 1, message),
                )),
            },
            RawEntry::Include(include) => entries.push(Entry::Include {
                file: include.file,
                relative_to_changelog_file: include.relative_to_changelog_file,
            }),
            RawEntry::IncludeAll(include) => entries.push(Entry::IncludeAll {
                path: include.path,
                relative_to_changelog_file: include.relative_to_changelog_file,
            }),
        }
    }
    entries
}

fn convert_change_set(path: &str, raw: RawChangeSet) -> Result<ChangeSet, String> {
    if raw.id.trim().is_empty() || raw.author.trim().is_empty() {
        return Err("change set id and author must not be empty".to_string());
    }

    let contexts = match raw.context.as_deref() {
        Some(expr) => ContextExpr::parse(expr)?,
        None => ContextExpr::empty(),
    };

    let mut change_set = ChangeSet::new(raw.id, raw.author, path)
        .with_contexts(contexts)
        .with_labels(raw.labels.map(OneOrMany::into_vec).unwrap_or_default())
        .run_on_change(raw.run_on_change)
        .run_always(raw.run_always)
        .fail_on_error(raw.fail_on_error)
        .run_in_transaction(raw.run_in_transaction);
    change_set.changes = raw.changes;
    change_set.rollback = raw.rollback.map(RawRollback::into_changes);
    change_set.preconditions = raw.preconditions;
    change_set.comment = raw.comment;
    change_set.valid_checksums = raw
        .valid_checksum
        .map(OneOrMany::into_vec)
        .unwrap_or_default();
    Ok(change_set)
}
