//! Change set checksums.
//!
//! Each change is rendered to a canonical text: its kind followed by its
//! fields in declaration order. Every field value has its whitespace runs
//! collapsed to a single space and is trimmed, so reformatting a statement
//! does not change the digest while editing it does. The texts are hashed in
//! order with BLAKE3.
//!
//! Only the changes take part. Rollback, contexts, labels, comments and
//! preconditions can be edited without invalidating history.

use serde::{Deserialize, Serialize};

use crate::changelog::{Change, ChangeSet, ColumnDef, Literal};

/// Version prefix of the current algorithm.
pub const CHECKSUM_VERSION: u32 = 1;

/// Accepted in `validCheckSum` to accept any stored checksum.
pub const ANY_CHECKSUM: &str = "ANY";

/// A change set digest, rendered as `<version>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Compute the checksum of a change set.
    pub fn of(change_set: &ChangeSet) -> Self {
        let mut hasher = blake3::Hasher::new();
        for change in &change_set.changes {
            hasher.update(canonical(change).as_bytes());
            hasher.update(&[0]);
        }
        Checksum(format!(
            "{}:{}",
            CHECKSUM_VERSION,
            hex::encode(hasher.finalize().as_bytes())
        ))
    }

    /// Wrap a stored checksum.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Checksum(value.into())
    }

    /// Textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check a stored checksum against a change set.
    ///
    /// The stored value is accepted if it equals the current checksum or is
    /// listed in the change set's `validCheckSum` entries.
    pub fn accepts(&self, change_set: &ChangeSet, stored: &str) -> bool {
        if stored == self.0 {
            return true;
        }
        change_set
            .valid_checksums
            .iter()
            .any(|valid| valid.eq_ignore_ascii_case(ANY_CHECKSUM) || valid.trim() == stored)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse whitespace runs to one space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct Canonical {
    text: String,
}

impl Canonical {
    fn new(kind: &str) -> Self {
        Self {
            text: kind.to_string(),
        }
    }

    fn field(mut self, name: &str, value: impl AsRef<str>) -> Self {
        self.text.push('|');
        self.text.push_str(name);
        self.text.push('=');
        self.text.push_str(&normalize_whitespace(value.as_ref()));
        self
    }

    fn flag(self, name: &str, value: bool) -> Self {
        self.field(name, if value { "true" } else { "false" })
    }
}

fn literal(value: &Option<Literal>) -> String {
    value.as_ref().map(Literal::to_sql).unwrap_or_default()
}

fn columns(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| {
            format!(
                "{} {} nullable={} pk={} unique={} default={}",
                c.name,
                c.column_type,
                c.nullable,
                c.primary_key,
                c.unique,
                literal(&c.default_value)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn canonical(change: &Change) -> String {
    let c = Canonical::new(change.kind());
    let c = match change {
        Change::Sql {
            sql,
            split_statements,
            end_delimiter,
            strip_comments,
        } => c
            .field("sql", sql)
            .flag("splitStatements", *split_statements)
            .field("endDelimiter", end_delimiter.as_deref().unwrap_or(""))
            .flag("stripComments", *strip_comments),
        Change::SqlFile {
            split_statements,
            end_delimiter,
            strip_comments,
            content,
            ..
        } => c
            .field("sql", content.as_deref().unwrap_or(""))
            .flag("splitStatements", *split_statements)
            .field("endDelimiter", end_delimiter.as_deref().unwrap_or(""))
            .flag("stripComments", *strip_comments),
        Change::CreateTable {
            table_name,
            columns: cols,
        } => c.field("tableName", table_name).field("columns", columns(cols)),
        Change::DropTable { table_name } => c.field("tableName", table_name),
        Change::RenameTable {
            old_table_name,
            new_table_name,
        } => c
            .field("oldTableName", old_table_name)
            .field("newTableName", new_table_name),
        Change::AddColumn {
            table_name,
            columns: cols,
        } => c.field("tableName", table_name).field("columns", columns(cols)),
        Change::DropColumn {
            table_name,
            column_name,
        } => c.field("tableName", table_name).field("columnName", column_name),
        Change::RenameColumn {
            table_name,
            old_column_name,
            new_column_name,
        } => c
            .field("tableName", table_name)
            .field("oldColumnName", old_column_name)
            .field("newColumnName", new_column_name),
        Change::CreateIndex {
            index_name,
            table_name,
            columns: cols,
            unique,
        } => c
            .field("indexName", index_name)
            .field("tableName", table_name)
            .field("columns", cols.join(","))
            .flag("unique", *unique),
        Change::DropIndex {
            index_name,
            table_name,
        } => c
            .field("indexName", index_name)
            .field("tableName", table_name.as_deref().unwrap_or("")),
        Change::Insert {
            table_name,
            columns: values,
        } => c.field("tableName", table_name).field(
            "columns",
            values
                .iter()
                .map(|v| format!("{}={}", v.name, v.value.to_sql()))
                .collect::<Vec<_>>()
                .join(","),
        ),
        Change::Delete {
            table_name,
            where_clause,
        } => c
            .field("tableName", table_name)
            .field("where", where_clause.as_deref().unwrap_or("")),
        Change::TagDatabase { tag } => c.field("tag", tag),
    };
    c.text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ContextExpr, Preconditions};

    fn change_set(sql: &str) -> ChangeSet {
        ChangeSet::new("1", "alice", "db.json").with_change(Change::sql(sql))
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let a = Checksum::of(&change_set("CREATE TABLE t (id INTEGER)"));
        let b = Checksum::of(&change_set("  CREATE   TABLE t\n\t(id INTEGER)\n"));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("1:"));
        assert_eq!(a.as_str().len(), 2 + 64);
    }

    #[test]
    fn test_content_edit_changes_checksum() {
        let a = Checksum::of(&change_set("CREATE TABLE t (id INTEGER)"));
        let b = Checksum::of(&change_set("CREATE TABLE t (id BIGINT)"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_order_sensitive() {
        let one = ChangeSet::new("1", "a", "p")
            .with_change(Change::sql("SELECT 1"))
            .with_change(Change::sql("SELECT 2"));
        let two = ChangeSet::new("1", "a", "p")
            .with_change(Change::sql("SELECT 2"))
            .with_change(Change::sql("SELECT 1"));
        assert_ne!(Checksum::of(&one), Checksum::of(&two));
    }

    #[test]
    fn test_metadata_does_not_participate() {
        let base = change_set("SELECT 1");
        let decorated = change_set("SELECT 1")
            .with_rollback(vec![Change::sql("SELECT 0")])
            .with_contexts(ContextExpr::parse("dev").unwrap())
            .with_labels(["v1"])
            .with_preconditions(Preconditions::default());
        assert_eq!(Checksum::of(&base), Checksum::of(&decorated));
    }

    #[test]
    fn test_statement_boundaries_matter() {
        let joined = ChangeSet::new("1", "a", "p").with_change(Change::sql("SELECT 1; SELECT 2"));
        let split = ChangeSet::new("1", "a", "p")
            .with_change(Change::sql("SELECT 1;"))
            .with_change(Change::sql("SELECT 2"));
        assert_ne!(Checksum::of(&joined), Checksum::of(&split));
    }

    #[test]
    fn test_accepts_valid_checksums() {
        let mut cs = change_set("SELECT 1");
        let current = Checksum::of(&cs);
        assert!(current.accepts(&cs, current.as_str()));
        assert!(!current.accepts(&cs, "1:old"));

        cs.valid_checksums = vec!["1:old".into()];
        assert!(current.accepts(&cs, "1:old"));

        cs.valid_checksums = vec!["any".into()];
        assert!(current.accepts(&cs, "1:whatever"));
    }
}
