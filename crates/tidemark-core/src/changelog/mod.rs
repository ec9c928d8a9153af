//! Changelog model.
//!
//! A changelog is an ordered list of change sets, possibly spread over
//! several files through includes. [`ChangelogParser`] reads the root file
//! from a [`ChangelogSource`], follows includes depth-first and returns one
//! flattened [`Changelog`] whose order is execution order.
//!
//! Two document formats are understood, picked by file extension:
//!
//! | Extension | Format |
//! |-----------|--------|
//! | `.json` | `{"databaseChangeLog": [{"changeSet": {...}}, {"include": {...}}]}` |
//! | `.sql` | formatted SQL, starting with `-- tidemark formatted sql` |

pub mod change;
pub mod conditions;
pub mod context;
pub mod error;
pub mod formatted;
pub mod json;
pub mod parser;
pub mod paths;
pub mod source;

use serde::Serialize;

pub use change::{Change, ColumnDef, ColumnValue, Literal};
pub use conditions::{FailAction, Precondition, Preconditions};
pub use context::{ContextExpr, ContextFilter};
pub use error::ParseError;
pub use parser::{ChangelogParser, ParseOutcome};
pub use source::{ChangelogSource, FileSystemSource, MemorySource};

/// Identity of a change set: `(id, author, changelog path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChangeSetId {
    /// Id as written in the changelog.
    pub id: String,
    /// Author as written in the changelog.
    pub author: String,
    /// Logical path of the declaring changelog file.
    pub path: String,
}

impl ChangeSetId {
    /// Create an identity.
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// One uniquely identified unit of schema change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Identity.
    pub id: ChangeSetId,
    /// Operations in execution order.
    pub changes: Vec<Change>,
    /// Explicit rollback. `Some(vec![])` means "nothing to undo"; `None`
    /// falls back to the automatic inverse of `changes`.
    pub rollback: Option<Vec<Change>>,
    /// Preconditions.
    pub preconditions: Option<Preconditions>,
    /// Context expression.
    pub contexts: ContextExpr,
    /// Labels.
    pub labels: Vec<String>,
    /// Re-run whenever the checksum changes.
    pub run_on_change: bool,
    /// Run on every update.
    pub run_always: bool,
    /// Stop the run on failure. When false the failure is recorded and the
    /// run continues.
    pub fail_on_error: bool,
    /// Wrap the change set in a transaction.
    pub run_in_transaction: bool,
    /// Free-form comment.
    pub comment: Option<String>,
    /// Checksums accepted in addition to the current one (`ANY` accepts all).
    pub valid_checksums: Vec<String>,
}

impl ChangeSet {
    /// Create an empty change set with default attributes.
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: ChangeSetId::new(id, author, path),
            changes: Vec::new(),
            rollback: None,
            preconditions: None,
            contexts: ContextExpr::empty(),
            labels: Vec::new(),
            run_on_change: false,
            run_always: false,
            fail_on_error: true,
            run_in_transaction: true,
            comment: None,
            valid_checksums: Vec::new(),
        }
    }

    /// Append a change.
    pub fn with_change(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    /// Set the explicit rollback.
    pub fn with_rollback(mut self, rollback: Vec<Change>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Set the preconditions.
    pub fn with_preconditions(mut self, preconditions: Preconditions) -> Self {
        self.preconditions = Some(preconditions);
        self
    }

    /// Set the context expression.
    pub fn with_contexts(mut self, contexts: ContextExpr) -> Self {
        self.contexts = contexts;
        self
    }

    /// Set the labels.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Set `runOnChange`.
    pub fn run_on_change(mut self, value: bool) -> Self {
        self.run_on_change = value;
        self
    }

    /// Set `runAlways`.
    pub fn run_always(mut self, value: bool) -> Self {
        self.run_always = value;
        self
    }

    /// Set `failOnError`.
    pub fn fail_on_error(mut self, value: bool) -> Self {
        self.fail_on_error = value;
        self
    }

    /// Set `runInTransaction`.
    pub fn run_in_transaction(mut self, value: bool) -> Self {
        self.run_in_transaction = value;
        self
    }

    /// Description stored with execution records.
    pub fn description(&self) -> String {
        let parts: Vec<String> = self.changes.iter().map(Change::description).collect();
        if parts.is_empty() {
            "empty".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Tags declared by `tagDatabase` changes.
    pub fn declared_tags(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(Change::declared_tag)
    }

    /// Changes that undo this change set.
    ///
    /// Returns `None` when there is no explicit rollback and at least one
    /// change has no automatic inverse.
    pub fn rollback_changes(&self) -> Option<Vec<Change>> {
        if let Some(explicit) = &self.rollback {
            return Some(explicit.clone());
        }

        let mut inverse = Vec::new();
        for change in self.changes.iter().rev() {
            inverse.extend(change.inverse()?);
        }
        Some(inverse)
    }

    /// Labels joined for storage.
    pub fn labels_string(&self) -> String {
        self.labels.join(",")
    }
}

/// A flattened changelog.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Changelog {
    /// Logical path of the root file.
    pub root: String,
    /// Change sets in execution order.
    pub change_sets: Vec<ChangeSet>,
}

impl Changelog {
    /// Create an empty changelog.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            change_sets: Vec::new(),
        }
    }

    /// Append a change set.
    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.change_sets.push(change_set);
        self
    }

    /// Find a change set by identity.
    pub fn find(&self, id: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.iter().find(|cs| &cs.id == id)
    }

    /// Number of change sets.
    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    /// Check for an empty changelog.
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    /// Iterate change sets in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeSet> {
        self.change_sets.iter()
    }
}
