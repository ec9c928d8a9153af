//! Status and validation reports.
//!
//! Both are read-only views: they consult the changelog and the recorded
//! history and never touch the schema or the tracking table.

use std::collections::HashSet;

use serde::Serialize;

use crate::changelog::{paths, ChangeSetId, Changelog, ContextFilter, ParseError, Precondition};
use crate::checksum::Checksum;
use crate::planner::{Planner, Target};
use crate::tracking::ExecutionRecord;

/// Category of a validation problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// An applied change set was edited.
    ChecksumMismatch,
    /// Two change sets share an identity.
    DuplicateChangeSet,
    /// An include cannot be read.
    UnresolvedInclude,
    /// Includes form a cycle.
    CircularInclude,
    /// A document is malformed.
    Malformed,
    /// The root changelog cannot be read.
    Unreadable,
    /// A file has an unknown extension.
    UnsupportedFormat,
    /// A `changeSetExecuted` precondition names a change set that does not
    /// exist.
    UnknownPreconditionReference,
    /// A precondition with `onFail: HALT` failed during planning.
    PreconditionHalt,
}

/// One problem found by validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Problem {
    /// Category.
    pub kind: ProblemKind,
    /// Change set concerned, when there is one.
    pub change_set: Option<ChangeSetId>,
    /// Human readable explanation.
    pub message: String,
}

impl Problem {
    /// Create a problem.
    pub fn new(kind: ProblemKind, change_set: Option<ChangeSetId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            change_set,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.change_set {
            Some(id) => write!(f, "{}: {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<ParseError> for Problem {
    fn from(err: ParseError) -> Self {
        let message = err.to_string();
        match err {
            ParseError::Unreadable { .. } => Problem::new(ProblemKind::Unreadable, None, message),
            ParseError::UnresolvedInclude { .. } => {
                Problem::new(ProblemKind::UnresolvedInclude, None, message)
            }
            ParseError::CircularInclude { .. } => {
                Problem::new(ProblemKind::CircularInclude, None, message)
            }
            ParseError::DuplicateChangeSet { id } => {
                Problem::new(ProblemKind::DuplicateChangeSet, Some(id), message)
            }
            ParseError::Syntax { .. } => Problem::new(ProblemKind::Malformed, None, message),
            ParseError::UnsupportedFormat { .. } => {
                Problem::new(ProblemKind::UnsupportedFormat, None, message)
            }
        }
    }
}

/// Pending work and history drift.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Root changelog path.
    pub changelog: String,
    /// Change sets an update would run, in order.
    pub pending: Vec<ChangeSetId>,
    /// Number of pending change sets.
    pub pending_count: usize,
    /// Change sets excluded by the context and label filter.
    pub filtered: Vec<ChangeSetId>,
    /// Records counted as applied.
    pub applied_count: usize,
    /// History records with no change set in the changelog.
    pub unknown_records: Vec<ChangeSetId>,
}

impl StatusReport {
    /// Check whether the database is up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Change sets checked.
    pub change_sets: usize,
    /// Every problem found.
    pub problems: Vec<Problem>,
}

impl ValidationReport {
    /// Check whether no problem was found.
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }

    /// Problems of one kind.
    pub fn of_kind(&self, kind: ProblemKind) -> impl Iterator<Item = &Problem> {
        self.problems.iter().filter(move |p| p.kind == kind)
    }
}

/// Compute the status of a changelog against recorded history.
pub fn status(changelog: &Changelog, history: &[ExecutionRecord], filter: &ContextFilter) -> StatusReport {
    let plan = Planner::new(filter, "").without_preconditions().plan(changelog, history, &Target::All);
    // Without preconditions and with target All, planning cannot fail.
    let (pending, filtered) = match plan {
        Ok(plan) => (
            plan.steps.iter().map(|s| s.change_set.id.clone()).collect::<Vec<_>>(),
            plan.skipped.iter().map(|s| s.id.clone()).collect(),
        ),
        Err(_) => (Vec::new(), Vec::new()),
    };

    let known: HashSet<&ChangeSetId> = changelog.iter().map(|cs| &cs.id).collect();
    let unknown_records = history
        .iter()
        .filter(|r| !r.is_internal() && !known.contains(&r.id))
        .map(|r| r.id.clone())
        .collect();

    StatusReport {
        changelog: changelog.root.clone(),
        pending_count: pending.len(),
        pending,
        filtered,
        applied_count: history.iter().filter(|r| r.is_applied() && !r.is_internal()).count(),
        unknown_records,
    }
}

/// Validate a changelog against recorded history.
///
/// `parse_problems` are the problems collected while reading the changelog;
/// they are reported first, followed by checksum drift and dangling
/// precondition references.
pub fn validate(
    changelog: &Changelog,
    parse_problems: Vec<ParseError>,
    history: &[ExecutionRecord],
) -> ValidationReport {
    let mut problems: Vec<Problem> = parse_problems.into_iter().map(Problem::from).collect();
    problems.extend(checksum_problems(changelog, history));
    problems.extend(reference_problems(changelog, history));

    ValidationReport {
        change_sets: changelog.len(),
        problems,
    }
}

/// Applied change sets whose content no longer matches the stored checksum.
pub fn checksum_problems(changelog: &Changelog, history: &[ExecutionRecord]) -> Vec<Problem> {
    let mut problems = Vec::new();
    for record in history.iter().filter(|r| r.is_applied()) {
        let Some(stored) = record.checksum.as_deref() else {
            continue;
        };
        let Some(change_set) = changelog.find(&record.id) else {
            continue;
        };
        if change_set.run_on_change {
            continue;
        }
        let current = Checksum::of(change_set);
        if !current.accepts(change_set, stored) {
            problems.push(Problem::new(
                ProblemKind::ChecksumMismatch,
                Some(record.id.clone()),
                format!("checksum changed: stored {}, now {}", stored, current),
            ));
        }
    }
    problems
}

fn reference_problems(changelog: &Changelog, history: &[ExecutionRecord]) -> Vec<Problem> {
    let known: HashSet<&ChangeSetId> = changelog
        .iter()
        .map(|cs| &cs.id)
        .chain(history.iter().map(|r| &r.id))
        .collect();

    let mut problems = Vec::new();
    for change_set in changelog.iter() {
        let Some(preconditions) = &change_set.preconditions else {
            continue;
        };
        let mut references = Vec::new();
        collect_references(&preconditions.conditions, &change_set.id.path, &mut references);
        for reference in references {
            if !known.contains(&reference) {
                problems.push(Problem::new(
                    ProblemKind::UnknownPreconditionReference,
                    Some(change_set.id.clone()),
                    format!("changeSetExecuted refers to unknown change set {}", reference),
                ));
            }
        }
    }
    problems
}

fn collect_references(conditions: &[Precondition], own_path: &str, out: &mut Vec<ChangeSetId>) {
    for condition in conditions {
        match condition {
            Precondition::ChangeSetExecuted {
                id,
                author,
                changelog_file,
            } => {
                let path = changelog_file.as_deref().unwrap_or(own_path);
                out.push(ChangeSetId::new(id.as_str(), author.as_str(), paths::normalize(path)));
            }
            Precondition::Not(inner) | Precondition::And(inner) | Precondition::Or(inner) => {
                collect_references(inner, own_path, out)
            }
            _ => {}
        }
    }
}
