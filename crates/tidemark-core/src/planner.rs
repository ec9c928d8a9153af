//! Migration planning.
//!
//! The planner compares the flattened changelog with recorded history and
//! decides what a run will do. It never touches the database: everything it
//! needs arrives as arguments, so plans are reproducible and testable.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::changelog::{Change, ChangeSet, ChangeSetId, Changelog, ContextFilter, FailAction};
use crate::checksum::Checksum;
use crate::precondition::{self, ConditionContext};
use crate::tracking::{ExecType, ExecutionRecord};

/// How far a run goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Apply everything pending.
    All,
    /// Apply up to and including the change set declaring this tag.
    UpToTag(String),
    /// Apply the next `n` pending change sets.
    Count(usize),
    /// Roll back everything recorded after the record carrying this tag.
    DownToTag(String),
    /// Roll back everything executed after this instant.
    UpToDate(DateTime<Utc>),
    /// Roll back the last `n` change sets.
    RollbackCount(usize),
}

impl Target {
    /// Whether this target drives a rollback.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            Target::DownToTag(_) | Target::UpToDate(_) | Target::RollbackCount(_)
        )
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::All => write!(f, "all"),
            Target::UpToTag(tag) => write!(f, "up to tag {}", tag),
            Target::Count(n) => write!(f, "next {}", n),
            Target::DownToTag(tag) => write!(f, "down to tag {}", tag),
            Target::UpToDate(date) => write!(f, "back to {}", date.to_rfc3339()),
            Target::RollbackCount(n) => write!(f, "last {}", n),
        }
    }
}

/// Planning errors. None of them leaves a trace in the database.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// No change set or record carries the tag.
    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    /// A change set to roll back has no rollback.
    #[error("no rollback defined for {0}")]
    NoRollbackDefined(ChangeSetId),

    /// A record to roll back has no change set in the changelog.
    #[error("change set {0} is recorded but missing from the changelog")]
    UnknownChangeSet(ChangeSetId),

    /// A static precondition failed with `onFail: HALT`.
    #[error("precondition halted {id}: {message}")]
    PreconditionHalt {
        /// Change set.
        id: ChangeSetId,
        /// Explanation.
        message: String,
    },

    /// The target does not fit the operation.
    #[error("target '{0}' is not valid here")]
    InvalidTarget(String),
}

/// What a plan step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// First execution.
    Execute,
    /// Re-execution of an applied change set.
    Rerun,
    /// Record without executing.
    MarkRan,
}

impl StepAction {
    /// The record outcome this action produces.
    pub fn exec_type(&self) -> ExecType {
        match self {
            StepAction::Execute => ExecType::Executed,
            StepAction::Rerun => ExecType::Reran,
            StepAction::MarkRan => ExecType::MarkRan,
        }
    }
}

/// One change set a run will handle.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// The change set.
    pub change_set: ChangeSet,
    /// What to do with it.
    pub action: StepAction,
    /// Checksum to record.
    pub checksum: Checksum,
    /// Warnings from `WARN` preconditions.
    pub warnings: Vec<String>,
    /// Tag of the existing record and where it sits in history.
    pub existing_tag: Option<TagPosition>,
}

/// A tag and the sequence number it was attached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPosition {
    /// Tag name.
    pub tag: String,
    /// Sequence number of the tagged record.
    pub order_executed: i64,
}

/// Why a change set that would otherwise run was left out.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Excluded by contexts or labels.
    Filtered,
    /// A precondition failed with `onFail: CONTINUE`.
    Precondition(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Filtered => write!(f, "filtered by context or label"),
            SkipReason::Precondition(message) => write!(f, "precondition: {}", message),
        }
    }
}

/// A change set left pending.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChangeSet {
    /// Identity.
    pub id: ChangeSetId,
    /// Why.
    pub reason: SkipReason,
}

/// Forward plan.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
    /// Pending change sets left out of this run.
    pub skipped: Vec<SkippedChangeSet>,
}

impl Plan {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check for an empty plan.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Identities in execution order.
    pub fn ids(&self) -> Vec<ChangeSetId> {
        self.steps.iter().map(|s| s.change_set.id.clone()).collect()
    }
}

/// What a rollback step does.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackAction {
    /// Run the inverse changes and remove the record.
    Undo(Vec<Change>),
    /// Remove the record only.
    Forget,
}

/// One record a rollback will undo.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackStep {
    /// Record being undone.
    pub record: ExecutionRecord,
    /// What to do.
    pub action: RollbackAction,
    /// Whether the undo runs inside a transaction.
    pub run_in_transaction: bool,
}

/// Rollback plan, newest record first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollbackPlan {
    /// Steps in execution order.
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check for an empty plan.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Identities in execution order.
    pub fn ids(&self) -> Vec<ChangeSetId> {
        self.steps.iter().map(|s| s.record.id.clone()).collect()
    }
}

/// Computes plans.
#[derive(Debug, Clone)]
pub struct Planner<'a> {
    filter: &'a ContextFilter,
    dbms: &'a str,
    preconditions: bool,
}

impl<'a> Planner<'a> {
    /// Create a planner for a database product and a context filter.
    pub fn new(filter: &'a ContextFilter, dbms: &'a str) -> Self {
        Self {
            filter,
            dbms,
            preconditions: true,
        }
    }

    /// Skip static precondition evaluation.
    pub fn without_preconditions(mut self) -> Self {
        self.preconditions = false;
        self
    }

    /// Plan a forward run.
    pub fn plan(
        &self,
        changelog: &Changelog,
        history: &[ExecutionRecord],
        target: &Target,
    ) -> Result<Plan, PlanError> {
        let (limit, max_steps) = match target {
            Target::All => (changelog.len(), None),
            Target::Count(n) => (changelog.len(), Some(*n)),
            Target::UpToTag(tag) => {
                let position = changelog
                    .iter()
                    .position(|cs| cs.declared_tags().any(|t| t == tag))
                    .ok_or_else(|| PlanError::UnknownTag(tag.clone()))?;
                (position + 1, None)
            }
            other => return Err(PlanError::InvalidTarget(other.to_string())),
        };

        let recorded: HashMap<&ChangeSetId, &ExecutionRecord> =
            history.iter().map(|r| (&r.id, r)).collect();
        let mut executed: HashSet<ChangeSetId> = history
            .iter()
            .filter(|r| r.is_applied())
            .map(|r| r.id.clone())
            .collect();

        let mut plan = Plan::default();
        for change_set in changelog.iter().take(limit) {
            if max_steps.is_some_and(|max| plan.steps.len() >= max) {
                break;
            }

            let checksum = Checksum::of(change_set);
            let record = recorded.get(&change_set.id).copied();
            let Some(action) = decide(change_set, record, &checksum) else {
                continue;
            };

            if !self.filter.accepts(change_set) {
                plan.skipped.push(SkippedChangeSet {
                    id: change_set.id.clone(),
                    reason: SkipReason::Filtered,
                });
                continue;
            }

            let mut step = PlanStep {
                change_set: change_set.clone(),
                action,
                checksum,
                warnings: Vec::new(),
                existing_tag: record.and_then(|r| {
                    r.tag.clone().map(|tag| TagPosition {
                        tag,
                        order_executed: r.order_executed,
                    })
                }),
            };

            if self.preconditions {
                if let Some(preconditions) = &change_set.preconditions {
                    let ctx = ConditionContext {
                        dbms: self.dbms,
                        executed: &executed,
                        changelog_path: &change_set.id.path,
                    };
                    let outcome = precondition::check_static(preconditions, &ctx);
                    match outcome.action() {
                        None => {}
                        Some(FailAction::Halt) => {
                            return Err(PlanError::PreconditionHalt {
                                id: change_set.id.clone(),
                                message: outcome.message().to_string(),
                            })
                        }
                        Some(FailAction::Continue) => {
                            tracing::info!(
                                change_set = %change_set.id,
                                reason = %outcome.message(),
                                "skipping change set"
                            );
                            plan.skipped.push(SkippedChangeSet {
                                id: change_set.id.clone(),
                                reason: SkipReason::Precondition(outcome.message().to_string()),
                            });
                            continue;
                        }
                        Some(FailAction::MarkRan) => step.action = StepAction::MarkRan,
                        Some(FailAction::Warn) => step.warnings.push(outcome.message().to_string()),
                    }
                }
            }

            executed.insert(change_set.id.clone());
            plan.steps.push(step);
        }

        tracing::debug!(
            target = %target,
            steps = plan.steps.len(),
            skipped = plan.skipped.len(),
            "planned update"
        );
        Ok(plan)
    }

    /// Plan a rollback. Every step is resolved before anything runs, so a
    /// missing rollback fails the whole plan.
    pub fn plan_rollback(
        &self,
        changelog: &Changelog,
        history: &[ExecutionRecord],
        target: &Target,
    ) -> Result<RollbackPlan, PlanError> {
        let candidates: Vec<&ExecutionRecord> = match target {
            Target::DownToTag(tag) => {
                let boundary = history
                    .iter()
                    .rposition(|r| r.tag.as_deref() == Some(tag.as_str()))
                    .ok_or_else(|| PlanError::UnknownTag(tag.clone()))?;
                history[boundary + 1..].iter().rev().collect()
            }
            Target::UpToDate(instant) => history
                .iter()
                .rev()
                .filter(|r| r.date_executed > *instant)
                .collect(),
            Target::RollbackCount(n) => {
                let mut taken = Vec::new();
                let mut counted = 0;
                for record in history.iter().rev() {
                    if counted == *n {
                        break;
                    }
                    if !record.is_internal() {
                        counted += 1;
                    }
                    taken.push(record);
                }
                taken
            }
            other => return Err(PlanError::InvalidTarget(other.to_string())),
        };

        let mut plan = RollbackPlan::default();
        for record in candidates {
            let mut run_in_transaction = true;
            let action = if record.is_internal()
                || matches!(record.exec_type, ExecType::MarkRan | ExecType::Failed)
            {
                RollbackAction::Forget
            } else {
                let change_set = changelog
                    .find(&record.id)
                    .ok_or_else(|| PlanError::UnknownChangeSet(record.id.clone()))?;
                let changes = change_set
                    .rollback_changes()
                    .ok_or_else(|| PlanError::NoRollbackDefined(record.id.clone()))?;
                run_in_transaction = change_set.run_in_transaction;
                RollbackAction::Undo(changes)
            };
            plan.steps.push(RollbackStep {
                record: record.clone(),
                action,
                run_in_transaction,
            });
        }

        tracing::debug!(target = %target, steps = plan.steps.len(), "planned rollback");
        Ok(plan)
    }
}

fn decide(change_set: &ChangeSet, record: Option<&ExecutionRecord>, checksum: &Checksum) -> Option<StepAction> {
    let record = match record {
        Some(record) if record.is_applied() => record,
        _ => return Some(StepAction::Execute),
    };
    if change_set.run_always {
        return Some(StepAction::Rerun);
    }
    let stored = record.checksum.as_deref()?;
    if checksum.accepts(change_set, stored) {
        return None;
    }
    // Drift on anything else is rejected by validation before planning.
    change_set.run_on_change.then_some(StepAction::Rerun)
}
