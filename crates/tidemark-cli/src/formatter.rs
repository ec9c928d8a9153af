//! Output formatters for operation reports.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use serde::Serialize;
use tidemark_core::{
    ClearChecksumsReport, ExecutionRecord, ExecutionReport, LockReport, MigrationError,
    ReleaseReport, SqlScript, StatusReport, TagOutcome, ValidationReport,
};

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format pending work.
    fn format_status(&self, report: &StatusReport) -> String;

    /// Format validation problems.
    fn format_validation(&self, report: &ValidationReport) -> String;

    /// Format what a run did.
    fn format_execution(&self, report: &ExecutionReport) -> String;

    /// Format a preview script.
    fn format_script(&self, script: &SqlScript) -> String;

    /// Format recorded history.
    fn format_history(&self, records: &[ExecutionRecord]) -> String;

    /// Format held locks.
    fn format_locks(&self, locks: &[LockReport]) -> String;

    /// Format a tag result.
    fn format_tag(&self, outcome: &TagOutcome) -> String;

    /// Format a checksum clearing result.
    fn format_cleared(&self, report: &ClearChecksumsReport) -> String;

    /// Format a lock release result.
    fn format_released(&self, report: &ReleaseReport) -> String;

    /// Format an error.
    fn format_error(&self, error: &MigrationError) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_status(&self, report: &StatusReport) -> String {
        let mut output = if report.is_up_to_date() {
            format!("{} is up to date ({} applied)", report.changelog, report.applied_count)
        } else {
            let mut table = Table::new();
            table.set_header(vec!["Pending change set"]);
            for id in &report.pending {
                table.add_row(vec![id.to_string()]);
            }
            format!("{}\n{} change set(s) pending", table, report.pending_count)
        };

        if !report.filtered.is_empty() {
            output.push_str(&format!(
                "\n{} change set(s) excluded by contexts or labels",
                report.filtered.len()
            ));
        }
        for id in &report.unknown_records {
            output.push_str(&format!("\nrecorded but not in the changelog: {}", id));
        }
        output
    }

    fn format_validation(&self, report: &ValidationReport) -> String {
        if report.is_valid() {
            return format!("No problems found in {} change set(s)", report.change_sets);
        }

        let mut table = Table::new();
        table.set_header(vec!["Problem", "Change set", "Message"]);
        for problem in &report.problems {
            table.add_row(vec![
                Cell::new(label(&problem.kind)),
                Cell::new(
                    problem
                        .change_set
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                ),
                Cell::new(&problem.message),
            ]);
        }
        format!("{}\n{} problem(s)", table, report.problems.len())
    }

    fn format_execution(&self, report: &ExecutionReport) -> String {
        let mut output = String::new();
        if !report.entries.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Change set", "Status", "Statements", "ms", "Message"]);
            for entry in &report.entries {
                table.add_row(vec![
                    Cell::new(entry.id.to_string()),
                    Cell::new(label(&entry.status)),
                    Cell::new(entry.statements),
                    Cell::new(entry.duration_ms),
                    Cell::new(entry.message.as_deref().unwrap_or("")),
                ]);
            }
            output.push_str(&format!("{}\n", table));
        }
        for warning in &report.warnings {
            output.push_str(&format!("warning: {}\n", warning));
        }
        output.push_str(&format!(
            "{} {}: {} change set(s), deployment {}",
            report.operation,
            label(&report.outcome),
            report.completed(),
            report.deployment_id
        ));
        output
    }

    fn format_script(&self, script: &SqlScript) -> String {
        script.to_string()
    }

    fn format_history(&self, records: &[ExecutionRecord]) -> String {
        if records.is_empty() {
            return "No change sets recorded".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["#", "Change set", "Type", "Executed", "Tag", "Deployment"]);
        for record in records {
            table.add_row(vec![
                Cell::new(record.order_executed),
                Cell::new(record.id.to_string()),
                Cell::new(record.exec_type),
                Cell::new(record.date_executed.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(record.tag.as_deref().unwrap_or("")),
                Cell::new(record.deployment_id.as_deref().unwrap_or("")),
            ]);
        }
        format!("{}\n{} record(s)", table, records.len())
    }

    fn format_locks(&self, locks: &[LockReport]) -> String {
        if locks.is_empty() {
            return "No lock held".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Holder", "Granted", "Held (s)", "Stale"]);
        for lock in locks {
            table.add_row(vec![
                Cell::new(&lock.holder),
                Cell::new(lock.granted_at.to_rfc3339()),
                Cell::new(lock.held_for_secs),
                Cell::new(if lock.stale { "yes" } else { "no" }),
            ]);
        }
        table.to_string()
    }

    fn format_tag(&self, outcome: &TagOutcome) -> String {
        if outcome.marker_inserted {
            format!("Tagged database as '{}' with a marker record", outcome.tag)
        } else {
            format!("Tagged {} as '{}'", outcome.record, outcome.tag)
        }
    }

    fn format_cleared(&self, report: &ClearChecksumsReport) -> String {
        format!("Cleared {} checksum(s)", report.cleared)
    }

    fn format_released(&self, report: &ReleaseReport) -> String {
        match &report.previous {
            Some(previous) if report.released => format!("Released lock held by {}", previous.holder),
            _ => "No lock held".to_string(),
        }
    }

    fn format_error(&self, error: &MigrationError) -> String {
        let mut output = format!("Error: {}", error);
        if let Some(partial) = error.partial_report() {
            output.push_str("\nBefore the failure:\n");
            output.push_str(&self.format_execution(partial));
        }
        output
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_status(&self, report: &StatusReport) -> String {
        to_json(report)
    }

    fn format_validation(&self, report: &ValidationReport) -> String {
        to_json(report)
    }

    fn format_execution(&self, report: &ExecutionReport) -> String {
        to_json(report)
    }

    fn format_script(&self, script: &SqlScript) -> String {
        serde_json::json!({
            "sql": script.as_str(),
            "statements": script.statement_count()
        })
        .to_string()
    }

    fn format_history(&self, records: &[ExecutionRecord]) -> String {
        to_json(records)
    }

    fn format_locks(&self, locks: &[LockReport]) -> String {
        to_json(locks)
    }

    fn format_tag(&self, outcome: &TagOutcome) -> String {
        to_json(outcome)
    }

    fn format_cleared(&self, report: &ClearChecksumsReport) -> String {
        to_json(report)
    }

    fn format_released(&self, report: &ReleaseReport) -> String {
        to_json(report)
    }

    fn format_error(&self, error: &MigrationError) -> String {
        serde_json::json!({
            "error": error.to_string(),
            "problems": error.problems(),
            "partial": error.partial_report()
        })
        .to_string()
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        serde_json::json!({
            "error": e.to_string()
        })
        .to_string()
    })
}

/// Serialized name of a unit enum value, e.g. `checksum_mismatch`.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}
