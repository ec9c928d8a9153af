//! Formatted SQL changelogs.
//!
//! ```sql
//! -- tidemark formatted sql
//!
//! --changeset alice:001 context:dev labels:v1
//! --comment: people table
//! --preconditions onFail:MARK_RAN
//! --precondition-sql-check expectedResult:0 SELECT COUNT(*) FROM sqlite_master WHERE name = 'person'
//! CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);
//! --rollback DROP TABLE person;
//!
//! --include file:v2/changes.sql
//! ```
//!
//! Everything between two directives that is not itself a directive belongs
//! to the SQL body of the current change set. Includes are always resolved
//! relative to the including file.

use super::change::Literal;
use super::error::ParseError;
use super::parser::Entry;
use super::{Change, ChangeSet, ContextExpr, FailAction, Precondition, Preconditions};

const HEADER: &str = "tidemark formatted sql";

struct Draft {
    line: usize,
    change_set: ChangeSet,
    split_statements: bool,
    end_delimiter: Option<String>,
    strip_comments: bool,
    body: Vec<String>,
    rollback: Option<Vec<String>>,
    tags: Vec<String>,
}

impl Draft {
    fn sql(&self, text: String) -> Change {
        Change::Sql {
            sql: text,
            split_statements: self.split_statements,
            end_delimiter: self.end_delimiter.clone(),
            strip_comments: self.strip_comments,
        }
    }

    fn finish(self, path: &str) -> Result<ChangeSet, ParseError> {
        let body = self.body.join("\n").trim().to_string();
        let mut changes = Vec::new();
        if !body.is_empty() {
            changes.push(self.sql(body));
        }
        for tag in &self.tags {
            changes.push(Change::TagDatabase { tag: tag.clone() });
        }
        if changes.is_empty() {
            return Err(ParseError::syntax(
                path,
                Some(self.line),
                format!("change set {} has no SQL", self.change_set.id.id),
            ));
        }

        let rollback = self.rollback.as_ref().map(|lines| {
            let text = lines.join("\n").trim().to_string();
            if text.is_empty()
                || text.eq_ignore_ascii_case("not required")
                || text.eq_ignore_ascii_case("empty")
            {
                Vec::new()
            } else {
                vec![self.sql(text)]
            }
        });

        let mut change_set = self.change_set;
        change_set.changes = changes;
        change_set.rollback = rollback;
        Ok(change_set)
    }
}

/// Parse one formatted SQL document. Problems are appended to `problems`.
pub(crate) fn parse_document(path: &str, text: &str, problems: &mut Vec<ParseError>) -> Vec<Entry> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    match lines.by_ref().find(|(_, l)| !l.trim().is_empty()) {
        Some((_, first)) if is_header(first) => {}
        Some((number, _)) => {
            problems.push(ParseError::syntax(
                path,
                Some(number),
                format!("expected header '-- {}'", HEADER),
            ));
            return Vec::new();
        }
        None => return Vec::new(),
    }

    let mut entries = Vec::new();
    let mut draft: Option<Draft> = None;

    for (number, line) in lines {
        let parsed = match directive(line) {
            Some(parsed) => parsed,
            None => {
                match draft.as_mut() {
                    Some(d) => d.body.push(line.to_string()),
                    None if line.trim().is_empty() || line.trim_start().starts_with("--") => {}
                    None => problems.push(ParseError::syntax(
                        path,
                        Some(number),
                        "statement outside of a change set",
                    )),
                }
                continue;
            }
        };

        let (keyword, rest) = parsed;
        let result = match keyword.as_str() {
            "changeset" => {
                flush(path, &mut draft, &mut entries, problems);
                start_change_set(path, number, rest).map(|d| draft = Some(d))
            }
            "include" => {
                flush(path, &mut draft, &mut entries, problems);
                single_attribute(rest, "file").map(|file| {
                    entries.push(Entry::Include {
                        file,
                        relative_to_changelog_file: true,
                    })
                })
            }
            "includeall" => {
                flush(path, &mut draft, &mut entries, problems);
                single_attribute(rest, "path").map(|dir| {
                    entries.push(Entry::IncludeAll {
                        path: dir,
                        relative_to_changelog_file: true,
                    })
                })
            }
            other => match draft.as_mut() {
                Some(d) => apply_to_draft(d, other, rest),
                None => Err(format!("--{} outside of a change set", other)),
            },
        };

        if let Err(message) = result {
            problems.push(ParseError::syntax(path, Some(number), message));
        }
    }

    flush(path, &mut draft, &mut entries, problems);
    entries
}

fn flush(path: &str, draft: &mut Option<Draft>, entries: &mut Vec<Entry>, problems: &mut Vec<ParseError>) {
    if let Some(d) = draft.take() {
        match d.finish(path) {
            Ok(change_set) => entries.push(Entry::ChangeSet(change_set)),
            Err(e) => problems.push(e),
        }
    }
}

fn is_header(line: &str) -> bool {
    let Some(rest) = line.trim().strip_prefix("--") else {
        return false;
    };
    rest.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .eq_ignore_ascii_case(HEADER)
}

/// Split a directive line into its lowercase keyword and the rest.
///
/// `--comment`, `--include` and `--includeAll` only count as directives in
/// their attribute form so that ordinary SQL comments are left alone.
fn directive(line: &str) -> Option<(String, &str)> {
    let body = line.trim().strip_prefix("--")?.trim_start();
    let end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(body.len());
    let keyword = body[..end].to_ascii_lowercase();
    let after = &body[end..];
    let (has_colon, rest) = match after.strip_prefix(':') {
        Some(rest) => (true, rest.trim()),
        None => (false, after.trim()),
    };

    let known = match keyword.as_str() {
        "changeset" | "rollback" | "preconditions" | "validchecksum" | "tagdatabase" => true,
        "comment" => has_colon,
        "include" => rest.starts_with("file:"),
        "includeall" => rest.starts_with("path:"),
        k => k.starts_with("precondition-"),
    };
    if !known || (!after.is_empty() && !has_colon && !after.starts_with(char::is_whitespace)) {
        return None;
    }
    Some((keyword, rest))
}

fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn attributes(input: &str) -> Result<Vec<(String, String)>, String> {
    split_words(input)?
        .into_iter()
        .map(|word| match word.split_once(':') {
            Some((key, value)) => Ok((key.to_string(), value.to_string())),
            None => Err(format!("expected key:value, found '{}'", word)),
        })
        .collect()
}

fn single_attribute(input: &str, key: &str) -> Result<String, String> {
    let attrs = attributes(input)?;
    match attrs.as_slice() {
        [(k, v)] if k == key && !v.is_empty() => Ok(v.clone()),
        _ => Err(format!("expected {}:<value>", key)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{} must be true or false, found '{}'", key, value)),
    }
}

fn start_change_set(path: &str, line: usize, rest: &str) -> Result<Draft, String> {
    let (identity, attrs) = match rest.split_once(char::is_whitespace) {
        Some((identity, attrs)) => (identity, attrs),
        None => (rest, ""),
    };
    let (author, id) = identity
        .split_once(':')
        .filter(|(a, i)| !a.is_empty() && !i.is_empty())
        .ok_or_else(|| format!("expected --changeset author:id, found '{}'", identity))?;

    let mut draft = Draft {
        line,
        change_set: ChangeSet::new(id, author, path),
        split_statements: true,
        end_delimiter: None,
        strip_comments: false,
        body: Vec::new(),
        rollback: None,
        tags: Vec::new(),
    };

    for (key, value) in attributes(attrs)? {
        let cs = &mut draft.change_set;
        match key.as_str() {
            "runOnChange" => cs.run_on_change = parse_bool(&key, &value)?,
            "runAlways" => cs.run_always = parse_bool(&key, &value)?,
            "failOnError" => cs.fail_on_error = parse_bool(&key, &value)?,
            "runInTransaction" => cs.run_in_transaction = parse_bool(&key, &value)?,
            "splitStatements" => draft.split_statements = parse_bool(&key, &value)?,
            "stripComments" => draft.strip_comments = parse_bool(&key, &value)?,
            "endDelimiter" => draft.end_delimiter = Some(value),
            "context" | "contexts" => cs.contexts = ContextExpr::parse(&value)?,
            "labels" => {
                cs.labels = value
                    .split(',')
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect()
            }
            other => return Err(format!("unknown change set attribute '{}'", other)),
        }
    }
    Ok(draft)
}

fn apply_to_draft(draft: &mut Draft, keyword: &str, rest: &str) -> Result<(), String> {
    match keyword {
        "rollback" => {
            draft
                .rollback
                .get_or_insert_with(Vec::new)
                .push(rest.to_string());
        }
        "comment" => draft.change_set.comment = Some(rest.to_string()),
        "validchecksum" => draft.change_set.valid_checksums.push(rest.to_string()),
        "tagdatabase" => {
            let tag = match rest.strip_prefix("tag:") {
                Some(tag) => tag.trim(),
                None => rest,
            };
            if tag.is_empty() {
                return Err("--tagDatabase needs a tag".to_string());
            }
            draft.tags.push(tag.to_string());
        }
        "preconditions" => {
            let pre = draft
                .change_set
                .preconditions
                .get_or_insert_with(Preconditions::default);
            for (key, value) in attributes(rest)? {
                let action = FailAction::parse(&value)
                    .ok_or_else(|| format!("unknown precondition action '{}'", value))?;
                match key.as_str() {
                    "onFail" => pre.on_fail = action,
                    "onError" => pre.on_error = action,
                    other => return Err(format!("unknown preconditions attribute '{}'", other)),
                }
            }
        }
        other => {
            let kind = other
                .strip_prefix("precondition-")
                .ok_or_else(|| format!("unknown directive --{}", other))?;
            let condition = precondition(kind, rest)?;
            draft
                .change_set
                .preconditions
                .get_or_insert_with(Preconditions::default)
                .conditions
                .push(condition);
        }
    }
    Ok(())
}

fn precondition(kind: &str, rest: &str) -> Result<Precondition, String> {
    if let Some(inner) = kind.strip_prefix("not-") {
        return Ok(Precondition::Not(vec![precondition(inner, rest)?]));
    }

    if kind == "sql-check" {
        let (first, sql) = rest
            .split_once(char::is_whitespace)
            .ok_or("expected --precondition-sql-check expectedResult:<value> <sql>")?;
        let expected = first
            .strip_prefix("expectedResult:")
            .ok_or("expected expectedResult:<value>")?;
        let expected_result = match expected.parse::<i64>() {
            Ok(i) => Literal::Integer(i),
            Err(_) => Literal::Text(expected.to_string()),
        };
        return Ok(Precondition::SqlCheck {
            expected_result,
            sql: sql.trim().to_string(),
        });
    }

    let attrs = attributes(rest)?;
    let get = |key: &str| -> Result<String, String> {
        attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("precondition-{} needs {}:", kind, key))
    };

    match kind {
        "table-exists" => Ok(Precondition::TableExists {
            table_name: get("table")?,
        }),
        "column-exists" => Ok(Precondition::ColumnExists {
            table_name: get("table")?,
            column_name: get("column")?,
        }),
        "index-exists" => Ok(Precondition::IndexExists {
            index_name: get("index")?,
        }),
        "view-exists" => Ok(Precondition::ViewExists {
            view_name: get("view")?,
        }),
        "dbms" => Ok(Precondition::Dbms {
            dbms_type: get("type")?,
        }),
        "changeset-executed" => Ok(Precondition::ChangeSetExecuted {
            id: get("id")?,
            author: get("author")?,
            changelog_file: get("changelogFile").ok(),
        }),
        other => Err(format!("unknown precondition '{}'", other)),
    }
}
