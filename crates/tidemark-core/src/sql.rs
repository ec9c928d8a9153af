//! SQL text for changes.
//!
//! Structured changes render to generic SQL understood by SQLite and most
//! other engines. Raw SQL is split into statements on a delimiter, skipping
//! delimiters inside quotes and comments.

use crate::changelog::{Change, ColumnDef};

/// Default statement delimiter.
pub const DEFAULT_DELIMITER: &str = ";";

/// Render a change to the statements that implement it.
pub fn render(change: &Change) -> Vec<String> {
    match change {
        Change::Sql {
            sql,
            split_statements,
            end_delimiter,
            strip_comments,
        } => prepare(sql, *split_statements, end_delimiter.as_deref(), *strip_comments),
        Change::SqlFile {
            content,
            split_statements,
            end_delimiter,
            strip_comments,
            ..
        } => prepare(
            content.as_deref().unwrap_or(""),
            *split_statements,
            end_delimiter.as_deref(),
            *strip_comments,
        ),
        Change::CreateTable {
            table_name,
            columns,
        } => vec![create_table(table_name, columns)],
        Change::DropTable { table_name } => vec![format!("DROP TABLE {}", table_name)],
        Change::RenameTable {
            old_table_name,
            new_table_name,
        } => vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            old_table_name, new_table_name
        )],
        // One statement per column; SQLite cannot add several at once.
        Change::AddColumn {
            table_name,
            columns,
        } => columns
            .iter()
            .map(|c| format!("ALTER TABLE {} ADD COLUMN {}", table_name, column_def(c, true)))
            .collect(),
        Change::DropColumn {
            table_name,
            column_name,
        } => vec![format!("ALTER TABLE {} DROP COLUMN {}", table_name, column_name)],
        Change::RenameColumn {
            table_name,
            old_column_name,
            new_column_name,
        } => vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            table_name, old_column_name, new_column_name
        )],
        Change::CreateIndex {
            index_name,
            table_name,
            columns,
            unique,
        } => vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            if *unique { "UNIQUE " } else { "" },
            index_name,
            table_name,
            columns.join(", ")
        )],
        Change::DropIndex { index_name, .. } => vec![format!("DROP INDEX {}", index_name)],
        Change::Insert {
            table_name,
            columns,
        } => {
            let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            let values: Vec<String> = columns.iter().map(|c| c.value.to_sql()).collect();
            vec![format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table_name,
                names.join(", "),
                values.join(", ")
            )]
        }
        Change::Delete {
            table_name,
            where_clause,
        } => vec![match where_clause {
            Some(clause) if !clause.trim().is_empty() => {
                format!("DELETE FROM {} WHERE {}", table_name, clause.trim())
            }
            _ => format!("DELETE FROM {}", table_name),
        }],
        Change::TagDatabase { .. } => Vec::new(),
    }
}

/// Render every change in order.
pub fn render_all<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Vec<String> {
    changes.into_iter().flat_map(render).collect()
}

fn create_table(table_name: &str, columns: &[ColumnDef]) -> String {
    let pk: Vec<&str> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    let inline_pk = pk.len() == 1;

    let mut parts: Vec<String> = columns.iter().map(|c| column_def(c, inline_pk)).collect();
    if pk.len() > 1 {
        parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    }
    format!("CREATE TABLE {} ({})", table_name, parts.join(", "))
}

fn column_def(column: &ColumnDef, inline_pk: bool) -> String {
    let mut def = format!("{} {}", column.name, column.column_type);
    if column.primary_key && inline_pk {
        def.push_str(" PRIMARY KEY");
    }
    if !column.nullable && !(column.primary_key && inline_pk) {
        def.push_str(" NOT NULL");
    }
    if column.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(default) = &column.default_value {
        def.push_str(" DEFAULT ");
        def.push_str(&default.to_sql());
    }
    def
}

/// Turn raw SQL text into executable statements.
pub fn prepare(sql: &str, split: bool, delimiter: Option<&str>, strip_comments: bool) -> Vec<String> {
    if split {
        return split_statements(sql, delimiter, strip_comments);
    }
    let mut scanner = Scanner::new(sql, None, strip_comments);
    scanner.run();
    // Without splitting the delimiter stays part of the text.
    let text = if strip_comments {
        scanner.statements.join(";")
    } else {
        sql.trim().to_string()
    };
    if scanner.any_code {
        vec![text.trim().to_string()]
    } else {
        Vec::new()
    }
}

/// Split SQL text into statements.
///
/// The delimiter defaults to `;`. A delimiter made of letters (such as `GO`)
/// only counts when it stands alone on its line. Statements that contain
/// nothing but whitespace and comments are dropped.
pub fn split_statements(sql: &str, delimiter: Option<&str>, strip_comments: bool) -> Vec<String> {
    let delimiter = delimiter
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DELIMITER);
    let mut scanner = Scanner::new(sql, Some(delimiter), strip_comments);
    scanner.run();
    scanner.statements
}

/// Remove `--` and `/* */` comments outside of quoted text.
pub fn strip_comments(sql: &str) -> String {
    let mut scanner = Scanner::new(sql, None, true);
    scanner.run();
    scanner.statements.join("").trim().to_string()
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    delimiter: Option<&'a str>,
    line_delimiter: bool,
    strip: bool,
    current: String,
    has_code: bool,
    any_code: bool,
    statements: Vec<String>,
}

impl<'a> Scanner<'a> {
    fn new(sql: &str, delimiter: Option<&'a str>, strip: bool) -> Self {
        Self {
            chars: sql.chars().collect(),
            pos: 0,
            delimiter,
            line_delimiter: delimiter
                .map(|d| d.chars().all(|c| c.is_alphabetic()))
                .unwrap_or(false),
            strip,
            current: String::new(),
            has_code: false,
            any_code: false,
            statements: Vec::new(),
        }
    }

    fn starts_with(&self, pattern: &str) -> bool {
        let mut i = self.pos;
        for p in pattern.chars() {
            match self.chars.get(i) {
                Some(c) if *c == p => i += 1,
                _ => return false,
            }
        }
        true
    }

    fn rest_of_line(&self) -> (String, usize) {
        let mut end = self.pos;
        while end < self.chars.len() && self.chars[end] != '\n' {
            end += 1;
        }
        (self.chars[self.pos..end].iter().collect(), end)
    }

    fn finish_statement(&mut self) {
        let text = std::mem::take(&mut self.current);
        if self.has_code {
            self.statements.push(text.trim().to_string());
        } else if self.delimiter.is_none() && !text.trim().is_empty() {
            self.statements.push(text);
        }
        self.has_code = false;
    }

    fn run(&mut self) {
        while self.pos < self.chars.len() {
            let at_line_start = self.pos == 0 || self.chars[self.pos - 1] == '\n';
            if self.line_delimiter && at_line_start {
                let (line, end) = self.rest_of_line();
                if let Some(delimiter) = self.delimiter {
                    if line.trim().eq_ignore_ascii_case(delimiter) {
                        self.finish_statement();
                        self.pos = end;
                        continue;
                    }
                }
            }

            if self.starts_with("--") {
                let (comment, end) = self.rest_of_line();
                if !self.strip {
                    self.current.push_str(&comment);
                }
                self.pos = end;
                continue;
            }

            if self.starts_with("/*") {
                let mut end = self.pos + 2;
                while end < self.chars.len() && !(self.chars[end] == '*' && self.chars.get(end + 1) == Some(&'/')) {
                    end += 1;
                }
                let end = (end + 2).min(self.chars.len());
                if !self.strip {
                    self.current.extend(&self.chars[self.pos..end]);
                }
                self.pos = end;
                continue;
            }

            let c = self.chars[self.pos];
            if matches!(c, '\'' | '"' | '`') {
                let mut end = self.pos + 1;
                while end < self.chars.len() && self.chars[end] != c {
                    end += 1;
                }
                let end = (end + 1).min(self.chars.len());
                self.current.extend(&self.chars[self.pos..end]);
                self.has_code = true;
                self.any_code = true;
                self.pos = end;
                continue;
            }

            if !self.line_delimiter {
                if let Some(delimiter) = self.delimiter {
                    if self.starts_with(delimiter) {
                        self.pos += delimiter.chars().count();
                        self.finish_statement();
                        continue;
                    }
                }
            }

            if !c.is_whitespace() {
                self.has_code = true;
                self.any_code = true;
            }
            self.current.push(c);
            self.pos += 1;
        }
        self.finish_statement();
    }
}
