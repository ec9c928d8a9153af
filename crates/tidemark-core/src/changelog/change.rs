//! Atomic change operations.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// A literal value in a structured change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
}

impl Literal {
    /// Render as a SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            Literal::Null => "NULL".to_string(),
            Literal::Bool(true) => "TRUE".to_string(),
            Literal::Bool(false) => "FALSE".to_string(),
            Literal::Integer(i) => i.to_string(),
            Literal::Real(r) => r.to_string(),
            Literal::Text(s) => quote_text(s),
        }
    }

    /// Render without SQL quoting, as a query result would print.
    pub fn to_plain_string(&self) -> String {
        match self {
            Literal::Null => "NULL".to_string(),
            Literal::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Literal::Integer(i) => i.to_string(),
            Literal::Real(r) => r.to_string(),
            Literal::Text(s) => s.clone(),
        }
    }
}

/// Quote a string as a SQL text literal.
pub fn quote_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Column definition for `createTable` and `addColumn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type, passed through to the database verbatim.
    #[serde(rename = "type")]
    pub column_type: String,
    /// Whether NULL is allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Unique constraint.
    #[serde(default)]
    pub unique: bool,
    /// Default value.
    #[serde(default)]
    pub default_value: Option<Literal>,
}

impl ColumnDef {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    /// Mark as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, value: Literal) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// A column/value pair for `insert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    /// Column name.
    pub name: String,
    /// Value.
    pub value: Literal,
}

impl ColumnValue {
    /// Create a column/value pair.
    pub fn new(name: impl Into<String>, value: Literal) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One atomic operation inside a change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Change {
    /// Raw SQL.
    #[serde(rename_all = "camelCase")]
    Sql {
        /// SQL text, possibly several statements.
        sql: String,
        /// Split the text into statements on the delimiter.
        #[serde(default = "default_true")]
        split_statements: bool,
        /// Statement delimiter; `;` when unset.
        #[serde(default)]
        end_delimiter: Option<String>,
        /// Remove comments before executing.
        #[serde(default)]
        strip_comments: bool,
    },
    /// Raw SQL loaded from a file when the changelog is parsed.
    #[serde(rename_all = "camelCase")]
    SqlFile {
        /// File path.
        path: String,
        /// Resolve `path` relative to the changelog declaring it.
        #[serde(default)]
        relative_to_changelog_file: bool,
        /// Split the text into statements on the delimiter.
        #[serde(default = "default_true")]
        split_statements: bool,
        /// Statement delimiter; `;` when unset.
        #[serde(default)]
        end_delimiter: Option<String>,
        /// Remove comments before executing.
        #[serde(default)]
        strip_comments: bool,
        /// File content, filled in by the parser.
        #[serde(skip)]
        content: Option<String>,
    },
    /// Create a table.
    #[serde(rename_all = "camelCase")]
    CreateTable {
        /// Table name.
        table_name: String,
        /// Columns.
        columns: Vec<ColumnDef>,
    },
    /// Drop a table.
    #[serde(rename_all = "camelCase")]
    DropTable {
        /// Table name.
        table_name: String,
    },
    /// Rename a table.
    #[serde(rename_all = "camelCase")]
    RenameTable {
        /// Current name.
        old_table_name: String,
        /// New name.
        new_table_name: String,
    },
    /// Add columns to a table.
    #[serde(rename_all = "camelCase")]
    AddColumn {
        /// Table name.
        table_name: String,
        /// Columns to add.
        columns: Vec<ColumnDef>,
    },
    /// Drop a column.
    #[serde(rename_all = "camelCase")]
    DropColumn {
        /// Table name.
        table_name: String,
        /// Column name.
        column_name: String,
    },
    /// Rename a column.
    #[serde(rename_all = "camelCase")]
    RenameColumn {
        /// Table name.
        table_name: String,
        /// Current name.
        old_column_name: String,
        /// New name.
        new_column_name: String,
    },
    /// Create an index.
    #[serde(rename_all = "camelCase")]
    CreateIndex {
        /// Index name.
        index_name: String,
        /// Table name.
        table_name: String,
        /// Indexed columns in order.
        columns: Vec<String>,
        /// Unique index.
        #[serde(default)]
        unique: bool,
    },
    /// Drop an index.
    #[serde(rename_all = "camelCase")]
    DropIndex {
        /// Index name.
        index_name: String,
        /// Table the index belongs to.
        #[serde(default)]
        table_name: Option<String>,
    },
    /// Insert one row.
    #[serde(rename_all = "camelCase")]
    Insert {
        /// Table name.
        table_name: String,
        /// Column values.
        columns: Vec<ColumnValue>,
    },
    /// Delete rows.
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Table name.
        table_name: String,
        /// Optional WHERE clause body.
        #[serde(default, rename = "where")]
        where_clause: Option<String>,
    },
    /// Tag the database at this point of the changelog.
    #[serde(rename_all = "camelCase")]
    TagDatabase {
        /// Tag name.
        tag: String,
    },
}

impl Change {
    /// Convenience constructor for a raw SQL change with default options.
    pub fn sql(sql: impl Into<String>) -> Self {
        Change::Sql {
            sql: sql.into(),
            split_statements: true,
            end_delimiter: None,
            strip_comments: false,
        }
    }

    /// Short operation name.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Sql { .. } => "sql",
            Change::SqlFile { .. } => "sqlFile",
            Change::CreateTable { .. } => "createTable",
            Change::DropTable { .. } => "dropTable",
            Change::RenameTable { .. } => "renameTable",
            Change::AddColumn { .. } => "addColumn",
            Change::DropColumn { .. } => "dropColumn",
            Change::RenameColumn { .. } => "renameColumn",
            Change::CreateIndex { .. } => "createIndex",
            Change::DropIndex { .. } => "dropIndex",
            Change::Insert { .. } => "insert",
            Change::Delete { .. } => "delete",
            Change::TagDatabase { .. } => "tagDatabase",
        }
    }

    /// Human-readable one-line summary, stored with execution records.
    pub fn description(&self) -> String {
        match self {
            Change::Sql { .. } => "sql".to_string(),
            Change::SqlFile { path, .. } => format!("sqlFile path={}", path),
            Change::CreateTable { table_name, .. } => format!("createTable tableName={}", table_name),
            Change::DropTable { table_name } => format!("dropTable tableName={}", table_name),
            Change::RenameTable { new_table_name, .. } => {
                format!("renameTable newTableName={}", new_table_name)
            }
            Change::AddColumn { table_name, .. } => format!("addColumn tableName={}", table_name),
            Change::DropColumn {
                table_name,
                column_name,
            } => format!("dropColumn columnName={}, tableName={}", column_name, table_name),
            Change::RenameColumn {
                table_name,
                new_column_name,
                ..
            } => format!(
                "renameColumn newColumnName={}, tableName={}",
                new_column_name, table_name
            ),
            Change::CreateIndex { index_name, .. } => format!("createIndex indexName={}", index_name),
            Change::DropIndex { index_name, .. } => format!("dropIndex indexName={}", index_name),
            Change::Insert { table_name, .. } => format!("insert tableName={}", table_name),
            Change::Delete { table_name, .. } => format!("delete tableName={}", table_name),
            Change::TagDatabase { tag } => format!("tagDatabase tag={}", tag),
        }
    }

    /// The tag declared by a `tagDatabase` change.
    pub fn declared_tag(&self) -> Option<&str> {
        match self {
            Change::TagDatabase { tag } => Some(tag),
            _ => None,
        }
    }

    /// Changes that undo this one, when that can be derived mechanically.
    pub fn inverse(&self) -> Option<Vec<Change>> {
        match self {
            Change::CreateTable { table_name, .. } => Some(vec![Change::DropTable {
                table_name: table_name.clone(),
            }]),
            Change::RenameTable {
                old_table_name,
                new_table_name,
            } => Some(vec![Change::RenameTable {
                old_table_name: new_table_name.clone(),
                new_table_name: old_table_name.clone(),
            }]),
            Change::AddColumn {
                table_name,
                columns,
            } => Some(
                columns
                    .iter()
                    .rev()
                    .map(|c| Change::DropColumn {
                        table_name: table_name.clone(),
                        column_name: c.name.clone(),
                    })
                    .collect(),
            ),
            Change::RenameColumn {
                table_name,
                old_column_name,
                new_column_name,
            } => Some(vec![Change::RenameColumn {
                table_name: table_name.clone(),
                old_column_name: new_column_name.clone(),
                new_column_name: old_column_name.clone(),
            }]),
            Change::CreateIndex {
                index_name,
                table_name,
                ..
            } => Some(vec![Change::DropIndex {
                index_name: index_name.clone(),
                table_name: Some(table_name.clone()),
            }]),
            Change::TagDatabase { .. } => Some(Vec::new()),
            Change::Sql { .. }
            | Change::SqlFile { .. }
            | Change::DropTable { .. }
            | Change::DropColumn { .. }
            | Change::DropIndex { .. }
            | Change::Insert { .. }
            | Change::Delete { .. } => None,
        }
    }
}
