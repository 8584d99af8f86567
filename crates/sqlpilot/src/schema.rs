//! Caller-supplied database schema snapshot and its prompt rendering.

use std::fmt::{self, Write as _};
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub database_name: String,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub schema_qualifier: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub max_length: Option<u32>,
}

/// Foreign key edge `fk_table.fk_column -> pk_table.pk_column`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub fk_table: String,
    pub fk_column: String,
    pub pk_table: String,
    pub pk_column: String,
}

impl SchemaSnapshot {
    /// Load a snapshot from a JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse schema file {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Render the snapshot as prompt text.
    ///
    /// Output is deterministic: tables keep their input order and each table
    /// lists its columns before its relationships.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Database: {}", self.database_name);

        for table in &self.tables {
            out.push('\n');
            let _ = writeln!(out, "Table: {}", table.qualified_name());

            if !table.columns.is_empty() {
                out.push_str("  Columns:\n");
                for column in &table.columns {
                    let _ = writeln!(out, "    - {}", column.describe());
                }
            }

            if !table.relationships.is_empty() {
                out.push_str("  Relationships:\n");
                for rel in &table.relationships {
                    let _ = writeln!(
                        out,
                        "    - {}.{} -> {}.{}",
                        rel.fk_table, rel.fk_column, rel.pk_table, rel.pk_column
                    );
                }
            }
        }

        out
    }
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        match self.schema_qualifier.as_deref() {
            Some(qualifier) if !qualifier.is_empty() => format!("{}.{}", qualifier, self.name),
            _ => self.name.clone(),
        }
    }
}

impl ColumnSchema {
    fn describe(&self) -> String {
        let data_type = match self.max_length {
            Some(len) => format!("{}({})", self.data_type, len),
            None => self.data_type.clone(),
        };
        let mut parts = vec![data_type];
        parts.push(if self.nullable { "NULL" } else { "NOT NULL" }.to_string());
        if self.is_primary_key {
            parts.push("PRIMARY KEY".to_string());
        }
        format!("{} ({})", self.name, parts.join(", "))
    }
}

/// Target SQL dialect for generation prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    SqlServer,
    PostgreSql,
    MySql,
    Sqlite,
    Oracle,
    Other(String),
}

impl Dialect {
    pub fn display_name(&self) -> &str {
        match self {
            Dialect::SqlServer => "Microsoft SQL Server (T-SQL)",
            Dialect::PostgreSql => "PostgreSQL",
            Dialect::MySql => "MySQL",
            Dialect::Sqlite => "SQLite",
            Dialect::Oracle => "Oracle",
            Dialect::Other(tag) => tag,
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::SqlServer
    }
}

impl FromStr for Dialect {
    type Err = std::convert::Infallible;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let dialect = match tag.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" | "sql server" | "tsql" | "t-sql" => Dialect::SqlServer,
            "postgres" | "postgresql" | "pg" => Dialect::PostgreSql,
            "mysql" | "mariadb" => Dialect::MySql,
            "sqlite" | "sqlite3" => Dialect::Sqlite,
            "oracle" | "plsql" => Dialect::Oracle,
            _ => Dialect::Other(tag.trim().to_string()),
        };
        Ok(dialect)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
