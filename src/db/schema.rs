//! Schema snapshot types.
//!
//! A snapshot describes one database's tables, columns and foreign keys at
//! the moment it was introspected. Snapshots are never edited after
//! construction; a refresh replaces the whole value.

use serde::{Deserialize, Serialize};

/// Marker appended when prompt text is cut to fit the size bound.
pub const TRUNCATION_MARKER: &str = "\n... (schema truncated)\n";

/// Table and column metadata for one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Identifier of the database this snapshot belongs to.
    pub database: String,

    /// Tables ordered by schema, then name.
    pub tables: Vec<Table>,

    pub foreign_keys: Vec<ForeignKey>,
}

impl SchemaSnapshot {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name) || t.qualified_name().eq_ignore_ascii_case(name))
    }

    /// Renders the schema as prompt text.
    ///
    /// Tables are emitted whole until adding the next one would pass
    /// `max_chars`; the remainder is replaced with [`TRUNCATION_MARKER`].
    pub fn format_for_prompt(&self, max_chars: usize) -> String {
        let mut out = format!("Database: {}\n\n", self.database);

        for (i, table) in self.tables.iter().enumerate() {
            let block = self.format_table(table);
            if out.len() + block.len() > max_chars {
                out.push_str(TRUNCATION_MARKER);
                out.push_str(&format!(
                    "({} of {} tables shown)\n",
                    i,
                    self.tables.len()
                ));
                return out;
            }
            out.push_str(&block);
        }

        if !self.foreign_keys.is_empty() {
            let mut fk_text = String::from("Foreign Keys:\n");
            for fk in &self.foreign_keys {
                fk_text.push_str(&format!(
                    "  - {}.{} -> {}.{}\n",
                    fk.from_table,
                    fk.from_columns.join(", "),
                    fk.to_table,
                    fk.to_columns.join(", ")
                ));
            }
            if out.len() + fk_text.len() <= max_chars {
                out.push_str(&fk_text);
            } else {
                out.push_str(TRUNCATION_MARKER);
            }
        }

        out
    }

    fn format_table(&self, table: &Table) -> String {
        let mut block = format!("Table: {}\n", table.qualified_name());
        for column in &table.columns {
            let annotations: Vec<String> = [
                column.is_primary_key.then(|| "PK".to_string()),
                (!column.is_nullable).then(|| "NOT NULL".to_string()),
                column.default.as_ref().map(|d| format!("DEFAULT {d}")),
            ]
            .into_iter()
            .flatten()
            .collect();

            if annotations.is_empty() {
                block.push_str(&format!("  - {}: {}\n", column.name, column.data_type));
            } else {
                block.push_str(&format!(
                    "  - {}: {} ({})\n",
                    column.name,
                    column.data_type,
                    annotations.join(", ")
                ));
            }
        }
        block.push('\n');
        block
    }
}

/// A table or view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Schema the table lives in (e.g. "public").
    pub schema: String,

    pub name: String,

    /// Columns in ordinal order.
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// `schema.name`, or just the name for the `public` schema.
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() || self.schema == "public" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    /// Data type (e.g., "integer", "character varying").
    pub data_type: String,

    pub is_nullable: bool,

    pub is_primary_key: bool,

    /// Default value expression, if any.
    pub default: Option<String>,
}

impl Column {
    /// Creates a nullable, non-key column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            is_primary_key: false,
            default: None,
        }
    }

    pub fn nullable(self, nullable: bool) -> Self {
        Self {
            is_nullable: nullable,
            ..self
        }
    }

    /// Marks the column as (part of) the primary key; implies NOT NULL.
    pub fn primary_key(self) -> Self {
        Self {
            is_primary_key: true,
            is_nullable: false,
            ..self
        }
    }

    pub fn with_default(self, default: impl Into<String>) -> Self {
        Self {
            default: Some(default.into()),
            ..self
        }
    }
}

/// A foreign key relationship between tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(
        from_table: impl Into<String>,
        from_columns: Vec<String>,
        to_table: impl Into<String>,
        to_columns: Vec<String>,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_columns,
            to_table: to_table.into(),
            to_columns,
        }
    }
}
