//! AST-level policy enforcement for generated SQL.
//!
//! The statement is parsed with the PostgreSQL dialect and walked once with a
//! [`Visitor`] that collects every nested statement, table reference, column
//! reference and function call. Checks then run in a fixed order (statement
//! kind, tables, columns, functions) so a rejected statement always reports
//! the same single violation.

use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::config::SecurityPolicy;
use crate::error::{GatewayError, Result, ViolationKind};

/// Validates SQL against a [`SecurityPolicy`].
///
/// Validation is pure: no I/O, no shared state.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    policy: SecurityPolicy,
}

impl SqlValidator {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Returns `Ok(())` if `sql` is a single statement the policy allows.
    ///
    /// Empty or malformed input yields [`GatewayError::Parse`]; anything the
    /// policy forbids yields [`GatewayError::SecurityViolation`].
    pub fn validate_or_raise(&self, sql: &str) -> Result<()> {
        if sql.trim().is_empty() {
            return Err(GatewayError::parse("Empty SQL statement"));
        }

        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| {
            match nested_write_keyword(sql) {
                Some(keyword) => GatewayError::violation(ViolationKind::StatementKind, keyword),
                None => GatewayError::parse(e.to_string()),
            }
        })?;

        let statement = match statements.as_slice() {
            [] => return Err(GatewayError::parse("Empty SQL statement")),
            [statement] => statement,
            _ => return Err(GatewayError::violation(ViolationKind::MultipleStatements, "")),
        };

        if matches!(statement, Statement::Explain { .. }) && !self.policy.allow_explain {
            return Err(GatewayError::violation(
                ViolationKind::ExplainNotAllowed,
                "EXPLAIN",
            ));
        }

        let mut refs = References::default();
        let _ = statement.visit(&mut refs);

        if let Some(keyword) = refs.statement_kinds.first() {
            return Err(GatewayError::violation(
                ViolationKind::StatementKind,
                keyword.clone(),
            ));
        }

        if let Some(table) = refs.tables.iter().find(|t| self.is_blocked_table(t)) {
            return Err(GatewayError::violation(
                ViolationKind::BlockedTable,
                table.join("."),
            ));
        }

        if let Some(column) = refs.columns.iter().find(|c| self.is_blocked_column(c, &refs)) {
            return Err(GatewayError::violation(
                ViolationKind::BlockedColumn,
                column.display(),
            ));
        }

        if let Some(function) = refs.functions.iter().find(|f| self.is_blocked_function(f)) {
            return Err(GatewayError::violation(
                ViolationKind::BlockedFunction,
                function.join("."),
            ));
        }

        Ok(())
    }

    fn is_blocked_table(&self, parts: &[String]) -> bool {
        matches_entry(&self.policy.blocked_tables, parts)
    }

    fn is_blocked_function(&self, parts: &[String]) -> bool {
        matches_entry(&self.policy.blocked_functions, parts)
    }

    /// `password` blocks every column of that name; `users.password` blocks it
    /// when qualified by `users` (or an alias bound to `users`) and when
    /// unqualified.
    fn is_blocked_column(&self, column: &ColumnRef, refs: &References) -> bool {
        let table = column
            .qualifier
            .as_ref()
            .map(|q| refs.aliases.get(q).unwrap_or(q));

        self.policy.blocked_columns.iter().any(|entry| {
            let mut parts = entry.rsplit('.');
            let Some(name) = parts.next() else {
                return false;
            };
            if name != column.name {
                return false;
            }
            match (parts.next(), table) {
                (None, _) | (Some(_), None) => true,
                (Some(blocked_table), Some(table)) => blocked_table == table,
            }
        })
    }
}

/// Matches a (possibly qualified) reference against a set of blocked names.
///
/// An entry matches the reference's full dotted name or its last segment; a
/// qualified entry also matches an unqualified reference with the same
/// last segment.
fn matches_entry(blocked: &BTreeSet<String>, parts: &[String]) -> bool {
    let Some(bare) = parts.last() else {
        return false;
    };
    if blocked.contains(&parts.join(".")) || blocked.contains(bare) {
        return true;
    }
    parts.len() == 1
        && blocked
            .iter()
            .any(|entry| entry.rsplit('.').next() == Some(bare.as_str()))
}

/// A column reference with its qualifier (table name or alias), case-folded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnRef {
    qualifier: Option<String>,
    name: String,
}

impl ColumnRef {
    fn display(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", q, self.name),
            None => self.name.clone(),
        }
    }
}

/// Everything a statement references, in visit order.
#[derive(Debug, Default)]
struct References {
    /// Keywords of nested statements that are not plain queries.
    statement_kinds: Vec<String>,
    tables: Vec<Vec<String>>,
    columns: Vec<ColumnRef>,
    functions: Vec<Vec<String>>,
    /// Alias → bare table name.
    aliases: HashMap<String, String>,
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        if !matches!(statement, Statement::Query(_) | Statement::Explain { .. }) {
            self.statement_kinds.push(statement_keyword(statement));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if selects_into(&query.body) {
            self.statement_kinds.push("SELECT INTO".to_string());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        match table_factor {
            // `FROM generate_series(...)` parses as a table with arguments.
            TableFactor::Table {
                name, args: Some(_), ..
            }
            | TableFactor::Function { name, .. } => {
                self.functions.push(fold_name(name));
            }
            TableFactor::Table { name, alias, .. } => {
                let parts = fold_name(name);
                if let (Some(alias), Some(table)) = (alias, parts.last()) {
                    self.aliases.insert(fold(&alias.name), table.clone());
                }
                self.tables.push(parts);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ColumnRef {
                qualifier: None,
                name: fold(ident),
            }),
            Expr::CompoundIdentifier(idents) => {
                if let Some((name, qualifiers)) = idents.split_last() {
                    self.columns.push(ColumnRef {
                        qualifier: qualifiers.last().map(fold),
                        name: fold(name),
                    });
                }
            }
            Expr::Function(function) => self.functions.push(fold_name(&function.name)),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn fold(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

fn fold_name(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(fold).collect()
}

/// `SELECT ... INTO new_table` creates a table.
fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

/// Keywords that start a data-modifying or DDL statement.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT",
    "REVOKE", "COPY",
];

/// Finds a write keyword opening a parenthesized subquery or CTE body.
///
/// The parser cannot read some data-modifying statements in those positions
/// (`(DELETE FROM ...)`), so unparseable input is scanned token by token
/// before it is reported as a syntax error.
fn nested_write_keyword(sql: &str) -> Option<String> {
    let tokens = Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize().ok()?;
    let mut previous: Option<&Token> = None;

    for token in tokens.iter().filter(|t| !matches!(t, Token::Whitespace(_))) {
        if let (Some(Token::LParen), Token::Word(word)) = (previous, token) {
            let keyword = word.value.to_uppercase();
            if word.quote_style.is_none() && WRITE_KEYWORDS.contains(&keyword.as_str()) {
                return Some(keyword);
            }
        }
        previous = Some(token);
    }
    None
}

/// Leading keyword of a statement, used to name rejected statement kinds.
fn statement_keyword(statement: &Statement) -> String {
    let keyword = match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Merge { .. } => "MERGE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => "ALTER",
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateRole { .. } => "CREATE",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        Statement::Copy { .. } => "COPY",
        _ => {
            return statement
                .to_string()
                .split_whitespace()
                .next()
                .map(str::to_uppercase)
                .unwrap_or_else(|| "UNKNOWN".to_string());
        }
    };
    keyword.to_string()
}
