//! SQL extraction from free-form model responses.
//!
//! Candidates are tried in order:
//! 1. a fenced code block tagged as SQL
//! 2. any fenced code block
//! 3. the longest run of text starting at a `SELECT` or `WITH` keyword
//!
//! A trailing `;` is stripped from whichever candidate wins.

use crate::error::{GatewayError, Result};
use regex::Regex;
use std::sync::OnceLock;

const SQL_FENCE: &str = r"(?is)```[ \t]*(?:sql|postgresql|postgres|pgsql)[ \t]*\r?\n(.*?)```";
const ANY_FENCE: &str = r"(?s)```[^\n`]*\r?\n(.*?)```";
const STATEMENT_START: &str = r"(?i)\b(?:SELECT|WITH)\b";

type Compiled = OnceLock<std::result::Result<Regex, regex::Error>>;

fn pattern(cell: &'static Compiled, source: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(source))
        .as_ref()
        .map_err(|e| GatewayError::internal(format!("invalid extraction pattern: {e}")))
}

/// Extracts a single SQL statement from a model response.
pub fn extract_sql(response: &str) -> Result<String> {
    static SQL: Compiled = OnceLock::new();
    static ANY: Compiled = OnceLock::new();

    let fenced = pattern(&SQL, SQL_FENCE)?
        .captures_iter(response)
        .chain(pattern(&ANY, ANY_FENCE)?.captures_iter(response))
        .filter_map(|caps| caps.get(1))
        .map(|m| clean(m.as_str()))
        .find(|sql| !sql.is_empty());

    let sql = match fenced {
        Some(sql) => Some(sql),
        None => longest_statement_run(response)?,
    };
    sql.ok_or_else(|| GatewayError::llm("Failed to extract SQL from model response"))
}

/// Finds the longest run starting at `SELECT`/`WITH`.
///
/// A run ends at the first `;`, a blank line, or the end of the text.
fn longest_statement_run(text: &str) -> Result<Option<String>> {
    static START: Compiled = OnceLock::new();

    Ok(pattern(&START, STATEMENT_START)?
        .find_iter(text)
        .map(|m| {
            let rest = &text[m.start()..];
            let end = [rest.find(';'), rest.find("\n\n"), rest.find("\r\n\r\n")]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(rest.len());
            clean(&rest[..end])
        })
        .filter(|sql| !sql.is_empty())
        .max_by_key(|sql| sql.len()))
}

fn clean(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim_end().to_string()
}
