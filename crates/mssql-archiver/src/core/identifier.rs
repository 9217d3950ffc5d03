//! Identifier quoting and filter-predicate handling.
//!
//! SQL Server identifiers cannot be bound as parameters, so every schema,
//! table and column name that ends up in dynamic SQL goes through
//! [`quote_mssql`]. Filter predicates are operator-supplied fragments; they are
//! screened by [`validate_predicate`] at job-definition time and expanded by
//! [`render_predicate`] when a batch statement is built.

use crate::error::{ArchiveError, Result};

/// SQL Server's identifier limit (sysname).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Procedures that have no business appearing inside a row filter.
const DANGEROUS_PROCEDURES: &[&str] = &[
    "xp_cmdshell",
    "xp_regread",
    "xp_regwrite",
    "xp_dirtree",
    "sp_executesql",
    "sp_configure",
    "sp_oacreate",
    "openrowset",
    "opendatasource",
];

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing NUL bytes, and names longer than
/// `sysname` allows.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ArchiveError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(ArchiveError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(ArchiveError::Config(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Qualify a SQL Server table name with schema.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Escape a value for use inside an N'...' literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Screen a filter predicate fragment for statement-stacking patterns.
///
/// Rejected: semicolons, SQL comments, `EXEC`/`EXECUTE`, and a short list of
/// procedures and rowset functions that reach outside the table.
pub fn validate_predicate(predicate: &str) -> Result<()> {
    if predicate.trim().is_empty() {
        return Err(ArchiveError::Config(
            "filter predicate cannot be empty".to_string(),
        ));
    }

    if predicate.contains(';') {
        return Err(ArchiveError::Config(format!(
            "SECURITY: filter predicate contains semicolon: {:?}",
            predicate
        )));
    }

    if predicate.contains("--") || predicate.contains("/*") || predicate.contains("*/") {
        return Err(ArchiveError::Config(format!(
            "SECURITY: filter predicate contains SQL comment markers: {:?}",
            predicate
        )));
    }

    let lower = predicate.to_lowercase();
    if lower.split_whitespace().any(|word| {
        word == "exec" || word == "execute" || word.starts_with("exec(") || word.starts_with("execute(")
    }) {
        return Err(ArchiveError::Config(format!(
            "SECURITY: filter predicate contains EXEC/EXECUTE: {:?}",
            predicate
        )));
    }

    if let Some(proc_name) = DANGEROUS_PROCEDURES.iter().find(|p| lower.contains(*p)) {
        return Err(ArchiveError::Config(format!(
            "SECURITY: filter predicate references {}: {:?}",
            proc_name, predicate
        )));
    }

    if predicate.matches('\'').count() % 2 != 0 {
        return Err(ArchiveError::Config(format!(
            "filter predicate has an unterminated string literal: {:?}",
            predicate
        )));
    }

    Ok(())
}

/// Expand relative-time shorthand in a predicate into T-SQL.
///
/// `now` becomes `GETDATE()` and `now - <n><unit>` becomes
/// `DATEADD(<unit>, -<n>, GETDATE())` for units `s`, `m`, `h`, `d`, `w`.
/// Text inside string literals and everything else passes through untouched.
pub fn render_predicate(predicate: &str) -> String {
    let chars: Vec<char> = predicate.chars().collect();
    let mut out = String::with_capacity(predicate.len() + 32);
    let mut in_literal = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
            i += 1;
            continue;
        }

        if !in_literal && is_now_keyword(&chars, i) {
            let (rendered, consumed) = render_now(&chars, i + 3);
            out.push_str(&rendered);
            i = consumed;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// The full filter condition for a column: `[col] <rendered predicate>`.
pub fn filter_condition(column: &str, predicate: &str) -> Result<String> {
    Ok(format!(
        "{} {}",
        quote_mssql(column)?,
        render_predicate(predicate.trim())
    ))
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '@' || c == '#'
}

fn is_now_keyword(chars: &[char], i: usize) -> bool {
    if i + 3 > chars.len() {
        return false;
    }
    let word: String = chars[i..i + 3].iter().collect();
    if !word.eq_ignore_ascii_case("now") {
        return false;
    }
    let before_ok = i == 0 || !is_word_char(chars[i - 1]);
    let after_ok = chars
        .get(i + 3)
        .map(|c| !is_word_char(*c) && *c != '(')
        .unwrap_or(true);
    before_ok && after_ok
}

/// Render `now` plus an optional `- <n><unit>` suffix starting at `start`.
/// Returns the rendered text and the index just past what was consumed.
fn render_now(chars: &[char], start: usize) -> (String, usize) {
    let plain = ("GETDATE()".to_string(), start);

    let mut j = skip_whitespace(chars, start);
    if chars.get(j) != Some(&'-') {
        return plain;
    }
    j = skip_whitespace(chars, j + 1);

    let digits_start = j;
    while chars.get(j).map(|c| c.is_ascii_digit()).unwrap_or(false) {
        j += 1;
    }
    if j == digits_start {
        return plain;
    }
    let amount: String = chars[digits_start..j].iter().collect();

    let unit = match chars.get(j).map(|c| c.to_ascii_lowercase()) {
        Some('s') => "second",
        Some('m') => "minute",
        Some('h') => "hour",
        Some('d') => "day",
        Some('w') => "week",
        _ => return plain,
    };
    if chars.get(j + 1).map(|c| is_word_char(*c)).unwrap_or(false) {
        return plain;
    }

    (format!("DATEADD({}, -{}, GETDATE())", unit, amount), j + 1)
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while chars.get(i).map(|c| c.is_whitespace()).unwrap_or(false) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_mssql() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("user]table").unwrap(), "[user]]table]");
        assert!(quote_mssql("").is_err());
        assert!(quote_mssql("bad\0name").is_err());
        assert!(quote_mssql(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_qualify_mssql() {
        assert_eq!(qualify_mssql("dbo", "Orders").unwrap(), "[dbo].[Orders]");
    }

    #[test]
    fn test_render_relative_minutes() {
        assert_eq!(
            render_predicate("< now - 10m"),
            "< DATEADD(minute, -10, GETDATE())"
        );
        assert_eq!(
            render_predicate("<= NOW-30d"),
            "<= DATEADD(day, -30, GETDATE())"
        );
    }

    #[test]
    fn test_render_plain_now() {
        assert_eq!(render_predicate("< now"), "< GETDATE()");
    }

    #[test]
    fn test_render_leaves_literals_and_words_alone() {
        assert_eq!(
            render_predicate("< '2024-01-01' AND note <> 'now - 1d'"),
            "< '2024-01-01' AND note <> 'now - 1d'"
        );
        assert_eq!(render_predicate("< known_value"), "< known_value");
        assert_eq!(render_predicate("< now - 5 + 1"), "< GETDATE() - 5 + 1");
    }

    #[test]
    fn test_filter_condition() {
        assert_eq!(
            filter_condition("CreatedAt", " < now - 2h ").unwrap(),
            "[CreatedAt] < DATEADD(hour, -2, GETDATE())"
        );
    }

    #[test]
    fn test_validate_predicate_rejects_stacking() {
        assert!(validate_predicate("< now - 10m").is_ok());
        assert!(validate_predicate("IN (1, 2, 3)").is_ok());
        assert!(validate_predicate("< 5; DROP TABLE x").is_err());
        assert!(validate_predicate("< 5 -- trailing").is_err());
        assert!(validate_predicate("< 5 OR 1 = (exec xp_cmdshell)").is_err());
        assert!(validate_predicate("< 'unterminated").is_err());
        assert!(validate_predicate("   ").is_err());
    }
}
