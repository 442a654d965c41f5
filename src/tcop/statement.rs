//! Statement splitting and classification for simple queries.

use crate::security::CommandClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Read,
    Write,
    Schema,
    Begin { immediate: bool },
    Commit,
    Rollback,
    Savepoint,
    Release,
    RollbackTo,
    Other,
}

impl StatementClass {
    /// Whether the statement must hold the database's write lock.
    pub fn needs_write_lock(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Schema | Self::Begin { immediate: true }
        )
    }

    pub fn privilege(self) -> CommandClass {
        match self {
            Self::Write | Self::Other => CommandClass::Write,
            Self::Schema => CommandClass::Schema,
            Self::Read
            | Self::Begin { .. }
            | Self::Commit
            | Self::Rollback
            | Self::Savepoint
            | Self::Release
            | Self::RollbackTo => CommandClass::Read,
        }
    }

    /// Statements accepted inside a failed transaction block.
    pub fn allowed_in_failed_block(self) -> bool {
        matches!(self, Self::Commit | Self::Rollback | Self::RollbackTo)
    }
}

/// A classified statement ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub class: StatementClass,
    pub tag: String,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let class = classify(&sql);
        let tag = command_tag(&sql, class);
        Self { sql, class, tag }
    }
}

pub fn classify(sql: &str) -> StatementClass {
    let words = leading_keywords(sql, 3);
    let Some(first) = words.first() else {
        return StatementClass::Other;
    };
    match first.as_str() {
        "SELECT" | "VALUES" | "EXPLAIN" | "SHOW" | "TABLE" => StatementClass::Read,
        "WITH" => {
            if contains_keyword(sql, &["INSERT", "UPDATE", "DELETE", "REPLACE"]) {
                StatementClass::Write
            } else {
                StatementClass::Read
            }
        }
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "UPSERT" => StatementClass::Write,
        "CREATE" | "DROP" | "ALTER" | "REINDEX" | "VACUUM" | "ANALYZE" => StatementClass::Schema,
        "BEGIN" | "START" => StatementClass::Begin {
            immediate: words
                .iter()
                .any(|word| word == "IMMEDIATE" || word == "EXCLUSIVE"),
        },
        "COMMIT" | "END" => StatementClass::Commit,
        "ROLLBACK" | "ABORT" => {
            if contains_keyword(sql, &["TO"]) {
                StatementClass::RollbackTo
            } else {
                StatementClass::Rollback
            }
        }
        "SAVEPOINT" => StatementClass::Savepoint,
        "RELEASE" => StatementClass::Release,
        "PRAGMA" => {
            if sql.contains('=') {
                StatementClass::Write
            } else {
                StatementClass::Read
            }
        }
        _ => StatementClass::Other,
    }
}

/// CommandComplete tag without the row count.
pub fn command_tag(sql: &str, class: StatementClass) -> String {
    match class {
        StatementClass::Begin { .. } => return "BEGIN".to_string(),
        StatementClass::Commit => return "COMMIT".to_string(),
        StatementClass::Rollback | StatementClass::RollbackTo => return "ROLLBACK".to_string(),
        StatementClass::Release => return "RELEASE".to_string(),
        _ => {}
    }
    let words = leading_keywords(sql, 3);
    let Some(first) = words.first() else {
        return String::new();
    };
    match first.as_str() {
        "CREATE" | "DROP" | "ALTER" => {
            let object = words
                .iter()
                .skip(1)
                .find(|word| !matches!(word.as_str(), "TEMP" | "TEMPORARY" | "UNIQUE" | "VIRTUAL"));
            match object {
                Some(object) => format!("{first} {object}"),
                None => first.clone(),
            }
        }
        "WITH" => {
            for keyword in ["INSERT", "UPDATE", "DELETE"] {
                if contains_keyword(sql, &[keyword]) {
                    return keyword.to_string();
                }
            }
            "SELECT".to_string()
        }
        "VALUES" | "TABLE" => "SELECT".to_string(),
        "REPLACE" | "UPSERT" => "INSERT".to_string(),
        _ => first.clone(),
    }
}

/// Leading upper-cased keywords, skipping comments.
fn leading_keywords(sql: &str, limit: usize) -> Vec<String> {
    let stripped = strip_leading_comments(sql);
    stripped
        .split(|ch: char| ch.is_whitespace() || ch == '(' || ch == ';')
        .filter(|word| !word.is_empty())
        .take(limit)
        .map(str::to_ascii_uppercase)
        .collect()
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

fn contains_keyword(sql: &str, keywords: &[&str]) -> bool {
    sql.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_')
        .any(|word| keywords.iter().any(|kw| word.eq_ignore_ascii_case(kw)))
}

/// Splits simple-query text on top-level semicolons. Quoted text and
/// comments are kept intact; empty statements are dropped.
pub fn split_statements(query: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = query.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' => {
                current.push(ch);
                while let Some(next) = chars.next() {
                    current.push(next);
                    if next == ch {
                        if chars.peek() == Some(&ch) {
                            current.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                current.push(ch);
                for next in chars.by_ref() {
                    current.push(next);
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                current.push(ch);
                let mut prev = '\0';
                for next in chars.by_ref() {
                    current.push(next);
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !strip_leading_comments(trimmed).is_empty() {
        statements.push(trimmed.to_string());
    }
}
