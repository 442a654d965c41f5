//! rusqlite-backed executor: one SQLite file per logical database.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use tracing::{debug, warn};

use crate::engine::{
    BOOL_OID, BYTEA_OID, ColumnInfo, EngineError, ExecuteOutcome, ExecutorFactory, FLOAT8_OID,
    INT8_OID, InterruptHandle, PortalHandle, PreparedInfo, Row, StatementExecutor,
    StatementHandle, TEXT_OID,
};
use crate::protocol::sqlstate;

const STATEMENT_CACHE_CAPACITY: usize = 64;
/// Rows buffered in memory before a read moves to its own cursor.
const INLINE_ROW_LIMIT: usize = 4096;
/// Rows a cursor reader may run ahead of the consumer.
const CURSOR_BACKLOG: usize = 1024;

pub struct SqliteExecutorFactory {
    data_dir: PathBuf,
    lock_wait: Duration,
}

impl SqliteExecutorFactory {
    pub fn new(data_dir: impl Into<PathBuf>, lock_wait: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock_wait,
        }
    }

    pub fn database_path(&self, database: &str) -> PathBuf {
        self.data_dir.join(format!("{database}.db"))
    }
}

impl ExecutorFactory for SqliteExecutorFactory {
    fn open(&self, database: &str) -> Result<Box<dyn StatementExecutor>, EngineError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|err| {
            EngineError::Io(format!(
                "cannot create data directory {}: {err}",
                self.data_dir.display()
            ))
        })?;
        let executor = SqliteExecutor::open(&self.database_path(database), self.lock_wait)?;
        Ok(Box::new(executor))
    }
}

struct SqliteStatement {
    sql: String,
    parameter_types: Vec<u32>,
    autocommit_before: Option<bool>,
}

struct SqlitePortal {
    statement: StatementHandle,
    params: Vec<Value>,
    executed: Option<ExecuteOutcome>,
    rows: PortalRows,
}

/// Result rows of an executed portal.
///
/// A rusqlite statement borrows its connection, so an open cursor cannot be
/// parked across worker iterations. Small results are buffered when the
/// portal executes. A read-only autocommit result that outgrows
/// [`INLINE_ROW_LIMIT`] is re-run on a reader thread with its own
/// connection, which keeps a single snapshot for the whole scan and hands
/// rows over through a bounded channel. Reads inside a transaction must see
/// that transaction's writes, so they always stay buffered.
enum PortalRows {
    Buffered(VecDeque<Row>),
    Cursor(RowCursor),
}

impl PortalRows {
    fn next(&mut self) -> Result<Option<Row>, EngineError> {
        match self {
            Self::Buffered(rows) => Ok(rows.pop_front()),
            Self::Cursor(cursor) => cursor.next(),
        }
    }

    fn has_more(&mut self) -> Result<bool, EngineError> {
        match self {
            Self::Buffered(rows) => Ok(!rows.is_empty()),
            Self::Cursor(cursor) => Ok(cursor.peek()?.is_some()),
        }
    }
}

struct RowCursor {
    rows: Receiver<Result<Row, EngineError>>,
    peeked: Option<Row>,
}

impl RowCursor {
    fn spawn(
        path: &Path,
        lock_wait: Duration,
        sql: &str,
        params: &[Value],
    ) -> Result<Self, EngineError> {
        let (tx, rx) = crossbeam_channel::bounded(CURSOR_BACKLOG);
        let path = path.to_path_buf();
        let sql = sql.to_string();
        let params = params.to_vec();
        thread::Builder::new()
            .name("sqlgate-cursor".to_string())
            .spawn(move || {
                if let Err(err) = read_rows(&path, lock_wait, &sql, &params, &tx) {
                    let _ = tx.send(Err(err));
                }
            })
            .map_err(|err| EngineError::Io(format!("cannot start cursor reader: {err}")))?;
        Ok(Self {
            rows: rx,
            peeked: None,
        })
    }

    fn peek(&mut self) -> Result<Option<&Row>, EngineError> {
        if self.peeked.is_none() {
            // a disconnected channel means the reader ran out of rows
            self.peeked = match self.rows.recv() {
                Ok(row) => Some(row?),
                Err(_) => None,
            };
        }
        Ok(self.peeked.as_ref())
    }

    fn next(&mut self) -> Result<Option<Row>, EngineError> {
        self.peek()?;
        Ok(self.peeked.take())
    }
}

/// Body of a cursor reader thread. Stops early once the portal is dropped.
fn read_rows(
    path: &Path,
    lock_wait: Duration,
    sql: &str,
    params: &[Value],
    tx: &Sender<Result<Row, EngineError>>,
) -> Result<(), EngineError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(lock_wait)?;
    let mut stmt = conn.prepare(sql)?;
    for (idx, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(idx + 1, value)?;
    }
    let column_count = stmt.column_count();
    let mut rows = stmt.raw_query();
    let mut sent = 0u64;
    while let Some(row) = rows.next()? {
        if tx.send(Ok(read_row(row, column_count)?)).is_err() {
            debug!(sent, "cursor abandoned by its portal");
            return Ok(());
        }
        sent += 1;
    }
    debug!(sent, "cursor drained");
    Ok(())
}

fn read_row(row: &rusqlite::Row<'_>, column_count: usize) -> Result<Row, EngineError> {
    (0..column_count)
        .map(|idx| Ok(render_value(row.get_ref(idx)?)))
        .collect()
}

pub struct SqliteExecutor {
    conn: Connection,
    path: PathBuf,
    lock_wait: Duration,
    statements: HashMap<u64, SqliteStatement>,
    portals: HashMap<u64, SqlitePortal>,
    next_handle: u64,
}

impl SqliteExecutor {
    pub fn open(path: &Path, lock_wait: Duration) -> Result<Self, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(lock_wait)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened sqlite database");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            lock_wait,
            statements: HashMap::new(),
            portals: HashMap::new(),
            next_handle: 1,
        })
    }

    fn allocate(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn run_portal(
        &self,
        portal: &SqlitePortal,
        max_rows: usize,
    ) -> Result<(ExecuteOutcome, PortalRows), EngineError> {
        let statement = self.statements.get(&portal.statement.0).ok_or_else(|| {
            EngineError::sql(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                "prepared statement no longer exists",
            )
        })?;
        let mut stmt = self.conn.prepare_cached(&statement.sql)?;
        for (idx, value) in portal.params.iter().enumerate() {
            stmt.raw_bind_parameter(idx + 1, value)?;
        }

        let column_count = stmt.column_count();
        if column_count == 0 {
            let changed = stmt.raw_execute()?;
            return Ok((
                ExecuteOutcome {
                    has_result_set: false,
                    update_count: changed as u64,
                },
                PortalRows::Buffered(VecDeque::new()),
            ));
        }

        let streamable = stmt.readonly() && self.conn.is_autocommit();
        let mut rows = VecDeque::with_capacity(max_rows.clamp(16, 1024));
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next()? {
            if streamable && rows.len() == INLINE_ROW_LIMIT {
                debug!(
                    buffered = rows.len(),
                    "result outgrew the inline buffer, reading through a cursor"
                );
                let cursor =
                    RowCursor::spawn(&self.path, self.lock_wait, &statement.sql, &portal.params)?;
                return Ok((
                    ExecuteOutcome {
                        has_result_set: true,
                        update_count: 0,
                    },
                    PortalRows::Cursor(cursor),
                ));
            }
            rows.push_back(read_row(row, column_count)?);
        }
        Ok((
            ExecuteOutcome {
                has_result_set: true,
                update_count: rows.len() as u64,
            },
            PortalRows::Buffered(rows),
        ))
    }
}

impl StatementExecutor for SqliteExecutor {
    fn prepare(
        &mut self,
        sql: &str,
        parameter_types: &[u32],
    ) -> Result<(StatementHandle, PreparedInfo), EngineError> {
        let sql = rewrite_placeholders(sql).into_owned();
        let (parameter_count, columns) = {
            let stmt = self.conn.prepare_cached(&sql)?;
            let columns = stmt
                .columns()
                .iter()
                .map(|column| ColumnInfo::new(column.name(), decltype_oid(column.decl_type())))
                .collect::<Vec<_>>();
            (stmt.parameter_count(), columns)
        };
        if parameter_types.len() > parameter_count {
            return Err(EngineError::sql(
                sqlstate::PROTOCOL_VIOLATION,
                format!(
                    "statement declares {} parameter types but has {} placeholders",
                    parameter_types.len(),
                    parameter_count
                ),
            ));
        }
        let mut types = parameter_types.to_vec();
        types.resize(parameter_count, 0);

        let handle = self.allocate();
        self.statements.insert(
            handle,
            SqliteStatement {
                sql,
                parameter_types: types.clone(),
                autocommit_before: None,
            },
        );
        Ok((
            StatementHandle(handle),
            PreparedInfo {
                parameter_types: types
                    .iter()
                    .map(|oid| if *oid == 0 { TEXT_OID } else { *oid })
                    .collect(),
                columns,
            },
        ))
    }

    fn bind(
        &mut self,
        statement: StatementHandle,
        params: Vec<Option<String>>,
    ) -> Result<PortalHandle, EngineError> {
        let entry = self.statements.get(&statement.0).ok_or_else(|| {
            EngineError::sql(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                "prepared statement does not exist",
            )
        })?;
        if params.len() != entry.parameter_types.len() {
            return Err(EngineError::sql(
                sqlstate::PROTOCOL_VIOLATION,
                format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    params.len(),
                    entry.parameter_types.len()
                ),
            ));
        }
        let values = params
            .into_iter()
            .zip(entry.parameter_types.iter())
            .map(|(raw, oid)| bind_value(raw, *oid))
            .collect::<Result<Vec<_>, _>>()?;

        let handle = self.allocate();
        self.portals.insert(
            handle,
            SqlitePortal {
                statement,
                params: values,
                executed: None,
                rows: PortalRows::Buffered(VecDeque::new()),
            },
        );
        Ok(PortalHandle(handle))
    }

    fn execute(
        &mut self,
        portal: PortalHandle,
        max_rows: usize,
    ) -> Result<ExecuteOutcome, EngineError> {
        let entry = self.portals.get(&portal.0).ok_or_else(|| {
            EngineError::sql(sqlstate::INVALID_CURSOR_NAME, "portal does not exist")
        })?;
        if let Some(outcome) = entry.executed {
            return Ok(outcome);
        }
        let statement = entry.statement;
        let autocommit_before = self.conn.is_autocommit();
        let (outcome, rows) = self.run_portal(entry, max_rows)?;

        if let Some(stmt) = self.statements.get_mut(&statement.0) {
            stmt.autocommit_before = Some(autocommit_before);
        }
        if let Some(entry) = self.portals.get_mut(&portal.0) {
            entry.executed = Some(outcome);
            entry.rows = rows;
        }
        Ok(outcome)
    }

    fn fetch_row(&mut self, portal: PortalHandle) -> Result<Option<Row>, EngineError> {
        let entry = self.portals.get_mut(&portal.0).ok_or_else(|| {
            EngineError::sql(sqlstate::INVALID_CURSOR_NAME, "portal does not exist")
        })?;
        entry.rows.next()
    }

    fn has_pending_rows(&mut self, portal: PortalHandle) -> Result<bool, EngineError> {
        let entry = self.portals.get_mut(&portal.0).ok_or_else(|| {
            EngineError::sql(sqlstate::INVALID_CURSOR_NAME, "portal does not exist")
        })?;
        entry.rows.has_more()
    }

    fn complete(&mut self, statement: StatementHandle, success: bool) {
        let Some(entry) = self.statements.get_mut(&statement.0) else {
            return;
        };
        let autocommit_before = entry.autocommit_before.take();
        if success || autocommit_before != Some(true) || self.conn.is_autocommit() {
            return;
        }
        // a failed statement must not leave behind a transaction it opened itself
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %err, "rollback after failed statement did not complete");
        }
    }

    fn close_portal(&mut self, portal: PortalHandle) {
        self.portals.remove(&portal.0);
    }

    fn close_statement(&mut self, statement: StatementHandle) {
        self.statements.remove(&statement.0);
        self.portals
            .retain(|_, portal| portal.statement != statement);
    }

    fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::new(SqliteInterrupt(self.conn.get_interrupt_handle()))
    }
}

struct SqliteInterrupt(rusqlite::InterruptHandle);

impl InterruptHandle for SqliteInterrupt {
    fn interrupt(&self) {
        self.0.interrupt();
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| failure.to_string());
                match failure.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => EngineError::Busy,
                    ErrorCode::OperationInterrupted => EngineError::Interrupted,
                    ErrorCode::ConstraintViolation => {
                        EngineError::sql(sqlstate::INTEGRITY_CONSTRAINT_VIOLATION, message)
                    }
                    ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
                    | ErrorCode::ReadOnly
                    | ErrorCode::DatabaseCorrupt => EngineError::Io(message),
                    _ => EngineError::sql(classify_message(&message), message),
                }
            }
            rusqlite::Error::InvalidParameterCount(given, expected) => EngineError::sql(
                sqlstate::PROTOCOL_VIOLATION,
                format!("statement requires {expected} parameters, {given} supplied"),
            ),
            rusqlite::Error::MultipleStatement => EngineError::sql(
                sqlstate::SYNTAX_ERROR,
                "cannot insert multiple commands into a prepared statement",
            ),
            _ => EngineError::sql(sqlstate::INTERNAL_ERROR, err.to_string()),
        }
    }
}

fn classify_message(message: &str) -> &'static str {
    if message.contains("syntax error") || message.contains("incomplete input") {
        sqlstate::SYNTAX_ERROR
    } else if message.contains("no such table") {
        sqlstate::UNDEFINED_TABLE
    } else {
        sqlstate::INTERNAL_ERROR
    }
}

fn decltype_oid(decltype: Option<&str>) -> u32 {
    let Some(decltype) = decltype else {
        return TEXT_OID;
    };
    let upper = decltype.to_ascii_uppercase();
    if upper.contains("INT") {
        INT8_OID
    } else if upper.contains("BOOL") {
        BOOL_OID
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        FLOAT8_OID
    } else if upper.contains("BLOB") || upper.contains("BYTEA") {
        BYTEA_OID
    } else {
        TEXT_OID
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("\\x");
            for byte in bytes {
                out.push_str(&format!("{byte:02x}"));
            }
            Some(out)
        }
    }
}

fn bind_value(raw: Option<String>, type_oid: u32) -> Result<Value, EngineError> {
    let Some(text) = raw else {
        return Ok(Value::Null);
    };
    let invalid = |kind: &str, text: &str| {
        EngineError::sql(
            sqlstate::INVALID_TEXT_REPRESENTATION,
            format!("invalid input syntax for type {kind}: \"{text}\""),
        )
    };
    match type_oid {
        20 | 21 | 23 => text
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer", &text)),
        700 | 701 | 1700 => text
            .trim()
            .parse::<f64>()
            .map(Value::Real)
            .map_err(|_| invalid("double precision", &text)),
        BOOL_OID => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "on" | "y" => Ok(Value::Integer(1)),
            "f" | "false" | "0" | "no" | "off" | "n" => Ok(Value::Integer(0)),
            _ => Err(invalid("boolean", &text)),
        },
        0 => match text.parse::<i64>() {
            // untyped parameters that are canonical integers bind as integers
            Ok(v) if v.to_string() == text => Ok(Value::Integer(v)),
            _ => Ok(Value::Text(text)),
        },
        _ => Ok(Value::Text(text)),
    }
}

/// Rewrites `$N` placeholders to SQLite's `?N`, leaving quoted text and
/// comments untouched.
pub fn rewrite_placeholders(sql: &str) -> Cow<'_, str> {
    if !sql.contains('$') {
        return Cow::Borrowed(sql);
    }
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut start = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                out.push_str(&sql[start..i]);
                out.push('?');
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[start.min(sql.len())..]);
    Cow::Owned(out)
}
