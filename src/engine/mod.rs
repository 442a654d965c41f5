//! Statement executor seam between the connection state machine and the
//! embedded storage engine.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::sqlstate;

pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use sqlite::{SqliteExecutor, SqliteExecutorFactory};

/// One result row in text format; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

pub const TEXT_OID: u32 = 25;
pub const INT8_OID: u32 = 20;
pub const FLOAT8_OID: u32 = 701;
pub const BOOL_OID: u32 = 16;
pub const BYTEA_OID: u32 = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Transient contention; the operation may succeed if retried.
    #[error("database is locked")]
    Busy,
    #[error("statement was interrupted")]
    Interrupted,
    #[error("{message}")]
    Sql { code: &'static str, message: String },
    #[error("storage I/O failure: {0}")]
    Io(String),
}

impl EngineError {
    pub fn sql(code: &'static str, message: impl Into<String>) -> Self {
        Self::Sql {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            Self::Busy => sqlstate::LOCK_NOT_AVAILABLE,
            Self::Interrupted => sqlstate::QUERY_CANCELED,
            Self::Sql { code, .. } => code,
            Self::Io(_) => sqlstate::IO_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub type_size: i16,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        let type_size = match type_oid {
            INT8_OID | FLOAT8_OID => 8,
            BOOL_OID => 1,
            _ => -1,
        };
        Self {
            name: name.into(),
            type_oid,
            type_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortalHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreparedInfo {
    pub parameter_types: Vec<u32>,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteOutcome {
    pub has_result_set: bool,
    pub update_count: u64,
}

/// Aborts an in-flight engine call from another thread.
pub trait InterruptHandle: Send + Sync {
    fn interrupt(&self);
}

/// Per-connection access to one logical database.
///
/// Every method may report [`EngineError::Busy`]; callers treat that as a
/// request to retry the same call later, so implementations must leave the
/// handle in a state where the retry is valid.
pub trait StatementExecutor: Send {
    fn prepare(
        &mut self,
        sql: &str,
        parameter_types: &[u32],
    ) -> Result<(StatementHandle, PreparedInfo), EngineError>;

    fn bind(
        &mut self,
        statement: StatementHandle,
        params: Vec<Option<String>>,
    ) -> Result<PortalHandle, EngineError>;

    /// Runs the portal. `max_rows` of zero means the caller will fetch
    /// everything.
    fn execute(&mut self, portal: PortalHandle, max_rows: usize)
    -> Result<ExecuteOutcome, EngineError>;

    fn fetch_row(&mut self, portal: PortalHandle) -> Result<Option<Row>, EngineError>;

    /// Whether the next `fetch_row` would yield a row. Consumes nothing.
    fn has_pending_rows(&mut self, portal: PortalHandle) -> Result<bool, EngineError>;

    /// Transaction boundary hook, called once per executed statement.
    fn complete(&mut self, statement: StatementHandle, success: bool);

    fn close_portal(&mut self, portal: PortalHandle);

    fn close_statement(&mut self, statement: StatementHandle);

    fn is_autocommit(&self) -> bool;

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;
}

pub trait ExecutorFactory: Send + Sync {
    fn open(&self, database: &str) -> Result<Box<dyn StatementExecutor>, EngineError>;
}
