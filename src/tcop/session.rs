use std::collections::HashMap;

use tracing::debug;

use crate::engine::{ColumnInfo, PortalHandle, PreparedInfo, StatementExecutor, StatementHandle};
use crate::protocol::{RowDescriptionField, sqlstate};
use crate::security::AccessControl;
use crate::tcop::SessionError;
use crate::tcop::statement::{Statement, StatementClass};
use crate::tcop::task::StepError;
use crate::txn::{HolderId, TransactionState, WriteLockRegistry};

pub(crate) struct PreparedStatement {
    pub(crate) statement: Statement,
    /// `None` for an empty query string.
    pub(crate) handle: Option<StatementHandle>,
    pub(crate) info: PreparedInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortalState {
    Ready,
    /// Rows remain after a PortalSuspended.
    Streaming,
    Done,
}

pub(crate) struct Portal {
    pub(crate) statement_name: String,
    pub(crate) statement: Statement,
    pub(crate) statement_handle: Option<StatementHandle>,
    pub(crate) handle: Option<PortalHandle>,
    pub(crate) columns: Vec<ColumnInfo>,
    pub(crate) state: PortalState,
}

/// State of an authenticated connection bound to one logical database.
pub struct Session {
    pub(crate) user: String,
    pub(crate) database: String,
    pub(crate) conn_id: HolderId,
    pub(crate) executor: Box<dyn StatementExecutor>,
    pub(crate) statements: HashMap<String, PreparedStatement>,
    pub(crate) portals: HashMap<String, Portal>,
    pub(crate) txn: TransactionState,
    pub(crate) holds_write_lock: bool,
}

impl Session {
    pub fn new(
        user: String,
        database: String,
        conn_id: HolderId,
        executor: Box<dyn StatementExecutor>,
    ) -> Self {
        Self {
            user,
            database,
            conn_id,
            executor,
            statements: HashMap::new(),
            portals: HashMap::new(),
            txn: TransactionState::default(),
            holds_write_lock: false,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Gate applied before a statement runs at all. Inside a failed block
    /// only transaction exits pass, and COMMIT turns into ROLLBACK.
    pub(crate) fn admit(&self, statement: Statement) -> Result<Statement, SessionError> {
        if !self.txn.is_aborted() {
            return Ok(statement);
        }
        match statement.class {
            StatementClass::Commit => Ok(Statement::new("ROLLBACK")),
            class if class.allowed_in_failed_block() => Ok(statement),
            _ => Err(SessionError::in_failed_transaction()),
        }
    }

    /// Privilege check plus write-lock acquisition. A lock held by another
    /// connection is contention, retried like an engine busy result.
    pub(crate) fn acquire(
        &mut self,
        statement: &Statement,
        access: &dyn AccessControl,
        locks: &WriteLockRegistry,
    ) -> Result<(), StepError> {
        let privilege = statement.class.privilege();
        if !access.has_privilege(&self.user, &self.database, privilege) {
            return Err(StepError::Failed(SessionError::new(
                sqlstate::INSUFFICIENT_PRIVILEGE,
                format!("permission denied for database {}", self.database),
            )));
        }
        if !statement.class.needs_write_lock() || self.holds_write_lock {
            return Ok(());
        }
        match locks.try_acquire(&self.database, self.conn_id) {
            Ok(()) => {
                self.holds_write_lock = true;
                debug!(conn_id = self.conn_id, database = %self.database, "write lock acquired");
                Ok(())
            }
            Err(holder) => {
                debug!(
                    conn_id = self.conn_id,
                    database = %self.database,
                    holder,
                    "write lock held by another connection"
                );
                Err(StepError::Busy)
            }
        }
    }

    /// Transaction-boundary bookkeeping after a statement ran (or failed).
    /// The write lock is dropped once the engine is back in autocommit.
    pub(crate) fn conclude(
        &mut self,
        statement: &Statement,
        handle: Option<StatementHandle>,
        success: bool,
        locks: &WriteLockRegistry,
    ) {
        if let Some(handle) = handle {
            self.executor.complete(handle, success);
        }
        if success {
            match statement.class {
                StatementClass::Begin { .. } => self.txn.begin(),
                StatementClass::Commit => {
                    self.txn.commit();
                }
                StatementClass::Rollback => self.txn.rollback(),
                StatementClass::Savepoint => self.txn.savepoint(savepoint_name(&statement.sql)),
                StatementClass::Release => {
                    self.txn.release_savepoint(savepoint_name(&statement.sql));
                }
                StatementClass::RollbackTo => {
                    self.txn.rollback_to_savepoint(savepoint_name(&statement.sql));
                }
                _ => {}
            }
        } else {
            self.txn.mark_failed();
        }

        let autocommit = self.executor.is_autocommit();
        self.txn.sync_with_engine(autocommit);
        if autocommit && self.holds_write_lock {
            self.release_write_lock(locks);
        }
    }

    pub(crate) fn release_write_lock(&mut self, locks: &WriteLockRegistry) {
        if locks.release(&self.database, self.conn_id) {
            debug!(conn_id = self.conn_id, database = %self.database, "write lock released");
        }
        self.holds_write_lock = false;
    }

    /// Replaces the unnamed statement; a named one must not exist yet.
    pub(crate) fn check_statement_name(&mut self, name: &str) -> Result<(), SessionError> {
        if name.is_empty() {
            self.close_statement(name);
            return Ok(());
        }
        if self.statements.contains_key(name) {
            return Err(SessionError::new(
                sqlstate::DUPLICATE_PREPARED_STATEMENT,
                format!("prepared statement \"{name}\" already exists"),
            ));
        }
        Ok(())
    }

    pub(crate) fn close_statement(&mut self, name: &str) {
        if let Some(prepared) = self.statements.remove(name) {
            if let Some(handle) = prepared.handle {
                self.executor.close_statement(handle);
            }
            self.portals
                .retain(|_, portal| portal.statement_name != name);
        }
    }

    pub(crate) fn close_portal(&mut self, name: &str) {
        if let Some(portal) = self.portals.remove(name) {
            if let Some(handle) = portal.handle {
                self.executor.close_portal(handle);
            }
        }
    }

    pub(crate) fn bind(
        &mut self,
        portal_name: &str,
        statement_name: &str,
        params: Vec<Option<String>>,
    ) -> Result<(), SessionError> {
        let prepared = self.statements.get(statement_name).ok_or_else(|| {
            SessionError::new(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                format!("prepared statement \"{statement_name}\" does not exist"),
            )
        })?;
        let statement = self.admit(prepared.statement.clone())?;
        let statement_handle = prepared.handle;
        let columns = prepared.info.columns.clone();

        if portal_name.is_empty() {
            self.close_portal(portal_name);
        } else if self.portals.contains_key(portal_name) {
            return Err(SessionError::new(
                sqlstate::DUPLICATE_CURSOR,
                format!("portal \"{portal_name}\" already exists"),
            ));
        }

        let handle = match statement_handle {
            Some(stmt) => Some(self.executor.bind(stmt, params)?),
            None => None,
        };
        self.portals.insert(
            portal_name.to_string(),
            Portal {
                statement_name: statement_name.to_string(),
                statement,
                statement_handle,
                handle,
                columns,
                state: PortalState::Ready,
            },
        );
        Ok(())
    }
}

pub(crate) fn row_description(columns: &[ColumnInfo]) -> Vec<RowDescriptionField> {
    columns
        .iter()
        .map(|column| RowDescriptionField::text(&column.name, column.type_oid, column.type_size))
        .collect()
}

fn savepoint_name(sql: &str) -> &str {
    sql.split_whitespace()
        .last()
        .unwrap_or_default()
        .trim_end_matches(';')
        .trim_matches('"')
}
