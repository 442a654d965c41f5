//! Scripted executor for exercising the connection state machine without a
//! storage engine. Results, contention and failures are configured per SQL
//! text; executors opened from one `ScriptedEngine` share its script.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::engine::{
    ColumnInfo, EngineError, ExecuteOutcome, ExecutorFactory, INT8_OID, InterruptHandle,
    PortalHandle, PreparedInfo, Row, StatementExecutor, StatementHandle, TEXT_OID,
};
use crate::protocol::sqlstate;

#[derive(Default)]
struct Script {
    results: HashMap<String, (Vec<ColumnInfo>, Vec<Row>)>,
    busy_execute: HashMap<String, Option<usize>>,
    busy_prepare: HashMap<String, Option<usize>>,
    execute_errors: HashMap<String, EngineError>,
    executed: Vec<String>,
    attempts: HashMap<String, usize>,
}

fn take_busy(map: &mut HashMap<String, Option<usize>>, sql: &str) -> bool {
    match map.get_mut(sql) {
        None => false,
        Some(None) => true,
        Some(Some(0)) => {
            map.remove(sql);
            false
        }
        Some(Some(remaining)) => {
            *remaining -= 1;
            true
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    interrupts: Arc<ScriptedInterrupt>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_rows(&self, sql: &str, columns: &[&str], rows: Vec<Row>) {
        let columns = columns
            .iter()
            .map(|name| ColumnInfo::new(*name, TEXT_OID))
            .collect();
        self.script
            .lock()
            .results
            .insert(sql.to_string(), (columns, rows));
    }

    /// The next `times` executions of `sql` report contention.
    pub(crate) fn fail_busy(&self, sql: &str, times: usize) {
        self.script
            .lock()
            .busy_execute
            .insert(sql.to_string(), Some(times));
    }

    pub(crate) fn busy_forever(&self, sql: &str) {
        self.script.lock().busy_execute.insert(sql.to_string(), None);
    }

    pub(crate) fn clear_busy(&self, sql: &str) {
        self.script.lock().busy_execute.remove(sql);
    }

    pub(crate) fn fail_busy_prepare(&self, sql: &str, times: usize) {
        self.script
            .lock()
            .busy_prepare
            .insert(sql.to_string(), Some(times));
    }

    pub(crate) fn fail_execute(&self, sql: &str, error: EngineError) {
        self.script
            .lock()
            .execute_errors
            .insert(sql.to_string(), error);
    }

    /// Statements that executed successfully, in order.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.script.lock().executed.clone()
    }

    pub(crate) fn attempts(&self, sql: &str) -> usize {
        self.script.lock().attempts.get(sql).copied().unwrap_or(0)
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.count.load(Ordering::SeqCst)
    }

    pub(crate) fn executor(&self) -> ScriptedExecutor {
        ScriptedExecutor {
            engine: self.clone(),
            statements: HashMap::new(),
            portals: HashMap::new(),
            autocommit: true,
            next_handle: 1,
        }
    }
}

impl ExecutorFactory for ScriptedEngine {
    fn open(&self, _database: &str) -> Result<Box<dyn StatementExecutor>, EngineError> {
        Ok(Box::new(self.executor()))
    }
}

#[derive(Default)]
struct ScriptedInterrupt {
    count: AtomicUsize,
}

impl InterruptHandle for ScriptedInterrupt {
    fn interrupt(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedPortal {
    statement: StatementHandle,
    outcome: Option<ExecuteOutcome>,
    rows: VecDeque<Row>,
}

pub(crate) struct ScriptedExecutor {
    engine: ScriptedEngine,
    statements: HashMap<u64, (String, PreparedInfo)>,
    portals: HashMap<u64, ScriptedPortal>,
    autocommit: bool,
    next_handle: u64,
}

impl ScriptedExecutor {
    fn allocate(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn result_for(&self, sql: &str) -> (Vec<ColumnInfo>, Option<Vec<Row>>) {
        if let Some((columns, rows)) = self.engine.script.lock().results.get(sql) {
            return (columns.clone(), Some(rows.clone()));
        }
        let upper = sql.trim().to_ascii_uppercase();
        if let Some(literal) = upper.strip_prefix("SELECT ") {
            if let Ok(value) = literal.trim().parse::<i64>() {
                return (
                    vec![ColumnInfo::new("?column?", INT8_OID)],
                    Some(vec![vec![Some(value.to_string())]]),
                );
            }
        }
        (Vec::new(), None)
    }
}

impl StatementExecutor for ScriptedExecutor {
    fn prepare(
        &mut self,
        sql: &str,
        parameter_types: &[u32],
    ) -> Result<(StatementHandle, PreparedInfo), EngineError> {
        if take_busy(&mut self.engine.script.lock().busy_prepare, sql) {
            return Err(EngineError::Busy);
        }
        if sql.to_ascii_uppercase().starts_with("SELEC ") {
            return Err(EngineError::sql(
                sqlstate::SYNTAX_ERROR,
                "syntax error at or near \"SELEC\"",
            ));
        }
        let (columns, _) = self.result_for(sql);
        let info = PreparedInfo {
            parameter_types: parameter_types.to_vec(),
            columns,
        };
        let handle = self.allocate();
        self.statements
            .insert(handle, (sql.to_string(), info.clone()));
        Ok((StatementHandle(handle), info))
    }

    fn bind(
        &mut self,
        statement: StatementHandle,
        _params: Vec<Option<String>>,
    ) -> Result<PortalHandle, EngineError> {
        if !self.statements.contains_key(&statement.0) {
            return Err(EngineError::sql(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                "prepared statement does not exist",
            ));
        }
        let handle = self.allocate();
        self.portals.insert(
            handle,
            ScriptedPortal {
                statement,
                outcome: None,
                rows: VecDeque::new(),
            },
        );
        Ok(PortalHandle(handle))
    }

    fn execute(
        &mut self,
        portal: PortalHandle,
        _max_rows: usize,
    ) -> Result<ExecuteOutcome, EngineError> {
        let entry = self.portals.get(&portal.0).ok_or_else(|| {
            EngineError::sql(sqlstate::INVALID_CURSOR_NAME, "portal does not exist")
        })?;
        if let Some(outcome) = entry.outcome {
            return Ok(outcome);
        }
        let sql = self
            .statements
            .get(&entry.statement.0)
            .map(|(sql, _)| sql.clone())
            .unwrap_or_default();

        {
            let mut script = self.engine.script.lock();
            *script.attempts.entry(sql.clone()).or_insert(0) += 1;
            if take_busy(&mut script.busy_execute, &sql) {
                return Err(EngineError::Busy);
            }
            if let Some(error) = script.execute_errors.get(&sql) {
                return Err(error.clone());
            }
            script.executed.push(sql.clone());
        }

        let upper = sql.trim().to_ascii_uppercase();
        if upper.starts_with("BEGIN") || upper.starts_with("START") {
            self.autocommit = false;
        } else if upper.starts_with("COMMIT")
            || upper.starts_with("END")
            || (upper.starts_with("ROLLBACK") && !upper.contains(" TO "))
        {
            self.autocommit = true;
        }

        let (_, rows) = self.result_for(&sql);
        let outcome = match rows {
            Some(rows) => {
                let outcome = ExecuteOutcome {
                    has_result_set: true,
                    update_count: rows.len() as u64,
                };
                if let Some(entry) = self.portals.get_mut(&portal.0) {
                    entry.rows = rows.into();
                }
                outcome
            }
            None => ExecuteOutcome {
                has_result_set: false,
                update_count: u64::from(
                    upper.starts_with("INSERT")
                        || upper.starts_with("UPDATE")
                        || upper.starts_with("DELETE"),
                ),
            },
        };
        if let Some(entry) = self.portals.get_mut(&portal.0) {
            entry.outcome = Some(outcome);
        }
        Ok(outcome)
    }

    fn fetch_row(&mut self, portal: PortalHandle) -> Result<Option<Row>, EngineError> {
        Ok(self
            .portals
            .get_mut(&portal.0)
            .and_then(|entry| entry.rows.pop_front()))
    }

    fn has_pending_rows(&mut self, portal: PortalHandle) -> Result<bool, EngineError> {
        Ok(self
            .portals
            .get(&portal.0)
            .is_some_and(|entry| !entry.rows.is_empty()))
    }

    fn complete(&mut self, _statement: StatementHandle, _success: bool) {}

    fn close_portal(&mut self, portal: PortalHandle) {
        self.portals.remove(&portal.0);
    }

    fn close_statement(&mut self, statement: StatementHandle) {
        self.statements.remove(&statement.0);
        self.portals.retain(|_, portal| portal.statement != statement);
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.engine.interrupts.clone()
    }
}
