//! Suspendable units of work.
//!
//! A task owns everything needed to resume a statement that could not finish
//! in one go: contention on the database (retried later from the worker's
//! busy queue) or a client that stopped draining its socket while rows were
//! streaming. A connection holds at most one task; while it exists no further
//! input is decoded.

use std::collections::VecDeque;
use std::io;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::engine::{ColumnInfo, EngineError, ExecuteOutcome, PortalHandle, StatementHandle};
use crate::protocol::messages::encode_data_row;
use crate::protocol::{BackendMessage, sqlstate};
use crate::server::Services;
use crate::server::cancel::CancelHandle;
use crate::tcop::SessionError;
use crate::tcop::busy::BusyContext;
use crate::tcop::session::{PortalState, PreparedStatement, Session, row_description};
use crate::tcop::statement::Statement;

/// Where backend messages go. Implemented by the connection's socket buffer.
pub(crate) trait OutputSink {
    fn buffer(&mut self) -> &mut BytesMut;

    /// Writes as much of the buffer as the socket accepts. `Ok(false)` means
    /// bytes remain and the caller must wait for writability.
    fn flush(&mut self) -> io::Result<bool>;

    fn send(&mut self, message: &BackendMessage) {
        crate::protocol::messages::encode_backend_message(message, self.buffer());
    }
}

pub(crate) struct TaskCtx<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) out: &'a mut dyn OutputSink,
    pub(crate) services: &'a Services,
    pub(crate) cancel: &'a CancelHandle,
    pub(crate) now: Instant,
}

#[derive(Debug)]
pub(crate) enum StepError {
    /// Contention; retry the same step later.
    Busy,
    Failed(SessionError),
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        if err.is_transient() {
            Self::Busy
        } else {
            Self::Failed(err.into())
        }
    }
}

impl From<SessionError> for StepError {
    fn from(err: SessionError) -> Self {
        Self::Failed(err)
    }
}

#[derive(Debug)]
pub(crate) enum TaskPoll {
    Complete,
    /// Replace the current task and poll the new one straight away.
    Handoff(Task),
    /// Contention; poll again at the given instant.
    Deferred(Instant),
    /// Output is backed up; poll again once the socket is writable.
    AwaitWritable,
    Failed(SessionError),
}

#[derive(Debug)]
pub(crate) enum Task {
    Query(QueryTask),
    Write(WriteTask),
}

impl Task {
    pub(crate) fn simple_query(statements: Vec<Statement>) -> Self {
        Self::Query(QueryTask::new(QuerySource::Simple {
            pending: statements.into(),
            current: None,
        }))
    }

    pub(crate) fn parse(name: String, statement: Statement, parameter_types: Vec<u32>) -> Self {
        Self::Query(QueryTask::new(QuerySource::Parse {
            name,
            statement,
            parameter_types,
        }))
    }

    pub(crate) fn execute(portal: String, max_rows: usize) -> Self {
        Self::Query(QueryTask::new(QuerySource::Execute {
            portal,
            max_rows,
            adhoc: None,
        }))
    }

    /// Simple-query tasks end with ReadyForQuery, including on failure.
    pub(crate) fn is_simple(&self) -> bool {
        match self {
            Self::Query(task) => matches!(task.source, QuerySource::Simple { .. }),
            Self::Write(task) => matches!(task.source, RowSource::Simple(_)),
        }
    }

    pub(crate) fn poll(&mut self, ctx: &mut TaskCtx<'_>) -> io::Result<TaskPoll> {
        match self {
            Self::Query(task) => Ok(task.poll(ctx)),
            Self::Write(task) => task.poll(ctx),
        }
    }
}

/// A statement moving through prepare, bind and execute on its own handles.
#[derive(Debug)]
pub(crate) struct Running {
    statement: Statement,
    handle: Option<StatementHandle>,
    portal: Option<PortalHandle>,
    columns: Vec<ColumnInfo>,
}

impl Running {
    fn new(statement: Statement) -> Self {
        Self {
            statement,
            handle: None,
            portal: None,
            columns: Vec::new(),
        }
    }

    /// Each step is skipped once it has succeeded, so a retry after contention
    /// resumes where the previous attempt stopped.
    fn attempt(&mut self, ctx: &mut TaskCtx<'_>) -> Result<ExecuteOutcome, StepError> {
        let services = ctx.services;
        ctx.session.acquire(
            &self.statement,
            services.access.as_ref(),
            &services.write_locks,
        )?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let (handle, info) = ctx.session.executor.prepare(&self.statement.sql, &[])?;
                self.handle = Some(handle);
                self.columns = info.columns;
                handle
            }
        };
        let portal = match self.portal {
            Some(portal) => portal,
            None => {
                let portal = ctx.session.executor.bind(handle, Vec::new())?;
                self.portal = Some(portal);
                portal
            }
        };
        Ok(ctx.session.executor.execute(portal, 0)?)
    }

    fn release(&mut self, session: &mut Session) {
        if let Some(portal) = self.portal.take() {
            session.executor.close_portal(portal);
        }
        if let Some(handle) = self.handle.take() {
            session.executor.close_statement(handle);
        }
    }
}

#[derive(Debug)]
pub(crate) enum QuerySource {
    Simple {
        pending: VecDeque<Statement>,
        current: Option<Running>,
    },
    Parse {
        name: String,
        statement: Statement,
        parameter_types: Vec<u32>,
    },
    Execute {
        portal: String,
        max_rows: usize,
        /// Statement run in place of the portal's own, e.g. the ROLLBACK
        /// that stands in for COMMIT in a failed block.
        adhoc: Option<Running>,
    },
}

#[derive(Debug)]
pub(crate) struct QueryTask {
    source: QuerySource,
    busy: Option<BusyContext>,
}

impl QueryTask {
    fn new(source: QuerySource) -> Self {
        Self { source, busy: None }
    }

    fn poll(&mut self, ctx: &mut TaskCtx<'_>) -> TaskPoll {
        // a statement that is not waiting out contention is interrupted by
        // the engine instead
        if self.busy.as_mut().is_some_and(|busy| busy.take_cancel(ctx.cancel)) {
            return self.fail(ctx, SessionError::canceled());
        }
        ctx.cancel.enter_running();

        let result = match &mut self.source {
            QuerySource::Simple { pending, current } => poll_simple(ctx, pending, current),
            QuerySource::Parse {
                name,
                statement,
                parameter_types,
            } => poll_parse(ctx, name, statement, parameter_types),
            QuerySource::Execute {
                portal,
                max_rows,
                adhoc,
            } => poll_execute(ctx, portal, *max_rows, adhoc),
        };

        match result {
            Ok(poll) => {
                if let (Some(busy), TaskPoll::Complete | TaskPoll::Handoff(_)) = (&self.busy, &poll) {
                    debug!(
                        attempts = busy.attempts(),
                        waited_ms = busy.waited(ctx.now).as_millis() as u64,
                        "statement proceeded after contention"
                    );
                }
                if matches!(poll, TaskPoll::Complete | TaskPoll::Handoff(_)) {
                    self.busy = None;
                }
                poll
            }
            Err(StepError::Busy) => self.on_busy(ctx),
            Err(StepError::Failed(err)) => self.fail(ctx, err),
        }
    }

    fn on_busy(&mut self, ctx: &mut TaskCtx<'_>) -> TaskPoll {
        let services = ctx.services;
        let config = &services.config;
        let busy = match self.busy.as_mut() {
            Some(busy) => {
                busy.record_attempt();
                busy
            }
            None => self
                .busy
                .insert(BusyContext::new(ctx.now, config.busy_deadline())),
        };
        if busy.take_cancel(ctx.cancel) {
            return self.fail(ctx, SessionError::canceled());
        }
        if busy.expired(ctx.now) {
            let attempts = busy.attempts();
            let waited = busy.waited(ctx.now);
            warn!(
                conn_id = ctx.session.conn_id,
                user = ctx.session.user(),
                database = ctx.session.database(),
                attempts,
                waited_ms = waited.as_millis() as u64,
                "giving up on contended statement"
            );
            let err = SessionError::busy_timeout(ctx.session.database()).with_detail(format!(
                "gave up after {attempts} attempts over {} ms",
                waited.as_millis()
            ));
            return self.fail(ctx, err);
        }
        let at = busy.next_attempt(ctx.now, config.busy_retry_interval);
        ctx.cancel.enter_busy_wait();
        TaskPoll::Deferred(at)
    }

    /// Marks the statement failed and releases whatever it held. The
    /// remainder of a simple query is dropped.
    fn fail(&mut self, ctx: &mut TaskCtx<'_>, err: SessionError) -> TaskPoll {
        self.busy = None;
        let services = ctx.services;
        let locks = &services.write_locks;
        match &mut self.source {
            QuerySource::Simple { pending, current } => {
                pending.clear();
                if let Some(mut running) = current.take() {
                    ctx.session
                        .conclude(&running.statement, running.handle, false, locks);
                    running.release(ctx.session);
                } else {
                    ctx.session.txn.mark_failed();
                }
            }
            QuerySource::Parse { statement, .. } => {
                let statement = statement.clone();
                ctx.session.conclude(&statement, None, false, locks);
            }
            QuerySource::Execute { portal, adhoc, .. } => {
                if let Some(mut running) = adhoc.take() {
                    ctx.session
                        .conclude(&running.statement, running.handle, false, locks);
                    running.release(ctx.session);
                } else if let Some(entry) = ctx.session.portals.get(portal.as_str()) {
                    let statement = entry.statement.clone();
                    let handle = entry.statement_handle;
                    ctx.session.conclude(&statement, handle, false, locks);
                } else {
                    ctx.session.txn.mark_failed();
                }
            }
        }
        TaskPoll::Failed(err)
    }
}

fn poll_simple(
    ctx: &mut TaskCtx<'_>,
    pending: &mut VecDeque<Statement>,
    current: &mut Option<Running>,
) -> Result<TaskPoll, StepError> {
    let services = ctx.services;
    loop {
        if current.is_none() {
            match pending.pop_front() {
                Some(statement) => *current = Some(Running::new(ctx.session.admit(statement)?)),
                None => {
                    ctx.out.send(&BackendMessage::ReadyForQuery {
                        status: ctx.session.txn.status(),
                    });
                    return Ok(TaskPoll::Complete);
                }
            }
        }
        let Some(running) = current.as_mut() else {
            continue;
        };
        let outcome = running.attempt(ctx)?;
        let Some(mut running) = current.take() else {
            continue;
        };

        if outcome.has_result_set {
            ctx.out.send(&BackendMessage::RowDescription {
                fields: row_description(&running.columns),
            });
            let rest = QueryTask::new(QuerySource::Simple {
                pending: std::mem::take(pending),
                current: None,
            });
            return Ok(TaskPoll::Handoff(Task::Write(WriteTask {
                source: RowSource::Simple(running),
                max_rows: 0,
                sent: 0,
                then: Some(rest),
            })));
        }

        ctx.out.send(&BackendMessage::command_complete(
            &running.statement.tag,
            outcome.update_count,
        ));
        ctx.session
            .conclude(&running.statement, running.handle, true, &services.write_locks);
        running.release(ctx.session);
    }
}

fn poll_parse(
    ctx: &mut TaskCtx<'_>,
    name: &str,
    statement: &Statement,
    parameter_types: &[u32],
) -> Result<TaskPoll, StepError> {
    ctx.session.check_statement_name(name)?;
    if statement.sql.trim().is_empty() {
        ctx.session.statements.insert(
            name.to_string(),
            PreparedStatement {
                statement: statement.clone(),
                handle: None,
                info: Default::default(),
            },
        );
        ctx.out.send(&BackendMessage::ParseComplete);
        return Ok(TaskPoll::Complete);
    }
    ctx.session.admit(statement.clone())?;

    let (handle, info) = ctx
        .session
        .executor
        .prepare(&statement.sql, parameter_types)?;
    ctx.session.statements.insert(
        name.to_string(),
        PreparedStatement {
            statement: statement.clone(),
            handle: Some(handle),
            info,
        },
    );
    ctx.out.send(&BackendMessage::ParseComplete);
    Ok(TaskPoll::Complete)
}

fn poll_execute(
    ctx: &mut TaskCtx<'_>,
    name: &str,
    max_rows: usize,
    adhoc: &mut Option<Running>,
) -> Result<TaskPoll, StepError> {
    let Some(portal) = ctx.session.portals.get(name) else {
        return Err(SessionError::new(
            sqlstate::INVALID_CURSOR_NAME,
            format!("portal \"{name}\" does not exist"),
        )
        .into());
    };
    match portal.state {
        PortalState::Streaming => {
            return Ok(TaskPoll::Handoff(Task::Write(WriteTask {
                source: RowSource::Portal(name.to_string()),
                max_rows,
                sent: 0,
                then: None,
            })));
        }
        PortalState::Done => {
            ctx.out
                .send(&BackendMessage::command_complete(&portal.statement.tag, 0));
            return Ok(TaskPoll::Complete);
        }
        PortalState::Ready => {}
    }
    let Some(handle) = portal.handle else {
        ctx.out.send(&BackendMessage::EmptyQueryResponse);
        return Ok(TaskPoll::Complete);
    };
    let statement = portal.statement.clone();
    let statement_handle = portal.statement_handle;

    if adhoc.is_none() {
        let admitted = ctx.session.admit(statement.clone())?;
        if admitted.class != statement.class {
            *adhoc = Some(Running::new(admitted));
        }
    }
    let services = ctx.services;
    if let Some(running) = adhoc {
        running.attempt(ctx)?;
        if let Some(mut running) = adhoc.take() {
            ctx.out
                .send(&BackendMessage::command_complete(&running.statement.tag, 0));
            ctx.session
                .conclude(&running.statement, running.handle, true, &services.write_locks);
            running.release(ctx.session);
        }
        if let Some(portal) = ctx.session.portals.get_mut(name) {
            portal.state = PortalState::Done;
        }
        return Ok(TaskPoll::Complete);
    }

    ctx.session.acquire(
        &statement,
        services.access.as_ref(),
        &services.write_locks,
    )?;
    let outcome = ctx.session.executor.execute(handle, max_rows)?;
    if outcome.has_result_set {
        if let Some(portal) = ctx.session.portals.get_mut(name) {
            portal.state = PortalState::Streaming;
        }
        return Ok(TaskPoll::Handoff(Task::Write(WriteTask {
            source: RowSource::Portal(name.to_string()),
            max_rows,
            sent: 0,
            then: None,
        })));
    }

    ctx.out.send(&BackendMessage::command_complete(
        &statement.tag,
        outcome.update_count,
    ));
    if let Some(portal) = ctx.session.portals.get_mut(name) {
        portal.state = PortalState::Done;
    }
    ctx.session
        .conclude(&statement, statement_handle, true, &services.write_locks);
    Ok(TaskPoll::Complete)
}

#[derive(Debug)]
pub(crate) enum RowSource {
    /// Handles owned by the task, closed once the rows are drained.
    Simple(Running),
    Portal(String),
}

/// Streams DataRows of an executed statement, pausing whenever the socket
/// stops accepting bytes.
#[derive(Debug)]
pub(crate) struct WriteTask {
    source: RowSource,
    /// Zero streams everything.
    max_rows: usize,
    sent: u64,
    /// Work queued behind this result, the rest of a simple query.
    then: Option<QueryTask>,
}

impl WriteTask {
    fn portal_handles(&self, session: &Session) -> Option<(PortalHandle, Statement, Option<StatementHandle>)> {
        match &self.source {
            RowSource::Simple(running) => running
                .portal
                .map(|portal| (portal, running.statement.clone(), running.handle)),
            RowSource::Portal(name) => session.portals.get(name).and_then(|portal| {
                portal
                    .handle
                    .map(|handle| (handle, portal.statement.clone(), portal.statement_handle))
            }),
        }
    }

    fn poll(&mut self, ctx: &mut TaskCtx<'_>) -> io::Result<TaskPoll> {
        let Some((portal, statement, statement_handle)) = self.portal_handles(ctx.session) else {
            return Ok(TaskPoll::Failed(SessionError::new(
                sqlstate::INVALID_CURSOR_NAME,
                "portal was closed while rows were pending",
            )));
        };
        let chunk = ctx.services.config.write_chunk_size;

        loop {
            if self.max_rows > 0 && self.sent >= self.max_rows as u64 {
                // an exactly drained portal completes instead of suspending
                match ctx.session.executor.has_pending_rows(portal) {
                    Ok(true) => {
                        ctx.out.send(&BackendMessage::PortalSuspended);
                        return Ok(TaskPoll::Complete);
                    }
                    Ok(false) => break,
                    Err(err) => {
                        self.finish(ctx, &statement, statement_handle, false);
                        return Ok(TaskPoll::Failed(err.into()));
                    }
                }
            }
            match ctx.session.executor.fetch_row(portal) {
                Ok(Some(row)) => {
                    encode_data_row(&row, ctx.out.buffer());
                    self.sent += 1;
                    if ctx.out.buffer().len() >= chunk && !ctx.out.flush()? {
                        return Ok(TaskPoll::AwaitWritable);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.finish(ctx, &statement, statement_handle, false);
                    return Ok(TaskPoll::Failed(err.into()));
                }
            }
        }

        ctx.out
            .send(&BackendMessage::command_complete(&statement.tag, self.sent));
        self.finish(ctx, &statement, statement_handle, true);
        Ok(match self.then.take() {
            Some(next) => TaskPoll::Handoff(Task::Query(next)),
            None => TaskPoll::Complete,
        })
    }

    fn finish(
        &mut self,
        ctx: &mut TaskCtx<'_>,
        statement: &Statement,
        statement_handle: Option<StatementHandle>,
        success: bool,
    ) {
        let services = ctx.services;
        ctx.session
            .conclude(statement, statement_handle, success, &services.write_locks);
        match &mut self.source {
            RowSource::Simple(running) => running.release(ctx.session),
            RowSource::Portal(name) => {
                if let Some(portal) = ctx.session.portals.get_mut(name.as_str()) {
                    portal.state = PortalState::Done;
                }
            }
        }
    }
}
