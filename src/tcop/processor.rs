//! Per-connection protocol state machine.
//!
//! A [`Connection`] is driven entirely by its worker: readiness events,
//! busy-retry deadlines and the handshake timer all funnel into a handful of
//! entry points. Input is decoded one frame at a time and dispatched in
//! arrival order. Anything that may have to wait runs as a [`Task`]; while a
//! task is active the connection does not decode further input.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::messages::{decode_frontend_message, decode_startup_action};
use crate::protocol::startup::is_valid_database_name;
use crate::protocol::{
    BackendMessage, Frame, FrameDecoder, FrontendMessage, ProtocolError, ReadyForQueryStatus,
    StartupAction, StartupPacket, sqlstate,
};
use crate::security::{AuthExchange, AuthStatus, CommandClass};
use crate::server::cancel::CancelHandle;
use crate::server::{ConnectionPermit, Services};
use crate::tcop::SessionError;
use crate::tcop::session::{Session, row_description};
use crate::tcop::statement::{Statement, split_statements};
use crate::tcop::task::{OutputSink, Task, TaskCtx, TaskPoll};

const READ_CHUNK: usize = 8 * 1024;
const SERVER_VERSION: &str = "16.0";

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Rejected(SessionError),
    #[error("a task is already active on this connection")]
    TaskConflict,
}

/// What the owning worker needs to know after driving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStatus {
    pub closed: bool,
    /// Set while a task waits out contention.
    pub retry_at: Option<Instant>,
}

struct Outbound<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: Write> OutputSink for Outbound<S> {
    fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    fn flush(&mut self) -> io::Result<bool> {
        while !self.buf.is_empty() {
            match self.stream.write(&self.buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()?;
        Ok(true)
    }
}

enum Phase {
    Startup,
    Authenticating {
        exchange: AuthExchange,
        user: String,
        database: String,
        application_name: Option<String>,
    },
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    None,
    Writable,
    Retry(Instant),
}

pub struct Connection<S> {
    id: u32,
    peer: IpAddr,
    io: Outbound<S>,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    services: Arc<Services>,
    phase: Phase,
    session: Option<Session>,
    task: Option<Task>,
    wait: Wait,
    discard_until_sync: bool,
    flush_pending: bool,
    cancel: Arc<CancelHandle>,
    opened_at: Instant,
    closed: bool,
    _permit: ConnectionPermit,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, peer: IpAddr, permit: ConnectionPermit, now: Instant) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let services = Arc::clone(permit.services());
        let decoder = FrameDecoder::new(services.config.max_message_size);
        debug!(conn_id = id, %peer, "connection opened");
        Self {
            id,
            peer,
            io: Outbound {
                stream,
                buf: BytesMut::with_capacity(READ_CHUNK),
            },
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            decoder,
            services,
            phase: Phase::Startup,
            session: None,
            task: None,
            wait: Wait::None,
            discard_until_sync: false,
            flush_pending: false,
            cancel: Arc::new(CancelHandle::new(id)),
            opened_at: now,
            closed: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.io.stream
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus {
            closed: self.closed,
            retry_at: match self.wait {
                Wait::Retry(at) => Some(at),
                _ => None,
            },
        }
    }

    pub fn has_active_task(&self) -> bool {
        self.task.is_some()
    }

    /// Readiness event from the worker's poller. `hangup` is set when the
    /// poller saw the peer's read side close or the socket error out.
    pub fn on_ready(&mut self, now: Instant, hangup: bool) {
        if self.closed {
            return;
        }
        let result = self.flush().and_then(|()| self.process(now));
        self.settle(result);
        // an active task stops input from being read, so EOF is never seen
        if hangup && !self.closed && self.task.is_some() {
            info!(
                conn_id = self.id,
                peer = %self.peer,
                waiting = matches!(self.wait, Wait::Retry(_)),
                "peer went away with a statement in flight"
            );
            self.close();
        }
    }

    /// The busy-retry deadline of the active task has passed.
    pub fn resume_deferred(&mut self, now: Instant) {
        if self.closed || !matches!(self.wait, Wait::Retry(_)) {
            return;
        }
        self.wait = Wait::None;
        let result = self.run_task(now).and_then(|()| self.process(now));
        self.settle(result);
    }

    /// Server shutdown: tell the client why, push out what we can, close.
    pub fn shut_down(&mut self) {
        if self.closed {
            return;
        }
        self.settle(Err(ConnectionError::Rejected(SessionError::new(
            sqlstate::ADMIN_SHUTDOWN,
            "terminating connection due to administrator command",
        ))));
    }

    /// Closes a connection still in its handshake once `timeout` has passed.
    /// Returns whether it was closed.
    pub fn expire_handshake(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.closed
            || matches!(self.phase, Phase::Ready)
            || now.saturating_duration_since(self.opened_at) < timeout
        {
            return false;
        }
        warn!(conn_id = self.id, peer = %self.peer, "handshake timed out");
        self.close();
        true
    }

    /// Decodes and dispatches buffered input until a task becomes active,
    /// output backs up, or the socket runs dry.
    fn process(&mut self, now: Instant) -> Result<(), ConnectionError> {
        loop {
            if self.closed {
                return Ok(());
            }
            if self.task.is_some() {
                if self.wait == Wait::Writable && !self.flush_pending {
                    self.wait = Wait::None;
                    self.run_task(now)?;
                    continue;
                }
                break;
            }
            if self.flush_pending {
                break;
            }
            if self.decoder.header_available(&self.read_buf) {
                if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                    self.dispatch(frame, now)?;
                    if self.io.buf.len() >= self.services.config.write_chunk_size {
                        self.flush()?;
                    }
                    continue;
                }
            }
            if !self.fill_read_buf()? {
                break;
            }
        }
        self.flush()
    }

    /// Returns false once the socket has nothing more to give right now.
    fn fill_read_buf(&mut self) -> Result<bool, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.io.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(conn_id = self.id, "peer closed the connection");
                    self.close();
                    return Ok(false);
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn flush(&mut self) -> Result<(), ConnectionError> {
        let drained = self.io.flush()?;
        self.flush_pending = !drained;
        Ok(())
    }

    fn send(&mut self, message: &BackendMessage) {
        self.io.send(message);
    }

    fn send_ready_for_query(&mut self) {
        let status = self
            .session
            .as_ref()
            .map_or(ReadyForQueryStatus::Idle, |session| session.txn.status());
        self.send(&BackendMessage::ReadyForQuery { status });
    }

    fn dispatch(&mut self, frame: Frame, now: Instant) -> Result<(), ConnectionError> {
        match frame {
            Frame::Startup(bytes) if matches!(self.phase, Phase::Startup) => {
                self.exec_startup_packet(&bytes)
            }
            Frame::Message { tag: b'p', body } if matches!(self.phase, Phase::Authenticating { .. }) => {
                self.exec_auth_response(&body)
            }
            Frame::Message { tag, body } if matches!(self.phase, Phase::Ready) => {
                let message = decode_frontend_message(tag, &body)?;
                self.exec_message(message, now)
            }
            Frame::Message { tag, .. } => Err(ProtocolError::UnknownMessage(tag).into()),
            Frame::Startup(_) => {
                Err(ProtocolError::Malformed("unexpected startup packet").into())
            }
        }
    }

    fn exec_startup_packet(&mut self, bytes: &Bytes) -> Result<(), ConnectionError> {
        match decode_startup_action(bytes)? {
            StartupAction::SslRequest | StartupAction::GssEncRequest => {
                // the client may continue in plaintext with a regular startup packet
                self.io.buf.put_u8(b'N');
                Ok(())
            }
            StartupAction::CancelRequest {
                process_id,
                secret_key,
            } => {
                self.services.cancels.cancel(process_id, secret_key);
                self.close();
                Ok(())
            }
            StartupAction::Startup(packet) => self.exec_startup_message(packet),
        }
    }

    fn exec_startup_message(&mut self, packet: StartupPacket) -> Result<(), ConnectionError> {
        self.decoder.set_expect_startup(false);
        if !packet.client_encoding_is_supported() {
            return Err(ConnectionError::Rejected(SessionError::new(
                sqlstate::INVALID_PARAMETER_VALUE,
                format!(
                    "unsupported client_encoding \"{}\"",
                    packet.parameter("client_encoding").unwrap_or_default()
                ),
            )));
        }
        let database = packet.database_name().to_string();
        if !is_valid_database_name(&database) {
            return Err(ConnectionError::Rejected(SessionError::new(
                sqlstate::INVALID_CATALOG_NAME,
                format!("database \"{database}\" does not exist"),
            )));
        }

        let access = &self.services.access;
        let credentials = access
            .resolve_user(self.peer, &packet.user, &database)
            .map_err(|err| {
                warn!(conn_id = self.id, user = %packet.user, error = %err, "login rejected");
                ConnectionError::Rejected(SessionError::new(err.sqlstate(), err.to_string()))
            })?;
        if !access.has_privilege(&credentials.user, &database, CommandClass::Connect) {
            return Err(ConnectionError::Rejected(SessionError::new(
                sqlstate::INSUFFICIENT_PRIVILEGE,
                format!("permission denied for database \"{database}\""),
            )));
        }

        let application_name = packet.parameter("application_name").map(str::to_string);
        match AuthExchange::start(&credentials) {
            None => self.complete_startup(credentials.user, database, application_name),
            Some((exchange, challenge)) => {
                self.send(&challenge);
                self.phase = Phase::Authenticating {
                    exchange,
                    user: credentials.user,
                    database,
                    application_name,
                };
                Ok(())
            }
        }
    }

    fn exec_auth_response(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let Phase::Authenticating { exchange, .. } = &mut self.phase else {
            return Err(ProtocolError::Malformed("no authentication in progress").into());
        };
        match exchange.respond(payload) {
            Ok(AuthStatus::Continue(message)) => {
                self.send(&message);
                Ok(())
            }
            Ok(AuthStatus::Authenticated(last)) => {
                if let Some(message) = last {
                    self.send(&message);
                }
                let Phase::Authenticating {
                    user,
                    database,
                    application_name,
                    ..
                } = std::mem::replace(&mut self.phase, Phase::Startup)
                else {
                    return Ok(());
                };
                self.complete_startup(user, database, application_name)
            }
            Err(err) => {
                warn!(conn_id = self.id, peer = %self.peer, error = %err, "authentication failed");
                Err(ConnectionError::Rejected(SessionError::new(
                    err.sqlstate(),
                    err.to_string(),
                )))
            }
        }
    }

    fn complete_startup(
        &mut self,
        user: String,
        database: String,
        application_name: Option<String>,
    ) -> Result<(), ConnectionError> {
        let executor = self
            .services
            .executors
            .open(&database)
            .map_err(|err| ConnectionError::Rejected(err.into()))?;
        self.cancel.set_interrupt(executor.interrupt_handle());
        self.services.cancels.register(Arc::clone(&self.cancel));

        self.send(&BackendMessage::AuthenticationOk);
        let mut parameters = vec![
            ("server_version", SERVER_VERSION.to_string()),
            ("server_encoding", "UTF8".to_string()),
            ("client_encoding", "UTF8".to_string()),
            ("DateStyle", "ISO, MDY".to_string()),
            ("integer_datetimes", "on".to_string()),
        ];
        if let Some(name) = application_name {
            parameters.push(("application_name", name));
        }
        for (name, value) in parameters {
            self.send(&BackendMessage::ParameterStatus {
                name: name.to_string(),
                value,
            });
        }
        self.send(&BackendMessage::BackendKeyData {
            process_id: self.id,
            secret_key: self.cancel.secret_key(),
        });

        info!(conn_id = self.id, peer = %self.peer, %user, %database, "session established");
        self.session = Some(Session::new(user, database, self.id, executor));
        self.phase = Phase::Ready;
        self.send_ready_for_query();
        Ok(())
    }

    fn exec_message(&mut self, message: FrontendMessage, now: Instant) -> Result<(), ConnectionError> {
        if self.discard_until_sync {
            match message {
                FrontendMessage::Sync => {
                    self.discard_until_sync = false;
                    self.send_ready_for_query();
                }
                FrontendMessage::Terminate => self.close(),
                _ => {}
            }
            return Ok(());
        }

        let extended = message.is_extended_query();
        match message {
            FrontendMessage::Query { sql } => {
                let statements: Vec<Statement> = split_statements(&sql)
                    .into_iter()
                    .map(Statement::new)
                    .collect();
                if statements.is_empty() {
                    self.send(&BackendMessage::EmptyQueryResponse);
                    self.send_ready_for_query();
                    return Ok(());
                }
                self.start_task(Task::simple_query(statements), now)
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                parameter_types,
            } => self.start_task(
                Task::parse(statement_name, Statement::new(query), parameter_types),
                now,
            ),
            FrontendMessage::Execute {
                portal_name,
                max_rows,
            } => self.start_task(
                Task::execute(portal_name, usize::try_from(max_rows).unwrap_or(0)),
                now,
            ),
            FrontendMessage::Flush => self.flush(),
            FrontendMessage::Sync => {
                self.send_ready_for_query();
                Ok(())
            }
            FrontendMessage::Terminate => {
                self.close();
                Ok(())
            }
            FrontendMessage::AuthResponse { .. } => {
                Err(ProtocolError::Malformed("unexpected password message").into())
            }
            other => {
                if let Err(err) = self.exec_immediate(other) {
                    self.report_error(&err, extended);
                }
                Ok(())
            }
        }
    }

    /// Messages answered without engine work that could need a retry.
    fn exec_immediate(&mut self, message: FrontendMessage) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::new(
                sqlstate::PROTOCOL_VIOLATION,
                "session is not established",
            ));
        };
        match message {
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                params,
                result_formats,
            } => {
                if param_formats.iter().chain(&result_formats).any(|code| *code != 0) {
                    return Err(SessionError::new(
                        sqlstate::FEATURE_NOT_SUPPORTED,
                        "binary format codes are not supported",
                    ));
                }
                let params = params
                    .into_iter()
                    .map(|value| value.map(String::from_utf8).transpose())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| {
                        SessionError::new(
                            sqlstate::INVALID_TEXT_REPRESENTATION,
                            "bind parameter is not valid UTF-8",
                        )
                    })?;
                session.bind(&portal_name, &statement_name, params)?;
                self.io.send(&BackendMessage::BindComplete);
            }
            FrontendMessage::DescribeStatement { statement_name } => {
                let prepared = session.statements.get(&statement_name).ok_or_else(|| {
                    SessionError::new(
                        sqlstate::INVALID_SQL_STATEMENT_NAME,
                        format!("prepared statement \"{statement_name}\" does not exist"),
                    )
                })?;
                self.io.send(&BackendMessage::ParameterDescription {
                    parameter_types: prepared.info.parameter_types.clone(),
                });
                self.io.send(&describe_columns(&prepared.info.columns));
            }
            FrontendMessage::DescribePortal { portal_name } => {
                let portal = session.portals.get(&portal_name).ok_or_else(|| {
                    SessionError::new(
                        sqlstate::INVALID_CURSOR_NAME,
                        format!("portal \"{portal_name}\" does not exist"),
                    )
                })?;
                self.io.send(&describe_columns(&portal.columns));
            }
            FrontendMessage::CloseStatement { statement_name } => {
                session.close_statement(&statement_name);
                self.io.send(&BackendMessage::CloseComplete);
            }
            FrontendMessage::ClosePortal { portal_name } => {
                session.close_portal(&portal_name);
                self.io.send(&BackendMessage::CloseComplete);
            }
            _ => {
                return Err(SessionError::new(
                    sqlstate::PROTOCOL_VIOLATION,
                    "unexpected message",
                ));
            }
        }
        Ok(())
    }

    fn report_error(&mut self, err: &SessionError, extended: bool) {
        debug!(conn_id = self.id, code = err.code, error = %err, "statement failed");
        self.send(&err.to_message());
        if extended {
            self.discard_until_sync = true;
        } else {
            self.send_ready_for_query();
        }
    }

    fn start_task(&mut self, task: Task, now: Instant) -> Result<(), ConnectionError> {
        if self.task.is_some() {
            debug_assert!(false, "connection {} started a second task", self.id);
            return Err(ConnectionError::TaskConflict);
        }
        self.cancel.begin_task();
        self.task = Some(task);
        self.run_task(now)
    }

    /// Polls the active task until it completes, fails or has to wait.
    fn run_task(&mut self, now: Instant) -> Result<(), ConnectionError> {
        loop {
            let (Some(task), Some(session)) = (self.task.as_mut(), self.session.as_mut()) else {
                return Ok(());
            };
            let simple = task.is_simple();
            let mut ctx = TaskCtx {
                session,
                out: &mut self.io,
                services: &self.services,
                cancel: &self.cancel,
                now,
            };
            match task.poll(&mut ctx)? {
                TaskPoll::Complete => {
                    self.finish_task();
                    return Ok(());
                }
                TaskPoll::Handoff(next) => {
                    self.task = Some(next);
                }
                TaskPoll::Deferred(at) => {
                    debug!(
                        conn_id = self.id,
                        retry_in_ms = at.saturating_duration_since(now).as_millis() as u64,
                        "statement deferred on contention"
                    );
                    self.wait = Wait::Retry(at);
                    return Ok(());
                }
                TaskPoll::AwaitWritable => {
                    self.wait = Wait::Writable;
                    self.flush_pending = true;
                    return Ok(());
                }
                TaskPoll::Failed(err) => {
                    self.finish_task();
                    self.report_error(&err, !simple);
                    return Ok(());
                }
            }
        }
    }

    fn finish_task(&mut self) {
        self.task = None;
        self.wait = Wait::None;
        self.cancel.enter_idle();
    }

    /// Unrecoverable connection errors are reported best-effort, then the
    /// socket is closed.
    fn settle(&mut self, result: Result<(), ConnectionError>) {
        let Err(err) = result else {
            return;
        };
        match &err {
            ConnectionError::Io(io_err) => {
                debug!(conn_id = self.id, error = %io_err, "socket error");
            }
            ConnectionError::Protocol(protocol_err) => {
                warn!(conn_id = self.id, peer = %self.peer, error = %protocol_err, "protocol violation");
                self.send(&BackendMessage::error(
                    sqlstate::PROTOCOL_VIOLATION,
                    protocol_err.to_string(),
                ));
            }
            ConnectionError::Rejected(session_err) => {
                self.send(&session_err.to_message());
            }
            ConnectionError::TaskConflict => {
                self.send(&BackendMessage::error(sqlstate::INTERNAL_ERROR, err.to_string()));
            }
        }
        if !matches!(err, ConnectionError::Io(_)) {
            let _ = self.io.flush();
        }
        self.close();
    }
}

impl<S> Connection<S> {
    /// Releases everything the connection holds in shared state. Safe to
    /// call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.task = None;
        self.wait = Wait::None;
        let released = self.services.write_locks.release_all(self.id);
        self.services.cancels.unregister(self.id);
        self.session = None;
        info!(
            conn_id = self.id,
            peer = %self.peer,
            released_locks = released,
            lifetime_ms = self.opened_at.elapsed().as_millis() as u64,
            "connection closed"
        );
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn describe_columns(columns: &[crate::engine::ColumnInfo]) -> BackendMessage {
    if columns.is_empty() {
        BackendMessage::NoData
    } else {
        BackendMessage::RowDescription {
            fields: row_description(columns),
        }
    }
}
