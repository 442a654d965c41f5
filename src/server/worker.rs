//! Event-loop worker: one thread, one mio poller, many connections.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::messages::encode_backend_message;
use crate::protocol::{BackendMessage, sqlstate};
use crate::server::{ServerError, Services};
use crate::tcop::{BusyRetryQueue, Connection};

const WAKER: Token = Token(usize::MAX);
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 1024;

/// A socket handed over by the listener.
pub struct Incoming {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("worker queue is full")]
    Full(TcpStream),
    #[error("worker is stopping")]
    Stopped(TcpStream),
}

impl OfferError {
    pub fn into_stream(self) -> TcpStream {
        match self {
            Self::Full(stream) | Self::Stopped(stream) => stream,
        }
    }
}

/// The sending side of a worker, shared with the listener.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    sender: Sender<Incoming>,
    waker: Arc<Waker>,
    stopping: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queues a connection without blocking. On failure the caller owns the
    /// socket again and must close it.
    pub fn offer(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), OfferError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(OfferError::Stopped(stream));
        }
        match self.sender.try_send(Incoming { stream, peer }) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(TrySendError::Full(incoming)) => Err(OfferError::Full(incoming.stream)),
            Err(TrySendError::Disconnected(incoming)) => Err(OfferError::Stopped(incoming.stream)),
        }
    }

    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            let _ = self.waker.wake();
        }
    }
}

pub struct Worker {
    id: usize,
    poll: Poll,
    services: Arc<Services>,
    incoming: Receiver<Incoming>,
    stopping: Arc<AtomicBool>,
    connections: HashMap<Token, Connection<TcpStream>>,
    next_token: usize,
    retries: BusyRetryQueue,
    next_handshake_sweep: Instant,
}

impl Worker {
    pub fn new(id: usize, services: Arc<Services>) -> io::Result<(Self, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (sender, incoming) = bounded(services.config.worker_queue_capacity);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = WorkerHandle {
            id,
            sender,
            waker,
            stopping: Arc::clone(&stopping),
        };
        let worker = Self {
            id,
            poll,
            services,
            incoming,
            stopping,
            connections: HashMap::new(),
            next_token: 0,
            retries: BusyRetryQueue::new(),
            next_handshake_sweep: Instant::now(),
        };
        Ok((worker, handle))
    }

    pub fn spawn(
        id: usize,
        services: Arc<Services>,
    ) -> Result<(WorkerHandle, JoinHandle<()>), ServerError> {
        let (worker, handle) = Self::new(id, services).map_err(|source| ServerError::Spawn {
            what: "worker poller",
            source,
        })?;
        let thread = thread::Builder::new()
            .name(format!("sqlgate-worker-{id}"))
            .spawn(move || worker.run())
            .map_err(|source| ServerError::Spawn {
                what: "worker thread",
                source,
            })?;
        Ok((handle, thread))
    }

    pub fn run(mut self) {
        info!(worker = self.id, "worker started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        while !self.stopping.load(Ordering::SeqCst) {
            let timeout = self.poll_timeout(Instant::now());
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, error = %err, "poll failed");
                break;
            }

            let io_started = Instant::now();
            let mut handled = 0;
            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                handled += 1;
                let hangup = event.is_read_closed() || event.is_error();
                self.drive(token, |conn, now| conn.on_ready(now, hangup));
            }
            self.run_due_retries(Instant::now());
            let io_elapsed = io_started.elapsed();

            self.admit_queued(handled, io_elapsed);
            self.expire_handshakes(Instant::now());
        }
        self.shut_down();
    }

    fn poll_timeout(&mut self, now: Instant) -> Duration {
        match self.retries.next_due() {
            Some(at) => at.saturating_duration_since(now).min(MAX_POLL_WAIT),
            None => MAX_POLL_WAIT,
        }
    }

    /// Runs `f` against a connection and reconciles the worker's view of it
    /// afterwards: closed connections are dropped, deferred ones scheduled.
    fn drive(&mut self, token: Token, f: impl FnOnce(&mut Connection<TcpStream>, Instant)) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        f(conn, Instant::now());
        let status = conn.status();
        if status.closed {
            self.retries.remove(token.0);
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(conn.stream_mut());
            }
            return;
        }
        match status.retry_at {
            Some(at) => self.retries.schedule(token.0, at),
            None => self.retries.remove(token.0),
        }
    }

    fn run_due_retries(&mut self, now: Instant) {
        for key in self.retries.pop_due(now) {
            self.drive(Token(key), |conn, now| conn.resume_deferred(now));
        }
    }

    /// Drains the admission queue. With no I/O this round, or the whole loop
    /// given to admission, everything queued is taken; otherwise admission
    /// gets `accept_ratio` percent of the loop's time, and at least one
    /// connection per round.
    pub(crate) fn admit_queued(&mut self, io_events: usize, io_elapsed: Duration) -> usize {
        let ratio = u32::from(self.services.config.accept_ratio);
        let budget = if io_events == 0 || ratio >= 100 {
            None
        } else {
            Some(io_elapsed * ratio / (100 - ratio))
        };
        let started = Instant::now();
        let mut admitted = 0;
        loop {
            if let Some(budget) = budget {
                if admitted > 0 && started.elapsed() >= budget {
                    break;
                }
            }
            let Ok(incoming) = self.incoming.try_recv() else {
                break;
            };
            self.register(incoming);
            admitted += 1;
        }
        admitted
    }

    fn register(&mut self, incoming: Incoming) {
        let Incoming { mut stream, peer } = incoming;
        let Some(permit) = self.services.try_admit() else {
            warn!(
                worker = self.id,
                %peer,
                limit = self.services.config.max_connections,
                "connection limit reached"
            );
            reject(&mut stream, sqlstate::TOO_MANY_CONNECTIONS, "sorry, too many clients already");
            return;
        };
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1) % WAKER.0;
        if let Err(err) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(worker = self.id, %peer, error = %err, "failed to register connection");
            return;
        }
        let conn = Connection::new(stream, peer.ip(), permit, Instant::now());
        debug!(worker = self.id, conn_id = conn.id(), %peer, "connection admitted");
        self.connections.insert(token, conn);
        self.drive(token, |conn, now| conn.on_ready(now, false));
    }

    fn expire_handshakes(&mut self, now: Instant) {
        if now < self.next_handshake_sweep {
            return;
        }
        self.next_handshake_sweep = now + MAX_POLL_WAIT;
        let timeout = self.services.config.connect_timeout;
        let expired: Vec<Token> = self
            .connections
            .iter_mut()
            .filter_map(|(token, conn)| conn.expire_handshake(now, timeout).then_some(*token))
            .collect();
        for token in expired {
            self.drive(token, |_, _| {});
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn shut_down(&mut self) {
        let open = self.connections.len();
        for (_, mut conn) in self.connections.drain() {
            conn.shut_down();
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }
        while let Ok(Incoming { mut stream, .. }) = self.incoming.try_recv() {
            reject(
                &mut stream,
                sqlstate::ADMIN_SHUTDOWN,
                "the database system is shutting down",
            );
        }
        info!(worker = self.id, closed = open, "worker stopped");
    }
}

/// Best-effort error to a socket that is about to be dropped.
pub(crate) fn reject(stream: &mut impl Write, code: &str, message: &str) {
    let mut buf = BytesMut::new();
    encode_backend_message(&BackendMessage::error(code, message), &mut buf);
    let _ = stream.write(&buf);
}
