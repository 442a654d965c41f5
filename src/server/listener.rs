//! Accept loop and server lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::engine::{ExecutorFactory, SqliteExecutorFactory};
use crate::protocol::sqlstate;
use crate::security::{AccessControl, RoleAccessControl, TrustAll};
use crate::server::worker::{Worker, WorkerHandle, reject};
use crate::server::{ServerError, Services};

const LISTENER: Token = Token(0);
const SHUTDOWN: Token = Token(1);

/// A running gateway: one accept thread feeding a fixed pool of workers.
pub struct Server {
    local_addr: SocketAddr,
    services: Arc<Services>,
    workers: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    shutdown_waker: Arc<Waker>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Starts with the SQLite executor and the users file named in `config`,
    /// or trust authentication without one.
    pub fn start(config: GatewayConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let access: Arc<dyn AccessControl> = match &config.users_file {
            Some(path) => Arc::new(RoleAccessControl::from_file(path)?),
            None => Arc::new(TrustAll),
        };
        let executors = Arc::new(SqliteExecutorFactory::new(
            config.data_dir.clone(),
            config.engine_lock_wait,
        ));
        Self::start_with(config, executors, access)
    }

    pub fn start_with(
        config: GatewayConfig,
        executors: Arc<dyn ExecutorFactory>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let shutdown_waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN)?);

        let worker_count = config.workers;
        let services = Arc::new(Services::new(config, executors, access));
        let mut workers = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (handle, thread) = Worker::spawn(id, Arc::clone(&services))?;
            workers.push(handle);
            threads.push(thread);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = Acceptor {
            listener,
            poll,
            workers: workers.clone(),
            next: 0,
            stopping: Arc::clone(&stopping),
        };
        let acceptor = thread::Builder::new()
            .name("sqlgate-listener".to_string())
            .spawn(move || acceptor.run())
            .map_err(|source| ServerError::Spawn {
                what: "listener thread",
                source,
            })?;

        info!(addr = %local_addr, workers = worker_count, "gateway listening");
        Ok(Self {
            local_addr,
            services,
            workers,
            threads,
            stopping,
            shutdown_waker,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Stops accepting, then stops every worker and waits for the threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("gateway shutting down");
        let _ = self.shutdown_waker.wake();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for worker in &self.workers {
            worker.stop();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!(
            open_connections = self.services.open_connections(),
            "gateway stopped"
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    workers: Vec<WorkerHandle>,
    next: usize,
    stopping: Arc<AtomicBool>,
}

impl Acceptor {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        while !self.stopping.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "listener poll failed");
                break;
            }
            if events.iter().any(|event| event.token() == LISTENER) {
                self.accept_pending();
            }
        }
        debug!("listener stopped");
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    self.hand_off(stream, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Round-robin; a worker that cannot take the socket gets it rejected.
    fn hand_off(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        let worker = &self.workers[self.next % self.workers.len()];
        self.next = self.next.wrapping_add(1);
        if let Err(err) = worker.offer(stream, peer) {
            warn!(worker = worker.id(), %peer, reason = %err, "connection not admitted");
            let mut stream = err.into_stream();
            reject(
                &mut stream,
                sqlstate::TOO_MANY_CONNECTIONS,
                "sorry, too many clients already",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedEngine;

    #[test]
    fn binds_an_ephemeral_port_and_shuts_down() {
        let config = GatewayConfig {
            listen_port: 0,
            workers: 2,
            ..GatewayConfig::default()
        };
        let server = Server::start_with(config, Arc::new(ScriptedEngine::new()), Arc::new(TrustAll))
            .expect("server starts");
        assert_ne!(server.local_addr().port(), 0);
        server.shutdown();
    }

    #[test]
    fn invalid_configuration_is_refused() {
        let config = GatewayConfig {
            workers: 0,
            ..GatewayConfig::default()
        };
        let result = Server::start_with(config, Arc::new(ScriptedEngine::new()), Arc::new(TrustAll));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
