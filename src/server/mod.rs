//! Network front end: listener, worker pool and the state shared between
//! them.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig};
use crate::engine::ExecutorFactory;
use crate::security::{AccessControl, AccessError};
use crate::txn::WriteLockRegistry;

pub mod cancel;
pub mod listener;
pub mod worker;

pub use cancel::{CancelHandle, CancelRegistry};
pub use listener::Server;
pub use worker::{OfferError, WorkerHandle};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to load users: {0}")]
    Access(#[from] AccessError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Process-wide collaborators handed to every worker and connection.
pub struct Services {
    pub config: GatewayConfig,
    pub executors: Arc<dyn ExecutorFactory>,
    pub access: Arc<dyn AccessControl>,
    pub write_locks: WriteLockRegistry,
    pub cancels: CancelRegistry,
    open_connections: AtomicUsize,
}

impl Services {
    pub fn new(
        config: GatewayConfig,
        executors: Arc<dyn ExecutorFactory>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            config,
            executors,
            access,
            write_locks: WriteLockRegistry::new(),
            cancels: CancelRegistry::new(),
            open_connections: AtomicUsize::new(0),
        }
    }

    /// Reserves a connection slot; `None` once `max_connections` are open.
    pub fn try_admit(self: &Arc<Self>) -> Option<ConnectionPermit> {
        let limit = self.config.max_connections;
        self.open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < limit).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionPermit {
                services: Arc::clone(self),
            })
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }
}

/// Holds one slot of the connection limit until dropped.
pub struct ConnectionPermit {
    services: Arc<Services>,
}

impl ConnectionPermit {
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.services.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::security::TrustAll;

    #[test]
    fn permits_enforce_the_connection_limit() {
        let config = GatewayConfig {
            max_connections: 2,
            ..GatewayConfig::default()
        };
        let services = Arc::new(Services::new(
            config,
            Arc::new(ScriptedEngine::new()),
            Arc::new(TrustAll),
        ));

        let first = services.try_admit().expect("first slot");
        let _second = services.try_admit().expect("second slot");
        assert!(services.try_admit().is_none());
        assert_eq!(services.open_connections(), 2);

        drop(first);
        assert_eq!(services.open_connections(), 1);
        assert!(services.try_admit().is_some());
    }
}
