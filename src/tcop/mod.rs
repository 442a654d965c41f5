//! Traffic cop: the per-connection protocol state machine and the
//! suspendable tasks that drive statements through the executor.

use thiserror::Error;

use crate::engine::EngineError;
use crate::protocol::BackendMessage;
use crate::protocol::sqlstate;

pub mod busy;
pub mod processor;
pub mod session;
pub mod statement;
pub mod task;

pub use busy::{BusyContext, BusyRetryQueue};
pub use processor::{ConnStatus, Connection, ConnectionError};

/// An error reported to the client as an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionError {
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,
}

impl SessionError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn canceled() -> Self {
        Self::new(
            sqlstate::QUERY_CANCELED,
            "canceling statement due to user request",
        )
    }

    pub fn busy_timeout(database: &str) -> Self {
        Self::new(
            sqlstate::LOCK_NOT_AVAILABLE,
            format!("database \"{database}\" is locked"),
        )
    }

    pub fn in_failed_transaction() -> Self {
        Self::new(
            sqlstate::IN_FAILED_TRANSACTION,
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    pub fn to_message(&self) -> BackendMessage {
        BackendMessage::ErrorResponse {
            code: self.code.to_string(),
            message: self.message.clone(),
            detail: self.detail.clone(),
            hint: None,
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Interrupted => Self::canceled(),
            other => Self::new(other.sqlstate(), other.to_string()),
        }
    }
}
