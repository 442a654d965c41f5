use crate::protocol::ReadyForQueryStatus;

pub mod write_lock;

pub use write_lock::{HolderId, WriteLockRegistry};

/// Gateway-side view of a session's transaction, layered over the engine's
/// own autocommit flag. The engine knows whether a transaction is open; this
/// tracks the PostgreSQL notion of a failed block, which SQLite lacks.
#[derive(Debug, Clone, Default)]
pub struct TransactionState {
    explicit_block: bool,
    failed_block: bool,
    savepoints: Vec<String>,
}

impl TransactionState {
    pub fn begin(&mut self) {
        if self.explicit_block {
            return;
        }
        self.explicit_block = true;
        self.failed_block = false;
        self.savepoints.clear();
    }

    /// Ends the block. Returns true when the block had failed, in which case
    /// the commit was carried out as a rollback.
    pub fn commit(&mut self) -> bool {
        let failed = self.is_aborted();
        self.clear();
        failed
    }

    pub fn rollback(&mut self) {
        self.clear();
    }

    pub fn savepoint(&mut self, name: &str) {
        if self.explicit_block {
            self.savepoints.push(name.to_ascii_lowercase());
        }
    }

    pub fn release_savepoint(&mut self, name: &str) {
        let normalized = name.to_ascii_lowercase();
        if let Some(idx) = self.savepoints.iter().rposition(|sp| *sp == normalized) {
            self.savepoints.truncate(idx);
        }
    }

    /// Rolling back to a savepoint recovers a failed block.
    pub fn rollback_to_savepoint(&mut self, name: &str) {
        let normalized = name.to_ascii_lowercase();
        if let Some(idx) = self.savepoints.iter().rposition(|sp| *sp == normalized) {
            self.savepoints.truncate(idx + 1);
        }
        self.failed_block = false;
    }

    pub fn mark_failed(&mut self) {
        if self.explicit_block {
            self.failed_block = true;
        }
    }

    pub fn in_explicit_block(&self) -> bool {
        self.explicit_block
    }

    pub fn is_aborted(&self) -> bool {
        self.explicit_block && self.failed_block
    }

    /// Reconciles with the engine after a statement; an engine that dropped
    /// back to autocommit has closed the block on its own.
    pub fn sync_with_engine(&mut self, engine_autocommit: bool) {
        if engine_autocommit && self.explicit_block && !self.failed_block {
            self.clear();
        }
    }

    pub fn status(&self) -> ReadyForQueryStatus {
        if self.is_aborted() {
            ReadyForQueryStatus::FailedTransaction
        } else if self.explicit_block {
            ReadyForQueryStatus::InTransaction
        } else {
            ReadyForQueryStatus::Idle
        }
    }

    fn clear(&mut self) {
        self.explicit_block = false;
        self.failed_block = false;
        self.savepoints.clear();
    }
}
