//! Process-wide single-writer registry, keyed by logical database name.
//!
//! The storage engine admits one writer per file, but a transaction spans
//! several round trips. Holding the registry entry from the first write until
//! the autocommit boundary closes keeps a second connection from
//! interleaving writes into the same database.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Identity of a write-lock holder; the owning connection's id.
pub type HolderId = u32;

#[derive(Debug, Default)]
pub struct WriteLockRegistry {
    holders: DashMap<String, HolderId>,
}

impl WriteLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeeds when the database is unheld or already held by `holder`.
    /// On conflict returns the current holder.
    pub fn try_acquire(&self, database: &str, holder: HolderId) -> Result<(), HolderId> {
        match self.holders.entry(database.to_string()) {
            Entry::Occupied(entry) if *entry.get() == holder => Ok(()),
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(holder);
                Ok(())
            }
        }
    }

    /// Releases only if `holder` is the current holder.
    pub fn release(&self, database: &str, holder: HolderId) -> bool {
        self.holders
            .remove_if(database, |_, current| *current == holder)
            .is_some()
    }

    /// Drops every entry held by `holder`; used when a connection closes.
    pub fn release_all(&self, holder: HolderId) -> usize {
        let mut released = 0;
        self.holders.retain(|_, current| {
            if *current == holder {
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    pub fn holder(&self, database: &str) -> Option<HolderId> {
        self.holders.get(database).map(|entry| *entry.value())
    }

    pub fn is_held_by(&self, database: &str, holder: HolderId) -> bool {
        self.holder(database) == Some(holder)
    }
}
