//! Per-session writer that stamps contiguous sequence numbers.

use std::sync::Arc;

use crate::core::log::{LogEntry, LogRecord};
use crate::core::types::SessionId;
use crate::error::StoreError;
use crate::io::log_store::LogStore;

/// Appends records for one session. Owned by that session's worker, so
/// sequence numbers never race.
pub struct SessionJournal {
    store: Arc<dyn LogStore>,
    session_id: SessionId,
    last_sequence: u64,
}

impl SessionJournal {
    pub fn new(store: Arc<dyn LogStore>, session_id: SessionId) -> Self {
        Self {
            store,
            session_id,
            last_sequence: 0,
        }
    }

    /// Continue an existing session log from its last durable entry.
    pub fn resume(store: Arc<dyn LogStore>, session_id: SessionId) -> Result<Self, StoreError> {
        let last_sequence = store.last_sequence(session_id)?;
        Ok(Self {
            store,
            session_id,
            last_sequence,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Append `record` as the next entry of the session.
    pub fn record(&mut self, record: &LogRecord) -> Result<LogEntry, StoreError> {
        let entry = LogEntry::new(self.session_id, self.last_sequence + 1, record).map_err(
            |err| StoreError::Corrupt {
                location: format!("session {}", self.session_id),
                message: format!("{err:#}"),
            },
        )?;
        let entry = self.store.append(entry)?;
        self.last_sequence = entry.sequence_number;
        Ok(entry)
    }
}
