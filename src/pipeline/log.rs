//! Transaction log and the index that maintains it.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::Index;
use crate::error::Result;
use crate::journal::TxJournal;
use crate::tx::{Tx, TxContext, TxOrigin};
use crate::types::{Ref, TxId};

/// A logged transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub origin: TxOrigin,
    pub tx: Tx,
}

/// Append-only, in-memory log of every processed transaction with a
/// per-document index.
#[derive(Default)]
pub struct TxLog {
    entries: RwLock<Vec<LogEntry>>,
    /// Document id to positions in `entries`.
    by_doc: RwLock<HashMap<Ref, Vec<usize>>>,
}

impl TxLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, tx: &Tx, origin: TxOrigin) -> u64 {
        let mut entries = self.entries.write();
        let position = entries.len();
        let seq = position as u64 + 1;
        entries.push(LogEntry {
            seq,
            origin,
            tx: tx.clone(),
        });

        self.by_doc
            .write()
            .entry(tx.object_id.clone())
            .or_default()
            .push(position);
        seq
    }

    /// History of one document, oldest first.
    pub fn entries_for(&self, id: &Ref) -> Vec<LogEntry> {
        let positions = self.by_doc.read().get(id).cloned().unwrap_or_default();
        let entries = self.entries.read();
        positions
            .into_iter()
            .filter_map(|p| entries.get(p).cloned())
            .collect()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().clone()
    }

    pub fn last(&self) -> Option<LogEntry> {
        self.entries.read().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// First pipeline stage: records intent before anything else applies.
///
/// Every transaction goes to the in-memory [`TxLog`]. Durable ones (not
/// ServerTransient) also go to the journal when one is configured, and are
/// committed there once the whole pipeline has applied them.
pub struct LogIndex {
    log: Arc<TxLog>,
    journal: Option<Arc<TxJournal>>,
    /// Journal sequence of transactions still in the pipeline.
    in_flight: Mutex<HashMap<TxId, Vec<u64>>>,
}

impl LogIndex {
    pub fn new(log: Arc<TxLog>) -> Self {
        Self {
            log,
            journal: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_journal(mut self, journal: Arc<TxJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn log(&self) -> &Arc<TxLog> {
        &self.log
    }
}

#[async_trait]
impl Index for LogIndex {
    fn name(&self) -> &str {
        "log"
    }

    async fn process(&self, ctx: &TxContext, tx: &Tx) -> Result<()> {
        if let (Some(journal), true) = (&self.journal, ctx.is_durable()) {
            let seq = journal.append(tx, ctx.origin)?;
            self.in_flight
                .lock()
                .entry(tx.id.clone())
                .or_default()
                .push(seq);
        }
        self.log.append(tx, ctx.origin);
        Ok(())
    }

    async fn settle(&self, _ctx: &TxContext, tx: &Tx, applied: bool) -> Result<()> {
        let seq = {
            let mut in_flight = self.in_flight.lock();
            let seq = in_flight.get_mut(&tx.id).and_then(|seqs| seqs.pop());
            if in_flight.get(&tx.id).map_or(false, Vec::is_empty) {
                in_flight.remove(&tx.id);
            }
            seq
        };

        match (&self.journal, seq) {
            (Some(journal), Some(seq)) if applied => journal.commit(seq),
            _ => Ok(()),
        }
    }
}
