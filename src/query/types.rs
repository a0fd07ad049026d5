//! Live query types.

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::filter::Page;
use super::live::QueriableStorage;
use crate::types::Doc;

/// Configuration for live queries.
#[derive(Clone, Debug)]
pub struct LiveQueryConfig {
    /// Max undelivered result sets before the subscriber is dropped.
    /// Default: 64
    pub buffer_size: usize,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// Unique identifier for a live query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveQueryId(pub u64);

/// A live query result set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub docs: Vec<Doc>,
    /// Matches before skip/limit.
    pub total: usize,
}

impl From<Page> for QueryResult {
    fn from(page: Page) -> Self {
        Self {
            docs: page.docs,
            total: page.total,
        }
    }
}

impl QueryResult {
    pub fn contains(&self, id: &str) -> bool {
        self.docs.iter().any(|d| d.id.as_str() == id)
    }

    pub fn get(&self, id: &str) -> Option<&Doc> {
        self.docs.iter().find(|d| d.id.as_str() == id)
    }
}

/// Events delivered to a live query subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryEvent {
    /// A fresh result set after a transaction changed it.
    Results(QueryResult),
    /// The live query was unregistered.
    Dropped { reason: DropReason },
}

/// Why a live query was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Receiver went away.
    Disconnected,
    /// Explicitly closed.
    Closed,
}

/// Callback invoked synchronously with each fresh result set.
pub type QueryCallback = Arc<dyn Fn(&QueryResult) + Send + Sync>;

/// Handle to a channel-backed live query.
pub struct LiveQuery {
    pub id: LiveQueryId,
    /// Result set at registration time.
    pub initial: QueryResult,
    pub(crate) receiver: Receiver<QueryEvent>,
    pub(crate) storage: Weak<QueriableStorage>,
}

impl LiveQuery {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<QueryEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<QueryEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<QueryEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain pending events, returning the result sets in delivery order.
    pub fn drain_results(&self) -> Vec<QueryResult> {
        self.receiver
            .try_iter()
            .filter_map(|event| match event {
                QueryEvent::Results(result) => Some(result),
                QueryEvent::Dropped { .. } => None,
            })
            .collect()
    }

    /// Unregister the query. No further results are pushed.
    pub fn close(self) {
        if let Some(storage) = self.storage.upgrade() {
            storage.close(self.id);
        }
    }
}
