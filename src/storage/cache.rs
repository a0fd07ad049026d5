//! Generic document store backed by the remote protocol.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::apply::apply_tx;
use super::DocStorage;
use crate::error::Result;
use crate::protocol::RemoteProtocol;
use crate::query::{Filter, FindOptions};
use crate::tx::{Tx, TxKind};
use crate::types::{ClassRef, Doc, Ref};

/// Default home of documents whose domain has no dedicated store.
///
/// Holds the full-document view maintained by the pipeline. Finds pull
/// matching documents from the remote first; fetched documents never
/// overwrite local state, and ids deleted locally are not resurrected by a
/// fetch that raced the delete.
///
/// A tombstone is dropped once a fetch issued after the delete, whose
/// class and filter would have selected the deleted document, comes back
/// without it.
pub struct Cache {
    remote: Arc<dyn RemoteProtocol>,
    docs: RwLock<HashMap<Ref, Doc>>,
    /// Ids deleted locally, with their last known state.
    tombstones: RwLock<HashMap<Ref, Tombstone>>,
    /// Fetches issued so far.
    fetches: AtomicU64,
}

struct Tombstone {
    last: Doc,
    /// Fetches issued before the delete.
    after_fetch: u64,
}

impl Cache {
    pub fn new(remote: Arc<dyn RemoteProtocol>) -> Self {
        Self {
            remote,
            docs: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Insert documents that are not known locally. Returns how many were added.
    pub fn merge(&self, fetched: Vec<Doc>) -> usize {
        let mut docs = self.docs.write();
        let tombstones = self.tombstones.read();
        let mut added = 0;
        for doc in fetched {
            if tombstones.contains_key(&doc.id) || docs.contains_key(&doc.id) {
                continue;
            }
            docs.insert(doc.id.clone(), doc);
            added += 1;
        }
        added
    }

    pub fn is_deleted(&self, id: &Ref) -> bool {
        self.tombstones.read().contains_key(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.read().len()
    }

    /// Drop tombstones that the fetch numbered `fetch` shows are gone remotely.
    fn prune_tombstones(&self, fetch: u64, class: &ClassRef, filter: &Filter, returned: &HashSet<Ref>) -> usize {
        let mut tombstones = self.tombstones.write();
        let before = tombstones.len();
        tombstones.retain(|id, stone| {
            fetch <= stone.after_fetch
                || &stone.last.class != class
                || !filter.matches(&stone.last)
                || returned.contains(id)
        });
        before - tombstones.len()
    }
}

#[async_trait]
impl DocStorage for Cache {
    fn apply(&self, tx: &Tx) -> Result<()> {
        let mut docs = self.docs.write();
        let last = match tx.kind {
            TxKind::Delete => docs.get(&tx.object_id).cloned(),
            _ => None,
        };
        apply_tx(&mut docs, tx)?;

        let mut tombstones = self.tombstones.write();
        match tx.kind {
            TxKind::Delete => {
                if let Some(last) = last {
                    let after_fetch = self.fetches.load(Ordering::SeqCst);
                    tombstones.insert(tx.object_id.clone(), Tombstone { last, after_fetch });
                }
            }
            TxKind::Create { .. } => {
                tombstones.remove(&tx.object_id);
            }
            TxKind::Update { .. } => {}
        }
        Ok(())
    }

    fn get(&self, id: &Ref) -> Option<Doc> {
        self.docs.read().get(id).cloned()
    }

    fn scan(&self, visit: &mut dyn FnMut(&Doc)) {
        for doc in self.docs.read().values() {
            visit(doc);
        }
    }

    fn len(&self) -> usize {
        self.docs.read().len()
    }

    async fn fetch(&self, class: &ClassRef, filter: &Filter, options: &FindOptions) -> Result<()> {
        // Paging happens locally, over fetched and optimistic documents together.
        let unpaged = FindOptions {
            sort: options.sort.clone(),
            skip: None,
            limit: None,
        };
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let fetched = self.remote.find(class, filter, &unpaged).await?;
        let count = fetched.len();
        let returned: HashSet<Ref> = fetched.iter().map(|doc| doc.id.clone()).collect();
        let pruned = self.prune_tombstones(fetch, class, filter, &returned);
        let added = self.merge(fetched);
        trace!(class = %class, fetched = count, added, pruned, "cache fetch");
        Ok(())
    }
}
