//! Queriable storage: typed finds and live queries over one store.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::filter::{evaluate, Filter, FindOptions, Page};
use super::types::{
    DropReason, LiveQuery, LiveQueryConfig, LiveQueryId, QueryCallback, QueryEvent, QueryResult,
};
use crate::error::Result;
use crate::model::ModelDb;
use crate::storage::DocStorage;
use crate::tx::Tx;
use crate::types::{ClassRef, Doc};

#[derive(Clone)]
enum Sink {
    Channel(Sender<QueryEvent>),
    Callback(QueryCallback),
}

impl Sink {
    /// Err means the subscriber must be dropped.
    fn push(&self, result: QueryResult) -> std::result::Result<(), DropReason> {
        match self {
            Sink::Channel(sender) => match sender.try_send(QueryEvent::Results(result)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DropReason::BufferOverflow),
                Err(TrySendError::Disconnected(_)) => Err(DropReason::Disconnected),
            },
            Sink::Callback(callback) => {
                callback(&result);
                Ok(())
            }
        }
    }

    fn dropped(&self, reason: DropReason) {
        if let Sink::Channel(sender) = self {
            let _ = sender.try_send(QueryEvent::Dropped { reason });
        }
    }
}

/// Internal live query state.
struct Registration {
    class: ClassRef,
    filter: Filter,
    options: FindOptions,
    /// Last result set pushed (or the initial one).
    last: QueryResult,
    sink: Sink,
}

/// Wraps a store with typed finds and live-query registration.
///
/// Indices call [`QueriableStorage::notify`] after each successful store
/// update; every live query the transaction may affect is re-run against
/// current state and, if its result set changed, the new set is pushed
/// before `notify` returns.
pub struct QueriableStorage {
    /// Label used in logs (usually the domain name).
    name: String,
    model: Arc<ModelDb>,
    store: Arc<dyn DocStorage>,
    queries: RwLock<HashMap<LiveQueryId, Registration>>,
    next_id: AtomicU64,
    config: LiveQueryConfig,
}

impl QueriableStorage {
    pub fn new(
        name: impl Into<String>,
        model: Arc<ModelDb>,
        store: Arc<dyn DocStorage>,
        config: LiveQueryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            model,
            store,
            queries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn DocStorage> {
        &self.store
    }

    // --- Finds ---

    /// Find documents of `class`, fetching from the remote first if the
    /// store is remote-backed.
    pub async fn find(
        &self,
        class: &ClassRef,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Doc>> {
        Ok(self.find_page(class, filter, options).await?.docs)
    }

    /// Like [`find`](Self::find), also reporting the total before paging.
    pub async fn find_page(
        &self,
        class: &ClassRef,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Page> {
        self.store.fetch(class, filter, options).await?;
        self.find_local(class, filter, options)
    }

    pub async fn find_one(&self, class: &ClassRef, filter: &Filter) -> Result<Option<Doc>> {
        let options = FindOptions::default().limit(1);
        Ok(self.find(class, filter, &options).await?.into_iter().next())
    }

    /// Evaluate a query against local state only.
    pub fn find_local(
        &self,
        class: &ClassRef,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Page> {
        let mut docs = Vec::new();
        self.store.scan(&mut |doc: &Doc| docs.push(doc.clone()));

        let mut candidates = Vec::with_capacity(docs.len());
        for doc in docs {
            if self.model.matches_class(&doc, class) {
                candidates.push(self.model.cast(&doc, class)?);
            }
        }
        Ok(evaluate(candidates, filter, options))
    }

    // --- Live queries ---

    /// Register a live query delivering results through a bounded channel.
    pub async fn query(
        self: &Arc<Self>,
        class: &ClassRef,
        filter: Filter,
        options: FindOptions,
    ) -> Result<LiveQuery> {
        let (sender, receiver) = bounded(self.config.buffer_size);
        let (id, initial) = self
            .register(class, filter, options, Sink::Channel(sender))
            .await?;

        Ok(LiveQuery {
            id,
            initial,
            receiver,
            storage: Arc::downgrade(self),
        })
    }

    /// Register a live query delivering results to a callback. The callback
    /// is invoked once with the initial result before this returns.
    pub async fn subscribe(
        &self,
        class: &ClassRef,
        filter: Filter,
        options: FindOptions,
        callback: QueryCallback,
    ) -> Result<LiveQueryId> {
        let (id, initial) = self
            .register(class, filter, options, Sink::Callback(Arc::clone(&callback)))
            .await?;
        callback(&initial);
        Ok(id)
    }

    async fn register(
        &self,
        class: &ClassRef,
        filter: Filter,
        options: FindOptions,
        sink: Sink,
    ) -> Result<(LiveQueryId, QueryResult)> {
        // Fetch first, then compute the initial result and register without
        // suspending in between so no transaction can slip past unseen.
        self.store.fetch(class, &filter, &options).await?;
        let initial: QueryResult = self.find_local(class, &filter, &options)?.into();

        let id = LiveQueryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.queries.write().insert(
            id,
            Registration {
                class: class.clone(),
                filter,
                options,
                last: initial.clone(),
                sink,
            },
        );
        debug!(storage = %self.name, query = id.0, class = %class, "live query registered");

        Ok((id, initial))
    }

    /// Unregister a live query.
    pub fn close(&self, id: LiveQueryId) {
        if let Some(registration) = self.queries.write().remove(&id) {
            registration.sink.dropped(DropReason::Closed);
            debug!(storage = %self.name, query = id.0, "live query closed");
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.read().len()
    }

    /// Re-run every live query `tx` may affect and push changed result sets.
    ///
    /// Result sets are computed and delivered before this returns. Queries
    /// whose result did not change receive nothing.
    pub fn notify(&self, tx: &Tx) -> Result<()> {
        let affected: Vec<(LiveQueryId, ClassRef, Filter, FindOptions)> = self
            .queries
            .read()
            .iter()
            .filter(|(_, q)| self.model.affects(&q.class, tx))
            .map(|(id, q)| (*id, q.class.clone(), q.filter.clone(), q.options.clone()))
            .collect();

        if affected.is_empty() {
            return Ok(());
        }

        let mut fresh = Vec::with_capacity(affected.len());
        for (id, class, filter, options) in affected {
            let result: QueryResult = self.find_local(&class, &filter, &options)?.into();
            fresh.push((id, result));
        }

        let mut deliveries = Vec::new();
        {
            let mut queries = self.queries.write();
            for (id, result) in fresh {
                if let Some(q) = queries.get_mut(&id) {
                    if q.last != result {
                        q.last = result.clone();
                        deliveries.push((id, q.sink.clone(), result));
                    }
                }
            }
        }

        // Deliver without holding the lock so callbacks may query this storage.
        let mut to_remove = Vec::new();
        for (id, sink, result) in deliveries {
            trace!(storage = %self.name, query = id.0, tx = %tx.id, docs = result.docs.len(), "push");
            if let Err(reason) = sink.push(result) {
                to_remove.push((id, reason));
            }
        }

        if !to_remove.is_empty() {
            let mut queries = self.queries.write();
            for (id, reason) in to_remove {
                if let Some(q) = queries.remove(&id) {
                    debug!(storage = %self.name, query = id.0, ?reason, "live query dropped");
                    q.sink.dropped(reason);
                }
            }
        }

        Ok(())
    }
}
