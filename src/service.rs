//! Core service: the public façade over the replica.
//!
//! Finds and live queries are routed to the storage that owns the class's
//! domain. [`CoreService::tx`] applies optimistically: the transaction is
//! sent to the remote and run through the local pipeline concurrently, and
//! the call resolves once both have settled. Inbound transactions from the
//! remote event stream go through [`CoreService::dispatch`], which runs the
//! same pipeline without the network send.

use futures::future;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::error::{ReplicaError, Result};
use crate::journal::{JournalEntry, TxJournal};
use crate::model::{
    ModelDb, CLASS_REFERENCE, CLASS_SPACE, CLASS_TITLE, GENERIC_DOMAIN, MODEL_DOMAIN,
    TITLE_DOMAIN,
};
use crate::pipeline::{
    Index, LogIndex, ModelIndex, PassthroughIndex, TxLog, TxPipeline, ViewIndex,
};
use crate::protocol::{RemoteEvent, RemoteProtocol};
use crate::query::{
    Filter, FindOptions, LiveQuery, LiveQueryConfig, LiveQueryId, Page, QueriableStorage,
    QueryCallback,
};
use crate::storage::{Cache, DocStorage, DomainRouter};
use crate::tx::{AckHandle, AckStatus, Tx, TxContext};
use crate::types::{generate_id, ClassRef, Doc, Ref, TxId};

/// Configuration for [`CoreService`].
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Identity stamped on locally created transactions.
    pub user_id: String,

    /// Undelivered result sets a live query may buffer before it is dropped.
    /// Default: 64
    pub live_query_buffer: usize,

    /// Skip the server echo of a transaction already applied locally.
    /// Default: true
    pub dedupe_echo: bool,

    /// Directory for the durable transaction journal. Default: none
    pub journal_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            user_id: String::from("anonymous"),
            live_query_buffer: 64,
            dedupe_echo: true,
            journal_path: None,
        }
    }
}

/// The replica engine.
pub struct CoreService {
    config: CoreConfig,
    remote: Arc<dyn RemoteProtocol>,
    model: Arc<ModelDb>,
    router: DomainRouter,
    pipeline: Arc<TxPipeline>,
    log: Option<Arc<TxLog>>,
    journal: Option<Arc<TxJournal>>,
    /// Client transactions whose server echo has not arrived yet.
    awaiting_echo: Arc<Mutex<HashSet<TxId>>>,
}

impl CoreService {
    /// Load the model domain from `remote` and assemble the standard
    /// storages and pipeline.
    pub async fn start(config: CoreConfig, remote: Arc<dyn RemoteProtocol>) -> Result<Self> {
        let model = Arc::new(ModelDb::new());
        let raw = remote.load_domain(MODEL_DOMAIN).await?;
        let loaded = raw.len();
        model.load_model(raw);

        let live = LiveQueryConfig {
            buffer_size: config.live_query_buffer,
        };
        let cache: Arc<dyn DocStorage> = Arc::new(Cache::new(Arc::clone(&remote)));
        let model_store: Arc<dyn DocStorage> = model.clone();

        let q_model = QueriableStorage::new(MODEL_DOMAIN, Arc::clone(&model), model_store, live.clone());
        let q_titles = QueriableStorage::new(TITLE_DOMAIN, Arc::clone(&model), Arc::clone(&cache), live.clone());
        let q_cache = QueriableStorage::new(GENERIC_DOMAIN, Arc::clone(&model), cache, live);

        let router = DomainRouter::new(Arc::clone(&model), Arc::clone(&q_cache))
            .with_domain(MODEL_DOMAIN, Arc::clone(&q_model))
            .with_domain(TITLE_DOMAIN, Arc::clone(&q_titles));

        let journal = match &config.journal_path {
            Some(path) => {
                let journal = Arc::new(TxJournal::open(path)?);
                let pending = journal.pending_entries()?;
                if !pending.is_empty() {
                    warn!(count = pending.len(), "journal has transactions that never completed the pipeline");
                }
                Some(journal)
            }
            None => None,
        };

        let log = Arc::new(TxLog::new());
        let mut log_index = LogIndex::new(Arc::clone(&log));
        if let Some(journal) = &journal {
            log_index = log_index.with_journal(Arc::clone(journal));
        }

        let indices: Vec<Arc<dyn Index>> = vec![
            Arc::new(log_index),
            Arc::new(ViewIndex::new(Arc::clone(&model), Arc::clone(&q_cache))),
            // Titles share the generic cache, so document-level queries see them too.
            Arc::new(
                PassthroughIndex::new(Arc::clone(&model), q_titles, CLASS_TITLE)
                    .also_notify(Arc::clone(&q_cache)),
            ),
            Arc::new(PassthroughIndex::new(Arc::clone(&model), Arc::clone(&q_cache), CLASS_REFERENCE)),
            Arc::new(PassthroughIndex::new(Arc::clone(&model), q_cache, CLASS_SPACE)),
            Arc::new(ModelIndex::new(Arc::clone(&model), q_model)),
        ];

        info!(user = %config.user_id, classes = model.classes().len(), model_docs = loaded, "core started");

        let mut core = Self::with_pipeline(config, remote, model, router, TxPipeline::new(indices));
        core.log = Some(log);
        core.journal = journal;
        Ok(core)
    }

    /// Assemble a core from caller-built parts. No model is loaded.
    pub fn with_pipeline(
        config: CoreConfig,
        remote: Arc<dyn RemoteProtocol>,
        model: Arc<ModelDb>,
        router: DomainRouter,
        pipeline: TxPipeline,
    ) -> Self {
        Self {
            config,
            remote,
            model,
            router,
            pipeline: Arc::new(pipeline),
            log: None,
            journal: None,
            awaiting_echo: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    // --- Queries ---

    pub async fn find(&self, class: &ClassRef, filter: &Filter, options: &FindOptions) -> Result<Vec<Doc>> {
        self.router.route(class).find(class, filter, options).await
    }

    /// Like [`find`](Self::find), also reporting the total before paging.
    pub async fn find_page(&self, class: &ClassRef, filter: &Filter, options: &FindOptions) -> Result<Page> {
        self.router.route(class).find_page(class, filter, options).await
    }

    pub async fn find_one(&self, class: &ClassRef, filter: &Filter) -> Result<Option<Doc>> {
        self.router.route(class).find_one(class, filter).await
    }

    /// Register a live query; results arrive on the returned handle.
    pub async fn query(&self, class: &ClassRef, filter: Filter, options: FindOptions) -> Result<LiveQuery> {
        self.router.route(class).query(class, filter, options).await
    }

    /// Register a live query delivering to `callback`, starting with the
    /// initial result.
    pub async fn subscribe(
        &self,
        class: &ClassRef,
        filter: Filter,
        options: FindOptions,
        callback: QueryCallback,
    ) -> Result<LiveQueryId> {
        self.router
            .route(class)
            .subscribe(class, filter, options, callback)
            .await
    }

    /// Close a callback subscription made through [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, class: &ClassRef, id: LiveQueryId) {
        self.router.route(class).close(id);
    }

    // --- Transactions ---

    /// Apply `tx` optimistically.
    ///
    /// The network send and the local pipeline run concurrently; this
    /// resolves once both have settled. Local effects are kept even if the
    /// send fails. If both fail the error is [`ReplicaError::TxFailed`].
    ///
    /// Both halves run on a spawned task: dropping the returned future stops
    /// the wait, not the send or the pipeline.
    pub async fn tx(&self, tx: Tx) -> Result<()> {
        debug!(tx = %tx.id, object = %tx.object_id, kind = tx.kind_name(), "tx");

        if self.config.dedupe_echo {
            self.awaiting_echo.lock().insert(tx.id.clone());
        }

        let remote = Arc::clone(&self.remote);
        let pipeline = Arc::clone(&self.pipeline);
        let awaiting_echo = Arc::clone(&self.awaiting_echo);
        let task = tokio::spawn(async move {
            let (ack, handle) = AckHandle::pair();
            let ctx = TxContext::client(handle);
            let send = async {
                let sent = remote.tx(&tx).await;
                ack.settle(match &sent {
                    Ok(()) => AckStatus::Confirmed,
                    Err(e) => AckStatus::Rejected(e.to_string()),
                });
                sent
            };
            let (sent, applied) = future::join(send, pipeline.process(&ctx, &tx)).await;

            if sent.is_err() {
                // A rejected send is never echoed.
                awaiting_echo.lock().remove(&tx.id);
            }

            match (sent, applied) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(transport), Ok(())) => {
                    warn!(tx = %tx.id, error = %transport, "send failed; local changes kept");
                    Err(transport)
                }
                (Ok(()), Err(local)) => Err(local),
                (Err(transport), Err(local)) => Err(ReplicaError::TxFailed {
                    transport: Box::new(transport),
                    pipeline: Box::new(local),
                }),
            }
        });

        task.await
            .map_err(|e| ReplicaError::TaskFailed(e.to_string()))?
    }

    /// Run a transaction through the local pipeline only.
    pub async fn process(&self, ctx: &TxContext, tx: &Tx) -> Result<()> {
        self.pipeline.process(ctx, tx).await
    }

    // --- Inbound events ---

    /// Open the remote event stream, to be drained by [`run_events`](Self::run_events).
    pub fn events(&self) -> UnboundedReceiver<RemoteEvent> {
        self.remote.subscribe()
    }

    /// Apply one inbound event.
    ///
    /// A confirmed transaction runs with Server origin unless it is the echo
    /// of a local transaction (when dedup is on). A transient batch runs in
    /// order with ServerTransient origin, stopping at the first failure.
    pub async fn dispatch(&self, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Transaction(tx) => {
                if self.config.dedupe_echo && self.awaiting_echo.lock().remove(&tx.id) {
                    debug!(tx = %tx.id, "skipping echo of local transaction");
                    return Ok(());
                }
                self.pipeline.process(&TxContext::server(), &tx).await
            }
            RemoteEvent::TransientTransactions(batch) => {
                let ctx = TxContext::transient();
                for tx in &batch {
                    self.pipeline.process(&ctx, tx).await?;
                }
                Ok(())
            }
        }
    }

    /// Dispatcher loop: apply events in delivery order until the stream ends.
    /// Failures are logged and do not stop the loop.
    pub async fn run_events(&self, mut events: UnboundedReceiver<RemoteEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.dispatch(event).await {
                warn!(error = %e, conflict = e.is_conflict(), index = e.failing_index(), "inbound transaction failed");
            }
        }
        debug!("event stream closed");
    }

    // --- Passthroughs ---

    pub async fn load_domain(&self, domain: &str) -> Result<Vec<Doc>> {
        self.remote.load_domain(domain).await
    }

    pub async fn gen_ref_id(&self, space: &Ref) -> Result<Ref> {
        self.remote.gen_ref_id(space).await
    }

    /// Allocate a document id locally.
    pub fn generate_id(&self) -> Ref {
        generate_id()
    }

    pub fn get_user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn get_model(&self) -> &Arc<ModelDb> {
        &self.model
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    pub fn pipeline(&self) -> &TxPipeline {
        &self.pipeline
    }

    /// In-memory transaction log of the standard pipeline.
    pub fn tx_log(&self) -> Option<&Arc<TxLog>> {
        self.log.as_ref()
    }

    pub fn journal(&self) -> Option<&Arc<TxJournal>> {
        self.journal.as_ref()
    }

    /// Journaled transactions that never completed the pipeline.
    pub fn incomplete_transactions(&self) -> Result<Vec<JournalEntry>> {
        match &self.journal {
            Some(journal) => journal.pending_entries(),
            None => Ok(Vec::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}
