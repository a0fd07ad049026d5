//! The remote protocol boundary and an in-memory implementation of it.
//!
//! The engine consumes two things from the network layer:
//! - request/response calls ([`RemoteProtocol`])
//! - a push-style event stream of confirmed and transient transactions
//!   ([`RemoteEvent`]), obtained from [`RemoteProtocol::subscribe`]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::{ReplicaError, Result};
use crate::model::{ClassInfo, ModelDb, MODEL_DOMAIN};
use crate::query::{evaluate, Filter, FindOptions};
use crate::storage::{apply_tx, DocStorage};
use crate::tx::Tx;
use crate::types::{ClassRef, Doc, Ref};

/// Request/response calls to the remote database.
#[async_trait]
pub trait RemoteProtocol: Send + Sync {
    async fn find(&self, class: &ClassRef, filter: &Filter, options: &FindOptions)
        -> Result<Vec<Doc>>;

    async fn find_one(&self, class: &ClassRef, filter: &Filter) -> Result<Option<Doc>> {
        let options = FindOptions::default().limit(1);
        Ok(self.find(class, filter, &options).await?.into_iter().next())
    }

    /// Send a transaction; resolves on acknowledgement.
    async fn tx(&self, tx: &Tx) -> Result<()>;

    /// All raw documents of a domain.
    async fn load_domain(&self, domain: &str) -> Result<Vec<Doc>>;

    /// Server-allocated reference id within a space.
    async fn gen_ref_id(&self, space: &Ref) -> Result<Ref>;

    /// Open the event stream. Events are delivered in server order.
    fn subscribe(&self) -> UnboundedReceiver<RemoteEvent>;
}

/// Events pushed by the remote.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEvent {
    /// A confirmed transaction.
    Transaction(Tx),
    /// An ordered batch of ephemeral transactions.
    TransientTransactions(Vec<Tx>),
}

/// An in-process remote database.
///
/// Applies received transactions to its own state, echoes them back on the
/// event stream (configurable) and can be told to fail or delay sends.
pub struct MemoryRemote {
    model: ModelDb,
    docs: RwLock<HashMap<Ref, Doc>>,
    sent: Mutex<Vec<Tx>>,
    subscribers: Mutex<Vec<UnboundedSender<RemoteEvent>>>,
    failure: Mutex<Option<String>>,
    latency: Mutex<Option<Duration>>,
    echo: AtomicBool,
    next_ref: AtomicU64,
}

impl MemoryRemote {
    /// Create a remote whose model domain holds the core classes plus `classes`.
    pub fn new(classes: Vec<ClassInfo>) -> Self {
        let model = ModelDb::new();
        model.load_model(classes.iter().map(ClassInfo::to_doc).collect());
        Self {
            model,
            docs: RwLock::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            latency: Mutex::new(None),
            echo: AtomicBool::new(false),
            next_ref: AtomicU64::new(1),
        }
    }

    /// Store a document directly, bypassing transactions.
    pub fn insert(&self, doc: Doc) {
        self.docs.write().insert(doc.id.clone(), doc);
    }

    pub fn get(&self, id: &Ref) -> Option<Doc> {
        self.docs.read().get(id).cloned()
    }

    /// Echo accepted transactions back on the event stream.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// Reject every send with `message` until cleared with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }

    /// Delay every send by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Transactions received so far, accepted or not.
    pub fn sent(&self) -> Vec<Tx> {
        self.sent.lock().clone()
    }

    /// Push an event to every subscriber.
    pub fn emit(&self, event: RemoteEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl RemoteProtocol for MemoryRemote {
    async fn find(
        &self,
        class: &ClassRef,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Doc>> {
        let mut candidates = Vec::new();
        let source: Vec<Doc> = if self.model.get_domain(class) == MODEL_DOMAIN {
            let mut all = Vec::new();
            self.model.scan(&mut |doc: &Doc| all.push(doc.clone()));
            all
        } else {
            self.docs.read().values().cloned().collect()
        };
        for doc in source {
            if self.model.matches_class(&doc, class) {
                candidates.push(self.model.cast(&doc, class)?);
            }
        }
        Ok(evaluate(candidates, filter, options).docs)
    }

    async fn tx(&self, tx: &Tx) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.sent.lock().push(tx.clone());

        let failure = self.failure.lock().clone();
        if let Some(message) = failure {
            return Err(ReplicaError::Transport(message));
        }

        let applied = if self.model.get_domain(&tx.object_class) == MODEL_DOMAIN {
            self.model.apply(tx)
        } else {
            apply_tx(&mut self.docs.write(), tx)
        };
        applied.map_err(|e| ReplicaError::Transport(format!("rejected by server: {}", e)))?;

        if self.echo.load(Ordering::SeqCst) {
            debug!(tx = %tx.id, "echo");
            self.emit(RemoteEvent::Transaction(tx.clone()));
        }
        Ok(())
    }

    async fn load_domain(&self, domain: &str) -> Result<Vec<Doc>> {
        if domain == MODEL_DOMAIN {
            let mut all = Vec::new();
            self.model.scan(&mut |doc: &Doc| all.push(doc.clone()));
            return Ok(all);
        }
        Ok(self
            .docs
            .read()
            .values()
            .filter(|doc| self.model.get_domain(&doc.class) == domain)
            .cloned()
            .collect())
    }

    async fn gen_ref_id(&self, space: &Ref) -> Result<Ref> {
        let n = self.next_ref.fetch_add(1, Ordering::SeqCst);
        Ok(Ref(format!("{}-ref-{}", space, n)))
    }

    fn subscribe(&self) -> UnboundedReceiver<RemoteEvent> {
        let (sender, receiver) = unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CLASS_DOC;
    use serde_json::Map;

    const TASK: &str = "class:task.Task";

    fn remote() -> MemoryRemote {
        MemoryRemote::new(vec![ClassInfo::class(TASK)
            .extending(CLASS_DOC)
            .in_domain("tasks")])
    }

    #[tokio::test]
    async fn test_load_model_domain() {
        let remote = remote();
        let model = remote.load_domain(MODEL_DOMAIN).await.unwrap();
        assert!(model.iter().any(|d| d.id.as_str() == TASK));
    }

    #[tokio::test]
    async fn test_tx_applies_and_echoes() {
        let remote = remote();
        remote.set_echo(true);
        let mut events = remote.subscribe();

        let tx = Tx::create("t1", TASK, Map::new());
        remote.tx(&tx).await.unwrap();

        assert!(remote.get(&"t1".into()).is_some());
        assert_eq!(events.recv().await, Some(RemoteEvent::Transaction(tx)));
        let found = remote
            .find_one(&TASK.into(), &Filter::by_id(&"t1".into()))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = remote();
        remote.set_failure(Some("offline"));

        let err = remote
            .tx(&Tx::create("t1", TASK, Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Transport(_)));
        assert!(remote.get(&"t1".into()).is_none());
        assert_eq!(remote.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_duplicate() {
        let remote = remote();
        let tx = Tx::create("t1", TASK, Map::new());
        remote.tx(&tx).await.unwrap();
        assert!(remote.tx(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_gen_ref_id() {
        let remote = remote();
        let a = remote.gen_ref_id(&"sp".into()).await.unwrap();
        let b = remote.gen_ref_id(&"sp".into()).await.unwrap();
        assert_ne!(a, b);
    }
}
