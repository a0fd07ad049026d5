use async_trait::async_trait;
use std::sync::Arc;

use super::Index;
use crate::error::Result;
use crate::model::ModelDb;
use crate::query::QueriableStorage;
use crate::tx::{Tx, TxContext};
use crate::types::ClassRef;

/// Forwards transactions on one auxiliary class (and its subclasses) into a
/// dedicated storage, keeping denormalized title/reference/space state
/// queryable there.
///
/// When the storage's store is shared with other queriable storages, those
/// must be registered with [`also_notify`](Self::also_notify) so their live
/// queries over ancestor classes see the write.
pub struct PassthroughIndex {
    name: String,
    model: Arc<ModelDb>,
    storage: Arc<QueriableStorage>,
    class: ClassRef,
    observers: Vec<Arc<QueriableStorage>>,
}

impl PassthroughIndex {
    pub fn new(model: Arc<ModelDb>, storage: Arc<QueriableStorage>, class: impl Into<ClassRef>) -> Self {
        let class = class.into();
        Self {
            name: format!("passthrough({})", class),
            model,
            storage,
            class,
            observers: Vec::new(),
        }
    }

    /// Also notify `storage` after each write.
    pub fn also_notify(mut self, storage: Arc<QueriableStorage>) -> Self {
        self.observers.push(storage);
        self
    }

    pub fn class(&self) -> &ClassRef {
        &self.class
    }
}

#[async_trait]
impl Index for PassthroughIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _ctx: &TxContext, tx: &Tx) -> Result<()> {
        if !self.model.is_derived(&tx.object_class, &self.class) {
            return Ok(());
        }
        self.storage.store().apply(tx)?;
        self.storage.notify(tx)?;
        for observer in &self.observers {
            observer.notify(tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CLASS_DOC, CLASS_REFERENCE, CLASS_TITLE};
    use crate::protocol::MemoryRemote;
    use crate::query::{Filter, FindOptions, LiveQueryConfig};
    use crate::storage::{Cache, DocStorage};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_forwards_only_its_class() {
        let model = Arc::new(ModelDb::new());
        let remote = Arc::new(MemoryRemote::new(Vec::new()));
        let cache: Arc<dyn DocStorage> = Arc::new(Cache::new(remote));
        let titles = QueriableStorage::new("title", Arc::clone(&model), cache, LiveQueryConfig::default());
        let index = PassthroughIndex::new(model, Arc::clone(&titles), CLASS_TITLE);
        assert_eq!(index.name(), "passthrough(class:core.Title)");

        let query = titles
            .query(&CLASS_TITLE.into(), Filter::all(), FindOptions::default())
            .await
            .unwrap();

        let mut attributes = Map::new();
        attributes.insert("title".into(), json!("T1"));
        let ctx = TxContext::server();
        index
            .process(&ctx, &Tx::create("title1", CLASS_TITLE, attributes))
            .await
            .unwrap();
        index
            .process(&ctx, &Tx::create("ref1", CLASS_REFERENCE, Map::new()))
            .await
            .unwrap();

        assert_eq!(titles.store().len(), 1);
        let results = query.drain_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("title1"));
    }

    #[tokio::test]
    async fn test_notifies_storages_sharing_the_store() {
        let model = Arc::new(ModelDb::new());
        let remote = Arc::new(MemoryRemote::new(Vec::new()));
        let cache: Arc<dyn DocStorage> = Arc::new(Cache::new(remote));
        let titles = QueriableStorage::new("title", Arc::clone(&model), Arc::clone(&cache), LiveQueryConfig::default());
        let generic = QueriableStorage::new("generic", Arc::clone(&model), cache, LiveQueryConfig::default());
        let index = PassthroughIndex::new(model, titles, CLASS_TITLE).also_notify(Arc::clone(&generic));

        let query = generic
            .query(&CLASS_DOC.into(), Filter::all(), FindOptions::default())
            .await
            .unwrap();
        assert!(query.initial.docs.is_empty());

        index
            .process(&TxContext::server(), &Tx::create("title1", CLASS_TITLE, Map::new()))
            .await
            .unwrap();

        let results = query.drain_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("title1"));
    }
}
