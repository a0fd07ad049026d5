use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::Index;
use crate::error::Result;
use crate::model::{ModelDb, MODEL_DOMAIN};
use crate::query::QueriableStorage;
use crate::tx::{Tx, TxContext};

/// Applies schema documents to the model store.
pub struct ModelIndex {
    model: Arc<ModelDb>,
    storage: Arc<QueriableStorage>,
}

impl ModelIndex {
    /// `storage` must wrap `model`.
    pub fn new(model: Arc<ModelDb>, storage: Arc<QueriableStorage>) -> Self {
        Self { model, storage }
    }
}

#[async_trait]
impl Index for ModelIndex {
    fn name(&self) -> &str {
        "model"
    }

    async fn process(&self, _ctx: &TxContext, tx: &Tx) -> Result<()> {
        if self.model.get_domain(&tx.object_class) != MODEL_DOMAIN {
            return Ok(());
        }
        self.storage.store().apply(tx)?;
        info!(object = %tx.object_id, kind = tx.kind_name(), "model updated");
        self.storage.notify(tx)
    }
}
