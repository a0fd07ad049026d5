use async_trait::async_trait;
use std::sync::Arc;

use super::Index;
use crate::error::Result;
use crate::model::{ModelDb, CLASS_REFERENCE, CLASS_SPACE, CLASS_TITLE, MODEL_DOMAIN};
use crate::query::QueriableStorage;
use crate::tx::{Tx, TxContext};
use crate::types::ClassRef;

/// Maintains the full-document view in the generic store.
///
/// Applies create/update/delete for every class except schema documents and
/// the auxiliary classes handled by passthrough indices.
pub struct ViewIndex {
    model: Arc<ModelDb>,
    storage: Arc<QueriableStorage>,
    excluded: Vec<ClassRef>,
}

impl ViewIndex {
    pub fn new(model: Arc<ModelDb>, storage: Arc<QueriableStorage>) -> Self {
        Self {
            model,
            storage,
            excluded: vec![CLASS_TITLE.into(), CLASS_REFERENCE.into(), CLASS_SPACE.into()],
        }
    }

    /// Replace the set of classes (and their subclasses) left to other indices.
    pub fn excluding(mut self, classes: Vec<ClassRef>) -> Self {
        self.excluded = classes;
        self
    }

    fn handles(&self, tx: &Tx) -> bool {
        self.model.get_domain(&tx.object_class) != MODEL_DOMAIN
            && !self
                .excluded
                .iter()
                .any(|base| self.model.is_derived(&tx.object_class, base))
    }
}

#[async_trait]
impl Index for ViewIndex {
    fn name(&self) -> &str {
        "view"
    }

    async fn process(&self, _ctx: &TxContext, tx: &Tx) -> Result<()> {
        if !self.handles(tx) {
            return Ok(());
        }
        self.storage.store().apply(tx)?;
        self.storage.notify(tx)
    }
}
