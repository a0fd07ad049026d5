//! Transaction pipeline.
//!
//! Every transaction, whatever its origin, is pushed through the same
//! ordered list of indices. Each index projects the transaction into the
//! store it owns and notifies that store's live queries.
//!
//! Standard order:
//! 1. [`LogIndex`]: append to the transaction log (and journal)
//! 2. [`ViewIndex`]: full-document view in the generic cache
//! 3. [`PassthroughIndex`] per auxiliary class (titles, references, spaces)
//! 4. [`ModelIndex`]: schema documents
//!
//! Later indices may rely on earlier ones having applied. A failing index
//! stops the pipeline; what earlier indices applied stays applied.

mod log;
mod model;
mod passthrough;
mod view;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::error::{ReplicaError, Result};
use crate::tx::{Tx, TxContext};

pub use log::{LogEntry, LogIndex, TxLog};
pub use model::ModelIndex;
pub use passthrough::PassthroughIndex;
pub use view::ViewIndex;

/// A pipeline stage bound to one or more stores.
#[async_trait]
pub trait Index: Send + Sync {
    /// Name used to blame this index in errors and logs.
    fn name(&self) -> &str;

    /// Apply this index's projection of `tx`.
    async fn process(&self, ctx: &TxContext, tx: &Tx) -> Result<()>;

    /// Called on every index once the pipeline is done with `tx`.
    /// `applied` is false if some index rejected it.
    async fn settle(&self, _ctx: &TxContext, _tx: &Tx, _applied: bool) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of indices.
pub struct TxPipeline {
    indices: Vec<Arc<dyn Index>>,
    /// Serializes `process` so transactions apply in arrival order.
    order: Mutex<()>,
}

impl TxPipeline {
    pub fn new(indices: Vec<Arc<dyn Index>>) -> Self {
        Self {
            indices,
            order: Mutex::new(()),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.indices.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Run `tx` through every index in order, awaiting each.
    ///
    /// Returns [`ReplicaError::Pipeline`] naming the first index that
    /// rejected; indices before it keep their effects.
    pub async fn process(&self, ctx: &TxContext, tx: &Tx) -> Result<()> {
        let _turn = self.order.lock().await;

        let mut failure = None;
        for index in &self.indices {
            trace!(index = index.name(), tx = %tx.id, origin = %ctx.origin, kind = tx.kind_name(), "process");
            if let Err(e) = index.process(ctx, tx).await {
                warn!(index = index.name(), tx = %tx.id, object = %tx.object_id, error = %e, "index rejected transaction");
                failure = Some(ReplicaError::Pipeline {
                    index: index.name().to_string(),
                    tx: tx.id.clone(),
                    source: Box::new(e),
                });
                break;
            }
        }

        let applied = failure.is_none();
        for index in &self.indices {
            if let Err(e) = index.settle(ctx, tx, applied).await {
                // A settle error never masks the original rejection.
                if failure.is_none() {
                    failure = Some(ReplicaError::Pipeline {
                        index: index.name().to_string(),
                        tx: tx.id.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
