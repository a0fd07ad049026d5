//! Document stores and domain routing.
//!
//! - [`DocStorage`]: the store contract indices write through and queries read from
//! - [`Cache`]: generic store, backed by the remote protocol
//! - [`apply_tx`]: create/update/delete semantics shared by every store
//! - [`DomainRouter`]: class → queriable storage for its domain

mod apply;
mod cache;
mod router;

use async_trait::async_trait;

use crate::error::Result;
use crate::query::{Filter, FindOptions};
use crate::tx::Tx;
use crate::types::{ClassRef, Doc, Ref};

pub use apply::{apply_tx, apply_update};
pub use cache::Cache;
pub use router::DomainRouter;

/// A local document store.
///
/// Readers see state synchronously; only [`DocStorage::fetch`] may suspend,
/// to pull documents from the remote database before a query runs.
#[async_trait]
pub trait DocStorage: Send + Sync {
    /// Apply a transaction. On error the store is unchanged.
    fn apply(&self, tx: &Tx) -> Result<()>;

    fn get(&self, id: &Ref) -> Option<Doc>;

    /// Visit every stored document.
    fn scan(&self, visit: &mut dyn FnMut(&Doc));

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make documents matching the query available locally.
    async fn fetch(&self, _class: &ClassRef, _filter: &Filter, _options: &FindOptions) -> Result<()> {
        Ok(())
    }
}
