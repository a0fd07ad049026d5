//! Convenience operations that build a transaction and submit it through
//! [`CoreService::tx`].
//!
//! Transactions built here carry a fresh id, the current user and the
//! current time. The target document's space is copied onto the
//! transaction.

use serde_json::{Map, Value};

use crate::error::{ReplicaError, Result};
use crate::service::CoreService;
use crate::tx::{Tx, UpdateOp};
use crate::types::{ClassRef, Doc, Ref};

impl CoreService {
    fn stamp(&self, tx: Tx, space: Option<&Ref>) -> Tx {
        let tx = tx.with_modified_by(self.get_user_id());
        match space {
            Some(space) => tx.with_space(space.clone()),
            None => tx,
        }
    }

    /// Create a document of `class` with a locally generated id.
    ///
    /// Returns the document as it was applied locally.
    pub async fn create(
        &self,
        class: &ClassRef,
        space: Option<&Ref>,
        attributes: Map<String, Value>,
    ) -> Result<Doc> {
        if self.get_model().class(class).is_none() {
            return Err(ReplicaError::UnknownClass(class.clone()));
        }

        let tx = self.stamp(Tx::create(self.generate_id(), class.clone(), attributes.clone()), space);
        let doc = Doc {
            id: tx.object_id.clone(),
            class: class.clone(),
            space: tx.object_space.clone(),
            modified_on: tx.modified_on,
            modified_by: tx.modified_by.clone(),
            attributes,
            mixins: Default::default(),
        };

        self.tx(tx).await?;
        Ok(doc)
    }

    /// Merge `fields` into `doc`.
    pub async fn update(&self, doc: &Doc, fields: Map<String, Value>) -> Result<()> {
        let tx = Tx::update(doc.id.clone(), doc.class.clone(), vec![UpdateOp::Set { fields }]);
        self.tx(self.stamp(tx, doc.space.as_ref())).await
    }

    /// Append `value` to the array field `field`.
    pub async fn push(&self, doc: &Doc, field: &str, value: Value) -> Result<()> {
        let op = UpdateOp::Push {
            field: field.to_string(),
            value,
        };
        let tx = Tx::update(doc.id.clone(), doc.class.clone(), vec![op]);
        self.tx(self.stamp(tx, doc.space.as_ref())).await
    }

    pub async fn remove(&self, doc: &Doc) -> Result<()> {
        let tx = Tx::delete(doc.id.clone(), doc.class.clone());
        self.tx(self.stamp(tx, doc.space.as_ref())).await
    }

    /// Attach `mixin` to `doc` (or update it) with `fields`.
    pub async fn set_mixin(&self, doc: &Doc, mixin: &ClassRef, fields: Map<String, Value>) -> Result<()> {
        if !self.get_model().is_mixin(mixin) {
            return Err(ReplicaError::UnknownClass(mixin.clone()));
        }
        let tx = Tx::update_mixin(
            doc.id.clone(),
            doc.class.clone(),
            mixin.clone(),
            vec![UpdateOp::Set { fields }],
        );
        self.tx(self.stamp(tx, doc.space.as_ref())).await
    }
}
