//! Transactions and the context they travel with through the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::watch;

use crate::types::{generate_id, ClassRef, Ref, Timestamp, TxId};

/// An immutable mutation against one document.
///
/// Carries everything an index needs to derive its own update without
/// looking at the stored document first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    #[serde(rename = "_id")]
    pub id: TxId,
    pub object_id: Ref,
    pub object_class: ClassRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_space: Option<Ref>,
    #[serde(default)]
    pub modified_by: String,
    #[serde(default)]
    pub modified_on: Timestamp,
    pub kind: TxKind,
}

/// What a transaction does to its document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxKind {
    Create {
        attributes: Map<String, Value>,
    },
    Update {
        operations: Vec<UpdateOp>,
        /// When set, operations apply to this mixin's fields.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mixin: Option<ClassRef>,
    },
    Delete,
}

/// Field-level update operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpdateOp {
    /// Merge these fields over the current ones.
    Set { fields: Map<String, Value> },
    /// Remove a field.
    Unset { field: String },
    /// Append to an array field (created if missing).
    Push { field: String, value: Value },
    /// Remove all equal values from an array field.
    Pull { field: String, value: Value },
}

impl UpdateOp {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(field.into(), value.into());
        UpdateOp::Set { fields }
    }
}

impl Tx {
    fn new(object_id: Ref, object_class: ClassRef, kind: TxKind) -> Self {
        Self {
            id: TxId(generate_id().0),
            object_id,
            object_class,
            object_space: None,
            modified_by: String::new(),
            modified_on: Timestamp::now(),
            kind,
        }
    }

    pub fn create(
        object_id: impl Into<Ref>,
        object_class: impl Into<ClassRef>,
        attributes: Map<String, Value>,
    ) -> Self {
        Self::new(
            object_id.into(),
            object_class.into(),
            TxKind::Create { attributes },
        )
    }

    pub fn update(
        object_id: impl Into<Ref>,
        object_class: impl Into<ClassRef>,
        operations: Vec<UpdateOp>,
    ) -> Self {
        Self::new(
            object_id.into(),
            object_class.into(),
            TxKind::Update {
                operations,
                mixin: None,
            },
        )
    }

    /// Update the fields of `mixin` on a document, attaching it if absent.
    pub fn update_mixin(
        object_id: impl Into<Ref>,
        object_class: impl Into<ClassRef>,
        mixin: impl Into<ClassRef>,
        operations: Vec<UpdateOp>,
    ) -> Self {
        Self::new(
            object_id.into(),
            object_class.into(),
            TxKind::Update {
                operations,
                mixin: Some(mixin.into()),
            },
        )
    }

    pub fn delete(object_id: impl Into<Ref>, object_class: impl Into<ClassRef>) -> Self {
        Self::new(object_id.into(), object_class.into(), TxKind::Delete)
    }

    pub fn with_id(mut self, id: impl Into<TxId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_space(mut self, space: impl Into<Ref>) -> Self {
        self.object_space = Some(space.into());
        self
    }

    pub fn with_modified_by(mut self, user: impl Into<String>) -> Self {
        self.modified_by = user.into();
        self
    }

    /// Mixin targeted by an update, if any.
    pub fn mixin(&self) -> Option<&ClassRef> {
        match &self.kind {
            TxKind::Update { mixin, .. } => mixin.as_ref(),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TxKind::Create { .. } => "create",
            TxKind::Update { .. } => "update",
            TxKind::Delete => "delete",
        }
    }
}

/// Where a transaction came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOrigin {
    /// Locally originated, applied optimistically.
    Client,
    /// Confirmed, delivered by the network event stream.
    Server,
    /// Ephemeral; applied to live views but never persisted durably.
    ServerTransient,
}

impl fmt::Display for TxOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOrigin::Client => f.write_str("client"),
            TxOrigin::Server => f.write_str("server"),
            TxOrigin::ServerTransient => f.write_str("server-transient"),
        }
    }
}

/// Settled state of a network send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Confirmed,
    Rejected(String),
}

/// Completing side of a pending acknowledgement.
#[derive(Debug)]
pub struct AckSender {
    tx: watch::Sender<Option<AckStatus>>,
}

impl AckSender {
    pub fn settle(&self, status: AckStatus) {
        // No receivers left just means nobody is waiting.
        let _ = self.tx.send(Some(status));
    }
}

/// Handle to the network acknowledgement of a Client transaction.
#[derive(Clone, Debug)]
pub struct AckHandle {
    rx: watch::Receiver<Option<AckStatus>>,
}

impl AckHandle {
    pub fn pair() -> (AckSender, AckHandle) {
        let (tx, rx) = watch::channel(None);
        (AckSender { tx }, AckHandle { rx })
    }

    /// Current status; `None` while the send is still in flight.
    pub fn status(&self) -> Option<AckStatus> {
        self.rx.borrow().clone()
    }

    /// Wait until the send settles.
    pub async fn settled(&self) -> AckStatus {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(status) = current {
                return status;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| AckStatus::Rejected("acknowledgement dropped".into()));
            }
        }
    }
}

/// Metadata wrapping a transaction on its way through the pipeline.
#[derive(Clone, Debug)]
pub struct TxContext {
    pub origin: TxOrigin,
    /// Pending network send, for Client transactions.
    pub ack: Option<AckHandle>,
}

impl TxContext {
    pub fn client(ack: AckHandle) -> Self {
        Self {
            origin: TxOrigin::Client,
            ack: Some(ack),
        }
    }

    pub fn server() -> Self {
        Self {
            origin: TxOrigin::Server,
            ack: None,
        }
    }

    pub fn transient() -> Self {
        Self {
            origin: TxOrigin::ServerTransient,
            ack: None,
        }
    }

    /// Whether the transaction may be written to durable local storage.
    pub fn is_durable(&self) -> bool {
        self.origin != TxOrigin::ServerTransient
    }
}
