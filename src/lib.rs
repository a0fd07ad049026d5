//! # Replica
//!
//! A client-side document replica: an in-memory mirror of part of a remote
//! document database that applies transactions optimistically and keeps
//! live queries current as transactions arrive, locally or from the network.
//!
//! ## Core Concepts
//!
//! - **Model**: class registry mapping every class to one storage domain
//! - **Storage**: per-domain queriable stores, with a generic cache as fallback
//! - **Pipeline**: ordered indices every transaction passes through
//! - **Live queries**: standing queries re-evaluated when a transaction affects them
//!
//! ## Example
//!
//! ```ignore
//! use replica::{CoreConfig, CoreService, Filter, FindOptions, MemoryRemote, Tx};
//!
//! let remote = Arc::new(MemoryRemote::new(classes));
//! let core = Arc::new(CoreService::start(CoreConfig::default(), remote).await?);
//!
//! // Apply inbound transactions in the background
//! let events = core.events();
//! tokio::spawn({
//!     let core = core.clone();
//!     async move { core.run_events(events).await }
//! });
//!
//! let tasks = core
//!     .query(&task_class, Filter::eq("done", false), FindOptions::default())
//!     .await?;
//!
//! // Resolves once the remote acknowledged and local state is updated
//! core.tx(Tx::create(core.generate_id(), task_class.clone(), attributes)).await?;
//! ```

pub mod error;
pub mod journal;
pub mod model;
pub mod operations;
pub mod pipeline;
pub mod protocol;
pub mod query;
pub mod service;
pub mod storage;
pub mod tx;
pub mod types;

// Re-exports
pub use error::{ReplicaError, Result};
pub use journal::{JournalEntry, JournalStatus, TxJournal};
pub use model::{
    ClassInfo, ClassKind, ModelDb, CLASS_CLASS, CLASS_DOC, CLASS_MIXIN, CLASS_REFERENCE,
    CLASS_SPACE, CLASS_TITLE, CLASS_TX, GENERIC_DOMAIN, MODEL_DOMAIN, TITLE_DOMAIN,
};
pub use pipeline::{
    Index, LogEntry, LogIndex, ModelIndex, PassthroughIndex, TxLog, TxPipeline, ViewIndex,
};
pub use protocol::{MemoryRemote, RemoteEvent, RemoteProtocol};
pub use query::{
    Condition, DropReason, Filter, FindOptions, LiveQuery, LiveQueryConfig, LiveQueryId, Page,
    Predicate, QueriableStorage, QueryCallback, QueryEvent, QueryResult, SortOrder,
};
pub use service::{CoreConfig, CoreService};
pub use storage::{apply_tx, Cache, DocStorage, DomainRouter};
pub use tx::{AckHandle, AckSender, AckStatus, Tx, TxContext, TxKind, TxOrigin, UpdateOp};
pub use types::*;
