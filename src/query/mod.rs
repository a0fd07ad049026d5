//! Queries over local state.
//!
//! This module provides:
//! - [`Filter`] / [`FindOptions`]: conjunctive field filters, sort and paging
//! - [`QueriableStorage`]: typed finds over a store plus live queries
//!
//! Live queries are re-run in full against current storage state whenever a
//! transaction may affect them, and a new result set is pushed only when it
//! differs from the last one delivered.
//!
//! # Example
//!
//! ```ignore
//! let query = storage
//!     .query(&task_class, Filter::eq("done", false), FindOptions::default())
//!     .await?;
//! println!("{} open tasks", query.initial.total);
//!
//! while let Ok(QueryEvent::Results(result)) = query.recv() {
//!     println!("now {} open tasks", result.total);
//! }
//! ```

mod filter;
mod live;
mod types;

pub use filter::{evaluate, Condition, Filter, FindOptions, Page, Predicate, SortOrder};
pub use live::QueriableStorage;
pub use types::{
    DropReason, LiveQuery, LiveQueryConfig, LiveQueryId, QueryCallback, QueryEvent, QueryResult,
};
