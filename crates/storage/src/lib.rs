//! Grid storage substrate for gridstore
//!
//! [`GridProvider`] is the contract a grid backend implements: units, atomic
//! batch saves, ID generators, atomic longs, cluster locks and pub/sub.
//! [`MemoryGrid`] is the single-process reference backend; [`RuntimeStorage`]
//! is the application-facing facade for transient (non-persisted) state.

#![warn(clippy::all)]

pub mod memory;
pub mod provider;
pub mod runtime;

pub use memory::MemoryGrid;
pub use provider::{
    BulkLoader, DeleteOp, GridProvider, InPlaceOp, LockGuard, RecordCursor, SaveBatch,
    TopicCallback,
};
pub use runtime::RuntimeStorage;
