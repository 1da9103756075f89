//! The gridstore engine
//!
//! Ties the grid substrate and the durability layer together:
//! [`InMemoryDatabase`] owns the cluster lifecycle, the persistence-mode
//! policy and stall detection; [`Transaction`] is the unit-of-work API
//! applications stage changes through; [`EntityRegistry`] holds the
//! explicitly registered entity types.

#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod registry;
pub mod transaction;

pub use config::{DatabaseConfig, PersistenceMode};
pub use database::{ClusterObserver, Datastore, InMemoryDatabase};
pub use registry::EntityRegistry;
pub use transaction::Transaction;
