//! Durable persistence for gridstore
//!
//! The grid is the system of record at runtime; this crate keeps a durable
//! copy behind it. [`DiskStore`] is the provider contract a disk backend
//! implements, [`Persister`] is the write-behind server draining the
//! persistence log into it, and the backup module holds the `.obak` file
//! format plus restore and compare utilities.

#![warn(clippy::all)]

pub mod backup;
pub mod persister;
pub mod provider;
pub mod restore;
pub mod scheduler;
pub mod testing;

pub use backup::{backups_in, BackupFile, BACKUP_EXTENSION};
pub use persister::{Persister, PersisterConfig, WATERMARK_COUNTER};
pub use provider::DiskStore;
pub use restore::{compare_backups, restore_backups, CompareReport, RestoreSummary};
pub use scheduler::{PeriodicScheduler, PeriodicTask};
pub use testing::MemoryDiskStore;
