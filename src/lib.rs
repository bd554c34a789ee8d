//!
//! slicestore
//! ----------
//! Buffered table-storage ingestion engine. Incoming rows are written by one
//! `Writer` per slice into files on local volumes; per-slice statistics are
//! persisted in a transactional key-value store under a level-partitioned key
//! space (`local`, `staging`, `target`) and read back through three providers
//! with different staleness/cost trade-offs.
//!
//! Entry points:
//! - `volume::Volumes` discovers and opens volumes, assigns volumes to files.
//! - `volume::Volume::new_writer_for` opens a slice writer.
//! - `statistics::repository::Repository` persists and moves statistics.
//! - `statistics::provider::AtomicProvider`, `statistics::cache::{L1Provider, L2Provider}`
//!   aggregate statistics for any object key.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod kv;
pub mod model;
pub mod statistics;
pub mod volume;
pub mod writer;

pub use error::{MultiError, Result, StorageError};
