//! DSvn FS Library
//!
//! Versioned storage of immutable revisions on the local filesystem:
//! - Representations stored plain, zstd-compressed or as deltas
//! - Revisions sharded by number, each shard loose or packed
//! - Revision properties, mutable in place, loose or packed (optionally compressed)
//! - Crash-safe commits and packing, coordinated by advisory file locks
//! - Async facade for use from a tokio server

pub mod checksum;
pub mod config;
pub mod delta;
pub mod error;
pub mod format;
mod fsutil;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod packer;
pub mod properties;
pub mod rep;
pub mod revision;
pub mod revprops;
pub mod service;
pub mod store;

pub use checksum::Checksum;
pub use config::StoreConfig;
pub use error::{FsError, Result};
pub use format::FormatDescriptor;
pub use layout::{Location, ShardLayout, Track};
pub use packer::{PackOutcome, PackSummary};
pub use properties::{svn_props, PropertySet};
pub use rep::RepHandle;
pub use revision::{DirEntry, NodeKind, NodeRecord, RevisionRoot, Txn};
pub use service::{FsService, RevisionStore};
pub use store::{FsStore, RevisionInfo, VerifyReport};
