//! Async facade over [`FsStore`]
//!
//! Every store operation touches the filesystem and may wait on the write
//! lock, so each call runs on tokio's blocking pool.

use crate::error::{FsError, Result};
use crate::packer::{PackOutcome, PackSummary};
use crate::properties::PropertySet;
use crate::rep::RepHandle;
use crate::revision::{DirEntry, Txn};
use crate::store::{FsStore, RevisionInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Revision storage as seen by request handlers
#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn youngest(&self) -> Result<u64>;

    async fn begin_txn(&self) -> Result<Txn>;

    async fn commit_revision(&self, txn: Txn, props: PropertySet) -> Result<u64>;

    async fn read_representation(&self, handle: RepHandle) -> Result<Bytes>;

    async fn read_file(&self, rev: u64, path: &str) -> Result<Bytes>;

    async fn list_dir(&self, rev: u64, path: &str) -> Result<Vec<DirEntry>>;

    async fn revision_info(&self, rev: u64) -> Result<RevisionInfo>;

    async fn read_revision_property(&self, rev: u64, name: &str) -> Result<Option<Vec<u8>>>;

    async fn read_all_properties(&self, rev: u64) -> Result<PropertySet>;

    async fn write_revision_property(&self, rev: u64, name: &str, value: Option<Vec<u8>>) -> Result<()>;

    async fn pack_shard(&self, shard: u64) -> Result<PackOutcome>;

    async fn pack(&self) -> Result<PackSummary>;
}

#[derive(Clone)]
pub struct FsService {
    store: Arc<FsStore>,
}

impl FsService {
    pub fn new(store: FsStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &Arc<FsStore> {
        &self.store
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| FsError::Task(e.to_string()))?
    }

    /// Pack ready shards every `interval` until the returned handle is aborted
    pub fn spawn_pack_task(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match service.pack().await {
                    Ok(summary) if summary.busy => debug!("Background pack skipped: another packer is running"),
                    Ok(summary) if !summary.is_empty() => info!(
                        content = ?summary.content_shards,
                        revprops = ?summary.revprop_shards,
                        "Background pack finished"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Background pack failed"),
                }
            }
        })
    }
}

#[async_trait]
impl RevisionStore for FsService {
    async fn youngest(&self) -> Result<u64> {
        self.run(|store| store.youngest()).await
    }

    async fn begin_txn(&self) -> Result<Txn> {
        self.run(|store| store.begin_txn()).await
    }

    async fn commit_revision(&self, txn: Txn, props: PropertySet) -> Result<u64> {
        self.run(move |store| store.commit_revision(txn, props)).await
    }

    async fn read_representation(&self, handle: RepHandle) -> Result<Bytes> {
        self.run(move |store| store.read_representation(handle).map(Bytes::from))
            .await
    }

    async fn read_file(&self, rev: u64, path: &str) -> Result<Bytes> {
        let path = path.to_string();
        self.run(move |store| store.read_file(rev, &path).map(Bytes::from))
            .await
    }

    async fn list_dir(&self, rev: u64, path: &str) -> Result<Vec<DirEntry>> {
        let path = path.to_string();
        self.run(move |store| store.list_dir(rev, &path)).await
    }

    async fn revision_info(&self, rev: u64) -> Result<RevisionInfo> {
        self.run(move |store| store.revision_info(rev)).await
    }

    async fn read_revision_property(&self, rev: u64, name: &str) -> Result<Option<Vec<u8>>> {
        let name = name.to_string();
        self.run(move |store| store.read_revision_property(rev, &name))
            .await
    }

    async fn read_all_properties(&self, rev: u64) -> Result<PropertySet> {
        self.run(move |store| store.read_all_properties(rev)).await
    }

    async fn write_revision_property(&self, rev: u64, name: &str, value: Option<Vec<u8>>) -> Result<()> {
        let name = name.to_string();
        self.run(move |store| store.write_revision_property(rev, &name, value.as_deref()))
            .await
    }

    async fn pack_shard(&self, shard: u64) -> Result<PackOutcome> {
        self.run(move |store| store.pack_shard(shard)).await
    }

    async fn pack(&self) -> Result<PackSummary> {
        self.run(|store| store.pack()).await
    }
}
