//! Object store manager: lands chunk files in shards and reads them back.
//!
//! [`ShardWriter`] is owned by exactly one upload. It holds that upload's
//! active shard and staging directory, so no two transfers ever append to
//! the same shard. [`ShardClient`] is stateless and serves fetches and
//! deletions for any transfer.

use crate::{
    models::{account::Account, shard::Shard},
    services::{
        engine::{TransferConfig, TransferError, TransferResult},
        ledger::Ledger,
        remote::{BlobHost, BlobStream},
        retry::RetryPolicy,
    },
};
use futures::future::join_all;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of shipping one chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippedChunk {
    pub shard_id: i64,
    pub stored_name: String,
    pub byte_size: u64,
}

pub struct ShardWriter {
    ledger: Ledger,
    host: Arc<dyn BlobHost>,
    account: Account,
    staging_dir: PathBuf,
    rotation_threshold: u64,
    retry: RetryPolicy,

    /// Shard receiving this transfer's chunks; `None` until first use and
    /// again right after a rotation or a failed push.
    active: Option<Shard>,
}

impl ShardWriter {
    pub fn new(
        ledger: Ledger,
        host: Arc<dyn BlobHost>,
        account: Account,
        staging_dir: impl Into<PathBuf>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            ledger,
            host,
            account,
            staging_dir: staging_dir.into(),
            rotation_threshold: config.rotation_threshold,
            retry: config.retry,
            active: None,
        }
    }

    #[cfg(test)]
    pub fn active_shard(&self) -> Option<&Shard> {
        self.active.as_ref()
    }

    /// Commit and push the chunk file at `path`, which must sit in this
    /// writer's staging directory.
    ///
    /// Returns the shard that now holds the chunk. When that shard crosses
    /// the rotation threshold it is sealed here, and the next call opens a
    /// fresh one.
    pub async fn ship_chunk(&mut self, path: &Path) -> TransferResult<ShippedChunk> {
        let stored_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("chunk path {} has no file name", path.display()),
                )
            })?;
        let byte_size = fs::metadata(path).await?.len();

        let (shard, opened) = match self.active.take() {
            Some(shard) => (shard, false),
            None => (self.open_shard().await?, true),
        };

        if let Err(err) = self.commit_and_push(&shard, &stored_name).await {
            // The staging clone may now hold a commit the remote never saw.
            self.discard_staging().await;
            if opened {
                self.abandon_shard(&shard).await;
            }
            return Err(err);
        }

        let total = self.ledger.add_shard_bytes(shard.id, byte_size).await?;
        debug!(
            shard = %shard.name,
            chunk = %stored_name,
            byte_size,
            shard_bytes = total,
            "chunk shipped"
        );

        if total > self.rotation_threshold {
            self.ledger.seal_shard(shard.id).await?;
            self.discard_staging().await;
            info!(
                shard = %shard.name,
                shard_bytes = total,
                threshold = self.rotation_threshold,
                "shard sealed, next chunk rotates to a new shard"
            );
        } else {
            self.active = Some(shard.clone());
        }

        Ok(ShippedChunk {
            shard_id: shard.id,
            stored_name,
            byte_size,
        })
    }

    /// Drop the local staging clone. The active shard stays usable only if a
    /// new staging clone is created, so it is forgotten as well.
    pub async fn release(&mut self) {
        self.active = None;
        self.discard_staging().await;
    }

    async fn open_shard(&self) -> TransferResult<Shard> {
        let name = format!("vault_{}", Uuid::new_v4().simple());
        let host = &self.host;
        let account = &self.account;
        let url = self
            .retry
            .run("create container", || host.create_container(account, &name))
            .await?;
        let shard = self.ledger.create_shard(account.id, &name, &url).await?;

        let staged = self
            .retry
            .run("init staging", || {
                host.init_staging(account, &shard, &self.staging_dir)
            })
            .await;
        if let Err(err) = staged {
            self.abandon_shard(&shard).await;
            return Err(err.into());
        }
        info!(shard = %shard.name, shard_id = shard.id, "opened shard");
        Ok(shard)
    }

    /// Remove a shard that never received a chunk, remotely and from the
    /// ledger. No chunk row can reference it, so file deletion would never
    /// find it.
    async fn abandon_shard(&self, shard: &Shard) {
        let host = &self.host;
        let account = &self.account;
        match self
            .retry
            .run("delete container", || host.delete_container(account, shard))
            .await
        {
            Ok(()) => info!(shard = %shard.name, shard_id = shard.id, "removed unused shard"),
            Err(err) => warn!(shard = %shard.name, error = %err, "failed to remove unused shard"),
        }
        if let Err(err) = self.ledger.delete_shards(&[shard.id]).await {
            warn!(shard_id = shard.id, error = %err, "failed to drop unused shard row");
        }
    }

    async fn commit_and_push(&self, shard: &Shard, stored_name: &str) -> TransferResult<()> {
        let host = &self.host;
        let account = &self.account;
        let dir = self.staging_dir.as_path();

        self.retry
            .run("commit", || host.commit_blob(dir, stored_name))
            .await?;
        self.retry
            .run("push", || host.push(account, shard, dir))
            .await?;
        Ok(())
    }

    async fn discard_staging(&self) {
        if let Err(err) = self.host.discard_staging(&self.staging_dir).await {
            warn!(
                dir = %self.staging_dir.display(),
                error = %err,
                "failed to discard staging clone"
            );
        }
    }
}

/// Stateless access to already-written shards.
#[derive(Clone)]
pub struct ShardClient {
    ledger: Ledger,
    host: Arc<dyn BlobHost>,
    retry: RetryPolicy,
}

impl ShardClient {
    pub fn new(ledger: Ledger, host: Arc<dyn BlobHost>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            host,
            retry,
        }
    }

    /// Open a stream over `stored_name` in shard `shard_id`, starting at
    /// `byte_offset`. Opening is retried; once bytes flow, errors surface
    /// through the stream.
    pub async fn fetch_chunk(
        &self,
        shard_id: i64,
        stored_name: &str,
        byte_offset: u64,
    ) -> TransferResult<BlobStream> {
        let shard = self.ledger.find_shard(shard_id).await?;
        let account = self.ledger.find_account(shard.account_id).await?;
        let host = &self.host;
        let stream = self
            .retry
            .run("fetch", || {
                host.fetch_blob(&account, &shard, stored_name, byte_offset)
            })
            .await?;
        Ok(stream)
    }

    /// Delete remote containers, then their ledger rows.
    ///
    /// Remote failures are logged and skipped; ledger rows are removed
    /// regardless. Returns the number of containers deleted remotely.
    pub async fn delete_shards(&self, shard_ids: &[i64]) -> TransferResult<usize> {
        let removals = shard_ids.iter().map(|&id| self.delete_remote(id));
        let deleted = join_all(removals)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        self.ledger.delete_shards(shard_ids).await?;
        Ok(deleted)
    }

    async fn delete_remote(&self, shard_id: i64) -> bool {
        let result = async {
            let shard = self.ledger.find_shard(shard_id).await?;
            let account = self.ledger.find_account(shard.account_id).await?;
            let host = &self.host;
            self.retry
                .run("delete container", || host.delete_container(&account, &shard))
                .await?;
            Ok::<_, TransferError>(shard)
        }
        .await;

        match result {
            Ok(shard) => {
                info!(shard = %shard.name, shard_id, "deleted remote shard");
                true
            }
            Err(err) => {
                warn!(shard_id, error = %err, "failed to delete remote shard");
                false
            }
        }
    }
}
