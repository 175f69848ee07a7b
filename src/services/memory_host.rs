//! In-process [`BlobHost`] for tests: containers are maps of blob name to
//! bytes, staging clones are pending-commit lists keyed by directory.

use crate::{
    models::{account::Account, shard::Shard},
    services::remote::{BlobHost, BlobStream, RemoteError, RemoteResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

/// Fetched blobs are delivered in pieces of at least this many bytes, and
/// in no more than eight pieces.
const PIECE: usize = 7;

#[derive(Default)]
struct State {
    containers: HashMap<String, HashMap<String, Bytes>>,
    staging: HashMap<PathBuf, Staging>,
    deleted: Vec<String>,
}

struct Staging {
    container: String,
    pending: Vec<(String, Bytes)>,
}

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<State>,

    /// The next this-many pushes fail with a 503.
    pub push_failures: AtomicU32,
    /// The next this-many fetches fail with a 503.
    pub fetch_failures: AtomicU32,
    /// The next this-many container deletions fail with a 500.
    pub delete_failures: AtomicU32,
    /// Pushes never complete while set.
    pub stall_pushes: AtomicBool,

    pub push_attempts: AtomicU32,
    pub fetch_attempts: AtomicU32,
}

impl MemoryHost {
    pub fn blob(&self, container: &str, name: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state.containers.get(container)?.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn is_staged(&self, dir: &Path) -> bool {
        self.state.lock().unwrap().staging.contains_key(dir)
    }

    fn unavailable(status: u16) -> RemoteError {
        RemoteError::Status {
            status,
            body: "injected failure".into(),
        }
    }
}

/// Consume one injected failure, if any are left.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BlobHost for MemoryHost {
    async fn create_container(&self, account: &Account, name: &str) -> RemoteResult<String> {
        let mut state = self.state.lock().unwrap();
        state.containers.entry(name.to_string()).or_default();
        Ok(format!("https://blobs.test/{}/{}", account.identity, name))
    }

    async fn init_staging(&self, _account: &Account, shard: &Shard, dir: &Path) -> RemoteResult<()> {
        let mut state = self.state.lock().unwrap();
        state.staging.insert(
            dir.to_path_buf(),
            Staging {
                container: shard.name.clone(),
                pending: Vec::new(),
            },
        );
        Ok(())
    }

    async fn commit_blob(&self, dir: &Path, blob_name: &str) -> RemoteResult<()> {
        let bytes = tokio::fs::read(dir.join(blob_name)).await?;
        let mut state = self.state.lock().unwrap();
        let staging = state.staging.get_mut(dir).ok_or_else(|| RemoteError::Git {
            command: "commit".into(),
            stderr: "not a git repository".into(),
        })?;
        staging.pending.push((blob_name.to_string(), Bytes::from(bytes)));
        Ok(())
    }

    async fn push(&self, _account: &Account, _shard: &Shard, dir: &Path) -> RemoteResult<()> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        if self.stall_pushes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take(&self.push_failures) {
            return Err(Self::unavailable(503));
        }
        let mut state = self.state.lock().unwrap();
        let staging = state.staging.get_mut(dir).ok_or_else(|| RemoteError::Git {
            command: "push".into(),
            stderr: "not a git repository".into(),
        })?;
        let container = staging.container.clone();
        let pending = std::mem::take(&mut staging.pending);
        state.containers.entry(container).or_default().extend(pending);
        Ok(())
    }

    async fn fetch_blob(
        &self,
        _account: &Account,
        shard: &Shard,
        blob_name: &str,
        offset: u64,
    ) -> RemoteResult<BlobStream> {
        self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
        if take(&self.fetch_failures) {
            return Err(Self::unavailable(503));
        }
        let blob = self
            .blob(&shard.name, blob_name)
            .ok_or_else(|| Self::unavailable(404))?;
        let start = (offset as usize).min(blob.len());
        let rest = blob.slice(start..);
        let piece = PIECE.max(rest.len().div_ceil(8));
        let pieces: Vec<io::Result<Bytes>> = (0..rest.len())
            .step_by(piece)
            .map(|at| Ok(rest.slice(at..(at + piece).min(rest.len()))))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn discard_staging(&self, dir: &Path) -> RemoteResult<()> {
        self.state.lock().unwrap().staging.remove(dir);
        Ok(())
    }

    async fn delete_container(&self, _account: &Account, shard: &Shard) -> RemoteResult<()> {
        if take(&self.delete_failures) {
            return Err(Self::unavailable(500));
        }
        let mut state = self.state.lock().unwrap();
        state.containers.remove(&shard.name);
        state.deleted.push(shard.name.clone());
        Ok(())
    }
}
