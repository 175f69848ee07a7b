//! Shared engine state plus the error and state vocabulary used by every
//! transfer.

use crate::{
    models::file::FileStatus,
    services::{
        download_service::DownloadService,
        file_service::FileService,
        ledger::Ledger,
        object_store::ShardClient,
        remote::{BlobHost, RemoteError},
        retry::{RetryError, RetryPolicy},
        upload_service::UploadService,
    },
};
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

/// Knobs handed to the engine by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Target size of each chunk file in bytes.
    pub chunk_size: u64,

    /// A shard whose cumulative size passes this value is sealed.
    pub rotation_threshold: u64,

    /// Ready chunks that may wait for shipment before ingest is paused.
    pub queue_capacity: usize,

    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * MIB,
            rotation_threshold: 900 * MIB,
            queue_capacity: 5,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file `{0}` not found")]
    FileNotFound(i64),
    #[error("shard `{0}` not found")]
    ShardNotFound(i64),
    #[error("account `{0}` not found")]
    AccountNotFound(i64),
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),
    #[error("range starting at byte {start} is not satisfiable for a {total_size} byte file")]
    RangeNotSatisfiable { start: u64, total_size: u64 },
    #[error("file `{file_id}` is not available for download (status {status:?})")]
    NotReady { file_id: i64, status: FileStatus },
    #[error("file `{0}` is already completed")]
    AlreadyCompleted(i64),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("inbound stream failed: {0}")]
    Source(#[source] io::Error),
    #[error(transparent)]
    Remote(#[from] RetryError<RemoteError>),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("transfer aborted")]
    Aborted,
}

pub type TransferResult<T> = Result<T, TransferError>;

/// Progress of one upload, shared between its chunker and its shipper.
///
/// `Active -> Draining -> Done`, or `Active | Draining -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Input is still being read and chunked.
    Active,
    /// Input ended cleanly; the shipper may finish once the queue is empty.
    Draining,
    /// Every chunk is shipped; only then is the file completed.
    Done,
    /// Either side failed; the other stops at its next suspension point.
    Failed,
}

/// Application state: the ledger, the remote adapter and the configuration
/// every per-request service is built from.
#[derive(Clone)]
pub struct StorageEngine {
    pub ledger: Ledger,
    pub host: Arc<dyn BlobHost>,
    pub config: TransferConfig,

    /// Parent of the per-transfer staging directories.
    pub staging_root: PathBuf,
}

impl StorageEngine {
    pub fn new(
        ledger: Ledger,
        host: Arc<dyn BlobHost>,
        config: TransferConfig,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            host,
            config,
            staging_root: staging_root.into(),
        }
    }

    pub fn shards(&self) -> ShardClient {
        ShardClient::new(self.ledger.clone(), self.host.clone(), self.config.retry)
    }

    pub fn uploads(&self) -> UploadService {
        UploadService::new(self.clone())
    }

    pub fn downloads(&self) -> DownloadService {
        DownloadService::new(self.ledger.clone(), self.shards())
    }

    pub fn files(&self) -> FileService {
        FileService::new(self.ledger.clone(), self.shards())
    }
}
