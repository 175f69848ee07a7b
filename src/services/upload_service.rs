//! Upload orchestration: one inbound stream becomes one File of shipped
//! chunks.
//!
//! Each upload runs a chunker and a shipper concurrently, joined by a
//! bounded queue. Both watch a shared [`TransferState`] so a failure on
//! either side stops the other at its next suspension point.

use crate::{
    models::{
        account::Account,
        chunk::NewChunk,
        file::{FileRecord, FileStatus, NewFile},
    },
    services::{
        chunker::{ReadyChunk, StreamChunker, aborted, chunk_queue},
        engine::{StorageEngine, TransferError, TransferResult, TransferState},
        object_store::ShardWriter,
    },
};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::{io, path::Path};
use thiserror::Error;
use tokio::{
    fs,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub container_id: i64,
    pub owner_id: i64,
    /// Account whose credentials own the shards written by this upload.
    pub account_id: i64,
    pub display_name: String,
    pub mime_type: String,
    /// Continue this file instead of creating a new one.
    pub resume_file_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub transfer_id: Uuid,
    pub file: FileRecord,
    /// Chunks shipped by this request, not counting earlier attempts.
    pub chunks_shipped: u32,
    pub bytes_received: u64,
}

/// A failed upload. `file_id` is set once a file record exists, so the
/// caller can resume it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct UploadFailure {
    pub file_id: Option<i64>,
    pub error: TransferError,
}

impl From<TransferError> for UploadFailure {
    fn from(error: TransferError) -> Self {
        Self {
            file_id: None,
            error,
        }
    }
}

pub struct UploadService {
    engine: StorageEngine,
}

impl UploadService {
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    /// Stream `source` into the store as the file described by `request`.
    ///
    /// On success the file is `Completed` and its staging directory is gone.
    /// On failure the file is `Failed`, its recorded chunks stay valid, and
    /// the upload can be resumed from `total_chunks * chunk_size`.
    pub async fn upload<S, E>(
        &self,
        request: UploadRequest,
        source: S,
    ) -> Result<UploadReceipt, UploadFailure>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<io::Error> + Send,
    {
        if request.display_name.trim().is_empty() {
            return Err(TransferError::InvalidRequest("file name must not be empty".into()).into());
        }

        let ledger = &self.engine.ledger;
        let account = ledger.find_account(request.account_id).await?;
        let file = self.prepare_file(&request).await?;
        let file_id = file.id;

        let transfer_id = Uuid::new_v4();
        match self.transfer(transfer_id, file, account, source).await {
            Ok(receipt) => Ok(receipt),
            Err(error) => {
                if let Err(status_err) = ledger.set_file_status(file_id, FileStatus::Failed).await {
                    warn!(file_id, error = %status_err, "failed to mark file as failed");
                }
                error!(%transfer_id, file_id, error = %error, "upload failed");
                Err(UploadFailure {
                    file_id: Some(file_id),
                    error,
                })
            }
        }
    }

    async fn prepare_file(&self, request: &UploadRequest) -> TransferResult<FileRecord> {
        let ledger = &self.engine.ledger;
        let Some(file_id) = request.resume_file_id else {
            return ledger
                .create_file(&NewFile {
                    container_id: request.container_id,
                    owner_id: request.owner_id,
                    display_name: request.display_name.clone(),
                    mime_type: request.mime_type.clone(),
                    chunk_size: self.engine.config.chunk_size,
                })
                .await;
        };

        let file = ledger
            .find_file_in_container(file_id, request.container_id)
            .await?;
        if file.owner_id != request.owner_id {
            return Err(TransferError::FileNotFound(file_id));
        }
        if file.status == FileStatus::Completed {
            return Err(TransferError::AlreadyCompleted(file_id));
        }
        if file.total_size != file.total_chunks * file.chunk_size {
            return Err(TransferError::LedgerInconsistency(format!(
                "file `{file_id}` ends in a partial chunk and cannot be resumed"
            )));
        }
        ledger.set_file_status(file_id, FileStatus::InProgress).await
    }

    /// Run the chunker and the shipper for an already prepared file.
    async fn transfer<S, E>(
        &self,
        transfer_id: Uuid,
        file: FileRecord,
        account: Account,
        source: S,
    ) -> TransferResult<UploadReceipt>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<io::Error> + Send,
    {
        let engine = &self.engine;
        let dir = engine.staging_root.join(transfer_id.to_string());
        fs::create_dir_all(&dir).await?;

        info!(
            %transfer_id,
            file_id = file.id,
            container_id = file.container_id,
            start_chunk = file.total_chunks,
            "upload started"
        );

        let mut writer = ShardWriter::new(
            engine.ledger.clone(),
            engine.host.clone(),
            account,
            &dir,
            &engine.config,
        );
        let chunker = StreamChunker::new(&dir, file.chunk_size as u64, file.total_chunks as u32);

        let (state_tx, state_rx) = watch::channel(TransferState::Active);
        let (queue, rx) = chunk_queue(engine.config.queue_capacity);

        let produce = async {
            let result = chunker.run(source, queue, state_rx.clone()).await;
            match &result {
                Ok(_) => {
                    state_tx.send_if_modified(|state| {
                        let draining = *state == TransferState::Active;
                        if draining {
                            *state = TransferState::Draining;
                        }
                        draining
                    });
                }
                Err(_) => {
                    state_tx.send_replace(TransferState::Failed);
                }
            }
            result
        };
        let ship = async {
            let result = self
                .ship_all(file.id, &mut writer, rx, state_rx.clone())
                .await;
            match &result {
                Ok(_) => state_tx.send_replace(TransferState::Done),
                Err(_) => state_tx.send_replace(TransferState::Failed),
            };
            result
        };

        let (produced, shipped) = tokio::join!(produce, ship);

        let finished = *state_rx.borrow() == TransferState::Done;
        let outcome = first_failure(produced, shipped).and_then(|done| {
            if finished { Ok(done) } else { Err(TransferError::Aborted) }
        });

        // Unshipped chunk files stay in the staging directory on failure.
        let (summary, chunks_shipped) = match outcome {
            Ok(done) => done,
            Err(err) => {
                writer.release().await;
                return Err(err);
            }
        };

        let file = self.complete(file.id, &mut writer, &dir).await?;
        info!(
            %transfer_id,
            file_id = file.id,
            total_size = file.total_size,
            total_chunks = file.total_chunks,
            "upload completed"
        );
        Ok(UploadReceipt {
            transfer_id,
            file,
            chunks_shipped,
            bytes_received: summary.bytes,
        })
    }

    /// Ship every chunk the chunker emits, in order, recording each one
    /// before its local copy is removed. The queue closing only counts as
    /// success once the chunker has marked the input `Draining`.
    async fn ship_all(
        &self,
        file_id: i64,
        writer: &mut ShardWriter,
        mut rx: mpsc::Receiver<ReadyChunk>,
        mut state: watch::Receiver<TransferState>,
    ) -> TransferResult<u32> {
        let mut shipped = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = aborted(&mut state) => return Err(TransferError::Aborted),
                next = rx.recv() => next,
            };
            let Some(chunk) = next else {
                let drained = *state.borrow() == TransferState::Draining;
                return if drained { Ok(shipped) } else { Err(TransferError::Aborted) };
            };

            let placed = writer.ship_chunk(&chunk.path).await?;
            self.engine
                .ledger
                .record_chunk(&NewChunk {
                    file_id,
                    shard_id: placed.shard_id,
                    sequence_number: chunk.sequence,
                    stored_name: placed.stored_name,
                    byte_size: chunk.byte_size,
                    checksum: chunk.checksum.clone(),
                })
                .await?;
            fs::remove_file(&chunk.path).await?;

            debug!(file_id, sequence = chunk.sequence, shard_id = placed.shard_id, "chunk recorded");
            shipped += 1;
            // Dropping the chunk frees its queue slot.
            drop(chunk);
        }
    }

    async fn complete(
        &self,
        file_id: i64,
        writer: &mut ShardWriter,
        dir: &Path,
    ) -> TransferResult<FileRecord> {
        writer.release().await;
        if let Err(err) = fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %err, "failed to remove staging directory");
        }

        let ledger = &self.engine.ledger;
        let file = ledger.set_file_status(file_id, FileStatus::Completed).await?;
        ledger.add_used_bytes(file.owner_id, file.total_size as u64).await?;
        Ok(file)
    }
}

/// Combine the two halves of a transfer, preferring the error that caused
/// the failure over the `Aborted` it triggered on the other side.
fn first_failure<A, B>(a: TransferResult<A>, b: TransferResult<B>) -> TransferResult<(A, B)> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(TransferError::Aborted), Err(err)) => Err(err),
        (Err(err), _) | (Ok(_), Err(err)) => Err(err),
    }
}
