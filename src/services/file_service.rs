//! File-level queries and cleanup that sit next to the transfer paths:
//! resume status for clients and bulk deletion.

use crate::{
    models::file::FileStatus,
    services::{engine::TransferResult, ledger::Ledger, object_store::ShardClient},
};
use serde::Serialize;
use tracing::info;

/// What a client needs to continue an interrupted upload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResumeStatus {
    pub file_id: i64,
    /// Byte offset the client should resend from.
    pub bytes_uploaded: u64,
    pub chunks_uploaded: u32,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub files_deleted: u64,
    pub shards_deleted: u64,
    /// Shards whose remote container could not be removed.
    pub remote_failures: u64,
}

pub struct FileService {
    ledger: Ledger,
    shards: ShardClient,
}

impl FileService {
    pub fn new(ledger: Ledger, shards: ShardClient) -> Self {
        Self { ledger, shards }
    }

    pub async fn resume_status(&self, file_id: i64, container_id: i64) -> TransferResult<ResumeStatus> {
        let file = self.ledger.find_file_in_container(file_id, container_id).await?;
        Ok(ResumeStatus {
            file_id: file.id,
            bytes_uploaded: file.total_size as u64,
            chunks_uploaded: file.total_chunks as u32,
            status: file.status,
        })
    }

    /// Delete files of `container_id`. Ids that are unknown or belong
    /// elsewhere are skipped.
    ///
    /// Shards that hold nothing but these files go too; their remote
    /// containers are removed best-effort.
    pub async fn delete_files(&self, container_id: i64, file_ids: &[i64]) -> TransferResult<DeleteSummary> {
        let ids = self.ledger.files_in_container(container_id, file_ids).await?;
        if ids.is_empty() {
            return Ok(DeleteSummary::default());
        }

        let shard_ids: Vec<i64> = self
            .ledger
            .shards_exclusive_to(&ids)
            .await?
            .into_iter()
            .map(|shard| shard.id)
            .collect();

        let files_deleted = self.ledger.remove_files(&ids).await?;
        let remote_deleted = self.shards.delete_shards(&shard_ids).await? as u64;

        let summary = DeleteSummary {
            files_deleted,
            shards_deleted: shard_ids.len() as u64,
            remote_failures: shard_ids.len() as u64 - remote_deleted,
        };
        info!(container_id, ?summary, "files deleted");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        engine::{StorageEngine, TransferError, tests::test_engine},
        memory_host::MemoryHost,
        upload_service::UploadRequest,
    };
    use bytes::Bytes;
    use futures::stream;
    use std::{
        io,
        sync::{Arc, atomic::Ordering},
    };
    use tempfile::TempDir;

    async fn upload(engine: &StorageEngine, container_id: i64, len: usize, fail: bool) -> i64 {
        let mut pieces: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from(vec![1u8; len]))];
        if fail {
            pieces.push(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cut off")));
        }
        let request = UploadRequest {
            container_id,
            owner_id: 42,
            account_id: 1,
            display_name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            resume_file_id: None,
        };
        match engine.uploads().upload(request, stream::iter(pieces)).await {
            Ok(receipt) => receipt.file.id,
            Err(failure) => failure.file_id.unwrap(),
        }
    }

    #[tokio::test]
    async fn resume_status_reports_recorded_progress() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(Arc::new(MemoryHost::default()), tmp.path(), 10, 1_000).await;

        let done = upload(&engine, 3, 25, false).await;
        let status = engine.files().resume_status(done, 3).await.unwrap();
        assert_eq!(
            status,
            ResumeStatus {
                file_id: done,
                bytes_uploaded: 25,
                chunks_uploaded: 3,
                status: FileStatus::Completed,
            }
        );

        let broken = upload(&engine, 3, 25, true).await;
        let status = engine.files().resume_status(broken, 3).await.unwrap();
        assert_eq!(status.status, FileStatus::Failed);
        assert_eq!(status.bytes_uploaded, u64::from(status.chunks_uploaded) * 10);

        assert!(matches!(
            engine.files().resume_status(done, 4).await,
            Err(TransferError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_files_drops_exclusive_shards_only() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(MemoryHost::default());
        // A large threshold keeps every upload on its own single shard.
        let engine = test_engine(host.clone(), tmp.path(), 10, 1_000).await;

        let a = upload(&engine, 3, 25, false).await;
        let b = upload(&engine, 3, 12, false).await;
        assert_eq!(host.container_names().len(), 2);

        let summary = engine.files().delete_files(3, &[a, 999]).await.unwrap();
        assert_eq!(
            summary,
            DeleteSummary { files_deleted: 1, shards_deleted: 1, remote_failures: 0 }
        );
        assert_eq!(host.container_names().len(), 1);
        assert!(engine.ledger.find_file(a).await.is_err());
        assert!(engine.ledger.find_file(b).await.is_ok());
    }

    #[tokio::test]
    async fn remote_failures_do_not_block_ledger_cleanup() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(MemoryHost::default());
        let engine = test_engine(host.clone(), tmp.path(), 10, 1_000).await;
        let a = upload(&engine, 3, 25, false).await;

        host.delete_failures.store(u32::MAX, Ordering::SeqCst);
        let summary = engine.files().delete_files(3, &[a]).await.unwrap();

        assert_eq!(summary.files_deleted, 1);
        assert_eq!(summary.remote_failures, 1);
        assert!(engine.ledger.find_file(a).await.is_err());
        let shards: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shards")
            .fetch_one(engine.ledger.pool())
            .await
            .unwrap();
        assert_eq!(shards, 0);
    }

    #[tokio::test]
    async fn files_of_other_containers_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(Arc::new(MemoryHost::default()), tmp.path(), 10, 1_000).await;
        let a = upload(&engine, 3, 5, false).await;

        let summary = engine.files().delete_files(4, &[a]).await.unwrap();
        assert_eq!(summary, DeleteSummary::default());
        assert!(engine.ledger.find_file(a).await.is_ok());
    }
}
