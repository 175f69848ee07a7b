//! Represents one logical uploaded file and its transfer progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a file upload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileStatus {
    InProgress,
    Completed,
    Failed,
}

/// A file as recorded in the ledger.
///
/// The record carries metadata only; the bytes live in chunks spread over
/// one or more shards. `total_size` and `total_chunks` grow by one chunk at a
/// time while the upload is in progress.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: i64,

    /// Folder the file belongs to.
    pub container_id: i64,

    /// User charged for the file's bytes.
    pub owner_id: i64,

    /// Name supplied by the uploader.
    pub display_name: String,

    /// Unique name derived from the display name at creation time.
    pub storage_name: String,

    pub mime_type: String,

    /// Chunk size the file was cut with; reassembly must use the same value.
    pub chunk_size: i64,

    pub total_size: i64,
    pub total_chunks: i64,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the file is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields needed to open a new file record.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub container_id: i64,
    pub owner_id: i64,
    pub display_name: String,
    pub mime_type: String,
    pub chunk_size: u64,
}
