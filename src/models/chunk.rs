//! Represents one fixed-size slice of a file stored in a shard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The engine only ever writes `Uploaded`. `Pending` and `Failed` rows can
/// come from other writers sharing the table, and downloads refuse them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    Failed,
}

/// A chunk row. Rows are only written once the chunk's bytes have been
/// pushed to its shard, and are never updated afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_id: i64,
    pub shard_id: i64,

    /// 0-based position of the chunk within its file.
    pub sequence_number: i64,

    /// Blob name inside the shard.
    pub stored_name: String,

    pub byte_size: i64,

    /// Hex MD5 of the chunk bytes.
    pub checksum: String,

    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
}

/// A chunk that has been durably committed and is ready to be recorded.
#[derive(Clone, Debug)]
pub struct NewChunk {
    pub file_id: i64,
    pub shard_id: i64,
    pub sequence_number: u32,
    pub stored_name: String,
    pub byte_size: u64,
    pub checksum: String,
}
