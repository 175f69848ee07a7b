//! Durable File / Chunk / Shard records in SQLite.
//!
//! Pure data access: every method is one query or one short transaction.
//! Business rules (rotation, retries, status transitions) live in the
//! services that call it. The `accounts` and `user_storage` tables belong to
//! surrounding collaborators; the engine only reads accounts and bumps the
//! quota counter.

use crate::{
    models::{
        account::Account,
        chunk::{ChunkRecord, ChunkStatus, NewChunk},
        file::{FileRecord, FileStatus, NewFile},
        shard::Shard,
    },
    services::engine::{TransferError, TransferResult},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{path::Path, sync::Arc};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, container_id, owner_id, display_name, storage_name, mime_type, \
     chunk_size, total_size, total_chunks, status, created_at, updated_at, deleted_at";

const CHUNK_COLUMNS: &str = "id, file_id, shard_id, sequence_number, stored_name, byte_size, \
     checksum, status, created_at";

const SHARD_COLUMNS: &str = "id, account_id, name, external_url, cumulative_bytes, sealed, created_at";

#[derive(Clone)]
pub struct Ledger {
    db: Arc<SqlitePool>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> Result<usize, sqlx::Error> {
        let statements = schema_statements(SCHEMA);

        for stmt in &statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt.as_str()).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    // --- files ---

    pub async fn create_file(&self, new: &NewFile) -> TransferResult<FileRecord> {
        let now = Utc::now();
        let storage_name = storage_name_for(&new.display_name, now);
        let sql = format!(
            "INSERT INTO files (container_id, owner_id, display_name, storage_name, mime_type,
                                chunk_size, total_size, total_chunks, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
             RETURNING {FILE_COLUMNS}"
        );
        let file = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(new.container_id)
            .bind(new.owner_id)
            .bind(&new.display_name)
            .bind(&storage_name)
            .bind(&new.mime_type)
            .bind(new.chunk_size as i64)
            .bind(FileStatus::InProgress)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;
        Ok(file)
    }

    /// Fetch a live (not soft-deleted) file.
    pub async fn find_file(&self, file_id: i64) -> TransferResult<FileRecord> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND deleted_at IS NULL");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(file_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(TransferError::FileNotFound(file_id))
    }

    /// Fetch a live file, requiring it to sit in `container_id`.
    pub async fn find_file_in_container(
        &self,
        file_id: i64,
        container_id: i64,
    ) -> TransferResult<FileRecord> {
        let file = self.find_file(file_id).await?;
        if file.container_id != container_id {
            return Err(TransferError::FileNotFound(file_id));
        }
        Ok(file)
    }

    pub async fn set_file_status(
        &self,
        file_id: i64,
        status: FileStatus,
    ) -> TransferResult<FileRecord> {
        let sql = format!(
            "UPDATE files SET status = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL
             RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(status)
            .bind(Utc::now())
            .bind(file_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(TransferError::FileNotFound(file_id))
    }

    /// Ids among `file_ids` that are live files of `container_id`.
    pub async fn files_in_container(
        &self,
        container_id: i64,
        file_ids: &[i64],
    ) -> TransferResult<Vec<i64>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT id FROM files WHERE deleted_at IS NULL AND container_id = ");
        builder.push_bind(container_id);
        builder.push(" AND id IN ");
        push_id_list(&mut builder, file_ids);
        builder.push(" ORDER BY id ASC");

        let ids = builder
            .build_query_scalar::<i64>()
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }

    /// Soft-delete files and drop their chunk rows in one transaction.
    /// Returns the number of files deleted.
    pub async fn remove_files(&self, file_ids: &[i64]) -> TransferResult<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.db.begin().await?;

        let mut chunks = QueryBuilder::<Sqlite>::new("DELETE FROM chunks WHERE file_id IN ");
        push_id_list(&mut chunks, file_ids);
        chunks.build().execute(&mut *tx).await?;

        let now = Utc::now();
        let mut files = QueryBuilder::<Sqlite>::new("UPDATE files SET deleted_at = ");
        files.push_bind(now);
        files.push(", updated_at = ");
        files.push_bind(now);
        files.push(" WHERE deleted_at IS NULL AND id IN ");
        push_id_list(&mut files, file_ids);
        let result = files.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // --- chunks ---

    /// Record a shipped chunk and grow its file's totals atomically.
    ///
    /// The chunk must carry the next sequence number of its file; anything
    /// else means the ledger and the transfer disagree.
    pub async fn record_chunk(&self, chunk: &NewChunk) -> TransferResult<ChunkRecord> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let updated = sqlx::query(
            "UPDATE files
             SET total_chunks = total_chunks + 1, total_size = total_size + ?, updated_at = ?
             WHERE id = ? AND total_chunks = ? AND deleted_at IS NULL",
        )
        .bind(chunk.byte_size as i64)
        .bind(now)
        .bind(chunk.file_id)
        .bind(i64::from(chunk.sequence_number))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(TransferError::LedgerInconsistency(format!(
                "chunk {} does not follow the recorded chunks of file `{}`",
                chunk.sequence_number, chunk.file_id
            )));
        }

        let sql = format!(
            "INSERT INTO chunks (file_id, shard_id, sequence_number, stored_name, byte_size,
                                 checksum, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {CHUNK_COLUMNS}"
        );
        let record = sqlx::query_as::<_, ChunkRecord>(&sql)
            .bind(chunk.file_id)
            .bind(chunk.shard_id)
            .bind(i64::from(chunk.sequence_number))
            .bind(&chunk.stored_name)
            .bind(chunk.byte_size as i64)
            .bind(&chunk.checksum)
            .bind(ChunkStatus::Uploaded)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    /// Chunks of a file with `sequence_number >= index`, in order.
    pub async fn chunks_from(&self, file_id: i64, index: u32) -> TransferResult<Vec<ChunkRecord>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE file_id = ? AND sequence_number >= ?
             ORDER BY sequence_number ASC"
        );
        let chunks = sqlx::query_as::<_, ChunkRecord>(&sql)
            .bind(file_id)
            .bind(i64::from(index))
            .fetch_all(&*self.db)
            .await?;
        Ok(chunks)
    }

    // --- shards ---

    pub async fn create_shard(
        &self,
        account_id: i64,
        name: &str,
        external_url: &str,
    ) -> TransferResult<Shard> {
        let sql = format!(
            "INSERT INTO shards (account_id, name, external_url, cumulative_bytes, sealed, created_at)
             VALUES (?, ?, ?, 0, 0, ?)
             RETURNING {SHARD_COLUMNS}"
        );
        let shard = sqlx::query_as::<_, Shard>(&sql)
            .bind(account_id)
            .bind(name)
            .bind(external_url)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await?;
        Ok(shard)
    }

    pub async fn find_shard(&self, shard_id: i64) -> TransferResult<Shard> {
        let sql = format!("SELECT {SHARD_COLUMNS} FROM shards WHERE id = ?");
        sqlx::query_as::<_, Shard>(&sql)
            .bind(shard_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(TransferError::ShardNotFound(shard_id))
    }

    /// Add `bytes` to a shard's running total and return the new total.
    pub async fn add_shard_bytes(&self, shard_id: i64, bytes: u64) -> TransferResult<u64> {
        let total = sqlx::query_scalar::<_, i64>(
            "UPDATE shards SET cumulative_bytes = cumulative_bytes + ?
             WHERE id = ?
             RETURNING cumulative_bytes",
        )
        .bind(bytes as i64)
        .bind(shard_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(TransferError::ShardNotFound(shard_id))?;
        Ok(total as u64)
    }

    pub async fn seal_shard(&self, shard_id: i64) -> TransferResult<()> {
        let result = sqlx::query("UPDATE shards SET sealed = 1 WHERE id = ?")
            .bind(shard_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TransferError::ShardNotFound(shard_id));
        }
        Ok(())
    }

    /// Shards holding chunks of `file_ids` and of no other file.
    pub async fn shards_exclusive_to(&self, file_ids: &[i64]) -> TransferResult<Vec<Shard>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SHARD_COLUMNS} FROM shards \
             WHERE id IN (SELECT shard_id FROM chunks WHERE file_id IN "
        ));
        push_id_list(&mut builder, file_ids);
        builder.push(") AND id NOT IN (SELECT shard_id FROM chunks WHERE file_id NOT IN ");
        push_id_list(&mut builder, file_ids);
        builder.push(") ORDER BY id ASC");

        let shards: Vec<Shard> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(shards)
    }

    /// Delete shard rows; chunk rows pointing at them cascade.
    pub async fn delete_shards(&self, shard_ids: &[i64]) -> TransferResult<u64> {
        if shard_ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM shards WHERE id IN ");
        push_id_list(&mut builder, shard_ids);
        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected())
    }

    // --- collaborators ---

    pub async fn find_account(&self, account_id: i64) -> TransferResult<Account> {
        sqlx::query_as::<_, Account>(
            "SELECT id, identity, email, secret_token, created_at FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(TransferError::AccountNotFound(account_id))
    }

    /// Charge `bytes` to a user's storage counter.
    pub async fn add_used_bytes(&self, user_id: i64, bytes: u64) -> TransferResult<()> {
        sqlx::query(
            "INSERT INTO user_storage (user_id, used_bytes) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET used_bytes = used_bytes + excluded.used_bytes",
        )
        .bind(user_id)
        .bind(bytes as i64)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn used_bytes(&self, user_id: i64) -> TransferResult<u64> {
        let used = sqlx::query_scalar::<_, i64>("SELECT used_bytes FROM user_storage WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&*self.db)
            .await?
            .unwrap_or(0);
        Ok(used as u64)
    }
}

/// Push `(?, ?, ...)` with one bind per id.
fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

/// Split a schema script into statements. `--` comment lines are dropped
/// first, so a `;` inside a comment never cuts a statement.
fn schema_statements(script: &str) -> Vec<String> {
    let code = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `<stem>_<unix-millis><ext>`, e.g. `report_1700000000000.pdf`.
fn storage_name_for(display_name: &str, now: DateTime<Utc>) -> String {
    let path = Path::new(display_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("file");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}_{}{}", stem, now.timestamp_millis(), ext)
}
