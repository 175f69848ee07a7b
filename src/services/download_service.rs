//! Download and reassembly: streams a file's chunks back in order,
//! optionally starting mid-file.

use crate::{
    models::{
        chunk::{ChunkRecord, ChunkStatus},
        file::{FileRecord, FileStatus},
    },
    services::{
        engine::{TransferError, TransferResult},
        ledger::Ledger,
        object_store::ShardClient,
        remote::BlobStream,
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{fmt, io};
use tracing::{info, warn};

/// Where a download starts inside the chunk sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub start_chunk_index: u32,
    /// Byte offset within the first chunk.
    pub start_offset: u64,
}

/// Map a start byte onto the chunk that holds it.
///
/// Every chunk but the last is `chunk_size` bytes; the last holds the
/// remainder, or a full chunk when the size divides evenly.
pub fn plan_range(
    total_size: u64,
    total_chunks: u32,
    chunk_size: u64,
    start_byte: Option<u64>,
) -> TransferResult<RangePlan> {
    let start = start_byte.unwrap_or(0);
    if start_byte.is_some() && start >= total_size {
        return Err(TransferError::RangeNotSatisfiable {
            start,
            total_size,
        });
    }
    if chunk_size == 0 || total_chunks == 0 {
        return Ok(RangePlan {
            start_chunk_index: 0,
            start_offset: 0,
        });
    }

    let last_chunk_size = match total_size % chunk_size {
        0 => chunk_size,
        rest => rest,
    };
    let start_chunk_index = (start / chunk_size) as u32;
    let mut start_offset = start % chunk_size;
    if start_chunk_index == total_chunks - 1 {
        start_offset = start_offset.min(last_chunk_size);
    }

    Ok(RangePlan {
        start_chunk_index,
        start_offset,
    })
}

/// Inclusive byte range served by a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest {
    pub file_id: i64,
    pub container_id: i64,
    /// First byte to serve; `None` serves the whole file.
    pub start_byte: Option<u64>,
}

pub struct Download {
    pub file: FileRecord,
    /// Set for ranged requests.
    pub range: Option<ContentRange>,
    pub content_length: u64,
    pub body: BlobStream,
}

pub struct DownloadService {
    ledger: Ledger,
    shards: ShardClient,
}

impl DownloadService {
    pub fn new(ledger: Ledger, shards: ShardClient) -> Self {
        Self { ledger, shards }
    }

    /// Resolve the file and its chunks, and return a body that fetches them
    /// one after another. Ledger problems surface here; remote failures
    /// surface from the body.
    pub async fn open(&self, request: DownloadRequest) -> TransferResult<Download> {
        let file = self
            .ledger
            .find_file_in_container(request.file_id, request.container_id)
            .await?;
        if file.status != FileStatus::Completed {
            return Err(TransferError::NotReady {
                file_id: file.id,
                status: file.status,
            });
        }

        let total_size = file.total_size as u64;
        let total_chunks = file.total_chunks as u32;
        let plan = plan_range(
            total_size,
            total_chunks,
            file.chunk_size as u64,
            request.start_byte,
        )?;

        let chunks = if total_chunks == 0 {
            Vec::new()
        } else {
            self.ledger
                .chunks_from(file.id, plan.start_chunk_index)
                .await?
        };
        check_sequence(&file, plan.start_chunk_index, &chunks)?;

        let start = request.start_byte.unwrap_or(0);
        let range = request.start_byte.map(|start| ContentRange {
            start,
            end: total_size - 1,
            total: total_size,
        });

        info!(
            file_id = file.id,
            start_byte = start,
            start_chunk = plan.start_chunk_index,
            chunks = chunks.len(),
            "download started"
        );

        let body = self.chunk_stream(file.id, chunks, plan.start_offset);
        Ok(Download {
            content_length: total_size - start,
            range,
            body,
            file,
        })
    }

    /// Fetch chunks strictly in order; the next fetch starts only after the
    /// previous chunk is fully drained.
    fn chunk_stream(&self, file_id: i64, chunks: Vec<ChunkRecord>, start_offset: u64) -> BlobStream {
        let shards = self.shards.clone();
        stream::iter(chunks.into_iter().enumerate())
            .then(move |(position, chunk)| {
                let shards = shards.clone();
                let offset = if position == 0 { start_offset } else { 0 };
                async move {
                    shards
                        .fetch_chunk(chunk.shard_id, &chunk.stored_name, offset)
                        .await
                        .map_err(|err| {
                            warn!(
                                file_id,
                                sequence = chunk.sequence_number,
                                error = %err,
                                "chunk fetch failed, aborting download"
                            );
                            io::Error::other(err)
                        })
                }
            })
            .try_flatten()
            .boxed()
    }
}

/// The chunks from `start_index` on must be exactly the remaining
/// sequence numbers, in order.
fn check_sequence(file: &FileRecord, start_index: u32, chunks: &[ChunkRecord]) -> TransferResult<()> {
    let expected = (file.total_chunks as usize).saturating_sub(start_index as usize);
    if chunks.len() != expected {
        return Err(TransferError::LedgerInconsistency(format!(
            "file `{}` should have {} chunk(s) from index {}, ledger has {}",
            file.id,
            expected,
            start_index,
            chunks.len()
        )));
    }
    for (position, chunk) in chunks.iter().enumerate() {
        let want = i64::from(start_index) + position as i64;
        if chunk.sequence_number != want {
            return Err(TransferError::LedgerInconsistency(format!(
                "file `{}` is missing chunk {}",
                file.id, want
            )));
        }
        if chunk.status != ChunkStatus::Uploaded {
            return Err(TransferError::LedgerInconsistency(format!(
                "chunk {} of file `{}` is {:?}, not uploaded",
                want, file.id, chunk.status
            )));
        }
    }
    Ok(())
}
