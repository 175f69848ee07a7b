//! Stream chunker: cuts an inbound byte stream into fixed-size chunk files.
//!
//! Chunks are written to the transfer's staging directory and handed to the
//! shipper through a [`chunk_queue`]. A queue slot is taken before a chunk
//! file is started and only returned once the shipper drops the chunk, so
//! chunks being written, waiting, or in flight never exceed the capacity.
//! With no free slot the chunker stops pulling from the source, which in
//! turn pushes back on the client.

use crate::services::engine::{TransferError, TransferResult, TransferState};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch},
};
use tracing::{debug, warn};

/// A fully written chunk file, ready to be shipped. Holds its queue slot
/// until dropped.
#[derive(Debug)]
pub struct ReadyChunk {
    pub sequence: u32,
    pub path: PathBuf,
    pub byte_size: u64,
    /// Hex MD5 of the chunk contents.
    pub checksum: String,
    _slot: OwnedSemaphorePermit,
}

/// Producer half of a [`chunk_queue`].
pub struct ChunkSender {
    tx: mpsc::Sender<ReadyChunk>,
    slots: Arc<Semaphore>,
}

/// A queue admitting at most `capacity` live chunks, counting the ones the
/// receiver still holds.
pub fn chunk_queue(capacity: usize) -> (ChunkSender, mpsc::Receiver<ReadyChunk>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let slots = Arc::new(Semaphore::new(capacity));
    (ChunkSender { tx, slots }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkerSummary {
    pub chunks: u32,
    pub bytes: u64,
}

pub fn chunk_file_name(sequence: u32) -> String {
    format!("chunk_{sequence}")
}

pub struct StreamChunker {
    dir: PathBuf,
    chunk_size: u64,
    start_sequence: u32,
}

/// The chunk file currently being filled.
struct OpenChunk {
    sequence: u32,
    path: PathBuf,
    file: File,
    written: u64,
    digest: md5::Context,
    slot: OwnedSemaphorePermit,
}

impl OpenChunk {
    async fn create(dir: &Path, sequence: u32, slot: OwnedSemaphorePermit) -> io::Result<Self> {
        let path = dir.join(chunk_file_name(sequence));
        let file = File::create(&path).await?;
        Ok(Self {
            sequence,
            path,
            file,
            written: 0,
            digest: md5::Context::new(),
            slot,
        })
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.digest.consume(data);
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self) -> io::Result<ReadyChunk> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(ReadyChunk {
            sequence: self.sequence,
            path: self.path,
            byte_size: self.written,
            checksum: format!("{:x}", self.digest.compute()),
            _slot: self.slot,
        })
    }

    async fn discard(self) {
        let path = self.path;
        drop(self.file);
        if let Err(err) = fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "failed to remove partial chunk");
        }
    }
}

impl StreamChunker {
    /// `start_sequence` is the first sequence number to assign; non-zero
    /// when resuming a partially uploaded file.
    pub fn new(dir: impl Into<PathBuf>, chunk_size: u64, start_sequence: u32) -> Self {
        Self {
            dir: dir.into(),
            chunk_size: chunk_size.max(1),
            start_sequence,
        }
    }

    /// Read `source` to its end, emitting every completed chunk on `queue`.
    ///
    /// Every chunk except possibly the last is exactly `chunk_size` bytes.
    /// An empty source emits nothing. Returns early with
    /// [`TransferError::Aborted`] once `state` turns `Failed` or the
    /// receiver is gone.
    pub async fn run<S, E>(
        &self,
        source: S,
        queue: ChunkSender,
        mut state: watch::Receiver<TransferState>,
    ) -> TransferResult<ChunkerSummary>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<io::Error>,
    {
        let mut source = std::pin::pin!(source);
        let mut summary = ChunkerSummary::default();
        let mut sequence = self.start_sequence;
        let mut current: Option<OpenChunk> = None;
        // Slot for the next chunk, taken before its first byte is pulled.
        let mut slot: Option<OwnedSemaphorePermit> = None;

        loop {
            if current.is_none() && slot.is_none() {
                slot = Some(acquire_slot(&queue, &mut state).await?);
            }

            let next = tokio::select! {
                biased;
                _ = aborted(&mut state) => {
                    if let Some(open) = current.take() {
                        open.discard().await;
                    }
                    return Err(TransferError::Aborted);
                }
                next = source.next() => next,
            };

            let mut data = match next {
                None => break,
                Some(Ok(data)) => data,
                Some(Err(err)) => {
                    let err: io::Error = err.into();
                    if let Some(open) = current.take() {
                        open.discard().await;
                    }
                    return Err(TransferError::Source(err));
                }
            };
            summary.bytes += data.len() as u64;

            while !data.is_empty() {
                let mut open = match current.take() {
                    Some(open) => open,
                    None => {
                        let slot = match slot.take() {
                            Some(slot) => slot,
                            None => acquire_slot(&queue, &mut state).await?,
                        };
                        OpenChunk::create(&self.dir, sequence, slot).await?
                    }
                };

                let room = (self.chunk_size - open.written) as usize;
                let piece = data.split_to(room.min(data.len()));
                open.write(&piece).await?;

                if open.written == self.chunk_size {
                    self.emit(open, &queue, &mut state).await?;
                    summary.chunks += 1;
                    sequence += 1;
                } else {
                    current = Some(open);
                }
            }
        }

        // Chunk files are only opened for non-empty data, so a leftover one
        // is the undersized final chunk.
        if let Some(open) = current.take() {
            self.emit(open, &queue, &mut state).await?;
            summary.chunks += 1;
        }

        debug!(chunks = summary.chunks, bytes = summary.bytes, "input fully chunked");
        Ok(summary)
    }

    async fn emit(
        &self,
        open: OpenChunk,
        queue: &ChunkSender,
        state: &mut watch::Receiver<TransferState>,
    ) -> TransferResult<()> {
        let chunk = open.finish().await?;
        debug!(sequence = chunk.sequence, byte_size = chunk.byte_size, "chunk ready");

        tokio::select! {
            biased;
            _ = aborted(state) => Err(TransferError::Aborted),
            sent = queue.tx.send(chunk) => sent.map_err(|_| TransferError::Aborted),
        }
    }
}

/// Wait for a free queue slot.
async fn acquire_slot(
    queue: &ChunkSender,
    state: &mut watch::Receiver<TransferState>,
) -> TransferResult<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = aborted(state) => Err(TransferError::Aborted),
        _ = queue.tx.closed() => Err(TransferError::Aborted),
        slot = queue.slots.clone().acquire_owned() => slot.map_err(|_| TransferError::Aborted),
    }
}

/// Resolves once the transfer is marked `Failed`. Pends forever if the
/// state sender is gone.
pub(crate) async fn aborted(state: &mut watch::Receiver<TransferState>) {
    if state
        .wait_for(|s| *s == TransferState::Failed)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tempfile::TempDir;

    fn pieces(parts: &[&[u8]]) -> impl Stream<Item = io::Result<Bytes>> + use<> {
        let owned: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    async fn collect(
        chunker: &StreamChunker,
        source: impl Stream<Item = io::Result<Bytes>>,
    ) -> (TransferResult<ChunkerSummary>, Vec<ReadyChunk>) {
        let (queue, mut rx) = chunk_queue(16);
        let (_state_tx, state_rx) = watch::channel(TransferState::Active);
        let result = chunker.run(source, queue, state_rx).await;
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        (result, chunks)
    }

    #[tokio::test]
    async fn splits_writes_that_straddle_boundaries() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 4, 0);

        let (result, chunks) = collect(&chunker, pieces(&[b"abc", b"defgh", b"ij"])).await;
        let summary = result.unwrap();

        assert_eq!(summary, ChunkerSummary { chunks: 3, bytes: 10 });
        let sizes: Vec<u64> = chunks.iter().map(|c| c.byte_size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(fs::read(&chunks[0].path).await.unwrap(), b"abcd");
        assert_eq!(fs::read(&chunks[1].path).await.unwrap(), b"efgh");
        assert_eq!(fs::read(&chunks[2].path).await.unwrap(), b"ij");
        assert_eq!(chunks[2].path, tmp.path().join("chunk_2"));
        assert_eq!(chunks[0].checksum, format!("{:x}", md5::compute(b"abcd")));
    }

    #[tokio::test]
    async fn exact_multiple_leaves_no_trailing_chunk() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 5, 0);

        let (result, chunks) = collect(&chunker, pieces(&[b"01234", b"56789"])).await;

        assert_eq!(result.unwrap().chunks, 2);
        assert!(chunks.iter().all(|c| c.byte_size == 5));
        assert!(!tmp.path().join("chunk_2").exists());
    }

    #[tokio::test]
    async fn empty_input_emits_nothing() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 5, 0);

        let (result, chunks) = collect(&chunker, pieces(&[b"", b""])).await;

        assert_eq!(result.unwrap(), ChunkerSummary::default());
        assert!(chunks.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn resumed_run_continues_the_sequence() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 3, 7);

        let (_, chunks) = collect(&chunker, pieces(&[b"abcdef"])).await;

        let seqs: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![7, 8]);
        assert_eq!(chunks[1].path, tmp.path().join("chunk_8"));
    }

    #[tokio::test]
    async fn source_error_drops_the_partial_chunk() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 4, 0);
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abcdef")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let (result, chunks) = collect(&chunker, source).await;

        assert!(matches!(result, Err(TransferError::Source(_))));
        assert_eq!(chunks.len(), 1);
        assert!(tmp.path().join("chunk_0").exists());
        assert!(!tmp.path().join("chunk_1").exists());
    }

    #[tokio::test]
    async fn chunks_in_flight_hold_their_slot() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 2, 0);

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(0..100u8).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(Bytes::from(vec![i, i]))
        });

        let (queue, mut rx) = chunk_queue(5);
        let (_state_tx, state_rx) = watch::channel(TransferState::Active);
        let task = tokio::spawn(async move { chunker.run(source, queue, state_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Five chunks hold every slot; the source is not read again.
        assert_eq!(pulled.load(Ordering::SeqCst), 5);

        // A received chunk is still in flight until it is dropped.
        let first = rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 5);

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 6);

        drop(rx);
        assert!(matches!(task.await.unwrap(), Err(TransferError::Aborted)));
    }

    #[tokio::test]
    async fn failed_state_aborts_a_blocked_chunker() {
        let tmp = TempDir::new().unwrap();
        let chunker = StreamChunker::new(tmp.path(), 2, 0);
        let source = stream::iter(0..100u8).map(|i| Ok::<_, io::Error>(Bytes::from(vec![i, i])));

        let (queue, _rx) = chunk_queue(1);
        let (state_tx, state_rx) = watch::channel(TransferState::Active);
        let task = tokio::spawn(async move { chunker.run(source, queue, state_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        state_tx.send(TransferState::Failed).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
        assert!(matches!(result.unwrap(), Err(TransferError::Aborted)));
    }
}
