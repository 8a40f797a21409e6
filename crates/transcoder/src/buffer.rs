//! Single-producer, multi-consumer replayable byte buffer.
//!
//! One [`ReplayWriter`] appends bytes; any number of [`ReplayReader`]s read
//! the full byte sequence from offset 0, whenever they were created. Readers
//! that catch up with the writer wait for more bytes or for the buffer to
//! close. Closing is one-way: the first outcome recorded (clean end or error)
//! is the one every reader observes once it has drained the written bytes.
//!
//! Bytes are kept as in-memory chunks until `spill_threshold` is exceeded;
//! after that the contents move to an anonymous temp file and later writes
//! append there.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::StreamError;

/// Upper bound on a single chunk read back from a spilled buffer.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub spill_threshold: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            spill_threshold: 32 * 1024 * 1024,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Progress {
    written: u64,
    end: Option<Result<(), StreamError>>,
}

#[derive(Default)]
struct MemoryChunks {
    starts: Vec<u64>,
    chunks: Vec<Bytes>,
    len: u64,
}

impl MemoryChunks {
    fn push(&mut self, chunk: Bytes) {
        self.starts.push(self.len);
        self.len += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    /// Bytes from `offset` up to the end of the chunk containing it, capped
    /// at `limit`. Requires `offset < limit <= self.len`.
    fn slice_from(&self, offset: u64, limit: u64) -> Bytes {
        let idx = self.starts.partition_point(|&s| s <= offset) - 1;
        let start = self.starts[idx];
        let chunk = &self.chunks[idx];
        let from = (offset - start) as usize;
        let to = (chunk.len() as u64).min(limit - start) as usize;
        chunk.slice(from..to)
    }
}

enum Backing {
    Memory(MemoryChunks),
    Spilled(Arc<File>),
}

enum Located {
    Ready(Bytes),
    OnDisk(Arc<File>),
}

struct Shared {
    backing: RwLock<Backing>,
    progress: watch::Sender<Progress>,
    options: BufferOptions,
}

impl Shared {
    fn close(&self, outcome: Result<(), StreamError>) -> bool {
        self.progress.send_if_modified(|p| {
            if p.end.is_some() {
                return false;
            }
            p.end = Some(outcome);
            true
        })
    }

    fn end(&self) -> Option<Result<(), StreamError>> {
        self.progress.borrow().end.clone()
    }

    fn spilled_file(&self) -> Option<Arc<File>> {
        match &*self.backing.read().unwrap_or_else(PoisonError::into_inner) {
            Backing::Memory(_) => None,
            Backing::Spilled(file) => Some(file.clone()),
        }
    }

    fn locate(&self, offset: u64, limit: u64) -> Located {
        match &*self.backing.read().unwrap_or_else(PoisonError::into_inner) {
            Backing::Memory(mem) => Located::Ready(mem.slice_from(offset, limit)),
            Backing::Spilled(file) => Located::OnDisk(file.clone()),
        }
    }

    async fn read_at(&self, offset: u64, limit: u64) -> Result<Bytes, StreamError> {
        let file = match self.locate(offset, limit) {
            Located::Ready(bytes) => return Ok(bytes),
            Located::OnDisk(file) => file,
        };
        let len = (limit - offset).min(READ_CHUNK as u64) as usize;
        let buf = run_blocking(move || {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| StreamError::Storage(e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

/// Shared handle to a replay buffer. Cheap to clone.
#[derive(Clone)]
pub struct ReplayBuffer {
    shared: Arc<Shared>,
}

impl ReplayBuffer {
    /// Create a buffer together with its only write handle.
    pub fn new(options: BufferOptions) -> (ReplayBuffer, ReplayWriter) {
        let (progress, _) = watch::channel(Progress::default());
        let shared = Arc::new(Shared {
            backing: RwLock::new(Backing::Memory(MemoryChunks::default())),
            progress,
            options,
        });
        let writer = ReplayWriter {
            shared: shared.clone(),
            written: 0,
        };
        (ReplayBuffer { shared }, writer)
    }

    /// A new cursor positioned at offset 0.
    pub fn reader(&self) -> ReplayReader {
        ReplayReader {
            shared: self.shared.clone(),
            progress: self.shared.progress.subscribe(),
            offset: 0,
        }
    }

    /// Close the buffer from outside the writer. Returns `false` if it was
    /// already closed, in which case the earlier outcome stands.
    pub fn close(&self, outcome: Result<(), StreamError>) -> bool {
        self.shared.close(outcome)
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.shared.progress.borrow().written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.progress.borrow().end.is_some()
    }

    /// Recorded outcome, if the buffer is closed.
    pub fn outcome(&self) -> Option<Result<(), StreamError>> {
        self.shared.end()
    }

    pub fn is_spilled(&self) -> bool {
        self.shared.spilled_file().is_some()
    }

    /// Wait until the buffer closes and return how it closed.
    pub async fn finished(&self) -> Result<(), StreamError> {
        let mut progress = self.shared.progress.subscribe();
        match progress.wait_for(|p| p.end.is_some()).await {
            Ok(p) => p.end.clone().unwrap_or(Err(StreamError::Aborted)),
            Err(_) => Err(StreamError::Aborted),
        }
    }
}

/// The single write handle of a [`ReplayBuffer`].
///
/// Dropping it without [`finish`](Self::finish) or [`fail`](Self::fail)
/// closes the buffer with [`StreamError::Aborted`].
pub struct ReplayWriter {
    shared: Arc<Shared>,
    written: u64,
}

impl ReplayWriter {
    /// Append a chunk. Fails once the buffer is closed, or when spilled
    /// storage cannot be written (the buffer is then closed with that error).
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        if let Some(end) = self.shared.end() {
            return Err(end.err().unwrap_or(StreamError::Aborted));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;

        let mut over_threshold = false;
        match self.shared.spilled_file() {
            Some(file) => {
                let offset = self.written;
                let stored = run_blocking(move || file.write_all_at(&chunk, offset)).await;
                if let Err(e) = stored {
                    return Err(self.storage_failure(e));
                }
            }
            None => {
                let mut backing = self
                    .shared
                    .backing
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Backing::Memory(mem) = &mut *backing {
                    mem.push(chunk);
                    over_threshold = mem.len > self.shared.options.spill_threshold as u64;
                }
            }
        }

        self.written += len;
        let written = self.written;
        self.shared.progress.send_if_modified(|p| {
            if p.end.is_some() {
                return false;
            }
            p.written = written;
            true
        });

        if over_threshold {
            self.spill().await?;
        }
        Ok(())
    }

    /// Close the buffer cleanly.
    pub fn finish(self) {
        self.shared.close(Ok(()));
    }

    /// Close the buffer with a terminal error.
    pub fn fail(self, err: StreamError) {
        self.shared.close(Err(err));
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    async fn spill(&mut self) -> Result<(), StreamError> {
        let chunks = match &*self
            .shared
            .backing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Backing::Memory(mem) => mem.chunks.clone(),
            Backing::Spilled(_) => return Ok(()),
        };
        let dir = self.shared.options.spill_dir.clone();

        let spilled = run_blocking(move || {
            let mut file = match dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            for chunk in &chunks {
                file.write_all(chunk)?;
            }
            Ok(file)
        })
        .await;

        match spilled {
            Ok(file) => {
                *self
                    .shared
                    .backing
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Backing::Spilled(Arc::new(file));
                debug!(bytes = self.written, "replay buffer spilled to disk");
                Ok(())
            }
            Err(e) => Err(self.storage_failure(e)),
        }
    }

    fn storage_failure(&self, e: io::Error) -> StreamError {
        warn!(error = %e, "replay buffer storage failed");
        let err = StreamError::Storage(e.to_string());
        self.shared.close(Err(err.clone()));
        err
    }
}

impl Drop for ReplayWriter {
    fn drop(&mut self) {
        self.shared.close(Err(StreamError::Aborted));
    }
}

/// Independent read cursor over a [`ReplayBuffer`].
pub struct ReplayReader {
    shared: Arc<Shared>,
    progress: watch::Receiver<Progress>,
    offset: u64,
}

impl ReplayReader {
    /// Next available chunk.
    ///
    /// Waits while caught up with an open buffer. `Ok(None)` marks a clean
    /// end of stream; an error close is reported once every byte written
    /// before it has been read.
    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let (written, end) = {
                let p = self.progress.borrow_and_update();
                (p.written, p.end.clone())
            };

            if self.offset < written {
                let chunk = self.shared.read_at(self.offset, written).await?;
                self.offset += chunk.len() as u64;
                return Ok(Some(chunk));
            }

            match end {
                Some(Ok(())) => return Ok(None),
                Some(Err(e)) => return Err(e),
                None => {}
            }

            if self.progress.changed().await.is_err() {
                return Err(StreamError::Aborted);
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_all(mut reader: ReplayReader) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn small(threshold: usize) -> BufferOptions {
        BufferOptions {
            spill_threshold: threshold,
            spill_dir: None,
        }
    }

    #[tokio::test]
    async fn readers_see_everything_whenever_they_attach() {
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions::default());
        let early = buffer.reader();

        writer.write(Bytes::from_static(b"hello ")).await.unwrap();
        let middle = buffer.reader();
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        writer.finish();
        let late = buffer.reader();

        for reader in [early, middle, late] {
            assert_eq!(read_all(reader).await.unwrap(), b"hello world");
        }
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.outcome(), Some(Ok(())));
    }

    #[tokio::test]
    async fn caught_up_reader_waits_for_writer() {
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions::default());
        let mut reader = buffer.reader();

        let pending = tokio::time::timeout(Duration::from_millis(30), reader.read()).await;
        assert!(pending.is_err());

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write(Bytes::from_static(b"abc")).await.unwrap();
            writer.finish();
        });

        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(reader.read().await.unwrap(), None);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn error_arrives_after_buffered_bytes() {
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions::default());
        let mut reader = buffer.reader();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.fail(StreamError::Pipe("broken".into()));

        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert_eq!(reader.read().await, Err(StreamError::Pipe("broken".into())));
        // readers created afterwards get the same bytes, then the same error
        assert_eq!(
            read_all(buffer.reader()).await,
            Err(StreamError::Pipe("broken".into()))
        );
    }

    #[tokio::test]
    async fn clean_end_is_final() {
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions::default());
        writer.write(Bytes::from_static(b"done")).await.unwrap();
        writer.finish();

        assert!(!buffer.close(Err(StreamError::Aborted)));
        assert_eq!(read_all(buffer.reader()).await.unwrap(), b"done");
        assert_eq!(buffer.finished().await, Ok(()));
    }

    #[tokio::test]
    async fn external_close_stops_the_writer() {
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions::default());
        writer.write(Bytes::from_static(b"x")).await.unwrap();
        assert!(buffer.close(Err(StreamError::Aborted)));
        assert_eq!(
            writer.write(Bytes::from_static(b"y")).await,
            Err(StreamError::Aborted)
        );
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn dropped_writer_aborts() {
        let (buffer, writer) = ReplayBuffer::new(BufferOptions::default());
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.finished().await })
        };
        drop(writer);
        assert_eq!(waiter.await.unwrap(), Err(StreamError::Aborted));
    }

    #[tokio::test]
    async fn spilled_buffer_replays_identical_bytes() {
        let (buffer, mut writer) = ReplayBuffer::new(small(16));
        let mut early = buffer.reader();

        let mut expected = Vec::new();
        for i in 0..10u8 {
            let chunk = vec![b'a' + i; 5];
            expected.extend_from_slice(&chunk);
            writer.write(Bytes::from(chunk)).await.unwrap();
            if i == 1 {
                // partially consumed before the spill happens
                let first = early.read().await.unwrap().unwrap();
                assert_eq!(&first[..], b"aaaaa");
            }
        }
        writer.finish();
        assert!(buffer.is_spilled());

        let mut rest = b"aaaaa".to_vec();
        rest.extend(read_all(early).await.unwrap());
        assert_eq!(rest, expected);
        assert_eq!(read_all(buffer.reader()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn spill_honours_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, mut writer) = ReplayBuffer::new(BufferOptions {
            spill_threshold: 4,
            spill_dir: Some(dir.path().to_path_buf()),
        });
        writer.write(Bytes::from_static(b"0123456789")).await.unwrap();
        writer.write(Bytes::from_static(b"abc")).await.unwrap();
        writer.finish();
        assert!(buffer.is_spilled());
        assert_eq!(read_all(buffer.reader()).await.unwrap(), b"0123456789abc");
    }
}
