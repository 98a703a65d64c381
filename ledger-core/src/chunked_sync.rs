//! Chunked transport for checkpoint snapshots (§4.5): splits a large
//! payload into fixed-size, checksummed, optionally-compressed chunks
//! and tracks resumable download progress.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Fetch priority for a chunk, adopted from the original chunked-sync
/// design: critical state (UTXO set, recent blocks) is requested
/// before lower-priority history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// One chunk of a chunked-sync transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChunk {
    pub snapshot_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data_bytes: Vec<u8>,
    pub sha256_checksum: String,
    pub compressed: bool,
    pub priority: ChunkPriority,
    pub size: usize,
}

/// Splits `payload` into chunks of at most `chunk_size_bytes`,
/// optionally gzip-compressing each chunk's wire bytes. The checksum
/// is always computed over the *uncompressed* chunk bytes, so
/// integrity checking doesn't depend on whether the wire used
/// compression.
///
/// # Errors
///
/// Returns an error if gzip compression fails.
pub fn split_into_chunks(
    snapshot_id: &str,
    payload: &[u8],
    chunk_size_bytes: usize,
    compress: bool,
    priority: ChunkPriority,
) -> Result<Vec<SyncChunk>> {
    let raw_chunks: Vec<&[u8]> = payload.chunks(chunk_size_bytes.max(1)).collect();
    let total_chunks = u32::try_from(raw_chunks.len()).unwrap_or(u32::MAX);

    raw_chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let checksum = shared::Hash256::sha256(chunk).to_string();
            let wire_bytes = if compress { gzip_compress(chunk)? } else { chunk.to_vec() };

            Ok(SyncChunk {
                snapshot_id: snapshot_id.to_string(),
                chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
                total_chunks,
                data_bytes: wire_bytes,
                sha256_checksum: checksum,
                compressed: compress,
                priority,
                size: chunk.len(),
            })
        })
        .collect()
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| BlockchainError::IoError(e.to_string()))?;
    encoder.finish().map_err(|e| BlockchainError::IoError(e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BlockchainError::IoError(e.to_string()))?;
    Ok(out)
}

/// Decompresses (if needed) a chunk's wire bytes and verifies its
/// checksum against the uncompressed content.
///
/// # Errors
///
/// Returns [`BlockchainError::ChunkChecksumMismatch`] if the checksum
/// does not match, or an I/O error if decompression fails.
pub fn verify_and_decode_chunk(chunk: &SyncChunk) -> Result<Vec<u8>> {
    let bytes = if chunk.compressed { gzip_decompress(&chunk.data_bytes)? } else { chunk.data_bytes.clone() };

    let checksum = shared::Hash256::sha256(&bytes).to_string();
    if checksum != chunk.sha256_checksum {
        return Err(BlockchainError::ChunkChecksumMismatch);
    }

    Ok(bytes)
}

/// Resumable progress for a single snapshot transfer, persisted to
/// disk periodically so a restart doesn't re-download completed
/// chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub snapshot_id: String,
    pub downloaded_chunks: Vec<u32>,
    pub failed_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub started_at: i64,
}

impl SyncProgress {
    /// Starts tracking a new transfer.
    #[must_use]
    pub fn new(snapshot_id: impl Into<String>, total_chunks: u32, started_at: i64) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            downloaded_chunks: Vec::new(),
            failed_chunks: Vec::new(),
            total_chunks,
            started_at,
        }
    }

    /// Whether every chunk has been downloaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.downloaded_chunks.len() as u32 == self.total_chunks
    }

    fn mark_downloaded(&mut self, chunk_index: u32) {
        self.failed_chunks.retain(|&index| index != chunk_index);
        if !self.downloaded_chunks.contains(&chunk_index) {
            self.downloaded_chunks.push(chunk_index);
        }
    }

    fn mark_failed(&mut self, chunk_index: u32) {
        if !self.failed_chunks.contains(&chunk_index) {
            self.failed_chunks.push(chunk_index);
        }
    }
}

/// Reassembles a set of verified chunks and resumable progress for a
/// single in-flight snapshot transfer.
pub struct ChunkedTransfer {
    progress: SyncProgress,
    received: BTreeMap<u32, Vec<u8>>,
    persist_path: Option<std::path::PathBuf>,
    flush_every: u32,
}

impl ChunkedTransfer {
    /// Starts a new transfer, persisting progress to `persist_path`
    /// every `flush_every` chunks (0 disables periodic flushing; the
    /// caller should still call `persist` explicitly on completion).
    #[must_use]
    pub fn new(snapshot_id: impl Into<String>, total_chunks: u32, started_at: i64, persist_path: Option<std::path::PathBuf>, flush_every: u32) -> Self {
        Self {
            progress: SyncProgress::new(snapshot_id, total_chunks, started_at),
            received: BTreeMap::new(),
            persist_path,
            flush_every: flush_every.max(1),
        }
    }

    /// Resumes a transfer from previously persisted progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted progress file cannot be read.
    pub fn resume(persist_path: std::path::PathBuf) -> Result<Self> {
        let progress: Option<SyncProgress> = shared::persist::read_json(&persist_path)?;
        let progress = progress.ok_or_else(|| BlockchainError::Malformed("no persisted sync progress found".to_string()))?;
        Ok(Self {
            progress,
            received: BTreeMap::new(),
            persist_path: Some(persist_path),
            flush_every: 10,
        })
    }

    /// Ingests a single chunk: verifies its checksum, records it, and
    /// flushes progress to disk every `flush_every` chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk's checksum is invalid or
    /// persistence fails; the chunk is still recorded as failed so it
    /// can be retried.
    pub fn ingest_chunk(&mut self, chunk: &SyncChunk) -> Result<()> {
        match verify_and_decode_chunk(chunk) {
            Ok(bytes) => {
                self.received.insert(chunk.chunk_index, bytes);
                self.progress.mark_downloaded(chunk.chunk_index);
            }
            Err(e) => {
                self.progress.mark_failed(chunk.chunk_index);
                self.maybe_persist(true)?;
                return Err(e);
            }
        }

        let should_flush = self.flush_every == 1 || self.progress.downloaded_chunks.len() as u32 % self.flush_every == 0;
        self.maybe_persist(should_flush)?;
        Ok(())
    }

    fn maybe_persist(&self, force: bool) -> Result<()> {
        if !force {
            return Ok(());
        }
        if let Some(path) = &self.persist_path {
            shared::persist::write_json_atomic(path, &self.progress)?;
        }
        Ok(())
    }

    /// Returns the reassembled payload once every chunk has arrived,
    /// `None` otherwise.
    #[must_use]
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.progress.is_complete() {
            return None;
        }
        let mut payload = Vec::new();
        for index in 0..self.progress.total_chunks {
            payload.extend_from_slice(self.received.get(&index)?);
        }
        Some(payload)
    }

    /// The current progress snapshot.
    #[must_use]
    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_reassemble_round_trips_without_compression() {
        let payload = vec![7u8; 250];
        let chunks = split_into_chunks("snap-1", &payload, 100, false, ChunkPriority::Critical).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut transfer = ChunkedTransfer::new("snap-1", 3, 1_700_000_000, None, 2);
        for chunk in &chunks {
            transfer.ingest_chunk(chunk).unwrap();
        }

        assert!(transfer.progress().is_complete());
        assert_eq!(transfer.reassemble().unwrap(), payload);
    }

    #[test]
    fn split_and_reassemble_round_trips_with_gzip_compression() {
        let payload = b"checkpoint state payload bytes repeated ".repeat(20);
        let chunks = split_into_chunks("snap-2", &payload, 64, true, ChunkPriority::High).unwrap();
        assert!(chunks.iter().all(|c| c.compressed));

        let mut transfer = ChunkedTransfer::new("snap-2", chunks.len() as u32, 1_700_000_000, None, 1);
        for chunk in &chunks {
            transfer.ingest_chunk(chunk).unwrap();
        }

        assert_eq!(transfer.reassemble().unwrap(), payload);
    }

    #[test]
    fn tampered_chunk_fails_checksum_verification() {
        let payload = vec![1u8; 50];
        let mut chunks = split_into_chunks("snap-3", &payload, 100, false, ChunkPriority::Low).unwrap();
        chunks[0].data_bytes[0] ^= 0xff;

        let mut transfer = ChunkedTransfer::new("snap-3", 1, 1_700_000_000, None, 1);
        let result = transfer.ingest_chunk(&chunks[0]);

        assert!(matches!(result, Err(BlockchainError::ChunkChecksumMismatch)));
        assert_eq!(transfer.progress().failed_chunks, vec![0]);
    }
}
