// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::StorageBackend;
use crate::car::{CarBlockstore, CarError};
use crate::utils::db::car_stream::{CarBlock, CarHeader};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use std::io;

/// A [`CarBlockstore`] that keeps the archive in memory.
pub type MemoryCarBlockstore = CarBlockstore<MemoryBackend>;

impl CarBlockstore<MemoryBackend> {
    pub fn in_memory(root: Cid) -> Self {
        Self::new(MemoryBackend::default(), root)
    }

    /// The finished archive. See [`MemoryBackend::to_bytes`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, CarError> {
        self.backend().to_bytes()
    }
}

/// Collects emitted frames in order. Reading single blocks back is not
/// supported: consumers of this backend take the whole archive.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    chunks: Vec<Bytes>,
    bytes_written: u64,
    initialized: bool,
    finalized: bool,
}

impl MemoryBackend {
    /// Number of bytes emitted so far.
    pub fn len(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// Concatenates all emitted frames. Only available once finalized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CarError> {
        if !self.finalized {
            return Err(CarError::NotFinalized);
        }
        let capacity = usize::try_from(self.bytes_written).map_err(io::Error::other)?;
        let mut bytes = Vec::with_capacity(capacity);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        Ok(bytes)
    }

    fn push(&mut self, chunk: Bytes) {
        self.bytes_written += chunk.len() as u64;
        self.chunks.push(chunk);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn initialize(&mut self, root: Cid) -> Result<u64, CarError> {
        let header = CarHeader::new(root).to_frame()?;
        let header_len = header.len() as u64;
        self.chunks.clear();
        self.bytes_written = 0;
        self.push(header);
        self.initialized = true;
        Ok(header_len)
    }

    async fn write_block(&mut self, block: CarBlock, offset: u64) -> Result<(), CarError> {
        if self.finalized {
            return Err(CarError::Finalized);
        }
        if !self.initialized {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory backend is not initialized",
            )
            .into());
        }
        if offset != self.bytes_written {
            return Err(CarError::OffsetMismatch {
                expected: offset,
                actual: self.bytes_written,
            });
        }
        self.push(block.to_frame()?);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), CarError> {
        self.finalized = true;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CarError> {
        if !self.finalized {
            self.chunks.clear();
            self.bytes_written = 0;
        }
        Ok(())
    }
}
