// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage media for [`CarBlockstore`](super::CarBlockstore).
//!
//! Offset bookkeeping and deduplication live in the blockstore; a backend
//! only knows how to persist already-framed bytes, and optionally how to read
//! a block back from a recorded [`BlockOffset`].

mod file;
mod memory;

pub use file::{FileBackend, FileCarBlockstore};
pub use memory::{MemoryBackend, MemoryCarBlockstore};

use super::{BlockOffset, CarError};
use crate::utils::db::car_stream::CarBlock;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;

/// Lazily produced block data. Nothing is read until the stream is polled.
pub type BlockByteStream = BoxStream<'static, Result<Bytes, CarError>>;

/// The lifecycle is strictly sequential:
/// `initialize` → `write_block`* → `finalize` | `cleanup`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes the archive header for `root` and returns its length in bytes.
    async fn initialize(&mut self, root: Cid) -> Result<u64, CarError>;

    /// Appends the frame of `block`. `offset` is where the core expects the
    /// frame to start; a backend must reject a write that would land elsewhere.
    ///
    /// Resolves once the frame has been accepted by the underlying writer.
    async fn write_block(&mut self, block: CarBlock, offset: u64) -> Result<(), CarError>;

    /// Reads the data of a previously written block.
    async fn read_block(
        &self,
        cid: Cid,
        location: BlockOffset,
    ) -> Result<BlockByteStream, CarError> {
        let _ = (cid, location);
        Err(CarError::UnsupportedOperation("read_block"))
    }

    /// Flushes and closes the medium. Nothing may be written afterwards.
    async fn finalize(&mut self) -> Result<(), CarError>;

    /// Releases resources on an error path. Must be callable at any point of
    /// the lifecycle, including after `finalize`.
    async fn cleanup(&mut self) -> Result<(), CarError>;
}
