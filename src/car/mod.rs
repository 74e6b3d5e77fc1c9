// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Append-only CAR blockstore
//!
//! [`CarBlockstore`] turns a sequence of `put`s into a CARv1 archive while
//! keeping an in-memory index of where each block's data landed, so blocks
//! can be read back without rescanning the archive.
//!
//! ```text
//!  header_size        frame_offset
//!  │◄──────────►│     │
//!  ├────────────┼─────┼───────────┬───┬──────────┬─────
//!  │ header     │ ... │body length│cid│block data│ ...
//!  └────────────┴─────┴───────────┴───┼──────────┤
//!                                     │◄────────►│
//!                        block_start ►│  block_length
//! ```
//!
//! Blocks are content addressed, so a CID that is already indexed is never
//! written twice. Nothing can be removed once written.
//!
//! The byte medium is abstracted by [`StorageBackend`]: the offset arithmetic
//! is identical for [`FileBackend`] and [`MemoryBackend`], so both produce
//! the same bytes for the same sequence of blocks.

pub mod backend;
mod error;
mod stats;

pub use backend::{
    BlockByteStream, FileBackend, FileCarBlockstore, MemoryBackend, MemoryCarBlockstore,
    StorageBackend,
};
pub use error::CarError;
pub use stats::{BlockOffset, CarStats};

use crate::utils::db::car_stream::CarBlock;
use async_trait::async_trait;
use cid::Cid;
use futures::{Stream, StreamExt as _, TryStreamExt as _, future};
use indexmap::IndexMap;
use integer_encoding::VarInt as _;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Diagnostics published by a [`CarBlockstore`]. See [`CarBlockstore::with_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarEvent {
    BlockStored { cid: Cid, offset: BlockOffset },
    BlockMissing { cid: Cid },
}

/// Anything that accepts the blocks of a DAG as they are produced.
#[async_trait]
pub trait BlockSink: Send {
    async fn put_block(&mut self, block: CarBlock) -> anyhow::Result<()>;
}

pub struct CarBlockstore<B> {
    backend: B,
    root: Cid,
    index: IndexMap<Cid, BlockOffset, ahash::RandomState>,
    /// Where the next frame starts. Only meaningful once initialized.
    offset: u64,
    header_size: Option<u64>,
    poisoned: bool,
    stats: Mutex<CarStats>,
    events: Option<flume::Sender<CarEvent>>,
}

impl<B: StorageBackend> CarBlockstore<B> {
    /// `root` goes into the archive header. It may be a placeholder of the
    /// same encoded width as the real root, to be patched after finalizing.
    pub fn new(backend: B, root: Cid) -> Self {
        Self {
            backend,
            root,
            index: IndexMap::default(),
            offset: 0,
            header_size: None,
            poisoned: false,
            stats: Mutex::new(CarStats::new()),
            events: None,
        }
    }

    /// Publishes [`CarEvent`]s to `sender`. Events are dropped when the
    /// channel is full or disconnected.
    pub fn with_events(mut self, sender: flume::Sender<CarEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn root(&self) -> Cid {
        self.root
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Size of the header frame, once initialized.
    pub fn header_size(&self) -> Option<u64> {
        self.header_size
    }

    /// Archive size so far: header plus every frame written.
    pub fn current_offset(&self) -> u64 {
        self.offset
    }

    pub fn block_offset(&self, cid: &Cid) -> Option<BlockOffset> {
        self.index.get(cid).copied()
    }

    pub fn is_finalized(&self) -> bool {
        self.stats.lock().finalized
    }

    /// Writes the archive header. Idempotent, and implied by the first `put`.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %self.root))]
    pub async fn initialize(&mut self) -> Result<u64, CarError> {
        if let Some(header_size) = self.header_size {
            return Ok(header_size);
        }
        let header_size = self.backend.initialize(self.root).await?;
        debug!(root = %self.root, header_size, "initialized CAR archive");
        self.header_size = Some(header_size);
        self.offset = header_size;
        Ok(header_size)
    }

    /// Appends a block, unless a block with the same CID was already written.
    /// Returns `cid` unchanged.
    ///
    /// A failed write leaves the store [`CarError::Unusable`]: every later
    /// `put` and `finalize` fails, and only [`CarBlockstore::cleanup`] remains.
    #[tracing::instrument(level = "trace", skip_all, fields(%cid))]
    pub async fn put(&mut self, cid: Cid, data: Vec<u8>) -> Result<Cid, CarError> {
        self.ensure_writable()?;
        self.initialize().await?;
        if self.index.contains_key(&cid) {
            trace!(%cid, "skipping duplicate block");
            return Ok(cid);
        }

        let body_len = cid.encoded_len() + data.len();
        let frame_offset = self.offset;
        let block_start = frame_offset + (body_len.required_space() + cid.encoded_len()) as u64;
        let location = BlockOffset {
            block_start,
            block_length: data.len() as u64,
        };
        // The index entry exists before the write is issued.
        self.index.insert(cid, location);
        self.offset = block_start + location.block_length;

        if let Err(e) = self
            .backend
            .write_block(CarBlock { cid, data }, frame_offset)
            .await
        {
            self.poisoned = true;
            return Err(e);
        }

        let stats = self.stats.get_mut();
        stats.blocks_written += 1;
        stats.total_bytes += location.block_length;
        trace!(%cid, block_start, block_length = location.block_length, "stored block");
        self.emit(CarEvent::BlockStored {
            cid,
            offset: location,
        });
        Ok(cid)
    }

    /// Streams the data of a written block from the backend.
    ///
    /// `signal` is checked before the lookup and before every chunk is
    /// yielded. A cancelled read ends with [`CarError::Aborted`].
    pub async fn get(
        &self,
        cid: &Cid,
        signal: Option<&CancellationToken>,
    ) -> Result<BlockByteStream, CarError> {
        check_signal(signal)?;
        let Some(location) = self.block_offset(cid) else {
            debug!(%cid, "block missing from CAR archive");
            self.stats.lock().missing_blocks.insert(*cid);
            self.emit(CarEvent::BlockMissing { cid: *cid });
            return Err(CarError::NotFound(*cid));
        };
        let chunks = self.backend.read_block(*cid, location).await?;
        Ok(until_aborted(chunks, signal.cloned()).boxed())
    }

    /// [`CarBlockstore::get`], collected into a single buffer.
    pub async fn get_bytes(
        &self,
        cid: &Cid,
        signal: Option<&CancellationToken>,
    ) -> Result<Vec<u8>, CarError> {
        let chunks: Vec<_> = self.get(cid, signal).await?.try_collect().await?;
        Ok(chunks.concat())
    }

    /// Only consults the index, never the backend. A CID is indexed before
    /// its write is issued, so a block whose write failed still answers
    /// `true`.
    pub fn has(&self, cid: &Cid) -> bool {
        self.index.contains_key(cid)
    }

    pub async fn delete(&self, _cid: &Cid) -> Result<(), CarError> {
        Err(CarError::UnsupportedOperation("delete"))
    }

    pub async fn delete_many(
        &self,
        _cids: impl Stream<Item = Cid> + Send,
    ) -> Result<(), CarError> {
        Err(CarError::UnsupportedOperation("delete_many"))
    }

    /// Puts every block of `blocks` in order, yielding each CID as it is
    /// stored.
    pub fn put_many<'a>(
        &'a mut self,
        blocks: impl Stream<Item = CarBlock> + Send + 'a,
    ) -> impl Stream<Item = Result<Cid, CarError>> + 'a {
        futures::stream::unfold(
            (self, Box::pin(blocks)),
            |(this, mut blocks)| async move {
                let CarBlock { cid, data } = blocks.next().await?;
                let result = this.put(cid, data).await;
                Some((result, (this, blocks)))
            },
        )
    }

    /// Reads every CID of `cids` in order. Each entry is delivered whole or
    /// not at all. A signal that is already cancelled yields a single
    /// [`CarError::Aborted`], even for an empty `cids`.
    pub fn get_many<'a>(
        &'a self,
        cids: impl Stream<Item = Cid> + Send + 'a,
        signal: Option<&CancellationToken>,
    ) -> impl Stream<Item = Result<CarBlock, CarError>> + 'a {
        let signal = signal.cloned();
        let blocks = {
            let signal = signal.clone();
            cids.then(move |cid| {
                let signal = signal.clone();
                async move {
                    let data = self.get_bytes(&cid, signal.as_ref()).await?;
                    Ok(CarBlock { cid, data })
                }
            })
        };
        let started = {
            let signal = signal.clone();
            futures::stream::once(async move { check_signal(signal.as_ref()) })
                .filter_map(|checked| future::ready(checked.err().map(Err)))
        };
        until_aborted(started.chain(blocks), signal)
    }

    /// Reads every written block, in write order.
    pub fn get_all<'a>(
        &'a self,
        signal: Option<&CancellationToken>,
    ) -> impl Stream<Item = Result<CarBlock, CarError>> + 'a {
        let cids: Vec<Cid> = self.index.keys().copied().collect();
        self.get_many(futures::stream::iter(cids), signal)
    }

    /// Closes the backend and makes the archive immutable. Calling it again
    /// returns the same statistics.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %self.root))]
    pub async fn finalize(&mut self) -> Result<CarStats, CarError> {
        if self.is_finalized() {
            return Ok(self.get_stats());
        }
        if self.poisoned {
            return Err(CarError::Unusable);
        }
        self.initialize().await?;
        if let Err(e) = self.backend.finalize().await {
            self.poisoned = true;
            return Err(e);
        }
        let stats = {
            let stats = self.stats.get_mut();
            stats.finalized = true;
            stats.clone()
        };
        debug!(
            root = %self.root,
            blocks = stats.blocks_written,
            size = self.offset,
            "finalized CAR archive"
        );
        Ok(stats)
    }

    pub fn get_stats(&self) -> CarStats {
        self.stats.lock().clone()
    }

    /// Releases backend resources on an error path. Never fails: backend
    /// errors are logged and swallowed, and the archive is marked finalized
    /// regardless.
    pub async fn cleanup(&mut self) {
        if let Err(e) = self.backend.cleanup().await {
            warn!(root = %self.root, "CAR backend cleanup failed: {e}");
        }
        self.stats.get_mut().finalized = true;
    }

    fn ensure_writable(&self) -> Result<(), CarError> {
        if self.is_finalized() {
            Err(CarError::Finalized)
        } else if self.poisoned {
            Err(CarError::Unusable)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: CarEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}

#[async_trait]
impl<B: StorageBackend> BlockSink for CarBlockstore<B> {
    async fn put_block(&mut self, block: CarBlock) -> anyhow::Result<()> {
        self.put(block.cid, block.data).await?;
        Ok(())
    }
}

fn check_signal(signal: Option<&CancellationToken>) -> Result<(), CarError> {
    match signal {
        Some(signal) if signal.is_cancelled() => Err(CarError::Aborted),
        _ => Ok(()),
    }
}

/// Passes items through until `signal` fires, then yields a single
/// [`CarError::Aborted`] in place of the next item and ends.
fn until_aborted<T>(
    stream: impl Stream<Item = Result<T, CarError>>,
    signal: Option<CancellationToken>,
) -> impl Stream<Item = Result<T, CarError>> {
    stream.scan(false, move |aborted, item| {
        let next = if *aborted {
            None
        } else if let Err(e) = check_signal(signal.as_ref()) {
            *aborted = true;
            Some(Err(e))
        } else {
            Some(item)
        };
        future::ready(next)
    })
}
