// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chrono::{DateTime, Utc};
use cid::Cid;
use indexmap::IndexSet;

/// If you seek to `block_start` (from the start of the archive), and read
/// `block_length` bytes, you get the data addressed by a [`Cid`] (but NOT the
/// [`Cid`] itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockOffset {
    pub block_start: u64,
    pub block_length: u64,
}

/// Running counters of a [`CarBlockstore`](super::CarBlockstore).
///
/// Handed out by value, so callers never share state with the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarStats {
    /// Unique blocks written. Deduplicated puts are not counted.
    pub blocks_written: u64,
    /// Sum of block data lengths, excluding framing and CIDs.
    pub total_bytes: u64,
    /// CIDs that were requested but never written, in first-request order.
    pub missing_blocks: IndexSet<Cid, ahash::RandomState>,
    pub started_at: DateTime<Utc>,
    pub finalized: bool,
}

impl CarStats {
    pub(super) fn new() -> Self {
        Self {
            blocks_written: 0,
            total_bytes: 0,
            missing_blocks: Default::default(),
            started_at: Utc::now(),
            finalized: false,
        }
    }
}
