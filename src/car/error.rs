// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use thiserror::Error;

/// Errors raised by [`CarBlockstore`](super::CarBlockstore) and its storage backends.
#[derive(Debug, Error)]
pub enum CarError {
    #[error("CAR archive is already finalized")]
    Finalized,
    #[error("CAR archive is not finalized yet")]
    NotFinalized,
    #[error("block not found in CAR archive: {0}")]
    NotFound(Cid),
    #[error("unsupported operation on an append-only CAR archive: {0}")]
    UnsupportedOperation(&'static str),
    #[error("CAR archive is unusable after a failed write, only cleanup is allowed")]
    Unusable,
    #[error("operation was aborted")]
    Aborted,
    #[error("short read for block {cid}: expected {expected} bytes, got {actual}")]
    ShortRead {
        cid: Cid,
        expected: u64,
        actual: u64,
    },
    #[error("archive offset mismatch: expected {expected}, backend is at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("header size would change from {expected} to {actual} bytes")]
    HeaderSizeMismatch { expected: u64, actual: u64 },
    #[error("CAR backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}
