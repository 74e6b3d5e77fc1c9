// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Streaming CARv1 archive construction for UnixFS content.
//!
//! - [`car`]: an append-only blockstore that writes blocks straight into a
//!   CAR archive on disk or in memory and can read them back by offset.
//! - [`unixfs`]: the importer turning files and directories into blocks.
//! - [`builder`]: the driver tying both together, including the header
//!   root patch once the DAG root is known.

pub mod builder;
pub mod car;
pub mod unixfs;
pub mod utils;

pub use builder::{
    BuildOptions, BuilderConfig, BuiltCar, CarBuilder, CarInput, CarLocation, PLACEHOLDER_ROOT,
};
pub use car::{
    BlockOffset, BlockSink, CarBlockstore, CarError, CarEvent, CarStats, FileBackend,
    FileCarBlockstore, MemoryBackend, MemoryCarBlockstore, StorageBackend,
};
pub use unixfs::{ImporterConfig, UnixFsEncoder};
pub use utils::db::car_stream::{CarBlock, CarHeader, CarStream, CarWriter};
