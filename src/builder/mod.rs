// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Building archives from content
//!
//! The root of a UnixFS DAG is only known once every block below it exists,
//! but the CAR header naming it comes first. [`CarBuilder`] resolves this in
//! two phases:
//!
//! 1. open the archive with [`PLACEHOLDER_ROOT`], stream every block the
//!    importer emits into it and finalize it;
//! 2. overwrite the header frame in place with one naming the real root.
//!
//! The placeholder has the same encoded width as any root the importer can
//! produce, so the header keeps its size and no block frame moves.

mod config;
mod placeholder;

pub use config::BuilderConfig;
pub use placeholder::{PLACEHOLDER_ROOT, patch_car_bytes, patch_car_file};

use crate::car::{
    BlockSink, CarBlockstore, CarError, CarStats, FileCarBlockstore, MemoryCarBlockstore,
    StorageBackend,
};
use crate::unixfs::{UnixFsEncoder, entry_name};
use crate::utils::db::car_stream::CarBlock;
use anyhow::{Context as _, bail};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Content to archive.
#[derive(Debug, Clone)]
pub enum CarInput {
    /// A file or directory on disk.
    Path(PathBuf),
    /// A file held in memory.
    Memory { name: String, data: Bytes },
}

impl CarInput {
    /// Name of the entry inside a wrapping directory.
    pub fn name(&self) -> anyhow::Result<String> {
        match self {
            CarInput::Path(path) => entry_name(path),
            CarInput::Memory { name, .. } => Ok(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Use the file's own DAG root instead of wrapping it in a directory.
    /// Not available for directories.
    pub bare: bool,
    /// The input must be a directory. Checked against the file system.
    pub is_directory: bool,
    /// Stops the build before the next block is issued.
    pub signal: Option<CancellationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarLocation {
    File(PathBuf),
    Memory(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct BuiltCar {
    pub location: CarLocation,
    pub root: Cid,
    pub header_size: u64,
    pub stats: CarStats,
}

pub struct CarBuilder {
    config: BuilderConfig,
    encoder: UnixFsEncoder,
}

impl CarBuilder {
    pub fn new(config: BuilderConfig) -> anyhow::Result<Self> {
        let encoder = UnixFsEncoder::new(config.importer.clone())?;
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Builds `<output_dir>/<name>.car`.
    pub async fn build(
        &self,
        input: &CarInput,
        options: &BuildOptions,
    ) -> anyhow::Result<BuiltCar> {
        let output = self
            .config
            .output_dir()
            .join(format!("{}.car", input.name()?));
        self.build_to_file(input, output, options).await
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(bare = options.bare, directory = options.is_directory)
    )]
    pub async fn build_to_file(
        &self,
        input: &CarInput,
        output: impl Into<PathBuf>,
        options: &BuildOptions,
    ) -> anyhow::Result<BuiltCar> {
        let output = output.into();
        self.validate(input, options).await?;

        let mut store = FileCarBlockstore::create(&output, *PLACEHOLDER_ROOT);
        let built = match self.run(&mut store, input, options).await {
            Ok((root, header_size)) => patch_car_file(&output, root, header_size)
                .await
                .map(|()| (root, header_size))
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        let (root, header_size) = match built {
            Ok(built) => built,
            Err(e) => {
                remove_partial(&output).await;
                return Err(e);
            }
        };
        info!(path = %output.display(), %root, "built CAR file");
        Ok(BuiltCar {
            location: CarLocation::File(output),
            root,
            header_size,
            stats: store.get_stats(),
        })
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(bare = options.bare, directory = options.is_directory)
    )]
    pub async fn build_in_memory(
        &self,
        input: &CarInput,
        options: &BuildOptions,
    ) -> anyhow::Result<BuiltCar> {
        self.validate(input, options).await?;

        let mut store = MemoryCarBlockstore::in_memory(*PLACEHOLDER_ROOT);
        let (root, header_size) = self.run(&mut store, input, options).await?;
        let mut car = store.to_bytes()?;
        patch_car_bytes(&mut car, root, header_size)?;
        debug!(%root, size = car.len(), "built in-memory CAR");
        Ok(BuiltCar {
            location: CarLocation::Memory(car),
            root,
            header_size,
            stats: store.get_stats(),
        })
    }

    async fn validate(&self, input: &CarInput, options: &BuildOptions) -> anyhow::Result<()> {
        if options.bare && options.is_directory {
            bail!("bare mode is not supported for directories");
        }
        match input {
            CarInput::Path(path) => {
                let metadata = tokio::fs::metadata(path)
                    .await
                    .with_context(|| format!("failed to stat {}", path.display()))?;
                match (metadata.is_dir(), options.is_directory) {
                    (true, false) => bail!("{} is a directory", path.display()),
                    (false, true) => bail!("{} is not a directory", path.display()),
                    _ => Ok(()),
                }
            }
            CarInput::Memory { .. } if options.is_directory => {
                bail!("in-memory input cannot be a directory")
            }
            CarInput::Memory { .. } => Ok(()),
        }
    }

    /// Encodes `input` into `store` and finalizes it. On failure the store
    /// is cleaned up before the error is returned.
    async fn run<B: StorageBackend>(
        &self,
        store: &mut CarBlockstore<B>,
        input: &CarInput,
        options: &BuildOptions,
    ) -> anyhow::Result<(Cid, u64)> {
        let result = self.encode_and_finalize(store, input, options).await;
        if let Err(e) = &result {
            warn!("CAR build failed: {e:#}");
            store.cleanup().await;
        }
        result
    }

    async fn encode_and_finalize<B: StorageBackend>(
        &self,
        store: &mut CarBlockstore<B>,
        input: &CarInput,
        options: &BuildOptions,
    ) -> anyhow::Result<(Cid, u64)> {
        let header_size = store.initialize().await?;
        let mut sink = CancellableSink {
            inner: &mut *store,
            signal: options.signal.as_ref(),
        };
        let root = self.encode(input, options, &mut sink).await?;
        let stats = store.finalize().await?;
        debug!(
            %root,
            blocks = stats.blocks_written,
            bytes = stats.total_bytes,
            "encoded content"
        );
        Ok((root, header_size))
    }

    async fn encode(
        &self,
        input: &CarInput,
        options: &BuildOptions,
        sink: &mut (dyn BlockSink + '_),
    ) -> anyhow::Result<Cid> {
        match input {
            CarInput::Path(path) if options.is_directory => {
                self.encoder.wrap_directory(path, sink).await
            }
            CarInput::Path(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let reader = BufReader::new(file);
                if options.bare {
                    Ok(self.encoder.encode_file(reader, sink).await?.cid)
                } else {
                    self.encoder.wrap_file(&input.name()?, reader, sink).await
                }
            }
            CarInput::Memory { name, data } => {
                if options.bare {
                    Ok(self.encoder.encode_file(&data[..], sink).await?.cid)
                } else {
                    self.encoder.wrap_file(name, &data[..], sink).await
                }
            }
        }
    }
}

/// Refuses further blocks once `signal` fires. A block already handed to
/// the inner sink always completes.
struct CancellableSink<'a, S: ?Sized> {
    inner: &'a mut S,
    signal: Option<&'a CancellationToken>,
}

#[async_trait]
impl<S: BlockSink + ?Sized> BlockSink for CancellableSink<'_, S> {
    async fn put_block(&mut self, block: CarBlock) -> anyhow::Result<()> {
        if self.signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(CarError::Aborted.into());
        }
        self.inner.put_block(block).await
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial CAR file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial CAR file: {e}"),
    }
}
