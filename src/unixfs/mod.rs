// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! # UnixFS importer
//!
//! Encodes files and directory trees as UnixFS DAGs and hands every block to
//! a [`BlockSink`] as soon as it exists.
//!
//! - File contents are split into fixed-size chunks stored as raw leaves
//!   (CIDv1, codec `0x55`, sha2-256). A single-chunk file is its own root.
//! - Larger files get a balanced tree of DAG-PB parents with at most
//!   [`ImporterConfig::max_children_per_node`] children each.
//! - Directories are flat DAG-PB nodes with links sorted by name.
//!
//! Children are always emitted before their parents, and the same input
//! always yields the same blocks in the same order.

mod directory;
mod file;
pub mod pb;

use self::directory::{DirectoryTree, TreeEntry};
use crate::car::BlockSink;
use crate::utils::db::car_stream::CarBlock;
use anyhow::Context as _;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest as _};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, BufReader};
use tracing::debug;

/// Multicodec of raw binary leaves.
pub const RAW: u64 = 0x55;
/// Multicodec of DAG-PB nodes.
pub const DAG_PB: u64 = 0x70;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct ImporterConfig {
    /// Size of a file chunk in bytes.
    #[default(1024 * 1024)]
    pub chunk_size: usize,
    #[default(1024)]
    pub max_children_per_node: usize,
    /// Whether dot-files and dot-directories are imported.
    #[default(true)]
    pub include_hidden: bool,
}

/// Reference to an encoded DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub cid: Cid,
    /// Cumulative size of every block of the DAG.
    pub tsize: u64,
    /// Size of the file content. Zero for directories.
    pub filesize: u64,
}

pub(crate) fn raw_block(data: Vec<u8>) -> CarBlock {
    CarBlock {
        cid: Cid::new_v1(RAW, Code::Sha2_256.digest(&data)),
        data,
    }
}

pub(crate) fn dag_pb_block(data: Vec<u8>) -> CarBlock {
    CarBlock {
        cid: Cid::new_v1(DAG_PB, Code::Sha2_256.digest(&data)),
        data,
    }
}

#[derive(Debug, Clone)]
pub struct UnixFsEncoder {
    config: ImporterConfig,
}

impl UnixFsEncoder {
    pub fn new(config: ImporterConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.chunk_size > 0, "chunk size must be positive");
        anyhow::ensure!(
            config.max_children_per_node >= 2,
            "a file node needs room for at least 2 children, got {}",
            config.max_children_per_node
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    /// Encodes the content of `reader` as a file DAG and returns its root.
    pub async fn encode_file<S>(
        &self,
        reader: impl AsyncRead + Unpin + Send,
        sink: &mut S,
    ) -> anyhow::Result<Link>
    where
        S: BlockSink + ?Sized,
    {
        file::encode_file(&self.config, reader, sink).await
    }

    /// Encodes `reader` as a file named `name` inside a wrapping directory,
    /// and returns the CID of that directory.
    pub async fn wrap_file<S>(
        &self,
        name: &str,
        reader: impl AsyncRead + Unpin + Send,
        sink: &mut S,
    ) -> anyhow::Result<Cid>
    where
        S: BlockSink + ?Sized,
    {
        let link = self.encode_file(reader, sink).await?;
        let mut tree = DirectoryTree::default();
        tree.insert(&[name.to_owned()], TreeEntry::File(link))?;
        emit_tree(&tree, sink).await
    }

    /// Encodes the directory at `path` as a subdirectory, named after it, of
    /// a wrapping directory. Returns the CID of the wrapping directory.
    ///
    /// Symbolic links are skipped. An empty directory encodes to the empty
    /// wrapper alone. The subdirectory takes the name `path` was given by,
    /// even when `path` is itself a symbolic link.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn wrap_directory<S>(&self, path: &Path, sink: &mut S) -> anyhow::Result<Cid>
    where
        S: BlockSink + ?Sized,
    {
        let root = absolute_path(path)
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        let name = entry_name(&root)?;
        let include_hidden = self.config.include_hidden;
        let entries = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || directory::walk(&root, include_hidden)).await??
        };
        debug!(path = %root.display(), entries = entries.len(), "importing directory");

        // The named subdirectory only comes into being through its entries,
        // so an empty directory leaves just the empty wrapper.
        let mut tree = DirectoryTree::default();
        for entry in entries {
            let mut components = Vec::with_capacity(entry.components.len() + 1);
            components.push(name.clone());
            components.extend(entry.components);
            match entry.file {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    let link = self.encode_file(BufReader::new(file), sink).await?;
                    tree.insert(&components, TreeEntry::File(link))?;
                }
                None => tree.insert(&components, TreeEntry::Directory(DirectoryTree::default()))?,
            }
        }
        emit_tree(&tree, sink).await
    }
}

/// Makes `path` absolute and drops `.` and `..` lexically, without
/// resolving symbolic links.
fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let mut absolute = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                absolute.pop();
            }
            other => absolute.push(other),
        }
    }
    Ok(absolute)
}

/// Last component of `path` as UTF-8.
pub(crate) fn entry_name(path: &Path) -> anyhow::Result<String> {
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    name.to_str()
        .map(str::to_owned)
        .with_context(|| format!("{} is not valid UTF-8", PathBuf::from(name).display()))
}

async fn emit_tree<S>(tree: &DirectoryTree, sink: &mut S) -> anyhow::Result<Cid>
where
    S: BlockSink + ?Sized,
{
    let mut blocks = Vec::new();
    let link = tree.encode(&mut blocks)?;
    for block in blocks {
        sink.put_block(block).await?;
    }
    Ok(link.cid)
}
