// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::unixfs::ImporterConfig;
use crate::utils::io::read_toml;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub importer: ImporterConfig,
    /// Where [`CarBuilder::build`](super::CarBuilder::build) places archives.
    /// Defaults to the system temporary directory.
    pub output_dir: Option<PathBuf>,
}

impl BuilderConfig {
    pub fn from_toml(toml: &str) -> anyhow::Result<Self> {
        read_toml(toml)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&toml).with_context(|| format!("invalid config {}", path.display()))
    }

    pub(super) fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
