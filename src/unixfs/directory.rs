// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::pb::{self, PbLink};
use super::{Link, dag_pb_block};
use crate::utils::db::car_stream::CarBlock;
use anyhow::{Context as _, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// A directory being assembled. Entries are kept sorted by name, which is
/// the link order of the encoded node.
#[derive(Debug, Default)]
pub(super) struct DirectoryTree {
    entries: BTreeMap<String, TreeEntry>,
}

#[derive(Debug)]
pub(super) enum TreeEntry {
    File(Link),
    Directory(DirectoryTree),
}

impl DirectoryTree {
    /// Inserts `entry` at `components`, creating intermediate directories.
    pub fn insert(&mut self, components: &[String], entry: TreeEntry) -> anyhow::Result<()> {
        let (name, parents) = components.split_last().context("empty entry path")?;
        let mut dir = self;
        for parent in parents {
            dir = match dir
                .entries
                .entry(parent.clone())
                .or_insert_with(|| TreeEntry::Directory(DirectoryTree::default()))
            {
                TreeEntry::Directory(dir) => dir,
                TreeEntry::File(_) => bail!("{parent} is a file, not a directory"),
            };
        }
        match (dir.entries.get(name), entry) {
            (Some(TreeEntry::Directory(_)), TreeEntry::Directory(_)) => Ok(()),
            (Some(_), _) => bail!("duplicate entry {name}"),
            (None, entry) => {
                dir.entries.insert(name.clone(), entry);
                Ok(())
            }
        }
    }

    /// Encodes the tree bottom-up, appending every directory node to
    /// `blocks` after the nodes of its subdirectories.
    pub fn encode(&self, blocks: &mut Vec<CarBlock>) -> anyhow::Result<Link> {
        let mut children = Vec::with_capacity(self.entries.len());
        for (name, entry) in &self.entries {
            let link = match entry {
                TreeEntry::File(link) => *link,
                TreeEntry::Directory(dir) => dir.encode(blocks)?,
            };
            children.push((name.as_str(), link));
        }
        let links = children
            .iter()
            .map(|(name, link)| PbLink {
                hash: link.cid.to_bytes(),
                name,
                tsize: link.tsize,
            })
            .collect();
        let bytes = pb::directory_node(links)?;
        let tsize = bytes.len() as u64 + children.iter().map(|(_, link)| link.tsize).sum::<u64>();
        let block = dag_pb_block(bytes);
        let link = Link {
            cid: block.cid,
            tsize,
            filesize: 0,
        };
        blocks.push(block);
        Ok(link)
    }
}

/// An entry found under an imported directory.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct WalkEntry {
    /// Path relative to the imported directory.
    pub components: Vec<String>,
    /// Where to read the content from. `None` for directories.
    pub file: Option<PathBuf>,
}

/// Lists everything below `root` in a stable order. Blocking.
pub(super) fn walk(root: &Path, include_hidden: bool) -> anyhow::Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_root_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            include_hidden || entry.depth() == 0 || !is_hidden(entry.file_name())
        });
    for entry in walker {
        let entry = entry?;
        let file_type = entry.file_type();
        let file = if file_type.is_dir() {
            None
        } else if file_type.is_file() {
            Some(entry.path().to_owned())
        } else {
            warn!(
                path = %entry.path().display(),
                "skipping entry that is neither a file nor a directory"
            );
            continue;
        };
        let components = entry
            .path()
            .strip_prefix(root)?
            .iter()
            .map(|component| {
                component
                    .to_str()
                    .map(str::to_owned)
                    .with_context(|| format!("{} is not valid UTF-8", entry.path().display()))
            })
            .collect::<anyhow::Result<_>>()?;
        entries.push(WalkEntry { components, file });
    }
    Ok(entries)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.as_encoded_bytes().starts_with(b".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::raw_block;
    use pretty_assertions::assert_eq;

    fn path(components: &[&str]) -> Vec<String> {
        components.iter().map(|c| c.to_string()).collect()
    }

    fn file(data: &[u8]) -> TreeEntry {
        let block = raw_block(data.to_vec());
        TreeEntry::File(Link {
            cid: block.cid,
            tsize: data.len() as u64,
            filesize: data.len() as u64,
        })
    }

    #[test]
    fn empty_directory_is_the_well_known_node() {
        let mut blocks = Vec::new();
        DirectoryTree::default().encode(&mut blocks).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, vec![0x0a, 0x02, 0x08, 0x01]);
    }

    #[test]
    fn links_are_sorted_by_name() {
        let mut forward = DirectoryTree::default();
        forward.insert(&path(&["a"]), file(b"1")).unwrap();
        forward.insert(&path(&["b"]), file(b"2")).unwrap();
        let mut backward = DirectoryTree::default();
        backward.insert(&path(&["b"]), file(b"2")).unwrap();
        backward.insert(&path(&["a"]), file(b"1")).unwrap();

        let (mut x, mut y) = (Vec::new(), Vec::new());
        assert_eq!(
            forward.encode(&mut x).unwrap(),
            backward.encode(&mut y).unwrap()
        );
        assert_eq!(x, y);
    }

    #[test]
    fn nested_directories_are_emitted_first() {
        let mut tree = DirectoryTree::default();
        tree.insert(&path(&["x", "y", "f"]), file(b"f")).unwrap();
        let mut blocks = Vec::new();
        let root = tree.encode(&mut blocks).unwrap();
        // y, x, root
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].cid, root.cid);
        let y = blocks[0].cid.to_bytes();
        assert!(blocks[1].data.windows(y.len()).any(|w| w == &y[..]));
        let total: u64 = blocks.iter().map(|b| b.data.len() as u64).sum::<u64>() + 1;
        assert_eq!(root.tsize, total);
    }

    #[test]
    fn conflicting_entries_are_rejected() {
        let mut tree = DirectoryTree::default();
        tree.insert(&path(&["a"]), file(b"1")).unwrap();
        assert!(tree.insert(&path(&["a"]), file(b"2")).is_err());
        assert!(tree.insert(&path(&["a", "b"]), file(b"3")).is_err());
        tree.insert(&path(&["d"]), TreeEntry::Directory(DirectoryTree::default()))
            .unwrap();
        tree.insert(&path(&["d"]), TreeEntry::Directory(DirectoryTree::default()))
            .unwrap();
        assert!(tree.insert(&[], file(b"4")).is_err());
    }

    #[test]
    fn walk_is_sorted_and_filters_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/.cache")).unwrap();
        std::fs::write(dir.path().join("b/.cache/x"), b"").unwrap();
        std::fs::write(dir.path().join("b/c"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();

        let names = |include_hidden| {
            walk(dir.path(), include_hidden)
                .unwrap()
                .into_iter()
                .map(|entry| entry.components.join("/"))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(false), vec!["a", "b", "b/c"]);
        assert_eq!(
            names(true),
            vec![".hidden", "a", "b", "b/.cache", "b/.cache/x", "b/c"]
        );
    }
}
