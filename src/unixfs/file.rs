// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::pb::{self, PbLink};
use super::{ImporterConfig, Link, dag_pb_block, raw_block};
use crate::car::BlockSink;
use crate::utils::db::car_stream::CarBlock;
use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tracing::trace;

/// Chunks `reader` into raw leaves, then folds them layer by layer into
/// parents of at most `max_children_per_node` links until one node remains.
pub(super) async fn encode_file<R, S>(
    config: &ImporterConfig,
    mut reader: R,
    sink: &mut S,
) -> anyhow::Result<Link>
where
    R: AsyncRead + Unpin + Send,
    S: BlockSink + ?Sized,
{
    let mut layer = Vec::new();
    loop {
        let chunk = read_chunk(&mut reader, config.chunk_size).await?;
        let eof = chunk.len() < config.chunk_size;
        // An empty file still gets one (empty) leaf.
        if !chunk.is_empty() || layer.is_empty() {
            let size = chunk.len() as u64;
            let block = raw_block(chunk);
            layer.push(Link {
                cid: block.cid,
                tsize: size,
                filesize: size,
            });
            sink.put_block(block).await?;
        }
        if eof {
            break;
        }
    }
    trace!(leaves = layer.len(), "chunked file");

    while layer.len() > 1 {
        let mut parents = Vec::with_capacity(layer.len().div_ceil(config.max_children_per_node));
        for children in layer.chunks(config.max_children_per_node) {
            let (block, link) = file_node(children)?;
            sink.put_block(block).await?;
            parents.push(link);
        }
        layer = parents;
    }
    layer.pop().context("file produced no blocks")
}

async fn read_chunk(
    reader: &mut (impl AsyncRead + Unpin),
    size: usize,
) -> std::io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

fn file_node(children: &[Link]) -> anyhow::Result<(CarBlock, Link)> {
    let blocksizes: Vec<u64> = children.iter().map(|child| child.filesize).collect();
    let filesize = blocksizes.iter().sum();
    let links = children
        .iter()
        .map(|child| PbLink {
            hash: child.cid.to_bytes(),
            name: "",
            tsize: child.tsize,
        })
        .collect();
    let bytes = pb::file_node(links, filesize, &blocksizes)?;
    let tsize = bytes.len() as u64 + children.iter().map(|child| child.tsize).sum::<u64>();
    let block = dag_pb_block(bytes);
    let link = Link {
        cid: block.cid,
        tsize,
        filesize,
    };
    Ok((block, link))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::{DAG_PB, RAW};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Collect(Vec<CarBlock>);

    #[async_trait]
    impl BlockSink for Collect {
        async fn put_block(&mut self, block: CarBlock) -> anyhow::Result<()> {
            self.0.push(block);
            Ok(())
        }
    }

    fn config(chunk_size: usize, max_children_per_node: usize) -> ImporterConfig {
        ImporterConfig {
            chunk_size,
            max_children_per_node,
            include_hidden: true,
        }
    }

    async fn encode(data: &[u8], config: &ImporterConfig) -> (Link, Vec<CarBlock>) {
        let mut sink = Collect::default();
        let link = encode_file(config, data, &mut sink).await.unwrap();
        (link, sink.0)
    }

    #[tokio::test]
    async fn single_chunk_is_its_own_root() {
        let (link, blocks) = encode(b"tiny", &config(1024, 8)).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(link.cid, blocks[0].cid);
        assert_eq!(link.cid.codec(), RAW);
        assert_eq!(link.filesize, 4);
    }

    #[tokio::test]
    async fn empty_file_is_one_empty_leaf() {
        let (link, blocks) = encode(b"", &config(1024, 8)).await;
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].data.is_empty());
        assert_eq!(link.filesize, 0);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_leaf() {
        let (link, blocks) = encode(&[9; 8], &config(4, 8)).await;
        // 2 leaves + parent
        assert_eq!(blocks.len(), 3);
        assert_eq!(link.cid.codec(), DAG_PB);
        assert_eq!(link.filesize, 8);
    }

    #[tokio::test]
    async fn tree_is_balanced() {
        let data: Vec<u8> = (0..10u8).collect();
        // 10 leaves -> 4 parents of 3,3,3,1 -> 2 parents -> root
        let (link, blocks) = encode(&data, &config(1, 3)).await;
        assert_eq!(blocks.len(), 10 + 4 + 2 + 1);
        assert_eq!(blocks.last().unwrap().cid, link.cid);
        assert_eq!(link.filesize, 10);
        // leaves come first, in content order
        for (i, block) in blocks[..10].iter().enumerate() {
            assert_eq!(block.data, vec![i as u8]);
        }
        let total: u64 = blocks.iter().map(|b| b.data.len() as u64).sum();
        assert_eq!(link.tsize, total);
    }

    #[tokio::test]
    async fn encoding_is_deterministic() {
        let data = vec![42; 10_000];
        let (a, _) = encode(&data, &config(1000, 4)).await;
        let (b, _) = encode(&data, &config(1000, 4)).await;
        let (c, _) = encode(&data, &config(1000, 5)).await;
        assert_eq!(a, b);
        assert_ne!(a.cid, c.cid);
    }
}
