// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{BlockByteStream, StorageBackend};
use crate::car::{BlockOffset, CarBlockstore, CarError};
use crate::utils::db::car_stream::{CarBlock, CarWriter};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::{SinkExt as _, StreamExt as _};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, BufWriter};
use tracing::{debug, trace};

/// A [`CarBlockstore`] persisting to a CAR file on disk.
pub type FileCarBlockstore = CarBlockstore<FileBackend>;

impl CarBlockstore<FileBackend> {
    /// The archive is created (truncating any existing file) on the first
    /// write or an explicit [`CarBlockstore::initialize`].
    pub fn create(path: impl Into<PathBuf>, root: Cid) -> Self {
        Self::new(FileBackend::new(path), root)
    }

    pub fn path(&self) -> &Path {
        self.backend().path()
    }
}

/// Streams CAR frames through a [`CarWriter`] into a file.
///
/// Reads open their own file handle, so they never disturb the write
/// position and may run concurrently once the archive is finalized.
pub struct FileBackend {
    path: PathBuf,
    writer: Option<CarWriter<BufWriter<File>>>,
    bytes_written: u64,
    finalized: bool,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            bytes_written: 0,
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut CarWriter<BufWriter<File>>, CarError> {
        match (&mut self.writer, self.finalized) {
            (Some(writer), _) => Ok(writer),
            (None, true) => Err(CarError::Finalized),
            (None, false) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "file backend is not initialized",
            )
            .into()),
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn initialize(&mut self, root: Cid) -> Result<u64, CarError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&self.path).await?;
        let writer = CarWriter::new_carv1(root, BufWriter::new(file))?;
        let header_len = writer.header_len();
        self.writer = Some(writer);
        self.bytes_written = header_len;
        debug!(path = %self.path.display(), %root, header_len, "created CAR file");
        Ok(header_len)
    }

    async fn write_block(&mut self, block: CarBlock, offset: u64) -> Result<(), CarError> {
        let actual = self.bytes_written;
        let writer = self.writer()?;
        if offset != actual {
            return Err(CarError::OffsetMismatch {
                expected: offset,
                actual,
            });
        }
        let frame_len = block.frame_len() as u64;
        // `feed` resolves once the frame is queued, without forcing a flush.
        writer.feed(block).await?;
        self.bytes_written += frame_len;
        Ok(())
    }

    async fn read_block(
        &self,
        cid: Cid,
        location: BlockOffset,
    ) -> Result<BlockByteStream, CarError> {
        let path = self.path.clone();
        Ok(futures::stream::once(read_block_data(path, cid, location)).boxed())
    }

    async fn finalize(&mut self) -> Result<(), CarError> {
        if let Some(mut writer) = self.writer.take() {
            writer.close().await?;
        }
        self.finalized = true;
        let actual = tokio::fs::metadata(&self.path).await?.len();
        if actual != self.bytes_written {
            return Err(CarError::OffsetMismatch {
                expected: self.bytes_written,
                actual,
            });
        }
        debug!(path = %self.path.display(), size = actual, "finalized CAR file");
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CarError> {
        // Dropping the writer discards whatever is still buffered.
        if self.writer.take().is_some() {
            debug!(path = %self.path.display(), "discarded unfinished CAR writer");
        }
        Ok(())
    }
}

async fn read_block_data(
    path: PathBuf,
    cid: Cid,
    BlockOffset {
        block_start,
        block_length,
    }: BlockOffset,
) -> Result<Bytes, CarError> {
    trace!(%cid, block_start, block_length, "reading block from disk");
    let mut file = File::open(&path).await?;
    file.seek(SeekFrom::Start(block_start)).await?;
    let mut data = Vec::with_capacity(usize::try_from(block_length).map_err(io::Error::other)?);
    let actual = file.take(block_length).read_to_end(&mut data).await? as u64;
    if actual != block_length {
        return Err(CarError::ShortRead {
            cid,
            expected: block_length,
            actual,
        });
    }
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::RAW;
    use crate::utils::db::car_stream::CarHeader;
    use multihash_codetable::{Code, MultihashDigest as _};

    fn block(data: &[u8]) -> CarBlock {
        CarBlock {
            cid: Cid::new_v1(RAW, Code::Sha2_256.digest(data)),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn header_len_matches_file_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.car");
        let root = block(b"root").cid;
        let mut backend = FileBackend::new(&path);
        let header_len = backend.initialize(root).await.unwrap();
        backend.finalize().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, header_len);
        assert_eq!(bytes, CarHeader::new(root).to_frame().unwrap().to_vec());
    }

    #[tokio::test]
    async fn rejects_misplaced_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new(dir.path().join("out.car"));
        let header_len = backend.initialize(block(b"root").cid).await.unwrap();
        let result = backend.write_block(block(b"a"), header_len + 1).await;
        assert!(matches!(result, Err(CarError::OffsetMismatch { .. })));
    }

    #[tokio::test]
    async fn write_before_initialize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new(dir.path().join("out.car"));
        assert!(matches!(
            backend.write_block(block(b"a"), 0).await,
            Err(CarError::Io(_))
        ));
    }

    #[tokio::test]
    async fn short_read_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.car");
        let a = block(b"some block data");
        let mut backend = FileBackend::new(&path);
        let header_len = backend.initialize(a.cid).await.unwrap();
        let location = BlockOffset {
            block_start: header_len + 1 + a.cid.encoded_len() as u64,
            block_length: a.data.len() as u64,
        };
        backend.write_block(a.clone(), header_len).await.unwrap();
        backend.finalize().await.unwrap();

        let mut stream = backend.read_block(a.cid, location).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from(a.data));

        // chop off the tail of the block
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(location.block_start + 3).unwrap();
        let mut stream = backend.read_block(a.cid, location).await.unwrap();
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(CarError::ShortRead { actual: 3, .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_after_finalize_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.car");
        let mut backend = FileBackend::new(&path);
        backend.initialize(block(b"root").cid).await.unwrap();
        backend.finalize().await.unwrap();
        backend.cleanup().await.unwrap();
        assert!(path.exists());
        assert!(matches!(
            backend.write_block(block(b"a"), 0).await,
            Err(CarError::Finalized)
        ));
    }
}
