// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::car::CarError;
use crate::unixfs::DAG_PB;
use crate::utils::db::car_stream::CarHeader;
use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest as _};
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

/// The DAG-PB encoding of an empty UnixFS directory.
const EMPTY_DIRECTORY: [u8; 4] = [0x0a, 0x02, 0x08, 0x01];

/// Root written into the header before the real root is known.
///
/// It has the encoded width of every root the importer produces (CIDv1,
/// DAG-PB, sha2-256), so swapping it out never changes the header length.
pub static PLACEHOLDER_ROOT: LazyLock<Cid> =
    LazyLock::new(|| Cid::new_v1(DAG_PB, Code::Sha2_256.digest(&EMPTY_DIRECTORY)));

fn header_frame(root: Cid, header_size: u64) -> Result<Bytes, CarError> {
    let frame = CarHeader::new(root).to_frame()?;
    let actual = frame.len() as u64;
    if actual != header_size {
        return Err(CarError::HeaderSizeMismatch {
            expected: header_size,
            actual,
        });
    }
    Ok(frame)
}

/// Overwrites the header of the finished archive at `path` with one naming
/// `root`. Block frames are left untouched.
pub async fn patch_car_file(path: &Path, root: Cid, header_size: u64) -> Result<(), CarError> {
    let frame = header_frame(root, header_size)?;
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    let len = file.metadata().await?.len();
    if len < header_size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} is shorter than its header", path.display()),
        )
        .into());
    }
    file.write_all(&frame).await?;
    file.flush().await?;
    file.sync_all().await?;
    debug!(path = %path.display(), %root, "patched CAR header");
    Ok(())
}

/// In-memory counterpart of [`patch_car_file`].
pub fn patch_car_bytes(car: &mut [u8], root: Cid, header_size: u64) -> Result<(), CarError> {
    let frame = header_frame(root, header_size)?;
    let header = car.get_mut(..frame.len()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "archive is shorter than its header",
        )
    })?;
    header.copy_from_slice(&frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::{RAW, pb};
    use crate::utils::db::car_stream::CarStream;
    use pretty_assertions::assert_eq;

    #[test]
    fn placeholder_is_the_empty_directory() {
        assert_eq!(pb::directory_node(vec![]).unwrap(), EMPTY_DIRECTORY);
        assert_eq!(
            Cid::new_v0(*PLACEHOLDER_ROOT.hash()).unwrap().to_string(),
            "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn"
        );
    }

    #[test]
    fn patch_keeps_everything_but_the_root() {
        let frame = CarHeader::new(*PLACEHOLDER_ROOT).to_frame().unwrap();
        let header_size = frame.len() as u64;
        let mut car = frame.to_vec();
        car.extend_from_slice(b"block frames");

        let root = Cid::new_v1(DAG_PB, Code::Sha2_256.digest(b"real root"));
        patch_car_bytes(&mut car, root, header_size).unwrap();
        assert_eq!(&car[..frame.len()], &CarHeader::new(root).to_frame().unwrap()[..]);
        assert_eq!(&car[frame.len()..], b"block frames");
    }

    #[test]
    fn patch_rejects_a_different_width() {
        let frame = CarHeader::new(*PLACEHOLDER_ROOT).to_frame().unwrap();
        let mut car = frame.to_vec();
        // sha2-512 makes a longer CID
        let root = Cid::new_v1(RAW, Code::Sha2_512.digest(b"wide"));
        assert!(matches!(
            patch_car_bytes(&mut car, root, frame.len() as u64),
            Err(CarError::HeaderSizeMismatch { .. })
        ));
        assert_eq!(car, frame.to_vec());
    }

    #[test]
    fn patch_rejects_a_truncated_archive() {
        let mut car = vec![0; 3];
        let header_size = CarHeader::new(*PLACEHOLDER_ROOT).encoded_len().unwrap();
        assert!(matches!(
            patch_car_bytes(&mut car, *PLACEHOLDER_ROOT, header_size),
            Err(CarError::Io(_))
        ));
    }

    #[tokio::test]
    async fn patched_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.car");
        let frame = CarHeader::new(*PLACEHOLDER_ROOT).to_frame().unwrap();
        std::fs::write(&path, &frame).unwrap();

        let root = Cid::new_v1(DAG_PB, Code::Sha2_256.digest(b"real root"));
        patch_car_file(&path, root, frame.len() as u64)
            .await
            .unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let stream = CarStream::new(tokio::io::BufReader::new(file))
            .await
            .unwrap();
        assert_eq!(stream.header.roots.first(), &root);
    }
}
