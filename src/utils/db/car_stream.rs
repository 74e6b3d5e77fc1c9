// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! CARv1 framing.
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┬─────
//! │ header frame │ block frame      │ block frame      │ ...
//! └──────────────┴──────────────────┴──────────────────┴─────
//!
//! header frame: varint(len) || dag-cbor({roots, version: 1})
//! block frame:  varint(len(cid) + len(data)) || cid || data
//! ```
//!
//! See <https://ipld.io/specs/transport/car/carv1/>.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cid::Cid;
use futures::ready;
use futures::{Stream, StreamExt, sink::Sink};
use integer_encoding::VarInt;
use multihash_codetable::{Code, MultihashDigest as _};
use nunny::Vec as NonEmpty;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};
use tokio_util::codec::{Encoder, FramedRead};
use unsigned_varint::codec::UviBytes;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarHeader {
    // The roots array must contain one or more CIDs,
    // each of which should be present somewhere in the remainder of the CAR.
    // See <https://ipld.io/specs/transport/car/carv1/#constraints>
    pub roots: NonEmpty<Cid>,
    pub version: u64,
}

impl CarHeader {
    pub fn new(root: Cid) -> Self {
        Self {
            roots: nunny::vec![root],
            version: 1,
        }
    }

    /// The varint-framed DAG-CBOR encoding of this header, exactly as it
    /// appears at the start of the archive.
    pub fn to_frame(&self) -> io::Result<Bytes> {
        let body = serde_ipld_dagcbor::to_vec(self).map_err(io::Error::other)?;
        let mut frame = BytesMut::new();
        UviBytes::default().encode(Bytes::from(body), &mut frame)?;
        Ok(frame.freeze())
    }

    /// Length of [`CarHeader::to_frame`]. Only depends on the encoded length
    /// of the roots, so swapping a root for one of equal width keeps it.
    pub fn encoded_len(&self) -> io::Result<u64> {
        Ok(self.to_frame()?.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CarBlock {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl CarBlock {
    /// Length of the frame body: the CID followed by the block data.
    pub fn body_len(&self) -> usize {
        self.cid.encoded_len() + self.data.len()
    }

    /// Length of the whole frame, varint prefix included.
    pub fn frame_len(&self) -> usize {
        let body_len = self.body_len();
        body_len.required_space() + body_len
    }

    // Write a varint frame containing the cid and the data
    pub fn write(&self, mut writer: &mut impl io::Write) -> io::Result<()> {
        writer.write_all(&self.body_len().encode_var_vec())?;
        #[allow(clippy::needless_borrows_for_generic_args)]
        self.cid
            .write_bytes(&mut writer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    pub fn to_frame(&self) -> io::Result<Bytes> {
        let mut frame = BytesMut::with_capacity(self.frame_len()).writer();
        self.write(&mut frame)?;
        Ok(frame.into_inner().freeze())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> io::Result<CarBlock> {
        let bytes: Bytes = bytes.into();
        let mut cursor = bytes.reader();
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let bytes = cursor.into_inner();
        Ok(CarBlock {
            cid,
            data: bytes.to_vec(),
        })
    }

    pub fn valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let actual = {
            let code = Code::try_from(self.cid.hash().code())?;
            Cid::new_v1(self.cid.codec(), code.digest(&self.data))
        };
        anyhow::ensure!(
            actual == self.cid,
            "CID/Block mismatch for block {}, actual: {actual}",
            self.cid
        );
        Ok(())
    }
}

pin_project! {
    /// Stream of CAR blocks read back from an uncompressed CARv1 archive.
    pub struct CarStream<ReaderT> {
        #[pin]
        reader: FramedRead<ReaderT, UviBytes>,
        pub header: CarHeader,
        header_len: u64,
    }
}

impl<ReaderT: AsyncBufRead + Unpin> CarStream<ReaderT> {
    pub async fn new(reader: ReaderT) -> io::Result<Self> {
        let mut reader = FramedRead::new(reader, UviBytes::default());
        let header = read_v1_header(&mut reader)
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid header block"))?;
        let header_len = header.encoded_len()?;
        Ok(CarStream {
            reader,
            header,
            header_len,
        })
    }

    /// Byte length of the header frame that was read.
    pub fn header_len(&self) -> u64 {
        self.header_len
    }
}

impl<ReaderT: AsyncRead> Stream for CarStream<ReaderT> {
    type Item = io::Result<CarBlock>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = futures::ready!(this.reader.poll_next(cx));
        Poll::Ready(item.map(|ret| ret.and_then(CarBlock::from_bytes)))
    }
}

pin_project! {
    /// Sink of CAR blocks. The header frame is queued on construction and
    /// flushed ahead of the first block.
    pub struct CarWriter<W> {
        #[pin]
        inner: W,
        buffer: BytesMut,
        header_len: u64,
    }
}

impl<W: AsyncWrite> CarWriter<W> {
    pub fn new_carv1(root: Cid, writer: W) -> io::Result<Self> {
        let header_frame = CarHeader::new(root).to_frame()?;
        Ok(Self {
            inner: writer,
            header_len: header_frame.len() as u64,
            buffer: BytesMut::from(&header_frame[..]),
        })
    }

    /// Byte length of the header frame, known before anything is written.
    pub fn header_len(&self) -> u64 {
        self.header_len
    }
}

impl<W: AsyncWrite> Sink<CarBlock> for CarWriter<W> {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.as_mut().project();

        while !this.buffer.is_empty() {
            this = self.as_mut().project();
            let bytes_written = ready!(this.inner.poll_write(cx, this.buffer))?;
            if bytes_written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.buffer.advance(bytes_written);
        }
        Poll::Ready(Ok(()))
    }
    fn start_send(self: Pin<&mut Self>, item: CarBlock) -> Result<(), Self::Error> {
        item.write(&mut self.project().buffer.writer())
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_ready(cx))?;
        self.project().inner.poll_flush(cx)
    }
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_ready(cx))?;
        self.project().inner.poll_shutdown(cx)
    }
}

async fn read_v1_header<ReaderT: AsyncRead + Unpin>(
    framed_reader: &mut FramedRead<ReaderT, UviBytes>,
) -> Option<CarHeader> {
    let frame = framed_reader.next().await?.ok()?;
    let header = serde_ipld_dagcbor::from_slice::<CarHeader>(&frame).ok()?;
    if header.version != 1 {
        return None;
    }
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unixfs::{DAG_PB, RAW};
    use futures::{SinkExt as _, TryStreamExt as _};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for CarBlock {
        fn arbitrary(g: &mut Gen) -> CarBlock {
            let data = Vec::<u8>::arbitrary(g);
            let encoding = g.choose(&[DAG_PB, RAW]).unwrap();
            let code = g.choose(&[Code::Blake2b256, Code::Sha2_256]).unwrap();
            let cid = Cid::new_v1(*encoding, code.digest(&data));
            CarBlock { cid, data }
        }
    }

    #[test]
    fn header_len_for_sha256_roots() {
        let root = Cid::new_v1(RAW, Code::Sha2_256.digest(b"root"));
        // a2 | 65 "roots" | 81 | d8 2a | 58 25 | 00 <36 bytes> | 67 "version" | 01
        assert_eq!(CarHeader::new(root).encoded_len().unwrap(), 59);
    }

    #[test]
    fn header_len_is_independent_of_digest() {
        let a = Cid::new_v1(DAG_PB, Code::Sha2_256.digest(b"a"));
        let b = Cid::new_v1(RAW, Code::Sha2_256.digest(b"b"));
        assert_eq!(
            CarHeader::new(a).to_frame().unwrap().len(),
            CarHeader::new(b).to_frame().unwrap().len()
        );
    }

    #[quickcheck]
    fn frame_len_matches_written_bytes(block: CarBlock) {
        assert_eq!(block.to_frame().unwrap().len(), block.frame_len());
    }

    #[quickcheck]
    fn car_writer_roundtrip(blocks: Vec<CarBlock>) -> anyhow::Result<()> {
        let Some(root) = blocks.first().map(|b| b.cid) else {
            return Ok(());
        };
        futures::executor::block_on(async move {
            let mut buff: Vec<u8> = vec![];
            let mut writer = CarWriter::new_carv1(root, &mut buff)?;
            let header_len = writer.header_len();
            for block in blocks.iter().cloned() {
                writer.feed(block).await?;
            }
            writer.close().await?;

            let stream = CarStream::new(std::io::Cursor::new(buff)).await?;
            assert_eq!(stream.header.roots, nunny::vec![root]);
            assert_eq!(stream.header_len(), header_len);
            let blocks2: Vec<CarBlock> = stream.try_collect().await?;
            assert_eq!(blocks, blocks2);
            assert!(blocks2.iter().all(CarBlock::valid));
            Ok(())
        })
    }

    #[tokio::test]
    async fn rejects_garbage_header() {
        let garbage = vec![0x03, 0x01, 0x02, 0x03];
        assert!(CarStream::new(std::io::Cursor::new(garbage)).await.is_err());
    }
}
