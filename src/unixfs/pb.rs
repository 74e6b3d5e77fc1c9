// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Hand-written `quick-protobuf` messages for DAG-PB nodes and their UnixFS
//! payload.
//!
//! - <https://ipld.io/specs/codecs/dag-pb/spec/>
//! - <https://github.com/ipfs/specs/blob/main/UNIXFS.md>

use quick_protobuf::sizeofs::{sizeof_len, sizeof_varint};
use quick_protobuf::{MessageWrite, Result, Writer, WriterBackend};

/// `Data.DataType` of `unixfs.proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DataType {
    Raw = 0,
    Directory = 1,
    File = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixFsData<'a> {
    pub kind: DataType,
    pub data: Option<&'a [u8]>,
    pub filesize: Option<u64>,
    pub blocksizes: &'a [u64],
}

impl UnixFsData<'_> {
    pub fn directory() -> Self {
        Self {
            kind: DataType::Directory,
            data: None,
            filesize: None,
            blocksizes: &[],
        }
    }
}

impl MessageWrite for UnixFsData<'_> {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.kind as u64)
            + self.data.map_or(0, |data| 1 + sizeof_len(data.len()))
            + self.filesize.map_or(0, |size| 1 + sizeof_varint(size))
            + self
                .blocksizes
                .iter()
                .map(|size| 1 + sizeof_varint(*size))
                .sum::<usize>()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_enum(self.kind as i32))?;
        if let Some(data) = self.data {
            w.write_with_tag(18, |w| w.write_bytes(data))?;
        }
        if let Some(filesize) = self.filesize {
            w.write_with_tag(24, |w| w.write_uint64(filesize))?;
        }
        // proto2 `repeated`, not packed
        for size in self.blocksizes {
            w.write_with_tag(32, |w| w.write_uint64(*size))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbLink<'a> {
    /// Binary CID of the target.
    pub hash: Vec<u8>,
    pub name: &'a str,
    /// Cumulative size of the target DAG.
    pub tsize: u64,
}

impl MessageWrite for PbLink<'_> {
    fn get_size(&self) -> usize {
        1 + sizeof_len(self.hash.len())
            + 1
            + sizeof_len(self.name.len())
            + 1
            + sizeof_varint(self.tsize)
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(10, |w| w.write_bytes(&self.hash))?;
        w.write_with_tag(18, |w| w.write_string(self.name))?;
        w.write_with_tag(24, |w| w.write_uint64(self.tsize))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbNode<'a> {
    pub links: Vec<PbLink<'a>>,
    pub data: Option<Vec<u8>>,
}

impl MessageWrite for PbNode<'_> {
    fn get_size(&self) -> usize {
        self.links
            .iter()
            .map(|link| 1 + sizeof_len(link.get_size()))
            .sum::<usize>()
            + self.data.as_ref().map_or(0, |data| 1 + sizeof_len(data.len()))
    }

    // Links are serialized before data, see
    // <https://ipld.io/specs/codecs/dag-pb/spec/#strictness>
    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        for link in &self.links {
            w.write_with_tag(18, |w| w.write_message(link))?;
        }
        if let Some(data) = &self.data {
            w.write_with_tag(10, |w| w.write_bytes(data))?;
        }
        Ok(())
    }
}

/// Serializes a message without the length prefix `quick_protobuf::serialize_into_vec` adds.
pub fn encode(message: &impl MessageWrite) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.get_size());
    message.write_message(&mut Writer::new(&mut buf))?;
    Ok(buf)
}

pub fn directory_node(links: Vec<PbLink<'_>>) -> Result<Vec<u8>> {
    encode(&PbNode {
        links,
        data: Some(encode(&UnixFsData::directory())?),
    })
}

pub fn file_node(links: Vec<PbLink<'_>>, filesize: u64, blocksizes: &[u64]) -> Result<Vec<u8>> {
    let data = UnixFsData {
        kind: DataType::File,
        data: None,
        filesize: Some(filesize),
        blocksizes,
    };
    encode(&PbNode {
        links,
        data: Some(encode(&data)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_directory() {
        assert_eq!(directory_node(vec![]).unwrap(), vec![0x0a, 0x02, 0x08, 0x01]);
    }

    #[test]
    fn sizes_match_encoding() {
        let link = PbLink {
            hash: vec![1; 36],
            name: "a.txt",
            tsize: 300,
        };
        let data = UnixFsData {
            kind: DataType::File,
            data: Some(b"hello"),
            filesize: Some(1 << 20),
            blocksizes: &[1 << 19, 1 << 19],
        };
        let node = PbNode {
            links: vec![link.clone(), link],
            data: Some(encode(&data).unwrap()),
        };
        assert_eq!(encode(&data).unwrap().len(), data.get_size());
        assert_eq!(encode(&node).unwrap().len(), node.get_size());
    }

    #[test]
    fn links_precede_data() {
        let node = file_node(
            vec![PbLink {
                hash: vec![0xaa],
                name: "",
                tsize: 1,
            }],
            1,
            &[1],
        )
        .unwrap();
        // field 2 (Links), length-delimited
        assert_eq!(node[0], 0x12);
    }
}
