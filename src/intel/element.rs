// SPDX-License-Identifier: MIT

//! The element substrate: every manifest element begins with a 12-byte
//! `StructInfo` header (8-byte ASCII structure ID, version, variable byte,
//! element size), followed by a fixed-offset little-endian body.

use crate::error::{Error, Result};
use crate::intel::keysig::HashAlg;
use crate::range::check_boundaries;
use core::convert::TryFrom;
use core::fmt::{self, Display};
use core::str;
use serde::Serialize;
use zerocopy::{AsBytes, FromBytes};

pub const BPMH_ID: &[u8; 8] = b"__ACBP__";
pub const SE_ID: &[u8; 8] = b"__IBBS__";
pub const TXTE_ID: &[u8; 8] = b"__TXTS__";
pub const RESERVED_ID: &[u8; 8] = b"__PFRS__";
pub const PCDE_ID: &[u8; 8] = b"__PCDS__";
pub const PME_ID: &[u8; 8] = b"__PMDA__";
pub const PMSE_ID: &[u8; 8] = b"__PMSG__";
pub const KM_ID: &[u8; 8] = b"__KEYM__";

#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[repr(C)]
pub struct StructInfo {
    pub id: [u8; 8],
    pub version: u8,
    pub variable0: u8,
    pub element_size: u16,
}

pub const STRUCT_INFO_SIZE: usize = core::mem::size_of::<StructInfo>();

impl StructInfo {
    pub fn new(id: &[u8; 8], version: u8) -> Self {
        Self { id: *id, version, variable0: 0, element_size: 0 }
    }

    pub fn id_str(&self) -> &str {
        str::from_utf8(&self.id).unwrap_or("????????")
    }
}

impl Display for StructInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} ({} B)",
            self.id_str(),
            self.version,
            { self.element_size }
        )
    }
}

/// Little-endian read cursor over a manifest buffer. Every read is
/// bounds-checked; positions are absolute buffer offsets.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        check_boundaries(self.pos as u64, (self.pos + n) as u64, self.data)?;
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// The next element's structure ID, without consuming it.
    pub fn peek_id(&self) -> Option<[u8; 8]> {
        if self.remaining() < 8 {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        Some(id)
    }

    pub fn read_struct_info(&mut self) -> Result<StructInfo> {
        let bytes = self.take(STRUCT_INFO_SIZE)?;
        StructInfo::read_from(bytes).ok_or_else(|| Error::format("element header truncated"))
    }
}

/// One hash digest: algorithm, length, bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HashDigest {
    pub hash_alg: HashAlg,
    pub digest: Vec<u8>,
}

impl HashDigest {
    pub fn new(hash_alg: HashAlg, digest: Vec<u8>) -> Self {
        Self { hash_alg, digest }
    }

    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let alg = cursor.read_u16()?;
        let hash_alg = HashAlg::try_from(alg)?;
        let size = cursor.read_u16()? as usize;
        let digest = cursor.take(size)?.to_vec();
        Ok(Self { hash_alg, digest })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.hash_alg as u16).to_le_bytes());
        out.extend_from_slice(&(self.digest.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.digest);
    }

    /// Serialised size; a closed-form function of the current fields.
    pub fn total_size(&self) -> usize {
        4 + self.digest.len()
    }
}

/// A sized list of hash digests: total size, count, digests.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct HashList {
    pub digests: Vec<HashDigest>,
}

impl HashList {
    pub fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let declared = cursor.read_u16()? as usize;
        let count = cursor.read_u16()? as usize;
        let start = cursor.position() - 4;
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(HashDigest::parse(cursor)?);
        }
        let consumed = cursor.position() - start;
        if consumed != declared {
            return Err(Error::format(format!(
                "hash list declares {} B but occupies {} B",
                declared, consumed
            )));
        }
        Ok(Self { digests })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.total_size() as u16).to_le_bytes());
        out.extend_from_slice(&(self.digests.len() as u16).to_le_bytes());
        for digest in &self.digests {
            digest.serialize(out);
        }
    }

    pub fn total_size(&self) -> usize {
        4 + self.digests.iter().map(HashDigest::total_size).sum::<usize>()
    }
}
