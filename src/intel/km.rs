// SPDX-License-Identifier: MIT

//! The Key Manifest (`__KEYM__`): authorises downstream signing keys by
//! hash, and closes with the same key/signature pair as the boot policy
//! manifest.

use crate::error::{Error, Result};
use crate::intel::element::{Cursor, HashDigest, KM_ID, STRUCT_INFO_SIZE};
use crate::intel::keysig::KeySignature;
use crate::range::check_boundaries;
use core::fmt::{self, Display};
use serde::Serialize;

bitflags::bitflags! {
    /// Which downstream manifests a hash entry authorises.
    pub struct KmUsage: u64 {
        const BOOT_POLICY_MANIFEST = 1 << 0;
        const FIT_PATCH_MANIFEST = 1 << 1;
        const ACM_MANIFEST = 1 << 2;
        const SDEV_MANIFEST = 1 << 3;
    }
}

impl Serialize for KmUsage {
    fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
        s.serialize_u64(self.bits())
    }
}

/// One authorised key hash: usage bitmask plus the digest of the
/// downstream public key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KmHash {
    pub usage: KmUsage,
    pub digest: HashDigest,
}

impl KmHash {
    fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let usage = KmUsage::from_bits_truncate(cursor.read_u64()?);
        let digest = HashDigest::parse(cursor)?;
        Ok(Self { usage, digest })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.usage.bits().to_le_bytes());
        self.digest.serialize(out);
    }

    fn total_size(&self) -> usize {
        8 + self.digest.total_size()
    }
}

/// The parsed Key Manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeyManifest {
    pub version: u8,
    /// Derived; recomputed by rehash.
    pub key_signature_offset: u16,
    pub km_version: u8,
    /// Anti-rollback counter of the manifest.
    pub km_svn: u8,
    pub km_id: u8,
    pub reserved: u8,
    pub hashes: Vec<KmHash>,
    pub key_signature: KeySignature,
}

impl KeyManifest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let info = cursor.read_struct_info()?;
        if &info.id != KM_ID {
            return Err(Error::format(format!(
                "expected __KEYM__, found {}",
                info.id_str()
            )));
        }
        let key_signature_offset = cursor.read_u16()?;
        let km_version = cursor.read_u8()?;
        let km_svn = cursor.read_u8()?;
        let km_id = cursor.read_u8()?;
        let reserved = cursor.read_u8()?;
        let hash_count = cursor.read_u16()? as usize;
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(KmHash::parse(&mut cursor)?);
        }
        let key_signature = KeySignature::parse(&mut cursor)?;
        let manifest = Self {
            version: info.version,
            key_signature_offset,
            km_version,
            km_svn,
            km_id,
            reserved,
            hashes,
            key_signature,
        };
        if cursor.position() != info.element_size as usize {
            return Err(Error::format(format!(
                "__KEYM__ declares {} B but occupies {} B",
                { info.element_size },
                cursor.position()
            )));
        }
        Ok(manifest)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(KM_ID);
        out.push(self.version);
        out.push(0);
        out.extend_from_slice(&(self.total_size() as u16).to_le_bytes());
        out.extend_from_slice(&self.key_signature_offset.to_le_bytes());
        out.push(self.km_version);
        out.push(self.km_svn);
        out.push(self.km_id);
        out.push(self.reserved);
        out.extend_from_slice(&(self.hashes.len() as u16).to_le_bytes());
        for hash in &self.hashes {
            hash.serialize(&mut out);
        }
        self.key_signature.serialize(&mut out);
        out
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE
            + 8
            + self.hashes.iter().map(KmHash::total_size).sum::<usize>()
            + self.key_signature.total_size()
    }

    fn size_before_key_signature(&self) -> usize {
        STRUCT_INFO_SIZE + 8 + self.hashes.iter().map(KmHash::total_size).sum::<usize>()
    }

    /// Recomputes the declared signature offset.
    pub fn rehash(&mut self) {
        let offset =
            self.size_before_key_signature() + self.key_signature.signature_offset();
        self.key_signature_offset = offset as u16;
    }

    /// The signed span: everything up to the signature sub-element.
    pub fn signed_data(&self) -> Result<Vec<u8>> {
        let data = self.serialize();
        let end = self.key_signature_offset as u64;
        check_boundaries(0, end, &data)?;
        Ok(data[..end as usize].to_vec())
    }

    /// Verifies the manifest signature with the embedded public key.
    pub fn verify_signature(&self) -> Result<()> {
        let signed = self.signed_data()?;
        self.key_signature.verify(&signed)
    }

    /// Whether `digest` is authorised for the given usage.
    pub fn authorises(&self, usage: KmUsage, digest: &[u8]) -> bool {
        self.hashes
            .iter()
            .any(|h| h.usage.contains(usage) && h.digest.digest == digest)
    }
}

impl Display for KeyManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key manifest id {} svn {} with {} authorised hashes, signed with {}",
            self.km_id,
            self.km_svn,
            self.hashes.len(),
            self.key_signature.signature.scheme
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::bpm::tests::bare_key_signature;
    use crate::intel::keysig::{HashAlg, SIGNATURE_VERSION};

    fn sample_km() -> KeyManifest {
        let mut km = KeyManifest {
            version: 0x21,
            key_signature_offset: 0,
            km_version: 0x10,
            km_svn: 1,
            km_id: 1,
            reserved: 0,
            hashes: vec![
                KmHash {
                    usage: KmUsage::BOOT_POLICY_MANIFEST,
                    digest: HashDigest::new(HashAlg::Sha256, vec![0xaa; 32]),
                },
                KmHash {
                    usage: KmUsage::FIT_PATCH_MANIFEST | KmUsage::ACM_MANIFEST,
                    digest: HashDigest::new(HashAlg::Sha384, vec![0xbb; 48]),
                },
            ],
            key_signature: bare_key_signature(),
        };
        km.rehash();
        km
    }

    #[test]
    fn roundtrip_after_rehash() {
        let km = sample_km();
        let raw = km.serialize();
        assert_eq!(raw.len(), km.total_size());
        let parsed = KeyManifest::parse(&raw).unwrap();
        assert_eq!(parsed, km);
    }

    #[test]
    fn signature_offset_points_at_the_signature() {
        let km = sample_km();
        let raw = km.serialize();
        let offset = km.key_signature_offset as usize;
        assert_eq!(raw[offset], SIGNATURE_VERSION);
    }

    #[test]
    fn authorisation_lookup() {
        let km = sample_km();
        assert!(km.authorises(KmUsage::BOOT_POLICY_MANIFEST, &[0xaa; 32]));
        assert!(!km.authorises(KmUsage::BOOT_POLICY_MANIFEST, &[0xbb; 48]));
        assert!(km.authorises(KmUsage::ACM_MANIFEST, &[0xbb; 48]));
        assert!(!km.authorises(KmUsage::SDEV_MANIFEST, &[0xaa; 32]));
    }

    #[test]
    fn wrong_id_is_rejected() {
        let km = sample_km();
        let mut raw = km.serialize();
        raw[0..8].copy_from_slice(b"__ACBP__");
        assert!(KeyManifest::parse(&raw).is_err());
    }
}
