// SPDX-License-Identifier: MIT

//! The 256-byte header prefixing the signed payload of many PSP and BIOS
//! entries, and the signed-span arithmetic around it.
//!
//! coreboot util/amdfwtool/amdfwtool.h

use crate::amd::key::{KeyId, KeySet};
use crate::amd::signature::SignedBlob;
use crate::error::{Error, Result};
use crate::range::check_boundaries;
use core::fmt::{self, Display};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zerocopy::{AsBytes, FromBytes};

#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct PspBinaryHeader {
    /// 0x00
    pub nonce: [u8; 16],
    /// 0x10
    pub header_version: u32,
    /// 0x14: payload bytes covered by the signature, excluding this header
    pub size_signed: u32,
    /// 0x18
    pub encryption_options: u32,
    /// 0x1c
    pub ikek_type: u8,
    pub reserved0: [u8; 3],
    /// 0x20
    pub encryption_parameters: [u8; 16],
    /// 0x30: 1 if the image is signed
    pub signature_option: u32,
    /// 0x34
    pub signature_algorithm_id: u32,
    /// 0x38: the signing key's KeyID
    pub signature_parameters: [u8; 16],
    /// 0x48: 0 for uncompressed bodies
    pub compression_options: u32,
    /// 0x4c
    pub security_patch_level: u32,
    /// 0x50
    pub uncompressed_image_size: u32,
    /// 0x54
    pub compressed_image_size: u32,
    /// 0x58
    pub compression_parameters: [u8; 8],
    /// 0x60
    pub image_version: u32,
    /// 0x64
    pub apu_family_id: u32,
    /// 0x68
    pub firmware_load_address: u32,
    /// 0x6c: total bytes including header and trailing signature
    pub size_image: u32,
    /// 0x70
    pub size_fw_unsigned: u32,
    /// 0x74
    pub firmware_split_address: u32,
    pub reserved1: [u8; 4],
    /// 0x7c
    pub fw_type: u8,
    pub fw_sub_type: u8,
    pub reserved2: u16,
    /// 0x80
    pub encryption_key: [u8; 16],
    /// 0x90
    pub signing_info: [u8; 16],
    /// 0xa0
    pub fw_specific_data: [u8; 32],
    /// 0xc0
    pub debug_enc_key: [u8; 16],
    #[serde(with = "BigArray")]
    pub padding: [u8; 48],
}

pub const PSP_BINARY_HEADER_SIZE: usize = core::mem::size_of::<PspBinaryHeader>();

impl PspBinaryHeader {
    pub fn is_signed(&self) -> bool {
        self.signature_option == 1
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_options != 0
    }

    pub fn signing_key_id(&self) -> KeyId {
        KeyId(self.signature_parameters)
    }
}

impl Display for PspBinaryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signed = if self.is_signed() {
            format!("signed by {}", self.signing_key_id())
        } else {
            "unsigned".to_string()
        };
        write!(
            f,
            "type {:02x}.{:02x} version {:08x} fam {:08x} load {:08x} image {:08x} B, {}",
            self.fw_type,
            self.fw_sub_type,
            { self.image_version },
            { self.apu_family_id },
            { self.firmware_load_address },
            { self.size_image },
            signed
        )
    }
}

fn align_up_16(v: u64) -> u64 {
    (v + 15) & !15
}

/// A PSP binary: header plus body, owning a copy of the raw bytes so the
/// signed-span slicing is done relative to the copy.
#[derive(Clone, Debug)]
pub struct PspBinary {
    raw: Vec<u8>,
    header: PspBinaryHeader,
}

impl PspBinary {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = PspBinaryHeader::read_from_prefix(data)
            .ok_or_else(|| Error::format("not enough data for a PSP binary header"))?;
        Ok(Self { raw: data.to_vec(), header })
    }

    pub fn header(&self) -> &PspBinaryHeader {
        &self.header
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Verifies the trailing signature against the key referenced by
    /// `signature_parameters`, looked up in `keys`.
    ///
    /// Uncompressed bodies sign `header ‖ size_signed` payload bytes and
    /// put the signature in the last `signature_size` bytes of the image.
    /// Compressed bodies sign `header ‖ align16(compressed_image_size)` and
    /// append the signature directly after the signed span.
    pub fn into_signed_blob(self, keys: &KeySet) -> Result<SignedBlob> {
        let h = &self.header;
        let size_signed = h.size_signed as u64;
        let size_image = h.size_image as u64;
        if size_signed == 0 || size_image == 0 {
            return Err(Error::format("PSP binary declares a zero signed or image size"));
        }

        let key_id = h.signing_key_id();
        let signing_key = keys
            .get(&key_id)
            .ok_or(Error::UnknownSigningKey { key_id, item: None })?;
        // Holds across Milan-era firmware; a mismatch points at a
        // misparsed key.
        if signing_key.modulus_size_bits != signing_key.exponent_size_bits {
            return Err(Error::format(format!(
                "signing key {} has mismatched modulus/exponent sizes",
                key_id
            )));
        }
        let signature_size = signing_key.signature_size() as u64;

        let header_size = PSP_BINARY_HEADER_SIZE as u64;
        let (signed_end, sig_start, sig_end) = if h.is_compressed() {
            let signed_end = header_size + align_up_16(h.compressed_image_size as u64);
            (signed_end, signed_end, signed_end + signature_size)
        } else {
            if size_signed > size_image {
                return Err(Error::format(format!(
                    "signed size {:#x} exceeds image size {:#x}",
                    size_signed, size_image
                )));
            }
            let signed_end = header_size + size_signed;
            let sig_start = size_image
                .checked_sub(signature_size)
                .ok_or_else(|| Error::format("image smaller than its signature"))?;
            (signed_end, sig_start, size_image)
        };
        check_boundaries(0, signed_end, &self.raw)?;
        check_boundaries(sig_start, sig_end, &self.raw)?;

        let signature = &self.raw[sig_start as usize..sig_end as usize];
        let signed_data = &self.raw[..signed_end as usize];
        SignedBlob::new(signature, signed_data, signing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amd::key::KeyType;
    use crate::amd::signature::tests::{generated_key, pss_sign};

    #[test]
    fn header_is_256_bytes() {
        assert_eq!(PSP_BINARY_HEADER_SIZE, 0x100);
    }

    pub(crate) fn build_signed_binary(
        private: &rsa::RsaPrivateKey,
        key_id: [u8; 16],
        body: &[u8],
    ) -> Vec<u8> {
        let signature_size = {
            use rsa::traits::PublicKeyParts;
            private.size()
        };
        let mut header = PspBinaryHeader::new_zeroed();
        header.header_version = 1;
        header.signature_option = 1;
        header.signature_parameters = key_id;
        header.size_signed = body.len() as u32;
        header.size_image = (PSP_BINARY_HEADER_SIZE + body.len() + signature_size) as u32;
        header.fw_type = 0x12;

        let mut raw = header.as_bytes().to_vec();
        raw.extend_from_slice(body);
        let signature = pss_sign(private, &raw);
        raw.extend_from_slice(&signature);
        raw
    }

    #[test]
    fn uncompressed_roundtrip() {
        let (private, key) = generated_key([0x42; 16], 2048);
        let mut keys = KeySet::new();
        keys.add(key, KeyType::AmdRoot).unwrap();

        let body = vec![0x5a; 0x300];
        let raw = build_signed_binary(&private, [0x42; 16], &body);

        let binary = PspBinary::parse(&raw).unwrap();
        assert!(binary.header().is_signed());
        assert!(!binary.header().is_compressed());
        let blob = binary.into_signed_blob(&keys).unwrap();
        assert_eq!(blob.signing_key_id(), KeyId([0x42; 16]));
        assert_eq!(blob.signed_data().len(), PSP_BINARY_HEADER_SIZE + body.len());
    }

    #[test]
    fn compressed_span_arithmetic() {
        let (private, key) = generated_key([0x43; 16], 2048);
        let mut keys = KeySet::new();
        keys.add(key, KeyType::AmdRoot).unwrap();

        // 0x123 B of compressed payload, padded to the 16-byte boundary.
        let compressed_size = 0x123usize;
        let padded = align_up_16(compressed_size as u64) as usize;
        let mut header = PspBinaryHeader::new_zeroed();
        header.signature_option = 1;
        header.signature_parameters = [0x43; 16];
        header.compression_options = 1;
        header.compressed_image_size = compressed_size as u32;
        header.uncompressed_image_size = 0x1000;
        header.size_signed = 0x1000;
        header.size_image = (PSP_BINARY_HEADER_SIZE + padded + 256) as u32;

        let mut raw = header.as_bytes().to_vec();
        raw.extend_from_slice(&vec![0x11u8; padded]);
        let signature = pss_sign(&private, &raw);
        raw.extend_from_slice(&signature);

        let blob = PspBinary::parse(&raw).unwrap().into_signed_blob(&keys).unwrap();
        assert_eq!(blob.signed_data().len(), PSP_BINARY_HEADER_SIZE + padded);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let keys = KeySet::new();
        let header = PspBinaryHeader::new_zeroed();
        let raw = header.as_bytes().to_vec();
        assert!(PspBinary::parse(&raw).unwrap().into_signed_blob(&keys).is_err());
    }

    #[test]
    fn unknown_signer_is_not_a_signature_error() {
        let (private, _) = generated_key([0x44; 16], 2048);
        let keys = KeySet::new();
        let raw = build_signed_binary(&private, [0x44; 16], &[0u8; 16]);
        match PspBinary::parse(&raw).unwrap().into_signed_blob(&keys) {
            Err(Error::UnknownSigningKey { key_id, .. }) => {
                assert_eq!(key_id, KeyId([0x44; 16]));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn short_buffer_is_a_boundary_violation() {
        let (private, key) = generated_key([0x45; 16], 2048);
        let mut keys = KeySet::new();
        keys.add(key, KeyType::AmdRoot).unwrap();
        let raw = build_signed_binary(&private, [0x45; 16], &[0u8; 64]);
        let truncated = &raw[..raw.len() - 8];
        assert!(matches!(
            PspBinary::parse(truncated).unwrap().into_signed_blob(&keys),
            Err(Error::BoundaryViolation { .. })
        ));
    }
}
