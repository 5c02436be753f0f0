// SPDX-License-Identifier: MIT

//! AMD public keys and the key set they are collected into.
//!
//! Keys appear in three places with three wire formats: the self-certifying
//! root key and the signed key tokens (ABL, OEM) use the token format, the
//! key database carries its own record format. All multi-byte integers are
//! little-endian; modulus and exponent are stored little-endian as well.

use crate::error::{Error, Result};
use crate::range::{check_boundaries, reverse_bytes};
use core::fmt::{self, Display};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use zerocopy::{AsBytes, FromBytes};

/// 16-byte identifier of a public key. Equal to the signer reference in PSP
/// binary headers.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self)
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a key's trust comes from.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum KeyType {
    /// Self-certifying trust anchor from PSP entry 0x00.
    AmdRoot,
    /// Record inside the key database blob, trusted because the containing
    /// binary is verified by the root key.
    KeyDatabase,
    /// AGESA bootloader signing key, a signed token.
    Abl,
    /// Platform-vendor BIOS signing key, a signed token.
    Oem,
}

impl Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyType::AmdRoot => "AMD root",
            KeyType::KeyDatabase => "key database",
            KeyType::Abl => "ABL",
            KeyType::Oem => "OEM",
        };
        write!(f, "{}", s)
    }
}

/// The purpose encoded in a key's usage flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum KeyUsage {
    /// 0: signs AMD bootloader, PSP and SMU firmware
    SignAmdBootloaderPspSmu,
    /// 1: signs BIOS
    SignBios,
    /// 2: signs AMD OEM PSP binaries
    SignAmdOemPsp,
    /// 8: platform secure boot BIOS signing
    PsbSignBios,
    Unknown(u32),
}

impl From<u32> for KeyUsage {
    fn from(v: u32) -> Self {
        match v {
            0 => KeyUsage::SignAmdBootloaderPspSmu,
            1 => KeyUsage::SignBios,
            2 => KeyUsage::SignAmdOemPsp,
            8 => KeyUsage::PsbSignBios,
            other => KeyUsage::Unknown(other),
        }
    }
}

bitflags::bitflags! {
    /// Security feature vector of a PSB BIOS-signing key.
    pub struct SecurityFeatures: u8 {
        const DISABLE_BIOS_KEY_ANTI_ROLLBACK = 1 << 0;
        const DISABLE_AMD_BIOS_KEY_USE = 1 << 1;
        const DISABLE_SECURE_DEBUG_UNLOCK = 1 << 2;
    }
}

/// Platform-binding information carried in the reserved region of PSB
/// BIOS-signing keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct PlatformBinding {
    pub vendor_id: u8,
    pub key_revision_id: u8,
    pub platform_model_id: u8,
    #[serde(serialize_with = "serialize_features")]
    pub security_features: SecurityFeatures,
}

fn serialize_features<S: Serializer>(
    features: &SecurityFeatures,
    serializer: S,
) -> core::result::Result<S::Ok, S::Error> {
    serializer.serialize_u8(features.bits())
}

impl PlatformBinding {
    fn from_reserved(reserved: &[u8; 16]) -> Self {
        Self {
            vendor_id: reserved[0],
            platform_model_id: reserved[1] & 0xf,
            key_revision_id: reserved[1] >> 4,
            security_features: SecurityFeatures::from_bits_truncate(reserved[2]),
        }
    }
}

/// Token wire format: 64-byte prefix, then exponent and modulus. Signed
/// tokens append a trailing signature sized by the certifying key.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct TokenKeyPrefix {
    pub version: u32,
    pub key_id: [u8; 16],
    pub certifying_key_id: [u8; 16],
    pub key_usage_flag: u32,
    pub reserved: [u8; 16],
    pub exponent_size_bits: u32,
    pub modulus_size_bits: u32,
}

pub const TOKEN_KEY_PREFIX_SIZE: usize = core::mem::size_of::<TokenKeyPrefix>();

/// Key database record: an 80-byte header followed by the modulus.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct DbKeyHeader {
    pub data_size: u32,
    pub version: u32,
    pub key_usage_flag: u32,
    pub public_exponent: [u8; 4],
    pub key_id: [u8; 16],
    pub key_size_bits: u32,
    pub reserved: [u8; 44],
}

pub const DB_KEY_HEADER_SIZE: usize = core::mem::size_of::<DbKeyHeader>();

/// Header of the key database blob, after the PSP binary header is
/// stripped.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct KeyDatabaseHeader {
    pub size: u32,
    pub version: u32,
    pub cookie: [u8; 4],
    pub reserved: [u8; 36],
    pub customer_defined: [u8; 32],
}

pub const KEY_DATABASE_HEADER_SIZE: usize = core::mem::size_of::<KeyDatabaseHeader>();

/// An RSA public key from any of the three sources.
#[derive(Clone, Debug)]
pub struct Key {
    pub version: u32,
    pub key_id: KeyId,
    pub certifying_key_id: KeyId,
    pub key_usage_flag: u32,
    pub platform_binding: Option<PlatformBinding>,
    pub exponent_size_bits: u32,
    pub modulus_size_bits: u32,
    /// little-endian
    pub exponent: Vec<u8>,
    /// little-endian
    pub modulus: Vec<u8>,
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Key", 6)?;
        s.serialize_field("version", &self.version)?;
        s.serialize_field("key_id", &self.key_id)?;
        s.serialize_field("certifying_key_id", &self.certifying_key_id)?;
        s.serialize_field("usage", &self.usage())?;
        s.serialize_field("platform_binding", &self.platform_binding)?;
        s.serialize_field("modulus_size_bits", &self.modulus_size_bits)?;
        s.end()
    }
}

fn check_key_size(bits: u32, what: &str) -> Result<usize> {
    if bits == 0 || bits % 8 != 0 || bits > 8192 {
        return Err(Error::format(format!("implausible {} size: {} bits", what, bits)));
    }
    Ok(bits as usize / 8)
}

impl Key {
    /// Parses a token-format key without a trailing signature and requires
    /// it to be self-certifying. This is the trust anchor; callers obtain
    /// the bytes from immutable storage.
    pub fn new_root(data: &[u8]) -> Result<Self> {
        let (key, _) = Self::from_token(data)?;
        if key.key_id != key.certifying_key_id {
            return Err(Error::format(format!(
                "root key {} is not self-certifying (certified by {})",
                key.key_id, key.certifying_key_id
            )));
        }
        Ok(key)
    }

    /// Parses a signed key token (ABL, OEM) and verifies its trailing
    /// signature against the certifying key in `keys`.
    ///
    /// The signed region is prefix ‖ exponent ‖ modulus; the signature is
    /// the trailing bytes in reversed byte order, sized by the certifying
    /// key's modulus.
    pub fn new_signed_token(data: &[u8], keys: &KeySet) -> Result<Self> {
        let (key, body_end) = Self::from_token(data)?;
        let certifying = keys
            .get(&key.certifying_key_id)
            .ok_or(Error::UnknownSigningKey { key_id: key.certifying_key_id, item: None })?;
        let signature_size = certifying.signature_size();
        check_boundaries(body_end as u64, (body_end + signature_size) as u64, data)?;
        let signature = reverse_bytes(&data[body_end..body_end + signature_size]);
        crate::amd::signature::SignedBlob::new(&signature, &data[..body_end], certifying)?;
        Ok(key)
    }

    fn from_token(data: &[u8]) -> Result<(Self, usize)> {
        let prefix = TokenKeyPrefix::read_from_prefix(data)
            .ok_or_else(|| Error::format("key token truncated"))?;
        let exponent_size = check_key_size(prefix.exponent_size_bits, "exponent")?;
        let modulus_size = check_key_size(prefix.modulus_size_bits, "modulus")?;
        let exponent_end = TOKEN_KEY_PREFIX_SIZE + exponent_size;
        let body_end = exponent_end + modulus_size;
        check_boundaries(TOKEN_KEY_PREFIX_SIZE as u64, body_end as u64, data)?;

        let usage = KeyUsage::from(prefix.key_usage_flag);
        let platform_binding = if usage == KeyUsage::PsbSignBios {
            Some(PlatformBinding::from_reserved(&prefix.reserved))
        } else {
            None
        };
        let key = Key {
            version: prefix.version,
            key_id: KeyId(prefix.key_id),
            certifying_key_id: KeyId(prefix.certifying_key_id),
            key_usage_flag: prefix.key_usage_flag,
            platform_binding,
            exponent_size_bits: prefix.exponent_size_bits,
            modulus_size_bits: prefix.modulus_size_bits,
            exponent: data[TOKEN_KEY_PREFIX_SIZE..exponent_end].to_vec(),
            modulus: data[exponent_end..body_end].to_vec(),
        };
        Ok((key, body_end))
    }

    /// Parses one record of the key database and returns it together with
    /// the record's size. The record's 4-byte exponent is zero-extended to
    /// the modulus width so all keys expose a uniform shape.
    pub fn from_database_record(data: &[u8]) -> Result<(Self, usize)> {
        let header = DbKeyHeader::read_from_prefix(data)
            .ok_or_else(|| Error::format("key database record truncated"))?;
        let modulus_size = check_key_size(header.key_size_bits, "modulus")?;
        let record_size = DB_KEY_HEADER_SIZE + modulus_size;
        if header.data_size as usize != record_size {
            return Err(Error::format(format!(
                "key database record declares {} B, expected {} B",
                { header.data_size },
                record_size
            )));
        }
        check_boundaries(DB_KEY_HEADER_SIZE as u64, record_size as u64, data)?;

        let mut exponent = vec![0u8; modulus_size];
        exponent[..4].copy_from_slice(&header.public_exponent);
        // Database entries are certified by the containing blob; the slot
        // at the head of the reserved region stays zero.
        let mut certifying_key_id = [0u8; 16];
        certifying_key_id.copy_from_slice(&header.reserved[..16]);
        let key = Key {
            version: header.version,
            key_id: KeyId(header.key_id),
            certifying_key_id: KeyId(certifying_key_id),
            key_usage_flag: header.key_usage_flag,
            platform_binding: None,
            exponent_size_bits: header.key_size_bits,
            modulus_size_bits: header.key_size_bits,
            exponent,
            modulus: data[DB_KEY_HEADER_SIZE..record_size].to_vec(),
        };
        Ok((key, record_size))
    }

    pub fn usage(&self) -> KeyUsage {
        KeyUsage::from(self.key_usage_flag)
    }

    /// Length in bytes of a signature made with this key.
    pub fn signature_size(&self) -> usize {
        self.modulus_size_bits as usize / 8
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {} (RSA-{}, usage {:?})",
            self.key_id, self.modulus_size_bits, self.usage()
        )
    }
}

/// Parses the key database body (after the PSP binary header is stripped)
/// and adds every record to `keys` with type [`KeyType::KeyDatabase`].
/// Returns the number of keys added.
pub fn parse_key_database(body: &[u8], keys: &mut KeySet) -> Result<usize> {
    let header = KeyDatabaseHeader::read_from_prefix(body)
        .ok_or_else(|| Error::format("key database header truncated"))?;
    log::debug!(
        "key database: {} B declared, version {}, cookie {:02x?}",
        { header.size },
        { header.version },
        header.cookie
    );
    let mut rest = &body[KEY_DATABASE_HEADER_SIZE..];
    let mut count = 0;
    while !rest.is_empty() {
        let (key, record_size) = Key::from_database_record(rest)?;
        if !key.certifying_key_id.is_zero() {
            return Err(Error::format(format!(
                "key database record {} carries a certifying key id",
                key.key_id
            )));
        }
        keys.add(key, KeyType::KeyDatabase)?;
        rest = &rest[record_size..];
        count += 1;
    }
    Ok(count)
}

/// The keys collected while walking the chain, indexed by KeyID and by
/// trust type.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KeySet {
    keys: BTreeMap<KeyId, Key>,
    by_type: BTreeMap<KeyType, Vec<KeyId>>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when a key with the same KeyID is already present.
    pub fn add(&mut self, key: Key, kind: KeyType) -> Result<()> {
        if self.keys.contains_key(&key.key_id) {
            return Err(Error::format(format!("duplicate key id {}", key.key_id)));
        }
        self.by_type.entry(kind).or_default().push(key.key_id);
        self.keys.insert(key.key_id, key);
        Ok(())
    }

    pub fn get(&self, id: &KeyId) -> Option<&Key> {
        self.keys.get(id)
    }

    pub fn keys_of_type(&self, kind: KeyType) -> Vec<&Key> {
        self.by_type
            .get(&kind)
            .map(|ids| ids.iter().filter_map(|id| self.keys.get(id)).collect())
            .unwrap_or_default()
    }

    /// A key set restricted to one trust type. The keys themselves are
    /// preserved unchanged.
    pub fn subset(&self, kind: KeyType) -> KeySet {
        let mut out = KeySet::new();
        for key in self.keys_of_type(kind) {
            // Cannot collide: ids are unique in self.
            let _ = out.add(key.clone(), kind);
        }
        out
    }

    pub fn all(&self) -> impl Iterator<Item = &Key> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, ids) in &self.by_type {
            for id in ids {
                if let Some(key) = self.keys.get(id) {
                    writeln!(f, "{:14} {}", kind.to_string(), key)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn token_bytes(
        key_id: [u8; 16],
        certifying: [u8; 16],
        usage: u32,
        modulus: &[u8],
        exponent: &[u8],
    ) -> Vec<u8> {
        assert_eq!(modulus.len(), exponent.len());
        let prefix = TokenKeyPrefix {
            version: 1,
            key_id,
            certifying_key_id: certifying,
            key_usage_flag: usage,
            reserved: [0; 16],
            exponent_size_bits: (exponent.len() * 8) as u32,
            modulus_size_bits: (modulus.len() * 8) as u32,
        };
        let mut out = prefix.as_bytes().to_vec();
        out.extend_from_slice(exponent);
        out.extend_from_slice(modulus);
        out
    }

    #[test]
    fn root_key_must_self_certify() {
        let modulus = vec![0xabu8; 256];
        let exponent = {
            let mut e = vec![0u8; 256];
            e[0] = 0x01;
            e[2] = 0x01;
            e
        };
        let id = [7u8; 16];
        let token = token_bytes(id, id, 0, &modulus, &exponent);
        let key = Key::new_root(&token).unwrap();
        assert_eq!(key.key_id, KeyId(id));
        assert_eq!(key.modulus_size_bits, 2048);
        assert_eq!(key.signature_size(), 256);
        assert_eq!(key.modulus, modulus);

        let other = token_bytes(id, [8u8; 16], 0, &modulus, &exponent);
        assert!(Key::new_root(&other).is_err());
    }

    #[test]
    fn truncated_token_is_rejected() {
        let modulus = vec![0u8; 256];
        let token = token_bytes([1; 16], [1; 16], 0, &modulus, &modulus);
        assert!(matches!(
            Key::new_root(&token[..token.len() - 1]),
            Err(Error::BoundaryViolation { .. })
        ));
        assert!(Key::new_root(&token[..32]).is_err());
    }

    #[test]
    fn psb_keys_expose_platform_binding() {
        let modulus = vec![0u8; 256];
        let mut token = token_bytes([2; 16], [2; 16], 8, &modulus, &modulus);
        // reserved region starts at offset 0x28
        token[0x28] = 0x34; // vendor
        token[0x29] = 0x21; // revision 2, model 1
        token[0x2a] = 0x05; // features
        let key = Key::new_root(&token).unwrap();
        let binding = key.platform_binding.unwrap();
        assert_eq!(binding.vendor_id, 0x34);
        assert_eq!(binding.key_revision_id, 2);
        assert_eq!(binding.platform_model_id, 1);
        assert!(binding
            .security_features
            .contains(SecurityFeatures::DISABLE_BIOS_KEY_ANTI_ROLLBACK));
        assert!(binding
            .security_features
            .contains(SecurityFeatures::DISABLE_SECURE_DEBUG_UNLOCK));
        assert!(!binding
            .security_features
            .contains(SecurityFeatures::DISABLE_AMD_BIOS_KEY_USE));
    }

    #[test]
    fn key_set_rejects_duplicates_and_filters() {
        let modulus = vec![0u8; 256];
        let a = Key::new_root(&token_bytes([1; 16], [1; 16], 0, &modulus, &modulus)).unwrap();
        let b = Key::new_root(&token_bytes([2; 16], [2; 16], 8, &modulus, &modulus)).unwrap();

        let mut set = KeySet::new();
        set.add(a.clone(), KeyType::AmdRoot).unwrap();
        set.add(b, KeyType::Oem).unwrap();
        assert!(set.add(a, KeyType::KeyDatabase).is_err());
        assert_eq!(set.len(), 2);

        assert_eq!(set.keys_of_type(KeyType::Oem).len(), 1);
        assert_eq!(set.keys_of_type(KeyType::Abl).len(), 0);
        let oem_only = set.subset(KeyType::Oem);
        assert_eq!(oem_only.len(), 1);
        assert!(oem_only.get(&KeyId([2; 16])).is_some());
        assert!(oem_only.get(&KeyId([1; 16])).is_none());
    }

    #[test]
    fn database_record_roundtrip() {
        let modulus: Vec<u8> = (0..=255).collect();
        let header = DbKeyHeader {
            data_size: (DB_KEY_HEADER_SIZE + modulus.len()) as u32,
            version: 1,
            key_usage_flag: 0,
            public_exponent: 0x10001u32.to_le_bytes(),
            key_id: [9; 16],
            key_size_bits: 2048,
            reserved: [0; 44],
        };
        let mut record = header.as_bytes().to_vec();
        record.extend_from_slice(&modulus);

        let (key, consumed) = Key::from_database_record(&record).unwrap();
        assert_eq!(consumed, record.len());
        assert_eq!(key.key_id, KeyId([9; 16]));
        assert!(key.certifying_key_id.is_zero());
        assert_eq!(key.modulus, modulus);
        assert_eq!(key.exponent.len(), 256);
        assert_eq!(&key.exponent[..4], &0x10001u32.to_le_bytes()[..]);
        assert!(key.exponent[4..].iter().all(|&b| b == 0));

        let mut bad = record.clone();
        bad[0] ^= 1; // data_size mismatch
        assert!(Key::from_database_record(&bad).is_err());
    }

    #[test]
    fn database_parse_walks_all_records() {
        let modulus = vec![3u8; 256];
        let mut body = KeyDatabaseHeader {
            size: 0,
            version: 1,
            cookie: *b"$KDB",
            reserved: [0; 36],
            customer_defined: [0; 32],
        }
        .as_bytes()
        .to_vec();
        for id in 1u8..=3 {
            let header = DbKeyHeader {
                data_size: (DB_KEY_HEADER_SIZE + modulus.len()) as u32,
                version: 1,
                key_usage_flag: 0,
                public_exponent: 0x10001u32.to_le_bytes(),
                key_id: [id; 16],
                key_size_bits: 2048,
                reserved: [0; 44],
            };
            body.extend_from_slice(header.as_bytes());
            body.extend_from_slice(&modulus);
        }

        let mut keys = KeySet::new();
        assert_eq!(parse_key_database(&body, &mut keys).unwrap(), 3);
        assert_eq!(keys.keys_of_type(KeyType::KeyDatabase).len(), 3);
    }
}
