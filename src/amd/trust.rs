// SPDX-License-Identifier: MIT

//! The AMD trust walk: collect the key chain out of the firmware, then
//! verify individual entries and the BIOS RTM volume against it.

use crate::amd::directory::{BiosEntryType, DirectoryLevel, PspEntryType};
use crate::amd::key::{parse_key_database, Key, KeyId, KeySet, KeyType};
use crate::amd::psp_binary::{PspBinary, PSP_BINARY_HEADER_SIZE};
use crate::amd::signature::new_multi_key_signed_blob;
use crate::amd::PspFirmware;
use crate::error::{Error, FirmwareItem, Result};
use crate::image::FirmwareImage;
use crate::range::reverse_bytes;
use core::convert::TryFrom;
use core::fmt::{self, Display};

/// Outcome of validating one signed firmware element.
#[derive(Debug)]
pub struct EntryValidation {
    pub item: FirmwareItem,
    /// The key the element names as its signer, whether or not it is known.
    pub signing_key: Option<KeyId>,
    pub error: Option<Error>,
}

impl EntryValidation {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

impl Display for EntryValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signer = match &self.signing_key {
            Some(id) => id.to_string(),
            None => "unknown signer".to_string(),
        };
        match &self.error {
            None => write!(f, "{}: signature by {} verifies", self.item, signer),
            Some(e) => write!(f, "{}: {}", self.item, e),
        }
    }
}

/// Assembles the key set for the given PSP directory level:
///
/// 1. the self-certifying AMD root key from the level-1 entry 0x00,
/// 2. the key database, a PSP binary verified by the root key,
/// 3. the ABL token key, verified against the chain so far,
/// 4. the OEM BIOS-signing token at BIOS entry 0x05 instance 0; absent in
///    PSB-disabled firmware, which is not an error.
pub fn get_keys(
    image: &dyn FirmwareImage,
    fw: &PspFirmware,
    level: DirectoryLevel,
) -> Result<KeySet> {
    let mut keys = KeySet::new();

    let root_item = FirmwareItem::PspEntry {
        level: 1,
        kind: PspEntryType::AmdPublicKey as u8,
    };
    let root_entry = fw.psp_entry(DirectoryLevel::Level1, PspEntryType::AmdPublicKey as u8)?;
    let root_bytes = fw.extract_psp_entry_bytes(image, root_entry)?;
    let root = Key::new_root(&root_bytes).map_err(|e| e.with_item(root_item))?;
    keys.add(root, KeyType::AmdRoot)?;

    let db_item = FirmwareItem::PspEntry {
        level: level.number(),
        kind: PspEntryType::KeyDatabase as u8,
    };
    let db_entry = fw.psp_entry(level, PspEntryType::KeyDatabase as u8)?;
    let db_bytes = fw.extract_psp_entry_bytes(image, db_entry)?;
    let db_binary = PspBinary::parse(&db_bytes).map_err(|e| e.with_item(db_item))?;
    let db_blob = db_binary
        .into_signed_blob(&keys)
        .map_err(|e| e.with_item(db_item))?;
    let db_body = &db_blob.signed_data()[PSP_BINARY_HEADER_SIZE..];
    let added = parse_key_database(db_body, &mut keys).map_err(|e| e.with_item(db_item))?;
    log::debug!("key database contributes {} keys", added);

    let abl_item = FirmwareItem::PspEntry {
        level: level.number(),
        kind: PspEntryType::AblPublicKey as u8,
    };
    let abl_entry = fw.psp_entry(level, PspEntryType::AblPublicKey as u8)?;
    let abl_bytes = fw.extract_psp_entry_bytes(image, abl_entry)?;
    let abl = Key::new_signed_token(&abl_bytes, &keys).map_err(|e| e.with_item(abl_item))?;
    keys.add(abl, KeyType::Abl)?;

    let oem_item = FirmwareItem::BiosEntry {
        level: level.number(),
        kind: BiosEntryType::OemSigningKey as u8,
        instance: Some(0),
    };
    match fw.bios_entry(level, BiosEntryType::OemSigningKey as u8, Some(0)) {
        Ok(oem_entry) => {
            let oem_bytes = fw.extract_bios_entry_bytes(image, oem_entry)?;
            let oem =
                Key::new_signed_token(&oem_bytes, &keys).map_err(|e| e.with_item(oem_item))?;
            keys.add(oem, KeyType::Oem)?;
        }
        Err(Error::NotFound(_)) => {
            // PSB-disabled firmware ships without an OEM signing key.
            log::info!("no OEM signing key entry; PSB appears disabled");
        }
        Err(e) => return Err(e),
    }

    Ok(keys)
}

/// Entry types that are not PSP binaries: raw keys, directories, and
/// inline values have no generic header to validate.
fn skip_validation(kind: u8) -> bool {
    matches!(
        PspEntryType::try_from(kind),
        Ok(PspEntryType::AmdPublicKey
            | PspEntryType::AblPublicKey
            | PspEntryType::AmdSecureDebugKey
            | PspEntryType::PspTrustletPublicKey
            | PspEntryType::DxioPhySramFirmwarePublicKey
            | PspEntryType::PspTrustedOsPublicKeysTable
            | PspEntryType::SoftFuseChain
            | PspEntryType::WrappedIkek
            | PspEntryType::PspTokenUnlock
            | PspEntryType::PspNonVolatileData
            | PspEntryType::PspLevel2Directory)
    )
}

/// Verifies the signature of every signed PSP entry at the given level.
pub fn validate_psp_entries(
    image: &dyn FirmwareImage,
    fw: &PspFirmware,
    level: DirectoryLevel,
    keys: &KeySet,
) -> Result<Vec<EntryValidation>> {
    let directory = fw.psp_directory(level)?;
    let mut results = Vec::new();
    for entry in &directory.entries {
        if skip_validation(entry.kind) || entry.has_inline_value() {
            continue;
        }
        let item = FirmwareItem::PspEntry { level: level.number(), kind: entry.kind };
        let bytes = match fw.extract_psp_entry_bytes(image, entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                results.push(EntryValidation { item, signing_key: None, error: Some(e) });
                continue;
            }
        };
        if bytes.len() < PSP_BINARY_HEADER_SIZE {
            continue;
        }
        let binary = match PspBinary::parse(&bytes) {
            Ok(binary) => binary,
            Err(_) => continue,
        };
        let header = binary.header();
        if !header.is_signed() || header.size_signed == 0 {
            continue;
        }
        let signing_key = Some(header.signing_key_id());
        let error = binary
            .into_signed_blob(keys)
            .map_err(|e| e.with_item(item))
            .err();
        results.push(EntryValidation { item, signing_key, error });
    }
    Ok(results)
}

/// Outcome of the RTM volume validation.
#[derive(Debug)]
pub struct RtmValidation {
    pub signed_item: FirmwareItem,
    pub signing_key: Option<KeyId>,
    pub error: Option<Error>,
}

impl RtmValidation {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

impl Display for RtmValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.signing_key, &self.error) {
            (Some(id), None) => write!(f, "RTM volume verifies against OEM key {}", id),
            (_, Some(e)) => write!(f, "RTM volume does not verify: {}", e),
            (None, None) => write!(f, "RTM volume unverified"),
        }
    }
}

/// Validates the BIOS RTM volume against the OEM signing keys.
///
/// The signed data is the RTM volume followed by the level-1 BIOS directory
/// bytes and, for `bios_level` 2, the level-2 BIOS directory bytes. The
/// stored signature is byte-reversed.
pub fn validate_rtm(
    image: &dyn FirmwareImage,
    fw: &PspFirmware,
    bios_level: DirectoryLevel,
    keys: &KeySet,
) -> Result<RtmValidation> {
    let volume_item = FirmwareItem::BiosEntry {
        level: bios_level.number(),
        kind: BiosEntryType::RtmVolume as u8,
        instance: Some(0),
    };
    let volume_entry = fw.bios_entry(bios_level, BiosEntryType::RtmVolume as u8, Some(0))?;
    let volume = fw.extract_bios_entry_bytes(image, volume_entry)?;

    let signature_entry =
        fw.bios_entry(bios_level, BiosEntryType::RtmSignature as u8, Some(0))?;
    let signature = fw.extract_bios_entry_bytes(image, signature_entry)?;

    let oem_keys = keys.subset(KeyType::Oem);
    if oem_keys.is_empty() {
        return Err(Error::NotFound(FirmwareItem::BiosEntry {
            level: bios_level.number(),
            kind: BiosEntryType::OemSigningKey as u8,
            instance: Some(0),
        }));
    }

    let mut signed_data = volume;
    let level1_range = fw
        .bios_directory_range(DirectoryLevel::Level1)
        .ok_or(Error::NotFound(FirmwareItem::Directory(crate::error::DirectoryKind::Bios)))?;
    signed_data.extend_from_slice(level1_range.bytes(image.data())?);
    if bios_level == DirectoryLevel::Level2 {
        let level2_range = fw.bios_directory_range(DirectoryLevel::Level2).ok_or(
            Error::NotFound(FirmwareItem::Directory(crate::error::DirectoryKind::BiosLevel2)),
        )?;
        signed_data.extend_from_slice(level2_range.bytes(image.data())?);
    }

    let reversed = reverse_bytes(&signature);
    match new_multi_key_signed_blob(&reversed, &signed_data, &oem_keys) {
        Ok(blob) => Ok(RtmValidation {
            signed_item: volume_item,
            signing_key: Some(blob.signing_key_id()),
            error: None,
        }),
        Err(e) => Ok(RtmValidation {
            signed_item: volume_item,
            signing_key: None,
            error: Some(e.with_item(volume_item)),
        }),
    }
}
