// SPDX-License-Identifier: MIT

//! AMD PSP firmware model: the Embedded Firmware Structure, the two-level
//! PSP and BIOS directory hierarchy, entry extraction and rewrite, and the
//! key chain rooted in the AMD public key.

use crate::error::{DirectoryKind, Error, FirmwareItem, Result};
use crate::image::FirmwareImage;
use crate::range::{check_boundaries, Range};
use core::mem;
use serde::Serialize;
use std::io::Write;
use zerocopy::FromBytes;

pub mod directory;
pub mod flash;
pub mod key;
pub mod psp_binary;
pub mod signature;
pub mod trust;

use directory::{
    BiosDirectory, BiosEntryType, DirectoryLevel, DirectoryTable, PspDirectory,
    PspDirectoryEntry, PspEntryType, BIOS_COOKIE, PSP_COOKIE, PSP_LEVEL2_COOKIE,
};
use directory::{BiosDirectoryEntry, BIOS_LEVEL2_COOKIE};
use flash::{EmbeddedFirmwareStructure, EFS_CANDIDATE_ADDRESSES, EFS_SIGNATURE};

const EFS_SIZE: usize = mem::size_of::<EmbeddedFirmwareStructure>();

/// Probes the candidate physical addresses for the EFS signature, in order,
/// and parses the first hit.
pub fn find_efs(image: &dyn FirmwareImage) -> Result<(Range, EmbeddedFirmwareStructure)> {
    let data = image.data();
    for phys in EFS_CANDIDATE_ADDRESSES {
        let offset = match image.phys_to_offset(phys) {
            Some(offset) => offset as usize,
            None => continue,
        };
        if offset + EFS_SIZE > data.len() {
            continue;
        }
        let signature = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if signature != EFS_SIGNATURE {
            continue;
        }
        match EmbeddedFirmwareStructure::read_from_prefix(&data[offset..]) {
            Some(efs) => {
                log::debug!("EFS found at physical address {:#x}, offset {:#x}", phys, offset);
                return Ok((Range::new(offset as u64, EFS_SIZE as u64), efs));
            }
            None => continue,
        }
    }
    Err(Error::NotFound(FirmwareItem::Efs))
}

/// Scans the image for the 4-byte cookie and parses the table at the first
/// hit that parses. A hit that fails to parse resumes the search at
/// `hit + 4`, so false cookies in payload bytes are skipped. All offsets
/// are absolute image offsets.
pub fn find_directory_table(
    image: &dyn FirmwareImage,
    cookie: &[u8; 4],
) -> Result<(DirectoryTable, Range)> {
    let data = image.data();
    let mut search_from = 0usize;
    while let Some(pos) = data[search_from..]
        .windows(4)
        .position(|window| window == cookie)
    {
        let hit = search_from + pos;
        match DirectoryTable::parse(&data[hit..]) {
            Ok((table, size)) => {
                return Ok((table, Range::new(hit as u64, size)));
            }
            Err(e) => {
                log::debug!("cookie at {:#x} does not parse: {}", hit, e);
                search_from = hit + 4;
            }
        }
    }
    let kind = match cookie {
        c if c == PSP_COOKIE => DirectoryKind::Psp,
        c if c == PSP_LEVEL2_COOKIE => DirectoryKind::PspLevel2,
        c if c == BIOS_LEVEL2_COOKIE => DirectoryKind::BiosLevel2,
        _ => DirectoryKind::Bios,
    };
    Err(Error::NotFound(FirmwareItem::Directory(kind)))
}

/// The parsed union of EFS, PSP directories, BIOS directories, and the byte
/// ranges each was parsed from.
#[derive(Clone, Debug, Serialize)]
pub struct PspFirmware {
    pub efs: EmbeddedFirmwareStructure,
    pub efs_range: Range,
    pub psp_level1: Option<PspDirectory>,
    pub psp_level1_range: Option<Range>,
    pub psp_level2: Option<PspDirectory>,
    pub psp_level2_range: Option<Range>,
    pub bios_level1: Option<BiosDirectory>,
    pub bios_level1_range: Option<Range>,
    pub bios_level2: Option<BiosDirectory>,
    pub bios_level2_range: Option<Range>,
}

fn parse_psp_at(image: &dyn FirmwareImage, pointer: u64) -> Result<(PspDirectory, Range)> {
    let offset = image
        .pointer_to_offset(pointer)
        .ok_or_else(|| Error::format(format!("pointer {:#x} is outside the image", pointer)))?;
    let dir = PspDirectory::parse(&image.data()[offset as usize..])?;
    let range = Range::new(offset, dir.byte_size());
    Ok((dir, range))
}

fn parse_bios_at(image: &dyn FirmwareImage, pointer: u64) -> Result<(BiosDirectory, Range)> {
    let offset = image
        .pointer_to_offset(pointer)
        .ok_or_else(|| Error::format(format!("pointer {:#x} is outside the image", pointer)))?;
    let dir = BiosDirectory::parse(&image.data()[offset as usize..])?;
    let range = Range::new(offset, dir.byte_size());
    Ok((dir, range))
}

fn warn_on_stale_checksum(kind: DirectoryKind, ok: bool) {
    if !ok {
        // Stale checksums ship in the field; the walk continues.
        log::warn!("{} carries a stale checksum", kind);
    }
}

/// Walks from the EFS to all reachable directory tables.
///
/// The EFS pointers are tried first; when a pointer is absent or does not
/// parse, the image is scanned for the cookie instead. Level-2 tables are
/// reached through the designated level-1 entries (PSP 0x40, BIOS 0x70).
pub fn parse_psp_firmware(image: &dyn FirmwareImage) -> Result<PspFirmware> {
    let (efs_range, efs) = find_efs(image)?;

    // Level-1 PSP directory: EFS pointer, then cookie scan.
    let mut psp_level1 = None;
    let mut psp_level1_range = None;
    if let Some(pointer) = efs.psp_directory_pointer() {
        match parse_psp_at(image, pointer as u64) {
            Ok((dir, range)) => {
                psp_level1 = Some(dir);
                psp_level1_range = Some(range);
            }
            Err(e) => log::debug!("EFS PSP pointer {:#x} does not parse: {}", pointer, e),
        }
    }
    if psp_level1.is_none() {
        if let Ok((table, range)) = find_directory_table(image, PSP_COOKIE) {
            psp_level1 = Some(table.into_psp()?);
            psp_level1_range = Some(range);
        }
    }

    // Level-2 PSP directory via the level-1 entry of type 0x40.
    let mut psp_level2 = None;
    let mut psp_level2_range = None;
    if let Some(level1) = &psp_level1 {
        warn_on_stale_checksum(DirectoryKind::Psp, level1.verify_checksum());
        let pointer = level1
            .entries_of_type(PspEntryType::PspLevel2Directory as u8)
            .map(|e| e.location())
            .find(|location| image.pointer_to_offset(*location).is_some());
        if let Some(pointer) = pointer {
            match parse_psp_at(image, pointer) {
                Ok((dir, range)) => {
                    warn_on_stale_checksum(DirectoryKind::PspLevel2, dir.verify_checksum());
                    psp_level2 = Some(dir);
                    psp_level2_range = Some(range);
                }
                Err(e) => log::warn!("level-2 PSP pointer {:#x} does not parse: {}", pointer, e),
            }
        }
    }

    // Level-1 BIOS directory: family-specific pointers in order, then scan.
    let mut bios_level1 = None;
    let mut bios_level1_range = None;
    for pointer in efs.bios_directory_pointers().iter().flatten() {
        match parse_bios_at(image, *pointer as u64) {
            Ok((dir, range)) => {
                bios_level1 = Some(dir);
                bios_level1_range = Some(range);
                break;
            }
            Err(e) => log::debug!("EFS BIOS pointer {:#x} does not parse: {}", pointer, e),
        }
    }
    if bios_level1.is_none() {
        if let Ok((table, range)) = find_directory_table(image, BIOS_COOKIE) {
            bios_level1 = Some(table.into_bios()?);
            bios_level1_range = Some(range);
        }
    }

    // Level-2 BIOS directory via the level-1 entry of type 0x70.
    let mut bios_level2 = None;
    let mut bios_level2_range = None;
    if let Some(level1) = &bios_level1 {
        warn_on_stale_checksum(DirectoryKind::Bios, level1.verify_checksum());
        let pointer = level1
            .entries_of_type(BiosEntryType::BiosLevel2Directory as u8)
            .iter()
            .map(|e| e.location())
            .find(|location| image.pointer_to_offset(*location).is_some());
        if let Some(pointer) = pointer {
            match parse_bios_at(image, pointer) {
                Ok((dir, range)) => {
                    warn_on_stale_checksum(DirectoryKind::BiosLevel2, dir.verify_checksum());
                    bios_level2 = Some(dir);
                    bios_level2_range = Some(range);
                }
                Err(e) => log::warn!("level-2 BIOS pointer {:#x} does not parse: {}", pointer, e),
            }
        }
    }

    Ok(PspFirmware {
        efs,
        efs_range,
        psp_level1,
        psp_level1_range,
        psp_level2,
        psp_level2_range,
        bios_level1,
        bios_level1_range,
        bios_level2,
        bios_level2_range,
    })
}

impl PspFirmware {
    pub fn psp_directory(&self, level: DirectoryLevel) -> Result<&PspDirectory> {
        let (dir, kind) = match level {
            DirectoryLevel::Level1 => (&self.psp_level1, DirectoryKind::Psp),
            DirectoryLevel::Level2 => (&self.psp_level2, DirectoryKind::PspLevel2),
        };
        dir.as_ref().ok_or(Error::NotFound(FirmwareItem::Directory(kind)))
    }

    pub fn bios_directory(&self, level: DirectoryLevel) -> Result<&BiosDirectory> {
        let (dir, kind) = match level {
            DirectoryLevel::Level1 => (&self.bios_level1, DirectoryKind::Bios),
            DirectoryLevel::Level2 => (&self.bios_level2, DirectoryKind::BiosLevel2),
        };
        dir.as_ref().ok_or(Error::NotFound(FirmwareItem::Directory(kind)))
    }

    pub fn bios_directory_range(&self, level: DirectoryLevel) -> Option<Range> {
        match level {
            DirectoryLevel::Level1 => self.bios_level1_range,
            DirectoryLevel::Level2 => self.bios_level2_range,
        }
    }

    /// All PSP entries of the given type at the given level.
    pub fn psp_entries(&self, level: DirectoryLevel, kind: u8) -> Result<Vec<&PspDirectoryEntry>> {
        Ok(self.psp_directory(level)?.entries_of_type(kind).collect())
    }

    /// The single PSP entry of the given type at the given level.
    pub fn psp_entry(&self, level: DirectoryLevel, kind: u8) -> Result<&PspDirectoryEntry> {
        let item = FirmwareItem::PspEntry { level: level.number(), kind };
        let entries = self.psp_entries(level, kind)?;
        match entries.as_slice() {
            [] => Err(Error::NotFound(item)),
            [entry] => Ok(*entry),
            _ => Err(Error::InvalidFormat {
                item: Some(item),
                reason: format!("{} entries where one was expected", entries.len()),
            }),
        }
    }

    /// BIOS entries of the given type at the given level, sorted ascending
    /// by instance. With `instance` given, restricted to that instance.
    pub fn bios_entries(
        &self,
        level: DirectoryLevel,
        kind: u8,
        instance: Option<u8>,
    ) -> Result<Vec<&BiosDirectoryEntry>> {
        let mut entries = self.bios_directory(level)?.entries_of_type(kind);
        if let Some(instance) = instance {
            entries.retain(|e| e.instance() == instance);
        }
        Ok(entries)
    }

    /// The single BIOS entry of the given type. Fails on multiplicity
    /// unless an instance is specified; more than one entry with the same
    /// instance is an error too.
    pub fn bios_entry(
        &self,
        level: DirectoryLevel,
        kind: u8,
        instance: Option<u8>,
    ) -> Result<&BiosDirectoryEntry> {
        let item = FirmwareItem::BiosEntry { level: level.number(), kind, instance };
        let entries = self.bios_entries(level, kind, instance)?;
        match entries.as_slice() {
            [] => Err(Error::NotFound(item)),
            [entry] => Ok(*entry),
            _ => Err(Error::InvalidFormat {
                item: Some(item),
                reason: format!("{} entries where one was expected", entries.len()),
            }),
        }
    }

    fn entry_bytes<'a>(
        &self,
        image: &'a dyn FirmwareImage,
        location: u64,
        size: u64,
    ) -> Result<&'a [u8]> {
        let data = image.data();
        let offset = image
            .pointer_to_offset(location)
            .ok_or_else(|| Error::format(format!("entry location {:#x} is outside the image", location)))?;
        check_boundaries(offset, offset + size, data)?;
        Ok(&data[offset as usize..(offset + size) as usize])
    }

    /// The bytes of a PSP entry. Entries with an inline value yield the
    /// value bytes instead of a range read.
    pub fn extract_psp_entry_bytes(
        &self,
        image: &dyn FirmwareImage,
        entry: &PspDirectoryEntry,
    ) -> Result<Vec<u8>> {
        if entry.has_inline_value() {
            return Ok(entry.location_or_value.to_le_bytes().to_vec());
        }
        self.entry_bytes(image, entry.location(), entry.size as u64)
            .map(|b| b.to_vec())
    }

    pub fn extract_bios_entry_bytes(
        &self,
        image: &dyn FirmwareImage,
        entry: &BiosDirectoryEntry,
    ) -> Result<Vec<u8>> {
        self.entry_bytes(image, entry.location(), entry.size as u64)
            .map(|b| b.to_vec())
    }

    fn patch_bytes<W: Write>(
        &self,
        image: &dyn FirmwareImage,
        location: u64,
        size: u64,
        new_bytes: &[u8],
        sink: &mut W,
    ) -> Result<()> {
        if new_bytes.len() as u64 != size {
            return Err(Error::format(format!(
                "replacement is {} B, entry is {} B",
                new_bytes.len(),
                size
            )));
        }
        let data = image.data();
        let offset = image
            .pointer_to_offset(location)
            .ok_or_else(|| Error::format(format!("entry location {:#x} is outside the image", location)))?;
        check_boundaries(offset, offset + size, data)?;
        // The input buffer may be a read-only memory map; it is never
        // mutated. The sink sees the full patched image once this returns.
        sink.write_all(&data[..offset as usize])?;
        sink.write_all(new_bytes)?;
        sink.write_all(&data[(offset + size) as usize..])?;
        Ok(())
    }

    /// Writes the image with the PSP entry's bytes replaced to `sink`.
    /// `new_bytes` must have exactly the entry's size.
    pub fn patch_psp_entry<W: Write>(
        &self,
        image: &dyn FirmwareImage,
        entry: &PspDirectoryEntry,
        new_bytes: &[u8],
        sink: &mut W,
    ) -> Result<()> {
        if entry.has_inline_value() {
            return Err(Error::format("entry value is inline, patch the directory instead"));
        }
        self.patch_bytes(image, entry.location(), entry.size as u64, new_bytes, sink)
    }

    /// Writes the image with the BIOS entry's bytes replaced to `sink`.
    pub fn patch_bios_entry<W: Write>(
        &self,
        image: &dyn FirmwareImage,
        entry: &BiosDirectoryEntry,
        new_bytes: &[u8],
        sink: &mut W,
    ) -> Result<()> {
        self.patch_bytes(image, entry.location(), entry.size as u64, new_bytes, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fletcher::fletcher32;
    use crate::image::MappedImage;
    use zerocopy::AsBytes;

    /// An image whose mapping places one candidate address at a chosen
    /// offset and every other candidate at offset 0.
    struct OddlyMapped {
        data: Vec<u8>,
        hot: u64,
        hot_offset: u64,
    }

    impl FirmwareImage for OddlyMapped {
        fn data(&self) -> &[u8] {
            &self.data
        }
        fn phys_to_offset(&self, phys: u64) -> Option<u64> {
            if phys == self.hot {
                Some(self.hot_offset)
            } else if EFS_CANDIDATE_ADDRESSES.contains(&phys) {
                Some(0)
            } else {
                None
            }
        }
        fn offset_to_phys(&self, offset: u64) -> Option<u64> {
            if offset == self.hot_offset {
                Some(self.hot)
            } else {
                None
            }
        }
    }

    fn efs_bytes(psp_pointer: u32) -> Vec<u8> {
        let mut efs = EmbeddedFirmwareStructure::new_zeroed();
        efs.signature = EFS_SIGNATURE;
        efs.psp_directory = psp_pointer;
        efs.second_gen = 0xffff_fffe;
        efs.as_bytes().to_vec()
    }

    #[test]
    fn efs_discovery_probes_candidates() {
        // Image: 4 junk bytes, then the EFS, then padding. The only
        // candidate mapped at the EFS is the last-probed one.
        let mut data = vec![0x01, 0x02, 0x03, 0x04];
        data.extend_from_slice(&efs_bytes(0));
        data.resize(0x1000, 0);
        let image = OddlyMapped { data, hot: 0xff02_0000, hot_offset: 4 };

        let (range, efs) = find_efs(&image).unwrap();
        assert_eq!(range, Range::new(4, 0x4a));
        assert_eq!({ efs.signature }, EFS_SIGNATURE);
    }

    #[test]
    fn efs_discovery_fails_without_signature() {
        let image = OddlyMapped { data: vec![0; 0x1000], hot: 0xff02_0000, hot_offset: 4 };
        assert!(find_efs(&image).is_err());
    }

    fn directory_bytes(cookie: &[u8; 4], entries: &[PspDirectoryEntry]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        for e in entries {
            body.extend_from_slice(e.as_bytes());
        }
        let mut out = Vec::new();
        out.extend_from_slice(cookie);
        out.extend_from_slice(&fletcher32(&body).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn cookie_scan_skips_false_hits() {
        let mut data = vec![0u8; 0x4000];
        // A false cookie with an absurd entry count at 0x100.
        data[0x100..0x104].copy_from_slice(PSP_COOKIE);
        data[0x108..0x10c].copy_from_slice(&u32::MAX.to_le_bytes());
        // The real directory at 0x1000.
        let entry = PspDirectoryEntry {
            kind: 0x01,
            sub_program: 0,
            flags: 0,
            size: 0x100,
            location_or_value: 0x2000,
        };
        let dir = directory_bytes(PSP_COOKIE, &[entry]);
        data[0x1000..0x1000 + dir.len()].copy_from_slice(&dir);

        let image = MappedImage::new(&data);
        let (table, range) = find_directory_table(&image, PSP_COOKIE).unwrap();
        assert_eq!(range.offset, 0x1000);
        assert_eq!(range.length, dir.len() as u64);
        assert!(matches!(table, DirectoryTable::Psp(_)));
    }

    #[test]
    fn cookie_scan_reports_not_found() {
        let data = vec![0u8; 0x1000];
        let image = MappedImage::new(&data);
        assert!(matches!(
            find_directory_table(&image, PSP_COOKIE),
            Err(Error::NotFound(FirmwareItem::Directory(DirectoryKind::Psp)))
        ));
    }

    #[test]
    fn firmware_walk_reaches_level2() {
        let mut data = vec![0u8; 0x40000];

        // Level-2 PSP directory at 0x3000.
        let l2 = directory_bytes(
            PSP_LEVEL2_COOKIE,
            &[PspDirectoryEntry {
                kind: 0x12,
                sub_program: 0,
                flags: 0,
                size: 0x100,
                location_or_value: 0x8000,
            }],
        );
        data[0x3000..0x3000 + l2.len()].copy_from_slice(&l2);

        // Level-1 PSP directory at 0x1000 pointing to it.
        let l1 = directory_bytes(
            PSP_COOKIE,
            &[PspDirectoryEntry {
                kind: PspEntryType::PspLevel2Directory as u8,
                sub_program: 0,
                flags: 0,
                size: 0x1000,
                location_or_value: 0x3000,
            }],
        );
        data[0x1000..0x1000 + l1.len()].copy_from_slice(&l1);

        // The image is too small for the conventional mapping to cover any
        // candidate address, so the test image maps one candidate itself.
        let efs = efs_bytes(0x1000);
        let efs_offset = 0x2_0000;
        data[efs_offset..efs_offset + efs.len()].copy_from_slice(&efs);

        struct Shim<'a>(&'a [u8]);
        impl FirmwareImage for Shim<'_> {
            fn data(&self) -> &[u8] {
                self.0
            }
            fn phys_to_offset(&self, phys: u64) -> Option<u64> {
                if phys == 0xfffa_0000 {
                    Some(0x2_0000)
                } else {
                    None
                }
            }
            fn offset_to_phys(&self, _offset: u64) -> Option<u64> {
                None
            }
        }

        let image = Shim(&data);
        let fw = parse_psp_firmware(&image).unwrap();
        assert!(fw.psp_level1.is_some());
        assert_eq!(fw.psp_level1_range.unwrap().offset, 0x1000);
        let l2_dir = fw.psp_directory(DirectoryLevel::Level2).unwrap();
        assert_eq!(&l2_dir.header.cookie, PSP_LEVEL2_COOKIE);
        assert_eq!(fw.psp_level2_range.unwrap().offset, 0x3000);

        // Entry extraction from level 2.
        let entry = fw.psp_entry(DirectoryLevel::Level2, 0x12).unwrap();
        let bytes = fw.extract_psp_entry_bytes(&image, entry).unwrap();
        assert_eq!(bytes.len(), 0x100);

        // No BIOS directory anywhere.
        assert!(matches!(
            fw.bios_directory(DirectoryLevel::Level1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn patch_rebuilds_the_image_around_the_entry() {
        let mut data = vec![0u8; 0x1000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let entry = PspDirectoryEntry {
            kind: 0x01,
            sub_program: 0,
            flags: 0,
            size: 0x10,
            location_or_value: 0x100,
        };
        let dir = directory_bytes(PSP_COOKIE, &[entry]);
        data[0..dir.len()].copy_from_slice(&dir);

        let image = MappedImage::new(&data);
        let fw = PspFirmware {
            efs: EmbeddedFirmwareStructure::new_zeroed(),
            efs_range: Range::new(0, 0),
            psp_level1: Some(PspDirectory::parse(&data).unwrap()),
            psp_level1_range: Some(Range::new(0, dir.len() as u64)),
            psp_level2: None,
            psp_level2_range: None,
            bios_level1: None,
            bios_level1_range: None,
            bios_level2: None,
            bios_level2_range: None,
        };
        let entry = fw.psp_entry(DirectoryLevel::Level1, 0x01).unwrap();

        let mut patched = Vec::new();
        fw.patch_psp_entry(&image, entry, &[0xeeu8; 0x10], &mut patched).unwrap();
        assert_eq!(patched.len(), data.len());
        assert_eq!(&patched[..0x100], &data[..0x100]);
        assert_eq!(&patched[0x100..0x110], &[0xeeu8; 0x10][..]);
        assert_eq!(&patched[0x110..], &data[0x110..]);
        // The input image is untouched.
        assert_eq!(image.data(), &data[..]);

        let mut sink = Vec::new();
        assert!(fw.patch_psp_entry(&image, entry, &[0u8; 4], &mut sink).is_err());
    }
}
