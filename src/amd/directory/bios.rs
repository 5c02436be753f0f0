// SPDX-License-Identifier: MIT

use super::{
    addr_mode_of, directory_checksum, AddrMode, DirectoryHeader, DirectoryLevel,
    BIOS_COOKIE, BIOS_LEVEL2_COOKIE, DIRECTORY_HEADER_SIZE, ENTRY_ADDR_MASK,
};
use crate::error::{DirectoryKind, Error, FirmwareItem, Result};
use core::fmt::{self, Display};
use core::mem;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes};

/// One 24-byte BIOS directory entry.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct BiosDirectoryEntry {
    /// 0x00: type of entry
    pub kind: u8,
    /// 0x01: memory region security attributes
    pub region_kind: u8,
    /// 0x02: reset/copy/read-only/compressed bits and the instance number
    pub flags: u8,
    /// 0x03: sub-program and ROM id
    pub routing: u8,
    /// 0x04: size of the entry
    pub size: u32,
    /// 0x08: source address
    pub source: u64,
    /// 0x10: destination address
    pub destination: u64,
}

impl BiosDirectoryEntry {
    pub fn reset_image(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn copy_image(&self) -> bool {
        self.flags & 0x02 != 0
    }

    pub fn read_only(&self) -> bool {
        self.flags & 0x04 != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & 0x08 != 0
    }

    pub fn instance(&self) -> u8 {
        (self.flags >> 4) & 0xf
    }

    pub fn sub_program(&self) -> u8 {
        self.routing & 0x7
    }

    pub fn rom_id(&self) -> u8 {
        (self.routing >> 3) & 0x3
    }

    pub fn addr_mode(&self) -> AddrMode {
        addr_mode_of(self.source)
    }

    /// The source location with the addressing-mode bits stripped.
    pub fn location(&self) -> u64 {
        self.source & ENTRY_ADDR_MASK
    }

    pub fn description(&self) -> &'static str {
        bios_entry_description(self.kind)
    }
}

impl Display for BiosDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind;
        let rk = self.region_kind;
        let desc = self.description();
        let d = self.destination;
        let dest = if d == u64::MAX || d == 0 {
            String::new()
        } else {
            format!(" -> {:08x}", d)
        };
        write!(
            f,
            "{:02x}.{:02x}.{:02x} i{} {:40} {:08x} @ {:08x}{}",
            kind,
            self.sub_program(),
            rk,
            self.instance(),
            desc,
            { self.size },
            self.location(),
            dest
        )
    }
}

pub fn bios_entry_description(kind: u8) -> &'static str {
    match kind {
        0x05 => "BIOS Signing Key",
        0x07 => "BIOS RTM Signature",
        0x60 => "AGESA PSP Customization Block",
        0x61 => "AGESA PSP Output Block",
        0x62 => "BIOS RTM Volume",
        0x63 => "AGESA PSP Output Block NVRAM",
        0x64 => "PMU Firmware Code",
        0x65 => "PMU Firmware Data",
        0x66 => "Microcode",
        0x67 => "Machine Check Exception Data",
        0x68 => "AGESA PSP Customization Block Backup",
        0x6A => "MP2 Firmware",
        0x70 => "BIOS Level 2 Directory",
        _ => "Unknown",
    }
}

/// Entry types the trust walker cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(u8)]
pub enum BiosEntryType {
    OemSigningKey = 0x05,
    RtmSignature = 0x07,
    RtmVolume = 0x62,
    Microcode = 0x66,
    BiosLevel2Directory = 0x70,
}

/// A BIOS directory table, level 1 (`$BHD`) or level 2 (`$BL2`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BiosDirectory {
    pub header: DirectoryHeader,
    pub entries: Vec<BiosDirectoryEntry>,
}

impl Display for BiosDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}

impl BiosDirectory {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || (&data[..4] != BIOS_COOKIE && &data[..4] != BIOS_LEVEL2_COOKIE) {
            return Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Bios)),
                reason: "BIOS directory cookie not found".into(),
            });
        }
        let header = DirectoryHeader::read_from_prefix(data).ok_or_else(|| {
            Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Bios)),
                reason: "BIOS directory header truncated".into(),
            }
        })?;
        // Entries may sit at any byte offset in the image, so each one is
        // copied out rather than viewed in place. The claimed count is
        // checked against the buffer before anything is allocated.
        let entry_size = mem::size_of::<BiosDirectoryEntry>();
        let count = header.total_entries as usize;
        let mut rest = &data[DIRECTORY_HEADER_SIZE..];
        if count > rest.len() / entry_size {
            return Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Bios)),
                reason: format!("entries past the header do not fit ({})", count),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            // Cannot fail after the count check.
            let entry = BiosDirectoryEntry::read_from_prefix(rest)
                .ok_or_else(|| Error::format("directory entry truncated"))?;
            entries.push(entry);
            rest = &rest[entry_size..];
        }

        Ok(Self { header, entries })
    }

    pub fn level(&self) -> DirectoryLevel {
        if &self.header.cookie == BIOS_LEVEL2_COOKIE {
            DirectoryLevel::Level2
        } else {
            DirectoryLevel::Level1
        }
    }

    /// Serialised size in bytes.
    pub fn byte_size(&self) -> u64 {
        (DIRECTORY_HEADER_SIZE + self.entries.len() * mem::size_of::<BiosDirectoryEntry>()) as u64
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size() as usize);
        out.extend_from_slice(self.header.as_bytes());
        for entry in &self.entries {
            out.extend_from_slice(entry.as_bytes());
        }
        out
    }

    /// Recomputes the Fletcher-32 over the serialised directory and compares
    /// it with the header field.
    pub fn verify_checksum(&self) -> bool {
        directory_checksum(&self.serialize()) == self.header.checksum
    }

    /// Entries of the given type, sorted ascending by instance.
    pub fn entries_of_type(&self, kind: u8) -> Vec<&BiosDirectoryEntry> {
        let mut matching: Vec<&BiosDirectoryEntry> =
            self.entries.iter().filter(|e| e.kind == kind).collect();
        matching.sort_by_key(|e| e.instance());
        matching
    }
}
