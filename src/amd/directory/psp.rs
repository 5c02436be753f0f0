// SPDX-License-Identifier: MIT

use super::{
    addr_mode_of, directory_checksum, AddrMode, DirectoryHeader, DirectoryLevel,
    DIRECTORY_HEADER_SIZE, ENTRY_ADDR_MASK, PSP_COOKIE, PSP_LEVEL2_COOKIE,
};
use crate::error::{DirectoryKind, Error, FirmwareItem, Result};
use core::convert::TryFrom;
use core::fmt::{self, Display};
use core::mem;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes};

/// One 16-byte PSP directory entry.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct PspDirectoryEntry {
    /// 0x00: type of entry
    pub kind: u8,
    /// 0x01: used to filter entries by model
    pub sub_program: u8,
    /// 0x02: flags; bits 14-15 select which ROM contains the entry
    pub flags: u16,
    /// 0x04: size of the entry
    pub size: u32,
    /// 0x08: address mode and location, or an immediate value
    pub location_or_value: u64,
}

/// Entries of this size carry their value inline in `location_or_value`.
pub const PSP_ENTRY_VALUE_SIZE: u32 = 0xffff_ffff;

impl PspDirectoryEntry {
    pub fn rom_id(&self) -> u8 {
        ((self.flags >> 14) & 0x3) as u8
    }

    pub fn addr_mode(&self) -> AddrMode {
        addr_mode_of(self.location_or_value)
    }

    /// The location with the addressing-mode bits stripped.
    pub fn location(&self) -> u64 {
        self.location_or_value & ENTRY_ADDR_MASK
    }

    /// True for entries such as the soft fuse chain whose payload is the
    /// `location_or_value` field itself.
    pub fn has_inline_value(&self) -> bool {
        self.size == PSP_ENTRY_VALUE_SIZE
    }

    pub fn entry_type(&self) -> core::result::Result<PspEntryType, u8> {
        PspEntryType::try_from(self.kind)
    }

    pub fn description(&self) -> &'static str {
        psp_entry_description(self.kind)
    }
}

impl Display for PspDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind;
        let sub = self.sub_program;
        let desc = self.description();
        let v = if self.has_inline_value() {
            format!("{:016x} (value)", { self.location_or_value })
        } else {
            format!("{:08x} @ {:08x}", { self.size }, self.location())
        };
        write!(f, "{:02x}.{:02x} rom{} {:44} {:20}", kind, sub, self.rom_id(), desc, v)
    }
}

/// Entry types the trust walker cares about. The raw `kind` byte is kept on
/// the entry; this enum names the types with chain-level meaning.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(u8)]
pub enum PspEntryType {
    AmdPublicKey = 0x00,
    PspBootLoader = 0x01,
    PspSecureOs = 0x02,
    PspRecoveryBootLoader = 0x03,
    PspNonVolatileData = 0x04,
    SmuOffChipFirmware = 0x08,
    AmdSecureDebugKey = 0x09,
    AblPublicKey = 0x0a,
    SoftFuseChain = 0x0b,
    PspTrustlet = 0x0c,
    PspTrustletPublicKey = 0x0d,
    SmuOffChipFirmware2 = 0x12,
    WrappedIkek = 0x21,
    PspTokenUnlock = 0x22,
    SecurityPolicy = 0x24,
    Abl0 = 0x30,
    PspLevel2Directory = 0x40,
    DxioPhySramFirmwarePublicKey = 0x43,
    UsbPhyFirmware = 0x44,
    KeyDatabase = 0x50,
    PspTrustedOsPublicKeysTable = 0x51,
}

impl TryFrom<u8> for PspEntryType {
    type Error = u8;

    fn try_from(v: u8) -> core::result::Result<PspEntryType, u8> {
        match v {
            0x00 => Ok(PspEntryType::AmdPublicKey),
            0x01 => Ok(PspEntryType::PspBootLoader),
            0x02 => Ok(PspEntryType::PspSecureOs),
            0x03 => Ok(PspEntryType::PspRecoveryBootLoader),
            0x04 => Ok(PspEntryType::PspNonVolatileData),
            0x08 => Ok(PspEntryType::SmuOffChipFirmware),
            0x09 => Ok(PspEntryType::AmdSecureDebugKey),
            0x0a => Ok(PspEntryType::AblPublicKey),
            0x0b => Ok(PspEntryType::SoftFuseChain),
            0x0c => Ok(PspEntryType::PspTrustlet),
            0x0d => Ok(PspEntryType::PspTrustletPublicKey),
            0x12 => Ok(PspEntryType::SmuOffChipFirmware2),
            0x21 => Ok(PspEntryType::WrappedIkek),
            0x22 => Ok(PspEntryType::PspTokenUnlock),
            0x24 => Ok(PspEntryType::SecurityPolicy),
            0x30 => Ok(PspEntryType::Abl0),
            0x40 => Ok(PspEntryType::PspLevel2Directory),
            0x43 => Ok(PspEntryType::DxioPhySramFirmwarePublicKey),
            0x44 => Ok(PspEntryType::UsbPhyFirmware),
            0x50 => Ok(PspEntryType::KeyDatabase),
            0x51 => Ok(PspEntryType::PspTrustedOsPublicKeysTable),
            other => Err(other),
        }
    }
}

// https://doc.coreboot.org/soc/amd/psp_integration.html#psp-directory-table-entries
pub fn psp_entry_description(kind: u8) -> &'static str {
    match kind {
        0x00 => "AMD Public Key",
        0x01 => "PSP Boot Loader",
        0x02 => "PSP Secure OS",
        0x03 => "PSP Recovery Boot Loader",
        0x04 => "PSP Non-volatile Data",
        0x05 => "PSP RTM Public Key",
        0x08 => "SMU Off-chip Firmware",
        0x09 => "AMD Secure Debug Key",
        0x0A => "ABL Public Key",
        0x0B => "PSP Soft Fuse Chain",
        0x0C => "PSP Trustlet",
        0x0D => "PSP Trustlet Public Key",
        0x12 => "SMU Off-chip Firmware 2",
        0x13 => "PSP Early Secure Unlock Debug",
        0x1B => "Boot Driver",
        0x1C => "SoC Driver",
        0x1D => "Debug Driver",
        0x1F => "Interface Driver",
        0x20 => "IP Discovery",
        0x21 => "Wrapped iKEK",
        0x22 => "PSP Token Unlock",
        0x24 => "Security Policy",
        0x25 => "MP2 Firmware",
        0x26 => "MP2 Firmware Part 2",
        0x27 => "User Mode Unit Test",
        0x28 => "System Driver",
        0x29 => "KVM Image",
        0x2A => "MP5 Firmware",
        0x2B => "Embedded Firmware Signature",
        0x30 => "ABL 0",
        0x31 => "ABL 1",
        0x32 => "ABL 2",
        0x33 => "ABL 3",
        0x34 => "ABL 4",
        0x35 => "ABL 5",
        0x36 => "ABL 6",
        0x37 => "ABL 7",
        0x38 => "SEV Data",
        0x39 => "SEV Code",
        0x3A => "Processor Serial Number Allow List",
        0x3B => "SERDES Microcode",
        0x3C => "VBIOS Pre-load",
        0x40 => "PSP Level 2 Directory",
        0x42 => "DXIO PHY SRAM Firmware",
        0x43 => "DXIO PHY SRAM Firmware Public Key",
        0x44 => "USB PHY Firmware",
        0x45 => "Security Policy for tOS",
        0x46 => "External Chipset PSP Boot Loader",
        0x4E => "PMU Public Key",
        0x4F => "UMC Firmware",
        0x50 => "PSP Boot Loader Public Keys Table",
        0x51 => "PSP Trusted OS Public Keys Table",
        0x52 => "OEM PSP Boot Loader Application",
        0x53 => "OEM PSP Boot Loader Application Public Key",
        0x54 => "PSP RPMC NVRAM",
        0x55 => "PSP Boot Loader Anti-rollback",
        0x56 => "PSP Secure OS Anti-rollback",
        0x58 => "DMCU-ERAM",
        0x59 => "DMCU-ISR",
        _ => "Unknown",
    }
}

/// A PSP directory table, level 1 (`$PSP`) or level 2 (`$PL2`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PspDirectory {
    pub header: DirectoryHeader,
    pub entries: Vec<PspDirectoryEntry>,
}

impl Display for PspDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}

impl PspDirectory {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || (&data[..4] != PSP_COOKIE && &data[..4] != PSP_LEVEL2_COOKIE) {
            return Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Psp)),
                reason: "PSP directory cookie not found".into(),
            });
        }
        let header = DirectoryHeader::read_from_prefix(data).ok_or_else(|| {
            Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Psp)),
                reason: "PSP directory header truncated".into(),
            }
        })?;
        // Entries may sit at any byte offset in the image, so each one is
        // copied out rather than viewed in place. The claimed count is
        // checked against the buffer before anything is allocated.
        let entry_size = mem::size_of::<PspDirectoryEntry>();
        let count = header.total_entries as usize;
        let mut rest = &data[DIRECTORY_HEADER_SIZE..];
        if count > rest.len() / entry_size {
            return Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Psp)),
                reason: format!("entries past the header do not fit ({})", count),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            // Cannot fail after the count check.
            let entry = PspDirectoryEntry::read_from_prefix(rest)
                .ok_or_else(|| Error::format("directory entry truncated"))?;
            entries.push(entry);
            rest = &rest[entry_size..];
        }

        Ok(Self { header, entries })
    }

    pub fn level(&self) -> DirectoryLevel {
        if &self.header.cookie == PSP_LEVEL2_COOKIE {
            DirectoryLevel::Level2
        } else {
            DirectoryLevel::Level1
        }
    }

    /// Serialised size in bytes.
    pub fn byte_size(&self) -> u64 {
        (DIRECTORY_HEADER_SIZE + self.entries.len() * mem::size_of::<PspDirectoryEntry>()) as u64
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

    pub fn entries_of_type(&self, kind: u8) -> impl Iterator<Item = &PspDirectoryEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }
}
