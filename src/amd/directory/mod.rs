// SPDX-License-Identifier: MIT

use crate::error::{DirectoryKind, Error, FirmwareItem, Result};
use crate::fletcher::fletcher32;
use core::fmt::{self, Display};
use core::mem;
use core::str;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes};

pub use self::bios::*;
pub use self::psp::*;

mod bios;
mod psp;

/// The on-disk cookie is the raw 4-byte sequence; it is always compared as
/// bytes, never as an endianness-interpreted integer.
pub const PSP_COOKIE: &[u8; 4] = b"$PSP";
pub const PSP_LEVEL2_COOKIE: &[u8; 4] = b"$PL2";
pub const BIOS_COOKIE: &[u8; 4] = b"$BHD";
pub const BIOS_LEVEL2_COOKIE: &[u8; 4] = b"$BL2";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DirectoryLevel {
    Level1,
    Level2,
}

impl DirectoryLevel {
    pub fn number(&self) -> u8 {
        match self {
            DirectoryLevel::Level1 => 1,
            DirectoryLevel::Level2 => 2,
        }
    }
}

impl Display for DirectoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}", self.number())
    }
}

/// Common header of PSP and BIOS directories.
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct DirectoryHeader {
    /// "$PSP", "$PL2", "$BHD" or "$BL2"
    pub cookie: [u8; 4],
    /// Fletcher-32 of all directory data after this field
    pub checksum: u32,
    /// number of entries
    pub total_entries: u32,
    pub additional_info: u32,
}

pub const DIRECTORY_HEADER_SIZE: usize = mem::size_of::<DirectoryHeader>();

/// The checksum input begins at offset 8 of the serialised directory: the
/// header fields after cookie and checksum, through the last entry.
pub fn directory_checksum(serialized: &[u8]) -> u32 {
    fletcher32(&serialized[8..])
}

impl Display for DirectoryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookie = str::from_utf8(&self.cookie).unwrap_or("????");
        write!(
            f,
            "{} directory with {} entries, checksum {:08x}",
            cookie, self.total_entries, self.checksum
        )
    }
}

/// A parsed directory table of either flavor, dispatched on the cookie.
#[derive(Clone, Debug, Serialize)]
pub enum DirectoryTable {
    Psp(PspDirectory),
    Bios(BiosDirectory),
}

impl DirectoryTable {
    /// Parses the table starting at `data[0]` and returns it together with
    /// the number of bytes it occupies.
    pub fn parse(data: &[u8]) -> Result<(Self, u64)> {
        if data.len() < 4 {
            return Err(Error::format("not enough data for a directory cookie"));
        }
        match &data[..4] {
            c if c == PSP_COOKIE || c == PSP_LEVEL2_COOKIE => {
                let dir = PspDirectory::parse(data)?;
                let size = dir.byte_size();
                Ok((DirectoryTable::Psp(dir), size))
            }
            c if c == BIOS_COOKIE || c == BIOS_LEVEL2_COOKIE => {
                let dir = BiosDirectory::parse(data)?;
                let size = dir.byte_size();
                Ok((DirectoryTable::Bios(dir), size))
            }
            unknown => Err(Error::format(format!(
                "unknown directory cookie {:02x?}",
                unknown
            ))),
        }
    }

    pub fn header(&self) -> &DirectoryHeader {
        match self {
            DirectoryTable::Psp(d) => &d.header,
            DirectoryTable::Bios(d) => &d.header,
        }
    }

    pub fn kind(&self) -> DirectoryKind {
        match self {
            DirectoryTable::Psp(d) => match d.level() {
                DirectoryLevel::Level1 => DirectoryKind::Psp,
                DirectoryLevel::Level2 => DirectoryKind::PspLevel2,
            },
            DirectoryTable::Bios(d) => match d.level() {
                DirectoryLevel::Level1 => DirectoryKind::Bios,
                DirectoryLevel::Level2 => DirectoryKind::BiosLevel2,
            },
        }
    }

    pub fn into_psp(self) -> Result<PspDirectory> {
        match self {
            DirectoryTable::Psp(d) => Ok(d),
            DirectoryTable::Bios(_) => Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Psp)),
                reason: "expected a PSP directory, found a BIOS directory".into(),
            }),
        }
    }

    pub fn into_bios(self) -> Result<BiosDirectory> {
        match self {
            DirectoryTable::Bios(d) => Ok(d),
            DirectoryTable::Psp(_) => Err(Error::InvalidFormat {
                item: Some(FirmwareItem::Directory(DirectoryKind::Bios)),
                reason: "expected a BIOS directory, found a PSP directory".into(),
            }),
        }
    }
}

impl Display for DirectoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header())
    }
}

/// Entry addresses carry a 2-bit addressing mode in their top bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrMode {
    PhysAddr,
    FlashOffset,
    DirHeaderOffset,
    PartitionOffset,
}

pub(crate) fn addr_mode_of(value: u64) -> AddrMode {
    match value >> 62 {
        0 => AddrMode::PhysAddr,
        1 => AddrMode::FlashOffset,
        2 => AddrMode::DirHeaderOffset,
        3 => AddrMode::PartitionOffset,
        _ => unreachable!(),
    }
}

pub(crate) const ENTRY_ADDR_MASK: u64 = 0x3fff_ffff_ffff_ffff;
