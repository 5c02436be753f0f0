// SPDX-License-Identifier: MIT

//! Error taxonomy. Every error that can point at a firmware item carries an
//! optional [`FirmwareItem`]; operations that discover context retro-fit it
//! onto context-less errors via [`Error::with_item`] before propagating.

use crate::amd::key::KeyId;
use core::fmt::{self, Display};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum DirectoryKind {
    Psp,
    PspLevel2,
    Bios,
    BiosLevel2,
}

impl Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirectoryKind::Psp => "PSP directory",
            DirectoryKind::PspLevel2 => "PSP level 2 directory",
            DirectoryKind::Bios => "BIOS directory",
            DirectoryKind::BiosLevel2 => "BIOS level 2 directory",
        };
        write!(f, "{}", s)
    }
}

/// Identifies the firmware structure an error is about, purely for
/// diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FirmwareItem {
    Efs,
    Directory(DirectoryKind),
    PspEntry { level: u8, kind: u8 },
    BiosEntry { level: u8, kind: u8, instance: Option<u8> },
}

impl Display for FirmwareItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareItem::Efs => write!(f, "embedded firmware structure"),
            FirmwareItem::Directory(kind) => write!(f, "{}", kind),
            FirmwareItem::PspEntry { level, kind } => {
                write!(f, "PSP entry {:#04x} (level {})", kind, level)
            }
            FirmwareItem::BiosEntry { level, kind, instance } => {
                write!(f, "BIOS entry {:#04x} (level {}", kind, level)?;
                if let Some(instance) = instance {
                    write!(f, ", instance {}", instance)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn in_item(item: &Option<FirmwareItem>) -> String {
    match item {
        Some(item) => format!(" in {}", item),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Magic bytes, size fields, or alignment contradict the format.
    #[error("invalid format{}: {reason}", in_item(.item))]
    InvalidFormat {
        item: Option<FirmwareItem>,
        reason: String,
    },

    /// A requested entry type, instance, or level is absent.
    #[error("{0} not found")]
    NotFound(FirmwareItem),

    /// A computed range exceeds the backing buffer.
    #[error("range {start:#x}..{end:#x} exceeds buffer of {len:#x} B")]
    BoundaryViolation { start: u64, end: u64, len: u64 },

    /// A signed element references a KeyID that is not in the key set.
    #[error("unknown signing key {key_id}{}", in_item(.item))]
    UnknownSigningKey {
        key_id: KeyId,
        item: Option<FirmwareItem>,
    },

    /// The cryptographic verification itself failed.
    #[error("signature check against key {signer} failed{}: {cause}", in_item(.item))]
    SignatureCheck {
        signer: String,
        item: Option<FirmwareItem>,
        cause: String,
    },

    /// Algorithm enum value not implemented in this build.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn format(reason: impl Into<String>) -> Self {
        Error::InvalidFormat { item: None, reason: reason.into() }
    }

    /// Attaches `item` to errors that carry context but do not have it yet.
    pub fn with_item(self, item: FirmwareItem) -> Self {
        match self {
            Error::InvalidFormat { item: None, reason } => {
                Error::InvalidFormat { item: Some(item), reason }
            }
            Error::UnknownSigningKey { key_id, item: None } => {
                Error::UnknownSigningKey { key_id, item: Some(item) }
            }
            Error::SignatureCheck { signer, item: None, cause } => {
                Error::SignatureCheck { signer, item: Some(item), cause }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_item_fills_only_missing_context() {
        let item = FirmwareItem::PspEntry { level: 2, kind: 0x12 };
        let e = Error::format("bad cookie").with_item(item);
        match e {
            Error::InvalidFormat { item: Some(i), .. } => assert_eq!(i, item),
            other => panic!("unexpected {:?}", other),
        }

        let already = FirmwareItem::Directory(DirectoryKind::Psp);
        let e = Error::format("bad cookie").with_item(already).with_item(item);
        match e {
            Error::InvalidFormat { item: Some(i), .. } => assert_eq!(i, already),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn display_names_the_item() {
        let e = Error::NotFound(FirmwareItem::BiosEntry {
            level: 1,
            kind: 0x05,
            instance: Some(0),
        });
        let s = e.to_string();
        assert!(s.contains("BIOS entry 0x05"), "{}", s);
        assert!(s.contains("instance 0"), "{}", s);
    }
}
