// SPDX-License-Identifier: MIT

//! The Boot Policy Manifest: a sequence of elements in documented order,
//! closed by the key/signature element whose offset the header declares.
//!
//! Element order: `__ACBP__` (header), one or more `__IBBS__` (IBB
//! segments), then optional `__TXTS__`, `__PFRS__`, `__PCDS__`, `__PMDA__`,
//! and finally `__PMSG__`.

use crate::error::{Error, Result};
use crate::intel::element::{
    Cursor, HashDigest, HashList, StructInfo, BPMH_ID, PCDE_ID, PME_ID, PMSE_ID, RESERVED_ID,
    SE_ID, STRUCT_INFO_SIZE, TXTE_ID,
};
use crate::intel::keysig::KeySignature;
use crate::intel::ManifestParseOptions;
use crate::range::check_boundaries;
use core::fmt::{self, Display};
use serde::Serialize;

fn push_struct_info(out: &mut Vec<u8>, id: &[u8; 8], version: u8, variable0: u8, size: usize) {
    out.extend_from_slice(id);
    out.push(version);
    out.push(variable0);
    out.extend_from_slice(&(size as u16).to_le_bytes());
}

/// `__ACBP__`: manifest header.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Bpmh {
    pub version: u8,
    /// Byte offset of the signature sub-element inside `__PMSG__`, from the
    /// start of the manifest. Derived; recomputed by rehash.
    pub key_signature_offset: u16,
    pub bpm_revision: u8,
    /// Anti-rollback counter of the manifest itself.
    pub bpm_svn: u8,
    /// Lowest ACM security version this manifest authorises.
    pub acm_svn_auth: u8,
    pub reserved: u8,
    /// NEM data stack size, in 4 KiB units.
    pub nem_data_stack: u16,
}

impl Bpmh {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let key_signature_offset = cursor.read_u16()?;
        let bpm_revision = cursor.read_u8()?;
        let bpm_svn = cursor.read_u8()?;
        let acm_svn_auth = cursor.read_u8()?;
        let reserved = cursor.read_u8()?;
        let nem_data_stack = cursor.read_u16()?;
        Ok(Self {
            version: info.version,
            key_signature_offset,
            bpm_revision,
            bpm_svn,
            acm_svn_auth,
            reserved,
            nem_data_stack,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, BPMH_ID, self.version, 0, self.total_size());
        out.extend_from_slice(&self.key_signature_offset.to_le_bytes());
        out.push(self.bpm_revision);
        out.push(self.bpm_svn);
        out.push(self.acm_svn_auth);
        out.push(self.reserved);
        out.extend_from_slice(&self.nem_data_stack.to_le_bytes());
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + 8
    }
}

bitflags::bitflags! {
    /// `__IBBS__` flags.
    pub struct SeFlags: u32 {
        const ENABLE_VTD_DMA_PROTECTION = 1 << 0;
        const ISSUE_LOCALITY3_STARTUP = 1 << 1;
        const EXTEND_AUTHORITY_MEASUREMENTS = 1 << 2;
        const TPM_FAILURE_LEAVES_HIERARCHY_ENABLED = 1 << 3;
        const TOP_SWAP_REMEDIATION = 1 << 4;
    }
}

impl Serialize for SeFlags {
    fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

/// One IBB segment descriptor. Segments with bit 0 of `flags` set are
/// informational and excluded from the hashed span.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct IbbSegment {
    pub flags: u16,
    pub base: u32,
    pub size: u32,
}

pub const IBB_SEGMENT_SIZE: usize = 10;

impl IbbSegment {
    pub fn is_measured(&self) -> bool {
        self.flags & 1 == 0
    }

    fn parse(cursor: &mut Cursor<'_>) -> Result<Self> {
        let flags = cursor.read_u16()?;
        let base = cursor.read_u32()?;
        let size = cursor.read_u32()?;
        Ok(Self { flags, base, size })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// `__IBBS__`: IBB segments element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Se {
    pub version: u8,
    /// Set number, from the header's variable byte.
    pub set_number: u8,
    /// PBET timer value.
    pub pbet_value: u8,
    pub flags: SeFlags,
    pub ibb_mchbar: u64,
    pub vtd_bar: u64,
    pub dma_prot_base0: u32,
    pub dma_prot_limit0: u32,
    pub dma_prot_base1: u64,
    pub dma_prot_limit1: u64,
    pub post_ibb_hash: HashList,
    pub ibb_entry_point: u32,
    /// IBB digests; the first one selects the measurement algorithm.
    pub digest_list: HashList,
    pub obb_hash: HashDigest,
    pub segments: Vec<IbbSegment>,
}

impl Se {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let pbet_value = cursor.read_u8()?;
        let flags = SeFlags::from_bits_truncate(cursor.read_u32()?);
        let ibb_mchbar = cursor.read_u64()?;
        let vtd_bar = cursor.read_u64()?;
        let dma_prot_base0 = cursor.read_u32()?;
        let dma_prot_limit0 = cursor.read_u32()?;
        let dma_prot_base1 = cursor.read_u64()?;
        let dma_prot_limit1 = cursor.read_u64()?;
        let post_ibb_hash = HashList::parse(cursor)?;
        let ibb_entry_point = cursor.read_u32()?;
        let digest_list = HashList::parse(cursor)?;
        let obb_hash = HashDigest::parse(cursor)?;
        let segment_count = cursor.read_u8()? as usize;
        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            segments.push(IbbSegment::parse(cursor)?);
        }
        Ok(Self {
            version: info.version,
            set_number: info.variable0,
            pbet_value,
            flags,
            ibb_mchbar,
            vtd_bar,
            dma_prot_base0,
            dma_prot_limit0,
            dma_prot_base1,
            dma_prot_limit1,
            post_ibb_hash,
            ibb_entry_point,
            digest_list,
            obb_hash,
            segments,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, SE_ID, self.version, self.set_number, self.total_size());
        out.push(self.pbet_value);
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.ibb_mchbar.to_le_bytes());
        out.extend_from_slice(&self.vtd_bar.to_le_bytes());
        out.extend_from_slice(&self.dma_prot_base0.to_le_bytes());
        out.extend_from_slice(&self.dma_prot_limit0.to_le_bytes());
        out.extend_from_slice(&self.dma_prot_base1.to_le_bytes());
        out.extend_from_slice(&self.dma_prot_limit1.to_le_bytes());
        self.post_ibb_hash.serialize(out);
        out.extend_from_slice(&self.ibb_entry_point.to_le_bytes());
        self.digest_list.serialize(out);
        self.obb_hash.serialize(out);
        out.push(self.segments.len() as u8);
        for segment in &self.segments {
            segment.serialize(out);
        }
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE
            + 1
            + 4
            + 8
            + 8
            + 4
            + 4
            + 8
            + 8
            + self.post_ibb_hash.total_size()
            + 4
            + self.digest_list.total_size()
            + self.obb_hash.total_size()
            + 1
            + self.segments.len() * IBB_SEGMENT_SIZE
    }
}

/// `__TXTS__`: TXT settings element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Txte {
    pub version: u8,
    pub sinit_min_svn: u8,
    pub reserved: u8,
    pub control_flags: u32,
    pub power_down_interval: u16,
    pub ptt_cmos_offset0: u8,
    pub ptt_cmos_offset1: u8,
    pub acpi_base_offset: u16,
    pub reserved2: u16,
    pub pwrm_base_offset: u32,
    pub digest_list: HashList,
}

impl Txte {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let sinit_min_svn = cursor.read_u8()?;
        let reserved = cursor.read_u8()?;
        let control_flags = cursor.read_u32()?;
        let power_down_interval = cursor.read_u16()?;
        let ptt_cmos_offset0 = cursor.read_u8()?;
        let ptt_cmos_offset1 = cursor.read_u8()?;
        let acpi_base_offset = cursor.read_u16()?;
        let reserved2 = cursor.read_u16()?;
        let pwrm_base_offset = cursor.read_u32()?;
        let digest_list = HashList::parse(cursor)?;
        Ok(Self {
            version: info.version,
            sinit_min_svn,
            reserved,
            control_flags,
            power_down_interval,
            ptt_cmos_offset0,
            ptt_cmos_offset1,
            acpi_base_offset,
            reserved2,
            pwrm_base_offset,
            digest_list,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, TXTE_ID, self.version, 0, self.total_size());
        out.push(self.sinit_min_svn);
        out.push(self.reserved);
        out.extend_from_slice(&self.control_flags.to_le_bytes());
        out.extend_from_slice(&self.power_down_interval.to_le_bytes());
        out.push(self.ptt_cmos_offset0);
        out.push(self.ptt_cmos_offset1);
        out.extend_from_slice(&self.acpi_base_offset.to_le_bytes());
        out.extend_from_slice(&self.reserved2.to_le_bytes());
        out.extend_from_slice(&self.pwrm_base_offset.to_le_bytes());
        self.digest_list.serialize(out);
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + 14 + self.digest_list.total_size()
    }
}

/// `__PFRS__`: reserved element, raw payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ReservedElement {
    pub version: u8,
    pub data: Vec<u8>,
}

impl ReservedElement {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let payload = (info.element_size as usize)
            .checked_sub(STRUCT_INFO_SIZE)
            .ok_or_else(|| Error::format("element smaller than its header"))?;
        Ok(Self { version: info.version, data: cursor.take(payload)?.to_vec() })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, RESERVED_ID, self.version, 0, self.total_size());
        out.extend_from_slice(&self.data);
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + self.data.len()
    }
}

/// `__PCDS__`: platform configuration data element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Pcde {
    pub version: u8,
    pub reserved: u16,
    pub data: Vec<u8>,
}

impl Pcde {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let reserved = cursor.read_u16()?;
        let payload = (info.element_size as usize)
            .checked_sub(STRUCT_INFO_SIZE + 2)
            .ok_or_else(|| Error::format("element smaller than its header"))?;
        Ok(Self {
            version: info.version,
            reserved,
            data: cursor.take(payload)?.to_vec(),
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, PCDE_ID, self.version, 0, self.total_size());
        out.extend_from_slice(&self.reserved.to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + 2 + self.data.len()
    }
}

/// `__PMDA__`: platform manufacturer data element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Pme {
    pub version: u8,
    pub reserved: u16,
    pub data: Vec<u8>,
}

impl Pme {
    fn parse(_info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let reserved = cursor.read_u16()?;
        let data_size = cursor.read_u16()? as usize;
        Ok(Self {
            version: _info.version,
            reserved,
            data: cursor.take(data_size)?.to_vec(),
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, PME_ID, self.version, 0, self.total_size());
        out.extend_from_slice(&self.reserved.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + 4 + self.data.len()
    }
}

/// `__PMSG__`: the closing key/signature element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Pmse {
    pub version: u8,
    pub key_signature: KeySignature,
}

impl Pmse {
    fn parse(info: &StructInfo, cursor: &mut Cursor<'_>) -> Result<Self> {
        let key_signature = KeySignature::parse(cursor)?;
        Ok(Self { version: info.version, key_signature })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        push_struct_info(out, PMSE_ID, self.version, 0, self.total_size());
        self.key_signature.serialize(out);
    }

    pub fn total_size(&self) -> usize {
        STRUCT_INFO_SIZE + self.key_signature.total_size()
    }
}

/// The parsed Boot Policy Manifest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BootPolicyManifest {
    pub bpmh: Bpmh,
    pub se: Vec<Se>,
    pub txte: Option<Txte>,
    pub reserved: Option<ReservedElement>,
    pub pcde: Option<Pcde>,
    pub pme: Option<Pme>,
    pub pmse: Pmse,
}

/// Slot index per structure ID; the documented order is ascending.
fn element_slot(id: &[u8; 8]) -> Option<usize> {
    match id {
        id if id == BPMH_ID => Some(0),
        id if id == SE_ID => Some(1),
        id if id == TXTE_ID => Some(2),
        id if id == RESERVED_ID => Some(3),
        id if id == PCDE_ID => Some(4),
        id if id == PME_ID => Some(5),
        id if id == PMSE_ID => Some(6),
        _ => None,
    }
}

impl BootPolicyManifest {
    pub fn parse(data: &[u8], options: &ManifestParseOptions) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut bpmh: Option<Bpmh> = None;
        let mut se: Vec<Se> = Vec::new();
        let mut txte: Option<Txte> = None;
        let mut reserved: Option<ReservedElement> = None;
        let mut pcde: Option<Pcde> = None;
        let mut pme: Option<Pme> = None;
        let mut pmse: Option<Pmse> = None;
        let mut last_slot = 0usize;

        loop {
            let element_start = cursor.position();
            let info = cursor.read_struct_info()?;
            let slot = element_slot(&info.id).ok_or_else(|| {
                Error::format(format!("unknown structure id {:02x?}", info.id))
            })?;
            if bpmh.is_none() && slot != 0 {
                return Err(Error::format(format!(
                    "manifest must begin with __ACBP__, found {}",
                    info.id_str()
                )));
            }
            if options.strict_order_check && slot < last_slot {
                return Err(Error::format(format!(
                    "element {} out of documented order",
                    info.id_str()
                )));
            }
            last_slot = slot;

            fn fill<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<()> {
                if slot.is_some() {
                    return Err(Error::format(format!("duplicate element {}", name)));
                }
                *slot = Some(value);
                Ok(())
            }

            match slot {
                0 => fill(&mut bpmh, Bpmh::parse(&info, &mut cursor)?, "__ACBP__")?,
                1 => se.push(Se::parse(&info, &mut cursor)?),
                2 => fill(&mut txte, Txte::parse(&info, &mut cursor)?, "__TXTS__")?,
                3 => fill(
                    &mut reserved,
                    ReservedElement::parse(&info, &mut cursor)?,
                    "__PFRS__",
                )?,
                4 => fill(&mut pcde, Pcde::parse(&info, &mut cursor)?, "__PCDS__")?,
                5 => fill(&mut pme, Pme::parse(&info, &mut cursor)?, "__PMDA__")?,
                6 => fill(&mut pmse, Pmse::parse(&info, &mut cursor)?, "__PMSG__")?,
                _ => unreachable!(),
            }

            let consumed = cursor.position() - element_start;
            if consumed != info.element_size as usize {
                return Err(Error::format(format!(
                    "element {} declares {} B but occupies {} B",
                    info.id_str(),
                    { info.element_size },
                    consumed
                )));
            }
            if slot == 6 {
                break;
            }
        }

        let bpmh = bpmh.ok_or_else(|| Error::format("manifest without __ACBP__"))?;
        if se.is_empty() {
            return Err(Error::format("manifest without an __IBBS__ element"));
        }
        let pmse = pmse.ok_or_else(|| Error::format("manifest without __PMSG__"))?;
        Ok(Self { bpmh, se, txte, reserved, pcde, pme, pmse })
    }

    /// Serialises the manifest exactly as its fields stand. Call
    /// [`Self::rehash`] first when fields were edited.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.bpmh.serialize(&mut out);
        for se in &self.se {
            se.serialize(&mut out);
        }
        if let Some(txte) = &self.txte {
            txte.serialize(&mut out);
        }
        if let Some(reserved) = &self.reserved {
            reserved.serialize(&mut out);
        }
        if let Some(pcde) = &self.pcde {
            pcde.serialize(&mut out);
        }
        if let Some(pme) = &self.pme {
            pme.serialize(&mut out);
        }
        self.pmse.serialize(&mut out);
        out
    }

    /// Bytes of every element before `__PMSG__`.
    fn size_before_pmse(&self) -> usize {
        self.bpmh.total_size()
            + self.se.iter().map(Se::total_size).sum::<usize>()
            + self.txte.as_ref().map_or(0, Txte::total_size)
            + self.reserved.as_ref().map_or(0, ReservedElement::total_size)
            + self.pcde.as_ref().map_or(0, Pcde::total_size)
            + self.pme.as_ref().map_or(0, Pme::total_size)
    }

    /// Recomputes derived fields: the signature offset declared by the
    /// header. Element and hash-list sizes are recomputed on serialisation.
    pub fn rehash(&mut self) {
        let offset = self.size_before_pmse()
            + STRUCT_INFO_SIZE
            + self.pmse.key_signature.signature_offset();
        self.bpmh.key_signature_offset = offset as u16;
    }

    /// The signed span: everything up to the signature sub-element.
    pub fn signed_data(&self) -> Result<Vec<u8>> {
        let data = self.serialize();
        let end = self.bpmh.key_signature_offset as u64;
        check_boundaries(0, end, &data)?;
        Ok(data[..end as usize].to_vec())
    }

    /// Verifies the manifest signature with the embedded public key.
    pub fn verify_signature(&self) -> Result<()> {
        let signed = self.signed_data()?;
        self.pmse.key_signature.verify(&signed)
    }

    /// Hashes the measured IBB segments out of `firmware` and compares the
    /// result with the first IBB digest. The firmware is assumed mapped so
    /// its last byte sits at `2^32 - 1`.
    pub fn validate_ibb(&self, firmware: &[u8]) -> Result<bool> {
        let se = self
            .se
            .first()
            .ok_or_else(|| Error::format("manifest without an __IBBS__ element"))?;
        let reference = se
            .digest_list
            .digests
            .first()
            .ok_or_else(|| Error::format("IBB digest list is empty"))?;

        let base_phys = (1u64 << 32) - firmware.len() as u64;
        let mut hasher = reference.hash_alg.new_hasher();
        for segment in &se.segments {
            if !segment.is_measured() {
                continue;
            }
            let offset = (segment.base as u64).checked_sub(base_phys).ok_or(
                Error::BoundaryViolation {
                    start: segment.base as u64,
                    end: segment.base as u64 + segment.size as u64,
                    len: firmware.len() as u64,
                },
            )?;
            check_boundaries(offset, offset + segment.size as u64, firmware)?;
            hasher.update(&firmware[offset as usize..(offset + segment.size as u64) as usize]);
        }
        Ok(hasher.finalize_reset().as_ref() == reference.digest.as_slice())
    }
}

impl Display for BootPolicyManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "boot policy manifest rev {} svn {} acm-svn {} nem-stack {} x 4K",
            self.bpmh.bpm_revision,
            self.bpmh.bpm_svn,
            self.bpmh.acm_svn_auth,
            self.bpmh.nem_data_stack
        )?;
        for se in &self.se {
            writeln!(
                f,
                "  IBB set {}: entry {:08x}, {} segments, {} digests",
                se.set_number,
                se.ibb_entry_point,
                se.segments.len(),
                se.digest_list.digests.len()
            )?;
        }
        write!(
            f,
            "  signed with {} over {} B",
            self.pmse.key_signature.signature.scheme,
            self.bpmh.key_signature_offset
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::intel::keysig::{
        HashAlg, Key, KeyAlg, SigScheme, Signature, KEY_VERSION, SIGNATURE_VERSION,
    };

    pub(crate) fn bare_key_signature() -> KeySignature {
        KeySignature {
            key: Key {
                version: KEY_VERSION,
                alg: KeyAlg::Rsa,
                key_bits: 2048,
                data: vec![0u8; 4 + 256],
            },
            signature: Signature {
                version: SIGNATURE_VERSION,
                scheme: SigScheme::RsaPss,
                key_bits: 2048,
                hash_alg: HashAlg::Sha256,
                data: vec![0u8; 256],
            },
        }
    }

    pub(crate) fn sample_manifest() -> BootPolicyManifest {
        let mut manifest = BootPolicyManifest {
            bpmh: Bpmh {
                version: 0x21,
                key_signature_offset: 0,
                bpm_revision: 1,
                bpm_svn: 2,
                acm_svn_auth: 3,
                reserved: 0,
                nem_data_stack: 0x10,
            },
            se: vec![Se {
                version: 0x21,
                set_number: 0,
                pbet_value: 0x0f,
                flags: SeFlags::ENABLE_VTD_DMA_PROTECTION
                    | SeFlags::EXTEND_AUTHORITY_MEASUREMENTS,
                ibb_mchbar: 0xfed1_0000,
                vtd_bar: 0xfed9_0000,
                dma_prot_base0: 0x10_0000,
                dma_prot_limit0: 0x20_0000,
                dma_prot_base1: 0,
                dma_prot_limit1: 0,
                post_ibb_hash: HashList::default(),
                ibb_entry_point: 0xffff_fff0,
                digest_list: HashList {
                    digests: vec![HashDigest::new(HashAlg::Sha256, vec![0u8; 32])],
                },
                obb_hash: HashDigest::new(HashAlg::Sha256, vec![0u8; 32]),
                segments: vec![
                    IbbSegment { flags: 0, base: 0xffff_0000, size: 0x8000 },
                    IbbSegment { flags: 1, base: 0xfffe_0000, size: 0x1000 },
                ],
            }],
            txte: None,
            reserved: None,
            pcde: Some(Pcde { version: 0x20, reserved: 0, data: vec![1, 2, 3, 4] }),
            pme: Some(Pme { version: 0x20, reserved: 0, data: b"OEM data".to_vec() }),
            pmse: Pmse { version: 0x20, key_signature: bare_key_signature() },
        };
        manifest.rehash();
        manifest
    }

    #[test]
    fn roundtrip_after_rehash() {
        let manifest = sample_manifest();
        let raw = manifest.serialize();
        let parsed =
            BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn key_signature_offset_points_at_the_signature() {
        let manifest = sample_manifest();
        let raw = manifest.serialize();
        let offset = manifest.bpmh.key_signature_offset as usize;
        // The signature sub-element starts with its version byte followed
        // by the scheme identifier.
        assert_eq!(raw[offset], SIGNATURE_VERSION);
        let scheme = u16::from_le_bytes([raw[offset + 1], raw[offset + 2]]);
        assert_eq!(scheme, SigScheme::RsaPss as u16);
    }

    #[test]
    fn element_sizes_match_serialized_lengths() {
        let manifest = sample_manifest();
        let raw = manifest.serialize();
        assert_eq!(
            raw.len(),
            manifest.size_before_pmse() + manifest.pmse.total_size()
        );
        // Walk the headers and check each declared size.
        let mut pos = 0usize;
        while pos < raw.len() {
            let size =
                u16::from_le_bytes([raw[pos + 10], raw[pos + 11]]) as usize;
            assert!(size >= STRUCT_INFO_SIZE);
            pos += size;
        }
        assert_eq!(pos, raw.len());
    }

    #[test]
    fn unknown_structure_id_is_flagged() {
        let manifest = sample_manifest();
        let mut raw = manifest.serialize();
        raw[0..8].copy_from_slice(b"__XXXX__");
        assert!(matches!(
            BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()),
            Err(Error::InvalidFormat { .. })
        ));
    }

    #[test]
    fn strict_order_check_rejects_reordered_elements() {
        let mut manifest = sample_manifest();
        manifest.txte = Some(Txte {
            version: 0x21,
            sinit_min_svn: 0,
            reserved: 0,
            control_flags: 0,
            power_down_interval: 0,
            ptt_cmos_offset0: 0x7e,
            ptt_cmos_offset1: 0x7f,
            acpi_base_offset: 0x400,
            reserved2: 0,
            pwrm_base_offset: 0xfe00_0000,
            digest_list: HashList::default(),
        });
        manifest.rehash();
        let raw = manifest.serialize();

        // Swap the TXTE and PCDE elements.
        let txte_start = manifest.bpmh.total_size() + manifest.se[0].total_size();
        let txte_size = manifest.txte.as_ref().unwrap().total_size();
        let pcde_size = manifest.pcde.as_ref().unwrap().total_size();
        let mut swapped = raw[..txte_start].to_vec();
        swapped.extend_from_slice(&raw[txte_start + txte_size..txte_start + txte_size + pcde_size]);
        swapped.extend_from_slice(&raw[txte_start..txte_start + txte_size]);
        swapped.extend_from_slice(&raw[txte_start + txte_size + pcde_size..]);
        assert_eq!(swapped.len(), raw.len());

        assert!(BootPolicyManifest::parse(&swapped, &ManifestParseOptions::default()).is_err());
        let relaxed = ManifestParseOptions { strict_order_check: false };
        let parsed = BootPolicyManifest::parse(&swapped, &relaxed).unwrap();
        assert_eq!(parsed.pcde, manifest.pcde);
        assert_eq!(parsed.txte, manifest.txte);
    }

    #[test]
    fn optional_element_absence_is_recognised() {
        let mut manifest = sample_manifest();
        manifest.pcde = None;
        manifest.pme = None;
        manifest.rehash();
        let raw = manifest.serialize();
        let parsed =
            BootPolicyManifest::parse(&raw, &ManifestParseOptions::default()).unwrap();
        assert_eq!(parsed, manifest);
        assert!(parsed.pcde.is_none());
    }

    #[test]
    fn validate_ibb_measures_only_flagged_segments() {
        let mut firmware = vec![0u8; 0x2_0000];
        for (i, b) in firmware.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let base_phys = (1u64 << 32) - firmware.len() as u64;

        let mut manifest = sample_manifest();
        let se = &mut manifest.se[0];
        se.segments = vec![
            IbbSegment { flags: 0, base: base_phys as u32, size: 0x1000 },
            // informational, must not contribute
            IbbSegment { flags: 1, base: base_phys as u32 + 0x1000, size: 0x1000 },
            IbbSegment { flags: 0, base: base_phys as u32 + 0x8000, size: 0x800 },
        ];
        let expected = {
            let mut hasher = HashAlg::Sha256.new_hasher();
            hasher.update(&firmware[0..0x1000]);
            hasher.update(&firmware[0x8000..0x8800]);
            hasher.finalize_reset().to_vec()
        };
        se.digest_list.digests[0] = HashDigest::new(HashAlg::Sha256, expected);
        manifest.rehash();

        assert!(manifest.validate_ibb(&firmware).unwrap());

        // A flipped byte in a measured segment is caught...
        let mut tampered = firmware.clone();
        tampered[0x10] ^= 0xff;
        assert!(!manifest.validate_ibb(&tampered).unwrap());
        // ...a flipped byte in an informational segment is not.
        let mut informational = firmware;
        informational[0x1800] ^= 0xff;
        assert!(manifest.validate_ibb(&informational).unwrap());
    }

    #[test]
    fn segment_out_of_firmware_is_a_boundary_violation() {
        let firmware = vec![0u8; 0x1000];
        let mut manifest = sample_manifest();
        manifest.se[0].segments = vec![IbbSegment { flags: 0, base: 0x1000, size: 0x100 }];
        assert!(matches!(
            manifest.validate_ibb(&firmware),
            Err(Error::BoundaryViolation { .. })
        ));
    }
}
