// SPDX-License-Identifier: MIT

use core::fmt::{self, Display};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Physical addresses probed for the EFS signature, in order.
pub const EFS_CANDIDATE_ADDRESSES: [u64; 6] = [
    0xfffa_0000,
    0xfff2_0000,
    0xffe2_0000,
    0xffc2_0000,
    0xff82_0000,
    0xff02_0000,
];

pub const EFS_SIGNATURE: u32 = 0x55aa_55aa;

/// Embedded Firmware Structure
///
/// The flash anchor carrying the PSP and BIOS directory pointers, special
/// firmware pointers, and SPI flash configuration.
///
/// https://doc.coreboot.org/soc/amd/psp_integration.html
#[derive(AsBytes, Unaligned, FromBytes, Clone, Copy, Debug)]
#[repr(packed)]
pub struct EmbeddedFirmwareStructure {
    /// 0x00: signature, 0x55AA55AA
    pub signature: u32,

    /* Special firmware */
    pub imc_fw: u32,
    pub gbe_fw: u32,
    pub xhci_fw: u32,

    /* PSP */
    /// 0x10: PSP directory for families before 17h
    pub psp_legacy: u32,
    /// 0x14: level-1 PSP directory for family 17h and later
    pub psp_directory: u32,

    /* "BIOS" */
    /// 0x18: BIOS directory for family 17h models 00h-0Fh
    pub bios_17_00_0f: u32,
    /// 0x1c: BIOS directory for family 17h models 10h-1Fh
    pub bios_17_10_1f: u32,
    /// 0x20: BIOS directory for family 17h models 30h-3Fh and family 19h models 00h-0Fh
    pub bios_17_30_3f_19_00_0f: u32,
    /// 0x24: bit 0 is cleared for second generation structures
    pub second_gen: u32,
    /// 0x28: BIOS directory for family 17h model 60h and later
    pub bios_17_60: u32,
    pub _2c: u32,

    /* Promontory */
    /// 0x30: promontory firmware
    pub promontory: u32,
    /// 0x34: low power promontory firmware
    pub lp_promontory: u32,
    pub _38: u32,
    pub _3c: u32,

    /* SPI flash */
    /// 0x40: SPI flash configuration for family 15h models 60h-6Fh
    pub spi_cfg_15_60_6f: SpiCfg,
    pub _42: u8,
    /// 0x43: SPI flash configuration for family 17h models 00h-1Fh
    pub spi_cfg_17_00_1f: SpiCfg2,
    pub _46: u8,
    /// 0x47: SPI flash configuration for family 17h model 30h and later
    pub spi_cfg_17_30: SpiCfg3,
}

// The struct is packed, so serde's derive cannot take references into it;
// every field is copied to a local first.
impl Serialize for EmbeddedFirmwareStructure {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("EmbeddedFirmwareStructure", 13)?;
        let signature = self.signature;
        s.serialize_field("signature", &signature)?;
        let second_gen = self.is_second_gen();
        s.serialize_field("second_gen", &second_gen)?;
        let imc_fw = get_real_addr(self.imc_fw);
        s.serialize_field("imc_fw", &imc_fw)?;
        let gbe_fw = get_real_addr(self.gbe_fw);
        s.serialize_field("gbe_fw", &gbe_fw)?;
        let xhci_fw = get_real_addr(self.xhci_fw);
        s.serialize_field("xhci_fw", &xhci_fw)?;
        let psp_legacy = get_real_addr(self.psp_legacy);
        s.serialize_field("psp_legacy", &psp_legacy)?;
        let psp_directory = get_real_addr(self.psp_directory);
        s.serialize_field("psp_directory", &psp_directory)?;
        let bios = get_real_addr(self.bios_17_00_0f);
        s.serialize_field("bios_17_00_0f", &bios)?;
        let bios = get_real_addr(self.bios_17_10_1f);
        s.serialize_field("bios_17_10_1f", &bios)?;
        let bios = get_real_addr(self.bios_17_30_3f_19_00_0f);
        s.serialize_field("bios_17_30_3f_19_00_0f", &bios)?;
        let bios = get_real_addr(self.bios_17_60);
        s.serialize_field("bios_17_60", &bios)?;
        let promontory = get_real_addr(self.promontory);
        s.serialize_field("promontory", &promontory)?;
        let lp_promontory = get_real_addr(self.lp_promontory);
        s.serialize_field("lp_promontory", &lp_promontory)?;
        s.end()
    }
}

/// 0x00000000 and 0xffffffff both mean "not present".
pub fn get_real_addr(addr: u32) -> Option<u32> {
    if addr == 0x0000_0000 || addr == 0xffff_ffff {
        None
    } else {
        Some(addr)
    }
}

impl EmbeddedFirmwareStructure {
    pub fn is_second_gen(&self) -> bool {
        self.second_gen & 0x1 == 0
    }

    /// The level-1 PSP directory pointer, modern slot preferred.
    pub fn psp_directory_pointer(&self) -> Option<u32> {
        get_real_addr(self.psp_directory).or_else(|| get_real_addr(self.psp_legacy))
    }

    /// The family-specific level-1 BIOS directory pointers, in probe order.
    pub fn bios_directory_pointers(&self) -> [Option<u32>; 4] {
        [
            get_real_addr(self.bios_17_00_0f),
            get_real_addr(self.bios_17_10_1f),
            get_real_addr(self.bios_17_30_3f_19_00_0f),
            get_real_addr(self.bios_17_60),
        ]
    }
}

impl Display for EmbeddedFirmwareStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let efs = self;
        writeln!(f, ": EFS :")?;
        writeln!(f, ":: Second gen? {}", efs.is_second_gen())?;

        writeln!(f, ":: Firmware ::")?;
        let a = get_real_addr(efs.imc_fw);
        writeln!(f, " IMC firmware                                   {:08x?}", a)?;
        let a = get_real_addr(efs.gbe_fw);
        writeln!(f, " Gigabit ethernet firmware                      {:08x?}", a)?;
        let a = get_real_addr(efs.xhci_fw);
        writeln!(f, " XHCI firmware                                  {:08x?}", a)?;
        let a = get_real_addr(efs.psp_legacy);
        writeln!(f, " PSP directory (before Fam 17h)                 {:08x?}", a)?;
        let a = get_real_addr(efs.psp_directory);
        writeln!(f, " PSP directory (Fam 17h and later)              {:08x?}", a)?;
        let a = get_real_addr(efs.bios_17_00_0f);
        writeln!(f, " Fam 17h Model 00h-0Fh BIOS directory           {:08x?}", a)?;
        let a = get_real_addr(efs.bios_17_10_1f);
        writeln!(f, " Fam 17h Model 10h-1Fh BIOS directory           {:08x?}", a)?;
        let a = get_real_addr(efs.bios_17_30_3f_19_00_0f);
        writeln!(f, " Fam 17h Model 30h-3Fh + Fam 19h BIOS directory {:08x?}", a)?;
        let a = get_real_addr(efs.bios_17_60);
        writeln!(f, " Fam 17h Model 60h+ BIOS directory              {:08x?}", a)?;
        let a = get_real_addr(efs.promontory);
        writeln!(f, " Promontory firmware                            {:08x?}", a)?;
        let a = get_real_addr(efs.lp_promontory);
        writeln!(f, " LP Promontory firmware                         {:08x?}", a)?;

        writeln!(f, ":: SPI flash configuration ::")?;
        let s1 = efs.spi_cfg_15_60_6f;
        let s2 = efs.spi_cfg_17_00_1f;
        let s3 = efs.spi_cfg_17_30;
        writeln!(f, " Fam 15h Models 60h-6Fh        {}", s1)?;
        writeln!(f, " Fam 17h Models 00h-1Fh        {}", s2)?;
        write!(f, " Fam 17h Models 30h and later  {}", s3)
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiMode(u8);

// see coreboot util/amdfwtool
impl Display for SpiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0 => "Normal (up to 33M)".to_string(),
            1 => "Reserved".to_string(),
            2 => "Dual IO (1-1-2)".to_string(),
            3 => "Quad IO (1-1-4)".to_string(),
            4 => "Dual IO (1-2-2)".to_string(),
            5 => "Quad IO (1-4-4)".to_string(),
            6 => "Normal (up to 66M)".to_string(),
            7 => "Fast Read".to_string(),
            _ => format!("unknown ({:02x})", self.0),
        };
        write!(f, "{:18}", s)
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiSpeed(u8);

impl Display for SpiSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0 => "66.66MHz".to_string(),
            1 => "33.33MHz".to_string(),
            2 => "22.22MHz".to_string(),
            3 => "16.66MHz".to_string(),
            4 => "100MHz".to_string(),
            5 => "800KHz".to_string(),
            _ => format!("unknown ({:02x})", self.0),
        };
        write!(f, "{:12}", s)
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Micron(u8);

impl Display for Micron {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0x0A => "always".to_string(),
            0xFF => "unused".to_string(),
            _ => format!("unknown ({:02x})", self.0),
        };
        write!(f, "{}", s)
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Micron2(u8);

impl Display for Micron2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            0xAA => "always".to_string(),
            0x55 => "automatic".to_string(),
            0xFF => "unused".to_string(),
            _ => format!("unknown ({:02x})", self.0),
        };
        write!(f, "{}", s)
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiCfg {
    pub mode: SpiMode,
    pub speed: SpiSpeed,
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiCfg2 {
    pub mode: SpiMode,
    pub speed: SpiSpeed,
    pub micron: Micron,
}

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct SpiCfg3 {
    pub mode: SpiMode,
    pub speed: SpiSpeed,
    pub micron: Micron2,
}

impl Display for SpiCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode: {} speed: {}", self.mode, self.speed)
    }
}

impl Display for SpiCfg2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode: {} speed: {} micron: {}", self.mode, self.speed, self.micron)
    }
}

impl Display for SpiCfg3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode: {} speed: {} micron: {}", self.mode, self.speed, self.micron)
    }
}
