// SPDX-License-Identifier: MIT

//! Firmware image abstraction: a raw byte buffer plus the mapping between
//! image offsets and physical addresses on the CPU's memory bus.

/// Capability set of a firmware image. Core operations treat the buffer as
/// read-only; mutation happens only in caller-supplied sinks.
pub trait FirmwareImage {
    fn data(&self) -> &[u8];

    /// Maps a physical address to an image offset, if it falls inside the
    /// image.
    fn phys_to_offset(&self, phys: u64) -> Option<u64>;

    /// Maps an image offset back to a physical address.
    fn offset_to_phys(&self, offset: u64) -> Option<u64>;

    /// Resolves a pointer stored in a firmware structure. Pointers in EFS
    /// and directory entries are physical addresses on most parts but plain
    /// flash offsets on others; physical interpretation wins when both fit.
    fn pointer_to_offset(&self, pointer: u64) -> Option<u64> {
        if let Some(offset) = self.phys_to_offset(pointer) {
            return Some(offset);
        }
        if pointer < self.data().len() as u64 {
            return Some(pointer);
        }
        None
    }
}

/// An image mapped so that its last byte lives just below a fixed ceiling on
/// the memory bus. The conventional mapping puts the last byte at
/// `2^32 - 1`; some AMD parts use a custom base such as `0xFF00_0000`.
pub struct MappedImage<'a> {
    data: &'a [u8],
    base: u64,
}

impl<'a> MappedImage<'a> {
    /// Conventional legacy mapping: `phys = 2^32 - image_size + offset`.
    pub fn new(data: &'a [u8]) -> Self {
        let base = (1u64 << 32) - data.len() as u64;
        Self { data, base }
    }

    /// Custom mapping with an explicit base physical address.
    pub fn with_base(data: &'a [u8], base: u64) -> Self {
        Self { data, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl FirmwareImage for MappedImage<'_> {
    fn data(&self) -> &[u8] {
        self.data
    }

    fn phys_to_offset(&self, phys: u64) -> Option<u64> {
        let offset = phys.checked_sub(self.base)?;
        if offset < self.data.len() as u64 {
            Some(offset)
        } else {
            None
        }
    }

    fn offset_to_phys(&self, offset: u64) -> Option<u64> {
        if offset < self.data.len() as u64 {
            Some(self.base + offset)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_mapping_tops_out_at_4gib() {
        let data = vec![0u8; 0x20000];
        let image = MappedImage::new(&data);
        assert_eq!(image.base(), 0x1_0000_0000 - 0x20000);
        assert_eq!(image.offset_to_phys(0x1ffff), Some(0xffff_ffff));
        assert_eq!(image.phys_to_offset(0xffff_ffff), Some(0x1ffff));
        assert_eq!(image.phys_to_offset(image.base() - 1), None);
        assert_eq!(image.offset_to_phys(0x20000), None);
    }

    #[test]
    fn custom_base() {
        let data = vec![0u8; 0x1000];
        let image = MappedImage::with_base(&data, 0xff00_0000);
        assert_eq!(image.phys_to_offset(0xff00_0800), Some(0x800));
        assert_eq!(image.phys_to_offset(0xff00_1000), None);
    }

    #[test]
    fn pointer_resolution_prefers_physical() {
        let data = vec![0u8; 0x10000];
        let image = MappedImage::new(&data);
        // In the physical window.
        assert_eq!(image.pointer_to_offset(0xffff_1000), Some(0x1000));
        // Below the window but inside the image: a flash offset.
        assert_eq!(image.pointer_to_offset(0x1000), Some(0x1000));
        assert_eq!(image.pointer_to_offset(0x10000), None);
    }
}
