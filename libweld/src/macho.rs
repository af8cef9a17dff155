//! Mach-O on-disk definitions, specialized to the little-endian 64-bit form
//! this linker consumes and produces. Raw structs and constants come from
//! `object::macho`; this module adds the accessors the rest of the crate
//! wants.

use crate::error::Error;
use crate::error::Result;
use object::LittleEndian;
use object::Pod;
use object::macho;

pub(crate) type MachHeader64 = macho::MachHeader64<LittleEndian>;
pub(crate) type SegmentCommand64 = macho::SegmentCommand64<LittleEndian>;
pub(crate) type Section64 = macho::Section64<LittleEndian>;
pub(crate) type Nlist64 = macho::Nlist64<LittleEndian>;
pub(crate) type SymtabCommand = macho::SymtabCommand<LittleEndian>;
pub(crate) type DysymtabCommand = macho::DysymtabCommand<LittleEndian>;
pub(crate) type DyldInfoCommand = macho::DyldInfoCommand<LittleEndian>;
pub(crate) type LinkeditDataCommand = macho::LinkeditDataCommand<LittleEndian>;
pub(crate) type DylibCommand = macho::DylibCommand<LittleEndian>;
pub(crate) type BuildVersionCommand = macho::BuildVersionCommand<LittleEndian>;
pub(crate) type VersionMinCommand = macho::VersionMinCommand<LittleEndian>;
pub(crate) type Relocation = macho::Relocation<LittleEndian>;
pub(crate) type DataInCodeEntry = macho::DataInCodeEntry<LittleEndian>;

pub(crate) const SEG_DATA_CONST: &str = "__DATA_CONST";

/// `n_desc` stamp applied to symbols whose atom was dead-stripped.
pub(crate) const N_DEAD: u16 = 0x6000;

/// Room reserved per loaded dylib by `-headerpad_max_install_names`.
pub(crate) const MAXPATHLEN: u32 = 1024;

/// Reads one record at `offset`, rejecting truncated input.
pub(crate) fn pod_at<T: Pod>(data: &[u8], offset: usize) -> Result<&T> {
    let bytes = data.get(offset..).ok_or(Error::EndOfStream)?;
    object::pod::from_bytes(bytes)
        .map(|(value, _)| value)
        .map_err(|()| Error::EndOfStream)
}

/// Reads `count` consecutive records at `offset`.
pub(crate) fn pod_slice_at<T: Pod>(data: &[u8], offset: usize, count: usize) -> Result<&[T]> {
    let bytes = data.get(offset..).ok_or(Error::EndOfStream)?;
    object::pod::slice_from_bytes(bytes, count)
        .map(|(slice, _)| slice)
        .map_err(|()| Error::EndOfStream)
}

/// Pads a segment or section name to the fixed 16-byte field.
pub(crate) fn pad_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    debug_assert!(bytes.len() <= 16);
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Trims the trailing NULs off a fixed 16-byte name field.
pub(crate) fn name_of(raw: &[u8; 16]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);
    &raw[..end]
}

pub(crate) trait SectionExt {
    fn sect_name(&self) -> &[u8];
    fn seg_name(&self) -> &[u8];
    fn sect_type(&self) -> u32;
    fn attrs(&self) -> u32;
    fn is_zerofill(&self) -> bool;
    fn is_code(&self) -> bool;
    fn is_debug(&self) -> bool;
    fn is_no_dead_strip(&self) -> bool;
}

impl SectionExt for Section64 {
    fn sect_name(&self) -> &[u8] {
        name_of(&self.sectname)
    }

    fn seg_name(&self) -> &[u8] {
        name_of(&self.segname)
    }

    fn sect_type(&self) -> u32 {
        self.flags.get(LittleEndian) & macho::SECTION_TYPE
    }

    fn attrs(&self) -> u32 {
        self.flags.get(LittleEndian) & macho::SECTION_ATTRIBUTES
    }

    fn is_zerofill(&self) -> bool {
        matches!(
            self.sect_type(),
            macho::S_ZEROFILL | macho::S_GB_ZEROFILL | macho::S_THREAD_LOCAL_ZEROFILL
        )
    }

    fn is_code(&self) -> bool {
        self.attrs() & (macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS) != 0
    }

    fn is_debug(&self) -> bool {
        self.attrs() & macho::S_ATTR_DEBUG != 0
    }

    fn is_no_dead_strip(&self) -> bool {
        self.attrs() & macho::S_ATTR_NO_DEAD_STRIP != 0
    }
}

pub(crate) trait NlistExt {
    fn is_stab(&self) -> bool;
    fn is_ext(&self) -> bool;
    fn is_pext(&self) -> bool;
    fn is_undf(&self) -> bool;
    fn is_sect(&self) -> bool;
    fn is_abs(&self) -> bool;
    fn is_indr(&self) -> bool;
    fn is_weak_def(&self) -> bool;
    fn is_weak_ref(&self) -> bool;
    fn is_no_dead_strip(&self) -> bool;
    /// An undefined external with a nonzero value: a common (tentative)
    /// definition whose size is that value.
    fn is_tentative(&self) -> bool;
    /// Log2 alignment carried in the desc high byte of a tentative symbol.
    fn common_align(&self) -> u8;
}

impl NlistExt for Nlist64 {
    fn is_stab(&self) -> bool {
        self.n_type & macho::N_STAB != 0
    }

    fn is_ext(&self) -> bool {
        self.n_type & macho::N_EXT != 0
    }

    fn is_pext(&self) -> bool {
        self.n_type & macho::N_PEXT != 0
    }

    fn is_undf(&self) -> bool {
        !self.is_stab() && self.n_type & macho::N_TYPE == macho::N_UNDF
    }

    fn is_sect(&self) -> bool {
        !self.is_stab() && self.n_type & macho::N_TYPE == macho::N_SECT
    }

    fn is_abs(&self) -> bool {
        !self.is_stab() && self.n_type & macho::N_TYPE == macho::N_ABS
    }

    fn is_indr(&self) -> bool {
        !self.is_stab() && self.n_type & macho::N_TYPE == macho::N_INDR
    }

    fn is_weak_def(&self) -> bool {
        self.n_desc.get(LittleEndian) & macho::N_WEAK_DEF != 0
    }

    fn is_weak_ref(&self) -> bool {
        self.n_desc.get(LittleEndian) & macho::N_WEAK_REF != 0
    }

    fn is_no_dead_strip(&self) -> bool {
        self.n_desc.get(LittleEndian) & macho::N_NO_DEAD_STRIP != 0
    }

    fn is_tentative(&self) -> bool {
        self.is_undf() && self.is_ext() && self.n_value.get(LittleEndian) != 0
    }

    fn common_align(&self) -> u8 {
        ((self.n_desc.get(LittleEndian) >> 8) & 0x0f) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::U16;
    use object::U32;
    use object::U64Bytes;

    fn nlist(n_type: u8, n_desc: u16, n_value: u64) -> Nlist64 {
        Nlist64 {
            n_strx: U32::new(LittleEndian, 1),
            n_type,
            n_sect: 0,
            n_desc: U16::new(LittleEndian, n_desc),
            n_value: U64Bytes::new(LittleEndian, n_value),
        }
    }

    #[test]
    fn name_field_round_trip() {
        let raw = pad_name("__text");
        assert_eq!(name_of(&raw), b"__text");
        let full = pad_name("__thread_bss_etc");
        assert_eq!(name_of(&full), b"__thread_bss_etc");
    }

    #[test]
    fn nlist_classification() {
        let strong = nlist(macho::N_SECT | macho::N_EXT, 0, 0x1000);
        assert!(strong.is_sect() && strong.is_ext() && !strong.is_weak_def());

        let weak = nlist(macho::N_SECT | macho::N_EXT, macho::N_WEAK_DEF, 0x1000);
        assert!(weak.is_weak_def());

        let undef = nlist(macho::N_UNDF | macho::N_EXT, 0, 0);
        assert!(undef.is_undf() && !undef.is_tentative());

        let common = nlist(macho::N_UNDF | macho::N_EXT, 3 << 8, 24);
        assert!(common.is_tentative());
        assert_eq!(common.common_align(), 3);

        let stab = nlist(macho::N_OSO, 0, 0);
        assert!(stab.is_stab() && !stab.is_undf());
    }
}
