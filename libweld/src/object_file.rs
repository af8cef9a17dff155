//! Parses a 64-bit relocatable Mach-O object: load commands, sections,
//! symbol table, relocations and data-in-code. Produces the per-object pools
//! the rest of the pipeline slices into.

use crate::arch::Arch;
use crate::atom::AtomId;
use crate::atom::PoolSlice;
use crate::dwarf;
use crate::dwarf::DwarfSummary;
use crate::ensure;
use crate::error::Error;
use crate::error::Result;
use crate::file::FileId;
use crate::macho::DataInCodeEntry;
use crate::macho::MachHeader64;
use crate::macho::NlistExt;
use crate::macho::Nlist64;
use crate::macho::Section64;
use crate::macho::SectionExt;
use crate::macho::SegmentCommand64;
use crate::macho::SymtabCommand;
use crate::macho::VersionMinCommand;
use crate::macho::pod_at;
use crate::macho::pod_slice_at;
use crate::symbol::SymbolId;
use object::LittleEndian;
use object::macho;
use std::ops::Range;
use std::path::PathBuf;

/// One entry in the per-object relocation pool. `address` is relative to the
/// start of the section the owning slice covers; slices are sorted by it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reloc {
    pub(crate) address: u32,
    /// nlist index when `is_extern`, 1-based section ordinal otherwise.
    pub(crate) symbolnum: u32,
    pub(crate) is_extern: bool,
    pub(crate) pcrel: bool,
    /// log2 of the patched width.
    pub(crate) length: u8,
    pub(crate) r_type: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DataInCode {
    /// File offset of the covered range within the input object.
    pub(crate) offset: u32,
    pub(crate) length: u16,
    pub(crate) kind: u16,
}

#[derive(Debug)]
pub(crate) struct Object {
    pub(crate) index: FileId,
    pub(crate) path: PathBuf,
    /// Present when this object came out of an archive member.
    pub(crate) archive_path: Option<PathBuf>,
    pub(crate) alive: bool,
    pub(crate) mtime: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) sections: Vec<Section64>,
    /// Primary atom per input section; null for debug sections.
    pub(crate) section_atoms: Vec<AtomId>,
    pub(crate) section_relocs: Vec<PoolSlice>,
    pub(crate) section_dice: Vec<PoolSlice>,
    pub(crate) nlists: Vec<Nlist64>,
    strtab: Range<usize>,
    /// nlists below this index are local.
    pub(crate) first_global: u32,
    /// Linker symbol per nlist: a per-object symbol for locals, the resolved
    /// global for externals.
    pub(crate) symbols: Vec<SymbolId>,
    /// Every atom owned by this object, section atoms and synthesized ones.
    pub(crate) atoms: Vec<AtomId>,
    pub(crate) relocs: Vec<Reloc>,
    pub(crate) dice: Vec<DataInCode>,
    pub(crate) dwarf: Option<DwarfSummary>,
    /// minos of `LC_BUILD_VERSION` or the legacy version-min commands.
    pub(crate) min_version: Option<u32>,
}

impl Object {
    /// Decodes `data` as a relocatable object for `arch`. Returns the
    /// format-rejection errors (`NotObject`, `EndOfStream`) while the header
    /// is still in question; later malformations are fatal.
    pub(crate) fn parse(
        data: Vec<u8>,
        path: PathBuf,
        archive_path: Option<PathBuf>,
        mtime: u64,
        arch: Arch,
    ) -> Result<Object> {
        if data.len() < 4 {
            return Err(Error::EndOfStream);
        }
        let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
        if magic != macho::MH_MAGIC_64 {
            return Err(Error::NotObject);
        }
        let header = pod_at::<MachHeader64>(&data, 0)?;
        if header.filetype.get(LittleEndian) != macho::MH_OBJECT {
            return Err(Error::NotObject);
        }
        if header.cputype.get(LittleEndian) != arch.cpu_type() {
            return Err(Error::MismatchedCpuArchitecture { path });
        }

        let mut sections: Vec<Section64> = Vec::new();
        let mut symtab: Option<SymtabCommand> = None;
        let mut dysymtab: Option<(u32, u32)> = None;
        let mut dice_cmd: Option<(u32, u32)> = None;
        let mut min_version = None;

        let ncmds = header.ncmds.get(LittleEndian);
        let mut offset = size_of::<MachHeader64>();
        for _ in 0..ncmds {
            let cmd = *pod_at::<object::U32<LittleEndian>>(&data, offset)?;
            let cmdsize = *pod_at::<object::U32<LittleEndian>>(&data, offset + 4)?;
            let cmd = cmd.get(LittleEndian);
            let cmdsize = cmdsize.get(LittleEndian) as usize;
            ensure!(cmdsize >= 8, "{}: malformed load command", path.display());

            match cmd {
                macho::LC_SEGMENT_64 => {
                    let segment = pod_at::<SegmentCommand64>(&data, offset)?;
                    let nsects = segment.nsects.get(LittleEndian) as usize;
                    let headers = pod_slice_at::<Section64>(
                        &data,
                        offset + size_of::<SegmentCommand64>(),
                        nsects,
                    )?;
                    sections.extend_from_slice(headers);
                }
                macho::LC_SYMTAB => {
                    symtab = Some(*pod_at::<SymtabCommand>(&data, offset)?);
                }
                macho::LC_DYSYMTAB => {
                    let cmd = pod_at::<crate::macho::DysymtabCommand>(&data, offset)?;
                    dysymtab = Some((
                        cmd.ilocalsym.get(LittleEndian),
                        cmd.nlocalsym.get(LittleEndian),
                    ));
                }
                macho::LC_DATA_IN_CODE => {
                    let cmd = pod_at::<crate::macho::LinkeditDataCommand>(&data, offset)?;
                    dice_cmd = Some((
                        cmd.dataoff.get(LittleEndian),
                        cmd.datasize.get(LittleEndian),
                    ));
                }
                macho::LC_BUILD_VERSION => {
                    let cmd = pod_at::<crate::macho::BuildVersionCommand>(&data, offset)?;
                    min_version = Some(cmd.minos.get(LittleEndian));
                }
                macho::LC_VERSION_MIN_MACOSX
                | macho::LC_VERSION_MIN_IPHONEOS
                | macho::LC_VERSION_MIN_TVOS
                | macho::LC_VERSION_MIN_WATCHOS => {
                    let cmd = pod_at::<VersionMinCommand>(&data, offset)?;
                    min_version = Some(cmd.version.get(LittleEndian));
                }
                _ => {}
            }
            offset += cmdsize;
        }

        let (mut nlists, strtab) = match &symtab {
            Some(symtab) => {
                let symoff = symtab.symoff.get(LittleEndian) as usize;
                let nsyms = symtab.nsyms.get(LittleEndian) as usize;
                let stroff = symtab.stroff.get(LittleEndian) as usize;
                let strsize = symtab.strsize.get(LittleEndian) as usize;
                ensure!(
                    stroff + strsize <= data.len(),
                    "{}: string table extends past the file",
                    path.display()
                );
                let nlists = pod_slice_at::<Nlist64>(&data, symoff, nsyms)?.to_vec();
                (nlists, stroff..stroff + strsize)
            }
            None => (Vec::new(), 0..0),
        };

        // Relocations, copied into one pool with a sorted slice per section.
        let mut relocs = Vec::new();
        let mut section_relocs = Vec::with_capacity(sections.len());
        for section in &sections {
            let start = relocs.len() as u32;
            let nreloc = section.nreloc.get(LittleEndian) as usize;
            if nreloc > 0 {
                let reloff = section.reloff.get(LittleEndian) as usize;
                let raw = pod_slice_at::<crate::macho::Relocation>(&data, reloff, nreloc)?;
                for rel in raw {
                    let info = rel.info(LittleEndian);
                    relocs.push(Reloc {
                        address: info.r_address,
                        symbolnum: info.r_symbolnum,
                        is_extern: info.r_extern,
                        pcrel: info.r_pcrel,
                        length: info.r_length,
                        r_type: info.r_type,
                    });
                }
                relocs[start as usize..].sort_unstable_by_key(|rel| rel.address);
            }
            section_relocs.push(PoolSlice {
                start,
                len: relocs.len() as u32 - start,
            });
        }

        // Data-in-code entries, sorted by offset, sliced per section below.
        let mut dice = Vec::new();
        if let Some((dataoff, datasize)) = dice_cmd {
            let count = datasize as usize / size_of::<DataInCodeEntry>();
            for entry in pod_slice_at::<DataInCodeEntry>(&data, dataoff as usize, count)? {
                dice.push(DataInCode {
                    offset: entry.offset.get(LittleEndian),
                    length: entry.length.get(LittleEndian),
                    kind: entry.kind.get(LittleEndian),
                });
            }
            dice.sort_unstable_by_key(|entry| entry.offset);
        }
        let section_dice = sections
            .iter()
            .map(|section| {
                if section.is_zerofill() {
                    return PoolSlice::default();
                }
                let lo = section.offset.get(LittleEndian);
                let hi = lo + section.size.get(LittleEndian) as u32;
                let start = dice.partition_point(|entry| entry.offset < lo);
                let end = dice.partition_point(|entry| entry.offset < hi);
                PoolSlice {
                    start: start as u32,
                    len: (end - start) as u32,
                }
            })
            .collect();

        let first_global = match dysymtab {
            Some((ilocalsym, nlocalsym)) => ilocalsym + nlocalsym,
            None => sort_nlists(&mut nlists, &mut relocs),
        };

        let num_sections = sections.len();
        let mut object = Object {
            index: FileId::NULL,
            path,
            archive_path,
            alive: true,
            mtime,
            data,
            sections,
            section_atoms: vec![AtomId::NULL; num_sections],
            section_relocs,
            section_dice,
            nlists,
            strtab,
            first_global,
            symbols: Vec::new(),
            atoms: Vec::new(),
            relocs,
            dice,
            dwarf: None,
            min_version,
        };
        object.symbols = vec![SymbolId::NULL; object.nlists.len()];
        object.dwarf = object.parse_dwarf_summary();
        Ok(object)
    }

    pub(crate) fn nlist_name(&self, nlist: &Nlist64) -> &[u8] {
        let strx = nlist.n_strx.get(LittleEndian) as usize;
        let strtab = &self.data[self.strtab.clone()];
        match strtab.get(strx..) {
            Some(rest) => {
                let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                &rest[..len]
            }
            None => b"",
        }
    }

    /// Raw bytes of a 1-based input section ordinal; empty for zerofill.
    pub(crate) fn section_data(&self, ordinal: u32) -> &[u8] {
        let section = &self.sections[ordinal as usize - 1];
        if section.is_zerofill() {
            return b"";
        }
        let offset = section.offset.get(LittleEndian) as usize;
        let size = section.size.get(LittleEndian) as usize;
        &self.data[offset..offset + size]
    }

    pub(crate) fn section(&self, ordinal: u32) -> &Section64 {
        &self.sections[ordinal as usize - 1]
    }

    /// Display name including the archive member notation.
    pub(crate) fn display_name(&self) -> String {
        match &self.archive_path {
            Some(archive) => format!("{}({})", archive.display(), self.path.display()),
            None => self.path.display().to_string(),
        }
    }

    fn parse_dwarf_summary(&self) -> Option<DwarfSummary> {
        let mut info = None;
        let mut abbrev = None;
        let mut strings = None;
        for (ordinal0, section) in self.sections.iter().enumerate() {
            if !section.is_debug() {
                continue;
            }
            let data = self.section_data(ordinal0 as u32 + 1);
            match section.sect_name() {
                b"__debug_info" => info = Some(data),
                b"__debug_abbrev" => abbrev = Some(data),
                b"__debug_str" => strings = Some(data),
                _ => {}
            }
        }
        dwarf::parse_summary(info?, abbrev?, strings?)
    }
}

/// Restores the locals-then-globals partition when `LC_DYSYMTAB` is absent:
/// orders defined symbols before undefined, locals before externals, then by
/// section, value and name offset, and rewrites the relocation pool's symbol
/// indexes through a backlink table. Returns the new first-global index.
fn sort_nlists(nlists: &mut [Nlist64], relocs: &mut [Reloc]) -> u32 {
    let mut order: Vec<u32> = (0..nlists.len() as u32).collect();
    order.sort_by_key(|&i| {
        let nlist = &nlists[i as usize];
        (
            u8::from(nlist.is_undf()),
            u8::from(nlist.is_ext()),
            nlist.n_sect,
            nlist.n_value.get(LittleEndian),
            nlist.n_strx.get(LittleEndian),
        )
    });

    let mut backlinks = vec![0u32; nlists.len()];
    for (new_index, &old_index) in order.iter().enumerate() {
        backlinks[old_index as usize] = new_index as u32;
    }

    let sorted: Vec<Nlist64> = order.iter().map(|&i| nlists[i as usize]).collect();
    nlists.copy_from_slice(&sorted);

    for reloc in relocs {
        if reloc.is_extern {
            reloc.symbolnum = backlinks[reloc.symbolnum as usize];
        }
    }

    nlists
        .iter()
        .position(|nlist| nlist.is_ext())
        .unwrap_or(nlists.len()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::U16;
    use object::U32;
    use object::U64Bytes;

    fn nlist(n_strx: u32, n_type: u8, n_sect: u8, n_value: u64) -> Nlist64 {
        Nlist64 {
            n_strx: U32::new(LittleEndian, n_strx),
            n_type,
            n_sect,
            n_desc: U16::new(LittleEndian, 0),
            n_value: U64Bytes::new(LittleEndian, n_value),
        }
    }

    #[test]
    fn non_objects_are_rejected_recoverably() {
        assert!(matches!(
            Object::parse(
                b"!<arch>\n".to_vec(),
                PathBuf::from("libx.a"),
                None,
                0,
                Arch::Aarch64,
            ),
            Err(Error::NotObject)
        ));
        assert!(matches!(
            Object::parse(vec![0xcf], PathBuf::from("t.o"), None, 0, Arch::Aarch64),
            Err(Error::EndOfStream)
        ));
    }

    #[test]
    fn nlist_sort_partitions_and_rewrites_backlinks() {
        // Input order: external defined, undef, local defined.
        let mut nlists = vec![
            nlist(10, macho::N_SECT | macho::N_EXT, 1, 0x20),
            nlist(20, macho::N_UNDF | macho::N_EXT, 0, 0),
            nlist(30, macho::N_SECT, 1, 0x8),
        ];
        let mut relocs = vec![
            Reloc {
                address: 0,
                symbolnum: 1,
                is_extern: true,
                pcrel: true,
                length: 2,
                r_type: 0,
            },
            Reloc {
                address: 8,
                symbolnum: 2,
                is_extern: true,
                pcrel: false,
                length: 3,
                r_type: 0,
            },
        ];

        let first_global = sort_nlists(&mut nlists, &mut relocs);
        assert_eq!(first_global, 1);
        // Local first, then the defined external, then the undef.
        assert_eq!(nlists[0].n_strx.get(LittleEndian), 30);
        assert_eq!(nlists[1].n_strx.get(LittleEndian), 10);
        assert_eq!(nlists[2].n_strx.get(LittleEndian), 20);
        // The undef moved from index 1 to 2, the local from 2 to 0.
        assert_eq!(relocs[0].symbolnum, 2);
        assert_eq!(relocs[1].symbolnum, 0);
    }
}
