//! Sizes each output section from its live atoms, orders sections by
//! segment/section precedence, builds the segments at page-aligned
//! addresses, and stamps every symbol with its final value.

use crate::arch::Arch;
use crate::args::OutputMode;
use crate::atom::AtomId;
use crate::error::Result;
use crate::file::File;
use crate::linker::Linker;
use crate::macho::NlistExt;
use crate::macho::name_of;
use crate::macho::pad_name;
use crate::symbol::SymbolFlags;
use crate::thunks::align_to;
use object::LittleEndian;
use object::macho;

/// Index into the linker's section vector. The null id marks an atom not yet
/// appended anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SectionId(pub(crate) u32);

impl SectionId {
    pub(crate) const NULL: SectionId = SectionId(u32::MAX);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) struct OutputSection {
    pub(crate) segname: [u8; 16],
    pub(crate) sectname: [u8; 16],
    pub(crate) flags: u32,
    pub(crate) addr: u64,
    pub(crate) size: u64,
    /// File offset of the contents; stays zero for zerofill.
    pub(crate) offset: u32,
    /// log2, the max of the member atoms'.
    pub(crate) align: u8,
    pub(crate) reserved1: u32,
    pub(crate) reserved2: u32,
    /// Owning segment, assigned once segments are built.
    pub(crate) segment: usize,
    pub(crate) first_atom: AtomId,
    pub(crate) last_atom: AtomId,
}

impl OutputSection {
    pub(crate) fn new(segname: [u8; 16], sectname: [u8; 16], flags: u32) -> OutputSection {
        OutputSection {
            segname,
            sectname,
            flags,
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reserved1: 0,
            reserved2: 0,
            segment: 0,
            first_atom: AtomId::NULL,
            last_atom: AtomId::NULL,
        }
    }

    pub(crate) fn sect_type(&self) -> u32 {
        self.flags & macho::SECTION_TYPE
    }

    pub(crate) fn is_zerofill(&self) -> bool {
        matches!(
            self.sect_type(),
            macho::S_ZEROFILL | macho::S_GB_ZEROFILL | macho::S_THREAD_LOCAL_ZEROFILL
        )
    }

    pub(crate) fn is_code(&self) -> bool {
        self.flags & (macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS) != 0
    }
}

#[derive(Debug)]
pub(crate) struct Segment {
    pub(crate) name: [u8; 16],
    pub(crate) vmaddr: u64,
    pub(crate) vmsize: u64,
    pub(crate) fileoff: u64,
    pub(crate) filesize: u64,
    pub(crate) maxprot: u32,
    pub(crate) initprot: u32,
    /// Range into `linker.section_order`.
    pub(crate) sections: std::ops::Range<usize>,
}

impl Segment {
    fn new(name: [u8; 16]) -> Segment {
        let (maxprot, initprot) = segment_protections(name_of(&name));
        Segment {
            name,
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot,
            initprot,
            sections: 0..0,
        }
    }
}

const PROT_NONE: u32 = 0;
const PROT_R: u32 = macho::VM_PROT_READ;
const PROT_RW: u32 = macho::VM_PROT_READ | macho::VM_PROT_WRITE;
const PROT_RX: u32 = macho::VM_PROT_READ | macho::VM_PROT_EXECUTE;

fn segment_protections(name: &[u8]) -> (u32, u32) {
    match name {
        b"__PAGEZERO" => (PROT_NONE, PROT_NONE),
        b"__TEXT" => (PROT_RX, PROT_RX),
        b"__LINKEDIT" => (PROT_R, PROT_R),
        _ => (PROT_RW, PROT_RW),
    }
}

fn segment_rank(name: &[u8]) -> u8 {
    match name {
        b"__PAGEZERO" => 0x0,
        b"__TEXT" => 0x1,
        b"__DATA_CONST" => 0x2,
        b"__DATA" => 0x4,
        b"__LINKEDIT" => 0xf,
        _ => 0x5,
    }
}

/// Position within a segment. Code first, pointer tables in fixup order,
/// zerofill always at the tail so it never occupies file space.
fn section_rank(section: &OutputSection) -> u8 {
    match section.sect_type() {
        macho::S_SYMBOL_STUBS => 0x2,
        macho::S_NON_LAZY_SYMBOL_POINTERS => 0x1,
        macho::S_LAZY_SYMBOL_POINTERS => 0x2,
        macho::S_MOD_INIT_FUNC_POINTERS => 0x5,
        macho::S_MOD_TERM_FUNC_POINTERS => 0x6,
        macho::S_CSTRING_LITERALS => 0x6,
        macho::S_4BYTE_LITERALS | macho::S_8BYTE_LITERALS | macho::S_16BYTE_LITERALS => 0x7,
        macho::S_THREAD_LOCAL_VARIABLES => 0xb,
        macho::S_THREAD_LOCAL_VARIABLE_POINTERS => 0xc,
        macho::S_THREAD_LOCAL_REGULAR => 0xd,
        macho::S_THREAD_LOCAL_ZEROFILL => 0xe,
        macho::S_ZEROFILL | macho::S_GB_ZEROFILL => 0xf,
        _ => match name_of(&section.sectname) {
            b"__text" => 0x0,
            b"__stub_helper" => 0x3,
            b"__eh_frame" => 0xa,
            b"__const" => 0x6,
            _ if section.is_code() => 0x4,
            _ => 0x8,
        },
    }
}

fn section_precedence(section: &OutputSection) -> u8 {
    (segment_rank(name_of(&section.segname)) << 4) | section_rank(section)
}

impl Linker {
    /// The section/segment allocator, with thunk planning folded into the
    /// sizing walk for aarch64 code sections.
    pub(crate) fn allocate(&mut self) -> Result {
        self.size_sections();
        self.order_sections();
        self.build_segments();
        self.assign_addresses();
        self.assign_symbol_values();
        Ok(())
    }

    fn size_sections(&mut self) {
        let section_count = self.sections.len();
        for index in 0..section_count {
            let id = SectionId(index as u32);
            if self.arch() == Arch::Aarch64 && self.section(id).is_code() {
                self.insert_thunks(id);
            }

            let atoms: Vec<AtomId> = self
                .section_atoms(id)
                .filter(|&atom| self.atom(atom).live)
                .collect();
            let mut cursor = 0u64;
            let mut max_align = 0u8;
            for atom_id in atoms {
                let (alignment, align, size) = {
                    let atom = self.atom(atom_id);
                    (atom.alignment(), atom.align, atom.size)
                };
                cursor = align_to(cursor, alignment);
                self.atom_mut(atom_id).off = cursor;
                cursor += size;
                max_align = max_align.max(align);
            }
            let section = self.section_mut(id);
            section.size = cursor;
            section.align = max_align;
        }
    }

    /// Prunes empty sections and fixes the output order.
    fn order_sections(&mut self) {
        let mut order: Vec<SectionId> = (0..self.sections.len() as u32)
            .map(SectionId)
            .filter(|&id| self.section(id).size > 0)
            .collect();
        // Stable tie-break on the id keeps creation order within a rank.
        order.sort_by_key(|&id| (section_precedence(self.section(id)), id.0));
        self.section_order = order;
    }

    fn build_segments(&mut self) {
        self.segments.clear();

        if self.args.output_mode == OutputMode::Executable {
            let mut pagezero = Segment::new(pad_name("__PAGEZERO"));
            pagezero.vmsize = self.args.pagezero_size.unwrap_or(0x1_0000_0000);
            self.segments.push(pagezero);
        }

        let mut current: Option<[u8; 16]> = None;
        for position in 0..self.section_order.len() {
            let id = self.section_order[position];
            let segname = self.section(id).segname;
            if current != Some(segname) {
                let mut segment = Segment::new(segname);
                segment.sections = position..position;
                self.segments.push(segment);
                current = Some(segname);
            }
            let segment_index = self.segments.len() - 1;
            self.segments[segment_index].sections.end = position + 1;
            self.sections[id.index()].segment = segment_index;
        }

        // __TEXT exists even for an input set with no code.
        if !self
            .segments
            .iter()
            .any(|segment| name_of(&segment.name) == b"__TEXT")
        {
            let insert_at = usize::from(self.args.output_mode == OutputMode::Executable);
            self.segments
                .insert(insert_at, Segment::new(pad_name("__TEXT")));
            for section in &mut self.sections {
                if section.segment >= insert_at {
                    section.segment += 1;
                }
            }
        }

        self.segments.push(Segment::new(pad_name("__LINKEDIT")));
    }

    fn assign_addresses(&mut self) {
        let page_size = self.args.target.page_size();
        let header_pad = self.header_pad();

        let mut vmaddr = 0u64;
        let mut fileoff = 0u64;
        for index in 0..self.segments.len() {
            let name = name_of(&self.segments[index].name).to_vec();
            if name == b"__PAGEZERO" {
                let segment = &mut self.segments[index];
                segment.vmaddr = 0;
                vmaddr = segment.vmsize;
                continue;
            }

            let is_text = name == b"__TEXT";
            let sections = self.segments[index].sections.clone();

            let mut addr_cursor = vmaddr + if is_text { u64::from(header_pad) } else { 0 };
            let mut file_cursor = if is_text { u64::from(header_pad) } else { 0 };

            for position in sections {
                let id = self.section_order[position];
                let (alignment, zerofill) = {
                    let section = self.section(id);
                    (1u64 << section.align, section.is_zerofill())
                };
                addr_cursor = align_to(addr_cursor, alignment);
                if zerofill {
                    let section = self.section_mut(id);
                    section.addr = addr_cursor;
                    section.offset = 0;
                    addr_cursor += section.size;
                } else {
                    file_cursor = align_to(file_cursor, alignment);
                    let section = self.section_mut(id);
                    section.addr = addr_cursor;
                    section.offset = (fileoff + file_cursor) as u32;
                    addr_cursor += section.size;
                    file_cursor += section.size;
                }
            }

            let segment = &mut self.segments[index];
            segment.vmaddr = vmaddr;
            segment.fileoff = fileoff;
            if name == b"__LINKEDIT" {
                // Sized once the LINKEDIT payload has been written.
                segment.filesize = 0;
                segment.vmsize = 0;
            } else {
                segment.filesize = align_to(file_cursor, page_size);
                segment.vmsize = align_to(addr_cursor - vmaddr, page_size);
            }
            vmaddr = segment.vmaddr + segment.vmsize;
            fileoff = segment.fileoff + segment.filesize;
        }
    }

    /// `sizeof(header) + Σ load-command sizes`, widened by the headerpad
    /// options, rounded up to the first section's alignment.
    fn header_pad(&self) -> u32 {
        let mut pad =
            size_of::<crate::macho::MachHeader64>() as u32 + self.estimate_load_commands_size();
        pad += self.args.headerpad;
        if self.args.headerpad_max_install_names {
            pad += self.loaded_dylibs().len() as u32 * crate::macho::MAXPATHLEN;
        }
        let first_align = self
            .section_order
            .first()
            .map_or(3, |&id| self.section(id).align);
        align_to(u64::from(pad), 1 << first_align.max(3)) as u32
    }

    fn assign_symbol_values(&mut self) {
        // Atom-owning symbols get `section.addr + atom.off`.
        for atom_index in 1..self.atoms.len() {
            let atom_id = AtomId(atom_index as u32);
            let (live, section, off, sym) = {
                let atom = self.atom(atom_id);
                (atom.live, atom.section, atom.off, atom.sym)
            };
            if !live || section == SectionId::NULL || sym.is_null() {
                continue;
            }
            let address = self.section(section).addr + off;
            self.symbol_mut(sym).value = address;
        }

        // nlist-backed symbols land at their delta within the section atom.
        for file_index in 1..self.files.len() {
            let File::Object(object) = &self.files[file_index] else {
                continue;
            };
            let mut updates: Vec<(crate::symbol::SymbolId, u64)> = Vec::new();
            for (index, nlist) in object.nlists.iter().enumerate() {
                if !nlist.is_sect() {
                    continue;
                }
                let symbol_id = object.symbols[index];
                if symbol_id.is_null() {
                    continue;
                }
                // A global resolved to a different file keeps the winner's
                // value.
                let symbol = self.symbol(symbol_id);
                if symbol.file.index() != file_index || symbol.nlist_index != index as u32 {
                    continue;
                }
                let Some(&atom_id) = object.section_atoms.get(nlist.n_sect as usize - 1) else {
                    continue;
                };
                if atom_id.is_null() || !self.atom(atom_id).live {
                    continue;
                }
                let input_section = object.section(nlist.n_sect as u32);
                let delta =
                    nlist.n_value.get(LittleEndian) - input_section.addr.get(LittleEndian);
                updates.push((symbol_id, self.atom_address(atom_id) + delta));
            }
            for (symbol_id, value) in updates {
                self.symbol_mut(symbol_id).value = value;
            }
        }

        // Header symbols land on the image base.
        let text_vmaddr = self.text_segment_vmaddr();
        if !self.mh_execute_header.is_null() {
            self.symbol_mut(self.mh_execute_header).value = text_vmaddr;
        }
        if !self.dso_handle.is_null() {
            self.symbol_mut(self.dso_handle).value = text_vmaddr;
        }

        // Segment-level boundary symbols resolve straight to segment edges.
        for index in 0..self.global_list.len() {
            let symbol_id = self.global_list[index];
            if !self.symbol(symbol_id).flags.contains(SymbolFlags::BOUNDARY) {
                continue;
            }
            let Some(spec) = self.side.boundaries.get(&symbol_id) else {
                continue;
            };
            if spec.section.is_some() {
                continue; // placed as an atom
            }
            let wanted = pad_name(&spec.segment);
            let value = self
                .segments
                .iter()
                .find(|segment| segment.name == wanted)
                .map_or(0, |segment| {
                    if spec.start {
                        segment.vmaddr
                    } else {
                        segment.vmaddr + segment.vmsize
                    }
                });
            self.symbol_mut(symbol_id).value = value;
        }
    }

    pub(crate) fn text_segment_vmaddr(&self) -> u64 {
        self.segments
            .iter()
            .find(|segment| name_of(&segment.name) == b"__TEXT")
            .map_or(0, |segment| segment.vmaddr)
    }

    pub(crate) fn linkedit_segment_index(&self) -> usize {
        self.segments.len() - 1
    }

    /// Segment index as dyld opcodes number them: position in load-command
    /// order, which matches `self.segments`.
    pub(crate) fn segment_index_of_section(&self, id: SectionId) -> u8 {
        self.section(id).segment as u8
    }

    /// Pointers in this section need rebase/bind treatment only if its
    /// segment is writable.
    pub(crate) fn section_is_writable(&self, id: SectionId) -> bool {
        let segment = &self.segments[self.section(id).segment];
        segment.initprot & macho::VM_PROT_WRITE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_for(segname: &str, sectname: &str, flags: u32) -> OutputSection {
        OutputSection::new(pad_name(segname), pad_name(sectname), flags)
    }

    #[test]
    fn precedence_orders_segments_then_sections() {
        let order = [
            section_for("__TEXT", "__text", macho::S_ATTR_PURE_INSTRUCTIONS),
            section_for(
                "__TEXT",
                "__stubs",
                macho::S_SYMBOL_STUBS | macho::S_ATTR_PURE_INSTRUCTIONS,
            ),
            section_for("__TEXT", "__stub_helper", macho::S_ATTR_PURE_INSTRUCTIONS),
            section_for("__DATA_CONST", "__got", macho::S_NON_LAZY_SYMBOL_POINTERS),
            section_for("__DATA", "__la_symbol_ptr", macho::S_LAZY_SYMBOL_POINTERS),
            section_for("__DATA", "__data", macho::S_REGULAR),
            section_for("__DATA", "__common", macho::S_ZEROFILL),
        ];
        let ranks: Vec<u8> = order.iter().map(section_precedence).collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted, "declaration order above is output order");
        let mut deduped = ranks.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), order.len(), "each section ranks distinctly");
    }

    #[test]
    fn zerofill_sorts_to_the_segment_tail() {
        let data = section_for("__DATA", "__data", macho::S_REGULAR);
        let tlv_zero = section_for("__DATA", "__thread_bss", macho::S_THREAD_LOCAL_ZEROFILL);
        let bss = section_for("__DATA", "__bss", macho::S_ZEROFILL);
        assert!(section_precedence(&data) < section_precedence(&tlv_zero));
        assert!(section_precedence(&tlv_zero) < section_precedence(&bss));
    }

    #[test]
    fn protections_follow_segment_conventions() {
        assert_eq!(segment_protections(b"__PAGEZERO"), (PROT_NONE, PROT_NONE));
        assert_eq!(segment_protections(b"__TEXT"), (PROT_RX, PROT_RX));
        assert_eq!(segment_protections(b"__DATA"), (PROT_RW, PROT_RW));
        assert_eq!(segment_protections(b"__DATA_CONST"), (PROT_RW, PROT_RW));
        assert_eq!(segment_protections(b"__LINKEDIT"), (PROT_R, PROT_R));
    }
}
