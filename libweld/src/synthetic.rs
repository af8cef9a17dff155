//! Synthesized atoms: common (tentative) storage, boundary markers, GOT and
//! TLV pointer slots, lazy pointers, stubs and the stub-helper machinery.
//! The indirect tables are parallel vectors with a target-keyed lookup, per
//! the arena-and-index scheme used everywhere else.

use crate::atom::Atom;
use crate::atom::AtomId;
use crate::file::File;
use crate::file::FileId;
use crate::linker::Linker;
use crate::macho::SEG_DATA_CONST;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use object::macho;

#[derive(Debug, Clone, Copy)]
pub(crate) struct IndirectEntry {
    pub(crate) target: SymbolId,
    pub(crate) atom: AtomId,
}

/// GOT and TLV-pointer tables: insertion-ordered entries plus a lookup so a
/// target gets exactly one slot.
#[derive(Debug, Default)]
pub(crate) struct IndirectTable {
    pub(crate) entries: Vec<IndirectEntry>,
    lookup: foldhash::HashMap<SymbolId, u32>,
}

impl IndirectTable {
    pub(crate) fn index_of(&self, target: SymbolId) -> Option<u32> {
        self.lookup.get(&target).copied()
    }

    pub(crate) fn atom_for(&self, target: SymbolId) -> Option<AtomId> {
        self.index_of(target)
            .map(|index| self.entries[index as usize].atom)
    }

    fn insert(&mut self, target: SymbolId, atom: AtomId) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(IndirectEntry { target, atom });
        self.lookup.insert(target, index);
        index
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StubEntry {
    pub(crate) target: SymbolId,
    pub(crate) stub: AtomId,
    pub(crate) lazy_ptr: AtomId,
    pub(crate) helper: AtomId,
}

#[derive(Debug, Default)]
pub(crate) struct StubTable {
    pub(crate) entries: Vec<StubEntry>,
    lookup: foldhash::HashMap<SymbolId, u32>,
}

impl StubTable {
    pub(crate) fn index_of(&self, target: SymbolId) -> Option<u32> {
        self.lookup.get(&target).copied()
    }

    pub(crate) fn stub_atom(&self, target: SymbolId) -> Option<AtomId> {
        self.index_of(target)
            .map(|index| self.entries[index as usize].stub)
    }
}

impl Linker {
    /// Atoms that exist before relocation scanning: common storage for every
    /// surviving tentative definition, and markers for section boundary
    /// symbols. (Segment boundary symbols get their values directly from the
    /// allocator; there is no section to pin an atom into yet.)
    pub(crate) fn create_synthetic_atoms(&mut self) -> crate::error::Result {
        for index in 0..self.global_list.len() {
            let symbol_id = self.global_list[index];
            let symbol = self.symbol(symbol_id);

            if symbol.is_tentative() && symbol.atom.is_null() {
                self.create_common_atom(symbol_id);
            } else if symbol.flags.contains(SymbolFlags::BOUNDARY) {
                self.create_boundary_atom(symbol_id);
            }
        }
        Ok(())
    }

    /// `__DATA,__common` zerofill storage owned by the defining object.
    fn create_common_atom(&mut self, symbol_id: SymbolId) {
        let section_id =
            self.get_or_create_section("__DATA", "__common", macho::S_ZEROFILL);
        let (name, size, align, file) = {
            let symbol = self.symbol(symbol_id);
            (symbol.name, symbol.value, symbol.common_align, symbol.file)
        };

        let mut atom = Atom::new(name, file, symbol_id);
        atom.size = size;
        // An unaligned tentative definition still gets natural alignment for
        // its size.
        atom.align = if align != 0 {
            align
        } else {
            (64 - size.max(1).leading_zeros()).min(4) as u8
        };
        let atom_id = self.push_atom(atom);
        self.append_atom(section_id, atom_id);
        self.symbol_mut(symbol_id).atom = atom_id;

        if let File::Object(object) = &mut self.files[file.index()] {
            object.atoms.push(atom_id);
        }
    }

    /// Zero-size marker pinned to the start or end of the named section.
    fn create_boundary_atom(&mut self, symbol_id: SymbolId) {
        let Some(spec) = self.side.boundaries.get(&symbol_id) else {
            return;
        };
        let Some(section_name) = spec.section.clone() else {
            return;
        };
        let segment_name = spec.segment.clone();
        let start = spec.start;

        let key = (
            crate::macho::pad_name(&segment_name),
            crate::macho::pad_name(&section_name),
        );
        let Some(section_id) = self
            .sections
            .iter()
            .position(|section| (section.segname, section.sectname) == key)
            .map(|index| crate::layout::SectionId(index as u32))
        else {
            // Nothing contributes to that section; the symbol stays at zero.
            return;
        };

        let name = self.symbol(symbol_id).name;
        let atom = Atom::new(name, FileId::NULL, symbol_id);
        let atom_id = self.push_atom(atom);
        if start {
            self.prepend_atom(section_id, atom_id);
        } else {
            self.append_atom(section_id, atom_id);
        }
        self.symbol_mut(symbol_id).atom = atom_id;
    }

    /// One 8-byte non-lazy pointer per target, created on first demand.
    pub(crate) fn got_entry(&mut self, target: SymbolId) -> AtomId {
        if let Some(atom) = self.got.atom_for(target) {
            return atom;
        }
        let section_id = self.get_or_create_section(
            SEG_DATA_CONST,
            "__got",
            macho::S_NON_LAZY_SYMBOL_POINTERS,
        );
        let atom_id = self.pointer_atom(target, section_id);
        self.got.insert(target, atom_id);
        atom_id
    }

    /// One 8-byte slot per thread-local variable accessed indirectly.
    pub(crate) fn tlv_ptr_entry(&mut self, target: SymbolId) -> AtomId {
        if let Some(atom) = self.tlv.atom_for(target) {
            return atom;
        }
        let section_id = self.get_or_create_section(
            "__DATA",
            "__thread_ptrs",
            macho::S_THREAD_LOCAL_VARIABLE_POINTERS,
        );
        let atom_id = self.pointer_atom(target, section_id);
        self.tlv.insert(target, atom_id);
        atom_id
    }

    fn pointer_atom(&mut self, target: SymbolId, section_id: crate::layout::SectionId) -> AtomId {
        let name = self.symbol(target).name;
        let symbol = {
            let mut symbol = Symbol::new(name);
            symbol.flags.insert(SymbolFlags::LOCAL);
            self.push_symbol(symbol)
        };
        let mut atom = Atom::new(name, FileId::NULL, symbol);
        atom.size = 8;
        atom.align = 3;
        let atom_id = self.push_atom(atom);
        self.symbols[symbol.index()].atom = atom_id;
        self.append_atom(section_id, atom_id);
        atom_id
    }

    /// A stub, its lazy pointer, and its helper entry; plus the helper
    /// preamble, `dyld_private` and the binder GOT slot the first time
    /// through.
    pub(crate) fn stub_entry(&mut self, target: SymbolId) -> AtomId {
        if let Some(atom) = self.stubs.stub_atom(target) {
            return atom;
        }
        self.ensure_stub_infrastructure();

        let arch = self.arch();
        let name = self.symbol(target).name;

        let stubs_section = self.get_or_create_section(
            "__TEXT",
            "__stubs",
            macho::S_SYMBOL_STUBS
                | macho::S_ATTR_PURE_INSTRUCTIONS
                | macho::S_ATTR_SOME_INSTRUCTIONS,
        );
        self.section_mut(stubs_section).reserved2 = arch.stub_size() as u32;
        let stub = self.code_atom(name, stubs_section, arch.stub_size(), arch.stub_alignment());

        let lazy_section = self.get_or_create_section(
            "__DATA",
            "__la_symbol_ptr",
            macho::S_LAZY_SYMBOL_POINTERS,
        );
        let lazy_ptr = self.pointer_atom(target, lazy_section);

        let helper_section = self.get_or_create_section(
            "__TEXT",
            "__stub_helper",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
        );
        let helper = self.code_atom(
            name,
            helper_section,
            arch.stub_helper_entry_size(),
            arch.stub_alignment(),
        );

        let index = self.stubs.entries.len() as u32;
        self.stubs.entries.push(StubEntry {
            target,
            stub,
            lazy_ptr,
            helper,
        });
        self.stubs.lookup.insert(target, index);
        stub
    }

    fn ensure_stub_infrastructure(&mut self) {
        if !self.stub_helper_preamble.is_null() {
            return;
        }
        let arch = self.arch();

        let helper_section = self.get_or_create_section(
            "__TEXT",
            "__stub_helper",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
        );
        let name = self.strings.intern(b"__stub_helper_preamble");
        self.stub_helper_preamble = self.code_atom(
            name,
            helper_section,
            arch.stub_helper_preamble_size(),
            arch.stub_alignment(),
        );

        let data_section = self.get_or_create_section("__DATA", "__data", macho::S_REGULAR);
        let name = self.strings.intern(b"__dyld_private");
        let symbol = {
            let mut symbol = Symbol::new(name);
            symbol.flags.insert(SymbolFlags::LOCAL);
            self.push_symbol(symbol)
        };
        let mut atom = Atom::new(name, FileId::NULL, symbol);
        atom.size = 8;
        atom.align = 3;
        let atom_id = self.push_atom(atom);
        self.symbols[symbol.index()].atom = atom_id;
        self.append_atom(data_section, atom_id);
        self.dyld_private = atom_id;

        // The preamble tail-calls the binder through its GOT slot.
        if !self.stub_binder.is_null() {
            self.got_entry(self.stub_binder);
        }
    }

    pub(crate) fn code_atom(
        &mut self,
        name: crate::intern::StrOffset,
        section_id: crate::layout::SectionId,
        size: u64,
        align: u8,
    ) -> AtomId {
        let symbol = {
            let mut symbol = Symbol::new(name);
            symbol.flags.insert(SymbolFlags::LOCAL);
            self.push_symbol(symbol)
        };
        let mut atom = Atom::new(name, FileId::NULL, symbol);
        atom.size = size;
        atom.align = align;
        let atom_id = self.push_atom(atom);
        self.symbols[symbol.index()].atom = atom_id;
        self.append_atom(section_id, atom_id);
        atom_id
    }

    /// Whether branches to this symbol go through a stub: imports, and weak
    /// references that resolved to nothing (their pointer binds, possibly to
    /// NULL, at runtime).
    pub(crate) fn branch_needs_stub(&self, target: SymbolId) -> bool {
        let symbol = self.symbol(target);
        symbol.is_import()
            || (symbol.atom.is_null() && symbol.flags.contains(SymbolFlags::WEAK_REF))
    }

    /// Exports of this link, used by the trie writer and (for libraries) the
    /// dead-strip roots.
    pub(crate) fn exported_symbols(&self) -> Vec<SymbolId> {
        self.global_list
            .iter()
            .copied()
            .filter(|&id| self.symbol(id).flags.contains(SymbolFlags::EXPORT))
            .collect()
    }
}
