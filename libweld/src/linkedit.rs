//! LINKEDIT payload generation: the dyld rebase/bind/lazy-bind opcode
//! streams, the export trie, function starts, data-in-code, the symbol and
//! string tables and the indirect symbol table. Streams are emitted from
//! fully sorted entry lists so identical inputs give identical bytes.

use crate::atom::AtomId;
use crate::error::Result;
use crate::export_trie::TrieBuilder;
use crate::file::File;
use crate::intern::StringPool;
use crate::layout::SectionId;
use crate::leb::write_sleb128;
use crate::leb::write_uleb128;
use crate::linker::Linker;
use crate::macho::N_DEAD;
use crate::macho::NlistExt;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use byteorder::LittleEndian as LE;
use byteorder::WriteBytesExt;
use object::LittleEndian;
use object::macho;

#[derive(Debug, Clone)]
pub(crate) struct BindEntry {
    pub(crate) target: SymbolId,
    pub(crate) ordinal: i16,
    pub(crate) segment: u8,
    pub(crate) offset: u64,
    pub(crate) addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RebaseEntry {
    pub(crate) segment: u8,
    pub(crate) offset: u64,
}

/// Everything the header writer lays into `__LINKEDIT`, in emission order.
#[derive(Debug, Default)]
pub(crate) struct LinkeditData {
    pub(crate) rebase: Vec<u8>,
    pub(crate) bind: Vec<u8>,
    pub(crate) lazy_bind: Vec<u8>,
    /// Helper atom and the lazy-bind sub-program offset to patch into it.
    pub(crate) lazy_bind_offsets: Vec<(AtomId, u32)>,
    pub(crate) export_trie: Vec<u8>,
    pub(crate) function_starts: Vec<u8>,
    pub(crate) data_in_code: Vec<u8>,
    pub(crate) symtab: Vec<u8>,
    pub(crate) strtab: Vec<u8>,
    pub(crate) nlocalsym: u32,
    pub(crate) nextdefsym: u32,
    pub(crate) nundefsym: u32,
    pub(crate) indirect: Vec<u8>,
    pub(crate) nindirect: u32,
}

impl Linker {
    pub(crate) fn build_linkedit(&mut self) -> Result<LinkeditData> {
        let mut data = LinkeditData::default();

        data.rebase = self.build_rebase_stream();
        data.bind = self.build_bind_stream();
        let (lazy_bind, offsets) = self.build_lazy_bind_stream();
        data.lazy_bind = lazy_bind;
        data.lazy_bind_offsets = offsets;
        data.export_trie = self.build_export_trie();
        data.function_starts = self.build_function_starts();
        data.data_in_code = self.build_data_in_code();

        let symtab = self.build_symtab();
        data.nlocalsym = symtab.nlocalsym;
        data.nextdefsym = symtab.nextdefsym;
        data.nundefsym = symtab.nundefsym;

        let indirect = self.build_indirect_table(&symtab);
        data.nindirect = (indirect.len() / 4) as u32;
        data.indirect = indirect;

        data.symtab = symtab.nlists;
        data.strtab = symtab.strings;

        Ok(data)
    }

    // --- rebase ----------------------------------------------------------

    fn build_rebase_stream(&mut self) -> Vec<u8> {
        let mut entries = std::mem::take(&mut self.rebase_entries);
        entries.sort_unstable();
        entries.dedup();

        let mut out = Vec::new();
        if entries.is_empty() {
            return out;
        }
        out.push(macho::REBASE_OPCODE_SET_TYPE_IMM | macho::REBASE_TYPE_POINTER as u8);

        let mut current_segment = u8::MAX;
        let mut address = 0u64;
        let mut index = 0;
        while index < entries.len() {
            let entry = entries[index];
            if entry.segment != current_segment {
                out.push(macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | entry.segment);
                write_uleb128(&mut out, entry.offset);
                current_segment = entry.segment;
                address = entry.offset;
            } else if entry.offset != address {
                out.push(macho::REBASE_OPCODE_ADD_ADDR_ULEB);
                write_uleb128(&mut out, entry.offset - address);
                address = entry.offset;
            }

            // Count a run of adjacent pointers.
            let mut run = 1;
            while index + run < entries.len()
                && entries[index + run].segment == current_segment
                && entries[index + run].offset == address + 8 * run as u64
            {
                run += 1;
            }
            if run > 1 {
                if run <= 15 {
                    out.push(macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | run as u8);
                } else {
                    out.push(macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
                    write_uleb128(&mut out, run as u64);
                }
                address += 8 * run as u64;
                index += run;
                continue;
            }

            // A lone pointer followed by equally spaced ones compresses into
            // the skipping form.
            let mut stride_entries = 1;
            let stride = entries
                .get(index + 1)
                .filter(|next| next.segment == current_segment && next.offset > address + 8)
                .map(|next| next.offset - address - 8);
            if let Some(skip) = stride {
                while index + stride_entries < entries.len()
                    && entries[index + stride_entries].segment == current_segment
                    && entries[index + stride_entries].offset
                        == address + (8 + skip) * stride_entries as u64
                {
                    stride_entries += 1;
                }
            }
            if let Some(skip) = stride
                && stride_entries > 2
            {
                out.push(macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB);
                write_uleb128(&mut out, stride_entries as u64);
                write_uleb128(&mut out, skip);
                address += (8 + skip) * stride_entries as u64;
                index += stride_entries;
                continue;
            }

            out.push(macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
            address += 8;
            index += 1;
        }
        out.push(macho::REBASE_OPCODE_DONE);
        out
    }

    // --- bind ------------------------------------------------------------

    fn bind_symbol_flags(&self, target: SymbolId) -> u8 {
        if self.symbol(target).flags.contains(SymbolFlags::WEAK_REF) {
            macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT as u8
        } else {
            0
        }
    }

    fn push_ordinal(out: &mut Vec<u8>, ordinal: i16) {
        if ordinal < 0 {
            out.push(macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
                | (ordinal as u8 & macho::BIND_IMMEDIATE_MASK));
        } else if ordinal <= 15 {
            out.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal as u8);
        } else {
            out.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
            write_uleb128(out, ordinal as u64);
        }
    }

    fn build_bind_stream(&mut self) -> Vec<u8> {
        let mut entries = std::mem::take(&mut self.bind_entries);
        // The canonical order that makes output byte-stable.
        entries.sort_by(|a, b| {
            (a.segment, self.symbol_name(a.target), a.offset).cmp(&(
                b.segment,
                self.symbol_name(b.target),
                b.offset,
            ))
        });

        let mut out = Vec::new();
        if entries.is_empty() {
            return out;
        }

        let mut current_segment = u8::MAX;
        let mut current_target = SymbolId::NULL;
        let mut current_addend = 0i64;
        let mut type_set = false;
        let mut address = 0u64;

        let mut index = 0;
        while index < entries.len() {
            let entry = &entries[index];

            if entry.target != current_target {
                Self::push_ordinal(&mut out, entry.ordinal);
                out.push(
                    macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM
                        | self.bind_symbol_flags(entry.target),
                );
                out.extend_from_slice(self.symbol_name(entry.target));
                out.push(0);
                current_target = entry.target;
            }
            if !type_set {
                out.push(macho::BIND_OPCODE_SET_TYPE_IMM | macho::BIND_TYPE_POINTER as u8);
                type_set = true;
            }
            if entry.addend != current_addend {
                out.push(macho::BIND_OPCODE_SET_ADDEND_SLEB);
                write_sleb128(&mut out, entry.addend);
                current_addend = entry.addend;
            }
            if entry.segment != current_segment {
                out.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | entry.segment);
                write_uleb128(&mut out, entry.offset);
                current_segment = entry.segment;
                address = entry.offset;
            } else if entry.offset != address {
                out.push(macho::BIND_OPCODE_ADD_ADDR_ULEB);
                write_uleb128(&mut out, entry.offset.wrapping_sub(address));
                address = entry.offset;
            }

            // Same-target slots at a fixed stride coalesce.
            let same = |other: &BindEntry| {
                other.target == entry.target
                    && other.segment == entry.segment
                    && other.addend == entry.addend
            };
            let mut run = 1;
            while index + run < entries.len()
                && same(&entries[index + run])
                && entries[index + run].offset == address + 8 * run as u64
            {
                run += 1;
            }
            if run > 1 {
                out.push(macho::BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
                write_uleb128(&mut out, run as u64);
                write_uleb128(&mut out, 0);
                address += 8 * run as u64;
                index += run;
                continue;
            }

            match entries.get(index + 1) {
                Some(next)
                    if same(next)
                        && next.offset > address + 8
                        && (next.offset - address - 8) % 8 == 0
                        && (next.offset - address - 8) / 8 <= 15 =>
                {
                    let scaled = (next.offset - address - 8) / 8;
                    out.push(macho::BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | scaled as u8);
                    address += 8 + scaled * 8;
                }
                _ => {
                    out.push(macho::BIND_OPCODE_DO_BIND);
                    address += 8;
                }
            }
            index += 1;
        }
        out.push(macho::BIND_OPCODE_DONE);
        out
    }

    /// One self-contained sub-program per lazy pointer, in stub order; the
    /// recorded start offsets are patched into the stub-helper entries.
    fn build_lazy_bind_stream(&mut self) -> (Vec<u8>, Vec<(AtomId, u32)>) {
        let mut out = Vec::new();
        let mut offsets = Vec::new();

        for index in 0..self.stubs.entries.len() {
            let entry = self.stubs.entries[index];
            offsets.push((entry.helper, out.len() as u32));

            let slot_addr = self.atom_address(entry.lazy_ptr);
            let section_id = self.atom(entry.lazy_ptr).section;
            let segment = self.segment_index_of_section(section_id);
            let seg_offset = slot_addr - self.segments[segment as usize].vmaddr;

            out.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment);
            write_uleb128(&mut out, seg_offset);
            let ordinal = self.side.ordinals.get(&entry.target).copied().unwrap_or(0);
            Self::push_ordinal(&mut out, ordinal);
            out.push(
                macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM
                    | self.bind_symbol_flags(entry.target),
            );
            out.extend_from_slice(self.symbol_name(entry.target));
            out.push(0);
            out.push(macho::BIND_OPCODE_DO_BIND);
            out.push(macho::BIND_OPCODE_DONE);
        }
        (out, offsets)
    }

    // --- exports ----------------------------------------------------------

    fn build_export_trie(&self) -> Vec<u8> {
        let base = self.text_segment_vmaddr();
        let mut exports: Vec<(Vec<u8>, u64, u64)> = self
            .exported_symbols()
            .into_iter()
            .filter(|&id| {
                let symbol = self.symbol(id);
                !symbol.atom.is_null() || id == self.mh_execute_header
            })
            .map(|id| {
                let symbol = self.symbol(id);
                let mut flags = u64::from(macho::EXPORT_SYMBOL_FLAGS_KIND_REGULAR);
                if symbol.is_weak() {
                    flags |= u64::from(macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION);
                }
                if !symbol.atom.is_null() {
                    let section = self.atom(symbol.atom).section;
                    if section != SectionId::NULL
                        && matches!(
                            self.section(section).sect_type(),
                            macho::S_THREAD_LOCAL_VARIABLES
                        )
                    {
                        flags |= u64::from(macho::EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL);
                    }
                }
                (
                    self.symbol_name(id).to_vec(),
                    flags,
                    symbol.value - base,
                )
            })
            .collect();
        exports.sort();

        let mut builder = TrieBuilder::new();
        for (name, flags, address) in &exports {
            builder.insert(name, *flags, *address);
        }
        builder.build()
    }

    // --- function starts --------------------------------------------------

    fn build_function_starts(&self) -> Vec<u8> {
        let base = self.text_segment_vmaddr();
        let mut addresses: Vec<u64> = Vec::new();

        for file in &self.files {
            let File::Object(object) = file else {
                continue;
            };
            for (index, nlist) in object.nlists.iter().enumerate() {
                if !nlist.is_sect() {
                    continue;
                }
                let symbol_id = object.symbols[index];
                if symbol_id.is_null() {
                    continue;
                }
                let symbol = self.symbol(symbol_id);
                if symbol.atom.is_null() || !self.atom(symbol.atom).live {
                    continue;
                }
                let section = self.atom(symbol.atom).section;
                if section == SectionId::NULL || !self.section(section).is_code() {
                    continue;
                }
                addresses.push(symbol.value);
            }
        }
        addresses.sort_unstable();
        addresses.dedup();

        let mut out = Vec::new();
        let mut previous = base;
        for address in addresses {
            write_uleb128(&mut out, address - previous);
            previous = address;
        }
        if !out.is_empty() {
            out.push(0);
        }
        out
    }

    // --- data in code -----------------------------------------------------

    fn build_data_in_code(&self) -> Vec<u8> {
        let mut entries: Vec<(u32, u16, u16)> = Vec::new();
        for file in &self.files {
            let File::Object(object) = file else {
                continue;
            };
            for (ordinal0, slice) in object.section_dice.iter().enumerate() {
                let atom_id = object.section_atoms[ordinal0];
                if atom_id.is_null() || !self.atom(atom_id).live {
                    continue;
                }
                let atom = self.atom(atom_id);
                let section = self.section(atom.section);
                if section.offset == 0 && section.is_zerofill() {
                    continue;
                }
                let input_offset = object.sections[ordinal0].offset.get(LittleEndian);
                for dice in &object.dice[slice.range()] {
                    let out_offset = section.offset + atom.off as u32 + dice.offset - input_offset;
                    entries.push((out_offset, dice.length, dice.kind));
                }
            }
        }
        entries.sort_unstable();

        let mut out = Vec::new();
        for (offset, length, kind) in entries {
            out.write_u32::<LE>(offset).unwrap();
            out.write_u16::<LE>(length).unwrap();
            out.write_u16::<LE>(kind).unwrap();
        }
        out
    }

    // --- symtab -----------------------------------------------------------

    fn output_section_ordinal(&self, id: SectionId) -> u8 {
        self.section_order
            .iter()
            .position(|&other| other == id)
            .map_or(0, |position| position as u8 + 1)
    }

    fn build_symtab(&mut self) -> SymtabData {
        let mut strings = StringPool::new();
        let mut nlists = Vec::new();
        let mut count = 0u32;

        let mut push = |strings: &mut StringPool,
                        nlists: &mut Vec<u8>,
                        count: &mut u32,
                        name: &[u8],
                        n_type: u8,
                        n_sect: u8,
                        n_desc: u16,
                        n_value: u64| {
            let strx = strings.intern(name).0;
            nlists.write_u32::<LE>(strx).unwrap();
            nlists.push(n_type);
            nlists.push(n_sect);
            nlists.write_u16::<LE>(n_desc).unwrap();
            nlists.write_u64::<LE>(n_value).unwrap();
            *count += 1;
        };

        // Stabs open the local range.
        if !self.args.strip {
            self.emit_stabs(&mut strings, &mut nlists, &mut count, &mut push);
        }

        // Object locals, plus private externs demoted to locals.
        for file_index in 1..self.files.len() {
            let File::Object(object) = &self.files[file_index] else {
                continue;
            };
            let file_alive = object.alive;
            for (index, nlist) in object.nlists.iter().enumerate() {
                if !nlist.is_sect() {
                    continue;
                }
                let symbol_id = object.symbols[index];
                if symbol_id.is_null() {
                    continue;
                }
                let symbol = self.symbol(symbol_id);
                if symbol.file.index() != file_index || symbol.nlist_index != index as u32 {
                    continue;
                }
                let is_local_here = symbol.is_local()
                    || symbol.flags.contains(SymbolFlags::PRIVATE_EXTERN);
                if !is_local_here {
                    continue;
                }
                let atom_live =
                    !symbol.atom.is_null() && self.atom(symbol.atom).live && file_alive;
                let n_desc = if atom_live { 0 } else { N_DEAD };
                let n_sect = if symbol.atom.is_null() {
                    0
                } else {
                    self.output_section_ordinal(self.atom(symbol.atom).section)
                };
                let name = self.strings.get(symbol.name).to_vec();
                push(
                    &mut strings,
                    &mut nlists,
                    &mut count,
                    &name,
                    macho::N_SECT,
                    n_sect,
                    n_desc,
                    symbol.value,
                );
            }
        }
        let nlocalsym = count;

        // Exported (external defined) symbols, sorted by name.
        let mut exports: Vec<SymbolId> = self
            .global_list
            .iter()
            .copied()
            .filter(|&id| {
                let symbol = self.symbol(id);
                symbol.flags.contains(SymbolFlags::EXPORT)
                    && (!symbol.atom.is_null()
                        || id == self.mh_execute_header
                        || symbol.flags.contains(SymbolFlags::BOUNDARY))
            })
            .collect();
        exports.sort_by(|&a, &b| self.symbol_name(a).cmp(self.symbol_name(b)));
        for &id in &exports {
            let symbol = self.symbol(id);
            let mut n_desc = 0u16;
            if symbol.is_weak() {
                n_desc |= macho::N_WEAK_DEF;
            }
            if symbol.flags.contains(SymbolFlags::REFERENCED_DYNAMICALLY) {
                n_desc |= macho::REFERENCED_DYNAMICALLY;
            }
            let n_sect = if symbol.atom.is_null() {
                1 // the image base lands in the first section's segment
            } else {
                self.output_section_ordinal(self.atom(symbol.atom).section)
            };
            let name = self.strings.get(symbol.name).to_vec();
            push(
                &mut strings,
                &mut nlists,
                &mut count,
                &name,
                macho::N_SECT | macho::N_EXT,
                n_sect,
                n_desc,
                symbol.value,
            );
        }
        let nextdefsym = count - nlocalsym;

        // Imports, sorted by name; their order defines indirect indexes.
        let mut imports: Vec<SymbolId> = self
            .global_list
            .iter()
            .copied()
            .filter(|&id| self.symbol(id).is_import())
            .collect();
        imports.sort_by(|&a, &b| self.symbol_name(a).cmp(self.symbol_name(b)));
        let mut import_index = foldhash::HashMap::default();
        for (position, &id) in imports.iter().enumerate() {
            import_index.insert(id, nlocalsym + nextdefsym + position as u32);
            let symbol = self.symbol(id);
            // Negative (special) ordinals keep their byte pattern, so
            // dynamic lookup shows up as 0xfe.
            let ordinal_byte = self.side.ordinals.get(&id).copied().unwrap_or(0) as u8;
            let mut n_desc = u16::from(ordinal_byte) << 8;
            if symbol.flags.contains(SymbolFlags::WEAK_REF) {
                n_desc |= macho::N_WEAK_REF;
            }
            let name = self.strings.get(symbol.name).to_vec();
            push(
                &mut strings,
                &mut nlists,
                &mut count,
                &name,
                macho::N_UNDF | macho::N_EXT,
                0,
                n_desc,
                0,
            );
        }
        let nundefsym = count - nlocalsym - nextdefsym;

        SymtabData {
            nlists,
            strings: strings_into_bytes(strings),
            nlocalsym,
            nextdefsym,
            nundefsym,
            import_index,
        }
    }

    fn emit_stabs<F>(
        &self,
        strings: &mut StringPool,
        nlists: &mut Vec<u8>,
        count: &mut u32,
        push: &mut F,
    ) where
        F: FnMut(&mut StringPool, &mut Vec<u8>, &mut u32, &[u8], u8, u8, u16, u64),
    {
        for file in &self.files {
            let File::Object(object) = file else {
                continue;
            };
            let Some(dwarf) = &object.dwarf else {
                continue;
            };
            if !object.alive {
                continue;
            }

            let mut comp_dir = dwarf.comp_dir.clone();
            if comp_dir.last() != Some(&b'/') {
                comp_dir.push(b'/');
            }
            push(strings, nlists, count, &comp_dir, macho::N_SO, 0, 0, 0);
            push(strings, nlists, count, &dwarf.tu_name, macho::N_SO, 0, 0, 0);
            let oso_name = object.display_name().into_bytes();
            push(
                strings,
                nlists,
                count,
                &oso_name,
                macho::N_OSO,
                0,
                1,
                object.mtime,
            );

            for (index, nlist) in object.nlists.iter().enumerate() {
                if !nlist.is_sect() {
                    continue;
                }
                let symbol_id = object.symbols[index];
                if symbol_id.is_null() {
                    continue;
                }
                let symbol = self.symbol(symbol_id);
                if symbol.file != object.index || symbol.nlist_index != index as u32 {
                    continue;
                }
                if symbol.atom.is_null() || !self.atom(symbol.atom).live {
                    continue;
                }
                let section_id = self.atom(symbol.atom).section;
                if section_id == SectionId::NULL {
                    continue;
                }
                let ordinal = self.output_section_ordinal(section_id);
                let name = self.strings.get(symbol.name).to_vec();

                if self.section(section_id).is_code() {
                    // N_BNSYM/N_FUN(name)/N_FUN(size)/N_ENSYM bracket.
                    let size = self.atom(symbol.atom).size;
                    push(
                        strings,
                        nlists,
                        count,
                        b"",
                        macho::N_BNSYM,
                        ordinal,
                        0,
                        symbol.value,
                    );
                    push(
                        strings,
                        nlists,
                        count,
                        &name,
                        macho::N_FUN,
                        ordinal,
                        0,
                        symbol.value,
                    );
                    push(strings, nlists, count, b"", macho::N_FUN, 0, 0, size);
                    push(strings, nlists, count, b"", macho::N_ENSYM, ordinal, 0, size);
                } else if symbol.is_local() {
                    push(
                        strings,
                        nlists,
                        count,
                        &name,
                        macho::N_STSYM,
                        ordinal,
                        0,
                        symbol.value,
                    );
                } else {
                    push(strings, nlists, count, &name, macho::N_GSYM, 0, 0, 0);
                }
            }

            // Closing SO.
            push(strings, nlists, count, b"", macho::N_SO, 1, 0, 0);
        }
    }

    // --- indirect symbol table --------------------------------------------

    fn build_indirect_table(&mut self, symtab: &SymtabData) -> Vec<u8> {
        let mut out = Vec::new();
        let mut next_index = 0u32;

        let import_of = |linker: &Linker, target: SymbolId| -> u32 {
            symtab
                .import_index
                .get(&target)
                .copied()
                .unwrap_or_else(|| {
                    debug_assert!(
                        !linker.symbol(target).is_import(),
                        "import missing from symtab"
                    );
                    macho::INDIRECT_SYMBOL_LOCAL
                })
        };

        // __stubs
        if !self.stubs.entries.is_empty() {
            let section_id = self.atom(self.stubs.entries[0].stub).section;
            self.section_mut(section_id).reserved1 = next_index;
            for index in 0..self.stubs.entries.len() {
                let target = self.stubs.entries[index].target;
                out.write_u32::<LE>(import_of(self, target)).unwrap();
            }
            next_index += self.stubs.entries.len() as u32;
        }

        // __got
        if !self.got.entries.is_empty() {
            let section_id = self.atom(self.got.entries[0].atom).section;
            self.section_mut(section_id).reserved1 = next_index;
            for index in 0..self.got.len() {
                let entry = self.got.entries[index];
                let value = if self.symbol(entry.target).is_import() {
                    import_of(self, entry.target)
                } else {
                    macho::INDIRECT_SYMBOL_LOCAL
                };
                out.write_u32::<LE>(value).unwrap();
            }
            next_index += self.got.len() as u32;
        }

        // __la_symbol_ptr
        if !self.stubs.entries.is_empty() {
            let section_id = self.atom(self.stubs.entries[0].lazy_ptr).section;
            self.section_mut(section_id).reserved1 = next_index;
            for index in 0..self.stubs.entries.len() {
                let target = self.stubs.entries[index].target;
                out.write_u32::<LE>(import_of(self, target)).unwrap();
            }
        }

        out
    }

}

pub(crate) struct SymtabData {
    pub(crate) nlists: Vec<u8>,
    pub(crate) strings: Vec<u8>,
    pub(crate) nlocalsym: u32,
    pub(crate) nextdefsym: u32,
    pub(crate) nundefsym: u32,
    pub(crate) import_index: foldhash::HashMap<SymbolId, u32>,
}

/// The pool's backing buffer already has Mach-O string table layout: offset
/// 0 is the empty string, entries are NUL-terminated.
fn strings_into_bytes(pool: StringPool) -> Vec<u8> {
    pool.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb::read_sleb128;
    use crate::leb::read_uleb128;

    /// Reference interpreter for the rebase opcodes we emit.
    fn run_rebase(stream: &[u8]) -> Vec<(u8, u64)> {
        let mut rebases = Vec::new();
        let mut segment = 0u8;
        let mut address = 0u64;
        let mut pos = 0;
        while pos < stream.len() {
            let byte = stream[pos];
            pos += 1;
            let opcode = byte & macho::REBASE_OPCODE_MASK;
            let imm = byte & macho::REBASE_IMMEDIATE_MASK;
            match opcode {
                macho::REBASE_OPCODE_DONE => break,
                macho::REBASE_OPCODE_SET_TYPE_IMM => {}
                macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment = imm;
                    address = read_uleb128(stream, &mut pos).unwrap();
                }
                macho::REBASE_OPCODE_ADD_ADDR_ULEB => {
                    address += read_uleb128(stream, &mut pos).unwrap();
                }
                macho::REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    address += u64::from(imm) * 8;
                }
                macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    for _ in 0..imm {
                        rebases.push((segment, address));
                        address += 8;
                    }
                }
                macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let times = read_uleb128(stream, &mut pos).unwrap();
                    for _ in 0..times {
                        rebases.push((segment, address));
                        address += 8;
                    }
                }
                macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let times = read_uleb128(stream, &mut pos).unwrap();
                    let skip = read_uleb128(stream, &mut pos).unwrap();
                    for _ in 0..times {
                        rebases.push((segment, address));
                        address += 8 + skip;
                    }
                }
                other => panic!("unexpected rebase opcode {other:#x}"),
            }
        }
        rebases
    }

    /// Reference interpreter for the bind opcodes we emit.
    fn run_bind(stream: &[u8]) -> Vec<(u8, u64, i64, Vec<u8>, i64, bool)> {
        let mut binds = Vec::new();
        let mut segment = 0u8;
        let mut address = 0u64;
        let mut ordinal = 0i64;
        let mut addend = 0i64;
        let mut name = Vec::new();
        let mut weak = false;
        let mut pos = 0;
        while pos < stream.len() {
            let byte = stream[pos];
            pos += 1;
            let opcode = byte & macho::BIND_OPCODE_MASK;
            let imm = byte & macho::BIND_IMMEDIATE_MASK;
            match opcode {
                macho::BIND_OPCODE_DONE => break,
                macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = i64::from(imm),
                macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    ordinal = read_uleb128(stream, &mut pos).unwrap() as i64;
                }
                macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    ordinal = if imm == 0 {
                        0
                    } else {
                        i64::from(imm as i8 | !(macho::BIND_IMMEDIATE_MASK as i8))
                    };
                }
                macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    weak = imm & macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT as u8 != 0;
                    let start = pos;
                    while stream[pos] != 0 {
                        pos += 1;
                    }
                    name = stream[start..pos].to_vec();
                    pos += 1;
                }
                macho::BIND_OPCODE_SET_TYPE_IMM => {}
                macho::BIND_OPCODE_SET_ADDEND_SLEB => {
                    addend = read_sleb128(stream, &mut pos).unwrap();
                }
                macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment = imm;
                    address = read_uleb128(stream, &mut pos).unwrap();
                }
                macho::BIND_OPCODE_ADD_ADDR_ULEB => {
                    address = address.wrapping_add(read_uleb128(stream, &mut pos).unwrap());
                }
                macho::BIND_OPCODE_DO_BIND => {
                    binds.push((segment, address, ordinal, name.clone(), addend, weak));
                    address += 8;
                }
                macho::BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    binds.push((segment, address, ordinal, name.clone(), addend, weak));
                    address = address
                        .wrapping_add(8)
                        .wrapping_add(read_uleb128(stream, &mut pos).unwrap());
                }
                macho::BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    binds.push((segment, address, ordinal, name.clone(), addend, weak));
                    address += 8 + u64::from(imm) * 8;
                }
                macho::BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let times = read_uleb128(stream, &mut pos).unwrap();
                    let skip = read_uleb128(stream, &mut pos).unwrap();
                    for _ in 0..times {
                        binds.push((segment, address, ordinal, name.clone(), addend, weak));
                        address += 8 + skip;
                    }
                }
                other => panic!("unexpected bind opcode {other:#x}"),
            }
        }
        binds
    }

    fn linker_with_rebases(entries: &[(u8, u64)]) -> Linker {
        let mut linker = Linker::new(crate::args::Args::default());
        linker.rebase_entries = entries
            .iter()
            .map(|&(segment, offset)| RebaseEntry { segment, offset })
            .collect();
        linker
    }

    #[test]
    fn rebase_stream_round_trips_and_compresses() {
        // Adjacent run, a gap, a strided group, and a segment switch.
        let entries: Vec<(u8, u64)> = vec![
            (1, 0x0),
            (1, 0x8),
            (1, 0x10),
            (1, 0x40),
            (1, 0x60),
            (1, 0x80),
            (1, 0xa0),
            (2, 0x18),
        ];
        let mut linker = linker_with_rebases(&entries);
        let stream = linker.build_rebase_stream();
        assert_eq!(run_rebase(&stream), entries);
        // The run must not be emitted one pointer at a time.
        let do_ops = stream
            .iter()
            .filter(|&&byte| {
                matches!(
                    byte & macho::REBASE_OPCODE_MASK,
                    macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES
                        | macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES
                        | macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB
                )
            })
            .count();
        assert!(do_ops <= 4, "expected coalescing, got {do_ops} DO ops");
    }

    #[test]
    fn rebase_entries_are_deduplicated_and_sorted() {
        let mut linker = linker_with_rebases(&[(1, 0x10), (1, 0x8), (1, 0x10)]);
        let stream = linker.build_rebase_stream();
        assert_eq!(run_rebase(&stream), vec![(1, 0x8), (1, 0x10)]);
    }

    #[test]
    fn empty_streams_are_empty() {
        let mut linker = linker_with_rebases(&[]);
        assert!(linker.build_rebase_stream().is_empty());
        assert!(linker.build_bind_stream().is_empty());
    }

    fn import_symbol(linker: &mut Linker, name: &[u8], ordinal: i16) -> SymbolId {
        let interned = linker.strings.intern(name);
        let mut symbol = crate::symbol::Symbol::new(interned);
        symbol.flags.insert(SymbolFlags::IMPORT);
        let id = linker.push_symbol(symbol);
        linker.side.ordinals.insert(id, ordinal);
        id
    }

    #[test]
    fn bind_stream_round_trips_sorted_by_segment_name_offset() {
        let mut linker = Linker::new(crate::args::Args::default());
        let puts = import_symbol(&mut linker, b"_puts", 1);
        let missing = import_symbol(&mut linker, b"_missing", -2);

        linker.bind_entries = vec![
            BindEntry {
                target: puts,
                ordinal: 1,
                segment: 2,
                offset: 0x10,
                addend: 0,
            },
            BindEntry {
                target: missing,
                ordinal: -2,
                segment: 2,
                offset: 0x8,
                addend: 0,
            },
            BindEntry {
                target: puts,
                ordinal: 1,
                segment: 2,
                offset: 0x18,
                addend: 0,
            },
            BindEntry {
                target: puts,
                ordinal: 1,
                segment: 3,
                offset: 0x0,
                addend: 16,
            },
        ];
        let stream = linker.build_bind_stream();
        let binds = run_bind(&stream);

        // (segment, name, offset) order.
        assert_eq!(
            binds
                .iter()
                .map(|(seg, off, ord, name, addend, _)| (
                    *seg,
                    name.clone(),
                    *off,
                    *ord,
                    *addend
                ))
                .collect::<Vec<_>>(),
            vec![
                (2, b"_missing".to_vec(), 0x8, -2, 0),
                (2, b"_puts".to_vec(), 0x10, 1, 0),
                (2, b"_puts".to_vec(), 0x18, 1, 0),
                (3, b"_puts".to_vec(), 0x0, 1, 16),
            ]
        );
    }

    #[test]
    fn flat_lookup_ordinal_uses_the_special_form() {
        let mut linker = Linker::new(crate::args::Args::default());
        let missing = import_symbol(&mut linker, b"_missing", -2);
        linker.bind_entries = vec![BindEntry {
            target: missing,
            ordinal: -2,
            segment: 1,
            offset: 0,
            addend: 0,
        }];
        let stream = linker.build_bind_stream();
        assert!(stream.iter().any(|&byte| {
            byte & macho::BIND_OPCODE_MASK == macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
        }));
        let binds = run_bind(&stream);
        assert_eq!(binds[0].2, -2);
        assert!(!binds[0].5, "no weak-import flag for dynamic lookup");
    }
}
