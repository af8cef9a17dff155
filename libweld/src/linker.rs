//! The `Linker` value: owner of every arena (files, atoms, symbols, sections,
//! indirect tables) and driver of the single-pass pipeline. Two links in one
//! process are fully independent.

use crate::arch::Arch;
use crate::archive::Archive;
use crate::args::Args;
use crate::atom::Atom;
use crate::atom::AtomId;
use crate::dylib::Dylib;
use crate::error::DuplicateSymbol;
use crate::error::Error;
use crate::error::Result;
use crate::file::File;
use crate::file::FileId;
use crate::input_data;
use crate::intern::StrOffset;
use crate::intern::StringPool;
use crate::layout::OutputSection;
use crate::layout::SectionId;
use crate::layout::Segment;
use crate::linkedit::BindEntry;
use crate::linkedit::RebaseEntry;
use crate::macho::SectionExt;
use crate::object_file::Object;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use crate::symbol::SymbolSideTables;
use crate::synthetic::IndirectTable;
use crate::synthetic::StubTable;
use crate::thunks::Thunk;
use object::LittleEndian;
use std::path::Path;

pub(crate) struct Linker {
    pub(crate) args: Args,
    pub(crate) strings: StringPool,
    /// Index 0 is `File::Internal`, owner of synthesized atoms and symbols.
    pub(crate) files: Vec<File>,
    /// Index 0 is the null atom.
    pub(crate) atoms: Vec<Atom>,
    /// Index 0 is the null symbol.
    pub(crate) symbols: Vec<Symbol>,
    /// Interned name to the unique global symbol of that name.
    pub(crate) globals: foldhash::HashMap<StrOffset, SymbolId>,
    /// Globals in first-seen order, the iteration order for every pass.
    pub(crate) global_list: Vec<SymbolId>,
    /// Undefined references in first-seen order.
    pub(crate) unresolved: Vec<SymbolId>,
    /// Strong/strong clashes accumulate here so they can be reported as one
    /// error.
    pub(crate) dupes: Vec<DuplicateSymbol>,
    pub(crate) side: SymbolSideTables,

    pub(crate) sections: Vec<OutputSection>,
    section_lookup: foldhash::HashMap<([u8; 16], [u8; 16]), SectionId>,
    /// Non-empty sections in output order, established by the allocator.
    /// `SectionId`s index `sections` and stay stable; only this order moves.
    pub(crate) section_order: Vec<SectionId>,
    pub(crate) segments: Vec<Segment>,

    pub(crate) got: IndirectTable,
    pub(crate) tlv: IndirectTable,
    pub(crate) stubs: StubTable,
    pub(crate) thunks: Vec<Thunk>,
    pub(crate) stub_helper_preamble: AtomId,
    pub(crate) dyld_private: AtomId,

    pub(crate) entry_symbol: SymbolId,
    pub(crate) mh_execute_header: SymbolId,
    pub(crate) dso_handle: SymbolId,
    pub(crate) stub_binder: SymbolId,

    /// Pointer fixups collected while resolving relocations.
    pub(crate) bind_entries: Vec<BindEntry>,
    pub(crate) rebase_entries: Vec<RebaseEntry>,
}

impl Linker {
    pub(crate) fn new(args: Args) -> Linker {
        let mut strings = StringPool::new();
        let null_symbol = Symbol::new(strings.intern(b""));
        Linker {
            args,
            strings,
            files: vec![File::Internal],
            atoms: vec![Atom::new(StrOffset::EMPTY, FileId::NULL, SymbolId::NULL)],
            symbols: vec![null_symbol],
            globals: foldhash::HashMap::default(),
            global_list: Vec::new(),
            unresolved: Vec::new(),
            dupes: Vec::new(),
            side: SymbolSideTables::default(),
            sections: Vec::new(),
            section_lookup: foldhash::HashMap::default(),
            section_order: Vec::new(),
            segments: Vec::new(),
            got: IndirectTable::default(),
            tlv: IndirectTable::default(),
            stubs: StubTable::default(),
            thunks: Vec::new(),
            stub_helper_preamble: AtomId::NULL,
            dyld_private: AtomId::NULL,
            entry_symbol: SymbolId::NULL,
            mh_execute_header: SymbolId::NULL,
            dso_handle: SymbolId::NULL,
            stub_binder: SymbolId::NULL,
            bind_entries: Vec::new(),
            rebase_entries: Vec::new(),
        }
    }

    /// Runs the whole link and writes the output file.
    pub(crate) fn flush(mut self) -> Result {
        self.add_inputs()?;
        self.resolve_symbols()?;
        if self.args.dead_strip {
            self.dead_strip();
        }
        self.create_synthetic_atoms()?;
        self.scan_relocs()?;
        self.allocate()?;
        let mut out = vec![0u8; self.content_file_size()];
        self.resolve_relocs(&mut out)?;
        self.write_output(out)
    }

    pub(crate) fn arch(&self) -> Arch {
        self.args.target.arch
    }

    // --- arena access -----------------------------------------------------

    pub(crate) fn atom(&self, id: AtomId) -> &Atom {
        &self.atoms[id.index()]
    }

    pub(crate) fn atom_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.atoms[id.index()]
    }

    pub(crate) fn push_atom(&mut self, atom: Atom) -> AtomId {
        let id = AtomId(self.atoms.len() as u32);
        self.atoms.push(atom);
        id
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub(crate) fn push_symbol(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        id
    }

    pub(crate) fn symbol_name(&self, id: SymbolId) -> &[u8] {
        self.strings.get(self.symbol(id).name)
    }

    pub(crate) fn object(&self, id: FileId) -> &Object {
        self.files[id.index()].as_object().expect("not an object")
    }

    pub(crate) fn object_mut(&mut self, id: FileId) -> &mut Object {
        self.files[id.index()]
            .as_object_mut()
            .expect("not an object")
    }

    /// The address an atom landed at, valid after allocation.
    pub(crate) fn atom_address(&self, id: AtomId) -> u64 {
        let atom = self.atom(id);
        self.sections[atom.section.index()].addr + atom.off
    }

    pub(crate) fn file_display(&self, id: FileId) -> String {
        match &self.files[id.index()] {
            File::Object(object) => object.display_name(),
            other => other.path().display().to_string(),
        }
    }

    // --- output sections --------------------------------------------------

    pub(crate) fn section(&self, id: SectionId) -> &OutputSection {
        &self.sections[id.index()]
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut OutputSection {
        &mut self.sections[id.index()]
    }

    /// Finds or creates the output section keyed by `(segname, sectname)`.
    pub(crate) fn get_or_create_section(
        &mut self,
        segname: &str,
        sectname: &str,
        flags: u32,
    ) -> SectionId {
        let key = (crate::macho::pad_name(segname), crate::macho::pad_name(sectname));
        if let Some(&id) = self.section_lookup.get(&key) {
            return id;
        }
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(OutputSection::new(key.0, key.1, flags));
        self.section_lookup.insert(key, id);
        id
    }

    /// Appends an atom to a section's sibling list.
    pub(crate) fn append_atom(&mut self, section_id: SectionId, atom_id: AtomId) {
        let last = self.sections[section_id.index()].last_atom;
        {
            let atom = self.atom_mut(atom_id);
            atom.section = section_id;
            atom.prev = last;
            atom.next = AtomId::NULL;
        }
        if last.is_null() {
            self.sections[section_id.index()].first_atom = atom_id;
        } else {
            self.atoms[last.index()].next = atom_id;
        }
        self.sections[section_id.index()].last_atom = atom_id;
    }

    /// Prepends an atom, used for `*$start$*` boundary placement.
    pub(crate) fn prepend_atom(&mut self, section_id: SectionId, atom_id: AtomId) {
        let first = self.sections[section_id.index()].first_atom;
        {
            let atom = self.atom_mut(atom_id);
            atom.section = section_id;
            atom.next = first;
            atom.prev = AtomId::NULL;
        }
        let section = &mut self.sections[section_id.index()];
        section.first_atom = atom_id;
        if first.is_null() {
            section.last_atom = atom_id;
        } else {
            self.atoms[first.index()].prev = atom_id;
        }
    }

    /// Iterates a section's atoms in list order.
    pub(crate) fn section_atoms(&self, section_id: SectionId) -> SectionAtomIter<'_> {
        SectionAtomIter {
            linker: self,
            next: self.sections[section_id.index()].first_atom,
        }
    }

    // --- input ingestion --------------------------------------------------

    /// Reads every positional and searched input, in discovery order.
    pub(crate) fn add_inputs(&mut self) -> Result {
        let positionals = self.args.positionals.clone();
        for positional in &positionals {
            self.add_path(&positional.path, positional.must_link, false)?;
        }
        let libs = self.args.libs.clone();
        for lib in &libs {
            let path = input_data::find_library(&self.args, &lib.name)?;
            self.add_path(&path, false, lib.weak)?;
        }
        let frameworks = self.args.frameworks.clone();
        for framework in &frameworks {
            let path = input_data::find_framework(&self.args, &framework.name)?;
            self.add_path(&path, false, framework.weak)?;
        }
        Ok(())
    }

    /// Classifies one path by peeking its magic: archive, Mach-O object or
    /// dylib, else a text stub. Binary dylib parsing falls back to the text
    /// stub parser on a format rejection.
    fn add_path(&mut self, path: &Path, must_link: bool, weak: bool) -> Result<FileId> {
        let whole = input_data::read_file(path)?;
        let mtime = input_data::file_mtime(path);
        let data = match input_data::fat_slice(&whole, self.arch(), path)? {
            Some(range) => whole[range].to_vec(),
            None => whole,
        };

        if data.starts_with(crate::archive::ARCHIVE_MAGIC) {
            let archive = Archive::parse(data, path.to_path_buf(), must_link)?;
            return self.add_archive(archive);
        }

        let magic = data
            .get(..4)
            .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap()));
        if magic == Some(object::macho::MH_MAGIC_64) {
            let filetype = data
                .get(12..16)
                .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap()))
                .ok_or(Error::EndOfStream)?;
            if filetype == object::macho::MH_OBJECT {
                let object = Object::parse(data, path.to_path_buf(), None, mtime, self.arch())?;
                return Ok(self.add_object(object));
            }
            let dylib = Dylib::parse_binary(&data, path.to_path_buf(), weak, self.arch())?;
            return Ok(self.add_dylib(dylib));
        }

        match Dylib::parse_tbd(&data, path.to_path_buf(), weak) {
            Ok(dylib) => Ok(self.add_dylib(dylib)),
            Err(error) if error.is_format_rejection() => Err(Error::NotObject),
            Err(error) => Err(error),
        }
    }

    fn push_file(&mut self, file: File) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(file);
        id
    }

    /// Attaches a parsed object: registers it in the file vector and
    /// materializes one atom (and its section symbol) per non-debug input
    /// section.
    pub(crate) fn add_object(&mut self, mut object: Object) -> FileId {
        let id = FileId(self.files.len() as u32);
        object.index = id;

        for ordinal0 in 0..object.sections.len() {
            let section = object.sections[ordinal0];
            if section.is_debug() {
                continue;
            }

            let seg = String::from_utf8_lossy(section.seg_name()).into_owned();
            let sect = String::from_utf8_lossy(section.sect_name()).into_owned();
            let atom_name = self.strings.intern(format!("{seg}${sect}").as_bytes());

            let section_id =
                self.get_or_create_section(&seg, &sect, section.flags.get(LittleEndian));

            let mut symbol = Symbol::new(atom_name);
            symbol.value = section.addr.get(LittleEndian);
            symbol.file = id;
            symbol.flags.insert(SymbolFlags::LOCAL);
            let symbol_id = self.push_symbol(symbol);

            let mut atom = Atom::new(atom_name, id, symbol_id);
            atom.n_sect = ordinal0 as u32 + 1;
            atom.size = section.size.get(LittleEndian);
            atom.align = section.align.get(LittleEndian).min(63) as u8;
            atom.relocs = object.section_relocs[ordinal0];
            atom.dice = object.section_dice[ordinal0];
            let atom_id = self.push_atom(atom);
            self.symbols[symbol_id.index()].atom = atom_id;

            self.append_atom(section_id, atom_id);
            object.section_atoms[ordinal0] = atom_id;
            object.atoms.push(atom_id);
        }

        tracing::debug!(
            "object {}: {} sections, {} symbols",
            object.display_name(),
            object.sections.len(),
            object.nlists.len()
        );
        self.push_file(File::Object(object))
    }

    fn add_archive(&mut self, mut archive: Archive) -> Result<FileId> {
        let id = FileId(self.files.len() as u32);
        archive.index = id;
        let force_load = archive.force_load;
        let path = archive.path.clone();
        let file_id = self.push_file(File::Archive(archive));

        if force_load {
            let offsets = match &self.files[file_id.index()] {
                File::Archive(archive) => archive.member_offsets()?,
                _ => unreachable!(),
            };
            for offset in offsets {
                self.load_archive_member(file_id, offset, &path)?;
            }
        }
        Ok(file_id)
    }

    /// Parses one archive member as an object. Quietly skips non-object
    /// members (archives ship odd members such as symbol tables).
    pub(crate) fn load_archive_member(
        &mut self,
        archive_id: FileId,
        offset: u64,
        archive_path: &Path,
    ) -> Result<Option<FileId>> {
        let member = {
            let File::Archive(archive) = &mut self.files[archive_id.index()] else {
                unreachable!();
            };
            archive.pull_member(offset)?
        };
        let Some(member) = member else {
            return Ok(None);
        };

        let mtime = member.mtime;
        match Object::parse(
            member.data,
            member.name,
            Some(archive_path.to_path_buf()),
            mtime,
            self.arch(),
        ) {
            Ok(object) => {
                self.files[archive_id.index()].set_alive();
                Ok(Some(self.add_object(object)))
            }
            Err(error) if error.is_format_rejection() => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn add_dylib(&mut self, mut dylib: Dylib) -> FileId {
        let id = FileId(self.files.len() as u32);
        dylib.index = id;
        tracing::debug!("dylib {} ({})", dylib.install_name, dylib.path.display());
        self.push_file(File::Dylib(dylib))
    }

    /// Assigns (or returns) the load ordinal of a dylib. Flat namespace
    /// forces the flat-lookup special ordinal.
    pub(crate) fn dylib_ordinal(&mut self, id: FileId) -> i16 {
        if self.args.namespace == crate::args::Namespace::Flat {
            return i16::from(object::macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP);
        }
        let next = self
            .files
            .iter()
            .filter_map(|file| match file {
                File::Dylib(dylib) => dylib.ordinal,
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        let dylib = self.files[id.index()].as_dylib_mut().expect("not a dylib");
        *dylib.ordinal.get_or_insert(next) as i16
    }

    /// Dylibs that were actually referenced, in ordinal order.
    pub(crate) fn loaded_dylibs(&self) -> Vec<FileId> {
        let mut loaded: Vec<(u16, FileId)> = self
            .files
            .iter()
            .enumerate()
            .filter_map(|(index, file)| match file {
                File::Dylib(dylib) if dylib.alive => {
                    dylib.ordinal.map(|ordinal| (ordinal, FileId(index as u32)))
                }
                _ => None,
            })
            .collect();
        loaded.sort_unstable();
        loaded.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn path_basename(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_string())
    }

    /// File size of everything before the LINKEDIT payload, valid after
    /// allocation.
    fn content_file_size(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| (segment.fileoff + segment.filesize) as usize)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn report_unresolved(&self) -> Error {
        let mut list = Vec::new();
        for &id in &self.unresolved {
            let symbol = self.symbol(id);
            list.push(crate::error::UndefinedSymbol {
                name: String::from_utf8_lossy(self.symbol_name(id)).into_owned(),
                referenced_in: self.file_display(symbol.file),
            });
        }
        Error::UndefinedSymbolReference(list)
    }
}

pub(crate) struct SectionAtomIter<'a> {
    linker: &'a Linker,
    next: AtomId,
}

impl Iterator for SectionAtomIter<'_> {
    type Item = AtomId;

    fn next(&mut self) -> Option<AtomId> {
        if self.next.is_null() {
            return None;
        }
        let current = self.next;
        self.next = self.linker.atom(current).next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::PositionalInput;
    use crate::macho::MachHeader64;
    use crate::macho::Section64;
    use crate::macho::SectionExt;
    use crate::macho::SegmentCommand64;
    use crate::macho::pod_at;
    use crate::macho::pod_slice_at;
    use byteorder::LittleEndian as LE;
    use byteorder::WriteBytesExt;
    use object::macho;
    use std::path::PathBuf;

    struct TestNlist {
        name: &'static str,
        n_type: u8,
        n_sect: u8,
        n_desc: u16,
        n_value: u64,
    }

    struct TestReloc {
        address: u32,
        symbolnum: u32,
        pcrel: bool,
        length: u8,
        is_extern: bool,
        r_type: u8,
    }

    /// Emits a minimal one-section MH_OBJECT for x86_64.
    fn build_object(
        code: &[u8],
        sectname: &str,
        sect_flags: u32,
        nlists: &[TestNlist],
        relocs: &[TestReloc],
    ) -> Vec<u8> {
        let sizeofcmds = (72 + 80 + 24) as u32;
        let code_off = 32 + sizeofcmds;
        let reloc_off = code_off + code.len() as u32;
        let sym_off = reloc_off + relocs.len() as u32 * 8;
        let str_off = sym_off + nlists.len() as u32 * 16;

        let mut strtab = vec![0u8];
        let mut strx = Vec::new();
        for nlist in nlists {
            strx.push(strtab.len() as u32);
            strtab.extend_from_slice(nlist.name.as_bytes());
            strtab.push(0);
        }

        let mut out = Vec::new();
        out.write_u32::<LE>(macho::MH_MAGIC_64).unwrap();
        out.write_u32::<LE>(macho::CPU_TYPE_X86_64).unwrap();
        out.write_u32::<LE>(macho::CPU_SUBTYPE_X86_64_ALL).unwrap();
        out.write_u32::<LE>(macho::MH_OBJECT).unwrap();
        out.write_u32::<LE>(2).unwrap();
        out.write_u32::<LE>(sizeofcmds).unwrap();
        out.write_u32::<LE>(0).unwrap();
        out.write_u32::<LE>(0).unwrap();

        out.write_u32::<LE>(macho::LC_SEGMENT_64).unwrap();
        out.write_u32::<LE>(72 + 80).unwrap();
        out.extend_from_slice(&crate::macho::pad_name(""));
        out.write_u64::<LE>(0).unwrap();
        out.write_u64::<LE>(code.len() as u64).unwrap();
        out.write_u64::<LE>(u64::from(code_off)).unwrap();
        out.write_u64::<LE>(code.len() as u64).unwrap();
        out.write_u32::<LE>(7).unwrap();
        out.write_u32::<LE>(7).unwrap();
        out.write_u32::<LE>(1).unwrap();
        out.write_u32::<LE>(0).unwrap();

        out.extend_from_slice(&crate::macho::pad_name(sectname));
        out.extend_from_slice(&crate::macho::pad_name("__TEXT"));
        out.write_u64::<LE>(0).unwrap(); // addr
        out.write_u64::<LE>(code.len() as u64).unwrap();
        out.write_u32::<LE>(code_off).unwrap();
        out.write_u32::<LE>(4).unwrap(); // align
        out.write_u32::<LE>(reloc_off).unwrap();
        out.write_u32::<LE>(relocs.len() as u32).unwrap();
        out.write_u32::<LE>(sect_flags).unwrap();
        out.write_u32::<LE>(0).unwrap();
        out.write_u32::<LE>(0).unwrap();
        out.write_u32::<LE>(0).unwrap();

        out.write_u32::<LE>(macho::LC_SYMTAB).unwrap();
        out.write_u32::<LE>(24).unwrap();
        out.write_u32::<LE>(sym_off).unwrap();
        out.write_u32::<LE>(nlists.len() as u32).unwrap();
        out.write_u32::<LE>(str_off).unwrap();
        out.write_u32::<LE>(strtab.len() as u32).unwrap();

        assert_eq!(out.len() as u32, code_off);
        out.extend_from_slice(code);

        for reloc in relocs {
            out.write_u32::<LE>(reloc.address).unwrap();
            let mut word = reloc.symbolnum & 0xff_ffff;
            word |= u32::from(reloc.pcrel) << 24;
            word |= u32::from(reloc.length) << 25;
            word |= u32::from(reloc.is_extern) << 27;
            word |= u32::from(reloc.r_type) << 28;
            out.write_u32::<LE>(word).unwrap();
        }

        for (index, nlist) in nlists.iter().enumerate() {
            out.write_u32::<LE>(strx[index]).unwrap();
            out.push(nlist.n_type);
            out.push(nlist.n_sect);
            out.write_u16::<LE>(nlist.n_desc).unwrap();
            out.write_u64::<LE>(nlist.n_value).unwrap();
        }
        out.extend_from_slice(&strtab);
        out
    }

    const LIBSYSTEM_TBD: &str = "\
--- !tapi-tbd
tbd-version:     4
targets:         [ x86_64-macos, arm64-macos ]
install-name:    '/usr/lib/libSystem.B.dylib'
current-version: 1311
exports:
  - targets:     [ x86_64-macos, arm64-macos ]
    symbols:     [ _puts, dyld_stub_binder ]
";

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("libweld-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct LoadCommandView {
        cmd: u32,
        body: Vec<u8>,
    }

    fn load_commands(data: &[u8]) -> Vec<LoadCommandView> {
        let header = pod_at::<MachHeader64>(data, 0).unwrap();
        let ncmds = header.ncmds.get(object::LittleEndian);
        let mut out = Vec::new();
        let mut offset = 32usize;
        for _ in 0..ncmds {
            let cmd = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            let cmdsize =
                u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
            out.push(LoadCommandView {
                cmd,
                body: data[offset..offset + cmdsize].to_vec(),
            });
            offset += cmdsize;
        }
        out
    }

    fn find_section(data: &[u8], wanted: &str) -> Option<Section64> {
        for view in load_commands(data) {
            if view.cmd != macho::LC_SEGMENT_64 {
                continue;
            }
            let segment = pod_at::<SegmentCommand64>(&view.body, 0).unwrap();
            let nsects = segment.nsects.get(object::LittleEndian) as usize;
            let sections = pod_slice_at::<Section64>(&view.body, 72, nsects).unwrap();
            for section in sections {
                if section.sect_name() == wanted.as_bytes() {
                    return Some(*section);
                }
            }
        }
        None
    }

    /// Links `_main` calling `_puts` from a text stub and checks the lazy
    /// binding plumbing end to end.
    #[test]
    fn hello_world_x86_64_executable() {
        let dir = scratch_dir("hello");

        // call _puts; xor %eax, %eax; ret
        let code: &[u8] = &[0xe8, 0, 0, 0, 0, 0x31, 0xc0, 0xc3];
        let object_bytes = build_object(
            code,
            "__text",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
            &[
                TestNlist {
                    name: "_main",
                    n_type: macho::N_SECT | macho::N_EXT,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: 0,
                },
                TestNlist {
                    name: "_puts",
                    n_type: macho::N_UNDF | macho::N_EXT,
                    n_sect: 0,
                    n_desc: 0,
                    n_value: 0,
                },
            ],
            &[TestReloc {
                address: 1,
                symbolnum: 1,
                pcrel: true,
                length: 2,
                is_extern: true,
                r_type: macho::X86_64_RELOC_BRANCH as u8,
            }],
        );
        let object_path = dir.join("main.o");
        std::fs::write(&object_path, &object_bytes).unwrap();
        let tbd_path = dir.join("libSystem.tbd");
        std::fs::write(&tbd_path, LIBSYSTEM_TBD).unwrap();

        let mut args = Args::default();
        args.target.arch = Arch::X86_64;
        args.output_path = dir.join("hello");
        args.positionals = vec![
            PositionalInput {
                path: object_path,
                must_link: false,
            },
            PositionalInput {
                path: tbd_path,
                must_link: false,
            },
        ];
        crate::link(args).unwrap();

        let out = std::fs::read(dir.join("hello")).unwrap();
        let header = pod_at::<MachHeader64>(&out, 0).unwrap();
        assert_eq!(header.filetype.get(object::LittleEndian), macho::MH_EXECUTE);
        assert_ne!(
            header.flags.get(object::LittleEndian) & macho::MH_PIE,
            0
        );

        // One stub, one lazy pointer, one GOT slot for the binder.
        let stubs = find_section(&out, "__stubs").unwrap();
        assert_eq!(stubs.size.get(object::LittleEndian), 6);
        assert_eq!(stubs.reserved2.get(object::LittleEndian), 6);
        let lazy = find_section(&out, "__la_symbol_ptr").unwrap();
        assert_eq!(lazy.size.get(object::LittleEndian), 8);
        let got = find_section(&out, "__got").unwrap();
        assert_eq!(got.size.get(object::LittleEndian), 8);

        let text = find_section(&out, "__text").unwrap();
        let commands = load_commands(&out);

        // LC_MAIN points at _main, which is the first byte of __text.
        let main_cmd = commands
            .iter()
            .find(|view| view.cmd == macho::LC_MAIN)
            .unwrap();
        let entryoff = u64::from_le_bytes(main_cmd.body[8..16].try_into().unwrap());
        assert_eq!(entryoff, u64::from(text.offset.get(object::LittleEndian)));

        // The lazy-bind stream exists and mentions _puts.
        let dyld_info = commands
            .iter()
            .find(|view| view.cmd == macho::LC_DYLD_INFO_ONLY)
            .unwrap();
        let lazy_bind_off =
            u32::from_le_bytes(dyld_info.body[32..36].try_into().unwrap()) as usize;
        let lazy_bind_size =
            u32::from_le_bytes(dyld_info.body[36..40].try_into().unwrap()) as usize;
        assert!(lazy_bind_size > 0);
        let stream = &out[lazy_bind_off..lazy_bind_off + lazy_bind_size];
        assert!(
            stream.windows(6).any(|window| window == b"_puts\0"),
            "lazy bind stream names the import"
        );

        // Indirect symbols: one stub + one GOT slot + one lazy pointer.
        let dysymtab = commands
            .iter()
            .find(|view| view.cmd == macho::LC_DYSYMTAB)
            .unwrap();
        let nindirect = u32::from_le_bytes(dysymtab.body[60..64].try_into().unwrap());
        assert_eq!(nindirect, 3);

        // The call displacement lands inside __stubs.
        let text_off = text.offset.get(object::LittleEndian) as usize;
        let disp = i32::from_le_bytes(out[text_off + 1..text_off + 5].try_into().unwrap());
        let call_target = text.addr.get(object::LittleEndian) + 5 + disp as i64 as u64;
        let stubs_addr = stubs.addr.get(object::LittleEndian);
        assert!(
            call_target >= stubs_addr && call_target < stubs_addr + 6,
            "call goes through the stub"
        );

        std::fs::remove_dir_all(dir).ok();
    }

    /// Two tentative definitions of the same name merge into a single
    /// `__common` atom with the larger size.
    #[test]
    fn common_symbols_merge() {
        let dir = scratch_dir("common");

        let code: &[u8] = &[0x31, 0xc0, 0xc3];
        let first = build_object(
            code,
            "__text",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
            &[
                TestNlist {
                    name: "_main",
                    n_type: macho::N_SECT | macho::N_EXT,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: 0,
                },
                TestNlist {
                    name: "_x",
                    n_type: macho::N_UNDF | macho::N_EXT,
                    n_sect: 0,
                    n_desc: 2 << 8,
                    n_value: 4,
                },
            ],
            &[],
        );
        let second = build_object(
            &[0xc3],
            "__text",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
            &[TestNlist {
                name: "_x",
                n_type: macho::N_UNDF | macho::N_EXT,
                n_sect: 0,
                n_desc: 2 << 8,
                n_value: 16,
            }],
            &[],
        );

        let first_path = dir.join("a.o");
        let second_path = dir.join("b.o");
        std::fs::write(&first_path, &first).unwrap();
        std::fs::write(&second_path, &second).unwrap();

        let mut args = Args::default();
        args.target.arch = Arch::X86_64;
        args.output_path = dir.join("common");
        args.positionals = vec![
            PositionalInput {
                path: first_path,
                must_link: false,
            },
            PositionalInput {
                path: second_path,
                must_link: false,
            },
        ];
        crate::link(args).unwrap();

        let out = std::fs::read(dir.join("common")).unwrap();
        let common = find_section(&out, "__common").unwrap();
        assert_eq!(common.size.get(object::LittleEndian), 16);
        assert_eq!(common.align.get(object::LittleEndian), 2);
        assert_eq!(
            common.flags.get(object::LittleEndian) & macho::SECTION_TYPE,
            macho::S_ZEROFILL
        );
        // Zerofill occupies no file space.
        assert_eq!(common.offset.get(object::LittleEndian), 0);

        std::fs::remove_dir_all(dir).ok();
    }

    /// An unresolved name under dynamic lookup binds with the flat-lookup
    /// special ordinal instead of failing.
    #[test]
    fn dynamic_lookup_binds_flat() {
        let dir = scratch_dir("flat");

        // A data-style 8-byte pointer to a missing symbol would need a
        // writable section; a call is simpler and exercises the stub path.
        let code: &[u8] = &[0xe8, 0, 0, 0, 0, 0xc3];
        let object_bytes = build_object(
            code,
            "__text",
            macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
            &[
                TestNlist {
                    name: "_main",
                    n_type: macho::N_SECT | macho::N_EXT,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: 0,
                },
                TestNlist {
                    name: "_missing",
                    n_type: macho::N_UNDF | macho::N_EXT,
                    n_sect: 0,
                    n_desc: 0,
                    n_value: 0,
                },
            ],
            &[TestReloc {
                address: 1,
                symbolnum: 1,
                pcrel: true,
                length: 2,
                is_extern: true,
                r_type: macho::X86_64_RELOC_BRANCH as u8,
            }],
        );
        let object_path = dir.join("main.o");
        std::fs::write(&object_path, &object_bytes).unwrap();
        let tbd_path = dir.join("libSystem.tbd");
        std::fs::write(&tbd_path, LIBSYSTEM_TBD).unwrap();

        let mut args = Args::default();
        args.target.arch = Arch::X86_64;
        args.undefined_treatment = crate::args::UndefinedTreatment::DynamicLookup;
        args.output_path = dir.join("flat");
        args.positionals = vec![
            PositionalInput {
                path: object_path,
                must_link: false,
            },
            PositionalInput {
                path: tbd_path,
                must_link: false,
            },
        ];
        crate::link(args).unwrap();

        let out = std::fs::read(dir.join("flat")).unwrap();
        let commands = load_commands(&out);
        let dyld_info = commands
            .iter()
            .find(|view| view.cmd == macho::LC_DYLD_INFO_ONLY)
            .unwrap();
        let lazy_off = u32::from_le_bytes(dyld_info.body[32..36].try_into().unwrap()) as usize;
        let lazy_size = u32::from_le_bytes(dyld_info.body[36..40].try_into().unwrap()) as usize;
        let stream = &out[lazy_off..lazy_off + lazy_size];
        // SET_DYLIB_SPECIAL_IMM with ordinal -2 encodes as 0x3e.
        assert!(
            stream.contains(&(macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | 0x0e)),
            "flat lookup ordinal present"
        );

        std::fs::remove_dir_all(dir).ok();
    }

    /// A duplicate strong definition across two objects is a collected
    /// error.
    #[test]
    fn duplicate_strong_definitions_fail() {
        let dir = scratch_dir("dupe");

        let make = |name: &'static str| {
            build_object(
                &[0xc3],
                "__text",
                macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
                &[TestNlist {
                    name,
                    n_type: macho::N_SECT | macho::N_EXT,
                    n_sect: 1,
                    n_desc: 0,
                    n_value: 0,
                }],
                &[],
            )
        };
        let first_path = dir.join("a.o");
        let second_path = dir.join("b.o");
        std::fs::write(&first_path, make("_twice")).unwrap();
        std::fs::write(&second_path, make("_twice")).unwrap();

        let mut args = Args::default();
        args.target.arch = Arch::X86_64;
        args.entry = "_twice".to_string();
        args.output_path = dir.join("dupe");
        args.positionals = vec![
            PositionalInput {
                path: first_path,
                must_link: false,
            },
            PositionalInput {
                path: second_path,
                must_link: false,
            },
        ];
        let error = crate::link(args).unwrap_err();
        assert!(matches!(error, Error::MultipleSymbolDefinitions(_)));

        std::fs::remove_dir_all(dir).ok();
    }
}
