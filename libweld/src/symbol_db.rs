//! Global symbol resolution: objects in discovery order, then archive
//! members on demand, then dylib exports, then the synthesized globals and
//! the undefined-reference policy. Precedence is rank-based: strong < weak <
//! tentative < undefined, with ties broken per kind.

use crate::args::OutputMode;
use crate::args::UndefinedTreatment;
use crate::atom::AtomId;
use crate::error::DuplicateSymbol;
use crate::error::Error;
use crate::error::Result;
use crate::file::File;
use crate::file::FileId;
use crate::intern::StrOffset;
use crate::linker::Linker;
use crate::macho::NlistExt;
use crate::macho::Nlist64;
use crate::symbol::BoundarySpec;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use object::LittleEndian;
use object::macho;

pub(crate) const STUB_BINDER_NAME: &[u8] = b"dyld_stub_binder";
pub(crate) const MH_EXECUTE_HEADER_NAME: &[u8] = b"__mh_execute_header";
pub(crate) const DSO_HANDLE_NAME: &[u8] = b"___dso_handle";

/// One external definition (or reference) arriving at the global table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Incoming {
    pub(crate) rank: u8,
    pub(crate) value: u64,
    pub(crate) atom: AtomId,
    pub(crate) file: FileId,
    pub(crate) nlist_index: u32,
    pub(crate) flags: SymbolFlags,
    pub(crate) common_align: u8,
}

pub(crate) const RANK_STRONG: u8 = 0;
pub(crate) const RANK_WEAK: u8 = 1;
pub(crate) const RANK_TENTATIVE: u8 = 2;
pub(crate) const RANK_UNDEF: u8 = 3;

fn nlist_rank(nlist: &Nlist64) -> u8 {
    if nlist.is_sect() {
        if nlist.is_weak_def() || nlist.is_pext() {
            RANK_WEAK
        } else {
            RANK_STRONG
        }
    } else if nlist.is_tentative() {
        RANK_TENTATIVE
    } else {
        RANK_UNDEF
    }
}

fn symbol_rank(symbol: &Symbol) -> u8 {
    if !symbol.atom.is_null() {
        if symbol.is_weak() || symbol.flags.contains(SymbolFlags::PRIVATE_EXTERN) {
            RANK_WEAK
        } else {
            RANK_STRONG
        }
    } else if symbol.is_tentative() {
        RANK_TENTATIVE
    } else {
        RANK_UNDEF
    }
}

impl Linker {
    pub(crate) fn resolve_symbols(&mut self) -> Result {
        let object_ids: Vec<FileId> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| matches!(file, File::Object(_)))
            .map(|(index, _)| FileId(index as u32))
            .collect();
        for id in object_ids {
            self.resolve_object(id)?;
        }

        self.drain_archives()?;
        self.resolve_from_dylibs();
        self.promote_boundary_symbols();
        self.create_synthetic_globals();
        self.apply_undefined_treatment()?;
        self.create_stub_binder()?;
        self.mark_exports();
        self.check_entry()?;

        if !self.dupes.is_empty() {
            return Err(Error::MultipleSymbolDefinitions(std::mem::take(
                &mut self.dupes,
            )));
        }
        self.unresolved = self.unresolved_globals();
        if !self.unresolved.is_empty() {
            return Err(self.report_unresolved());
        }
        Ok(())
    }

    /// Folds one object's externals into the global table. Called again for
    /// archive members as they are pulled in.
    pub(crate) fn resolve_object(&mut self, file_id: FileId) -> Result {
        let nlist_count = self.object(file_id).nlists.len();
        let first_global = self.object(file_id).first_global as usize;

        // Locals first: one linker symbol each, attached to the section atom.
        for index in 0..first_global.min(nlist_count) {
            let nlist = self.object(file_id).nlists[index];
            self.check_handled(&nlist, file_id)?;
            if !nlist.is_sect() {
                continue;
            }
            let name = self.object(file_id).nlist_name(&nlist).to_vec();
            let name = self.strings.intern(&name);
            let mut symbol = Symbol::new(name);
            symbol.value = nlist.n_value.get(LittleEndian);
            symbol.file = file_id;
            symbol.nlist_index = index as u32;
            symbol.flags.insert(SymbolFlags::LOCAL);
            if nlist.is_no_dead_strip() {
                symbol.flags.insert(SymbolFlags::NO_DEAD_STRIP);
            }
            symbol.atom = self
                .object(file_id)
                .section_atoms
                .get(nlist.n_sect as usize - 1)
                .copied()
                .unwrap_or(AtomId::NULL);
            let id = self.push_symbol(symbol);
            self.object_mut(file_id).symbols[index] = id;
        }

        for index in first_global..nlist_count {
            let nlist = self.object(file_id).nlists[index];
            self.check_handled(&nlist, file_id)?;

            let rank = nlist_rank(&nlist);
            let mut flags = SymbolFlags::default();
            if nlist.is_weak_def() {
                flags.insert(SymbolFlags::WEAK);
            }
            if nlist.is_weak_ref() {
                flags.insert(SymbolFlags::WEAK_REF);
            }
            if nlist.is_pext() {
                flags.insert(SymbolFlags::PRIVATE_EXTERN);
            }
            if nlist.is_no_dead_strip() {
                flags.insert(SymbolFlags::NO_DEAD_STRIP);
            }
            if nlist.n_desc.get(LittleEndian) & macho::REFERENCED_DYNAMICALLY != 0 {
                flags.insert(SymbolFlags::REFERENCED_DYNAMICALLY);
            }
            if rank == RANK_TENTATIVE {
                flags.insert(SymbolFlags::TENTATIVE);
            }

            let atom = if nlist.is_sect() {
                self.object(file_id)
                    .section_atoms
                    .get(nlist.n_sect as usize - 1)
                    .copied()
                    .unwrap_or(AtomId::NULL)
            } else {
                AtomId::NULL
            };

            let incoming = Incoming {
                rank,
                value: nlist.n_value.get(LittleEndian),
                atom,
                file: file_id,
                nlist_index: index as u32,
                flags,
                common_align: if rank == RANK_TENTATIVE {
                    nlist.common_align()
                } else {
                    0
                },
            };

            let name = self.object(file_id).nlist_name(&nlist).to_vec();
            let name = self.strings.intern(&name);
            let global = self.merge_global(name, incoming);
            self.object_mut(file_id).symbols[index] = global;
        }
        Ok(())
    }

    fn check_handled(&self, nlist: &Nlist64, file_id: FileId) -> Result {
        if nlist.is_stab() || nlist.is_indr() || nlist.is_abs() {
            return Err(Error::UnhandledSymbolType {
                name: String::from_utf8_lossy(self.object(file_id).nlist_name(nlist)).into_owned(),
                path: self.object(file_id).path.clone(),
            });
        }
        Ok(())
    }

    /// The precedence lattice. Returns the global's stable id; a replacement
    /// rewrites the symbol in place so the id never changes.
    pub(crate) fn merge_global(&mut self, name: StrOffset, incoming: Incoming) -> SymbolId {
        if let Some(&existing_id) = self.globals.get(&name) {
            let (existing_rank, existing_file, existing_value, existing_align) = {
                let existing = self.symbol(existing_id);
                (
                    symbol_rank(existing),
                    existing.file,
                    existing.value,
                    existing.common_align,
                )
            };

            match (incoming.rank, existing_rank) {
                (RANK_STRONG, RANK_STRONG) => {
                    let clash = DuplicateSymbol {
                        name: String::from_utf8_lossy(self.strings.get(name)).into_owned(),
                        first: self.file_display(existing_file),
                        second: self.file_display(incoming.file),
                    };
                    self.dupes.push(clash);
                }
                (RANK_TENTATIVE, RANK_TENTATIVE) => {
                    // Keep the larger size; alignment is the max of the two.
                    let align = existing_align.max(incoming.common_align);
                    if incoming.value > existing_value {
                        self.overwrite_global(existing_id, name, incoming);
                    }
                    self.symbol_mut(existing_id).common_align = align;
                }
                (RANK_WEAK, RANK_WEAK) => {}
                (new, old) if new < old => {
                    self.overwrite_global(existing_id, name, incoming);
                }
                _ => {
                    // An undefined reference still contributes its weak-ref
                    // bit: a name only weakly referenced stays weak-import.
                    if incoming.rank == RANK_UNDEF
                        && !incoming.flags.contains(SymbolFlags::WEAK_REF)
                    {
                        self.symbol_mut(existing_id).flags.remove(SymbolFlags::WEAK_REF);
                    }
                }
            }
            return existing_id;
        }

        let mut symbol = Symbol::new(name);
        symbol.value = incoming.value;
        symbol.atom = incoming.atom;
        symbol.file = incoming.file;
        symbol.nlist_index = incoming.nlist_index;
        symbol.flags = incoming.flags;
        symbol.common_align = incoming.common_align;
        let id = self.push_symbol(symbol);
        self.globals.insert(name, id);
        self.global_list.push(id);
        id
    }

    fn overwrite_global(&mut self, id: SymbolId, name: StrOffset, incoming: Incoming) {
        let symbol = self.symbol_mut(id);
        symbol.name = name;
        symbol.value = incoming.value;
        symbol.atom = incoming.atom;
        symbol.file = incoming.file;
        symbol.nlist_index = incoming.nlist_index;
        symbol.flags = incoming.flags;
        symbol.common_align = incoming.common_align;
    }

    /// Globals that still resolve to nothing, in first-seen order.
    pub(crate) fn unresolved_globals(&self) -> Vec<SymbolId> {
        self.global_list
            .iter()
            .copied()
            .filter(|&id| self.symbol(id).is_undefined())
            .collect()
    }

    /// Repeatedly scans archive tables of contents with the current
    /// unresolved set; each member parsed may surface new unresolved names,
    /// so this runs to fixpoint.
    fn drain_archives(&mut self) -> Result {
        loop {
            let mut progressed = false;
            let unresolved = self.unresolved_globals();
            for symbol_id in unresolved {
                if !self.symbol(symbol_id).is_undefined() {
                    continue;
                }
                let name = self.symbol_name(symbol_id).to_vec();

                let archive_ids: Vec<FileId> = self
                    .files
                    .iter()
                    .enumerate()
                    .filter(|(_, file)| matches!(file, File::Archive(_)))
                    .map(|(index, _)| FileId(index as u32))
                    .collect();

                'archives: for archive_id in archive_ids {
                    let (offsets, path) = {
                        let File::Archive(archive) = &self.files[archive_id.index()] else {
                            unreachable!();
                        };
                        (archive.lookup(&name).to_vec(), archive.path.clone())
                    };
                    for offset in offsets {
                        if let Some(member_id) =
                            self.load_archive_member(archive_id, offset, &path)?
                        {
                            self.resolve_object(member_id)?;
                            progressed = true;
                            break 'archives;
                        }
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Resolves remaining names against dylib export lists, assigning
    /// ordinals in first-reference order.
    fn resolve_from_dylibs(&mut self) {
        let dylib_ids: Vec<FileId> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| matches!(file, File::Dylib(_)))
            .map(|(index, _)| FileId(index as u32))
            .collect();

        for symbol_id in self.unresolved_globals() {
            let name = self.symbol_name(symbol_id).to_vec();
            for &dylib_id in &dylib_ids {
                let (exports, weak) = {
                    let File::Dylib(dylib) = &self.files[dylib_id.index()] else {
                        unreachable!();
                    };
                    (dylib.exports(&name), dylib.weak)
                };
                if !exports {
                    continue;
                }
                let ordinal = self.dylib_ordinal(dylib_id);
                self.files[dylib_id.index()].set_alive();
                let symbol = self.symbol_mut(symbol_id);
                symbol.flags.insert(SymbolFlags::IMPORT);
                if weak {
                    symbol.flags.insert(SymbolFlags::WEAK_REF);
                }
                self.side.ordinals.insert(symbol_id, ordinal);
                break;
            }
        }
    }

    /// `segment$start$…` and friends: still-undefined names matching the
    /// boundary grammar become zero-size private-extern definitions placed
    /// during layout.
    fn promote_boundary_symbols(&mut self) {
        for symbol_id in self.unresolved_globals() {
            let name = String::from_utf8_lossy(self.symbol_name(symbol_id)).into_owned();
            let Some(spec) = parse_boundary_name(&name) else {
                continue;
            };
            let symbol = self.symbol_mut(symbol_id);
            symbol.flags.insert(SymbolFlags::BOUNDARY);
            symbol.flags.insert(SymbolFlags::PRIVATE_EXTERN);
            self.side.boundaries.insert(symbol_id, spec);
        }
    }

    fn create_synthetic_globals(&mut self) {
        if self.args.output_mode == OutputMode::Executable {
            let name = self.strings.intern(MH_EXECUTE_HEADER_NAME);
            let id = self.merge_global(
                name,
                Incoming {
                    rank: RANK_UNDEF,
                    value: 0,
                    atom: AtomId::NULL,
                    file: FileId::NULL,
                    nlist_index: Symbol::NO_NLIST,
                    flags: SymbolFlags::default(),
                    common_align: 0,
                },
            );
            let symbol = self.symbol_mut(id);
            symbol.file = FileId::NULL;
            symbol.nlist_index = Symbol::NO_NLIST;
            symbol
                .flags
                .insert(SymbolFlags::REFERENCED_DYNAMICALLY | SymbolFlags::EXPORT);
            // Defined at the image base once __TEXT has an address.
            self.mh_execute_header = id;
        }

        let dso_name = self.strings.intern(DSO_HANDLE_NAME);
        if let Some(&id) = self.globals.get(&dso_name) {
            if self.symbol(id).is_undefined() {
                let symbol = self.symbol_mut(id);
                symbol.file = FileId::NULL;
                symbol.nlist_index = Symbol::NO_NLIST;
                symbol.flags.insert(SymbolFlags::WEAK | SymbolFlags::PRIVATE_EXTERN);
                self.dso_handle = id;
            }
        }
    }

    fn apply_undefined_treatment(&mut self) -> Result {
        let treatment = self.args.undefined_treatment;
        for symbol_id in self.unresolved_globals() {
            // Synthetic globals resolve at layout time.
            if symbol_id == self.mh_execute_header || symbol_id == self.dso_handle {
                continue;
            }
            match treatment {
                UndefinedTreatment::Error => {}
                UndefinedTreatment::DynamicLookup => {
                    let symbol = self.symbol_mut(symbol_id);
                    symbol.flags.insert(SymbolFlags::IMPORT);
                    self.side.ordinals.insert(
                        symbol_id,
                        i16::from(macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP),
                    );
                }
                UndefinedTreatment::Warn | UndefinedTreatment::Suppress => {
                    if treatment == UndefinedTreatment::Warn {
                        let name = String::from_utf8_lossy(self.symbol_name(symbol_id)).into_owned();
                        tracing::warn!("undefined symbol `{name}` left for flat lookup");
                    }
                    let symbol = self.symbol_mut(symbol_id);
                    symbol.flags.insert(SymbolFlags::IMPORT);
                    self.side.ordinals.insert(
                        symbol_id,
                        i16::from(macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP),
                    );
                }
            }
        }
        Ok(())
    }

    /// `dyld_stub_binder` backs the lazy-binding machinery; it is required
    /// exactly when something is imported.
    fn create_stub_binder(&mut self) -> Result {
        let any_import = self
            .global_list
            .iter()
            .any(|&id| self.symbol(id).is_import());
        if !any_import {
            return Ok(());
        }

        let dylib_ids: Vec<FileId> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| matches!(file, File::Dylib(_)))
            .map(|(index, _)| FileId(index as u32))
            .collect();

        for dylib_id in dylib_ids {
            let exports = {
                let File::Dylib(dylib) = &self.files[dylib_id.index()] else {
                    unreachable!();
                };
                dylib.exports(STUB_BINDER_NAME)
            };
            if !exports {
                continue;
            }
            let ordinal = self.dylib_ordinal(dylib_id);
            self.files[dylib_id.index()].set_alive();
            let name = self.strings.intern(STUB_BINDER_NAME);
            let id = self.merge_global(
                name,
                Incoming {
                    rank: RANK_UNDEF,
                    value: 0,
                    atom: AtomId::NULL,
                    file: FileId::NULL,
                    nlist_index: Symbol::NO_NLIST,
                    flags: SymbolFlags::default(),
                    common_align: 0,
                },
            );
            let symbol = self.symbol_mut(id);
            symbol.nlist_index = Symbol::NO_NLIST;
            symbol.flags.insert(SymbolFlags::IMPORT);
            self.side.ordinals.insert(id, ordinal);
            self.stub_binder = id;
            return Ok(());
        }

        Err(Error::UndefinedSymbolReference(vec![
            crate::error::UndefinedSymbol {
                name: String::from_utf8_lossy(STUB_BINDER_NAME).into_owned(),
                referenced_in: "<synthesized lazy binding>".to_string(),
            },
        ]))
    }

    /// Defined, externally-visible globals become exports. Tentative
    /// definitions count: their common storage materializes right after
    /// this.
    fn mark_exports(&mut self) {
        for index in 0..self.global_list.len() {
            let id = self.global_list[index];
            let symbol = self.symbol(id);
            if (!symbol.atom.is_null() || symbol.is_tentative())
                && !symbol.flags.contains(SymbolFlags::PRIVATE_EXTERN)
                && !symbol.is_local()
            {
                self.symbol_mut(id).flags.insert(SymbolFlags::EXPORT);
            }
        }
    }

    fn check_entry(&mut self) -> Result {
        if self.args.output_mode != OutputMode::Executable {
            return Ok(());
        }
        let entry = self.args.entry.clone();
        let name = self.strings.intern(entry.as_bytes());
        match self.globals.get(&name) {
            Some(&id) if !self.symbol(id).atom.is_null() => {
                self.entry_symbol = id;
                Ok(())
            }
            _ => Err(Error::MissingMainEntrypoint(entry)),
        }
    }
}

fn parse_boundary_name(name: &str) -> Option<BoundarySpec> {
    let mut parts = name.split('$');
    let kind = parts.next()?;
    let edge = parts.next()?;
    let start = match edge {
        "start" => true,
        "stop" => false,
        _ => return None,
    };
    match kind {
        "segment" => {
            let segment = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            Some(BoundarySpec {
                segment: segment.to_string(),
                section: None,
                start,
            })
        }
        "section" => {
            let segment = parts.next()?;
            let section = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            Some(BoundarySpec {
                segment: segment.to_string(),
                section: Some(section.to_string()),
                start,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;

    fn incoming(rank: u8, value: u64, file: u32) -> Incoming {
        let mut flags = SymbolFlags::default();
        if rank == RANK_WEAK {
            flags.insert(SymbolFlags::WEAK);
        }
        if rank == RANK_TENTATIVE {
            flags.insert(SymbolFlags::TENTATIVE);
        }
        Incoming {
            rank,
            value,
            atom: if rank <= RANK_WEAK {
                AtomId(1)
            } else {
                AtomId::NULL
            },
            file: FileId(file),
            nlist_index: 7,
            flags,
            common_align: value.trailing_zeros().min(4) as u8,
        }
    }

    #[test]
    fn strong_beats_weak_and_undef() {
        let mut linker = Linker::new(Args::default());
        let name = linker.strings.intern(b"_sym");

        let id = linker.merge_global(name, incoming(RANK_UNDEF, 0, 1));
        assert!(linker.symbol(id).is_undefined());

        let same = linker.merge_global(name, incoming(RANK_WEAK, 0x10, 2));
        assert_eq!(id, same);
        assert!(linker.symbol(id).is_weak());

        linker.merge_global(name, incoming(RANK_STRONG, 0x20, 3));
        assert!(!linker.symbol(id).is_weak());
        assert_eq!(linker.symbol(id).value, 0x20);
        assert_eq!(linker.symbol(id).file, FileId(3));
        assert!(linker.dupes.is_empty());
    }

    #[test]
    fn strong_strong_is_a_collected_duplicate() {
        let mut linker = Linker::new(Args::default());
        let name = linker.strings.intern(b"_twice");
        linker.merge_global(name, incoming(RANK_STRONG, 0x10, 1));
        let id = linker.merge_global(name, incoming(RANK_STRONG, 0x20, 2));
        // Existing definition is kept, clash is recorded for batch report.
        assert_eq!(linker.symbol(id).value, 0x10);
        assert_eq!(linker.dupes.len(), 1);
        assert_eq!(linker.dupes[0].name, "_twice");
    }

    #[test]
    fn weak_weak_keeps_the_first() {
        let mut linker = Linker::new(Args::default());
        let name = linker.strings.intern(b"__Z3foov");
        linker.merge_global(name, incoming(RANK_WEAK, 0x10, 1));
        let id = linker.merge_global(name, incoming(RANK_WEAK, 0x20, 2));
        assert_eq!(linker.symbol(id).value, 0x10);
        assert_eq!(linker.symbol(id).file, FileId(1));
    }

    #[test]
    fn tentative_pair_keeps_larger_size_and_max_alignment() {
        let mut linker = Linker::new(Args::default());
        let name = linker.strings.intern(b"_x");
        linker.merge_global(name, incoming(RANK_TENTATIVE, 4, 1));
        let id = linker.merge_global(name, incoming(RANK_TENTATIVE, 16, 2));
        let symbol = linker.symbol(id);
        assert!(symbol.is_tentative());
        assert_eq!(symbol.value, 16);
        assert_eq!(symbol.common_align, 4);

        // The smaller one arriving second changes nothing.
        linker.merge_global(name, incoming(RANK_TENTATIVE, 8, 3));
        assert_eq!(linker.symbol(id).value, 16);
    }

    #[test]
    fn defined_weak_beats_tentative_in_either_order() {
        let mut linker = Linker::new(Args::default());
        let name = linker.strings.intern(b"_y");
        linker.merge_global(name, incoming(RANK_TENTATIVE, 8, 1));
        let id = linker.merge_global(name, incoming(RANK_WEAK, 0x40, 2));
        assert!(!linker.symbol(id).is_tentative());
        assert_eq!(linker.symbol(id).value, 0x40);

        let name2 = linker.strings.intern(b"_z");
        let id2 = linker.merge_global(name2, incoming(RANK_WEAK, 0x50, 1));
        linker.merge_global(name2, incoming(RANK_TENTATIVE, 8, 2));
        assert!(!linker.symbol(id2).is_tentative());
        assert_eq!(linker.symbol(id2).value, 0x50);
    }

    #[test]
    fn boundary_grammar() {
        let spec = parse_boundary_name("segment$start$__DATA").unwrap();
        assert_eq!(spec.segment, "__DATA");
        assert!(spec.section.is_none() && spec.start);

        let spec = parse_boundary_name("section$stop$__DATA$__mine").unwrap();
        assert_eq!(spec.section.as_deref(), Some("__mine"));
        assert!(!spec.start);

        assert!(parse_boundary_name("_main").is_none());
        assert!(parse_boundary_name("segment$middle$__DATA").is_none());
    }
}
