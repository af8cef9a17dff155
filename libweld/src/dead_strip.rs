//! Mark-live over the atom graph. Roots are the entry point, dynamically
//! referenced symbols, exports (when building a library), initializer and
//! no-dead-strip sections. Edges are the relocation targets of each live
//! atom. Dead atoms stay in their arenas; later passes skip them.

use crate::args::OutputMode;
use crate::atom::AtomId;
use crate::file::File;
use crate::file::FileId;
use crate::linker::Linker;
use crate::macho::SectionExt;
use crate::object_file::Reloc;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use object::macho;

impl Linker {
    pub(crate) fn dead_strip(&mut self) {
        // Everything parsed so far is provisionally dead.
        for atom in self.atoms.iter_mut().skip(1) {
            atom.live = false;
        }

        let mut worklist: Vec<AtomId> = Vec::new();
        let mut push_symbol_root = |linker: &Linker, worklist: &mut Vec<AtomId>, id: SymbolId| {
            let atom = linker.symbol(id).atom;
            if !atom.is_null() {
                worklist.push(atom);
            }
        };

        if !self.entry_symbol.is_null() {
            push_symbol_root(self, &mut worklist, self.entry_symbol);
        }
        for &id in &self.global_list {
            let symbol = self.symbol(id);
            if symbol.flags.contains(SymbolFlags::REFERENCED_DYNAMICALLY)
                || symbol.flags.contains(SymbolFlags::NO_DEAD_STRIP)
                || (self.args.output_mode == OutputMode::Dylib
                    && symbol.flags.contains(SymbolFlags::EXPORT))
            {
                push_symbol_root(self, &mut worklist, id);
            }
        }

        // Section-attribute roots: no-dead-strip sections and initializer /
        // terminator pointer sections, which run without any reference.
        for file in &self.files {
            let File::Object(object) = file else {
                continue;
            };
            for (ordinal0, section) in object.sections.iter().enumerate() {
                let keep = section.is_no_dead_strip()
                    || matches!(
                        section.sect_type(),
                        macho::S_MOD_INIT_FUNC_POINTERS | macho::S_MOD_TERM_FUNC_POINTERS
                    );
                if keep {
                    let atom = object.section_atoms[ordinal0];
                    if !atom.is_null() {
                        worklist.push(atom);
                    }
                }
            }
        }

        while let Some(atom_id) = worklist.pop() {
            if self.atoms[atom_id.index()].live {
                continue;
            }
            self.atoms[atom_id.index()].live = true;

            let (file_id, relocs) = {
                let atom = self.atom(atom_id);
                (atom.file, atom.relocs)
            };
            if file_id.is_null() {
                continue;
            }

            let targets: Vec<SymbolId> = {
                let object = self.object(file_id);
                object.relocs[relocs.range()]
                    .iter()
                    .map(|reloc| reloc_target(self, file_id, reloc))
                    .collect()
            };
            for target in targets {
                if target.is_null() {
                    continue;
                }
                let symbol = self.symbol(target);
                if symbol.atom.is_null() {
                    // An import (or not-yet-synthesized target): its
                    // defining file stays alive so its locals keep their
                    // symtab entries.
                    let owner = symbol.file;
                    if !owner.is_null() {
                        self.files[owner.index()].set_alive();
                    }
                } else {
                    worklist.push(symbol.atom);
                }
            }
        }

        let dead = self.atoms.iter().skip(1).filter(|atom| !atom.live).count();
        tracing::debug!("dead-strip: {dead} atoms dropped");
    }
}

/// The symbol a relocation points at: the resolved global for external
/// relocations, the section's primary atom symbol otherwise.
pub(crate) fn reloc_target(linker: &Linker, file_id: FileId, reloc: &Reloc) -> SymbolId {
    let object = linker.object(file_id);
    if reloc.is_extern {
        object
            .symbols
            .get(reloc.symbolnum as usize)
            .copied()
            .unwrap_or(SymbolId::NULL)
    } else {
        match object.section_atoms.get(reloc.symbolnum as usize - 1) {
            Some(&atom_id) if !atom_id.is_null() => linker.atom(atom_id).sym,
            _ => SymbolId::NULL,
        }
    }
}
