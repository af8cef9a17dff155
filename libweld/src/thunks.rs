//! aarch64 branch-range extension. When a code section grows past the reach
//! of a B/BL immediate, its atom list is split into runs and a block of
//! trampolines is inserted after each run; branches whose target is out of
//! range detour through their run's trampoline.

use crate::arch::aarch64;
use crate::atom::Atom;
use crate::atom::AtomId;
use crate::dead_strip::reloc_target;
use crate::file::FileId;
use crate::layout::SectionId;
use crate::linker::Linker;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use object::macho;
use std::collections::BTreeMap;

/// Span of one run between trampoline blocks.
const GROUP_SPAN: u64 = 100 * 1024 * 1024;

/// Reach assumed for a direct branch while planning; the slack absorbs the
/// offset drift the inserted trampolines themselves cause.
const PLANNING_RANGE: u64 = (aarch64::BRANCH_RANGE as u64) - 0x20_0000;

/// Trampolines serving one run of atoms, keyed (and ordered) by target.
#[derive(Debug, Default)]
pub(crate) struct Thunk {
    pub(crate) lookup: BTreeMap<SymbolId, AtomId>,
}

impl Linker {
    /// Plans trampolines for one code section. Offsets assigned here are
    /// provisional; the allocator lays the section out again afterwards with
    /// the trampoline atoms in place.
    pub(crate) fn insert_thunks(&mut self, section_id: SectionId) {
        let atoms: Vec<AtomId> = self
            .section_atoms(section_id)
            .filter(|&id| self.atom(id).live)
            .collect();

        let mut offsets: foldhash::HashMap<AtomId, u64> = foldhash::HashMap::default();
        let mut cursor = 0u64;
        for &atom_id in &atoms {
            let atom = self.atom(atom_id);
            cursor = align_to(cursor, atom.alignment());
            offsets.insert(atom_id, cursor);
            cursor += atom.size;
        }
        if cursor <= PLANNING_RANGE {
            return;
        }

        let mut group_start_off = 0u64;
        let mut group_last_atom = AtomId::NULL;
        let mut group_members: Vec<AtomId> = Vec::new();
        let mut groups: Vec<(AtomId, Vec<AtomId>)> = Vec::new();

        for &atom_id in &atoms {
            let offset = offsets[&atom_id];
            if offset - group_start_off > GROUP_SPAN && !group_members.is_empty() {
                groups.push((group_last_atom, std::mem::take(&mut group_members)));
                group_start_off = offset;
            }
            group_members.push(atom_id);
            group_last_atom = atom_id;
        }
        if !group_members.is_empty() {
            groups.push((group_last_atom, group_members));
        }

        for (insert_after, members) in groups {
            let thunk_index = self.thunks.len() as u32;
            let mut thunk = Thunk::default();

            for &atom_id in &members {
                self.atom_mut(atom_id).thunk = Some(thunk_index);
                let source_off = offsets[&atom_id];
                let (file, relocs) = {
                    let atom = self.atom(atom_id);
                    (atom.file, atom.relocs)
                };
                if file.is_null() {
                    continue;
                }

                let branch_targets: Vec<SymbolId> = {
                    let object = self.object(file);
                    object.relocs[relocs.range()]
                        .iter()
                        .filter(|reloc| {
                            u32::from(reloc.r_type) == macho::ARM64_RELOC_BRANCH26.into()
                        })
                        .map(|reloc| reloc_target(self, file, reloc))
                        .collect()
                };

                for target in branch_targets {
                    if target.is_null() || thunk.lookup.contains_key(&target) {
                        continue;
                    }
                    let target_atom = self.symbol(target).atom;
                    if target_atom.is_null() || self.atom(target_atom).section != section_id {
                        // Imports go through stubs; cross-section reach is
                        // covered by segment layout.
                        continue;
                    }
                    let Some(&target_off) = offsets.get(&target_atom) else {
                        continue;
                    };
                    if source_off.abs_diff(target_off) <= PLANNING_RANGE {
                        continue;
                    }
                    let trampoline = self.trampoline_atom(target);
                    thunk.lookup.insert(target, trampoline);
                }
            }

            // Splice the trampolines in after the run, in target order.
            let mut after = insert_after;
            let trampolines: Vec<AtomId> = thunk.lookup.values().copied().collect();
            for trampoline in trampolines {
                self.insert_atom_after(section_id, after, trampoline);
                after = trampoline;
            }
            self.thunks.push(thunk);
        }

        tracing::debug!(
            "inserted {} thunk groups into section {}",
            self.thunks.len(),
            section_id.0
        );
    }

    fn trampoline_atom(&mut self, target: SymbolId) -> AtomId {
        let name = self.symbol(target).name;
        let symbol = {
            let mut symbol = Symbol::new(name);
            symbol.flags.insert(SymbolFlags::LOCAL);
            self.push_symbol(symbol)
        };
        let mut atom = Atom::new(name, FileId::NULL, symbol);
        atom.size = aarch64::THUNK_SIZE;
        atom.align = 2;
        let atom_id = self.push_atom(atom);
        self.symbols[symbol.index()].atom = atom_id;
        atom_id
    }

    /// Links `atom_id` into the sibling list right after `after`.
    fn insert_atom_after(&mut self, section_id: SectionId, after: AtomId, atom_id: AtomId) {
        let next = self.atom(after).next;
        {
            let atom = self.atom_mut(atom_id);
            atom.section = section_id;
            atom.prev = after;
            atom.next = next;
        }
        self.atom_mut(after).next = atom_id;
        if next.is_null() {
            self.section_mut(section_id).last_atom = atom_id;
        } else {
            self.atom_mut(next).prev = atom_id;
        }
    }

    /// The trampoline a branch must detour through, if its source atom
    /// belongs to a thunk group that planned one for the target.
    pub(crate) fn thunk_address(&self, source_atom: AtomId, target: SymbolId) -> Option<u64> {
        let thunk_index = self.atom(source_atom).thunk?;
        let thunk = &self.thunks[thunk_index as usize];
        let trampoline = thunk.lookup.get(&target)?;
        Some(self.atom_address(*trampoline))
    }
}

pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(0x3fff, 0x4000), 0x4000);
    }
}
