//! The atom is the unit of layout: a named, aligned byte range with a symbol,
//! a relocation slice and a position in its output section's sibling list.
//! Atoms are created during parse or synthesis and never destroyed; identity
//! is the index into the linker's atom vector.

use crate::file::FileId;
use crate::intern::StrOffset;
use crate::layout::SectionId;
use crate::symbol::SymbolId;

/// Index into the linker's atom vector. Index 0 is the null atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AtomId(pub(crate) u32);

impl AtomId {
    pub(crate) const NULL: AtomId = AtomId(0);

    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Range into a file's sorted relocation (or data-in-code) pool.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PoolSlice {
    pub(crate) start: u32,
    pub(crate) len: u32,
}

impl PoolSlice {
    pub(crate) fn range(self) -> std::ops::Range<usize> {
        self.start as usize..(self.start + self.len) as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Atom {
    pub(crate) name: StrOffset,
    /// Owning input file; the null file for synthesized atoms.
    pub(crate) file: FileId,
    /// 1-based input section ordinal within the owning object, 0 for
    /// synthesized atoms.
    pub(crate) n_sect: u32,
    pub(crate) size: u64,
    /// log2 alignment.
    pub(crate) align: u8,
    pub(crate) relocs: PoolSlice,
    pub(crate) dice: PoolSlice,
    /// The symbol this atom carries.
    pub(crate) sym: SymbolId,
    /// Output section this atom was appended to.
    pub(crate) section: SectionId,
    /// Offset within the output section, assigned by the allocator.
    pub(crate) off: u64,
    pub(crate) next: AtomId,
    pub(crate) prev: AtomId,
    pub(crate) live: bool,
    /// Thunk group servicing this atom's out-of-range branches (aarch64).
    pub(crate) thunk: Option<u32>,
}

impl Atom {
    pub(crate) fn new(name: StrOffset, file: FileId, sym: SymbolId) -> Atom {
        Atom {
            name,
            file,
            n_sect: 0,
            size: 0,
            align: 0,
            relocs: PoolSlice::default(),
            dice: PoolSlice::default(),
            sym,
            section: SectionId::NULL,
            off: 0,
            next: AtomId::NULL,
            prev: AtomId::NULL,
            live: true,
            thunk: None,
        }
    }

    /// log2 alignment as a byte multiple.
    pub(crate) fn alignment(&self) -> u64 {
        1 << self.align
    }
}
