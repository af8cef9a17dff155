//! Linker-internal symbols. Externally-visible names resolve to exactly one
//! symbol for the whole link; locals are per-object. Everything refers to a
//! symbol by its index, so a resolver replacement (rewriting the winning
//! definition in place) is invisible to existing references.

use crate::atom::AtomId;
use crate::file::FileId;
use crate::intern::StrOffset;

/// Index into the linker's symbol vector. Index 0 is the null symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SymbolId(pub(crate) u32);

impl SymbolId {
    pub(crate) const NULL: SymbolId = SymbolId(0);

    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SymbolFlags(u16);

impl SymbolFlags {
    pub(crate) const IMPORT: SymbolFlags = SymbolFlags(1 << 0);
    pub(crate) const EXPORT: SymbolFlags = SymbolFlags(1 << 1);
    pub(crate) const WEAK: SymbolFlags = SymbolFlags(1 << 2);
    pub(crate) const WEAK_REF: SymbolFlags = SymbolFlags(1 << 3);
    pub(crate) const BOUNDARY: SymbolFlags = SymbolFlags(1 << 4);
    pub(crate) const TENTATIVE: SymbolFlags = SymbolFlags(1 << 5);
    pub(crate) const LOCAL: SymbolFlags = SymbolFlags(1 << 6);
    pub(crate) const PRIVATE_EXTERN: SymbolFlags = SymbolFlags(1 << 7);
    pub(crate) const REFERENCED_DYNAMICALLY: SymbolFlags = SymbolFlags(1 << 8);
    pub(crate) const NO_DEAD_STRIP: SymbolFlags = SymbolFlags(1 << 9);

    pub(crate) fn contains(self, other: SymbolFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: SymbolFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: SymbolFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SymbolFlags {
    type Output = SymbolFlags;

    fn bitor(self, rhs: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Symbol {
    pub(crate) name: StrOffset,
    pub(crate) value: u64,
    /// Defining atom; null for imports, absolute-style synthetics and
    /// boundary symbols before placement.
    pub(crate) atom: AtomId,
    /// Defining file; the null file for synthetic globals.
    pub(crate) file: FileId,
    /// Index of the defining nlist within that file, `u32::MAX` for symbols
    /// with no on-disk counterpart.
    pub(crate) nlist_index: u32,
    pub(crate) flags: SymbolFlags,
    /// log2 alignment requested by a tentative definition.
    pub(crate) common_align: u8,
}

impl Symbol {
    pub(crate) const NO_NLIST: u32 = u32::MAX;

    pub(crate) fn new(name: StrOffset) -> Symbol {
        Symbol {
            name,
            value: 0,
            atom: AtomId::NULL,
            file: FileId::NULL,
            nlist_index: Symbol::NO_NLIST,
            flags: SymbolFlags::default(),
            common_align: 0,
        }
    }

    pub(crate) fn is_import(&self) -> bool {
        self.flags.contains(SymbolFlags::IMPORT)
    }

    pub(crate) fn is_tentative(&self) -> bool {
        self.flags.contains(SymbolFlags::TENTATIVE)
    }

    pub(crate) fn is_weak(&self) -> bool {
        self.flags.contains(SymbolFlags::WEAK)
    }

    pub(crate) fn is_local(&self) -> bool {
        self.flags.contains(SymbolFlags::LOCAL)
    }

    /// Undefined: neither defined by an atom nor resolved to a dylib nor
    /// synthesized.
    pub(crate) fn is_undefined(&self) -> bool {
        self.atom.is_null()
            && !self.is_import()
            && !self.flags.contains(SymbolFlags::BOUNDARY)
            && !self.is_tentative()
            && self.nlist_index != Symbol::NO_NLIST
    }
}

/// Extra per-symbol state that only a minority of symbols carry, keyed by
/// symbol id at the linker level.
#[derive(Debug, Default)]
pub(crate) struct SymbolSideTables {
    /// 1-based dylib ordinal, or a negative special ordinal.
    pub(crate) ordinals: foldhash::HashMap<SymbolId, i16>,
    pub(crate) boundaries: foldhash::HashMap<SymbolId, BoundarySpec>,
}

/// A `segment$start$…`-family placement request.
#[derive(Debug, Clone)]
pub(crate) struct BoundarySpec {
    pub(crate) segment: String,
    /// Section boundaries name one; segment boundaries leave this empty.
    pub(crate) section: Option<String>,
    pub(crate) start: bool,
}
