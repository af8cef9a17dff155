//! Append-only string arena. Every name in the link is interned once and
//! referred to by its stable byte offset thereafter.

use foldhash::fast::FixedState;
use hashbrown::HashTable;
use std::hash::BuildHasher;

/// Offset of an interned, NUL-terminated string. Offset 0 is the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StrOffset(pub(crate) u32);

impl StrOffset {
    pub(crate) const EMPTY: StrOffset = StrOffset(0);
}

pub(crate) struct StringPool {
    buf: Vec<u8>,
    lookup: HashTable<StrOffset>,
    hasher: FixedState,
}

impl StringPool {
    pub(crate) fn new() -> Self {
        StringPool {
            // Offset 0 is reserved for the empty string.
            buf: vec![0],
            lookup: HashTable::new(),
            hasher: FixedState::default(),
        }
    }

    /// Returns the offset of `name`, appending it if it has not been seen.
    /// Names must not contain NUL.
    pub(crate) fn intern(&mut self, name: &[u8]) -> StrOffset {
        debug_assert!(!name.contains(&0));
        if name.is_empty() {
            return StrOffset::EMPTY;
        }

        let hash = self.hasher.hash_one(name);
        let buf = &self.buf;
        if let Some(&offset) = self.lookup.find(hash, |&offset| str_at(buf, offset) == name) {
            return offset;
        }

        let offset = StrOffset(self.buf.len() as u32);
        self.buf.extend_from_slice(name);
        self.buf.push(0);
        let (buf, hasher) = (&self.buf, &self.hasher);
        self.lookup
            .insert_unique(hash, offset, |&offset| hasher.hash_one(str_at(buf, offset)));
        offset
    }

    pub(crate) fn get(&self, offset: StrOffset) -> &[u8] {
        str_at(&self.buf, offset)
    }

    /// The backing buffer: NUL-terminated strings, empty string at offset 0.
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn str_at(buf: &[u8], offset: StrOffset) -> &[u8] {
    let start = offset.0 as usize;
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(buf.len(), |n| start + n);
    &buf[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_deduplicating() {
        let mut pool = StringPool::new();
        let a = pool.intern(b"_main");
        let b = pool.intern(b"_puts");
        let a2 = pool.intern(b"_main");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), b"_main");
        assert_eq!(pool.get(b), b"_puts");
    }

    #[test]
    fn empty_string_is_offset_zero() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern(b""), StrOffset::EMPTY);
        assert_eq!(pool.get(StrOffset::EMPTY), b"");
        // Offsets handed out later never collide with the reserved slot.
        assert_ne!(pool.intern(b"x"), StrOffset::EMPTY);
    }

    #[test]
    fn prefix_names_do_not_collide() {
        let mut pool = StringPool::new();
        let long = pool.intern(b"_foobar");
        let short = pool.intern(b"_foo");
        assert_ne!(long, short);
        assert_eq!(pool.get(short), b"_foo");
        assert_eq!(pool.get(long), b"_foobar");
    }
}
