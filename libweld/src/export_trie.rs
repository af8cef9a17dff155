//! The export trie: a prefix-compressed map from exported name to
//! `(flags, image offset)`. The builder serializes with the two-pass offset
//! scheme (size, then emit, repeated until the ULEB node offsets settle);
//! the reader is used both to ingest binary dylib export lists and to check
//! round-trips.

use crate::ensure;
use crate::error::Error;
use crate::error::Result;
use crate::leb::read_uleb128;
use crate::leb::uleb128_len;
use crate::leb::write_uleb128;
use object::macho;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Export {
    pub(crate) name: Vec<u8>,
    pub(crate) flags: u64,
    /// Offset of the symbol from the image base.
    pub(crate) address: u64,
}

#[derive(Debug, Default)]
struct Node {
    terminal: Option<(u64, u64)>,
    /// Edge labels with the node each leads to.
    edges: Vec<(Vec<u8>, u32)>,
    /// Byte offset within the serialized trie, fixed up iteratively.
    offset: u32,
}

#[derive(Debug)]
pub(crate) struct TrieBuilder {
    nodes: Vec<Node>,
}

impl TrieBuilder {
    pub(crate) fn new() -> TrieBuilder {
        TrieBuilder {
            nodes: vec![Node::default()],
        }
    }

    /// Inserts `name`; callers feed names in sorted order so edge creation
    /// order, and with it the serialized bytes, are deterministic.
    pub(crate) fn insert(&mut self, name: &[u8], flags: u64, address: u64) {
        let mut node = 0usize;
        let mut rest = name;

        'descend: loop {
            for edge_index in 0..self.nodes[node].edges.len() {
                let (label, child) = {
                    let (label, child) = &self.nodes[node].edges[edge_index];
                    (label.clone(), *child)
                };
                let common = common_prefix(&label, rest);
                if common == 0 {
                    continue;
                }
                if common == label.len() {
                    node = child as usize;
                    rest = &rest[common..];
                    continue 'descend;
                }

                // Split the edge: keep the shared prefix, push the tail down
                // into a fresh interior node.
                let mid = self.push_node(Node::default());
                let (head, tail) = label.split_at(common);
                self.nodes[mid as usize].edges.push((tail.to_vec(), child));
                self.nodes[node].edges[edge_index] = (head.to_vec(), mid);
                node = mid as usize;
                rest = &rest[common..];
                continue 'descend;
            }

            if rest.is_empty() {
                self.nodes[node].terminal = Some((flags, address));
                return;
            }

            let leaf = self.push_node(Node {
                terminal: Some((flags, address)),
                ..Node::default()
            });
            self.nodes[node].edges.push((rest.to_vec(), leaf));
            return;
        }
    }

    fn push_node(&mut self, node: Node) -> u32 {
        self.nodes.push(node);
        self.nodes.len() as u32 - 1
    }

    /// Serializes the trie. Node offsets appear inside ULEBs, so sizing and
    /// offset assignment loop until they stop moving.
    pub(crate) fn build(mut self) -> Vec<u8> {
        loop {
            let mut offset = 0u32;
            let mut changed = false;
            for index in 0..self.nodes.len() {
                if self.nodes[index].offset != offset {
                    self.nodes[index].offset = offset;
                    changed = true;
                }
                offset += self.node_size(index) as u32;
            }
            if !changed {
                break;
            }
        }

        let mut out = Vec::new();
        for index in 0..self.nodes.len() {
            debug_assert_eq!(out.len() as u32, self.nodes[index].offset);
            self.emit_node(index, &mut out);
        }
        out
    }

    fn terminal_payload(terminal: (u64, u64)) -> usize {
        uleb128_len(terminal.0) + uleb128_len(terminal.1)
    }

    fn node_size(&self, index: usize) -> usize {
        let node = &self.nodes[index];
        let mut size = match node.terminal {
            Some(terminal) => {
                let payload = Self::terminal_payload(terminal);
                uleb128_len(payload as u64) + payload
            }
            None => 1,
        };
        size += 1; // edge count
        for (label, child) in &node.edges {
            size += label.len() + 1;
            size += uleb128_len(u64::from(self.nodes[*child as usize].offset));
        }
        size
    }

    fn emit_node(&self, index: usize, out: &mut Vec<u8>) {
        let node = &self.nodes[index];
        match node.terminal {
            Some((flags, address)) => {
                write_uleb128(out, Self::terminal_payload((flags, address)) as u64);
                write_uleb128(out, flags);
                write_uleb128(out, address);
            }
            None => out.push(0),
        }
        out.push(node.edges.len() as u8);
        for (label, child) in &node.edges {
            out.extend_from_slice(label);
            out.push(0);
            write_uleb128(out, u64::from(self.nodes[*child as usize].offset));
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Walks a serialized trie, returning its exports sorted by name.
pub(crate) fn parse(data: &[u8]) -> Result<Vec<Export>> {
    let mut exports = Vec::new();
    if !data.is_empty() {
        let mut prefix = Vec::new();
        walk(data, 0, &mut prefix, &mut exports, 0)?;
    }
    exports.sort();
    Ok(exports)
}

fn walk(
    data: &[u8],
    node_offset: usize,
    prefix: &mut Vec<u8>,
    exports: &mut Vec<Export>,
    depth: u32,
) -> Result {
    // A trie deeper than any plausible symbol name means a cycle.
    ensure!(depth < 4096, "export trie is cyclic or malformed");

    let mut pos = node_offset;
    let payload = read_uleb128(data, &mut pos).ok_or(Error::EndOfStream)?;
    if payload > 0 {
        let payload_end = pos + payload as usize;
        let flags = read_uleb128(data, &mut pos).ok_or(Error::EndOfStream)?;
        let address = if flags & u64::from(macho::EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
            // Re-exports carry an ordinal and an imported name instead.
            0
        } else {
            read_uleb128(data, &mut pos).ok_or(Error::EndOfStream)?
        };
        exports.push(Export {
            name: prefix.clone(),
            flags,
            address,
        });
        pos = payload_end;
    }

    let edge_count = *data.get(pos).ok_or(Error::EndOfStream)?;
    pos += 1;
    for _ in 0..edge_count {
        let label_start = pos;
        let label_len = data[label_start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::EndOfStream)?;
        pos = label_start + label_len + 1;
        let child = read_uleb128(data, &mut pos).ok_or(Error::EndOfStream)? as usize;
        ensure!(child < data.len(), "export trie edge points past the trie");

        prefix.extend_from_slice(&data[label_start..label_start + label_len]);
        walk(data, child, prefix, exports, depth + 1)?;
        prefix.truncate(prefix.len() - label_len);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[(&str, u64, u64)]) -> Vec<u8> {
        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort();
        let mut builder = TrieBuilder::new();
        for (name, flags, address) in sorted {
            builder.insert(name.as_bytes(), flags, address);
        }
        builder.build()
    }

    #[test]
    fn round_trip_recovers_exports_in_sorted_order() {
        let entries: &[(&str, u64, u64)] = &[
            ("__ZN3foo3barEv", 0, 0x1000),
            ("__ZN3foo3bazEv", 0, 0x1040),
            ("_main", 0, 0x2000),
        ];
        let trie = build(entries);
        let exports = parse(&trie).unwrap();
        assert_eq!(exports.len(), 3);
        assert_eq!(exports[0].name, b"__ZN3foo3barEv");
        assert_eq!(exports[0].address, 0x1000);
        assert_eq!(exports[1].name, b"__ZN3foo3bazEv");
        assert_eq!(exports[1].address, 0x1040);
        assert_eq!(exports[2].name, b"_main");
        assert_eq!(exports[2].address, 0x2000);
    }

    #[test]
    fn shared_prefixes_are_stored_once() {
        let trie = build(&[("_aaab", 0, 1), ("_aaac", 0, 2)]);
        // "_aaa" appears once; only the final bytes fork.
        let haystack = trie.windows(4).filter(|w| *w == b"_aaa").count();
        assert_eq!(haystack, 1);
        let exports = parse(&trie).unwrap();
        assert_eq!(exports[0].name, b"_aaab");
        assert_eq!(exports[1].name, b"_aaac");
    }

    #[test]
    fn weak_flags_survive() {
        let trie = build(&[(
            "__Z3foov",
            u64::from(macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION),
            0x40,
        )]);
        let exports = parse(&trie).unwrap();
        assert_eq!(
            exports[0].flags,
            u64::from(macho::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION)
        );
    }

    #[test]
    fn empty_trie_has_no_exports() {
        assert!(parse(&[]).unwrap().is_empty());
        let trie = TrieBuilder::new().build();
        assert!(parse(&trie).unwrap().is_empty());
    }
}
