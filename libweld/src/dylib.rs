//! Dynamic libraries, in both forms we link against: a Mach-O dylib binary
//! (export list read from its trie, or its symtab on very old files) and the
//! textual `.tbd` stub shipped in SDKs (v4 YAML-subset and v5 JSON).

use crate::arch::Arch;
use crate::args::pack_version;
use crate::error::Error;
use crate::error::Result;
use crate::export_trie;
use crate::file::FileId;
use crate::macho::DylibCommand;
use crate::macho::DysymtabCommand;
use crate::macho::LinkeditDataCommand;
use crate::macho::MachHeader64;
use crate::macho::Nlist64;
use crate::macho::NlistExt;
use crate::macho::SymtabCommand;
use crate::macho::pod_at;
use crate::macho::pod_slice_at;
use object::LittleEndian;
use object::macho;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct Dylib {
    pub(crate) index: FileId,
    pub(crate) path: PathBuf,
    /// Dead until the resolver binds a symbol to it.
    pub(crate) alive: bool,
    pub(crate) weak: bool,
    pub(crate) install_name: String,
    pub(crate) current_version: u32,
    pub(crate) compatibility_version: u32,
    exports: foldhash::HashSet<Vec<u8>>,
    /// 1-based load ordinal, assigned at first reference.
    pub(crate) ordinal: Option<u16>,
}

impl Dylib {
    pub(crate) fn exports(&self, name: &[u8]) -> bool {
        self.exports.contains(name)
    }

    fn empty(path: PathBuf, weak: bool) -> Dylib {
        Dylib {
            index: FileId::NULL,
            path,
            alive: false,
            weak,
            install_name: String::new(),
            current_version: pack_version(1, 0, 0),
            compatibility_version: pack_version(1, 0, 0),
            exports: foldhash::HashSet::default(),
            ordinal: None,
        }
    }

    /// Parses a Mach-O dylib. `NotDylib` and `EndOfStream` invite the caller
    /// to retry the bytes as a text stub.
    pub(crate) fn parse_binary(
        data: &[u8],
        path: PathBuf,
        weak: bool,
        arch: Arch,
    ) -> Result<Dylib> {
        if data.len() < 4 {
            return Err(Error::EndOfStream);
        }
        let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
        if magic != macho::MH_MAGIC_64 {
            return Err(Error::NotDylib);
        }
        let header = pod_at::<MachHeader64>(data, 0)?;
        if header.filetype.get(LittleEndian) != macho::MH_DYLIB {
            return Err(Error::NotDylib);
        }
        if header.cputype.get(LittleEndian) != arch.cpu_type() {
            return Err(Error::MismatchedCpuArchitecture { path });
        }

        let mut dylib = Dylib::empty(path, weak);
        let mut trie: Option<(u32, u32)> = None;
        let mut symtab: Option<SymtabCommand> = None;
        let mut dysymtab: Option<DysymtabCommand> = None;

        let ncmds = header.ncmds.get(LittleEndian);
        let mut offset = size_of::<MachHeader64>();
        for _ in 0..ncmds {
            let cmd = pod_at::<object::U32<LittleEndian>>(data, offset)?.get(LittleEndian);
            let cmdsize =
                pod_at::<object::U32<LittleEndian>>(data, offset + 4)?.get(LittleEndian) as usize;
            crate::ensure!(cmdsize >= 8, "{}: malformed load command", dylib.path.display());

            match cmd {
                macho::LC_ID_DYLIB => {
                    let id = pod_at::<DylibCommand>(data, offset)?;
                    let name_offset = id.dylib.name.offset.get(LittleEndian) as usize;
                    let name = data
                        .get(offset + name_offset..offset + cmdsize)
                        .ok_or(Error::EndOfStream)?;
                    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                    dylib.install_name = String::from_utf8_lossy(&name[..len]).into_owned();
                    dylib.current_version = id.dylib.current_version.get(LittleEndian);
                    dylib.compatibility_version = id.dylib.compatibility_version.get(LittleEndian);
                }
                macho::LC_DYLD_INFO | macho::LC_DYLD_INFO_ONLY => {
                    let info = pod_at::<crate::macho::DyldInfoCommand>(data, offset)?;
                    trie = Some((
                        info.export_off.get(LittleEndian),
                        info.export_size.get(LittleEndian),
                    ));
                }
                macho::LC_DYLD_EXPORTS_TRIE => {
                    let cmd = pod_at::<LinkeditDataCommand>(data, offset)?;
                    trie = Some((
                        cmd.dataoff.get(LittleEndian),
                        cmd.datasize.get(LittleEndian),
                    ));
                }
                macho::LC_SYMTAB => {
                    symtab = Some(*pod_at::<SymtabCommand>(data, offset)?);
                }
                macho::LC_DYSYMTAB => {
                    dysymtab = Some(*pod_at::<DysymtabCommand>(data, offset)?);
                }
                _ => {}
            }
            offset += cmdsize;
        }

        match trie {
            Some((trie_offset, trie_size)) if trie_size > 0 => {
                let bytes = data
                    .get(trie_offset as usize..(trie_offset + trie_size) as usize)
                    .ok_or(Error::EndOfStream)?;
                for export in export_trie::parse(bytes)? {
                    dylib.exports.insert(export.name);
                }
            }
            _ => {
                // Pre-trie dylib: the externally-defined symtab range is the
                // export list.
                if let (Some(symtab), Some(dysymtab)) = (symtab, dysymtab) {
                    let symoff = symtab.symoff.get(LittleEndian) as usize;
                    let nsyms = symtab.nsyms.get(LittleEndian) as usize;
                    let stroff = symtab.stroff.get(LittleEndian) as usize;
                    let strsize = symtab.strsize.get(LittleEndian) as usize;
                    let strtab = data.get(stroff..stroff + strsize).ok_or(Error::EndOfStream)?;
                    let nlists = pod_slice_at::<Nlist64>(data, symoff, nsyms)?;
                    let start = dysymtab.iextdefsym.get(LittleEndian) as usize;
                    let count = dysymtab.nextdefsym.get(LittleEndian) as usize;
                    for nlist in nlists.get(start..start + count).ok_or(Error::EndOfStream)? {
                        if !nlist.is_ext() {
                            continue;
                        }
                        let strx = nlist.n_strx.get(LittleEndian) as usize;
                        if let Some(rest) = strtab.get(strx..) {
                            let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                            dylib.exports.insert(rest[..len].to_vec());
                        }
                    }
                }
            }
        }

        Ok(dylib)
    }

    /// Parses a text-based stub. v4 is the YAML subset tapi emits; v5 is
    /// JSON. Only the first document of a multi-document stub matters: it
    /// describes the library itself, later documents its reexports.
    pub(crate) fn parse_tbd(data: &[u8], path: PathBuf, weak: bool) -> Result<Dylib> {
        let text = std::str::from_utf8(data).map_err(|_| Error::NotDylib)?;
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            return parse_tbd_v5(text, path, weak);
        }
        if !trimmed.starts_with("---") {
            return Err(Error::NotDylib);
        }
        parse_tbd_v4(text, path, weak)
    }
}

/// Reads a `[ a, b, c ]` flow list starting after `start`; the list may span
/// lines.
fn read_flow_list(text: &str, start: usize) -> Option<(Vec<String>, usize)> {
    let open = text[start..].find('[')? + start;
    let close = text[open..].find(']')? + open;
    let items = text[open + 1..close]
        .split(',')
        .map(|item| item.trim().trim_matches('\'').trim_matches('"').to_string())
        .filter(|item| !item.is_empty())
        .collect();
    Some((items, close + 1))
}

fn scalar_value(line: &str) -> &str {
    line.split_once(':')
        .map(|(_, value)| value.trim().trim_matches('\'').trim_matches('"'))
        .unwrap_or("")
}

fn parse_tbd_version(value: &str) -> u32 {
    let mut parts = value.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    pack_version(major, minor, patch)
}

fn push_export(exports: &mut foldhash::HashSet<Vec<u8>>, name: &str) {
    exports.insert(name.as_bytes().to_vec());
}

fn push_objc_class(exports: &mut foldhash::HashSet<Vec<u8>>, class: &str) {
    exports.insert(format!("_OBJC_CLASS_$_{class}").into_bytes());
    exports.insert(format!("_OBJC_METACLASS_$_{class}").into_bytes());
}

fn parse_tbd_v4(text: &str, path: PathBuf, weak: bool) -> Result<Dylib> {
    let mut dylib = Dylib::empty(path, weak);

    let body = text;
    let mut pos = 0;
    let mut documents_seen = 0;
    while pos < body.len() {
        let line_end = body[pos..].find('\n').map_or(body.len(), |n| pos + n);
        let line = &body[pos..line_end];
        let key = line.trim_start();

        if key.starts_with("---") {
            documents_seen += 1;
            if documents_seen > 1 {
                break;
            }
        } else if key.starts_with("install-name:") {
            dylib.install_name = scalar_value(key).to_string();
        } else if key.starts_with("current-version:") {
            dylib.current_version = parse_tbd_version(scalar_value(key));
        } else if key.starts_with("compatibility-version:") {
            dylib.compatibility_version = parse_tbd_version(scalar_value(key));
        } else if key.starts_with("symbols:") {
            if let Some((names, next)) = read_flow_list(body, pos) {
                for name in names {
                    push_export(&mut dylib.exports, &name);
                }
                pos = next;
                continue;
            }
        } else if key.starts_with("weak-symbols:") {
            if let Some((names, next)) = read_flow_list(body, pos) {
                for name in names {
                    push_export(&mut dylib.exports, &name);
                }
                pos = next;
                continue;
            }
        } else if key.starts_with("objc-classes:") {
            if let Some((names, next)) = read_flow_list(body, pos) {
                for name in names {
                    push_objc_class(&mut dylib.exports, &name);
                }
                pos = next;
                continue;
            }
        }

        pos = line_end + 1;
    }

    if dylib.install_name.is_empty() {
        return Err(Error::NotDylib);
    }
    Ok(dylib)
}

/// v5 stubs are JSON. A full JSON parser is not warranted for the four keys
/// we need, so this walks tokens and collects, per key, every string in the
/// array value that follows it.
fn parse_tbd_v5(text: &str, path: PathBuf, weak: bool) -> Result<Dylib> {
    let mut dylib = Dylib::empty(path, weak);

    let mut tokens = Vec::new(); // (key, strings-in-following-array)
    let bytes = text.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] != b'"' {
            pos += 1;
            continue;
        }
        let (string, after) = match json_string(text, pos) {
            Some(parsed) => parsed,
            None => break,
        };
        pos = after;
        let rest = text[pos..].trim_start();
        if let Some(rest) = rest.strip_prefix(':') {
            let rest = rest.trim_start();
            if rest.starts_with('[') {
                // Only harvest the arrays we care about; containers like
                // `exported_symbols` must stay open so their inner keys are
                // visited.
                if matches!(
                    string.as_str(),
                    "install_names" | "global" | "weak" | "objc_class"
                ) {
                    let array_start = text.len() - rest.len();
                    let (strings, after) = json_string_array(text, array_start);
                    tokens.push((string, strings));
                    pos = after;
                }
            } else if rest.starts_with('"') {
                let value_start = text.len() - rest.len();
                if let Some((value, after)) = json_string(text, value_start) {
                    tokens.push((string.clone(), vec![value]));
                    pos = after;
                }
            }
        }
    }

    for (key, strings) in tokens {
        match key.as_str() {
            "install_names" => {
                if let Some(first) = strings.first() {
                    dylib.install_name = first.clone();
                }
            }
            "global" | "weak" => {
                for name in &strings {
                    push_export(&mut dylib.exports, name);
                }
            }
            "objc_class" => {
                for name in &strings {
                    push_objc_class(&mut dylib.exports, name);
                }
            }
            "version" => {
                if dylib.current_version == pack_version(1, 0, 0) {
                    if let Some(first) = strings.first() {
                        dylib.current_version = parse_tbd_version(first);
                    }
                }
            }
            _ => {}
        }
    }

    if dylib.install_name.is_empty() {
        return Err(Error::NotDylib);
    }
    Ok(dylib)
}

/// Parses the JSON string starting at `start` (which must be a quote).
/// Returns the unescaped content and the position after the closing quote.
fn json_string(text: &str, start: usize) -> Option<(String, usize)> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes[start], b'"');
    let mut out = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Some((out, pos + 1)),
            b'\\' => {
                let escaped = *bytes.get(pos + 1)?;
                out.push(escaped as char);
                pos += 2;
            }
            other => {
                out.push(other as char);
                pos += 1;
            }
        }
    }
    None
}

/// Collects the top-level strings of the array starting at `start` (a `[`),
/// descending into nested objects/arrays. Returns the strings and the
/// position after the matching `]`.
fn json_string_array(text: &str, start: usize) -> (Vec<String>, usize) {
    let bytes = text.as_bytes();
    let mut strings = Vec::new();
    let mut depth = 0usize;
    let mut pos = start;
    while pos < bytes.len() {
        match bytes[pos] {
            b'[' | b'{' => {
                depth += 1;
                pos += 1;
            }
            b']' | b'}' => {
                depth -= 1;
                pos += 1;
                if depth == 0 {
                    break;
                }
            }
            b'"' => match json_string(text, pos) {
                Some((string, after)) => {
                    // Skip key strings (followed by a colon).
                    let is_key = text[after..].trim_start().starts_with(':');
                    if !is_key {
                        strings.push(string);
                    }
                    pos = after;
                }
                None => break,
            },
            _ => pos += 1,
        }
    }
    (strings, pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TBD_V4: &str = "\
--- !tapi-tbd
tbd-version:     4
targets:         [ x86_64-macos, arm64-macos ]
install-name:    '/usr/lib/libSystem.B.dylib'
current-version: 1311.100.3
exports:
  - targets:      [ x86_64-macos, arm64-macos ]
    symbols:      [ _puts, _printf,
                    _malloc ]
    weak-symbols: [ _weak_thing ]
    objc-classes: [ NSObject ]
--- !tapi-tbd
tbd-version:     4
install-name:    '/usr/lib/libreexported.dylib'
exports:
  - targets:      [ arm64-macos ]
    symbols:      [ _hidden_reexport ]
...
";

    #[test]
    fn tbd_v4_first_document_only() {
        let dylib =
            Dylib::parse_tbd(TBD_V4.as_bytes(), PathBuf::from("libSystem.tbd"), false).unwrap();
        assert_eq!(dylib.install_name, "/usr/lib/libSystem.B.dylib");
        assert_eq!(dylib.current_version, pack_version(1311, 100, 3));
        assert!(dylib.exports(b"_puts"));
        assert!(dylib.exports(b"_malloc"));
        assert!(dylib.exports(b"_weak_thing"));
        assert!(dylib.exports(b"_OBJC_CLASS_$_NSObject"));
        assert!(dylib.exports(b"_OBJC_METACLASS_$_NSObject"));
        assert!(!dylib.exports(b"_hidden_reexport"));
    }

    const TBD_V5: &str = r#"
{
  "tapi_tbd_version": 5,
  "main_library": {
    "install_names": [ { "name": "/usr/lib/libc++.1.dylib" } ],
    "exported_symbols": [
      {
        "text": {
          "global": [ "__ZdlPv", "__Znwm" ],
          "weak": [ "__ZTSt9bad_alloc" ]
        },
        "data": { "objc_class": [ "Wrapper" ] }
      }
    ]
  }
}
"#;

    #[test]
    fn tbd_v5_json_extraction() {
        let dylib =
            Dylib::parse_tbd(TBD_V5.as_bytes(), PathBuf::from("libc++.tbd"), false).unwrap();
        assert_eq!(dylib.install_name, "/usr/lib/libc++.1.dylib");
        assert!(dylib.exports(b"__ZdlPv"));
        assert!(dylib.exports(b"__Znwm"));
        assert!(dylib.exports(b"__ZTSt9bad_alloc"));
        assert!(dylib.exports(b"_OBJC_CLASS_$_Wrapper"));
    }

    #[test]
    fn garbage_is_rejected_recoverably() {
        assert!(matches!(
            Dylib::parse_tbd(b"\x00\x01binary", PathBuf::from("x"), false),
            Err(Error::NotDylib)
        ));
        assert!(matches!(
            Dylib::parse_binary(b"!<arch>\n", PathBuf::from("x"), false, Arch::Aarch64),
            Err(Error::NotDylib)
        ));
    }
}
