//! BSD `ar` archives. Only the symbol directory is decoded eagerly; members
//! are pulled out lazily when the resolver first needs one.

use crate::ensure;
use crate::error::Error;
use crate::error::Result;
use crate::file::FileId;
use smallvec::SmallVec;
use std::path::PathBuf;

pub(crate) const ARCHIVE_MAGIC: &[u8; 8] = b"!<arch>\n";

const MEMBER_HEADER_SIZE: usize = 60;

#[derive(Debug)]
pub(crate) struct Archive {
    pub(crate) index: FileId,
    pub(crate) path: PathBuf,
    /// Dead until a member is pulled in.
    pub(crate) alive: bool,
    pub(crate) force_load: bool,
    data: Vec<u8>,
    /// Symbol name to offsets of the member headers defining it.
    toc: foldhash::HashMap<Vec<u8>, SmallVec<[u64; 2]>>,
    /// Member header offsets already handed out.
    pub(crate) loaded: foldhash::HashSet<u64>,
}

/// A member pulled out of the archive.
#[derive(Debug)]
pub(crate) struct ArchiveMember {
    pub(crate) name: PathBuf,
    pub(crate) data: Vec<u8>,
    pub(crate) mtime: u64,
}

#[derive(Debug, Clone, Copy)]
struct MemberHeader {
    name_start: usize,
    name_len: usize,
    data_start: usize,
    data_len: usize,
    mtime: u64,
    /// Offset of the next member header.
    next: usize,
}

impl Archive {
    pub(crate) fn parse(data: Vec<u8>, path: PathBuf, force_load: bool) -> Result<Archive> {
        if data.len() < ARCHIVE_MAGIC.len() {
            return Err(Error::EndOfStream);
        }
        if &data[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
            return Err(Error::NotArchive);
        }

        let mut archive = Archive {
            index: FileId::NULL,
            path,
            alive: force_load,
            force_load,
            data,
            toc: foldhash::HashMap::default(),
            loaded: foldhash::HashSet::default(),
        };

        // The symbol directory is the first member by convention.
        let first = parse_member_header(&archive.data, ARCHIVE_MAGIC.len())?;
        let name = &archive.data[first.name_start..first.name_start + first.name_len];
        if name.starts_with(b"__.SYMDEF") {
            archive.parse_symbol_directory(first)?;
        } else {
            tracing::warn!(
                "{}: archive has no symbol directory; only -force_load can use it",
                archive.path.display()
            );
        }
        Ok(archive)
    }

    /// Offsets of the member headers that define `name`.
    pub(crate) fn lookup(&self, name: &[u8]) -> &[u64] {
        self.toc.get(name).map_or(&[], |offsets| offsets.as_slice())
    }

    /// Extracts the member whose header is at `offset`. The same offset is
    /// handed out once; repeats return `None`.
    pub(crate) fn pull_member(&mut self, offset: u64) -> Result<Option<ArchiveMember>> {
        if !self.loaded.insert(offset) {
            return Ok(None);
        }
        let header = parse_member_header(&self.data, offset as usize)?;
        let name = &self.data[header.name_start..header.name_start + header.name_len];
        Ok(Some(ArchiveMember {
            name: PathBuf::from(String::from_utf8_lossy(name).into_owned()),
            data: self.data[header.data_start..header.data_start + header.data_len].to_vec(),
            mtime: header.mtime,
        }))
    }

    /// Header offsets of every object-bearing member, in file order.
    pub(crate) fn member_offsets(&self) -> Result<Vec<u64>> {
        let mut offsets = Vec::new();
        let mut offset = ARCHIVE_MAGIC.len();
        while offset + MEMBER_HEADER_SIZE <= self.data.len() {
            let header = parse_member_header(&self.data, offset)?;
            let name = &self.data[header.name_start..header.name_start + header.name_len];
            if !name.starts_with(b"__.SYMDEF") {
                offsets.push(offset as u64);
            }
            offset = header.next;
        }
        Ok(offsets)
    }

    fn parse_symbol_directory(&mut self, header: MemberHeader) -> Result {
        let dir = &self.data[header.data_start..header.data_start + header.data_len];
        let ranlib_size = read_u32(dir, 0)? as usize;
        let count = ranlib_size / 8;
        let strtab_size = read_u32(dir, 4 + ranlib_size)? as usize;
        let strtab_start = 4 + ranlib_size + 4;
        ensure!(
            strtab_start + strtab_size <= dir.len(),
            "{}: malformed archive symbol directory",
            self.path.display()
        );
        let strtab = &dir[strtab_start..strtab_start + strtab_size];

        for i in 0..count {
            let strx = read_u32(dir, 4 + i * 8)? as usize;
            let member_offset = read_u32(dir, 4 + i * 8 + 4)?;
            let rest = strtab.get(strx..).ok_or(Error::EndOfStream)?;
            let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            self.toc
                .entry(rest[..len].to_vec())
                .or_default()
                .push(u64::from(member_offset));
        }
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(Error::EndOfStream)?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(bytes))
}

fn parse_member_header(data: &[u8], offset: usize) -> Result<MemberHeader> {
    let header = data
        .get(offset..offset + MEMBER_HEADER_SIZE)
        .ok_or(Error::EndOfStream)?;
    ensure!(
        &header[58..60] == b"`\n",
        "malformed archive member header at offset {offset}"
    );

    let mtime = ascii_number(&header[16..28]).unwrap_or(0);
    let size = ascii_number(&header[48..58]).ok_or(Error::EndOfStream)? as usize;
    let mut data_start = offset + MEMBER_HEADER_SIZE;
    let mut data_len = size;

    let raw_name = trim_ascii(&header[0..16]);
    let (name_start, name_len) = if let Some(long_len) = raw_name.strip_prefix(b"#1/") {
        // BSD long name: the name occupies the start of the member data.
        let long_len = ascii_number(long_len).ok_or(Error::EndOfStream)? as usize;
        ensure!(long_len <= data_len, "archive member name overruns member");
        let start = data_start;
        data_start += long_len;
        data_len -= long_len;
        let name = data.get(start..start + long_len).ok_or(Error::EndOfStream)?;
        let trimmed = name.iter().position(|&b| b == 0).unwrap_or(long_len);
        (start, trimmed)
    } else {
        (offset, raw_name.len())
    };

    if data.len() < data_start + data_len {
        return Err(Error::EndOfStream);
    }

    // Members are 2-byte aligned, padded with a newline.
    let mut next = data_start + data_len;
    next += next & 1;

    Ok(MemberHeader {
        name_start,
        name_len,
        data_start,
        data_len,
        mtime,
        next,
    })
}

fn trim_ascii(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    &field[..end]
}

fn ascii_number(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(trim_ascii(field)).ok()?;
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, data: &[u8], out: &mut Vec<u8>) -> u64 {
        let offset = out.len() as u64;
        let mut header = vec![b' '; MEMBER_HEADER_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{}", data.len());
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58..60].copy_from_slice(b"`\n");
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        if out.len() & 1 == 1 {
            out.push(b'\n');
        }
        offset
    }

    fn build_archive() -> (Vec<u8>, u64) {
        // Symbol directory: `_foo` defined by the member that follows it.
        let mut symdef = Vec::new();
        let strtab = b"_foo\0";
        symdef.extend_from_slice(&8u32.to_le_bytes()); // ranlib bytes
        symdef.extend_from_slice(&0u32.to_le_bytes()); // ran_strx
        let member_offset_slot = symdef.len();
        symdef.extend_from_slice(&0u32.to_le_bytes()); // ran_off (patched)
        symdef.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
        symdef.extend_from_slice(strtab);

        let mut data = ARCHIVE_MAGIC.to_vec();
        // Reserve the directory member, patch the offset afterwards.
        member("__.SYMDEF", &symdef, &mut data);
        let foo_offset = member("foo.o", b"not really an object", &mut data);
        let patch_at = ARCHIVE_MAGIC.len() + MEMBER_HEADER_SIZE + member_offset_slot;
        data[patch_at..patch_at + 4].copy_from_slice(&(foo_offset as u32).to_le_bytes());
        (data, foo_offset)
    }

    #[test]
    fn toc_lookup_and_lazy_member_extraction() {
        let (data, foo_offset) = build_archive();
        let mut archive =
            Archive::parse(data, PathBuf::from("libfoo.a"), false).unwrap();
        assert_eq!(archive.lookup(b"_foo"), &[foo_offset]);
        assert!(archive.lookup(b"_bar").is_empty());

        let pulled = archive.pull_member(foo_offset).unwrap().unwrap();
        assert_eq!(pulled.name, PathBuf::from("foo.o"));
        assert_eq!(pulled.data, b"not really an object");
        // A second pull of the same member is a no-op.
        assert!(archive.pull_member(foo_offset).unwrap().is_none());
    }

    #[test]
    fn non_archives_are_rejected_recoverably() {
        let err = Archive::parse(vec![0u8; 64], PathBuf::from("x"), false).unwrap_err();
        assert!(matches!(err, Error::NotArchive));
        let err = Archive::parse(b"!<ar".to_vec(), PathBuf::from("x"), false).unwrap_err();
        assert!(matches!(err, Error::EndOfStream));
    }

    #[test]
    fn long_names_use_the_bsd_extension() {
        let mut data = ARCHIVE_MAGIC.to_vec();
        let mut payload = b"a_very_long_member_name.o\0\0\0".to_vec();
        payload.extend_from_slice(b"body");
        member("#1/28", &payload, &mut data);

        let header = parse_member_header(&data, ARCHIVE_MAGIC.len()).unwrap();
        let name = &data[header.name_start..header.name_start + header.name_len];
        assert_eq!(name, b"a_very_long_member_name.o");
        assert_eq!(
            &data[header.data_start..header.data_start + header.data_len],
            b"body"
        );
    }
}
