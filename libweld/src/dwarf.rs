//! Just enough DWARF to label stabs: the name and comp-dir of the first
//! compile unit. Anything this reader does not understand simply yields no
//! summary; debug info is never load-bearing for the link itself.

use std::ops::Range;

#[derive(Debug, Clone)]
pub(crate) struct DwarfSummary {
    pub(crate) comp_dir: Vec<u8>,
    pub(crate) tu_name: Vec<u8>,
}

const DW_TAG_COMPILE_UNIT: u64 = 0x11;
const DW_AT_NAME: u64 = 0x03;
const DW_AT_COMP_DIR: u64 = 0x1b;

const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_BLOCK2: u64 = 0x03;
const DW_FORM_BLOCK4: u64 = 0x04;
const DW_FORM_DATA2: u64 = 0x05;
const DW_FORM_DATA4: u64 = 0x06;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_BLOCK: u64 = 0x09;
const DW_FORM_BLOCK1: u64 = 0x0a;
const DW_FORM_DATA1: u64 = 0x0b;
const DW_FORM_FLAG: u64 = 0x0c;
const DW_FORM_SDATA: u64 = 0x0d;
const DW_FORM_STRP: u64 = 0x0e;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_REF1: u64 = 0x11;
const DW_FORM_REF2: u64 = 0x12;
const DW_FORM_REF4: u64 = 0x13;
const DW_FORM_REF8: u64 = 0x14;
const DW_FORM_REF_UDATA: u64 = 0x15;
const DW_FORM_SEC_OFFSET: u64 = 0x17;
const DW_FORM_EXPRLOC: u64 = 0x18;
const DW_FORM_FLAG_PRESENT: u64 = 0x19;
const DW_FORM_STRX1: u64 = 0x25;
const DW_FORM_STRX2: u64 = 0x26;
const DW_FORM_STRX3: u64 = 0x27;
const DW_FORM_STRX4: u64 = 0x28;
const DW_FORM_LINE_STRP: u64 = 0x1f;
const DW_FORM_IMPLICIT_CONST: u64 = 0x21;
const DW_FORM_ADDRX1: u64 = 0x29;
const DW_FORM_ADDRX2: u64 = 0x2a;
const DW_FORM_ADDRX3: u64 = 0x2b;
const DW_FORM_ADDRX4: u64 = 0x2c;

struct Reader<'data> {
    data: &'data [u8],
    pos: usize,
}

impl<'data> Reader<'data> {
    fn new(data: &'data [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, count: usize) -> Option<&'data [u8]> {
        let out = self.data.get(self.pos..self.pos + count)?;
        self.pos += count;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes(b.try_into().unwrap()))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn uleb(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f).checked_shl(shift)?;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }

    fn sleb(&mut self) -> Option<i64> {
        let mut value = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Some(value);
            }
        }
    }

    fn cstr(&mut self) -> Option<Range<usize>> {
        let start = self.pos;
        let len = self.data[start..].iter().position(|&b| b == 0)?;
        self.pos = start + len + 1;
        Some(start..start + len)
    }
}

/// Decodes the attribute list of the compile-unit DIE of the first unit in
/// `info`. Returns `None` when anything looks unfamiliar.
pub(crate) fn parse_summary(info: &[u8], abbrev: &[u8], strings: &[u8]) -> Option<DwarfSummary> {
    let mut reader = Reader::new(info);

    let unit_length = reader.u32()?;
    if unit_length == 0xffff_ffff {
        // 64-bit DWARF is not produced by the toolchains we consume.
        return None;
    }
    let version = reader.u16()?;
    let (abbrev_offset, address_size) = match version {
        2..=4 => {
            let offset = reader.u32()?;
            (offset, reader.u8()?)
        }
        5 => {
            let unit_type = reader.u8()?;
            if unit_type != 0x01 {
                return None;
            }
            let address_size = reader.u8()?;
            (reader.u32()?, address_size)
        }
        _ => return None,
    };

    let abbrev_code = reader.uleb()?;
    let attrs = find_abbrev(abbrev.get(abbrev_offset as usize..)?, abbrev_code)?;

    let mut comp_dir = None;
    let mut tu_name = None;
    for (attr, form, _implicit) in attrs {
        let value = read_form(&mut reader, form, address_size, strings)?;
        match attr {
            DW_AT_NAME => tu_name = value,
            DW_AT_COMP_DIR => comp_dir = value,
            _ => {}
        }
    }

    Some(DwarfSummary {
        comp_dir: comp_dir?,
        tu_name: tu_name?,
    })
}

type AbbrevAttr = (u64, u64, i64);

/// Finds the declaration for `code` and checks it is a compile unit.
fn find_abbrev(table: &[u8], code: u64) -> Option<Vec<AbbrevAttr>> {
    let mut reader = Reader::new(table);
    loop {
        let decl_code = reader.uleb()?;
        if decl_code == 0 {
            return None;
        }
        let tag = reader.uleb()?;
        let _has_children = reader.u8()?;
        let mut attrs = Vec::new();
        loop {
            let attr = reader.uleb()?;
            let form = reader.uleb()?;
            if attr == 0 && form == 0 {
                break;
            }
            let implicit = if form == DW_FORM_IMPLICIT_CONST {
                reader.sleb()?
            } else {
                0
            };
            attrs.push((attr, form, implicit));
        }
        if decl_code == code {
            if tag != DW_TAG_COMPILE_UNIT {
                return None;
            }
            return Some(attrs);
        }
    }
}

/// Consumes one attribute value, returning string payloads and skipping the
/// rest.
fn read_form(
    reader: &mut Reader,
    form: u64,
    address_size: u8,
    strings: &[u8],
) -> Option<Option<Vec<u8>>> {
    let value = match form {
        DW_FORM_STRING => {
            let range = reader.cstr()?;
            Some(reader.data[range].to_vec())
        }
        DW_FORM_STRP => {
            let offset = reader.u32()? as usize;
            let rest = strings.get(offset..)?;
            let len = rest.iter().position(|&b| b == 0)?;
            Some(rest[..len].to_vec())
        }
        DW_FORM_ADDR => {
            reader.bytes(address_size as usize)?;
            None
        }
        DW_FORM_DATA1 | DW_FORM_FLAG | DW_FORM_REF1 | DW_FORM_STRX1 | DW_FORM_ADDRX1 => {
            reader.u8()?;
            None
        }
        DW_FORM_DATA2 | DW_FORM_REF2 | DW_FORM_STRX2 | DW_FORM_ADDRX2 => {
            reader.u16()?;
            None
        }
        DW_FORM_STRX3 | DW_FORM_ADDRX3 => {
            reader.bytes(3)?;
            None
        }
        DW_FORM_DATA4 | DW_FORM_REF4 | DW_FORM_SEC_OFFSET | DW_FORM_LINE_STRP | DW_FORM_STRX4
        | DW_FORM_ADDRX4 => {
            reader.u32()?;
            None
        }
        DW_FORM_DATA8 | DW_FORM_REF8 => {
            reader.bytes(8)?;
            None
        }
        DW_FORM_SDATA => {
            reader.sleb()?;
            None
        }
        DW_FORM_UDATA | DW_FORM_REF_UDATA => {
            reader.uleb()?;
            None
        }
        DW_FORM_BLOCK1 => {
            let len = reader.u8()? as usize;
            reader.bytes(len)?;
            None
        }
        DW_FORM_BLOCK2 => {
            let len = reader.u16()? as usize;
            reader.bytes(len)?;
            None
        }
        DW_FORM_BLOCK4 => {
            let len = reader.u32()? as usize;
            reader.bytes(len)?;
            None
        }
        DW_FORM_BLOCK | DW_FORM_EXPRLOC => {
            let len = reader.uleb()? as usize;
            reader.bytes(len)?;
            None
        }
        DW_FORM_FLAG_PRESENT | DW_FORM_IMPLICIT_CONST => None,
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn compile_unit_strings_are_recovered() {
        // __debug_str holding the two strings.
        let strings = b"main.c\0/tmp/build\0";

        // Abbrev 1: compile_unit, no children, name=strp, comp_dir=strp.
        let mut abbrev = Vec::new();
        uleb(1, &mut abbrev);
        uleb(DW_TAG_COMPILE_UNIT, &mut abbrev);
        abbrev.push(0);
        uleb(DW_AT_NAME, &mut abbrev);
        uleb(DW_FORM_STRP, &mut abbrev);
        uleb(DW_AT_COMP_DIR, &mut abbrev);
        uleb(DW_FORM_STRP, &mut abbrev);
        abbrev.extend_from_slice(&[0, 0, 0]);

        // DWARF v4 unit header + one DIE.
        let mut info = Vec::new();
        info.extend_from_slice(&0u32.to_le_bytes()); // unit_length (unused)
        info.extend_from_slice(&4u16.to_le_bytes());
        info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        info.push(8); // address size
        uleb(1, &mut info); // abbrev code
        info.extend_from_slice(&0u32.to_le_bytes()); // strp: "main.c"
        info.extend_from_slice(&7u32.to_le_bytes()); // strp: "/tmp/build"

        let summary = parse_summary(&info, &abbrev, strings).unwrap();
        assert_eq!(summary.tu_name, b"main.c");
        assert_eq!(summary.comp_dir, b"/tmp/build");
    }

    #[test]
    fn unknown_material_yields_no_summary() {
        assert!(parse_summary(&[], &[], &[]).is_none());
        // A type unit (DWARF v5 unit_type 2) is not a compile unit.
        let mut info = Vec::new();
        info.extend_from_slice(&0u32.to_le_bytes());
        info.extend_from_slice(&5u16.to_le_bytes());
        info.push(0x02);
        info.push(8);
        info.extend_from_slice(&0u32.to_le_bytes());
        assert!(parse_summary(&info, &[], &[]).is_none());
    }
}
