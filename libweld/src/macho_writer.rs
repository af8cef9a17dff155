//! Final file assembly: the LINKEDIT payload is appended to the section
//! content, the stub-helper immediates are patched, the header and load
//! commands are written into the pad reserved by the allocator, and the
//! whole image is ad-hoc signed when the target demands it.

use crate::arch::Arch;
use crate::args::OutputMode;
use crate::atom::AtomId;
use crate::code_signature::CodeSignature;
use crate::ensure;
use crate::error::Result;
use crate::linker::Linker;
use crate::linkedit::LinkeditData;
use crate::macho::name_of;
use byteorder::LittleEndian as LE;
use byteorder::WriteBytesExt;
use object::macho;
use std::fs::File;
use std::io::Write;

/// Offsets and sizes of every LINKEDIT block, as the load commands report
/// them.
#[derive(Debug, Default, Clone, Copy)]
struct LinkeditOffsets {
    rebase: (u32, u32),
    bind: (u32, u32),
    lazy_bind: (u32, u32),
    export: (u32, u32),
    function_starts: (u32, u32),
    data_in_code: (u32, u32),
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
    indirectsymoff: u32,
    nindirectsyms: u32,
    code_signature: (u32, u32),
}

impl Linker {
    pub(crate) fn write_output(&mut self, mut out: Vec<u8>) -> Result {
        let data = self.build_linkedit()?;

        let linkedit_fileoff = self.segments[self.linkedit_segment_index()].fileoff;
        debug_assert_eq!(out.len() as u64, linkedit_fileoff);

        let mut offsets = LinkeditOffsets::default();
        offsets.rebase = append_blob(&mut out, &data.rebase);
        offsets.bind = append_blob(&mut out, &data.bind);
        offsets.lazy_bind = append_blob(&mut out, &data.lazy_bind);
        offsets.export = append_blob(&mut out, &data.export_trie);
        offsets.function_starts = append_blob(&mut out, &data.function_starts);
        offsets.data_in_code = append_blob(&mut out, &data.data_in_code);
        let symtab = append_blob(&mut out, &data.symtab);
        offsets.symoff = symtab.0;
        offsets.nsyms = data.symtab.len() as u32 / 16;
        let strtab = append_blob(&mut out, &data.strtab);
        offsets.stroff = strtab.0;
        offsets.strsize = strtab.1;
        let indirect = append_blob(&mut out, &data.indirect);
        offsets.indirectsymoff = indirect.0;
        offsets.nindirectsyms = data.nindirect;

        self.patch_stub_helper_offsets(&mut out, &data);

        // Size __LINKEDIT, reserving the signature region when one follows.
        let signature = self.prepare_code_signature()?;
        let mut linkedit_end = out.len() as u64;
        if let Some(signature) = &signature {
            let cs_offset = (out.len() as u64).next_multiple_of(16);
            let cs_size = signature.size(cs_offset);
            offsets.code_signature = (cs_offset as u32, cs_size);
            linkedit_end = cs_offset + u64::from(cs_size);
        }
        // The kernel requires a signature to end the file exactly, so the
        // segment is only padded out to a page when none follows.
        let page_size = self.args.target.page_size();
        let linkedit_filesize = if signature.is_some() {
            linkedit_end - linkedit_fileoff
        } else {
            (linkedit_end - linkedit_fileoff).next_multiple_of(page_size)
        };
        let linkedit_index = self.linkedit_segment_index();
        self.segments[linkedit_index].filesize = linkedit_filesize;
        self.segments[linkedit_index].vmsize = linkedit_filesize.next_multiple_of(page_size);

        // Header and load commands land in the reserved pad.
        let commands = self.build_load_commands(&data, &offsets)?;
        let first_section_offset = self
            .section_order
            .first()
            .map_or(u32::MAX, |&id| self.section(id).offset);
        ensure!(
            size_of::<crate::macho::MachHeader64>() + commands.payload.len()
                <= first_section_offset as usize,
            "load commands overflow the reserved header pad"
        );
        self.write_header(&mut out, &commands);

        if let Some(signature) = signature {
            let cs_offset = offsets.code_signature.0 as usize;
            out.resize(cs_offset, 0);
            let blob = signature.write(&out);
            debug_assert_eq!(blob.len() as u32, offsets.code_signature.1);
            out.extend_from_slice(&blob);
        }
        // Pad the file out to the segment's page-aligned end.
        out.resize((linkedit_fileoff + linkedit_filesize) as usize, 0);

        let path = self.args.output_path.clone();
        let mut file = File::create(&path)?;
        file.write_all(&out)?;
        if self.args.output_mode == OutputMode::Executable {
            make_executable(&file)?;
        }
        tracing::debug!("wrote {} ({} bytes)", path.display(), out.len());
        Ok(())
    }

    /// The lazy-bind stream offset of each stub rides in its helper entry's
    /// trailing immediate.
    fn patch_stub_helper_offsets(&self, out: &mut [u8], data: &LinkeditData) {
        let field_offset = match self.arch() {
            Arch::X86_64 => crate::arch::x86_64::STUB_HELPER_ENTRY_OFFSET_FIELD,
            Arch::Aarch64 => crate::arch::aarch64::STUB_HELPER_ENTRY_OFFSET_FIELD,
        };
        for &(helper, stream_offset) in &data.lazy_bind_offsets {
            let file_offset = self.atom_file_offset(helper) + field_offset;
            out[file_offset..file_offset + 4].copy_from_slice(&stream_offset.to_le_bytes());
        }
    }

    fn atom_file_offset(&self, atom_id: AtomId) -> usize {
        let atom = self.atom(atom_id);
        self.section(atom.section).offset as usize + atom.off as usize
    }

    fn prepare_code_signature(&self) -> Result<Option<CodeSignature>> {
        if !self.args.requires_code_signature() {
            return Ok(None);
        }
        let entitlements = match &self.args.entitlements {
            Some(path) => Some(crate::input_data::read_file(path)?),
            None => None,
        };
        let text_filesize = self
            .segments
            .iter()
            .find(|segment| name_of(&segment.name) == b"__TEXT")
            .map_or(0, |segment| segment.filesize);
        Ok(Some(CodeSignature::new(
            &Linker::path_basename(&self.args.output_path),
            entitlements,
            None,
            text_filesize,
            self.args.output_mode == OutputMode::Executable,
        )))
    }

    /// Upper bound (and in practice, exact size) of the load commands, used
    /// by the allocator to reserve the header pad.
    pub(crate) fn estimate_load_commands_size(&self) -> u32 {
        let mut size = 0u32;
        for segment in &self.segments {
            size += 72 + 80 * segment.sections.len() as u32;
        }
        size += 48; // LC_DYLD_INFO_ONLY
        size += 16 + 16; // LC_FUNCTION_STARTS + LC_DATA_IN_CODE
        size += 24 + 80; // LC_SYMTAB + LC_DYSYMTAB
        if self.args.output_mode == OutputMode::Executable {
            size += padded(12 + DYLINKER_PATH.len() as u32 + 1);
            size += 24; // LC_MAIN
        } else {
            size += padded(24 + self.dylib_id_name().len() as u32 + 1);
        }
        for rpath in &self.args.rpath_list {
            size += padded(12 + rpath.len() as u32 + 1);
        }
        size += 16; // LC_SOURCE_VERSION
        size += 32; // LC_BUILD_VERSION + one tool
        size += 24; // LC_UUID
        for &dylib_id in &self.loaded_dylibs() {
            let crate::file::File::Dylib(dylib) = &self.files[dylib_id.index()] else {
                continue;
            };
            size += padded(24 + dylib.install_name.len() as u32 + 1);
        }
        if self.args.requires_code_signature() {
            size += 16;
        }
        size
    }

    fn dylib_id_name(&self) -> String {
        self.args
            .install_name
            .clone()
            .unwrap_or_else(|| Linker::path_basename(&self.args.output_path))
    }

    fn header_flags(&self) -> u32 {
        let mut flags = macho::MH_NOUNDEFS | macho::MH_DYLDLINK | macho::MH_TWOLEVEL;
        if self.args.output_mode == OutputMode::Executable {
            flags |= macho::MH_PIE;
        } else {
            flags |= macho::MH_NO_REEXPORTED_DYLIBS;
        }
        let has_tlv = self
            .section_order
            .iter()
            .any(|&id| self.section(id).sect_type() == macho::S_THREAD_LOCAL_VARIABLES);
        if has_tlv {
            flags |= macho::MH_HAS_TLV_DESCRIPTORS;
        }
        if self.args.namespace == crate::args::Namespace::Flat {
            flags &= !macho::MH_TWOLEVEL;
        }
        flags
    }

    fn build_load_commands(
        &self,
        data: &LinkeditData,
        offsets: &LinkeditOffsets,
    ) -> Result<LoadCommands> {
        let mut cmds = LoadCommands::default();

        for segment in &self.segments {
            let nsects = segment.sections.len() as u32;
            let cmdsize = 72 + 80 * nsects;
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(macho::LC_SEGMENT_64).unwrap();
            payload.write_u32::<LE>(cmdsize).unwrap();
            payload.extend_from_slice(&segment.name);
            payload.write_u64::<LE>(segment.vmaddr).unwrap();
            payload.write_u64::<LE>(segment.vmsize).unwrap();
            payload.write_u64::<LE>(segment.fileoff).unwrap();
            payload.write_u64::<LE>(segment.filesize).unwrap();
            payload.write_u32::<LE>(segment.maxprot).unwrap();
            payload.write_u32::<LE>(segment.initprot).unwrap();
            payload.write_u32::<LE>(nsects).unwrap();
            payload.write_u32::<LE>(0).unwrap(); // flags
            for position in segment.sections.clone() {
                let section = self.section(self.section_order[position]);
                payload.extend_from_slice(&section.sectname);
                payload.extend_from_slice(&section.segname);
                payload.write_u64::<LE>(section.addr).unwrap();
                payload.write_u64::<LE>(section.size).unwrap();
                payload.write_u32::<LE>(section.offset).unwrap();
                payload.write_u32::<LE>(u32::from(section.align)).unwrap();
                payload.write_u32::<LE>(0).unwrap(); // reloff
                payload.write_u32::<LE>(0).unwrap(); // nreloc
                payload.write_u32::<LE>(section.flags).unwrap();
                payload.write_u32::<LE>(section.reserved1).unwrap();
                payload.write_u32::<LE>(section.reserved2).unwrap();
                payload.write_u32::<LE>(0).unwrap(); // reserved3
            }
            cmds.count += 1;
        }

        {
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(macho::LC_DYLD_INFO_ONLY).unwrap();
            payload.write_u32::<LE>(48).unwrap();
            payload.write_u32::<LE>(offsets.rebase.0).unwrap();
            payload.write_u32::<LE>(offsets.rebase.1).unwrap();
            payload.write_u32::<LE>(offsets.bind.0).unwrap();
            payload.write_u32::<LE>(offsets.bind.1).unwrap();
            payload.write_u32::<LE>(0).unwrap(); // weak_bind_off
            payload.write_u32::<LE>(0).unwrap(); // weak_bind_size
            payload.write_u32::<LE>(offsets.lazy_bind.0).unwrap();
            payload.write_u32::<LE>(offsets.lazy_bind.1).unwrap();
            payload.write_u32::<LE>(offsets.export.0).unwrap();
            payload.write_u32::<LE>(offsets.export.1).unwrap();
            cmds.count += 1;

            payload.write_u32::<LE>(macho::LC_FUNCTION_STARTS).unwrap();
            payload.write_u32::<LE>(16).unwrap();
            payload.write_u32::<LE>(offsets.function_starts.0).unwrap();
            payload.write_u32::<LE>(offsets.function_starts.1).unwrap();
            cmds.count += 1;

            payload.write_u32::<LE>(macho::LC_DATA_IN_CODE).unwrap();
            payload.write_u32::<LE>(16).unwrap();
            payload.write_u32::<LE>(offsets.data_in_code.0).unwrap();
            payload.write_u32::<LE>(offsets.data_in_code.1).unwrap();
            cmds.count += 1;

            payload.write_u32::<LE>(macho::LC_SYMTAB).unwrap();
            payload.write_u32::<LE>(24).unwrap();
            payload.write_u32::<LE>(offsets.symoff).unwrap();
            payload.write_u32::<LE>(offsets.nsyms).unwrap();
            payload.write_u32::<LE>(offsets.stroff).unwrap();
            payload.write_u32::<LE>(offsets.strsize).unwrap();
            cmds.count += 1;

            payload.write_u32::<LE>(macho::LC_DYSYMTAB).unwrap();
            payload.write_u32::<LE>(80).unwrap();
            payload.write_u32::<LE>(0).unwrap(); // ilocalsym
            payload.write_u32::<LE>(data.nlocalsym).unwrap();
            payload.write_u32::<LE>(data.nlocalsym).unwrap(); // iextdefsym
            payload.write_u32::<LE>(data.nextdefsym).unwrap();
            payload
                .write_u32::<LE>(data.nlocalsym + data.nextdefsym)
                .unwrap(); // iundefsym
            payload.write_u32::<LE>(data.nundefsym).unwrap();
            for _ in 0..6 {
                payload.write_u32::<LE>(0).unwrap(); // toc, modtab, extrefsyms
            }
            payload.write_u32::<LE>(offsets.indirectsymoff).unwrap();
            payload.write_u32::<LE>(offsets.nindirectsyms).unwrap();
            for _ in 0..4 {
                payload.write_u32::<LE>(0).unwrap(); // extrel, locrel
            }
            cmds.count += 1;
        }

        if self.args.output_mode == OutputMode::Executable {
            write_string_command(
                &mut cmds,
                macho::LC_LOAD_DYLINKER,
                12,
                DYLINKER_PATH.as_bytes(),
            );

            let entry_value = self.symbol(self.entry_symbol).value;
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(macho::LC_MAIN).unwrap();
            payload.write_u32::<LE>(24).unwrap();
            payload
                .write_u64::<LE>(entry_value - self.text_segment_vmaddr())
                .unwrap();
            payload
                .write_u64::<LE>(self.args.stack_size.unwrap_or(0))
                .unwrap();
            cmds.count += 1;
        } else {
            let name = self.dylib_id_name();
            let payload = &mut cmds.payload;
            let cmdsize = padded(24 + name.len() as u32 + 1);
            payload.write_u32::<LE>(macho::LC_ID_DYLIB).unwrap();
            payload.write_u32::<LE>(cmdsize).unwrap();
            payload.write_u32::<LE>(24).unwrap(); // name offset
            payload.write_u32::<LE>(2).unwrap(); // timestamp
            payload
                .write_u32::<LE>(self.args.current_version.unwrap_or(0x1_0000))
                .unwrap();
            payload
                .write_u32::<LE>(self.args.compatibility_version.unwrap_or(0x1_0000))
                .unwrap();
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            while payload.len() % 8 != 0 {
                payload.push(0);
            }
            cmds.count += 1;
        }

        for rpath in &self.args.rpath_list {
            write_string_command(&mut cmds, macho::LC_RPATH, 12, rpath.as_bytes());
        }

        {
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(macho::LC_SOURCE_VERSION).unwrap();
            payload.write_u32::<LE>(16).unwrap();
            payload.write_u64::<LE>(0).unwrap();
            cmds.count += 1;

            payload.write_u32::<LE>(macho::LC_BUILD_VERSION).unwrap();
            payload.write_u32::<LE>(32).unwrap();
            payload.write_u32::<LE>(self.args.target.platform()).unwrap();
            payload.write_u32::<LE>(self.args.platform_version).unwrap();
            payload.write_u32::<LE>(self.args.sdk_version).unwrap();
            payload.write_u32::<LE>(1).unwrap(); // ntools
            payload.write_u32::<LE>(macho::TOOL_LD).unwrap();
            payload.write_u32::<LE>(0).unwrap(); // tool version
            cmds.count += 1;

            let mut uuid = [0u8; 16];
            getrandom::fill(&mut uuid)
                .map_err(|error| crate::error::Error::Malformed(format!("uuid: {error}")))?;
            payload.write_u32::<LE>(macho::LC_UUID).unwrap();
            payload.write_u32::<LE>(24).unwrap();
            payload.extend_from_slice(&uuid);
            cmds.count += 1;
        }

        for dylib_id in self.loaded_dylibs() {
            let crate::file::File::Dylib(dylib) = &self.files[dylib_id.index()] else {
                continue;
            };
            let cmd = if dylib.weak {
                macho::LC_LOAD_WEAK_DYLIB
            } else {
                macho::LC_LOAD_DYLIB
            };
            let cmdsize = padded(24 + dylib.install_name.len() as u32 + 1);
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(cmd).unwrap();
            payload.write_u32::<LE>(cmdsize).unwrap();
            payload.write_u32::<LE>(24).unwrap();
            payload.write_u32::<LE>(2).unwrap(); // timestamp
            payload.write_u32::<LE>(dylib.current_version).unwrap();
            payload.write_u32::<LE>(dylib.compatibility_version).unwrap();
            payload.extend_from_slice(dylib.install_name.as_bytes());
            payload.push(0);
            while payload.len() % 8 != 0 {
                payload.push(0);
            }
            cmds.count += 1;
        }

        if offsets.code_signature.1 != 0 {
            let payload = &mut cmds.payload;
            payload.write_u32::<LE>(macho::LC_CODE_SIGNATURE).unwrap();
            payload.write_u32::<LE>(16).unwrap();
            payload.write_u32::<LE>(offsets.code_signature.0).unwrap();
            payload.write_u32::<LE>(offsets.code_signature.1).unwrap();
            cmds.count += 1;
        }

        Ok(cmds)
    }

    fn write_header(&self, out: &mut [u8], cmds: &LoadCommands) {
        let mut header = Vec::with_capacity(32);
        header.write_u32::<LE>(macho::MH_MAGIC_64).unwrap();
        header.write_u32::<LE>(self.arch().cpu_type()).unwrap();
        header.write_u32::<LE>(self.arch().cpu_subtype()).unwrap();
        header
            .write_u32::<LE>(match self.args.output_mode {
                OutputMode::Executable => macho::MH_EXECUTE,
                OutputMode::Dylib => macho::MH_DYLIB,
            })
            .unwrap();
        header.write_u32::<LE>(cmds.count).unwrap();
        header.write_u32::<LE>(cmds.payload.len() as u32).unwrap();
        header.write_u32::<LE>(self.header_flags()).unwrap();
        header.write_u32::<LE>(0).unwrap(); // reserved

        out[..32].copy_from_slice(&header);
        out[32..32 + cmds.payload.len()].copy_from_slice(&cmds.payload);
    }
}

const DYLINKER_PATH: &str = "/usr/lib/dyld";

#[derive(Debug, Default)]
struct LoadCommands {
    payload: Vec<u8>,
    count: u32,
}

fn padded(size: u32) -> u32 {
    size.next_multiple_of(8)
}

fn append_blob(out: &mut Vec<u8>, blob: &[u8]) -> (u32, u32) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
    if blob.is_empty() {
        return (0, 0);
    }
    let offset = out.len() as u32;
    out.extend_from_slice(blob);
    (offset, blob.len() as u32)
}

fn write_string_command(cmds: &mut LoadCommands, cmd: u32, header_size: u32, string: &[u8]) {
    let cmdsize = padded(header_size + string.len() as u32 + 1);
    let payload = &mut cmds.payload;
    payload.write_u32::<LE>(cmd).unwrap();
    payload.write_u32::<LE>(cmdsize).unwrap();
    payload.write_u32::<LE>(header_size).unwrap();
    payload.extend_from_slice(string);
    payload.push(0);
    while payload.len() % 8 != 0 {
        payload.push(0);
    }
    cmds.count += 1;
}

/// Set execute wherever we currently have read permission.
#[cfg(not(target_os = "windows"))]
fn make_executable(file: &File) -> Result {
    use std::os::unix::prelude::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mut mode = PermissionsExt::mode(&permissions);
    mode |= (mode & 0o444) >> 2;
    PermissionsExt::set_mode(&mut permissions, mode);
    file.set_permissions(permissions)?;
    Ok(())
}

#[cfg(target_os = "windows")]
#[allow(clippy::unnecessary_wraps)]
fn make_executable(_file: &File) -> Result {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_appends_are_eight_byte_aligned() {
        let mut out = vec![0u8; 13];
        let (offset, size) = append_blob(&mut out, b"abc");
        assert_eq!(offset, 16);
        assert_eq!(size, 3);
        let (offset2, _) = append_blob(&mut out, b"defgh");
        assert_eq!(offset2 % 8, 0);
        // Empty blobs take no space and report a zero offset.
        assert_eq!(append_blob(&mut out, b""), (0, 0));
    }

    #[test]
    fn string_commands_pad_to_eight() {
        let mut cmds = LoadCommands::default();
        write_string_command(&mut cmds, macho::LC_RPATH, 12, b"@loader_path/../lib");
        assert_eq!(cmds.count, 1);
        assert_eq!(cmds.payload.len() % 8, 0);
        let cmdsize = u32::from_le_bytes(cmds.payload[4..8].try_into().unwrap());
        assert_eq!(cmdsize as usize, cmds.payload.len());
    }
}
