use crate::error::Error;
use crate::error::Result;
use object::macho;

pub(crate) const STUB_SIZE: u64 = 6;
pub(crate) const STUB_HELPER_PREAMBLE_SIZE: u64 = 15;
pub(crate) const STUB_HELPER_ENTRY_SIZE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocKind {
    Unsigned,
    Signed,
    Branch,
    GotLoad,
    Got,
    Subtractor,
    Signed1,
    Signed2,
    Signed4,
    Tlv,
}

impl RelocKind {
    pub(crate) fn from_raw(r_type: u8) -> Result<RelocKind> {
        Ok(match r_type {
            macho::X86_64_RELOC_UNSIGNED => RelocKind::Unsigned,
            macho::X86_64_RELOC_SIGNED => RelocKind::Signed,
            macho::X86_64_RELOC_BRANCH => RelocKind::Branch,
            macho::X86_64_RELOC_GOT_LOAD => RelocKind::GotLoad,
            macho::X86_64_RELOC_GOT => RelocKind::Got,
            macho::X86_64_RELOC_SUBTRACTOR => RelocKind::Subtractor,
            macho::X86_64_RELOC_SIGNED_1 => RelocKind::Signed1,
            macho::X86_64_RELOC_SIGNED_2 => RelocKind::Signed2,
            macho::X86_64_RELOC_SIGNED_4 => RelocKind::Signed4,
            macho::X86_64_RELOC_TLV => RelocKind::Tlv,
            other => {
                crate::bail!("unknown x86_64 relocation type {other}")
            }
        })
    }

    /// The `-N` displacement correction of the `SIGNED_N` family.
    pub(crate) fn pcrel_correction(self) -> i64 {
        match self {
            RelocKind::Signed1 => 1,
            RelocKind::Signed2 => 2,
            RelocKind::Signed4 => 4,
            _ => 0,
        }
    }
}

/// Displacement from the end of a 4-byte immediate at `source` to `target`.
/// `correction` is the distance from the immediate's end to the instruction's
/// end (nonzero when an immediate operand follows).
pub(crate) fn calc_pcrel_displacement(source: u64, target: u64, correction: i64) -> Result<i32> {
    let displacement = target.wrapping_sub(source) as i64 - 4 - correction;
    i32::try_from(displacement).map_err(|_| {
        Error::Overflow(format!(
            "pc-relative displacement {displacement:#x} from {source:#x} to {target:#x} \
             exceeds 32 bits"
        ))
    })
}

// jmp *lazy_ptr(%rip)
const STUB_TEMPLATE: [u8; STUB_SIZE as usize] = [0xff, 0x25, 0x0, 0x0, 0x0, 0x0];

pub(crate) fn write_stub(code: &mut [u8], stub_addr: u64, lazy_ptr_addr: u64) -> Result {
    code.copy_from_slice(&STUB_TEMPLATE);
    let disp = calc_pcrel_displacement(stub_addr + 2, lazy_ptr_addr, 0)?;
    code[2..6].copy_from_slice(&disp.to_le_bytes());
    Ok(())
}

const STUB_HELPER_PREAMBLE_TEMPLATE: [u8; STUB_HELPER_PREAMBLE_SIZE as usize] = [
    0x4c, 0x8d, 0x1d, 0x0, 0x0, 0x0, 0x0, // lea dyld_private(%rip), %r11
    0x41, 0x53, // push %r11
    0xff, 0x25, 0x0, 0x0, 0x0, 0x0, // jmp *dyld_stub_binder@GOT(%rip)
];

pub(crate) fn write_stub_helper_preamble(
    code: &mut [u8],
    preamble_addr: u64,
    dyld_private_addr: u64,
    binder_got_addr: u64,
) -> Result {
    code.copy_from_slice(&STUB_HELPER_PREAMBLE_TEMPLATE);
    let lea_disp = calc_pcrel_displacement(preamble_addr + 3, dyld_private_addr, 0)?;
    code[3..7].copy_from_slice(&lea_disp.to_le_bytes());
    let jmp_disp = calc_pcrel_displacement(preamble_addr + 11, binder_got_addr, 0)?;
    code[11..15].copy_from_slice(&jmp_disp.to_le_bytes());
    Ok(())
}

const STUB_HELPER_ENTRY_TEMPLATE: [u8; STUB_HELPER_ENTRY_SIZE as usize] = [
    0x68, 0x0, 0x0, 0x0, 0x0, // push lazy_bind_offset
    0xe9, 0x0, 0x0, 0x0, 0x0, // jmp preamble
];

/// The pushed immediate starts as zero; the LINKEDIT writer patches it with
/// the symbol's lazy-bind stream offset once that stream has been laid out.
pub(crate) fn write_stub_helper_entry(
    code: &mut [u8],
    entry_addr: u64,
    preamble_addr: u64,
) -> Result {
    code.copy_from_slice(&STUB_HELPER_ENTRY_TEMPLATE);
    let disp = calc_pcrel_displacement(entry_addr + 6, preamble_addr, 0)?;
    code[6..10].copy_from_slice(&disp.to_le_bytes());
    Ok(())
}

/// Offset of the patched lazy-bind immediate within a helper entry.
pub(crate) const STUB_HELPER_ENTRY_OFFSET_FIELD: usize = 1;

/// Rewrites `mov reg, disp(%rip)` into `lea reg, disp(%rip)` so a GOT load of
/// a locally-defined symbol addresses it directly. `offset` is the position
/// of the 4-byte displacement; the opcode byte precedes the modrm byte.
/// Returns false when the instruction is not the expected `mov` form, in
/// which case the GOT indirection must be kept.
pub(crate) fn relax_got_load(code: &mut [u8], offset: usize) -> bool {
    if offset < 2 || code[offset - 2] != 0x8b {
        return false;
    }
    code[offset - 2] = 0x8d;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacement_is_relative_to_instruction_end() {
        // A branch at 0x1000 (immediate at 0x1001) to 0x2000.
        assert_eq!(calc_pcrel_displacement(0x1001, 0x2000, 0).unwrap(), 0xffb);
        // Backwards branch.
        assert_eq!(calc_pcrel_displacement(0x2000, 0x1000, 0).unwrap(), -0x1004);
        // SIGNED_4 correction shifts the base by the trailing immediate.
        assert_eq!(
            calc_pcrel_displacement(0x1000, 0x1000, 4).unwrap(),
            -8i32
        );
    }

    #[test]
    fn displacement_overflow_is_reported() {
        let far = 0x2_0000_0000u64;
        assert!(matches!(
            calc_pcrel_displacement(0, far, 0),
            Err(Error::Overflow(_))
        ));
        // Just inside the range still encodes.
        assert!(calc_pcrel_displacement(0, 0x7fff_ffff, 0).is_ok());
    }

    #[test]
    fn stub_jumps_through_lazy_pointer() {
        let mut code = [0u8; STUB_SIZE as usize];
        write_stub(&mut code, 0x1000, 0x3008).unwrap();
        assert_eq!(&code[..2], &[0xff, 0x25]);
        let disp = i32::from_le_bytes(code[2..6].try_into().unwrap());
        assert_eq!(disp, 0x3008 - (0x1000 + 6));
    }

    #[test]
    fn mov_becomes_lea_for_local_got_load() {
        // mov 0x0(%rip), %rax == 48 8b 05 00 00 00 00
        let mut code = [0x48, 0x8b, 0x05, 0x0, 0x0, 0x0, 0x0];
        assert!(relax_got_load(&mut code, 3));
        assert_eq!(code[1], 0x8d);

        // A non-mov instruction is left alone.
        let mut other = [0x48, 0x85, 0x05, 0x0, 0x0, 0x0, 0x0];
        assert!(!relax_got_load(&mut other, 3));
        assert_eq!(other[1], 0x85);
    }
}
