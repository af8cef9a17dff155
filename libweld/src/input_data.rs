//! Reads inputs into owned buffers and answers the two questions every input
//! raises first: which slice of the file belongs to our architecture, and
//! where a `-l`/`-framework` request lives on disk.

use crate::arch::Arch;
use crate::args::Args;
use crate::args::SearchStrategy;
use crate::error::Context;
use crate::error::Error;
use crate::error::Result;
use crate::macho::pod_at;
use object::BigEndian;
use object::macho;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

/// Reads the whole file; the handle is closed on return.
pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Seconds-resolution mtime, used for the `N_OSO` stab.
pub(crate) fn file_mtime(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |duration| duration.as_secs())
}

/// Selects the slice for `arch` from a universal binary. Returns `None` when
/// the buffer is not fat; a fat file with no matching slice is an
/// architecture mismatch.
pub(crate) fn fat_slice(data: &[u8], arch: Arch, path: &Path) -> Result<Option<Range<usize>>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let magic = u32::from_be_bytes(data[..4].try_into().unwrap());
    if magic != macho::FAT_MAGIC && magic != macho::FAT_MAGIC_64 {
        return Ok(None);
    }

    let header = pod_at::<macho::FatHeader>(data, 0)?;
    let count = header.nfat_arch.get(BigEndian) as usize;
    let mut offset = size_of::<macho::FatHeader>();
    for _ in 0..count {
        let (cputype, slice_offset, slice_size, next) = if magic == macho::FAT_MAGIC_64 {
            let fat_arch = pod_at::<macho::FatArch64>(data, offset)?;
            (
                fat_arch.cputype.get(BigEndian),
                fat_arch.offset.get(BigEndian),
                fat_arch.size.get(BigEndian),
                offset + size_of::<macho::FatArch64>(),
            )
        } else {
            let fat_arch = pod_at::<macho::FatArch32>(data, offset)?;
            (
                fat_arch.cputype.get(BigEndian),
                u64::from(fat_arch.offset.get(BigEndian)),
                u64::from(fat_arch.size.get(BigEndian)),
                offset + size_of::<macho::FatArch32>(),
            )
        };
        if Arch::from_cpu_type(cputype) == Some(arch) {
            let start = usize::try_from(slice_offset).map_err(|_| Error::EndOfStream)?;
            let end = start
                .checked_add(usize::try_from(slice_size).map_err(|_| Error::EndOfStream)?)
                .ok_or(Error::EndOfStream)?;
            if end > data.len() {
                return Err(Error::EndOfStream);
            }
            return Ok(Some(start..end));
        }
        offset = next;
    }

    Err(Error::MismatchedCpuArchitecture {
        path: path.to_path_buf(),
    })
}

fn apply_syslibroot(args: &Args, dir: &Path) -> PathBuf {
    match &args.syslibroot {
        Some(root) if dir.is_absolute() => {
            let mut out = root.clone();
            out.push(dir.strip_prefix("/").unwrap_or(dir));
            out
        }
        _ => dir.to_path_buf(),
    }
}

/// Resolves `-lname` against the library search path.
pub(crate) fn find_library(args: &Args, name: &str) -> Result<PathBuf> {
    const DYLIB_EXTENSIONS: [&str; 2] = ["tbd", "dylib"];

    let candidate = |dir: &Path, extension: &str| -> Option<PathBuf> {
        let path = dir.join(format!("lib{name}.{extension}"));
        path.is_file().then_some(path)
    };

    match args.search_strategy {
        SearchStrategy::PathsFirst => {
            for dir in &args.lib_dirs {
                let dir = apply_syslibroot(args, dir);
                for extension in ["tbd", "dylib", "a"] {
                    if let Some(path) = candidate(&dir, extension) {
                        return Ok(path);
                    }
                }
            }
        }
        SearchStrategy::DylibsFirst => {
            for dir in &args.lib_dirs {
                let dir = apply_syslibroot(args, dir);
                for extension in DYLIB_EXTENSIONS {
                    if let Some(path) = candidate(&dir, extension) {
                        return Ok(path);
                    }
                }
            }
            for dir in &args.lib_dirs {
                if let Some(path) = candidate(&apply_syslibroot(args, dir), "a") {
                    return Ok(path);
                }
            }
        }
    }

    Err(Error::LibraryNotFound(name.to_string()))
}

/// Resolves `-framework name`; the text stub next to the binary wins.
pub(crate) fn find_framework(args: &Args, name: &str) -> Result<PathBuf> {
    for dir in &args.framework_dirs {
        let dir = apply_syslibroot(args, dir).join(format!("{name}.framework"));
        let stub = dir.join(format!("{name}.tbd"));
        if stub.is_file() {
            return Ok(stub);
        }
        let binary = dir.join(name);
        if binary.is_file() {
            return Ok(binary);
        }
    }
    Err(Error::FrameworkNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fat_buffers_pass_through() {
        let thin = macho::MH_MAGIC_64.to_le_bytes().to_vec();
        assert!(
            fat_slice(&thin, Arch::Aarch64, Path::new("x.o"))
                .unwrap()
                .is_none()
        );
        assert!(
            fat_slice(b"!<arch>\n", Arch::Aarch64, Path::new("x.a"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn fat_slice_selection_by_arch() {
        // A fat header with one x86_64 and one arm64 slice.
        let mut data = Vec::new();
        data.extend_from_slice(&macho::FAT_MAGIC.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        for (cputype, offset) in [
            (macho::CPU_TYPE_X86_64, 0x100u32),
            (macho::CPU_TYPE_ARM64, 0x200u32),
        ] {
            data.extend_from_slice(&cputype.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes()); // cpusubtype
            data.extend_from_slice(&offset.to_be_bytes());
            data.extend_from_slice(&0x40u32.to_be_bytes()); // size
            data.extend_from_slice(&3u32.to_be_bytes()); // align
        }
        data.resize(0x300, 0);

        let range = fat_slice(&data, Arch::Aarch64, Path::new("fat.a"))
            .unwrap()
            .unwrap();
        assert_eq!(range, 0x200..0x240);

        let mut ppc_only = data.clone();
        // Overwrite both cputypes with something we do not link.
        ppc_only[8..12].copy_from_slice(&18u32.to_be_bytes());
        ppc_only[28..32].copy_from_slice(&18u32.to_be_bytes());
        assert!(matches!(
            fat_slice(&ppc_only, Arch::Aarch64, Path::new("fat.a")),
            Err(Error::MismatchedCpuArchitecture { .. })
        ));
    }
}
