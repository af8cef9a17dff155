//! Link options. Flag parsing lives in the front-ends; the engine consumes
//! this struct directly.

use crate::arch::Arch;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Args {
    pub target: Target,
    pub output_mode: OutputMode,
    pub output_path: PathBuf,
    /// Ordered inputs. Positionals are processed before `-l`/`-framework`
    /// resolution.
    pub positionals: Vec<PositionalInput>,
    pub libs: Vec<LibSpec>,
    pub lib_dirs: Vec<PathBuf>,
    pub frameworks: Vec<LibSpec>,
    pub framework_dirs: Vec<PathBuf>,
    /// Prefix applied to absolute search paths.
    pub syslibroot: Option<PathBuf>,
    pub search_strategy: SearchStrategy,
    pub rpath_list: Vec<String>,
    pub entry: String,
    pub stack_size: Option<u64>,
    pub pagezero_size: Option<u64>,
    pub headerpad: u32,
    pub headerpad_max_install_names: bool,
    pub dead_strip: bool,
    /// Suppresses stab emission.
    pub strip: bool,
    pub undefined_treatment: UndefinedTreatment,
    pub namespace: Namespace,
    pub install_name: Option<String>,
    /// Packed xxxx.yy.zz dylib versions.
    pub current_version: Option<u32>,
    pub compatibility_version: Option<u32>,
    /// Path to an entitlements plist folded into the code signature.
    pub entitlements: Option<PathBuf>,
    pub platform_version: u32,
    pub sdk_version: u32,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            target: Target::default(),
            output_mode: OutputMode::Executable,
            output_path: PathBuf::from("a.out"),
            positionals: Vec::new(),
            libs: Vec::new(),
            lib_dirs: Vec::new(),
            frameworks: Vec::new(),
            framework_dirs: Vec::new(),
            syslibroot: None,
            search_strategy: SearchStrategy::PathsFirst,
            rpath_list: Vec::new(),
            entry: "_main".to_string(),
            stack_size: None,
            pagezero_size: None,
            headerpad: 0,
            headerpad_max_install_names: false,
            dead_strip: false,
            strip: false,
            undefined_treatment: UndefinedTreatment::Error,
            namespace: Namespace::TwoLevel,
            install_name: None,
            current_version: None,
            compatibility_version: None,
            entitlements: None,
            platform_version: pack_version(11, 0, 0),
            sdk_version: pack_version(11, 0, 0),
        }
    }
}

impl Args {
    pub(crate) fn is_library(&self) -> bool {
        self.output_mode == OutputMode::Dylib
    }

    /// Ad-hoc signing is mandatory on Apple Silicon; elsewhere only when
    /// entitlements were supplied.
    pub(crate) fn requires_code_signature(&self) -> bool {
        match self.target.arch {
            Arch::Aarch64 => matches!(self.target.os, Os::MacOs) || self.target.simulator,
            Arch::X86_64 => self.entitlements.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub arch: Arch,
    pub os: Os,
    pub simulator: bool,
}

impl Default for Target {
    fn default() -> Self {
        Target {
            arch: Arch::Aarch64,
            os: Os::MacOs,
            simulator: false,
        }
    }
}

impl Target {
    pub(crate) fn page_size(&self) -> u64 {
        self.arch.page_size()
    }

    pub(crate) fn platform(&self) -> u32 {
        use object::macho;
        match (self.os, self.simulator) {
            (Os::MacOs, _) => macho::PLATFORM_MACOS,
            (Os::Ios, false) => macho::PLATFORM_IOS,
            (Os::Ios, true) => macho::PLATFORM_IOSSIMULATOR,
            (Os::TvOs, false) => macho::PLATFORM_TVOS,
            (Os::TvOs, true) => macho::PLATFORM_TVOSSIMULATOR,
            (Os::WatchOs, false) => macho::PLATFORM_WATCHOS,
            (Os::WatchOs, true) => macho::PLATFORM_WATCHOSSIMULATOR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    MacOs,
    Ios,
    TvOs,
    WatchOs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Executable,
    Dylib,
}

#[derive(Debug, Clone)]
pub struct PositionalInput {
    pub path: PathBuf,
    /// Forces every member of an archive into the link.
    pub must_link: bool,
}

#[derive(Debug, Clone)]
pub struct LibSpec {
    pub name: String,
    pub needed: bool,
    pub weak: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// For each directory in order, try every form of the library.
    PathsFirst,
    /// Try dylib/tbd forms in every directory before any archive form.
    DylibsFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedTreatment {
    Error,
    Warn,
    Suppress,
    DynamicLookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    TwoLevel,
    /// Forces the flat-lookup ordinal for every import.
    Flat,
}

/// Packs an xxxx.yy.zz version triple the way load commands carry them.
pub fn pack_version(major: u16, minor: u8, patch: u8) -> u32 {
    (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing() {
        assert_eq!(pack_version(10, 14, 2), 0x000a_0e02);
        assert_eq!(pack_version(11, 0, 0), 0x000b_0000);
    }

    #[test]
    fn signature_requirement_follows_target() {
        let mut args = Args::default();
        args.target.arch = Arch::Aarch64;
        assert!(args.requires_code_signature());

        args.target.arch = Arch::X86_64;
        assert!(!args.requires_code_signature());
        args.entitlements = Some(PathBuf::from("app.entitlements"));
        assert!(args.requires_code_signature());
    }
}
