//! Input files. A file is an object, an archive or a dylib; dispatch is by
//! explicit match. Archives and dylibs start out dead and become alive on
//! first reference.

use crate::archive::Archive;
use crate::dylib::Dylib;
use crate::object_file::Object;
use std::path::Path;

/// Stable process-wide input file index. Index 0 is the internal pseudo-file
/// that owns synthetic atoms and symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FileId(pub(crate) u32);

impl FileId {
    pub(crate) const NULL: FileId = FileId(0);

    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) enum File {
    /// Placeholder for index 0.
    Internal,
    Object(Object),
    Archive(Archive),
    Dylib(Dylib),
}

impl File {
    pub(crate) fn path(&self) -> &Path {
        match self {
            File::Internal => Path::new("<internal>"),
            File::Object(object) => &object.path,
            File::Archive(archive) => &archive.path,
            File::Dylib(dylib) => &dylib.path,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            File::Internal => true,
            File::Object(object) => object.alive,
            File::Archive(archive) => archive.alive,
            File::Dylib(dylib) => dylib.alive,
        }
    }

    pub(crate) fn set_alive(&mut self) {
        match self {
            File::Internal => {}
            File::Object(object) => object.alive = true,
            File::Archive(archive) => archive.alive = true,
            File::Dylib(dylib) => dylib.alive = true,
        }
    }

    pub(crate) fn as_object(&self) -> Option<&Object> {
        match self {
            File::Object(object) => Some(object),
            _ => None,
        }
    }

    pub(crate) fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            File::Object(object) => Some(object),
            _ => None,
        }
    }

    pub(crate) fn as_dylib_mut(&mut self) -> Option<&mut Dylib> {
        match self {
            File::Dylib(dylib) => Some(dylib),
            _ => None,
        }
    }
}
