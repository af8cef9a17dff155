use std::path::PathBuf;
use thiserror::Error;

pub type Result<T = (), E = crate::error::Error> = core::result::Result<T, E>;

/// One unresolved reference, reported with the first file that needed it.
#[derive(Debug, Clone)]
pub struct UndefinedSymbol {
    pub name: String,
    pub referenced_in: String,
}

/// One strong/strong clash.
#[derive(Debug, Clone)]
pub struct DuplicateSymbol {
    pub name: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}", format_undefined(.0))]
    UndefinedSymbolReference(Vec<UndefinedSymbol>),

    #[error("{}", format_duplicates(.0))]
    MultipleSymbolDefinitions(Vec<DuplicateSymbol>),

    #[error("entry point `{0}` not found")]
    MissingMainEntrypoint(String),

    #[error("library not found for -l{0}")]
    LibraryNotFound(String),

    #[error("framework not found for -framework {0}")]
    FrameworkNotFound(String),

    #[error("{path}: unhandled symbol type for `{name}`")]
    UnhandledSymbolType { name: String, path: PathBuf },

    #[error("{path}: cpu architecture does not match the link target")]
    MismatchedCpuArchitecture { path: PathBuf },

    #[error("relocation overflow: {0}")]
    Overflow(String),

    #[error("unsupported cpu architecture")]
    UnsupportedCpuArchitecture,

    /// Input ended before a complete record could be read. Recoverable at the
    /// parser boundary: the caller may retry the bytes as a different format.
    #[error("unexpected end of stream")]
    EndOfStream,

    #[error("not a Mach-O object file")]
    NotObject,

    #[error("not an archive")]
    NotArchive,

    #[error("not a dynamic library")]
    NotDylib,

    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error merely rejects a file format, leaving the caller
    /// free to try the next parser.
    pub(crate) fn is_format_rejection(&self) -> bool {
        matches!(
            self,
            Error::EndOfStream | Error::NotObject | Error::NotArchive | Error::NotDylib
        )
    }
}

fn format_undefined(symbols: &[UndefinedSymbol]) -> String {
    let mut out = String::from("undefined symbols:");
    for sym in symbols {
        out.push_str(&format!(
            "\n  `{}`, referenced in {}",
            sym.name, sym.referenced_in
        ));
    }
    out
}

fn format_duplicates(clashes: &[DuplicateSymbol]) -> String {
    let mut out = String::from("duplicate symbol definitions:");
    for clash in clashes {
        out.push_str(&format!(
            "\n  `{}` defined in both {} and {}",
            clash.name, clash.first, clash.second
        ));
    }
    out
}

/// Creates an `Error::Malformed` and returns it from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::error::Error::Malformed(format!($($args)*)))
    };
}

/// Like `assert!`, but returns an `Error::Malformed` instead of panicking.
#[macro_export]
macro_rules! ensure {
    ($condition:expr, $($args:tt)*) => {
        if !($condition) {
            $crate::bail!($($args)*);
        }
    };
}

pub(crate) trait Context<T> {
    fn context(self, message: &str) -> Result<T>;

    fn with_context(self, message: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for core::result::Result<T, E> {
    fn context(self, message: &str) -> Result<T> {
        self.map_err(|error| Error::Malformed(format!("{message}: {}", error.into())))
    }

    fn with_context(self, message: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|error| Error::Malformed(format!("{}: {}", message(), error.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_rejections_are_recoverable() {
        assert!(Error::NotObject.is_format_rejection());
        assert!(Error::NotArchive.is_format_rejection());
        assert!(Error::NotDylib.is_format_rejection());
        assert!(Error::EndOfStream.is_format_rejection());
        assert!(!Error::UnsupportedCpuArchitecture.is_format_rejection());
        assert!(!Error::Malformed("truncated load command".to_string()).is_format_rejection());
    }

    #[test]
    fn undefined_list_formats_each_reference() {
        let error = Error::UndefinedSymbolReference(vec![
            UndefinedSymbol {
                name: "_puts".to_string(),
                referenced_in: "main.o".to_string(),
            },
            UndefinedSymbol {
                name: "_abort".to_string(),
                referenced_in: "panic.o".to_string(),
            },
        ]);
        let text = error.to_string();
        assert!(text.contains("`_puts`, referenced in main.o"));
        assert!(text.contains("`_abort`, referenced in panic.o"));
    }
}
