//! Error and result types.

use std::fmt;
use std::path::PathBuf;

/// The kind of an [`Error`].
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A path passed to [`crate::watch`] does not exist.
    PathNotFound,

    /// A path was unwatched that was not being watched.
    WatchNotFound,

    /// A backend refused to add a watch, for a reason other than the path not existing
    /// (for example, the OS-level watch-descriptor limit was reached).
    MaxFilesWatch,

    /// A configuration option was invalid for the backend it was passed to.
    InvalidConfig,

    /// Wraps an I/O error encountered while canonicalizing a path or talking to the OS.
    Io(std::io::Error),

    /// Catch-all for backend-specific failures that don't have their own variant.
    Generic(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::PathNotFound => write!(f, "no such file or directory"),
            ErrorKind::WatchNotFound => write!(f, "path is not watched"),
            ErrorKind::MaxFilesWatch => write!(f, "backend watch limit reached"),
            ErrorKind::InvalidConfig => write!(f, "invalid configuration"),
            ErrorKind::Io(err) => write!(f, "io error: {err}"),
            ErrorKind::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

/// The error type for this crate.
///
/// Carries the paths involved (if any) alongside the [`ErrorKind`], so a caller can
/// report "not found: /foo/bar" rather than a bare "not found".
#[derive(Debug)]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Paths relevant to the error, in the order they were attached.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Build a new error from a kind, with no paths attached yet.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Convenience constructor for [`ErrorKind::PathNotFound`].
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Convenience constructor for [`ErrorKind::WatchNotFound`].
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Convenience constructor for [`ErrorKind::Generic`].
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Attach a path to this error, builder-style.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.paths.is_empty() {
            write!(f, " (")?;
            for (i, path) in self.paths.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", path.display())?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::new(ErrorKind::PathNotFound)
        } else {
            Self::new(ErrorKind::Io(err))
        }
    }
}

/// A specialized [`Result`](std::result::Result) for this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_path() {
        let err = Error::path_not_found().add_path(PathBuf::from("/tmp/gone"));
        assert!(err.to_string().contains("/tmp/gone"));
    }

    #[test]
    fn io_not_found_maps_to_path_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err.kind, ErrorKind::PathNotFound));
    }
}
