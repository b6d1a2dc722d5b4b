use core::fmt;
use std::{io, path::Path};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the import and export entry points.
pub struct Error {
    repr: Repr,
}

pub(crate) enum Repr {
    /// The codec (or the stream it was fed) failed.
    Other(String),
    /// The caller violated a precondition; nothing was started.
    Calling(String),
    /// The image layout has no JPEG component mapping.
    Unsupported(String),
    Io { context: String, error: io::Error },
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    Calling,
    Codec,
    UnsupportedLayout,
    Io,
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}
impl<'a> From<&'a str> for Repr {
    fn from(value: &'a str) -> Self {
        Self::Other(value.into())
    }
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self { repr: e.into() }
    }

    pub(crate) fn calling(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Calling(msg.into()),
        }
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self {
            repr: Repr::Unsupported(msg.into()),
        }
    }

    pub(crate) fn io(context: impl Into<String>, error: io::Error) -> Self {
        Self {
            repr: Repr::Io {
                context: context.into(),
                error,
            },
        }
    }

    /// Prefixes the message with the operation and the file it was applied to, keeping the kind.
    pub(crate) fn in_file(self, what: &str, path: &Path) -> Self {
        let prefix = format!("{what} '{}'", path.display());
        let repr = match self.repr {
            Repr::Other(s) => Repr::Other(format!("{prefix}: {s}")),
            Repr::Calling(s) => Repr::Calling(format!("{prefix}: {s}")),
            Repr::Unsupported(s) => Repr::Unsupported(format!("{prefix}: {s}")),
            Repr::Io { context, error } => Repr::Io {
                context: format!("{prefix}: {context}"),
                error,
            },
        };
        Self { repr }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            Repr::Other(_) => ErrorKind::Codec,
            Repr::Calling(_) => ErrorKind::Calling,
            Repr::Unsupported(_) => ErrorKind::UnsupportedLayout,
            Repr::Io { .. } => ErrorKind::Io,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Other(s) | Repr::Calling(s) | Repr::Unsupported(s) => s.fmt(f),
            Repr::Io { context, error } => write!(f, "{context}: {error}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.repr {
            Repr::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}
