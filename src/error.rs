//! Error types used throughout the converter.
//!
//! Each variant below corresponds to one kind of failure this tool's
//! CLI reports: "usage", "I/O", "format", "allocation", "annotation
//! conflict", "resolution failure", "unsupported section", or
//! "structural".

use std::borrow::Cow;
use std::fmt::{self, Display};

/// Errors produced while loading the catalog, extracting annotations,
/// resolving relocations, or rewriting the object.
#[derive(Debug)]
pub enum Error {
    /// Wrong number of CLI arguments.
    Usage { msg: Cow<'static, str> },

    /// Could not open or read the catalog or the input/output object.
    Io { msg: Cow<'static, str> },

    /// Malformed catalog file, mismatched annotation record counts, or a
    /// generated name that overflowed its budget.
    Format { msg: Cow<'static, str> },

    /// An allocation failed.
    Allocation { msg: Cow<'static, str> },

    /// Two annotations disagree about the position of the same
    /// `(object, symbol)` pair.
    Conflict { msg: Cow<'static, str> },

    /// A relocation's symbol could not be resolved to a unique
    /// `(object, name, position)` triple.
    Resolution { msg: Cow<'static, str> },

    /// A relocation resolved, but its containing section is not one the
    /// livepatch loader is willing to convert.
    Unsupported { msg: Cow<'static, str> },

    /// Creating a section or renaming a symbol failed; this indicates a
    /// broken invariant in the graph, not a user-correctable input.
    Structural { msg: Cow<'static, str> },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage { msg } => write!(f, "usage: {msg}"),
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Format { msg } => write!(f, "format error: {msg}"),
            Error::Allocation { msg } => write!(f, "allocation error: {msg}"),
            Error::Conflict { msg } => write!(f, "conflicting annotation: {msg}"),
            Error::Resolution { msg } => write!(f, "unresolved relocation: {msg}"),
            Error::Unsupported { msg } => write!(f, "unsupported section: {msg}"),
            Error::Structural { msg } => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            msg: err.to_string().into(),
        }
    }
}

#[cold]
#[inline(never)]
#[allow(unused)]
pub(crate) fn usage_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Usage { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn format_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Format { msg: msg.into() }
}

#[cold]
#[inline(never)]
#[allow(unused)]
pub(crate) fn allocation_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Allocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn conflict_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Conflict { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn resolution_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Resolution { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Unsupported { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn structural_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Structural { msg: msg.into() }
}
