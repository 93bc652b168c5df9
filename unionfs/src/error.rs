use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by the union filesystem core.
///
/// [Error::Host] carries an unaltered host errno and is the only variant
/// that can occur for a fully-started mount; the other variants are
/// startup-fatal and are only ever raised while constructing a [crate::UnionFs]
/// or before the first filesystem operation is served.
#[derive(Debug, Error)]
pub enum Error {
    /// Two sources contain a root-level entry with the same name.
    #[error("duplicate top-level entry {name:?} found in both {first:?} and {second:?}")]
    DuplicatePath {
        name: std::ffi::OsString,
        first: std::path::PathBuf,
        second: std::path::PathBuf,
    },

    /// A source's root directory could not be listed.
    #[error("source {path:?} is unreadable: {source}")]
    SourceUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The CLI or mount-option string could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A host filesystem call failed; errno is propagated unchanged.
    #[error("{0}")]
    Host(#[from] Errno),
}

impl Error {
    /// Maps this error onto the raw errno the FUSE bridge expects.
    ///
    /// Startup-fatal variants have no natural errno; callers that reach the
    /// FUSE boundary with one of those have a logic bug, so we fall back to
    /// `EIO` rather than panicking.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Host(errno) => *errno as libc::c_int,
            Error::DuplicatePath { .. } | Error::SourceUnreadable { .. } => libc::EIO,
            Error::InvalidConfig(_) => libc::EINVAL,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::Host(Errno::from_i32(errno)),
            None => Error::Host(Errno::EIO),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.to_errno())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
