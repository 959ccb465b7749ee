use std::io;

/// Errors produced by the probing engine.
///
/// Fallible operations return these explicitly; "skip and continue"
/// decisions (malformed CSV lines, failed sends) are made by the caller,
/// not inside the primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied value is out of contract (payload too small for
    /// the checksum tweak, malformed CSV line, malformed CIDR, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An OS-level operation failed (socket open/bind/send, capture open,
    /// file open). Carries the underlying I/O error so errno is preserved.
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A buffer bound was exceeded. Should not occur when the minimum
    /// payload size is respected.
    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl Error {
    pub fn system(context: impl Into<String>, source: io::Error) -> Self {
        Error::System {
            context: context.into(),
            source,
        }
    }

    /// The raw OS error code, when this is a system error that has one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::System { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
