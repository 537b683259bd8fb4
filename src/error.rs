use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codec, the dispatcher and the operation wrappers.
///
/// Kernel failures keep their original errno; nothing is remapped into a
/// richer taxonomy. Everything else describes bytes we refuse to parse or
/// values we refuse to serialize.
#[derive(Error, Debug)]
pub enum Error {
    #[error("nvlist is not in a known encoding")]
    InvalidEncoding,

    #[error("nvlist is neither in big nor in little endian")]
    InvalidEndianness,

    #[error("nvlist contains invalid data")]
    InvalidData,

    #[error("value cannot be represented as an nvlist: {0}")]
    InvalidValue(&'static str),

    #[error("nvlist contains an unsupported type (hrtime)")]
    UnsupportedType,

    #[error("output nvlist would exceed the 16 MiB cap")]
    BufferTooLarge,

    #[error("control device unavailable: {0}")]
    Device(#[source] io::Error),

    #[error("control call failed: {0}")]
    Kernel(#[source] io::Error),

    #[error("stream pipe failed: {0}")]
    Pipe(#[source] io::Error),

    /// The operation succeeded for some entries and failed for others;
    /// the map carries an errno per failed entry.
    #[error("operation failed for {} of its entries", .0.len())]
    Partial(BTreeMap<String, i32>),

    #[error("receiving stream failed")]
    StreamFailed,
}

impl Error {
    pub(crate) fn from_errno(errno: i32) -> Self {
        Error::Kernel(io::Error::from_raw_os_error(errno))
    }

    /// The raw kernel errno, if this error came out of a control call.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Kernel list iteration signals its end with ESRCH.
    pub fn is_list_end(&self) -> bool {
        self.errno() == Some(libc::ESRCH)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Kernel(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
