//! Error values reported by a pipe once one of its halves has been closed.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// The reason a pipe operation could not proceed.
///
/// Every read or write against a closed pipe reports one of these. The value
/// is cheap to clone, so the same close reason can be handed to any number of
/// callers blocked on either half.
#[derive(Clone, thiserror::Error)]
pub enum PipeError {
    /// Neither half recorded a more specific reason.
    #[error("read/write on closed pipe")]
    Closed,

    /// The writer finished. Readers see this as the end of the stream rather
    /// than as a failure.
    #[error("end of stream")]
    EndOfStream,

    /// An error supplied by whoever closed the pipe.
    #[error("{0}")]
    Custom(Arc<dyn Error + Send + Sync>),
}

impl PipeError {
    /// Wrap an arbitrary error so it can be used as a close reason.
    pub fn custom<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        PipeError::Custom(Arc::from(error.into()))
    }

    /// Returns `true` if this is the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PipeError::EndOfStream)
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            PipeError::Closed => io::ErrorKind::BrokenPipe,
            PipeError::EndOfStream => io::ErrorKind::UnexpectedEof,
            PipeError::Custom(inner) => match inner.downcast_ref::<io::Error>() {
                Some(e) => e.kind(),
                None => io::ErrorKind::Other,
            },
        }
    }
}

impl fmt::Debug for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Closed => f.write_str("Closed"),
            PipeError::EndOfStream => f.write_str("EndOfStream"),
            PipeError::Custom(inner) => f.debug_tuple("Custom").field(inner).finish(),
        }
    }
}

impl From<io::Error> for PipeError {
    fn from(error: io::Error) -> Self {
        PipeError::Custom(Arc::new(error))
    }
}

impl From<PipeError> for io::Error {
    fn from(error: PipeError) -> Self {
        io::Error::new(error.kind(), error)
    }
}

/// A write that was cut short because the pipe closed.
///
/// Carries the number of bytes that had already been handed to readers before
/// the close, so none of the transfer is unaccounted for.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{error} after writing {written} bytes")]
pub struct WriteError {
    /// Bytes consumed by readers before the pipe closed.
    pub written: usize,

    /// Why the write stopped.
    #[source]
    pub error: PipeError,
}

impl WriteError {
    pub(crate) fn new(written: usize, error: PipeError) -> Self {
        Self { written, error }
    }
}

impl From<WriteError> for io::Error {
    fn from(error: WriteError) -> Self {
        error.error.into()
    }
}
