//! Synchronous, unbuffered in-memory pipes.
//!
//! A pipe hands bytes straight from a writer to a reader. Nothing is buffered
//! in between, so every write blocks until readers have consumed all of it.
//! Either half can be closed at any time, optionally with an error that is
//! then reported to the other half.
//!
//! ```
//! use std::io::{Read, Write};
//! use std::thread;
//!
//! let (mut reader, mut writer) = syncpipe::pipe();
//!
//! thread::spawn(move || {
//!     writer.write_all(b"hello").unwrap();
//! });
//!
//! let mut dest = String::new();
//! reader.read_to_string(&mut dest).unwrap();
//! assert_eq!(dest, "hello");
//! ```

mod error;
mod internal;
mod pipe;

pub use crate::error::{PipeError, WriteError};
pub use crate::pipe::{pipe, PipeBuilder, PipeReader, PipeWriter};
