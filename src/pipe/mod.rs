//! Synchronous in-memory pipes.
//!
//! A pipe connects a [`PipeReader`] to a [`PipeWriter`] with nothing in
//! between: each write blocks until readers have copied every one of its
//! bytes, so writes and reads happen in lockstep.

use crate::error::{PipeError, WriteError};
use futures_io::{AsyncRead, AsyncWrite};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

mod rendezvous;

use self::rendezvous::{PipeCore, StagedWrite};

const FLAG_NONBLOCKING: u8 = 0b0001;

/// Open a new pipe and return a reader and writer pair.
///
/// To customize the pipe, use [`PipeBuilder`] instead.
pub fn pipe() -> (PipeReader, PipeWriter) {
    PipeBuilder::default().build()
}

/// Creates new pipes with configurable properties.
#[derive(Clone, Debug, Default)]
pub struct PipeBuilder {
    flags: u8,
}

impl PipeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable non-blocking reads.
    ///
    /// If enabled, reading through [`std::io::Read`] while no write is being
    /// offered returns a `WouldBlock` error instead of blocking the thread.
    pub fn nonblocking(&mut self, nonblocking: bool) -> &mut Self {
        if nonblocking {
            self.flags |= FLAG_NONBLOCKING;
        } else {
            self.flags &= !FLAG_NONBLOCKING;
        }
        self
    }

    /// Create a new pipe using the current settings and return a reader and writer pair.
    pub fn build(&self) -> (PipeReader, PipeWriter) {
        let core = Arc::new(PipeCore::new());

        (
            PipeReader {
                flags: self.flags,
                core: core.clone(),
            },
            PipeWriter {
                core,
                staged: None,
            },
        )
    }
}

/// The reading end of a pipe.
///
/// Dropping the reader closes the pipe as if [`PipeReader::close`] were called.
pub struct PipeReader {
    flags: u8,
    core: Arc<PipeCore>,
}

impl PipeReader {
    /// Read bytes from the write currently in flight, blocking until one arrives.
    ///
    /// Returns at most `buf.len()` bytes; a write larger than `buf` stays
    /// blocked until later reads consume the rest. Once the pipe is closed this
    /// returns the close reason, including [`PipeError::EndOfStream`] when the
    /// writer closed without an error.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        self.core.read(buf)
    }

    /// Like [`recv`](PipeReader::recv), but returns `Ok(None)` instead of
    /// blocking when no write is being offered.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>, PipeError> {
        self.core.try_read(buf)
    }

    /// Set the non-blocking mode for reads made through [`std::io::Read`].
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        if nonblocking {
            self.flags |= FLAG_NONBLOCKING;
        } else {
            self.flags &= !FLAG_NONBLOCKING;
        }
    }

    /// Close the reading half. Pending and future writes fail with
    /// [`PipeError::Closed`] unless a more specific reason was recorded.
    pub fn close(&self) {
        self.core.close_read(None);
    }

    /// Close the reading half with a reason reported to writers.
    ///
    /// Only the first close of this half records its reason; later ones are
    /// ignored.
    pub fn close_with_error<E: Into<PipeError>>(&self, error: E) {
        self.core.close_read(Some(error.into()));
    }

    /// Check if either half of the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn read_io(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = if self.flags & FLAG_NONBLOCKING != 0 {
                match self.core.try_read(buf) {
                    Ok(Some(len)) => Ok(len),
                    Ok(None) => return Err(io::ErrorKind::WouldBlock.into()),
                    Err(e) => Err(e),
                }
            } else {
                self.core.read(buf)
            };

            // A zero-length write is not the end of the stream.
            match result {
                Ok(0) if !buf.is_empty() => continue,
                result => return read_result(result),
            }
        }
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_io(buf)
    }
}

impl io::Read for &PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_io(buf)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            match self.core.poll_read(cx, buf) {
                Poll::Ready(Ok(0)) if !buf.is_empty() => continue,
                poll => return poll.map(read_result),
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.core.close_read(None);
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("nonblocking", &(self.flags & FLAG_NONBLOCKING != 0))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The writing end of a pipe.
///
/// Dropping the writer closes the pipe as if [`PipeWriter::close`] were called.
pub struct PipeWriter {
    core: Arc<PipeCore>,

    /// An async write from this handle waiting in the pipe.
    staged: Option<StagedWrite>,
}

impl PipeWriter {
    /// Write all of `data`, blocking until readers have consumed it.
    ///
    /// Writes are serialized: while one is in flight, others wait for it to be
    /// fully consumed, so the bytes of two writes never interleave. An empty
    /// `data` still waits for one read to match it.
    ///
    /// If the pipe closes first, the returned [`WriteError`] tells how many
    /// bytes had been consumed already. After this writer's own
    /// [`close`](PipeWriter::close), writes fail with
    /// [`PipeError::EndOfStream`], which `io::Write` reports as
    /// `io::ErrorKind::UnexpectedEof` rather than `BrokenPipe`.
    pub fn send(&self, data: &[u8]) -> Result<usize, WriteError> {
        self.core.write(data)
    }

    /// Close the writing half. Readers see the end of the stream unless a more
    /// specific reason was recorded.
    ///
    /// Writing afterwards fails with [`PipeError::EndOfStream`]
    /// (`io::ErrorKind::UnexpectedEof` through `io::Write`), not with
    /// [`PipeError::Closed`].
    pub fn close(&self) {
        self.core.close_write(None);
    }

    /// Close the writing half with a reason reported to readers.
    ///
    /// Only the first close of this half records its reason; later ones are
    /// ignored.
    pub fn close_with_error<E: Into<PipeError>>(&self, error: E) {
        self.core.close_write(Some(error.into()));
    }

    /// Check if either half of the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn write_io(&self, data: &[u8]) -> io::Result<usize> {
        write_result(self.core.write(data))
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_io(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_io(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.core.poll_write(cx, buf, &mut this.staged).map(write_result)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.core
            .poll_flush(cx, &mut this.staged)
            .map(|result| result.map_err(io::Error::from))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let flushed = match this.core.poll_flush(cx, &mut this.staged) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        this.close();
        Poll::Ready(flushed.map_err(io::Error::from))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.core.close_write(None);
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// End of stream is a successful zero-length read to `io` callers.
fn read_result(result: Result<usize, PipeError>) -> io::Result<usize> {
    match result {
        Ok(len) => Ok(len),
        Err(PipeError::EndOfStream) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// A write cut short after some bytes went through is a short write; the
/// error surfaces on the next call.
fn write_result(result: Result<usize, WriteError>) -> io::Result<usize> {
    match result {
        Ok(len) => Ok(len),
        Err(e) if e.written > 0 => Ok(e.written),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_write() {
        let (mut reader, mut writer) = pipe();

        let producer = thread::spawn(move || writer.write(b"hello world").unwrap());

        let mut buf = [0; 11];
        assert_eq!(reader.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(producer.join().unwrap(), 11);
    }

    #[test]
    fn write_stays_blocked_until_fully_consumed() {
        let (reader, writer) = pipe();
        let finished = Arc::new(AtomicBool::new(false));

        let producer = thread::spawn({
            let finished = finished.clone();
            move || {
                let result = writer.send(b"hello");
                finished.store(true, Ordering::SeqCst);
                result
            }
        });

        let mut buf = [0; 3];
        assert_eq!(reader.recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");

        thread::sleep(Duration::from_millis(100));
        assert!(!finished.load(Ordering::SeqCst));

        let mut buf = [0; 3];
        assert_eq!(reader.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");

        assert_eq!(producer.join().unwrap().unwrap(), 5);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn read_empty_blocking() {
        let (reader, writer) = pipe();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            writer.send(&[1]).unwrap();
        });

        let mut buf = [0; 1];
        assert_eq!(reader.recv(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn zero_length_write_matches_one_read() {
        let (reader, writer) = pipe();

        let consumer = thread::spawn(move || reader.recv(&mut [0; 4]));

        assert_eq!(writer.send(&[]).unwrap(), 0);
        assert_eq!(consumer.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn close_writer_before_writing_is_end_of_stream() {
        let (mut reader, writer) = pipe();
        writer.close();

        assert!(reader.recv(&mut [0; 4]).unwrap_err().is_end_of_stream());
        assert_eq!(reader.read(&mut [0; 4]).unwrap(), 0);
    }

    #[test]
    fn close_reader_with_error_fails_pending_write() {
        let (reader, writer) = pipe();

        let producer = thread::spawn(move || writer.send(&[7; 10]));

        thread::sleep(Duration::from_millis(50));
        reader.close_with_error(PipeError::custom("X"));

        let error = producer.join().unwrap().unwrap_err();
        assert_eq!(error.written, 0);
        assert_eq!(error.error.to_string(), "X");
    }

    #[test]
    fn close_reader_after_partial_read_reports_count() {
        let (reader, mut writer) = pipe();

        let producer = thread::spawn(move || {
            let first = writer.write(&[7; 10]);
            let second = writer.write(&[7; 10]);
            (first.unwrap(), second.unwrap_err().kind())
        });

        let mut buf = [0; 4];
        assert_eq!(reader.recv(&mut buf).unwrap(), 4);
        reader.close();

        assert_eq!(producer.join().unwrap(), (4, io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn close_writer_wakes_blocked_reader() {
        let (reader, writer) = pipe();

        let consumer = thread::spawn(move || reader.recv(&mut [0; 4]));

        thread::sleep(Duration::from_millis(50));
        writer.close_with_error(io::Error::new(io::ErrorKind::TimedOut, "deadline"));

        let error = consumer.join().unwrap().unwrap_err();
        assert_eq!(io::Error::from(error).kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn close_is_idempotent() {
        let (reader, writer) = pipe();

        reader.close_with_error(PipeError::custom("first"));
        reader.close_with_error(PipeError::custom("second"));
        reader.close();
        writer.close();
        writer.close();
        drop(reader);

        assert_eq!(writer.send(b"hi").unwrap_err().error.to_string(), "end of stream");
        writer.close_with_error(PipeError::custom("too late"));
        assert!(writer.send(b"hi").unwrap_err().error.is_end_of_stream());
    }

    #[test]
    fn write_after_own_close_is_unexpected_eof() {
        let (_reader, mut writer) = pipe();
        writer.close();

        assert_eq!(writer.write(b"hi").unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_sees_reader_error_when_it_never_closed() {
        let (reader, writer) = pipe();

        reader.close_with_error(PipeError::custom("first"));
        reader.close_with_error(PipeError::custom("second"));

        for _ in 0..3 {
            let error = writer.send(b"hi").unwrap_err();
            assert_eq!(error.written, 0);
            assert_eq!(error.error.to_string(), "first");
        }
    }

    #[test]
    fn read_after_own_close_is_closed_pipe() {
        let (mut reader, _writer) = pipe();
        reader.close();

        assert!(matches!(reader.recv(&mut [0; 4]), Err(PipeError::Closed)));
        assert_eq!(reader.read(&mut [0; 4]).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn write_to_dropped_reader_returns_broken_pipe() {
        let (reader, mut writer) = pipe();

        assert!(!writer.is_closed());
        drop(reader);
        assert!(writer.is_closed());
        assert_eq!(writer.write(b"hi").err().unwrap().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn empty_write_does_not_end_stream() {
        let (mut reader, mut writer) = pipe();

        let producer = thread::spawn(move || {
            assert_eq!(writer.write(&[]).unwrap(), 0);
            writer.write_all(b"abc").unwrap();
        });

        let mut dest = Vec::new();
        reader.read_to_end(&mut dest).unwrap();
        producer.join().unwrap();

        assert_eq!(dest, b"abc");
    }

    #[test]
    fn dropped_writer_ends_stream() {
        let (mut reader, mut writer) = pipe();

        let producer = thread::spawn(move || {
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"world").unwrap();
        });

        let mut dest = String::new();
        reader.read_to_string(&mut dest).unwrap();
        producer.join().unwrap();

        assert_eq!(dest, "hello world");
    }

    #[test]
    fn concurrent_writes_do_not_interleave() {
        let (mut reader, writer) = pipe();

        thread::scope(|scope| {
            for id in 0..4u8 {
                let writer = &writer;
                scope.spawn(move || {
                    let mut writer = writer;
                    writer.write_all(&[id; 1000]).unwrap();
                });
            }

            let mut dest = vec![0; 4000];
            let mut filled = 0;
            while filled < dest.len() {
                let end = (filled + 7).min(dest.len());
                filled += reader.read(&mut dest[filled..end]).unwrap();
            }

            let mut seen = Vec::new();
            for block in dest.chunks(1000) {
                assert!(block.iter().all(|&b| b == block[0]));
                seen.push(block[0]);
            }
            seen.sort();
            assert_eq!(seen, vec![0, 1, 2, 3]);
        });
    }

    #[test]
    fn concurrent_readers_share_one_write() {
        let (reader, writer) = pipe();
        let reader = Arc::new(reader);

        let consumers = (0..3)
            .map(|_| {
                let reader = reader.clone();
                thread::spawn(move || {
                    let mut total = 0;
                    let mut buf = [0; 5];
                    while let Ok(len) = reader.recv(&mut buf) {
                        total += len;
                    }
                    total
                })
            })
            .collect::<Vec<_>>();

        assert_eq!(writer.send(&[1; 100]).unwrap(), 100);
        writer.close();

        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn read_nonblocking() {
        let (mut reader, _writer) = pipe();

        let mut buf = [0; 4];
        reader.set_nonblocking(true);
        assert_eq!(reader.read(&mut buf).err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert!(reader.try_recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn builder_nonblocking_reader_drains_offer() {
        let (mut reader, writer) = PipeBuilder::new().nonblocking(true).build();

        let producer = thread::spawn(move || writer.send(b"abc"));

        let mut buf = [0; 8];
        let len = loop {
            match reader.read(&mut buf) {
                Ok(len) => break len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) => panic!("unexpected error: {}", e),
            }
        };

        assert_eq!(&buf[..len], b"abc");
        assert_eq!(producer.join().unwrap().unwrap(), 3);
    }
}
