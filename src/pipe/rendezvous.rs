//! The rendezvous state machine shared by the two halves of a pipe.
//!
//! There is no buffer. A write places its span of bytes in a single slot and
//! waits; readers copy straight out of that span into their own buffers until
//! it has been consumed, and only then does the write return. While one write
//! occupies the slot, every other write waits its turn.
//!
//! Closing either half fires a one-shot signal that wakes everything parked on
//! the slot, blocking threads and async tasks alike.

use crate::error::{PipeError, WriteError};
use crate::internal::once::OnceError;
use crate::internal::sync::{Signal, WakerSet};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::slice;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Where the bytes of the in-flight write live.
enum Span {
    /// The buffer of a blocking `write` call. That call does not return until
    /// the offer has been taken back out of the slot.
    Borrowed { ptr: *const u8, len: usize },

    /// A copy made by `poll_write`, whose buffer is only borrowed for the
    /// duration of a single poll. Readers free the slot themselves once they
    /// have consumed all of it, so a cancelled async write never holds the
    /// slot past its consumption.
    Staged { bytes: Arc<[u8]>, ticket: u64 },
}

/// The in-flight write as seen by readers.
struct Offer {
    span: Span,

    /// How many bytes readers have consumed so far.
    pos: usize,

    /// Set by the first read that matches this offer. A zero-length write is
    /// complete once matched.
    matched: bool,
}

// SAFETY: a `Span::Borrowed` pointer is only dereferenced while the slot lock
// is held, and the thread that lent the buffer removes the offer under that
// same lock before it returns.
unsafe impl Send for Offer {}

impl Offer {
    fn borrowed(data: &[u8]) -> Self {
        Self::new(Span::Borrowed {
            ptr: data.as_ptr(),
            len: data.len(),
        })
    }

    fn staged(bytes: Arc<[u8]>, ticket: u64) -> Self {
        Self::new(Span::Staged { bytes, ticket })
    }

    fn new(span: Span) -> Self {
        Self {
            span,
            pos: 0,
            matched: false,
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.span {
            Span::Borrowed { ptr, len } => unsafe { slice::from_raw_parts(*ptr, *len) },
            Span::Staged { bytes, .. } => &bytes[..],
        }
    }

    fn ticket(&self) -> Option<u64> {
        match &self.span {
            Span::Borrowed { .. } => None,
            Span::Staged { ticket, .. } => Some(*ticket),
        }
    }

    fn is_done(&self) -> bool {
        self.matched && self.pos == self.bytes().len()
    }

    /// Copy as much of the remaining span as fits into `dest`.
    fn copy_to(&mut self, dest: &mut [u8]) -> usize {
        let src = &self.bytes()[self.pos..];
        let len = src.len().min(dest.len());
        dest[..len].copy_from_slice(&src[..len]);

        self.pos += len;
        self.matched = true;

        len
    }
}

#[derive(Default)]
struct Slot {
    /// A write owns the slot, whether or not its offer is finished.
    busy: bool,
    offer: Option<Offer>,
    next_ticket: u64,
    readers: WakerSet,
    writers: WakerSet,
}

impl Slot {
    /// Whether the staged write identified by `ticket` is still in the slot.
    fn holds(&self, ticket: u64) -> bool {
        self.offer.as_ref().and_then(Offer::ticket) == Some(ticket)
    }
}

/// The async write a writer has handed to the slot and not yet seen complete.
pub(crate) struct StagedWrite {
    ticket: u64,
    bytes: Arc<[u8]>,

    /// Address of the caller's buffer when the write was staged.
    addr: usize,
}

impl StagedWrite {
    /// Whether `data` is a repeat of the poll that staged this write.
    fn is_repoll(&self, data: &[u8]) -> bool {
        self.addr == data.as_ptr() as usize && &self.bytes[..] == data
    }
}

pub(crate) struct PipeCore {
    slot: Mutex<Slot>,
    changed: Condvar,
    closed: Signal,
    read_error: OnceError,
    write_error: OnceError,
}

impl PipeCore {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            changed: Condvar::new(),
            closed: Signal::new(),
            read_error: OnceError::new(),
            write_error: OnceError::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Block until readers have consumed all of `data`, or the pipe closes.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        let mut slot = self.slot.lock();

        loop {
            if self.closed.is_fired() {
                return Err(WriteError::new(0, self.write_close_error()));
            }

            if !slot.busy {
                break;
            }

            self.changed.wait(&mut slot);
        }

        slot.busy = true;
        slot.offer = Some(Offer::borrowed(data));
        self.notify(&mut slot);

        while !offer_done(&slot) && !self.closed.is_fired() {
            self.changed.wait(&mut slot);
        }

        let done = offer_done(&slot);
        let written = self.withdraw(&mut slot);

        if done {
            trace!("write of {} bytes consumed", written);
            Ok(written)
        } else {
            Err(WriteError::new(written, self.write_close_error()))
        }
    }

    /// Block until a write is offered, or the pipe closes.
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        let mut slot = self.slot.lock();

        loop {
            if let Some(len) = self.take(&mut slot, buf)? {
                return Ok(len);
            }

            self.changed.wait(&mut slot);
        }
    }

    /// Read from the current offer if there is one, without waiting.
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, PipeError> {
        let mut slot = self.slot.lock();
        self.take(&mut slot, buf)
    }

    pub(crate) fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, PipeError>> {
        let mut slot = self.slot.lock();

        match self.take(&mut slot, buf) {
            Ok(Some(len)) => Poll::Ready(Ok(len)),
            Ok(None) => {
                slot.readers.register(cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Asynchronous counterpart of `write`.
    ///
    /// The first poll stages a copy of `data` in the slot; the write completes
    /// once readers have consumed all of it. `staged` belongs to the calling
    /// writer. A poll with a different buffer than the one staged means the
    /// earlier write was cancelled: if no reader touched it yet it is taken
    /// back, otherwise readers finish it before the new write gets the slot.
    pub(crate) fn poll_write(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        staged: &mut Option<StagedWrite>,
    ) -> Poll<Result<usize, WriteError>> {
        let mut slot = self.slot.lock();

        if let Some(write) = staged.as_ref() {
            if write.is_repoll(data) {
                return self.poll_staged(&mut slot, cx, staged);
            }

            let untouched = slot.holds(write.ticket) && !slot.offer.as_ref().map_or(false, |o| o.matched);
            if untouched {
                trace!("withdrawing cancelled write of {} bytes", write.bytes.len());
                self.withdraw(&mut slot);
            }
            *staged = None;
        }

        if self.closed.is_fired() {
            return Poll::Ready(Err(WriteError::new(0, self.write_close_error())));
        }

        if slot.busy {
            slot.writers.register(cx.waker());
            return Poll::Pending;
        }

        let ticket = slot.next_ticket;
        slot.next_ticket += 1;

        let bytes: Arc<[u8]> = Arc::from(data);
        slot.busy = true;
        slot.offer = Some(Offer::staged(bytes.clone(), ticket));
        *staged = Some(StagedWrite {
            ticket,
            bytes,
            addr: data.as_ptr() as usize,
        });
        self.notify(&mut slot);

        slot.writers.register(cx.waker());
        Poll::Pending
    }

    /// Wait for a staged write to be consumed. Nothing to do otherwise.
    pub(crate) fn poll_flush(
        &self,
        cx: &mut Context<'_>,
        staged: &mut Option<StagedWrite>,
    ) -> Poll<Result<(), WriteError>> {
        if staged.is_none() {
            return Poll::Ready(Ok(()));
        }

        let mut slot = self.slot.lock();
        self.poll_staged(&mut slot, cx, staged).map(|result| result.map(|_| ()))
    }

    fn poll_staged(
        &self,
        slot: &mut Slot,
        cx: &mut Context<'_>,
        staged: &mut Option<StagedWrite>,
    ) -> Poll<Result<usize, WriteError>> {
        let write = match staged.as_ref() {
            Some(write) => write,
            None => return Poll::Ready(Ok(0)),
        };

        // Readers release a staged offer once it is fully consumed.
        if !slot.holds(write.ticket) {
            let written = write.bytes.len();
            *staged = None;
            trace!("write of {} bytes consumed", written);
            return Poll::Ready(Ok(written));
        }

        if self.closed.is_fired() {
            *staged = None;
            let written = self.withdraw(slot);
            return Poll::Ready(Err(WriteError::new(written, self.write_close_error())));
        }

        slot.writers.register(cx.waker());
        Poll::Pending
    }

    pub(crate) fn close_read(&self, error: Option<PipeError>) {
        self.read_error.set_if_empty(error.unwrap_or(PipeError::Closed));
        self.close("read");
    }

    pub(crate) fn close_write(&self, error: Option<PipeError>) {
        self.write_error.set_if_empty(error.unwrap_or(PipeError::EndOfStream));
        self.close("write");
    }

    fn close(&self, half: &str) {
        if self.closed.fire() {
            debug!("pipe closed from the {} half", half);
        }

        let mut slot = self.slot.lock();
        self.notify(&mut slot);
    }

    /// The error a reader sees once the pipe is closed.
    fn read_close_error(&self) -> PipeError {
        self.read_error
            .get()
            .or_else(|| self.write_error.get())
            .unwrap_or(PipeError::Closed)
    }

    /// The error a writer sees once the pipe is closed.
    fn write_close_error(&self) -> PipeError {
        self.write_error
            .get()
            .or_else(|| self.read_error.get())
            .unwrap_or(PipeError::Closed)
    }

    /// Copy from the current unfinished offer into `buf`. `None` means there is
    /// nothing to read yet.
    fn take(&self, slot: &mut Slot, buf: &mut [u8]) -> Result<Option<usize>, PipeError> {
        if self.closed.is_fired() {
            return Err(self.read_close_error());
        }

        let (len, release) = match slot.offer.as_mut() {
            Some(offer) if !offer.is_done() => {
                let len = offer.copy_to(buf);
                (len, offer.is_done() && offer.ticket().is_some())
            }
            _ => return Ok(None),
        };

        if release {
            slot.offer = None;
            slot.busy = false;
        }

        self.notify(slot);
        Ok(Some(len))
    }

    /// Remove the current offer and free the slot for the next write. Returns
    /// how many bytes of the offer were consumed.
    fn withdraw(&self, slot: &mut Slot) -> usize {
        let written = slot.offer.take().map_or(0, |offer| offer.pos);
        slot.busy = false;
        self.notify(slot);

        written
    }

    /// Wake everything parked on the slot. Must be called with the slot locked.
    fn notify(&self, slot: &mut Slot) {
        self.changed.notify_all();
        slot.readers.wake_all();
        slot.writers.wake_all();
    }
}

fn offer_done(slot: &Slot) -> bool {
    slot.offer.as_ref().map_or(false, Offer::is_done)
}
