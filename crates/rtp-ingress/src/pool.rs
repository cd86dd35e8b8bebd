//! # Reconstruction Buffer
//!
//! A single reusable scratch buffer used to materialize an original packet
//! out of an RTX wrapper. One receiver owns exactly one slot.
//!
//! The slot lives inside the receiver's critical section. Acquiring moves the
//! backing allocation out of the slot (the slot is then "busy"); the guard
//! returns it on drop, so every exit path releases it. Acquisition never
//! waits: a second acquirer gets [`DropReason::BufferBusy`].
//!
//! The lock is held only for the take/put-back; copying into the buffer
//! happens outside it.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::DropReason;

/// Largest packet the receiver reconstructs (Ethernet MTU).
pub const IP_PACKET_SIZE: usize = 1500;

// ─── Slot ───────────────────────────────────────────────────────────────────

/// The buffer plus its busy state: busy ⇔ the allocation is checked out.
#[derive(Debug)]
pub struct ScratchSlot {
    buf: Option<Box<[u8]>>,
    capacity: usize,
    /// Acquisitions refused because the buffer was checked out.
    busy_rejections: u64,
}

impl ScratchSlot {
    pub fn new(capacity: usize) -> Self {
        ScratchSlot {
            buf: Some(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            busy_rejections: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.buf.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn busy_rejections(&self) -> u64 {
        self.busy_rejections
    }

    fn take(&mut self) -> Option<Box<[u8]>> {
        let buf = self.buf.take();
        if buf.is_none() {
            self.busy_rejections += 1;
        }
        buf
    }

    fn put_back(&mut self, buf: Box<[u8]>) {
        debug_assert!(self.buf.is_none(), "scratch buffer returned twice");
        self.buf = Some(buf);
    }
}

impl Default for ScratchSlot {
    fn default() -> Self {
        Self::new(IP_PACKET_SIZE)
    }
}

/// Anything that owns a [`ScratchSlot`] behind a lock.
pub trait SlotHost {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ScratchSlot) -> R) -> R;
}

impl SlotHost for Mutex<ScratchSlot> {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ScratchSlot) -> R) -> R {
        f(&mut self.lock())
    }
}

// ─── Guard ──────────────────────────────────────────────────────────────────

/// Exclusive hold on the scratch buffer. Releases it on drop.
pub struct ScratchGuard<'a, H: SlotHost> {
    host: &'a H,
    buf: Option<Box<[u8]>>,
    len: usize,
}

impl<'a, H: SlotHost> ScratchGuard<'a, H> {
    /// Check the buffer out, or fail immediately if someone else holds it.
    pub fn acquire(host: &'a H) -> Result<Self, DropReason> {
        let buf = host
            .with_slot(ScratchSlot::take)
            .ok_or(DropReason::BufferBusy)?;
        Ok(ScratchGuard { host, buf: Some(buf), len: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Write `len` bytes via `write`, which returns the number of bytes it
    /// actually produced (or `None` on failure). On any error the guard is
    /// consumed, which releases the buffer.
    pub fn fill(
        mut self,
        len: usize,
        write: impl FnOnce(&mut [u8]) -> Option<usize>,
    ) -> Result<Self, DropReason> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(DropReason::OversizedPacket { len, capacity });
        }
        let buf = self.buf.as_deref_mut().ok_or(DropReason::BufferBusy)?;
        let written = write(&mut buf[..len]).ok_or(DropReason::ParseError)?;
        self.len = written;
        Ok(self)
    }

    /// Bytes produced by the last [`fill`](Self::fill).
    pub fn filled(&self) -> &[u8] {
        self.buf.as_deref().map_or(&[], |b| &b[..self.len])
    }

    /// Copy the filled bytes out and release the buffer.
    pub fn detach(self) -> Bytes {
        Bytes::copy_from_slice(self.filled())
    }
}

impl<H: SlotHost> Drop for ScratchGuard<'_, H> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.host.with_slot(|slot| slot.put_back(buf));
        }
    }
}
