//! Fixed-size receive slot pool, owned by a connection.
//!
//! A pool's message slots are realized as freshly built `Message`s whose
//! `header`/`data` buffers are `smallvec::SmallVec`s sized to the slot's
//! pre-allocated capacity (`message::INLINE_HEADER`/`INLINE_DATA`): the
//! common case allocates nothing, exactly like the original's
//! pre-allocated per-slot buffers, without this crate having to manage a
//! reused byte arena by hand. What the pool itself tracks is the
//! capacity-bounded concurrency control that actually matters: how many
//! slots are acquired right now, and whether a connection should stop
//! or resume reading from the socket.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::identity::Identity;
use crate::message::{IpProtocol, Message, SlotHandle};

struct PoolState {
    bitmask: u32,
    max_slots: u8,
    /// Set once `acquire` has returned `None`; cleared on the next
    /// successful `release`. Used to decide whether that release should
    /// restart reading.
    exhausted: bool,
    /// Wake hook into the still-attached connection's reader, cleared on
    /// connection teardown. The pool itself can outlive the connection
    /// (while outstanding received messages still hold slots); once
    /// this is `None`, `release` never tries to restart reading.
    restart: Option<Arc<Notify>>,
}

/// The pool's shared, refcounted inner state. A `BufferPool` (owned by
/// the connection) and every outstanding received `Message` with
/// `HAS_SLOT` each hold an `Arc` to this; it is freed once the last one
/// drops, which can happen after the connection itself has been torn
/// down.
pub(crate) struct BufferPoolInner {
    state: Mutex<PoolState>,
}

impl BufferPoolInner {
    fn acquire_bit(&self) -> Option<u8> {
        let mut st = self.state.lock();
        for i in 0..st.max_slots {
            let bit = 1u32 << i;
            if st.bitmask & bit == 0 {
                st.bitmask |= bit;
                return Some(i);
            }
        }
        st.exhausted = true;
        None
    }

    /// Clears the acquired bit for `id`. Returns `true` if the pool was
    /// exhausted before this release *and* a connection is still
    /// attached, meaning the caller should restart reading and replay
    /// any buffered partial message.
    ///
    /// A second release of an already-free slot is a logic error: this
    /// asserts in debug builds, and is a logged no-op in release builds.
    pub(crate) fn release(&self, id: u8) -> bool {
        let mut st = self.state.lock();
        let bit = 1u32 << id;
        if st.bitmask & bit == 0 {
            debug_assert!(false, "double release of buffer pool slot {}", id);
            log::error!("double release of buffer pool slot {} (ignored)", id);
            return false;
        }
        st.bitmask &= !bit;
        let should_restart = st.exhausted && st.restart.is_some();
        st.exhausted = false;
        if should_restart {
            if let Some(restart) = st.restart.as_ref() {
                restart.notify_one();
            }
        }
        should_restart
    }

    pub(crate) fn used_slots(&self) -> u32 {
        self.state.lock().bitmask.count_ones()
    }

    pub(crate) fn max_slots(&self) -> u8 {
        self.state.lock().max_slots
    }

    /// Detaches this pool from its connection. After this, `release`
    /// never reports "restart reading" again, matching "the pool's
    /// back-pointer to the connection becomes `None` on connection
    /// teardown".
    pub(crate) fn detach(&self) {
        self.state.lock().restart = None;
    }
}

/// The pool a connection owns, handing out receive slots bounded by
/// `MAX_SLOTS` (1..=32).
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    pub fn new(max_slots: u8, restart: Arc<Notify>) -> Self {
        assert!(max_slots >= 1 && max_slots <= 32, "MAX_SLOTS must be in 1..=32");
        let inner = Arc::new(BufferPoolInner {
            state: Mutex::new(PoolState {
                bitmask: 0,
                max_slots,
                exhausted: false,
                restart: Some(restart),
            }),
        });
        BufferPool { inner }
    }

    /// Acquires a fresh receive slot, zeroed and flagged `HAS_SLOT`, or
    /// `None` if `used_slots == max_slots`.
    pub fn acquire(&self) -> Option<Message> {
        let id = self.inner.acquire_bit()?;
        let mut msg = Message::new(IpProtocol::V4, [0; 16], 0);
        msg.identity = Identity::ZERO;
        msg.internal_flags.insert(crate::message::InternalFlags::HAS_SLOT);
        msg.slot = Some(SlotHandle { pool: self.inner.clone(), id });
        Some(msg)
    }

    pub fn used_slots(&self) -> u32 {
        self.inner.used_slots()
    }

    pub fn max_slots(&self) -> u8 {
        self.inner.max_slots()
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_slots() == self.max_slots() as u32
    }

    /// A clone of the pool's refcounted inner handle, kept alive by
    /// outstanding received messages even after the connection that
    /// created this `BufferPool` is torn down.
    pub(crate) fn handle(&self) -> Arc<BufferPoolInner> {
        self.inner.clone()
    }

    pub(crate) fn detach(&self) {
        self.inner.detach();
    }
}

/// Releases a received message's slot, if it holds one. Returns whether
/// the connection should restart reading (see `BufferPoolInner::release`).
/// A message without a slot is a no-op, returning `false`.
pub(crate) fn release_message_slot(msg: &mut Message) -> bool {
    match msg.slot.take() {
        Some(SlotHandle { pool, id }) => pool.release(id),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_and_release_frees() {
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(2, notify);
        let a = pool.acquire().unwrap();
        let mut b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.used_slots(), 2);

        let restart = release_message_slot(&mut b);
        assert!(restart, "releasing from an exhausted pool should ask to restart reading");
        assert_eq!(pool.used_slots(), 1);
        drop(a);
    }

    #[test]
    fn release_without_slot_is_a_no_op() {
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify);
        let mut msg = Message::new(IpProtocol::V4, [0; 16], 0);
        assert!(!release_message_slot(&mut msg));
        assert_eq!(pool.used_slots(), 0);
    }

    #[test]
    fn detach_disables_restart_signal() {
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify);
        let mut msg = pool.acquire().unwrap();
        pool.detach();
        let restart = release_message_slot(&mut msg);
        assert!(!restart, "a detached pool must never ask to restart reading");
    }
}
