//! The `Message` type traded between chirp nodes, and its two bitsets
//! (`TypeBits` wire flags, `InternalFlags` library bookkeeping flags).

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer_pool::BufferPoolInner;
use crate::error::ErrorKind;
use crate::identity::Identity;

/// Inline capacity of a message's header buffer before it spills to the
/// heap. Matches the pool's own pre-allocated small header buffer size,
/// so the common case never allocates.
pub const INLINE_HEADER: usize = 32;

/// Inline capacity of a message's data buffer before it spills to the
/// heap, mirroring the pool's pre-allocated data buffer size.
pub const INLINE_DATA: usize = 512;

/// Which IP protocol a remote's address is carried over.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IpProtocol {
    V4,
    V6,
}

/// Wire-visible type bits carried in every message header. A
/// hand-rolled bitset rather than a `bitflags` derive: three bits don't
/// warrant a new dependency.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TypeBits(u8);

impl TypeBits {
    pub const NONE: TypeBits = TypeBits(0);
    /// Request an ACK for this message.
    pub const REQ_ACK: TypeBits = TypeBits(1 << 0);
    /// This message is an ACK.
    pub const ACK: TypeBits = TypeBits(1 << 1);
    /// Keep-alive probe; carries no header/data and must not request an ACK.
    pub const NOOP: TypeBits = TypeBits(1 << 2);

    const ALL_KNOWN: u8 = Self::REQ_ACK.0 | Self::ACK.0 | Self::NOOP.0;

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rejects any bit outside the three currently defined, so a peer
    /// sending garbage type bits is caught at decode time.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL_KNOWN != 0 {
            None
        } else {
            Some(TypeBits(bits))
        }
    }

    pub fn contains(self, other: TypeBits) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TypeBits {
    type Output = TypeBits;
    fn bitor(self, rhs: TypeBits) -> TypeBits {
        TypeBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeBits {
    fn bitor_assign(&mut self, rhs: TypeBits) {
        self.0 |= rhs.0;
    }
}

/// Library-internal bookkeeping flags, never sent over the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct InternalFlags(u16);

impl InternalFlags {
    pub const NONE: InternalFlags = InternalFlags(0);
    /// Owned by the library; set while enqueued or in flight.
    pub const USED: InternalFlags = InternalFlags(1 << 0);
    /// The header buffer is a reader-allocated heap overflow buffer.
    pub const FREE_HEADER: InternalFlags = InternalFlags(1 << 1);
    /// The data buffer is a reader-allocated heap overflow buffer.
    pub const FREE_DATA: InternalFlags = InternalFlags(1 << 2);
    /// An ACK matching this message's identity has been observed (or
    /// simulated, for messages that didn't request one).
    pub const ACK_RECEIVED: InternalFlags = InternalFlags(1 << 3);
    /// The writer has finished placing this message's bytes on the wire.
    pub const WRITE_DONE: InternalFlags = InternalFlags(1 << 4);
    /// This (received) message owns a pool slot the receiver must
    /// release exactly once.
    pub const HAS_SLOT: InternalFlags = InternalFlags(1 << 5);
    /// The receiver owes an ACK, to be emitted when the slot is released.
    pub const SEND_ACK: InternalFlags = InternalFlags(1 << 6);

    pub fn contains(self, other: InternalFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InternalFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: InternalFlags) {
        self.0 &= !other.0;
    }

    /// A message is *finished* once both `ACK_RECEIVED` and `WRITE_DONE`
    /// hold.
    pub fn is_finished(self) -> bool {
        self.contains(InternalFlags::ACK_RECEIVED) && self.contains(InternalFlags::WRITE_DONE)
    }
}

/// Called once a sent message's lifecycle completes, with the final
/// status (`ErrorKind::Success` or a terminal error).
pub type SendCallback = Box<dyn FnOnce(ErrorKind) + Send>;

/// Called once a release (and the ACK it may have triggered) completes.
pub type ReleaseCallback = Box<dyn FnOnce(ErrorKind) + Send>;

/// A discrete, length-delimited message.
///
/// A receiver fills `remote_identity` and the source `address`/`port`;
/// a sender fills the destination. Replying to a received message only
/// requires swapping the body, since address/port are already the
/// peer's.
pub struct Message {
    pub identity: Identity,
    pub serial: u32,
    pub type_bits: TypeBits,
    pub header: SmallVec<[u8; INLINE_HEADER]>,
    pub data: SmallVec<[u8; INLINE_DATA]>,
    pub address: [u8; 16],
    pub ip_protocol: IpProtocol,
    pub port: i32,
    pub remote_identity: Identity,
    pub user_data: Option<Arc<dyn std::any::Any + Send + Sync>>,
    pub(crate) internal_flags: InternalFlags,
    pub(crate) slot: Option<SlotHandle>,
    pub send_callback: Option<SendCallback>,
    pub release_callback: Option<ReleaseCallback>,
}

/// Links a received `Message` back to the pool slot it occupies, so
/// `release` can find the right bit to clear without the caller having
/// to track it.
pub(crate) struct SlotHandle {
    pub(crate) pool: Arc<BufferPoolInner>,
    pub(crate) id: u8,
}

impl Message {
    /// Creates an empty outgoing message bound for `address`/`port`.
    pub fn new(ip_protocol: IpProtocol, address: [u8; 16], port: i32) -> Self {
        Message {
            identity: Identity::ZERO,
            serial: 0,
            type_bits: TypeBits::NONE,
            header: SmallVec::new(),
            data: SmallVec::new(),
            address,
            ip_protocol,
            port,
            remote_identity: Identity::ZERO,
            user_data: None,
            internal_flags: InternalFlags::NONE,
            slot: None,
            send_callback: None,
            release_callback: None,
        }
    }

    pub fn set_data(&mut self, header: &[u8], data: &[u8]) {
        self.header = SmallVec::from_slice(header);
        self.data = SmallVec::from_slice(data);
    }

    pub fn set_address(&mut self, ip_protocol: IpProtocol, address: [u8; 16], port: i32) {
        self.ip_protocol = ip_protocol;
        self.address = address;
        self.port = port;
    }

    pub fn address(&self) -> ([u8; 16], i32) {
        (self.address, self.port)
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote_identity
    }

    /// True if this message currently owns a receive slot that must be
    /// released.
    pub fn has_slot(&self) -> bool {
        self.internal_flags.contains(InternalFlags::HAS_SLOT)
    }

    /// Drops any heap-overflow header/data buffers, resetting them to
    /// empty. A no-op for inline (small) buffers, since `smallvec`
    /// already avoids allocating those.
    pub fn free_data(&mut self) {
        self.header = SmallVec::new();
        self.data = SmallVec::new();
        self.internal_flags.remove(InternalFlags::FREE_HEADER);
        self.internal_flags.remove(InternalFlags::FREE_DATA);
    }

    pub(crate) fn requires_ack(&self) -> bool {
        self.type_bits.contains(TypeBits::REQ_ACK)
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.type_bits.contains(TypeBits::ACK)
    }

    pub(crate) fn is_noop(&self) -> bool {
        self.type_bits.contains(TypeBits::NOOP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_requires_both_flags() {
        let mut f = InternalFlags::NONE;
        assert!(!f.is_finished());
        f.insert(InternalFlags::WRITE_DONE);
        assert!(!f.is_finished());
        f.insert(InternalFlags::ACK_RECEIVED);
        assert!(f.is_finished());
    }

    #[test]
    fn ack_and_noop_reject_unknown_bits() {
        assert!(TypeBits::from_bits(0b1000).is_none());
        assert!(TypeBits::from_bits(0b0111).is_some());
    }

    #[test]
    fn free_data_clears_overflow_flags() {
        let mut m = Message::new(IpProtocol::V4, [0; 16], 1);
        m.set_data(&[1, 2, 3], &[4, 5, 6]);
        m.internal_flags.insert(InternalFlags::FREE_HEADER);
        m.free_data();
        assert!(m.header.is_empty());
        assert!(m.data.is_empty());
        assert!(!m.internal_flags.contains(InternalFlags::FREE_HEADER));
    }
}
