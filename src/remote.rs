//! A `Remote`: the logical peer endpoint identified by
//! `(ip_protocol, address, port)`, owning its queues, serial counter,
//! and a non-owning handle to its current connection.

use std::collections::VecDeque;
use std::time::Instant;

use crate::message::{IpProtocol, Message};

/// Opaque handle into the protocol's connection arena. `Remote` never
/// owns a `Connection` directly — ownership lives in the arena, broken
/// this way specifically to avoid a connection/remote reference cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnId(pub(crate) u64);

/// Registry lookup key: `(ip_protocol, address, port)`. Built with an
/// explicit "is this just a lookup" distinction at the call site
/// (`Registry::get` vs `Registry::get_or_insert`) rather than as a
/// flag on the key itself — the more idiomatic Rust shape for "same
/// key, different entry points".
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RemoteKey {
    pub ip_protocol: IpProtocol,
    pub address: [u8; 16],
    pub port: u16,
}

impl RemoteKey {
    pub fn new(ip_protocol: IpProtocol, address: [u8; 16], port: u16) -> Self {
        RemoteKey { ip_protocol, address, port }
    }
}

/// Flags describing a `Remote`'s current condition.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RemoteFlags(u8);

impl RemoteFlags {
    pub const NONE: RemoteFlags = RemoteFlags(0);
    /// A connect attempt to this remote recently failed; it is debounced
    /// on the protocol's `reconnect_remotes` list and must not be
    /// reconnected to until the debounce timer fires.
    pub const CONN_BLOCKED: RemoteFlags = RemoteFlags(1 << 0);

    pub fn contains(self, other: RemoteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RemoteFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RemoteFlags) {
        self.0 &= !other.0;
    }
}

/// A peer endpoint: its queues, serial counter, and a non-owning handle
/// to whichever connection is currently attached.
pub struct Remote {
    pub key: RemoteKey,
    /// Per-remote monotonic counter; assigned to a message's wire
    /// `serial` field at dequeue time, never at enqueue.
    pub serial: u32,
    pub conn: Option<ConnId>,
    /// FIFO of outbound user data messages awaiting a connection.
    pub msg_queue: VecDeque<Message>,
    /// FIFO of ACKs/NOOPs to send ahead of `msg_queue` on the next
    /// write-ready tick.
    pub cntl_msg_queue: VecDeque<Message>,
    /// The one data message currently awaiting an ACK, in synchronous
    /// mode. While this is `Some`, nothing else is dequeued from
    /// `msg_queue` for this remote.
    pub wait_ack_message: Option<Message>,
    /// Lazily-allocated, single-instance NOOP keep-alive template,
    /// re-enqueued only when not already in flight.
    pub noop: Option<Message>,
    /// Last time any traffic (data, ACK, or NOOP) was seen to/from this
    /// remote; drives the GC and NOOP-probe thresholds.
    pub timestamp: Instant,
    pub flags: RemoteFlags,
}

impl Remote {
    pub fn new(key: RemoteKey) -> Self {
        Remote {
            key,
            serial: 0,
            conn: None,
            msg_queue: VecDeque::new(),
            cntl_msg_queue: VecDeque::new(),
            wait_ack_message: None,
            noop: None,
            timestamp: Instant::now(),
            flags: RemoteFlags::NONE,
        }
    }

    /// Assigns and advances this remote's serial counter, for use by the
    /// writer at dequeue time.
    pub fn next_serial(&mut self) -> u32 {
        let serial = self.serial;
        self.serial = self.serial.wrapping_add(1);
        serial
    }

    pub fn touch(&mut self) {
        self.timestamp = Instant::now();
    }

    pub fn is_idle_for(&self, dur: std::time::Duration) -> bool {
        self.timestamp.elapsed() >= dur
    }

    /// True while synchronous-mode back-pressure forbids dequeuing
    /// further data messages for this remote.
    pub fn is_waiting_for_ack(&self) -> bool {
        self.wait_ack_message.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_increases_monotonically() {
        let mut r = Remote::new(RemoteKey::new(IpProtocol::V4, [0; 16], 1));
        assert_eq!(r.next_serial(), 0);
        assert_eq!(r.next_serial(), 1);
        assert_eq!(r.next_serial(), 2);
    }

    #[test]
    fn remote_key_equality_is_field_wise() {
        let a = RemoteKey::new(IpProtocol::V4, [1; 16], 10);
        let b = RemoteKey::new(IpProtocol::V4, [1; 16], 10);
        let c = RemoteKey::new(IpProtocol::V6, [1; 16], 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
