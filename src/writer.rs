//! Per-connection write-side decision logic: which message goes out
//! next, and how it gets framed for a single vectored write.
//!
//! This module only decides *what* to send — `cntl_msg_queue` before
//! `msg_queue`, at most one unacknowledged data message per remote in
//! synchronous mode, `serial` assigned at dequeue time (never at
//! enqueue, so a message requeued across a reconnect never carries a
//! stale serial). The actual bytes-on-the-wire step lives in
//! `connection::ConnectionIo`, which receives the selected `Message`
//! over a channel and performs the write.

use std::io::IoSlice;
use std::time::Duration;

use crate::message::{Message, TypeBits};
use crate::remote::Remote;
use crate::wire::{WireHeader, MESSAGE_HEADER_LEN};

/// Fraction of `REUSE_TIME` after which a NOOP probe is inserted ahead
/// of the next user data message, to beat the peer's GC sweep.
pub const NOOP_THRESHOLD: f64 = 0.75;

/// What the writer pulled off a remote's queues this tick.
pub enum Selected {
    /// An ACK or NOOP from `cntl_msg_queue`. No ACK is awaited for these.
    Control(Message),
    /// A data message just dequeued in synchronous mode: `REQ_ACK` is
    /// now set and `serial` assigned. The caller must stash this (once
    /// the write completes) into `Remote::wait_ack_message`.
    SyncData(Message),
    /// A data message dequeued in asynchronous mode: `serial` assigned,
    /// no ACK awaited — the caller simulates `ACK_RECEIVED` as soon as
    /// the write completes.
    AsyncData(Message),
}

/// Picks the next message to write for `remote`, per the queue
/// selection order in `spec.md` §4.4. Returns `None` if there is
/// nothing ready: the control queue and data queue are both empty, or
/// (synchronous mode) a message is already awaiting an ACK.
pub fn select_next(remote: &mut Remote, synchronous: bool) -> Option<Selected> {
    if let Some(cntl) = remote.cntl_msg_queue.pop_front() {
        return Some(Selected::Control(cntl));
    }
    if synchronous {
        if remote.wait_ack_message.is_some() {
            return None;
        }
        let mut msg = remote.msg_queue.pop_front()?;
        msg.serial = remote.next_serial();
        msg.type_bits |= TypeBits::REQ_ACK;
        Some(Selected::SyncData(msg))
    } else {
        let mut msg = remote.msg_queue.pop_front()?;
        msg.serial = remote.next_serial();
        Some(Selected::AsyncData(msg))
    }
}

/// Before enqueuing a user data message, checks whether `remote` is
/// close enough to its GC threshold to warrant a keep-alive probe
/// ahead of it. Allocates (once per remote) a NOOP template, and
/// enqueues it on `cntl_msg_queue` unless one is already queued or
/// in flight (`remote.noop` tracks the single lazily-allocated
/// instance; it is only re-enqueued once it isn't `USED`).
pub fn maybe_probe_noop(remote: &mut Remote, reuse_time: Duration) {
    use crate::message::{InternalFlags, IpProtocol};

    if !remote.is_idle_for(Duration::from_secs_f64(reuse_time.as_secs_f64() * NOOP_THRESHOLD)) {
        return;
    }

    let already_pending = remote
        .noop
        .as_ref()
        .map(|m| m.internal_flags.contains(InternalFlags::USED))
        .unwrap_or(false);
    if already_pending {
        return;
    }

    let mut noop = Message::new(IpProtocol::V4, remote.key.address, remote.key.port as i32);
    noop.type_bits = TypeBits::NOOP;
    noop.internal_flags.insert(InternalFlags::USED);

    let mut marker = Message::new(IpProtocol::V4, remote.key.address, remote.key.port as i32);
    marker.internal_flags.insert(InternalFlags::USED);
    remote.noop = Some(marker);

    remote.cntl_msg_queue.push_back(noop);
}

/// Clears the in-flight marker set by `maybe_probe_noop`, so the next
/// idle window can probe again. Called once the queued NOOP's write
/// completes.
pub fn clear_noop_pending(remote: &mut Remote) {
    remote.noop = None;
}

/// The three pieces of a message frame, ready for a single
/// `write_vectored` call: the 35-byte wire header, then the header
/// bytes, then the data bytes. Kept as owned buffers (rather than
/// borrowing from `msg`) so the caller can move `msg` elsewhere (e.g.
/// into `Remote::wait_ack_message`) while the write is still pending.
pub struct EncodedFrame {
    pub wire_header: [u8; MESSAGE_HEADER_LEN],
    pub header: smallvec::SmallVec<[u8; crate::message::INLINE_HEADER]>,
    pub data: smallvec::SmallVec<[u8; crate::message::INLINE_DATA]>,
}

impl EncodedFrame {
    pub fn encode(msg: &Message) -> Self {
        let wire = WireHeader {
            identity: msg.identity,
            serial: msg.serial,
            type_bits: msg.type_bits,
            header_len: msg.header.len() as u16,
            data_len: msg.data.len() as u32,
        };
        let mut wire_header = [0u8; MESSAGE_HEADER_LEN];
        wire.encode(&mut wire_header);
        EncodedFrame { wire_header, header: msg.header.clone(), data: msg.data.clone() }
    }

    /// The three `IoSlice`s for one `write_vectored` call: wire header
    /// prefix, header bytes, data bytes.
    pub fn as_io_slices(&self) -> [IoSlice<'_>; 3] {
        [IoSlice::new(&self.wire_header), IoSlice::new(&self.header), IoSlice::new(&self.data)]
    }

    pub fn total_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.header.len() + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IpProtocol;
    use crate::remote::{Remote, RemoteKey};
    use std::time::Duration;

    fn remote() -> Remote {
        Remote::new(RemoteKey::new(IpProtocol::V4, [0; 16], 1))
    }

    #[test]
    fn control_queue_wins_over_data_queue() {
        let mut r = remote();
        let mut ack = Message::new(IpProtocol::V4, [0; 16], 1);
        ack.type_bits = TypeBits::ACK;
        r.cntl_msg_queue.push_back(ack);
        r.msg_queue.push_back(Message::new(IpProtocol::V4, [0; 16], 1));

        match select_next(&mut r, true).unwrap() {
            Selected::Control(m) => assert!(m.type_bits.contains(TypeBits::ACK)),
            _ => panic!("expected control message to win"),
        }
    }

    #[test]
    fn synchronous_mode_blocks_on_outstanding_ack() {
        let mut r = remote();
        r.wait_ack_message = Some(Message::new(IpProtocol::V4, [0; 16], 1));
        r.msg_queue.push_back(Message::new(IpProtocol::V4, [0; 16], 1));
        assert!(select_next(&mut r, true).is_none());
    }

    #[test]
    fn synchronous_data_gets_req_ack_and_next_serial() {
        let mut r = remote();
        r.msg_queue.push_back(Message::new(IpProtocol::V4, [0; 16], 1));
        match select_next(&mut r, true).unwrap() {
            Selected::SyncData(m) => {
                assert!(m.type_bits.contains(TypeBits::REQ_ACK));
                assert_eq!(m.serial, 0);
            }
            _ => panic!("expected sync data"),
        }
        assert_eq!(r.serial, 1);
    }

    #[test]
    fn asynchronous_data_has_no_req_ack() {
        let mut r = remote();
        r.msg_queue.push_back(Message::new(IpProtocol::V4, [0; 16], 1));
        match select_next(&mut r, false).unwrap() {
            Selected::AsyncData(m) => assert!(!m.type_bits.contains(TypeBits::REQ_ACK)),
            _ => panic!("expected async data"),
        }
    }

    #[test]
    fn noop_probe_fires_past_threshold_and_not_before() {
        let mut r = remote();
        let reuse_time = Duration::from_secs(2);
        assert!(r.cntl_msg_queue.is_empty());
        maybe_probe_noop(&mut r, reuse_time);
        assert!(r.cntl_msg_queue.is_empty(), "fresh remote should not probe immediately");

        r.timestamp -= Duration::from_secs_f64(2.0 * 0.8);
        maybe_probe_noop(&mut r, reuse_time);
        assert_eq!(r.cntl_msg_queue.len(), 1);
        assert!(r.cntl_msg_queue[0].type_bits.contains(TypeBits::NOOP));

        // a second probe before the first NOOP's write completes must not
        // enqueue a duplicate
        maybe_probe_noop(&mut r, reuse_time);
        assert_eq!(r.cntl_msg_queue.len(), 1);

        clear_noop_pending(&mut r);
        maybe_probe_noop(&mut r, reuse_time);
        assert_eq!(r.cntl_msg_queue.len(), 2, "probing resumes once the pending marker is cleared");
    }

    #[test]
    fn encoded_frame_round_trips_through_wire_header() {
        let mut m = Message::new(IpProtocol::V4, [0; 16], 1);
        m.identity = crate::identity::Identity::from_bytes([7; 16]);
        m.serial = 9;
        m.set_data(&[1, 2, 3], b"hi");
        let frame = EncodedFrame::encode(&m);
        let decoded = WireHeader::decode(&frame.wire_header).unwrap();
        assert_eq!(decoded.serial, 9);
        assert_eq!(decoded.header_len, 3);
        assert_eq!(decoded.data_len, 2);
        assert_eq!(frame.total_len(), MESSAGE_HEADER_LEN + 3 + 2);
    }
}
