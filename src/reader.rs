//! Per-connection read state machine.
//!
//! `HANDSHAKE → WAIT → SLOT → HEADER → DATA → deliver → WAIT`. Driven by
//! `tokio::io::AsyncReadExt::read_exact`, which already resumes across
//! partial reads on its own, so this module only has to encode *which*
//! fixed-or-length-prefixed read comes next — not a manual byte-resume
//! buffer. Because nothing is read past a message's 35-byte header
//! until a slot has actually been acquired, replaying any
//! partially-buffered bytes after a pool-exhaustion stall is automatic:
//! the underlying stream was simply never asked to produce those bytes
//! yet.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::*;
use crate::identity::Identity;
use crate::message::{InternalFlags, Message, TypeBits};
use crate::wire::{WireHeader, HANDSHAKE_LEN, MESSAGE_HEADER_LEN};

pub use crate::wire::Handshake;

/// Which step of the read state machine the reader is currently in.
/// Exposed mainly so connection-lifecycle logging and tests can
/// observe progress; the actual suspension points are plain `.await`s
/// inside `Reader::read_handshake`/`read_message`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReaderState {
    Handshake,
    Wait,
    Slot,
    Header,
    Data,
}

/// Outcome of parsing one frame off the wire.
pub enum ReaderEvent {
    /// A data message was fully parsed and (if it held a slot) delivered.
    Delivered(Message),
    /// An ACK was observed; the caller matches it against
    /// `Remote::wait_ack_message` by identity.
    Ack { identity: Identity },
    /// A keep-alive probe; the caller should only refresh the remote's
    /// timestamp.
    Noop,
}

pub struct Reader {
    pub state: ReaderState,
    max_msg_size: u32,
}

impl Reader {
    pub fn new(config: &Config) -> Self {
        Reader { state: ReaderState::Handshake, max_msg_size: config.max_msg_size }
    }

    /// Reads exactly `HANDSHAKE_LEN` bytes and decodes the handshake.
    ///
    /// A short read here (the peer closed before sending a full
    /// handshake) is a protocol violation; `read_exact` surfaces that
    /// as an `UnexpectedEof` I/O error, which we map to
    /// `ErrorKind::ProtocolError`.
    pub async fn read_handshake<S>(&mut self, stream: &mut S) -> Result<Handshake>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        self.state = ReaderState::Handshake;
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .wrapped(ErrorKind::ProtocolError)?;
        self.state = ReaderState::Wait;
        Ok(Handshake::decode(&buf))
    }

    /// Reads and parses one full message frame, acquiring a pool slot
    /// and blocking (via `slots_available`) when the pool is exhausted.
    pub async fn read_message<S>(
        &mut self,
        stream: &mut S,
        pool: &BufferPool,
        slots_available: &Arc<Notify>,
    ) -> Result<ReaderEvent>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        self.state = ReaderState::Wait;
        let mut hdr_buf = [0u8; MESSAGE_HEADER_LEN];
        stream
            .read_exact(&mut hdr_buf)
            .await
            .wrapped(ErrorKind::ProtocolError)?;
        let wire = WireHeader::decode(&hdr_buf)?;
        self.verify_framing(&wire)?;

        if wire.type_bits.contains(TypeBits::NOOP) {
            return Ok(ReaderEvent::Noop);
        }
        if wire.type_bits.contains(TypeBits::ACK) {
            return Ok(ReaderEvent::Ack { identity: wire.identity });
        }

        self.state = ReaderState::Slot;
        let mut msg = loop {
            match pool.acquire() {
                Some(msg) => break msg,
                None => slots_available.notified().await,
            }
        };

        msg.identity = wire.identity;
        msg.serial = wire.serial;
        msg.type_bits = wire.type_bits;

        if wire.header_len > 0 {
            self.state = ReaderState::Header;
            msg.header.resize(wire.header_len as usize, 0);
            if msg.header.spilled() {
                msg.internal_flags.insert(InternalFlags::FREE_HEADER);
            }
            stream
                .read_exact(&mut msg.header[..])
                .await
                .wrapped(ErrorKind::ProtocolError)?;
        }

        if wire.data_len > 0 {
            self.state = ReaderState::Data;
            msg.data.resize(wire.data_len as usize, 0);
            if msg.data.spilled() {
                msg.internal_flags.insert(InternalFlags::FREE_DATA);
            }
            stream
                .read_exact(&mut msg.data[..])
                .await
                .wrapped(ErrorKind::ProtocolError)?;
        }

        if msg.requires_ack() {
            msg.internal_flags.insert(InternalFlags::SEND_ACK);
        }

        self.state = ReaderState::Wait;
        Ok(ReaderEvent::Delivered(msg))
    }

    /// Rejects oversize messages, and ACK/NOOP frames that carry a
    /// header, data, or `REQ_ACK` — they must be bodiless and never
    /// request an ack.
    fn verify_framing(&self, wire: &WireHeader) -> Result<()> {
        let total = wire.header_len as u64 + wire.data_len as u64;
        if total > self.max_msg_size as u64 {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("message of {} bytes exceeds MAX_MSG_SIZE", total),
            ));
        }
        let is_control = wire.type_bits.contains(TypeBits::ACK) || wire.type_bits.contains(TypeBits::NOOP);
        if is_control
            && (wire.header_len > 0 || wire.data_len > 0 || wire.type_bits.contains(TypeBits::REQ_ACK))
        {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                "ACK/NOOP must not carry a header, data, or REQ_ACK",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IpProtocol;
    use std::io::Cursor;

    fn test_config() -> Config {
        Config { disable_encryption: true, ..Config::default() }
    }

    #[tokio::test]
    async fn handshake_shorter_than_18_bytes_is_a_protocol_error() {
        let mut reader = Reader::new(&test_config());
        let mut stream = Cursor::new(vec![1u8; 5]);
        let err = reader.read_handshake(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn handshake_round_trips_over_a_stream() {
        let mut reader = Reader::new(&test_config());
        let hs = Handshake { port: 4242, identity: Identity::from_bytes([3; 16]) };
        let mut wire_bytes = [0u8; HANDSHAKE_LEN];
        hs.encode(&mut wire_bytes);
        let mut stream = Cursor::new(wire_bytes.to_vec());
        let decoded = reader.read_handshake(&mut stream).await.unwrap();
        assert_eq!(decoded, hs);
    }

    #[tokio::test]
    async fn oversize_message_is_rejected_before_allocating_body() {
        let mut reader = Reader::new(&Config { max_msg_size: 10, disable_encryption: true, ..Config::default() });
        let wire = WireHeader {
            identity: Identity::from_bytes([1; 16]),
            serial: 0,
            type_bits: TypeBits::NONE,
            header_len: 6,
            data_len: 6,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        wire.encode(&mut buf);
        let mut stream = Cursor::new(buf.to_vec());
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify.clone());
        let err = reader.read_message(&mut stream, &pool, &notify).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn ack_with_header_is_rejected() {
        let mut reader = Reader::new(&test_config());
        let wire = WireHeader {
            identity: Identity::from_bytes([1; 16]),
            serial: 0,
            type_bits: TypeBits::ACK,
            header_len: 1,
            data_len: 0,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        wire.encode(&mut buf);
        let mut stream = Cursor::new(buf.to_vec());
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify.clone());
        let err = reader.read_message(&mut stream, &pool, &notify).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn full_message_delivers_with_slot_flags_set() {
        let mut reader = Reader::new(&test_config());
        let wire = WireHeader {
            identity: Identity::from_bytes([5; 16]),
            serial: 42,
            type_bits: TypeBits::REQ_ACK,
            header_len: 3,
            data_len: 5,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        wire.encode(&mut buf);
        let mut bytes = buf.to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(b"hello");
        let mut stream = Cursor::new(bytes);
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify.clone());

        match reader.read_message(&mut stream, &pool, &notify).await.unwrap() {
            ReaderEvent::Delivered(msg) => {
                assert_eq!(&msg.header[..], &[1, 2, 3]);
                assert_eq!(&msg.data[..], b"hello");
                assert!(msg.has_slot());
                assert!(msg.internal_flags.contains(InternalFlags::SEND_ACK));
            }
            _ => panic!("expected a delivered data message"),
        }
        let _ = IpProtocol::V4;
    }

    #[tokio::test]
    async fn noop_and_ack_are_reported_distinctly() {
        let mut reader = Reader::new(&test_config());
        let noop = WireHeader {
            identity: Identity::from_bytes([1; 16]),
            serial: 0,
            type_bits: TypeBits::NOOP,
            header_len: 0,
            data_len: 0,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        noop.encode(&mut buf);
        let mut stream = Cursor::new(buf.to_vec());
        let notify = Arc::new(Notify::new());
        let pool = BufferPool::new(1, notify.clone());
        assert!(matches!(
            reader.read_message(&mut stream, &pool, &notify).await.unwrap(),
            ReaderEvent::Noop
        ));
    }
}
