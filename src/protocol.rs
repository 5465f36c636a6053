//! The core orchestrator: binds the v4/v6 listeners, owns the
//! `Registry` and every connection (live, handshake-pending, or
//! displaced), and is the *only* task that ever touches a `Remote` or
//! the registry — satellite `ConnectionIo` tasks only ever see already
//! framed `Message`s and report parsed `ConnEvent`s back over one
//! shared channel (`SPEC_FULL.md` §2's "Concurrency realization").
//!
//! Reconnect debounce and GC both run off single-shot timers re-armed
//! after firing, selected alongside the event channel, the accept
//! listeners, and the thread-safe command queue in one `tokio::select!`
//! loop — the single cooperative, lock-free core `spec.md` §5 asks for.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures_timer::Delay;
use tokio::sync::mpsc;

use crate::channel::{TsChannel, TsCommand};
use crate::config::Config;
use crate::connection::{self, ConnCmd, ConnEvent, ConnFlags, ConnectionHandle, ConnectionIo, Side};
use crate::error::*;
use crate::identity::Identity;
use crate::message::{InternalFlags, IpProtocol, Message, TypeBits};
use crate::reader::Handshake;
use crate::registry::Registry;
use crate::remote::{ConnId, RemoteFlags, RemoteKey};
use crate::socket::Listener;
use crate::tls::TlsMaterial;
use crate::writer::{self, Selected};
use crate::{DoneCallback, LogCallback, LogLevel, RecvCallback, StartCallback};

/// Bound on the shared connection-event channel. Generous relative to
/// `MAX_SLOTS` so a burst of deliveries from many connections never
/// has to block a satellite task's read loop on the core task keeping
/// up.
const EVENT_CHAN_BOUND: usize = 1024;

/// The callback set a node is started with; any of these may be `None`.
pub struct Callbacks {
    pub recv: Option<RecvCallback>,
    pub start: Option<StartCallback>,
    pub done: Option<DoneCallback>,
    pub log: Option<LogCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks { recv: None, start: None, done: None, log: None }
    }
}

/// Address an accepted/connecting socket is keyed by, once a remote
/// exists for it.
fn key_of(proto: IpProtocol, addr: [u8; 16], port: u16) -> RemoteKey {
    RemoteKey::new(proto, addr, port)
}

fn ip_to_bytes(addr: IpAddr) -> ([u8; 16], IpProtocol) {
    match addr {
        IpAddr::V4(v4) => {
            let mut buf = [0u8; 16];
            buf[..4].copy_from_slice(&v4.octets());
            (buf, IpProtocol::V4)
        }
        IpAddr::V6(v6) => (v6.octets(), IpProtocol::V6),
    }
}

pub struct Protocol {
    config: Config,
    identity: Identity,
    registry: Registry,
    /// The connection arena: every connection this node currently
    /// tracks, whatever set it logically belongs to.
    connections: HashMap<ConnId, ConnectionHandle>,
    /// `connections` entries awaiting `ConnEvent::HandshakeDone` before
    /// they can be attached to a remote (`spec.md`'s `handshake_conns`).
    handshake_pending: HashSet<ConnId>,
    /// Displaced connections kept briefly for graceful shutdown
    /// (`spec.md`'s `old_connections`); GC'd once older than
    /// `REUSE_TIME`.
    old_connections: HashSet<ConnId>,
    /// Reverse index: which remote a (handshake-complete) connection
    /// belongs to, so a `ConnEvent` can be routed back to its `Remote`.
    conn_remote: HashMap<ConnId, RemoteKey>,
    /// Remotes with an outgoing connect already in flight, so a second
    /// `send` doesn't spawn a duplicate connect attempt.
    connecting: HashSet<RemoteKey>,
    /// Which remote a connect-in-progress `ConnId` belongs to, until
    /// its `ConnEvent::Connected` (or failure) arrives and it either
    /// graduates into `connections`/`conn_remote` or is dropped.
    pending_connects: HashMap<ConnId, RemoteKey>,
    next_conn_id: u64,
    events_tx: mpsc::Sender<(ConnId, ConnEvent)>,
    events_rx: mpsc::Receiver<(ConnId, ConnEvent)>,
    ts: TsChannel,
    tls: Option<TlsMaterial>,
    callbacks: Callbacks,
    closing: bool,
}

impl Protocol {
    /// Binds both listeners, then runs the core loop until a
    /// `close_ts` is observed and every connection has wound down.
    pub async fn run(config: Config, callbacks: Callbacks, ts: TsChannel) -> Result<()> {
        config.validate()?;
        let identity = if config.identity.is_zero() { Identity::generate()? } else { config.identity };
        let tls = if config.disable_encryption { None } else { Some(crate::tls::build(&config)?) };

        let v4_addr = SocketAddr::new(config.bind_v4.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), config.port);
        let v6_addr = SocketAddr::new(config.bind_v6.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)), config.port);
        let listener_v4 = crate::socket::bind(v4_addr, config.backlog)?;
        let listener_v6 = crate::socket::bind(v6_addr, config.backlog)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHAN_BOUND);

        let mut proto = Protocol {
            config,
            identity,
            registry: Registry::new(),
            connections: HashMap::new(),
            handshake_pending: HashSet::new(),
            old_connections: HashSet::new(),
            conn_remote: HashMap::new(),
            connecting: HashSet::new(),
            pending_connects: HashMap::new(),
            next_conn_id: 0,
            events_tx,
            events_rx,
            ts,
            tls,
            callbacks,
            closing: false,
        };

        if let Some(start) = proto.callbacks.start.take() {
            start(crate::ChirpHandle::new(proto.ts.clone()));
        }

        proto.main_loop(listener_v4, listener_v6).await;

        if let Some(done) = proto.callbacks.done.take() {
            done();
        }
        Ok(())
    }

    fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Trace => log::trace!("{}", msg),
            LogLevel::Debug => log::debug!("{}", msg),
            LogLevel::Info => log::info!("{}", msg),
            LogLevel::Warn => log::warn!("{}", msg),
            LogLevel::Error => log::error!("{}", msg),
        }
        if let Some(cb) = &self.callbacks.log {
            cb(level, msg);
        }
    }

    async fn wait_optional(timer: &mut Option<Delay>) {
        match timer {
            Some(t) => t.await,
            None => std::future::pending::<()>().await,
        }
    }

    fn gc_interval(reuse_time: Duration) -> Delay {
        use rand_core::RngCore;
        let half = reuse_time.as_secs_f64() / 2.0;
        let jitter = (rand_core::OsRng.next_u64() % ((half * 1000.0) as u64).max(1)) as f64 / 1000.0;
        Delay::new(Duration::from_secs_f64(half + jitter))
    }

    async fn main_loop(&mut self, listener_v4: Listener, listener_v6: Listener) {
        let mut gc_timer = Self::gc_interval(self.config.reuse_time);
        let mut reconnect_timer: Option<Delay> = None;

        loop {
            if self.closing && self.connections.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                cmds = self.ts.recv_all() => {
                    for cmd in cmds {
                        self.handle_ts_command(cmd);
                    }
                }

                accepted = listener_v4.accept() => {
                    if let Ok((sock, peer)) = accepted {
                        self.handle_accept(sock, peer);
                    }
                }

                accepted = listener_v6.accept() => {
                    if let Ok((sock, peer)) = accepted {
                        self.handle_accept(sock, peer);
                    }
                }

                event = self.events_rx.recv() => {
                    if let Some((id, ev)) = event {
                        self.handle_conn_event(id, ev);
                    }
                }

                _ = &mut gc_timer => {
                    self.handle_gc_tick();
                    gc_timer = Self::gc_interval(self.config.reuse_time);
                }

                _ = Self::wait_optional(&mut reconnect_timer), if reconnect_timer.is_some() => {
                    reconnect_timer = None;
                    self.handle_reconnect_tick();
                }
            }

            let any_blocked =
                self.registry.iter().any(|(_, r)| r.flags.contains(RemoteFlags::CONN_BLOCKED));
            if any_blocked && reconnect_timer.is_none() {
                reconnect_timer =
                    Some(Delay::new(Self::debounce_duration()));
            }
        }
    }

    fn debounce_duration() -> Duration {
        use rand_core::RngCore;
        let jitter = rand_core::OsRng.next_u64() % 500;
        Duration::from_millis(50 + jitter)
    }

    // -- thread-safe command handling -----------------------------------

    fn handle_ts_command(&mut self, cmd: TsCommand) {
        match cmd {
            TsCommand::Send(msg) => self.send(msg),
            TsCommand::ReleaseSlot(msg) => self.release_msg_slot(msg),
            TsCommand::Close => self.begin_close(),
        }
    }

    /// Enqueues `msg` for its destination remote, creating the remote
    /// and kicking off a connect attempt if necessary.
    pub fn send(&mut self, mut msg: Message) {
        if self.closing {
            Self::call_send_cb(&mut msg, ErrorKind::Shutdown);
            return;
        }
        // The wire-visible identity is always this node's own stable
        // identity, never a user-supplied value: it is what the peer
        // echoes back in its ACK, and what `on_ack` matches against
        // `wait_ack_message` (spec.md §3/§4.3 "match identity against
        // remote.wait_ack_message").
        msg.identity = self.identity;
        let port = msg.port as u16;
        let key = key_of(msg.ip_protocol, msg.address, port);
        writer::maybe_probe_noop(self.registry.get_or_insert(key), self.config.reuse_time);

        let remote = self.registry.get_or_insert(key);
        remote.msg_queue.push_back(msg);

        if remote.conn.is_none() && !self.connecting.contains(&key) && !remote.flags.contains(RemoteFlags::CONN_BLOCKED) {
            self.begin_connect(key);
        } else {
            self.try_flush_remote(key);
        }
    }

    pub fn release_msg_slot(&mut self, mut msg: Message) {
        let had_ack = msg.internal_flags.contains(InternalFlags::SEND_ACK);
        let identity = msg.identity;
        let (addr, port) = msg.address();
        let proto = msg.ip_protocol;
        // the pool's own restart signal already wakes the satellite
        // task's stalled read loop; the core task has no further use
        // for the return value here.
        let _ = crate::buffer_pool::release_message_slot(&mut msg);

        if let Some(cb) = msg.release_callback.take() {
            cb(ErrorKind::Success);
        }

        if had_ack {
            let key = key_of(proto, addr, port as u16);
            if self.registry.contains(&key) {
                let mut ack = Message::new(proto, addr, port);
                ack.type_bits = TypeBits::ACK;
                ack.identity = identity;
                self.registry.get_or_insert(key).cntl_msg_queue.push_back(ack);
                self.try_flush_remote(key);
            }
        }
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.log(LogLevel::Info, "chirp closing: tearing down all remotes and connections");

        let keys = self.registry.keys();
        for key in keys {
            if let Some(mut remote) = self.registry.remove(&key) {
                Self::abort_all(&mut remote, ErrorKind::Shutdown);
            }
        }
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.shutdown_connection(id, ErrorKind::Shutdown);
        }
    }

    // -- accept / connect -------------------------------------------------

    fn handle_accept(&mut self, sock: crate::socket::Socket, peer: SocketAddr) {
        if self.closing {
            return;
        }
        let id = self.next_id();
        let my_handshake = Handshake { port: self.config.port, identity: self.identity };
        let tls_for_conn = if self.tls.is_some() && !peer.ip().is_loopback() { self.tls.clone() } else { None };
        let cmd_tx = ConnectionIo::spawn(
            id,
            sock,
            Side::Incoming,
            &self.config,
            tls_for_conn.clone(),
            my_handshake,
            self.events_tx.clone(),
        );
        let (addr, proto) = ip_to_bytes(peer.ip());
        let mut flags = ConnFlags::NONE;
        flags.insert(ConnFlags::INCOMING);
        if tls_for_conn.is_some() {
            flags.insert(ConnFlags::ENCRYPTED);
        }
        self.connections.insert(
            id,
            ConnectionHandle {
                id,
                proto,
                address: addr,
                port: peer.port() as i32,
                remote_identity: Identity::ZERO,
                flags,
                timestamp: std::time::Instant::now(),
                cmd_tx,
                write_in_flight: false,
            },
        );
        self.handshake_pending.insert(id);
    }

    /// Kicks off an outgoing connect for `key`. Only the raw TCP
    /// connect runs in the spawned task; the result comes back as a
    /// `ConnEvent::Connected`/`ConnEvent::ShutDown` over the normal
    /// shared channel, tagged with `id`, so `self.connections` only
    /// ever gains an entry once there's a real socket and a real
    /// `cmd_tx` to put in it (no placeholder channel to forget to
    /// replace).
    fn begin_connect(&mut self, key: RemoteKey) {
        self.connecting.insert(key);
        let id = self.next_id();
        self.pending_connects.insert(id, key);

        let timeout = self.config.timeout;
        let addr = addr_from_key(&key);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            match connection::connect_with_timeout(addr, timeout).await {
                Ok(socket) => {
                    let side = Side::Outgoing { hostname: addr.ip().to_string() };
                    let _ = events_tx.send((id, ConnEvent::Connected(socket, side))).await;
                }
                Err(e) => {
                    let _ = events_tx.send((id, ConnEvent::ShutDown(e.kind()))).await;
                }
            }
        });
    }

    /// The connect attempt for `id` succeeded: spawns the real
    /// satellite task (synchronously, so its `HandshakeDone` can only
    /// be observed after the handle below is in `self.connections`)
    /// and records it.
    fn on_connected(&mut self, id: ConnId, socket: crate::socket::Socket, side: Side) {
        let key = match self.pending_connects.remove(&id) {
            Some(key) => key,
            None => return,
        };
        if self.closing {
            return;
        }

        let my_handshake = Handshake { port: self.config.port, identity: self.identity };
        let addr = addr_from_key(&key);
        let tls = if self.tls.is_some() && !addr.ip().is_loopback() { self.tls.clone() } else { None };
        let encrypted = tls.is_some();

        let cmd_tx =
            ConnectionIo::spawn(id, socket, side, &self.config, tls, my_handshake, self.events_tx.clone());

        let mut flags = ConnFlags::NONE;
        if encrypted {
            flags.insert(ConnFlags::ENCRYPTED);
        }
        self.connections.insert(
            id,
            ConnectionHandle {
                id,
                proto: key.ip_protocol,
                address: key.address,
                port: key.port as i32,
                remote_identity: Identity::ZERO,
                flags,
                timestamp: std::time::Instant::now(),
                cmd_tx,
                write_in_flight: false,
            },
        );
        self.handshake_pending.insert(id);
    }

    // -- connection events -------------------------------------------------

    fn handle_conn_event(&mut self, id: ConnId, ev: ConnEvent) {
        match ev {
            ConnEvent::Connected(socket, side) => self.on_connected(id, socket, side),
            ConnEvent::HandshakeDone { port, identity } => self.on_handshake_done(id, port, identity),
            ConnEvent::Delivered(msg) => self.on_delivered(id, msg),
            ConnEvent::Ack { identity } => self.on_ack(id, identity),
            ConnEvent::Noop => self.on_noop(id),
            ConnEvent::WriteComplete(msg) => self.on_write_complete(id, msg),
            ConnEvent::WriteFailed(msg, kind) => self.on_write_failed(id, msg, kind),
            ConnEvent::ShutDown(kind) => self.on_connection_down(id, kind),
        }
    }

    fn on_handshake_done(&mut self, id: ConnId, port: u16, identity: Identity) {
        let handle = match self.connections.get_mut(&id) {
            Some(h) => h,
            None => return,
        };
        if !self.handshake_pending.remove(&id) {
            return;
        }
        handle.remote_identity = identity;
        handle.flags.insert(ConnFlags::CONNECTED);
        handle.touch();

        let key = if handle.flags.contains(ConnFlags::INCOMING) {
            // The peer's public listen port, announced in its
            // handshake, not the ephemeral source port of the accepted
            // socket -- a reply must reach the peer's listener, not
            // the transient client-side port it connected from.
            handle.port = port as i32;
            key_of(handle.proto, handle.address, port)
        } else {
            key_of(handle.proto, handle.address, handle.port as u16)
        };
        self.connecting.remove(&key);
        self.attach_connection(key, id);
        self.conn_remote.insert(id, key);
        self.try_flush_remote(key);
    }

    /// Attaches connection `id` to the remote keyed by `key`, moving
    /// any previously-attached connection to `old_connections` (race
    /// resolution: the newer completion wins).
    fn attach_connection(&mut self, key: RemoteKey, id: ConnId) {
        let remote = self.registry.get_or_insert(key);
        remote.touch();
        if let Some(old_id) = remote.conn.replace(id) {
            if old_id != id {
                self.old_connections.insert(old_id);
                self.conn_remote.remove(&old_id);
                if let Some(h) = self.connections.get_mut(&old_id) {
                    h.flags.insert(ConnFlags::SHUTTING_DOWN);
                }
            }
        }
    }

    fn on_delivered(&mut self, id: ConnId, mut msg: Message) {
        let key = match self.conn_remote.get(&id) {
            Some(k) => *k,
            None => return,
        };
        if let Some(remote) = self.registry.get_mut(&key) {
            remote.touch();
        }
        // A receiver fills remote_identity and the source address/port
        // (spec.md §3); both are only known to the connection, not the
        // bare wire header the reader decoded.
        if let Some(h) = self.connections.get_mut(&id) {
            h.touch();
            msg.remote_identity = h.remote_identity;
            msg.ip_protocol = h.proto;
            msg.address = h.address;
            msg.port = h.port;
        }
        match self.callbacks.recv.as_mut() {
            Some(recv) => recv(msg),
            None => {
                let mut msg = msg;
                self.release_msg_slot_inline(&mut msg);
            }
        }
    }

    fn release_msg_slot_inline(&mut self, msg: &mut Message) {
        let had_ack = msg.internal_flags.contains(InternalFlags::SEND_ACK);
        let identity = msg.identity;
        let (addr, port) = msg.address();
        let proto = msg.ip_protocol;
        crate::buffer_pool::release_message_slot(msg);
        if had_ack {
            let key = key_of(proto, addr, port as u16);
            if self.registry.contains(&key) {
                let mut ack = Message::new(proto, addr, port);
                ack.type_bits = TypeBits::ACK;
                ack.identity = identity;
                self.registry.get_or_insert(key).cntl_msg_queue.push_back(ack);
                self.try_flush_remote(key);
            }
        }
    }

    fn on_ack(&mut self, id: ConnId, identity: Identity) {
        let key = match self.conn_remote.get(&id) {
            Some(k) => *k,
            None => return,
        };
        let remote = match self.registry.get_mut(&key) {
            Some(r) => r,
            None => return,
        };
        remote.touch();
        let matches = remote.wait_ack_message.as_ref().map(|m| m.identity == identity).unwrap_or(false);
        if matches {
            if let Some(mut msg) = remote.wait_ack_message.take() {
                msg.internal_flags.insert(InternalFlags::ACK_RECEIVED);
                if msg.internal_flags.is_finished() {
                    Self::call_send_cb(&mut msg, ErrorKind::Success);
                } else {
                    remote.wait_ack_message = Some(msg);
                }
            }
        }
        self.try_flush_remote(key);
    }

    fn on_noop(&mut self, id: ConnId) {
        if let Some(key) = self.conn_remote.get(&id).copied() {
            if let Some(remote) = self.registry.get_mut(&key) {
                remote.touch();
            }
        }
        if let Some(h) = self.connections.get_mut(&id) {
            h.touch();
        }
    }

    fn on_write_complete(&mut self, id: ConnId, mut msg: Message) {
        if let Some(h) = self.connections.get_mut(&id) {
            h.write_in_flight = false;
            h.touch();
        }
        let key = match self.conn_remote.get(&id) {
            Some(k) => *k,
            None => return,
        };

        msg.internal_flags.insert(InternalFlags::WRITE_DONE);

        if msg.is_noop() {
            if let Some(remote) = self.registry.get_mut(&key) {
                writer::clear_noop_pending(remote);
            }
        } else if msg.is_ack() {
            // no ack is awaited for control messages; nothing further to do
        } else if msg.requires_ack() {
            // synchronous: stash as the outstanding message, waiting for
            // the peer's ACK to mark ACK_RECEIVED
            if let Some(remote) = self.registry.get_mut(&key) {
                remote.wait_ack_message = Some(msg);
            }
        } else {
            // asynchronous data message: simulate ACK_RECEIVED immediately
            msg.internal_flags.insert(InternalFlags::ACK_RECEIVED);
            Self::call_send_cb(&mut msg, ErrorKind::Success);
        }

        self.try_flush_remote(key);
    }

    fn on_write_failed(&mut self, id: ConnId, mut msg: Message, kind: ErrorKind) {
        if let Some(h) = self.connections.get_mut(&id) {
            h.write_in_flight = false;
        }
        Self::call_send_cb(&mut msg, kind);
        // the satellite task also reports ConnEvent::ShutDown right
        // after this, which drives reconnect-debounce and abort of the
        // rest of the remote's queues.
    }

    fn on_connection_down(&mut self, id: ConnId, kind: ErrorKind) {
        self.handshake_pending.remove(&id);
        self.old_connections.remove(&id);
        self.connections.remove(&id);
        // a connection can die either after it reached a remote
        // (`conn_remote`) or while its connect attempt was still
        // outstanding (`pending_connects`) -- never both
        let key = self.conn_remote.remove(&id).or_else(|| self.pending_connects.remove(&id));

        if let Some(key) = key {
            self.connecting.remove(&key);
            if let Some(remote) = self.registry.get_mut(&key) {
                if remote.conn == Some(id) {
                    remote.conn = None;
                }
                Self::finish_or_abort_one(remote, kind);
                if kind != ErrorKind::Shutdown && !self.closing {
                    remote.flags.insert(RemoteFlags::CONN_BLOCKED);
                    self.registry_block(key);
                }
            }
        }
    }

    fn registry_block(&mut self, key: RemoteKey) {
        self.registry.block_for_reconnect(key);
    }

    /// Shutdown ordering from `spec.md` §4.8: finish `wait_ack_message`
    /// if any, then abort exactly one further queued message (cntl
    /// queue before data queue); the rest stay queued for the next
    /// (re)connect attempt.
    fn finish_or_abort_one(remote: &mut crate::remote::Remote, kind: ErrorKind) {
        if let Some(mut msg) = remote.wait_ack_message.take() {
            Self::call_send_cb(&mut msg, kind);
        }
        if let Some(mut msg) = remote.cntl_msg_queue.pop_front() {
            Self::call_send_cb(&mut msg, kind);
        } else if let Some(mut msg) = remote.msg_queue.pop_front() {
            Self::call_send_cb(&mut msg, kind);
        }
    }

    fn abort_all(remote: &mut crate::remote::Remote, kind: ErrorKind) {
        if let Some(mut msg) = remote.wait_ack_message.take() {
            Self::call_send_cb(&mut msg, kind);
        }
        while let Some(mut msg) = remote.cntl_msg_queue.pop_front() {
            Self::call_send_cb(&mut msg, kind);
        }
        while let Some(mut msg) = remote.msg_queue.pop_front() {
            Self::call_send_cb(&mut msg, kind);
        }
    }

    fn call_send_cb(msg: &mut Message, kind: ErrorKind) {
        if let Some(cb) = msg.send_callback.take() {
            cb(kind);
        }
    }

    /// Picks the next message to write for `key`'s remote (if its
    /// connection is attached and idle) and submits it.
    fn try_flush_remote(&mut self, key: RemoteKey) {
        let conn_id = match self.registry.get(&key).and_then(|r| r.conn) {
            Some(id) => id,
            None => return,
        };
        let busy = self.connections.get(&conn_id).map(|h| h.write_in_flight).unwrap_or(true);
        if busy {
            return;
        }
        let selected = match self.registry.get_mut(&key) {
            Some(remote) => writer::select_next(remote, self.config.synchronous),
            None => return,
        };
        let msg = match selected {
            Some(Selected::Control(m)) => m,
            Some(Selected::SyncData(m)) => m,
            Some(Selected::AsyncData(m)) => m,
            None => return,
        };
        if let Some(handle) = self.connections.get_mut(&conn_id) {
            handle.write_in_flight = true;
            let _ = handle.cmd_tx.try_send(ConnCmd::Write(msg));
        }
    }

    fn shutdown_connection(&mut self, id: ConnId, kind: ErrorKind) {
        self.handshake_pending.remove(&id);
        self.old_connections.remove(&id);
        if let Some(handle) = self.connections.remove(&id) {
            let _ = handle.cmd_tx.try_send(ConnCmd::Shutdown);
        }
        if let Some(key) = self.conn_remote.remove(&id) {
            if let Some(remote) = self.registry.get_mut(&key) {
                if remote.conn == Some(id) {
                    remote.conn = None;
                }
                Self::abort_all(remote, kind);
            }
        }
    }

    // -- periodic maintenance ----------------------------------------------

    fn handle_reconnect_tick(&mut self) {
        let keys = self.registry.drain_reconnect_remotes();
        for key in keys {
            self.try_flush_remote(key);
            if self.registry.get(&key).map(|r| !r.msg_queue.is_empty() || !r.cntl_msg_queue.is_empty()).unwrap_or(false)
                && self.registry.get(&key).map(|r| r.conn.is_none()).unwrap_or(false)
                && !self.connecting.contains(&key)
            {
                self.begin_connect(key);
            }
        }
    }

    fn handle_gc_tick(&mut self) {
        let reuse_time = self.config.reuse_time;

        let stale_old: Vec<ConnId> = self
            .old_connections
            .iter()
            .copied()
            .filter(|id| self.connections.get(id).map(|h| h.is_older_than(reuse_time)).unwrap_or(true))
            .collect();
        for id in stale_old {
            self.shutdown_connection(id, ErrorKind::Shutdown);
        }

        let idle_keys: Vec<RemoteKey> = self
            .registry
            .iter()
            .filter(|(_, r)| !r.flags.contains(RemoteFlags::CONN_BLOCKED) && r.is_idle_for(reuse_time))
            .map(|(k, _)| *k)
            .collect();
        for key in idle_keys {
            if let Some(mut remote) = self.registry.remove(&key) {
                Self::abort_all(&mut remote, ErrorKind::Shutdown);
                if let Some(id) = remote.conn {
                    self.shutdown_connection(id, ErrorKind::Shutdown);
                }
            }
        }
    }
}

fn addr_from_key(key: &RemoteKey) -> SocketAddr {
    match key.ip_protocol {
        IpProtocol::V4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&key.address[..4]);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), key.port)
        }
        IpProtocol::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(key.address)), key.port),
    }
}
