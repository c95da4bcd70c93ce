// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection context: a uniform wrapper over TCP and SCTP sockets,
//! optionally protected by TLS.
//!
//! Lifetime of a connection:
//!
//! 1. creation — accepted by the [`crate::server`] acceptor, or connected
//!    with [`Connection::connect_tcp`] / [`Connection::connect_sctp`];
//! 2. initialization — [`Connection::start_clear`] to receive cleartext,
//!    or [`Connection::handshake`] to protect it first;
//! 3. use — [`Connection::send`], [`Connection::receive`], or
//!    [`Connection::set_alt_fifo`] to route events at the peer's queue;
//! 4. end — [`Connection::destroy`], which closes the TLS sessions, shuts
//!    the socket down, and joins every thread the connection started.

use crate::{
    sctp::{Record, SctpSocket},
    sctps,
    sock::{is_timeout, set_socket_timeouts, IoPolicy},
    tcp,
    tls::{PlainReader, RecordPush, TlsChannel, TlsCreds, TlsError, TlsMode},
};
use diameter_core::{
    fifo::{Fifo, GetError},
    message, Config, EndpointSet, EpFlags, Event,
};
use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use std::{
    fmt,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Sctp => f.write_str("SCTP"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CnxError {
    #[error("malformed frame (version {version}, length {length})")]
    MalformedFrame { version: u8, length: u32 },
    #[error("connection closed by peer")]
    Closed,
    #[error("operation invalid in the connection's current state")]
    InvalidState,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("receive timed out")]
    Timeout,
    #[error("connection error reported by the receiver")]
    NotConnected,
    #[error("connection queue is closed")]
    Closed,
    #[error("events are redirected to an alternate queue")]
    Redirected,
    #[error("unexpected event on the connection queue")]
    Unexpected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SctpParams {
    pub str_in: u16,
    pub str_out: u16,
    /// Number of stream pairs usable by the multi-stream TLS wrapper: the
    /// common subset of both directions.
    pub pairs: u16,
}

pub(crate) enum Transport {
    Tcp(Arc<TcpStream>),
    Sctp(Arc<SctpSocket>),
}

impl Transport {
    pub(crate) fn shutdown(&self) {
        match self {
            Transport::Tcp(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Transport::Sctp(sock) => sock.shutdown(),
        }
    }

    fn raw_fd(&self) -> i32 {
        match self {
            Transport::Tcp(stream) => stream.as_raw_fd(),
            Transport::Sctp(sock) => sock.as_raw_fd(),
        }
    }
}

pub(crate) struct TlsState {
    pub(crate) mode: TlsMode,
    pub(crate) master: Arc<TlsChannel>,
    pub(crate) wrapper: Option<sctps::Wrapper>,
}

pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) remote_id: String,
    pub(crate) proto: Protocol,
    pub(crate) transport: Transport,
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) sctp: SctpParams,
    /// Round-robin stream selector; `send` is called from one thread at a
    /// time per connection.
    next_stream: Mutex<u16>,
    pub(crate) incoming: Fifo<Event>,
    alt_set: AtomicBool,
    pub(crate) protected: AtomicBool,
    hostname: Mutex<Option<String>>,
    pub(crate) receiver: Mutex<Option<thread::JoinHandle<()>>>,
    pub(crate) tls: OnceLock<TlsState>,
    pub(crate) msg_size_max: u32,
}

/// A connection context. Cheap to clone; all clones refer to the same
/// underlying socket and state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("proto", &self.shared.proto)
            .field("protected", &self.shared.protected.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    fn new(
        transport: Transport,
        proto: Protocol,
        id: String,
        remote_id: String,
        sctp: SctpParams,
        msg_size_max: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                remote_id,
                proto,
                transport,
                closing: Arc::new(AtomicBool::new(false)),
                sctp,
                next_stream: Mutex::new(0),
                incoming: Fifo::new(),
                alt_set: AtomicBool::new(false),
                protected: AtomicBool::new(false),
                hostname: Mutex::new(None),
                receiver: Mutex::new(None),
                tls: OnceLock::new(),
                msg_size_max,
            }),
        }
    }

    /// Wrap a TCP socket accepted by a server.
    pub(crate) fn accepted_tcp(
        stream: TcpStream,
        peer: SocketAddr,
        server_fd: i32,
        msg_size_max: u32,
    ) -> io::Result<Self> {
        tcp::set_timeouts(&stream)?;
        let fd = stream.as_raw_fd();
        let id = format!("Incoming TCP [{peer}] ({fd}) @ serv ({server_fd})");
        let remote_id = peer.ip().to_string();
        Ok(Self::new(
            Transport::Tcp(Arc::new(stream)),
            Protocol::Tcp,
            id,
            remote_id,
            SctpParams::default(),
            msg_size_max,
        ))
    }

    /// Wrap an SCTP association accepted by a server; reads the negotiated
    /// stream counts off the socket.
    pub(crate) fn accepted_sctp(
        sock: SctpSocket,
        peer: SocketAddr,
        server_fd: i32,
        msg_size_max: u32,
    ) -> io::Result<Self> {
        set_socket_timeouts(sock.as_raw_fd())?;
        let (str_in, str_out, _) = sock.stream_info()?;
        let sctp = SctpParams {
            str_in,
            str_out,
            pairs: str_in.min(str_out).max(1),
        };
        let fd = sock.as_raw_fd();
        let id = format!("Incoming SCTP [{peer}] ({fd}) @ serv ({server_fd})");
        let remote_id = peer.ip().to_string();
        Ok(Self::new(
            Transport::Sctp(Arc::new(sock)),
            Protocol::Sctp,
            id,
            remote_id,
            sctp,
            msg_size_max,
        ))
    }

    /// Connect to a remote TCP server.
    pub fn connect_tcp(config: &Config, addr: SocketAddr) -> Result<Self, CnxError> {
        let stream = tcp::connect(addr, config.connect_timer)?;
        let fd = stream.as_raw_fd();
        let id = format!("Client of TCP server [{addr}] ({fd})");
        let remote_id = addr.ip().to_string();
        info!(cnx = %id, "connection established");
        Ok(Self::new(
            Transport::Tcp(Arc::new(stream)),
            Protocol::Tcp,
            id,
            remote_id,
            SctpParams::default(),
            config.msg_size_max,
        ))
    }

    /// Connect to a remote SCTP server over its candidate address list.
    pub fn connect_sctp(
        config: &Config,
        port: u16,
        endpoints: &EndpointSet,
    ) -> Result<Self, CnxError> {
        let sock = SctpSocket::client(config, port, endpoints)?;
        set_socket_timeouts(sock.as_raw_fd())?;
        let (str_in, str_out, primary) = sock.stream_info()?;
        let sctp = SctpParams {
            str_in,
            str_out,
            pairs: str_in.min(str_out).max(1),
        };
        let fd = sock.as_raw_fd();
        let primary_str = primary
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        let id = format!("Client of SCTP server [{primary_str}] ({fd})");
        let remote_id = primary
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "?".to_string());
        info!(cnx = %id, str_in, str_out, "association established");
        Ok(Self::new(
            Transport::Sctp(Arc::new(sock)),
            Protocol::Sctp,
            id,
            remote_id,
            sctp,
            config.msg_size_max,
        ))
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[inline]
    pub fn remote_id(&self) -> &str {
        &self.shared.remote_id
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.shared.proto
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.shared.protected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sctp_params(&self) -> SctpParams {
        self.shared.sctp
    }

    /// Which side of the TLS handshake this connection took, once
    /// protected.
    pub fn tls_mode(&self) -> Option<TlsMode> {
        self.shared.tls.get().map(|state| state.mode)
    }

    /// The server-side session resume store, when the multi-stream TLS
    /// wrapper is engaged.
    pub fn resume_store(&self) -> Option<Arc<sctps::ResumeStore>> {
        self.shared
            .tls
            .get()
            .and_then(|state| state.wrapper.as_ref())
            .and_then(|wrapper| wrapper.resume_store().cloned())
    }

    /// Set the name the peer's certificate must present during the
    /// handshake.
    pub fn set_hostname(&self, hostname: impl Into<String>) {
        *self.shared.hostname.lock() = Some(hostname.into());
    }

    pub fn hostname(&self) -> Option<String> {
        self.shared.hostname.lock().clone()
    }

    pub(crate) fn policy(&self) -> IoPolicy {
        IoPolicy::new(self.shared.closing.clone())
    }

    /// Local addresses of the connection, merged into an endpoint set.
    pub fn local_endpoints(&self) -> Result<EndpointSet, CnxError> {
        let mut set = EndpointSet::new();
        match &self.shared.transport {
            Transport::Tcp(stream) => {
                set.add_merge(stream.local_addr()?, EpFlags::LL | EpFlags::PRIMARY);
            }
            Transport::Sctp(sock) => sock.local_endpoints(&mut set)?,
        }
        Ok(set)
    }

    /// Remote addresses of the connection, merged into an endpoint set.
    pub fn remote_endpoints(&self) -> Result<EndpointSet, CnxError> {
        let mut set = EndpointSet::new();
        match &self.shared.transport {
            Transport::Tcp(stream) => {
                set.add_merge(stream.peer_addr()?, EpFlags::LL | EpFlags::PRIMARY);
            }
            Transport::Sctp(sock) => sock.remote_endpoints(&mut set)?,
        }
        Ok(set)
    }

    /// Start receiving cleartext messages. With `continuous` unset the
    /// receiver stops after the first message, which is how the acceptor
    /// awaits the first message of an incoming client.
    pub fn start_clear(&self, continuous: bool) -> Result<(), CnxError> {
        if self.is_protected() {
            return Err(CnxError::InvalidState);
        }
        self.collect_receiver()?;
        let shared = self.shared.clone();
        let fd = self.shared.transport.raw_fd();
        match &self.shared.transport {
            Transport::Tcp(stream) => {
                let sock = stream.clone();
                self.spawn_receiver(format!("recv-clear-tcp-{fd}"), move || {
                    run_clear_tcp(shared, sock, continuous)
                })
            }
            Transport::Sctp(s) => {
                let sock = s.clone();
                self.spawn_receiver(format!("recv-clear-sctp-{fd}"), move || {
                    run_clear_sctp(shared, sock, continuous)
                })
            }
        }
    }

    /// Perform the TLS handshake on the connection, client or server side.
    /// Engages the multi-stream wrapper when the association has more than
    /// one usable stream pair; reception is active once this returns.
    pub fn handshake(
        &self,
        mode: TlsMode,
        creds: &Arc<TlsCreds>,
        deadline: Option<Instant>,
    ) -> Result<(), CnxError> {
        let shared = &self.shared;
        if self.is_protected() || shared.tls.get().is_some() {
            return Err(CnxError::InvalidState);
        }
        self.collect_receiver()?;

        if shared.proto == Protocol::Sctp && shared.sctp.pairs > 1 {
            let state = sctps::engage(self, mode, creds, deadline)?;
            let _ = shared.tls.set(state);
            shared.protected.store(true, Ordering::Release);
            let state = shared.tls.get().expect("just set");
            state
                .wrapper
                .as_ref()
                .expect("multi-stream state carries a wrapper")
                .start_deciphers(self)?;
        } else {
            let hs_policy = self.policy().with_deadline(deadline);
            let (mut pull, push): (Box<dyn Read + Send>, Box<dyn RecordPush>) =
                match &shared.transport {
                    Transport::Tcp(stream) => (
                        Box::new(TcpPull {
                            sock: stream.clone(),
                            policy: hs_policy.clone(),
                        }),
                        Box::new(TcpPush {
                            sock: stream.clone(),
                            policy: self.policy(),
                        }),
                    ),
                    Transport::Sctp(sock) => (
                        Box::new(SctpPull {
                            sock: sock.clone(),
                            policy: hs_policy.clone(),
                            notify: shared.incoming.clone(),
                            pending: Vec::new(),
                            offset: 0,
                        }),
                        Box::new(SctpPush {
                            sock: sock.clone(),
                            policy: self.policy(),
                        }),
                    ),
                };

            let expected = self.hostname();
            let channel = match mode {
                TlsMode::Client => TlsChannel::client(
                    creds.client_config(),
                    self.server_name()?,
                    push,
                )?,
                TlsMode::Server => TlsChannel::server(creds.server_config(), push)?,
            };
            channel
                .handshake(&mut *pull, expected.as_deref())
                .map_err(|e| {
                    warn!(cnx = %shared.id, error = %e, "tls handshake failed");
                    e
                })?;
            // the client side verified chain and name in the handshake;
            // the server still has to match the client's name if one is
            // expected
            let check_name = match mode {
                TlsMode::Server => expected.as_deref(),
                TlsMode::Client => None,
            };
            creds.verify_peer(&channel, check_name).map_err(|e| {
                warn!(cnx = %shared.id, error = %e, "peer credentials rejected");
                e
            })?;
            hs_policy.clear_deadline();

            let master = Arc::new(channel);
            let _ = shared.tls.set(TlsState {
                mode,
                master: master.clone(),
                wrapper: None,
            });
            shared.protected.store(true, Ordering::Release);

            let fd = shared.transport.raw_fd();
            let shared_for_thread = self.shared.clone();
            self.spawn_receiver(format!("recv-tls-{fd}"), move || {
                let mut reader = PlainReader {
                    channel: &master,
                    pull: &mut *pull,
                };
                framed_receive_loop(&shared_for_thread, &mut reader);
            })?;
        }
        info!(cnx = %shared.id, "connection is now protected");
        Ok(())
    }

    /// Receive the next message, pulling from the connection's own event
    /// queue. Disabled once an alternate queue is installed.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>, RecvError> {
        let shared = &self.shared;
        if shared.alt_set.load(Ordering::Acquire) {
            return Err(RecvError::Redirected);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let event = match deadline {
                Some(deadline) => shared.incoming.timed_get(deadline),
                None => shared.incoming.get().map_err(GetError::from),
            };
            match event {
                Ok(Event::MsgRecv(buf)) => return Ok(buf),
                Ok(Event::EpChange(_)) => continue,
                Ok(Event::Timeout) => return Err(RecvError::Timeout),
                Ok(Event::CnxError) => {
                    debug!(cnx = %shared.id, "error event on the connection queue");
                    return Err(RecvError::NotConnected);
                }
                Ok(other) => {
                    warn!(cnx = %shared.id, event = other.name(), "unexpected event");
                    return Err(RecvError::Unexpected);
                }
                Err(GetError::Timeout) => return Err(RecvError::Timeout),
                Err(GetError::WouldBlock) | Err(GetError::Closed) => {
                    return Err(RecvError::Closed)
                }
            }
        }
    }

    /// Redirect the connection's events to `alt` (typically the peer's
    /// event queue). [`Connection::receive`] is disabled afterwards.
    pub fn set_alt_fifo(&self, alt: &Fifo<Event>) -> Result<(), CnxError> {
        self.shared
            .incoming
            .move_to(alt)
            .map_err(|_| CnxError::Closed)?;
        self.shared.alt_set.store(true, Ordering::Release);
        Ok(())
    }

    /// Send a complete message. Synchronous; the caller guarantees at most
    /// one sending thread per connection.
    pub fn send(&self, buf: &[u8]) -> Result<(), CnxError> {
        let shared = &self.shared;
        debug!(
            cnx = %shared.id,
            len = buf.len(),
            protected = self.is_protected(),
            "sending data"
        );
        match shared.proto {
            Protocol::Tcp => self.send_simple(buf),
            Protocol::Sctp => {
                let protected = self.is_protected();
                let (str_out, pairs) = (shared.sctp.str_out, shared.sctp.pairs);
                let mut stream = 0;
                let mut multi = false;
                if str_out > 1 && (!protected || pairs > 1) {
                    let modulus = if protected { pairs } else { str_out };
                    let mut next = shared.next_stream.lock();
                    *next = (*next + 1) % modulus;
                    stream = *next;
                    multi = true;
                }
                if !multi || stream == 0 {
                    self.send_simple(buf)
                } else if !protected {
                    let Transport::Sctp(sock) = &shared.transport else {
                        unreachable!("sctp send on a non-sctp transport")
                    };
                    sock.send_on_stream(stream, buf, &self.policy())?;
                    Ok(())
                } else {
                    let state = shared.tls.get().ok_or(CnxError::InvalidState)?;
                    let wrapper = state.wrapper.as_ref().ok_or(CnxError::InvalidState)?;
                    wrapper.channel(stream).send_plain(buf)?;
                    Ok(())
                }
            }
        }
    }

    fn send_simple(&self, buf: &[u8]) -> Result<(), CnxError> {
        let shared = &self.shared;
        if self.is_protected() {
            let state = shared.tls.get().ok_or(CnxError::InvalidState)?;
            state.master.send_plain(buf)?;
            return Ok(());
        }
        match &shared.transport {
            Transport::Tcp(stream) => {
                write_all_retry(&mut &**stream, buf, &self.policy())?;
                Ok(())
            }
            Transport::Sctp(sock) => {
                sock.send_bytes(buf, &self.policy())?;
                Ok(())
            }
        }
    }

    /// Tear the connection down: close the TLS sessions, shut the socket
    /// down, join every thread, and drain the incoming queue. Idempotent.
    pub fn destroy(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::Release);
        debug!(cnx = %shared.id, "destroying connection");

        if self.is_protected() {
            if let Some(state) = shared.tls.get() {
                // write-direction close on the master session, then on
                // every other stream pair in series
                state.master.close_notify();
                if let Some(wrapper) = &state.wrapper {
                    wrapper.bye();
                }
            }
        }

        // blocked reads return once the socket is down; receivers observe
        // the closing flag and exit without reporting an error
        shared.transport.shutdown();

        if let Some(handle) = shared.receiver.lock().take() {
            let _ = handle.join();
        }
        if let Some(state) = shared.tls.get() {
            if let Some(wrapper) = &state.wrapper {
                wrapper.join_all();
            }
        }

        shared.incoming.close();
        let mut drained = 0;
        while shared.incoming.try_get().is_ok() {
            drained += 1;
        }
        debug!(cnx = %shared.id, drained, "connection destroyed");
    }

    pub(crate) fn server_name(&self) -> Result<ServerName<'static>, TlsError> {
        if let Some(name) = self.hostname() {
            return ServerName::try_from(name.clone()).map_err(|_| TlsError::InvalidName(name));
        }
        // no expected name: pin the session to the peer's address
        let ip = match &self.shared.transport {
            Transport::Tcp(stream) => stream.peer_addr().map_err(TlsError::Io)?.ip(),
            Transport::Sctp(sock) => {
                let (_, _, primary) = sock.stream_info().map_err(TlsError::Io)?;
                primary
                    .ok_or_else(|| {
                        TlsError::Io(io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            "association has no primary address",
                        ))
                    })?
                    .ip()
            }
        };
        Ok(ServerName::IpAddress(ip.into()))
    }

    /// Collect a receiver that already terminated; refuse if one is still
    /// running.
    fn collect_receiver(&self) -> Result<(), CnxError> {
        let mut guard = self.shared.receiver.lock();
        if let Some(handle) = guard.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                *guard = Some(handle);
                return Err(CnxError::InvalidState);
            }
        }
        Ok(())
    }

    pub(crate) fn spawn_receiver(
        &self,
        name: String,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), CnxError> {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        *self.shared.receiver.lock() = Some(handle);
        Ok(())
    }
}

/*******************************************/
/*            receiver threads             */
/*******************************************/

pub(crate) enum FrameError {
    Malformed { version: u8, length: u32 },
    Eof,
    Io(io::Error),
}

/// Rebuild one message from a byte stream: read the fixed 4-byte prefix,
/// validate it, then read the rest of the declared length.
pub(crate) fn read_frame(r: &mut impl Read, max: u32) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 4];
    map_read(r.read_exact(&mut header))?;

    let length = message::validate_prefix(header, max).map_err(|_| FrameError::Malformed {
        version: header[0],
        length: u32::from_be_bytes([0, header[1], header[2], header[3]]),
    })?;

    let mut frame = vec![0u8; length as usize];
    frame[..4].copy_from_slice(&header);
    map_read(r.read_exact(&mut frame[4..]))?;
    Ok(frame)
}

fn map_read(res: io::Result<()>) -> Result<(), FrameError> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Eof),
        Err(e) => Err(FrameError::Io(e)),
    }
}

fn report_receiver_error(shared: &Shared, err: FrameError) {
    if shared.closing.load(Ordering::Acquire) {
        return;
    }
    match err {
        FrameError::Malformed { version, length } => warn!(
            cnx = %shared.id,
            version,
            length,
            "received suspect header, assume disconnection"
        ),
        FrameError::Eof => debug!(cnx = %shared.id, "connection closed by peer"),
        FrameError::Io(e) => warn!(cnx = %shared.id, error = %e, "receive error"),
    }
    let _ = shared.incoming.post(Event::CnxError);
}

fn run_clear_tcp(shared: Arc<Shared>, sock: Arc<TcpStream>, continuous: bool) {
    let mut pull = TcpPull {
        sock,
        policy: IoPolicy::new(shared.closing.clone()),
    };
    loop {
        match read_frame(&mut pull, shared.msg_size_max) {
            Ok(frame) => {
                if shared.incoming.post(Event::MsgRecv(frame)).is_err() {
                    break;
                }
                if !continuous {
                    break;
                }
            }
            Err(err) => {
                report_receiver_error(&shared, err);
                break;
            }
        }
    }
    debug!(cnx = %shared.id, "receiver terminated");
}

fn run_clear_sctp(shared: Arc<Shared>, sock: Arc<SctpSocket>, continuous: bool) {
    let policy = IoPolicy::new(shared.closing.clone());
    loop {
        // the stream id is dropped at this layer; ordering per stream is
        // the transport's business
        let event = match sock.recv_record(&policy) {
            Ok(Record::Data { buf, .. }) => Event::MsgRecv(buf),
            Ok(Record::EndpointChange(buf)) => Event::EpChange(buf),
            Err(err) => {
                report_receiver_error(&shared, FrameError::Io(err));
                break;
            }
        };
        if shared.incoming.post(event).is_err() {
            break;
        }
        if !continuous {
            break;
        }
    }
    debug!(cnx = %shared.id, "receiver terminated");
}

/// Shared framed-receiver loop over a decrypted reader; used by the inline
/// TLS receiver and by every multi-stream decipher thread.
pub(crate) fn framed_receive_loop(shared: &Shared, reader: &mut impl Read) {
    loop {
        match read_frame(reader, shared.msg_size_max) {
            Ok(frame) => {
                if shared.incoming.post(Event::MsgRecv(frame)).is_err() {
                    break;
                }
            }
            Err(err) => {
                report_receiver_error(shared, err);
                break;
            }
        }
    }
    debug!(cnx = %shared.id, "receiver terminated");
}

/*******************************************/
/*        transport pull/push lanes        */
/*******************************************/

pub(crate) struct TcpPull {
    pub(crate) sock: Arc<TcpStream>,
    pub(crate) policy: IoPolicy,
}

impl Read for TcpPull {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut timed_out_once = false;
        loop {
            match (&*self.sock).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(e.kind()) => self.policy.on_timeout(&mut timed_out_once)?,
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) struct TcpPush {
    pub(crate) sock: Arc<TcpStream>,
    pub(crate) policy: IoPolicy,
}

impl RecordPush for TcpPush {
    fn push(&self, record: &[u8]) -> io::Result<()> {
        write_all_retry(&mut &*self.sock, record, &self.policy)
    }
}

/// Byte-stream pull over an SCTP association for the single-stream TLS
/// mode. In-band notifications must not corrupt the TLS stream: endpoint
/// changes are forwarded to the connection queue, everything else ends the
/// stream.
pub(crate) struct SctpPull {
    pub(crate) sock: Arc<SctpSocket>,
    pub(crate) policy: IoPolicy,
    pub(crate) notify: Fifo<Event>,
    pub(crate) pending: Vec<u8>,
    pub(crate) offset: usize,
}

impl Read for SctpPull {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.offset);
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                if self.offset == self.pending.len() {
                    self.pending.clear();
                    self.offset = 0;
                }
                return Ok(n);
            }
            match self.sock.recv_record(&self.policy) {
                Ok(Record::Data { buf: record, .. }) => {
                    self.pending = record;
                    self.offset = 0;
                }
                Ok(Record::EndpointChange(payload)) => {
                    let _ = self.notify.post(Event::EpChange(payload));
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) struct SctpPush {
    pub(crate) sock: Arc<SctpSocket>,
    pub(crate) policy: IoPolicy,
}

impl RecordPush for SctpPush {
    fn push(&self, record: &[u8]) -> io::Result<()> {
        self.sock.send_bytes(record, &self.policy)
    }
}

pub(crate) fn write_all_retry(
    w: &mut impl Write,
    buf: &[u8],
    policy: &IoPolicy,
) -> io::Result<()> {
    let mut written = 0;
    let mut timed_out_once = false;
    while written < buf.len() {
        match w.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket refused further data",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(e.kind()) => policy.on_timeout(&mut timed_out_once)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
