// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The server (listening) side of the daemon: one acceptor per listening
//! socket, one short-lived handshake thread per accepted client.

use crate::{
    cnx::{CnxError, Connection, Protocol},
    sctp::SctpSocket,
    tcp,
    tls::{TlsCreds, TlsMode},
};
use diameter_core::{fifo::Fifo, Config, Event};
use parking_lot::Mutex;
use std::{
    fmt,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{debug, info, warn};

/// An accepted connection whose handshake (if any) completed, handed to
/// the peer layer for capability exchange.
#[derive(Debug)]
pub struct Candidate {
    pub cnx: Connection,
    pub remote: SocketAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    NotCreated = 0,
    Running = 1,
    Terminated = 2,
}

/// Everything the per-client threads need.
#[derive(Clone)]
pub struct ServeCtx {
    /// Completed candidates are posted here for the peer layer.
    pub candidates: Fifo<Candidate>,
    /// The daemon's main event queue; acceptor failures post `Terminate`.
    pub main_events: Fifo<Event>,
    /// Credentials for secure-on-connect servers.
    pub creds: Option<Arc<TlsCreds>>,
    pub config: Config,
}

enum Listener {
    Tcp(TcpListener),
    Sctp(Arc<SctpSocket>),
}

impl Listener {
    fn raw_fd(&self) -> i32 {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Sctp(sock) => sock.as_raw_fd(),
        }
    }

    fn shutdown(&self) {
        match self {
            Listener::Tcp(listener) => unsafe {
                libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
            },
            Listener::Sctp(sock) => sock.shutdown(),
        }
    }
}

struct Inner {
    name: String,
    proto: Protocol,
    secure: bool,
    listener: Listener,
    status: AtomicU8,
    stopping: AtomicBool,
    clients: Mutex<Vec<Connection>>,
    acceptor: Mutex<Option<thread::JoinHandle<()>>>,
}

/// A listening socket and its acceptor thread.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Server {
    /// Bind a TCP server on `addr` (or the wildcard of the preferred
    /// family when `None`).
    pub fn tcp(config: &Config, port: u16, addr: Option<IpAddr>, secure: bool) -> io::Result<Self> {
        let ip = addr.unwrap_or(if config.flags.no_ip6 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
        let listener = tcp::bind_server(SocketAddr::new(ip, port), config.flags.no_ip4)?;
        let fd = listener.as_raw_fd();
        let name = format!("Srv TCP{} [{ip}]:{port} ({fd})", if secure { "s" } else { "" });
        Ok(Self::new(name, Protocol::Tcp, secure, Listener::Tcp(listener)))
    }

    /// Bind a (possibly multi-homed) SCTP server per the configuration.
    pub fn sctp(config: &Config, port: u16, secure: bool) -> io::Result<Self> {
        let sock = SctpSocket::server(config, port)?;
        let fd = sock.as_raw_fd();
        let name = format!("Srv SCTP{} :{port} ({fd})", if secure { "s" } else { "" });
        Ok(Self::new(
            name,
            Protocol::Sctp,
            secure,
            Listener::Sctp(Arc::new(sock)),
        ))
    }

    fn new(name: String, proto: Protocol, secure: bool, listener: Listener) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                proto,
                secure,
                listener,
                status: AtomicU8::new(ServerStatus::NotCreated as u8),
                stopping: AtomicBool::new(false),
                clients: Mutex::new(Vec::new()),
                acceptor: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.proto
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner.listener {
            Listener::Tcp(listener) => listener.local_addr(),
            Listener::Sctp(sock) => sock.local_addr(),
        }
    }

    pub fn status(&self) -> ServerStatus {
        match self.inner.status.load(Ordering::Acquire) {
            1 => ServerStatus::Running,
            2 => ServerStatus::Terminated,
            _ => ServerStatus::NotCreated,
        }
    }

    /// Start listening and accepting clients. A secure server refuses to
    /// start unless its certificate carries the local identity it will
    /// announce.
    pub fn start(&self, ctx: ServeCtx) -> Result<(), CnxError> {
        if self.inner.secure {
            let creds = ctx.creds.as_ref().ok_or(CnxError::InvalidState)?;
            creds
                .validate_local_identity(&ctx.config.identity)
                .map_err(|e| {
                    warn!(
                        serv = %self.inner.name,
                        identity = %ctx.config.identity,
                        error = %e,
                        "local certificate does not match the local identity"
                    );
                    e
                })?;
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name(format!("serv-{}", inner.listener.raw_fd()))
            .spawn(move || accept_loop(inner, ctx))?;
        *self.inner.acceptor.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting, join the acceptor, and destroy the clients still in
    /// the handshake window.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);
        inner.listener.shutdown();
        if let Some(handle) = inner.acceptor.lock().take() {
            let _ = handle.join();
        }
        let clients = std::mem::take(&mut *inner.clients.lock());
        for client in clients {
            client.destroy();
        }
        info!(serv = %inner.name, "server stopped");
    }

    /// Forget a client that the peer layer took ownership of.
    pub fn release_client(&self, cnx: &Connection) {
        self.inner
            .clients
            .lock()
            .retain(|c| !Arc::ptr_eq(&c.shared, &cnx.shared));
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }
}

fn accept_loop(inner: Arc<Inner>, ctx: ServeCtx) {
    inner
        .status
        .store(ServerStatus::Running as u8, Ordering::Release);

    // the TCP listener is already listening; SCTP gets its backlog here
    if let Listener::Sctp(sock) = &inner.listener {
        if let Err(e) = sock.listen() {
            inner
                .status
                .store(ServerStatus::Terminated as u8, Ordering::Release);
            warn!(serv = %inner.name, error = %e, "listen failed");
            let _ = ctx.main_events.post(Event::Terminate);
            return;
        }
    }
    info!(serv = %inner.name, "accepting connections");

    loop {
        let accepted = match &inner.listener {
            Listener::Tcp(listener) => listener
                .accept()
                .map(|(stream, peer)| AcceptedSock::Tcp(stream, peer)),
            Listener::Sctp(sock) => sock
                .accept()
                .map(|(client, peer)| AcceptedSock::Sctp(client, peer)),
        };
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                inner
                    .status
                    .store(ServerStatus::Terminated as u8, Ordering::Release);
                if inner.stopping.load(Ordering::Acquire) {
                    debug!(serv = %inner.name, "acceptor stopped");
                } else {
                    warn!(serv = %inner.name, error = %e, "acceptor failed");
                    let _ = ctx.main_events.post(Event::Terminate);
                }
                return;
            }
        };

        let peer = accepted.peer();
        debug!(serv = %inner.name, %peer, "accepted new client");

        let inner_cl = inner.clone();
        let ctx_cl = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("cli-{peer}"))
            .spawn(move || handle_client(inner_cl, ctx_cl, accepted));
        if let Err(e) = spawned {
            warn!(serv = %inner.name, error = %e, "could not spawn client thread");
        }
    }
}

enum AcceptedSock {
    Tcp(std::net::TcpStream, SocketAddr),
    Sctp(SctpSocket, SocketAddr),
}

impl AcceptedSock {
    fn peer(&self) -> SocketAddr {
        match self {
            AcceptedSock::Tcp(_, peer) | AcceptedSock::Sctp(_, peer) => *peer,
        }
    }
}

/// Convert an accepted socket into a peer candidate: wrap it, run the
/// server handshake when the port is secure-on-connect, register it, and
/// hand it off. Failures before registration only cost this client;
/// failures after it signal the main loop.
fn handle_client(inner: Arc<Inner>, ctx: ServeCtx, accepted: AcceptedSock) {
    let server_fd = inner.listener.raw_fd();
    let msg_size_max = ctx.config.msg_size_max;

    let built = match accepted {
        AcceptedSock::Tcp(stream, peer) => {
            Connection::accepted_tcp(stream, peer, server_fd, msg_size_max).map(|cnx| (cnx, peer))
        }
        AcceptedSock::Sctp(sock, peer) => {
            Connection::accepted_sctp(sock, peer, server_fd, msg_size_max).map(|cnx| (cnx, peer))
        }
    };
    let (cnx, remote) = match built {
        Ok(pair) => pair,
        Err(e) => {
            warn!(serv = %inner.name, error = %e, "could not wrap accepted socket");
            return;
        }
    };
    info!(serv = %inner.name, cnx = %cnx.id(), "new client connection");

    if inner.secure {
        let creds = ctx.creds.as_ref().expect("checked at start");
        let deadline = Instant::now() + ctx.config.incoming_timeout;
        if let Err(e) = cnx.handshake(TlsMode::Server, creds, Some(deadline)) {
            warn!(
                serv = %inner.name,
                cnx = %cnx.id(),
                peer = %cnx.remote_id(),
                error = %e,
                "incoming handshake failed, dropping client"
            );
            cnx.destroy();
            return;
        }
    }

    inner.clients.lock().push(cnx.clone());

    if ctx
        .candidates
        .post(Candidate { cnx: cnx.clone(), remote })
        .is_err()
    {
        // the peer layer is gone; this is fatal for the daemon
        warn!(serv = %inner.name, "candidate queue is closed");
        cnx.destroy();
        let _ = ctx.main_events.post(Event::Terminate);
    }
}
