// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP transport: server bind/listen and client connect.

use crate::sock::SOCK_TIMEOUT;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};
use tracing::debug;

/// Create a listening socket bound to `addr`. Uses the conventional
/// backlog of 5 from the original protocol stack.
pub fn bind_server(addr: SocketAddr, v6_only: bool) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(v6_only)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    debug!(%addr, "tcp server bound");
    Ok(socket.into())
}

/// Connect to `addr`, bounded by the connection timer. The stream comes
/// back with the per-socket send/receive timeouts already applied.
pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    set_timeouts(&stream)?;
    debug!(%addr, "tcp connection established");
    Ok(stream)
}

/// Apply the crate-wide socket timeouts to a connected stream.
pub(crate) fn set_timeouts(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(Some(SOCK_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCK_TIMEOUT))?;
    Ok(())
}
