// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-to-one SCTP transport: multi-homed bind/connect, per-stream send,
//! and EOR-framed receive with notification translation.

use crate::sock::{is_timeout, IoPolicy};
use diameter_core::{Config, EndpointSet, EpFlags};
use std::{
    io,
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
};
use tracing::{debug, warn};

pub(crate) mod sys;

/// Size of the buffer receiving ancillary data.
const CMSG_BUF_LEN: usize = 1024;

/// Receive buffers grow by whole pages while reassembling a record.
const RECV_PAGE: usize = 4096;

/// One record pulled off the association.
#[derive(Debug)]
pub enum Record {
    /// A complete user message and the stream it arrived on.
    Data { stream: u16, buf: Vec<u8> },
    /// An address or association change notification, payload verbatim.
    EndpointChange(Vec<u8>),
}

pub struct SctpSocket {
    fd: OwnedFd,
}

impl AsRawFd for SctpSocket {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for SctpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SctpSocket")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

/// Whether this kernel can open SCTP sockets at all. End-to-end tests skip
/// when it cannot (unmodified container kernels usually lack the module).
pub fn is_supported() -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, sys::IPPROTO_SCTP) };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}

impl SctpSocket {
    fn create(family: libc::c_int) -> io::Result<Self> {
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, sys::IPPROTO_SCTP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Create a server socket bound according to the configuration: to the
    /// configured endpoints when there are any, to the wildcard address of
    /// the preferred family otherwise.
    pub fn server(config: &Config, port: u16) -> io::Result<Self> {
        let family = if config.flags.no_ip6 {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let sock = Self::create(family)?;
        sock.set_prebind_options(config, family)?;

        let configured: Vec<SocketAddr> = config
            .endpoints
            .matching(EpFlags::CONF, EpFlags::CONF)
            .map(|ep| SocketAddr::new(ep.addr.ip(), port))
            .collect();
        let bound_default = configured.is_empty();

        if bound_default {
            sock.bind_wildcard(family, port)?;
        } else {
            let mut array = Vec::new();
            for addr in &configured {
                push_sockaddr(&mut array, *addr);
            }
            debug!(fd = sock.as_raw_fd(), addrs = configured.len(), "sctp bindx");
            sock.setsockopt_raw(sys::SCTP_SOCKOPT_BINDX_ADD, &array)?;
        }

        sock.set_postbind_options(bound_default)?;
        Ok(sock)
    }

    /// Connect to a server over its candidate address list, in priority
    /// order. On failure the socket is shut down and the error returned.
    pub fn client(config: &Config, port: u16, endpoints: &EndpointSet) -> io::Result<Self> {
        let family = if config.flags.no_ip6 {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let sock = Self::create(family)?;

        let connect = || -> io::Result<()> {
            sock.set_prebind_options(config, family)?;

            let mut array = Vec::new();
            let mut count = 0;
            for addr in endpoints.candidates() {
                push_sockaddr(&mut array, SocketAddr::new(addr.ip(), port));
                count += 1;
            }
            if count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no candidate address",
                ));
            }
            debug!(fd = sock.as_raw_fd(), addrs = count, "sctp connectx");
            // the kernel returns the association id on success
            sock.setsockopt_raw(sys::SCTP_SOCKOPT_CONNECTX, &array)?;

            sock.set_postbind_options(true)?;
            Ok(())
        };

        match connect() {
            Ok(()) => Ok(sock),
            Err(e) => {
                sock.shutdown();
                Err(e)
            }
        }
    }

    pub fn listen(&self) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.as_raw_fd(), 5) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept the next client. Blocks until one connects or the socket is
    /// shut down.
    pub fn accept(&self) -> io::Result<(Self, SocketAddr)> {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.as_raw_fd(),
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        let peer = sockaddr_from_storage(&ss).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown peer address family")
        })?;
        Ok((sock, peer))
    }

    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.as_raw_fd(),
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_from_storage(&ss).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unknown local address family")
        })
    }

    /// Pre-binding socket options. The order matters: later options depend
    /// on earlier ones.
    fn set_prebind_options(&self, config: &Config, family: libc::c_int) -> io::Result<()> {
        // Subscribe to the notifications the receiver translates. The
        // association event stays off: one-to-one sockets do not need it.
        let events = sys::sctp_event_subscribe {
            sctp_data_io_event: 1,
            sctp_address_event: 1,
            sctp_send_failure_event: 1,
            sctp_peer_error_event: 1,
            sctp_shutdown_event: 1,
            sctp_partial_delivery_event: 1,
            ..Default::default()
        };
        self.setsockopt(sys::SCTP_EVENTS, &events)?;

        // INIT parameters: requested outbound streams, and an INIT timeout
        // aligned on the connection timer.
        let init = sys::sctp_initmsg {
            sinit_num_ostreams: config.sctp_streams,
            sinit_max_init_timeo: config.connect_timer.as_millis().min(u16::MAX as u128) as u16,
            ..Default::default()
        };
        self.setsockopt(sys::SCTP_INITMSG, &init)?;

        // Keep kernel reassembly ON (option value 0) so records reach us
        // with EOR marking; TLS depends on it.
        let disable_fragments: libc::c_int = 0;
        self.setsockopt(sys::SCTP_DISABLE_FRAGMENTS, &disable_fragments)?;

        // Cap the retransmit timer at Tw/2 - 1 so a dead path is noticed
        // within one watchdog period. Zero fields are left unchanged.
        let rto = sys::sctp_rtoinfo {
            srto_max: (config.watchdog_timer.as_millis() / 2) as u32 - 1000,
            ..Default::default()
        };
        self.setsockopt(sys::SCTP_RTOINFO, &rto)?;

        // Fail the association after 5 retransmission attempts.
        let assoc = sys::sctp_assocparams {
            sasoc_asocmaxrxt: 5,
            ..Default::default()
        };
        self.setsockopt(sys::SCTP_ASSOCINFO, &assoc)?;

        // No lingering on close.
        let linger = libc::linger {
            l_onoff: 0,
            l_linger: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Nagle stays on.
        let nodelay: libc::c_int = 0;
        self.setsockopt(sys::SCTP_NODELAY, &nodelay)?;

        // One partial delivery at a time across every stream; the
        // receivers cannot interleave reassembly buffers.
        let interleave: libc::c_int = 1;
        self.setsockopt(sys::SCTP_FRAGMENT_INTERLEAVE, &interleave)?;

        // We do not want v4-mapped addresses; v4 endpoints are bound with
        // their own sockaddr_in entries.
        let v4mapped: libc::c_int = 0;
        self.setsockopt(sys::SCTP_I_WANT_MAPPED_V4_ADDR, &v4mapped)?;

        if config.flags.no_ip4 && family == libc::AF_INET6 {
            let v6only: libc::c_int = 1;
            let ret = unsafe {
                libc::setsockopt(
                    self.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_V6ONLY,
                    &v6only as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }

    fn set_postbind_options(&self, bound_default: bool) -> io::Result<()> {
        // Automatic ASCONF only makes sense for a bound-all socket.
        let asconf: libc::c_int = if bound_default { 1 } else { 0 };
        self.setsockopt(sys::SCTP_AUTO_ASCONF, &asconf)
    }

    fn bind_wildcard(&self, family: libc::c_int, port: u16) -> io::Result<()> {
        let addr = if family == libc::AF_INET {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        } else {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
        };
        let mut buf = Vec::new();
        push_sockaddr(&mut buf, addr);
        let ret = unsafe {
            libc::bind(
                self.as_raw_fd(),
                buf.as_ptr() as *const libc::sockaddr,
                buf.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stream counts negotiated on the association, plus the primary peer
    /// address.
    pub fn stream_info(&self) -> io::Result<(u16, u16, Option<SocketAddr>)> {
        let mut status: sys::sctp_status = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sys::sctp_status>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                sys::SOL_SCTP,
                sys::SCTP_STATUS,
                &mut status as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let instrms = { status.sstat_instrms };
        let outstrms = { status.sstat_outstrms };
        let primary_ss = { status.sstat_primary.spinfo_address };
        Ok((instrms, outstrms, sockaddr_from_storage(&primary_ss)))
    }

    /// Merge the local addresses of the association (and its primary) into
    /// the endpoint set.
    pub fn local_endpoints(&self, set: &mut EndpointSet) -> io::Result<()> {
        for addr in self.assoc_addrs(sys::SCTP_GET_LOCAL_ADDRS)? {
            set.add_merge(addr, EpFlags::LL);
        }
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.as_raw_fd(),
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret == 0 {
            if let Some(addr) = sockaddr_from_storage(&ss) {
                set.add_merge(addr, EpFlags::PRIMARY);
            }
        }
        Ok(())
    }

    /// Merge the remote addresses of the association (and its primary) into
    /// the endpoint set.
    pub fn remote_endpoints(&self, set: &mut EndpointSet) -> io::Result<()> {
        for addr in self.assoc_addrs(sys::SCTP_GET_PEER_ADDRS)? {
            set.add_merge(addr, EpFlags::LL);
        }
        if let (_, _, Some(primary)) = self.stream_info()? {
            set.add_merge(primary, EpFlags::PRIMARY);
        }
        Ok(())
    }

    /// Send one whole message on the given stream.
    pub fn send_on_stream(&self, stream: u16, buf: &[u8], policy: &IoPolicy) -> io::Result<()> {
        #[repr(C)]
        struct Ancillary {
            hdr: libc::cmsghdr,
            info: sys::sctp_sndrcvinfo,
        }

        let mut anci: Ancillary = unsafe { mem::zeroed() };
        anci.hdr.cmsg_len = mem::size_of::<Ancillary>() as _;
        anci.hdr.cmsg_level = sys::IPPROTO_SCTP;
        anci.hdr.cmsg_type = sys::SCTP_SNDRCV;
        anci.info.sinfo_stream = stream;

        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
        mhdr.msg_iov = &mut iov;
        mhdr.msg_iovlen = 1;
        mhdr.msg_control = &mut anci as *mut _ as *mut libc::c_void;
        mhdr.msg_controllen = mem::size_of::<Ancillary>() as _;

        let mut timed_out_once = false;
        let ret = loop {
            let ret = unsafe { libc::sendmsg(self.as_raw_fd(), &mhdr, 0) };
            if ret >= 0 {
                break ret;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                kind if is_timeout(kind) => policy.on_timeout(&mut timed_out_once)?,
                _ => return Err(err),
            }
        };
        // sendmsg is atomic per message; partial delivery must not occur
        debug_assert_eq!(ret as usize, buf.len());
        Ok(())
    }

    /// Plain byte-stream send (stream 0), used for the inline send path.
    pub(crate) fn send_bytes(&self, buf: &[u8], policy: &IoPolicy) -> io::Result<()> {
        let mut sent = 0;
        let mut timed_out_once = false;
        while sent < buf.len() {
            let ret = unsafe {
                libc::send(
                    self.as_raw_fd(),
                    buf[sent..].as_ptr() as *const libc::c_void,
                    buf.len() - sent,
                    0,
                )
            };
            if ret >= 0 {
                sent += ret as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                kind if is_timeout(kind) => policy.on_timeout(&mut timed_out_once)?,
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Receive the next complete record or notification. Reassembles
    /// fragments until the kernel marks the end of record.
    pub fn recv_record(&self, policy: &IoPolicy) -> io::Result<Record> {
        let mut data: Vec<u8> = Vec::new();
        let mut anci = [0u8; CMSG_BUF_LEN];
        let mut stream = 0u16;
        let mut timed_out_once = false;

        loop {
            if data.len() == data.capacity() {
                data.reserve(RECV_PAGE);
            }

            let spare = data.spare_capacity_mut();
            let mut iov = libc::iovec {
                iov_base: spare.as_mut_ptr() as *mut libc::c_void,
                iov_len: spare.len(),
            };
            let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
            mhdr.msg_iov = &mut iov;
            mhdr.msg_iovlen = 1;
            mhdr.msg_control = anci.as_mut_ptr() as *mut libc::c_void;
            mhdr.msg_controllen = anci.len() as _;

            let ret = loop {
                let ret = unsafe { libc::recvmsg(self.as_raw_fd(), &mut mhdr, 0) };
                if ret >= 0 {
                    break ret;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    kind if is_timeout(kind) => policy.on_timeout(&mut timed_out_once)?,
                    _ => return Err(err),
                }
            };
            if ret == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "association closed",
                ));
            }
            unsafe {
                data.set_len(data.len() + ret as usize);
            }

            if let Some(id) = stream_id_from_cmsg(&mhdr) {
                stream = id;
            }

            if mhdr.msg_flags & libc::MSG_EOR == 0 {
                // record continues in the next fragment
                continue;
            }

            if mhdr.msg_flags & sys::MSG_NOTIFICATION != 0 {
                return translate_notification(data);
            }

            return Ok(Record::Data { stream, buf: data });
        }
    }
}

/// Map a kernel notification onto the pipeline's event model: address and
/// association changes are survivable, everything else ends the connection.
fn translate_notification(data: Vec<u8>) -> io::Result<Record> {
    if data.len() < mem::size_of::<sys::sctp_sn_header>() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated sctp notification",
        ));
    }
    let sn_type = u16::from_ne_bytes([data[0], data[1]]);
    match sn_type {
        sys::SCTP_ASSOC_CHANGE | sys::SCTP_PEER_ADDR_CHANGE => {
            debug!(sn_type, len = data.len(), "sctp endpoint change");
            Ok(Record::EndpointChange(data))
        }
        sys::SCTP_SEND_FAILED => Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "sctp send failure notification",
        )),
        sys::SCTP_REMOTE_ERROR => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "sctp remote error notification",
        )),
        sys::SCTP_SHUTDOWN_EVENT => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "sctp shutdown notification",
        )),
        other => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            format!("unknown sctp notification {other}"),
        )),
    }
}

fn stream_id_from_cmsg(mhdr: &libc::msghdr) -> Option<u16> {
    unsafe {
        let mut hdr = libc::CMSG_FIRSTHDR(mhdr);
        while !hdr.is_null() {
            if (*hdr).cmsg_level == sys::IPPROTO_SCTP && (*hdr).cmsg_type == sys::SCTP_SNDRCV {
                let info =
                    ptr::read_unaligned(libc::CMSG_DATA(hdr) as *const sys::sctp_sndrcvinfo);
                return Some(info.sinfo_stream);
            }
            hdr = libc::CMSG_NXTHDR(mhdr, hdr);
        }
    }
    None
}

impl SctpSocket {
    fn setsockopt<T>(&self, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                sys::SOL_SCTP,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// setsockopt over a raw byte buffer (the bindx/connectx entry points
    /// take a packed sockaddr array).
    fn setsockopt_raw(&self, name: libc::c_int, value: &[u8]) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                sys::SOL_SCTP,
                name,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn assoc_addrs(&self, name: libc::c_int) -> io::Result<Vec<SocketAddr>> {
        let mut buf = vec![0u8; RECV_PAGE];
        let mut len = buf.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                sys::SOL_SCTP,
                name,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let header: sys::sctp_getaddrs =
            unsafe { ptr::read_unaligned(buf.as_ptr() as *const _) };

        let mut out = Vec::with_capacity(header.addr_num as usize);
        let mut offset = mem::size_of::<sys::sctp_getaddrs>();
        for _ in 0..header.addr_num {
            if offset + 2 > buf.len() {
                break;
            }
            let family = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as libc::c_int;
            match family {
                libc::AF_INET => {
                    let sin: libc::sockaddr_in =
                        unsafe { ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
                    out.push(sockaddr_from_in(&sin));
                    offset += mem::size_of::<libc::sockaddr_in>();
                }
                libc::AF_INET6 => {
                    let sin6: libc::sockaddr_in6 =
                        unsafe { ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
                    out.push(sockaddr_from_in6(&sin6));
                    offset += mem::size_of::<libc::sockaddr_in6>();
                }
                other => {
                    warn!(family = other, "unknown address family in sctp address list");
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// Append the native encoding of `addr` to a packed sockaddr array.
pub(crate) fn push_sockaddr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin as *const _ as *const u8,
                    mem::size_of::<libc::sockaddr_in>(),
                )
            };
            buf.extend_from_slice(bytes);
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin6 as *const _ as *const u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                )
            };
            buf.extend_from_slice(bytes);
        }
    }
}

fn sockaddr_from_in(sin: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

fn sockaddr_from_in6(sin6: &libc::sockaddr_in6) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
        u16::from_be(sin6.sin6_port),
        sin6.sin6_flowinfo,
        sin6.sin6_scope_id,
    ))
}

pub(crate) fn sockaddr_from_storage(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { ptr::read_unaligned(ss as *const _ as *const libc::sockaddr_in) };
            Some(sockaddr_from_in(&sin))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { ptr::read_unaligned(ss as *const _ as *const libc::sockaddr_in6) };
            Some(sockaddr_from_in6(&sin6))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:3868".parse().unwrap();
        let mut buf = Vec::new();
        push_sockaddr(&mut buf, addr);
        assert_eq!(buf.len(), mem::size_of::<libc::sockaddr_in>());
        let sin: libc::sockaddr_in = unsafe { ptr::read_unaligned(buf.as_ptr() as *const _) };
        assert_eq!(sockaddr_from_in(&sin), addr);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::42]:3868".parse().unwrap();
        let mut buf = Vec::new();
        push_sockaddr(&mut buf, addr);
        assert_eq!(buf.len(), mem::size_of::<libc::sockaddr_in6>());
        let sin6: libc::sockaddr_in6 = unsafe { ptr::read_unaligned(buf.as_ptr() as *const _) };
        assert_eq!(sockaddr_from_in6(&sin6), addr);
    }

    #[test]
    fn storage_decodes_both_families() {
        for addr in ["198.51.100.1:0", "[2001:db8::1]:42"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = Vec::new();
            push_sockaddr(&mut buf, addr);
            let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
            unsafe {
                ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    &mut ss as *mut _ as *mut u8,
                    buf.len(),
                );
            }
            assert_eq!(sockaddr_from_storage(&ss), Some(addr));
        }
    }
}
