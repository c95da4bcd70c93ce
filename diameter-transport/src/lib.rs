// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport and peer-connection subsystem of a Diameter base-protocol
//! (RFC 6733) node.
//!
//! The central abstraction is the connection context ([`cnx::Connection`]):
//! a uniform wrapper over TCP and SCTP sockets, optionally protected by
//! TLS, including a multi-stream wrapper that runs one TLS session per SCTP
//! stream pair ([`sctps`]). Around it sit the server acceptor ([`server`])
//! and the per-peer out-sender ([`out`]).
//!
//! Everything here runs on plain OS threads with blocking sockets.
//! Teardown never cancels a thread: closing a connection raises its closing
//! flag and shuts the socket down, which makes every blocked read return,
//! and the receiver threads exit on their own.

pub mod cnx;
pub mod out;
pub mod sctp;
pub mod sctps;
pub mod server;
pub(crate) mod sock;
pub mod tcp;
pub mod tls;

pub use cnx::{CnxError, Connection, Protocol, RecvError};
pub use out::PeerOut;
pub use sctps::ResumeStore;
pub use server::{Candidate, Server};
pub use tls::{TlsCreds, TlsError, TlsMode};
