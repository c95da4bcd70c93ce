// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS credentials and the duplex TLS channel.
//!
//! The channel owns a sans-I/O TLS engine behind a short-lived mutex and a
//! push handle that writes produced records to the transport. Reads pull
//! ciphertext from a caller-supplied source *outside* the engine lock, so a
//! receiver blocked on the wire never starves the send path. This is what
//! lets the same engine drive a kernel socket (inline mode) or a per-stream
//! record fifo (multi-stream SCTP, see [`crate::sctps`]).

use parking_lot::{Mutex, MutexGuard};
use rustls::{
    client::danger::ServerCertVerifier,
    client::WebPkiServerVerifier,
    server::{StoresServerSessions, WebPkiClientVerifier},
    CertificateError, ClientConfig, ClientConnection, Connection, HandshakeKind, RootCertStore,
    ServerConfig, ServerConnection,
};
use rustls_pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use std::{io, io::Read, sync::Arc};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("the certificate is not trusted (unknown issuer)")]
    UnknownIssuer,
    #[error("the certificate has been revoked")]
    Revoked,
    #[error("the certificate is expired")]
    Expired,
    #[error("the certificate is not yet valid")]
    NotYetValid,
    #[error("the certificate signature is invalid or uses a weak algorithm")]
    WeakAlgorithm,
    #[error("the certificate does not match the expected name '{0}'")]
    NameMismatch(String),
    #[error("the peer did not supply a certificate")]
    NoPeerCertificate,
    #[error("certificate rejected: {0}")]
    Certificate(String),
    #[error("tls handshake failed: {0}")]
    Handshake(rustls::Error),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("'{0}' is not a valid server name")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TlsError> for io::Error {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Map a rustls error onto the precise diagnostics the logs promise.
pub(crate) fn classify(err: rustls::Error, expected_name: Option<&str>) -> TlsError {
    let name = || expected_name.unwrap_or("<unset>").to_string();
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::UnknownIssuer => TlsError::UnknownIssuer,
            CertificateError::Revoked => TlsError::Revoked,
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                TlsError::Expired
            }
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
                TlsError::NotYetValid
            }
            CertificateError::BadSignature => TlsError::WeakAlgorithm,
            CertificateError::NotValidForName
            | CertificateError::NotValidForNameContext { .. } => TlsError::NameMismatch(name()),
            other => TlsError::Certificate(other.to_string()),
        },
        rustls::Error::NoCertificatesPresented => TlsError::NoPeerCertificate,
        other => TlsError::Handshake(other),
    }
}

/// The local credential set: certificate chain, private key, trust store,
/// and the client/server engine configurations derived from them once.
pub struct TlsCreds {
    chain: Vec<CertificateDer<'static>>,
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
    /// Chain + name verification against our own trust store; used for the
    /// server-side peer name check and the local identity self-check.
    name_verifier: Arc<dyn ServerCertVerifier>,
}

impl std::fmt::Debug for TlsCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCreds")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TlsCreds {
    /// Build the credential set. X.509 only; the peer certificate is
    /// required on both sides of every handshake.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        ca: Vec<CertificateDer<'static>>,
        crls: Vec<CertificateRevocationListDer<'static>>,
    ) -> Result<Arc<Self>, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in &ca {
            roots
                .add(cert.clone())
                .map_err(|e| TlsError::Credentials(e.to_string()))?;
        }
        let roots = Arc::new(roots);

        let server_verifier = WebPkiServerVerifier::builder(roots.clone())
            .with_crls(crls.clone())
            .build()
            .map_err(|e| TlsError::Credentials(e.to_string()))?;

        let client_verifier = WebPkiClientVerifier::builder(roots)
            .with_crls(crls)
            .build()
            .map_err(|e| TlsError::Credentials(e.to_string()))?;

        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(server_verifier.clone())
            .with_client_auth_cert(chain.clone(), key.clone_key())
            .map_err(|e| TlsError::Credentials(e.to_string()))?;

        let server = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain.clone(), key)
            .map_err(|e| TlsError::Credentials(e.to_string()))?;

        Ok(Arc::new(Self {
            chain,
            client: Arc::new(client),
            server: Arc::new(server),
            name_verifier: server_verifier,
        }))
    }

    #[inline]
    pub(crate) fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }

    #[inline]
    pub(crate) fn server_config(&self) -> Arc<ServerConfig> {
        self.server.clone()
    }

    /// Server configuration whose session cache is the per-connection
    /// resume store, for the multi-stream wrapper.
    pub(crate) fn server_config_with_store(
        &self,
        store: Arc<dyn StoresServerSessions>,
    ) -> Arc<ServerConfig> {
        let mut config = (*self.server).clone();
        config.session_storage = store;
        // every additional stream pair performs one abbreviated handshake
        // off the master session's tickets
        config.send_tls13_tickets = 32;
        Arc::new(config)
    }

    /// The local certificate must verify against our own trust store and
    /// carry the local identity as its hostname.
    pub fn validate_local_identity(&self, identity: &str) -> Result<(), TlsError> {
        let (leaf, intermediates) = self
            .chain
            .split_first()
            .ok_or_else(|| TlsError::Credentials("empty certificate chain".into()))?;
        let name = ServerName::try_from(identity.to_string())
            .map_err(|_| TlsError::InvalidName(identity.to_string()))?;
        self.name_verifier
            .verify_server_cert(leaf, intermediates, &name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| classify(e, Some(identity)))
    }

    /// Post-handshake credential check. The chain, validity window, and
    /// (on the client side) name were already enforced by the engine
    /// during the handshake; this re-checks presence and performs the
    /// RFC 6125 name match when the caller supplied an expected name, as
    /// a server must do for its clients.
    pub(crate) fn verify_peer(
        &self,
        channel: &TlsChannel,
        expected_name: Option<&str>,
    ) -> Result<(), TlsError> {
        let conn = channel.conn.lock();
        let certs = conn
            .peer_certificates()
            .ok_or(TlsError::NoPeerCertificate)?;
        let (leaf, intermediates) = certs.split_first().ok_or(TlsError::NoPeerCertificate)?;
        if let Some(name) = expected_name {
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|_| TlsError::InvalidName(name.to_string()))?;
            self.name_verifier
                .verify_server_cert(leaf, intermediates, &server_name, &[], UnixTime::now())
                .map_err(|e| classify(e, Some(name)))?;
        }
        Ok(())
    }
}

/// Writes TLS records produced by the engine to the transport.
pub(crate) trait RecordPush: Send + Sync {
    fn push(&self, record: &[u8]) -> io::Result<()>;
}

/// A TLS session bound to one transport lane (a whole socket, or one SCTP
/// stream pair).
pub struct TlsChannel {
    conn: Mutex<Connection>,
    push: Box<dyn RecordPush>,
}

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel").finish_non_exhaustive()
    }
}

impl TlsChannel {
    pub(crate) fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        push: Box<dyn RecordPush>,
    ) -> Result<Self, TlsError> {
        let conn = ClientConnection::new(config, server_name).map_err(TlsError::Handshake)?;
        Ok(Self {
            conn: Mutex::new(conn.into()),
            push,
        })
    }

    pub(crate) fn server(
        config: Arc<ServerConfig>,
        push: Box<dyn RecordPush>,
    ) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(TlsError::Handshake)?;
        Ok(Self {
            conn: Mutex::new(conn.into()),
            push,
        })
    }

    /// Drive the handshake to completion, pulling ciphertext from `pull`.
    /// The caller still has exclusive use of the channel at this point.
    pub(crate) fn handshake(
        &self,
        pull: &mut (dyn Read + Send),
        expected_name: Option<&str>,
    ) -> Result<(), TlsError> {
        let mut conn = self.conn.lock();
        loop {
            self.flush_locked(&mut conn)?;
            if !conn.is_handshaking() {
                break;
            }
            let mut chunk = [0u8; 4096];
            let n = pull.read(&mut chunk)?;
            if n == 0 {
                return Err(TlsError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed during handshake",
                )));
            }
            self.feed_locked(&mut conn, &chunk[..n], expected_name)?;
        }
        debug!(
            kind = ?conn.handshake_kind(),
            protocol = ?conn.protocol_version(),
            cipher_suite = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "tls session established"
        );
        Ok(())
    }

    /// Encrypt and push application data. Complete records hit the
    /// transport before this returns.
    pub(crate) fn send_plain(&self, data: &[u8]) -> Result<(), TlsError> {
        let mut conn = self.conn.lock();
        io::Write::write_all(&mut conn.writer(), data).map_err(TlsError::Io)?;
        self.flush_locked(&mut conn)
    }

    /// Read decrypted bytes, pulling ciphertext from `pull` as needed.
    /// Returns 0 at end of stream (close_notify or transport EOF).
    pub(crate) fn read_plain(
        &self,
        pull: &mut (dyn Read + Send),
        buf: &mut [u8],
    ) -> Result<usize, TlsError> {
        loop {
            {
                let mut conn = self.conn.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(TlsError::Io(e)),
                }
                // the engine may owe the peer records (rehandshake, key
                // update); write them before blocking on the pull side
                self.flush_locked(&mut conn)?;
            }

            // ciphertext is pulled without the engine lock held so a slow
            // wire never blocks concurrent sends
            let mut chunk = [0u8; 4096];
            let n = pull.read(&mut chunk)?;

            let mut conn = self.conn.lock();
            if n == 0 {
                // let the engine observe the EOF; a missing close_notify
                // then surfaces as truncation on the next reader() call
                let _ = conn.read_tls(&mut io::empty());
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(TlsError::Io(e)),
                }
            }
            self.feed_slice_locked(&mut conn, &chunk[..n])?;
        }
    }

    /// Feed one already-pulled record to the engine (used while absorbing
    /// post-handshake messages such as session tickets).
    pub(crate) fn feed_record(&self, record: &[u8]) -> Result<(), TlsError> {
        let mut conn = self.conn.lock();
        self.feed_slice_locked(&mut conn, record)?;
        self.flush_locked(&mut conn)
    }

    /// Send the write-direction close and flush it out.
    pub(crate) fn close_notify(&self) {
        let mut conn = self.conn.lock();
        conn.send_close_notify();
        let _ = self.flush_locked(&mut conn);
    }

    pub(crate) fn handshake_kind(&self) -> Option<HandshakeKind> {
        self.conn.lock().handshake_kind()
    }

    fn feed_locked(
        &self,
        conn: &mut MutexGuard<'_, Connection>,
        mut slice: &[u8],
        expected_name: Option<&str>,
    ) -> Result<(), TlsError> {
        while !slice.is_empty() {
            conn.read_tls(&mut slice).map_err(TlsError::Io)?;
            if let Err(e) = conn.process_new_packets() {
                // push any alert the engine produced for the failure
                let _ = self.flush_locked(conn);
                return Err(classify(e, expected_name));
            }
        }
        Ok(())
    }

    #[inline]
    fn feed_slice_locked(
        &self,
        conn: &mut MutexGuard<'_, Connection>,
        slice: &[u8],
    ) -> Result<(), TlsError> {
        self.feed_locked(conn, slice, None)
    }

    fn flush_locked(&self, conn: &mut MutexGuard<'_, Connection>) -> Result<(), TlsError> {
        while conn.wants_write() {
            let mut record = Vec::new();
            conn.write_tls(&mut record).map_err(TlsError::Io)?;
            self.push.push(&record)?;
        }
        Ok(())
    }
}

/// Adapter exposing the decrypted side of a channel as a blocking reader,
/// for the shared framed-receiver loop.
pub(crate) struct PlainReader<'a> {
    pub channel: &'a TlsChannel,
    pub pull: &'a mut (dyn Read + Send),
}

impl io::Read for PlainReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel
            .read_plain(self.pull, buf)
            .map_err(io::Error::from)
    }
}
