// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS over multi-stream SCTP.
//!
//! The TLS engine cannot natively follow per-stream SCTP framing, so the
//! wrapper runs one TLS session per stream pair and moves the transport
//! I/O onto queues:
//!
//! - one demuxer thread reads the socket and deposits each record into the
//!   raw fifo of the sub-context indexed by the stream id;
//! - each sub-context's pull side blocks on that fifo and serves bytes out
//!   of the last record; its push side sends exactly one SCTP message on
//!   its own stream;
//! - one decipher thread per stream pair drives the shared framed receiver
//!   over the decrypted bytes.
//!
//! The master session lives on stream 0. The remaining streams complete
//! with abbreviated handshakes: the client shares the master session's
//! ticket cache, the server resumes out of the per-connection
//! [`ResumeStore`]. A stream that fails to resume performs a full
//! handshake and goes through credential verification again.

use crate::{
    cnx::{framed_receive_loop, CnxError, Connection, Shared, TlsState, Transport},
    sctp::{Record, SctpSocket},
    sock::IoPolicy,
    tls::{PlainReader, RecordPush, TlsChannel, TlsCreds, TlsError, TlsMode},
};
use diameter_core::{
    fifo::{Fifo, GetError},
    Event,
};
use parking_lot::{Mutex, RwLock};
use rustls::{server::StoresServerSessions, HandshakeKind};
use std::{
    collections::BTreeMap,
    io::{self, Read},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// How long the client keeps absorbing post-handshake records (session
/// tickets) from stream 0 before starting the other streams.
const TICKET_GRACE: Duration = Duration::from_millis(250);

/*************************************************************/
/*               session resumption store                    */
/*************************************************************/

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("an entry with this key already holds different data")]
    Mismatch,
    #[error("no entry with this key")]
    NotFound,
}

/// Server-side cache of TLS session state, shared by all sub-contexts of
/// one connection. Keys are unique; lookups run under the read lock,
/// mutations under the write lock.
#[derive(Debug, Default)]
pub struct ResumeStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    stores: AtomicUsize,
    fetches: AtomicUsize,
    hits: AtomicUsize,
}

impl ResumeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ordered insert. Storing the same data under the same key again is
    /// an idempotent success; different data under an existing key is an
    /// error.
    pub fn store(&self, key: Vec<u8>, data: Vec<u8>) -> Result<(), StoreError> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) if *existing == data => Ok(()),
            Some(_) => Err(StoreError::Mismatch),
            None => {
                entries.insert(key, data);
                Ok(())
            }
        }
    }

    /// Fetch a copy of the data under `key`.
    pub fn fetch(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let found = self.entries.read().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        match self.entries.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// (stores, fetches, hits) counters, for diagnostics.
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stores.load(Ordering::Relaxed),
            self.fetches.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }
}

impl StoresServerSessions for ResumeStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.store(key, value).is_ok()
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.fetch(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let taken = self.entries.write().remove(key);
        if taken.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    fn can_cache(&self) -> bool {
        true
    }
}

/*************************************************************/
/*                  per-stream sub-context                   */
/*************************************************************/

/// Pull side of one stream pair: blocks on the demuxed record fifo and
/// serves bytes out of the last pulled record.
pub(crate) struct StreamPull {
    raw: Fifo<Vec<u8>>,
    partial: Vec<u8>,
    offset: usize,
    /// Handshake deadline, shared by every stream of the connection and
    /// lifted once all handshakes completed.
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Read for StreamPull {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset == self.partial.len() {
            let deadline = *self.deadline.lock();
            let record = match deadline {
                Some(deadline) => match self.raw.timed_get(deadline) {
                    Ok(record) => record,
                    Err(GetError::Timeout) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "handshake deadline elapsed",
                        ))
                    }
                    Err(_) => return Ok(0),
                },
                None => match self.raw.get() {
                    Ok(record) => record,
                    Err(_) => return Ok(0),
                },
            };
            self.partial = record;
            self.offset = 0;
        }
        let n = buf.len().min(self.partial.len() - self.offset);
        buf[..n].copy_from_slice(&self.partial[self.offset..self.offset + n]);
        self.offset += n;
        if self.offset == self.partial.len() {
            self.partial = Vec::new();
            self.offset = 0;
        }
        Ok(n)
    }
}

/// Push side of one stream pair: one SCTP message per TLS record batch, on
/// this sub-context's stream id.
struct StreamPush {
    sock: Arc<SctpSocket>,
    stream: u16,
    policy: IoPolicy,
}

impl RecordPush for StreamPush {
    fn push(&self, record: &[u8]) -> io::Result<()> {
        self.sock.send_on_stream(self.stream, record, &self.policy)
    }
}

struct SubCtx {
    stream: u16,
    raw: Fifo<Vec<u8>>,
    channel: OnceLock<Arc<TlsChannel>>,
    pull: Mutex<Option<StreamPull>>,
    decipher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SubCtx {
    fn new(stream: u16, deadline: Arc<Mutex<Option<Instant>>>) -> Self {
        let raw = Fifo::new();
        let pull = StreamPull {
            raw: raw.clone(),
            partial: Vec::new(),
            offset: 0,
            deadline,
        };
        Self {
            stream,
            raw,
            channel: OnceLock::new(),
            pull: Mutex::new(Some(pull)),
            decipher: Mutex::new(None),
        }
    }

    fn take_pull(&self) -> StreamPull {
        self.pull
            .lock()
            .take()
            .expect("stream pull is checked out elsewhere")
    }
}

/*************************************************************/
/*                        the wrapper                        */
/*************************************************************/

pub(crate) struct Wrapper {
    subs: Vec<SubCtx>,
    store: Option<Arc<ResumeStore>>,
}

impl Wrapper {
    pub(crate) fn channel(&self, stream: u16) -> Arc<TlsChannel> {
        self.subs[stream as usize]
            .channel
            .get()
            .expect("stream handshakes completed")
            .clone()
    }

    pub(crate) fn resume_store(&self) -> Option<&Arc<ResumeStore>> {
        self.store.as_ref()
    }

    /// Start one decipher thread per stream pair.
    pub(crate) fn start_deciphers(&self, cnx: &Connection) -> Result<(), CnxError> {
        let fd = match &cnx.shared.transport {
            Transport::Sctp(sock) => sock.as_raw_fd(),
            Transport::Tcp(_) => unreachable!("wrapper on a non-sctp transport"),
        };
        for sub in &self.subs {
            let channel = sub
                .channel
                .get()
                .expect("stream handshakes completed")
                .clone();
            let mut pull = sub.take_pull();
            let shared = cnx.shared.clone();
            let stream = sub.stream;
            let handle = thread::Builder::new()
                .name(format!("decipher-{stream}@{fd}"))
                .spawn(move || {
                    let mut reader = PlainReader {
                        channel: &channel,
                        pull: &mut pull,
                    };
                    framed_receive_loop(&shared, &mut reader);
                })
                .map_err(CnxError::Io)?;
            *sub.decipher.lock() = Some(handle);
        }
        Ok(())
    }

    /// Write-direction close on every non-master session, in series.
    pub(crate) fn bye(&self) {
        for sub in self.subs.iter().skip(1) {
            if let Some(channel) = sub.channel.get() {
                channel.close_notify();
            }
        }
    }

    /// Collect every decipher thread. The demuxer closes the raw fifos on
    /// its way out, which unblocks them all.
    pub(crate) fn join_all(&self) {
        for sub in &self.subs {
            if let Some(handle) = sub.decipher.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

/// Initialize the wrapper on a connection and run every handshake: the
/// demuxer starts first so the master handshake's records route through
/// stream 0's fifo, then the master handshake and verification, then the
/// per-stream resumed handshakes in parallel.
pub(crate) fn engage(
    cnx: &Connection,
    mode: TlsMode,
    creds: &Arc<TlsCreds>,
    deadline: Option<Instant>,
) -> Result<TlsState, CnxError> {
    let shared = &cnx.shared;
    let Transport::Sctp(sock) = &shared.transport else {
        return Err(CnxError::InvalidState);
    };
    let pairs = shared.sctp.pairs;
    debug_assert!(pairs > 1);

    let hs_deadline = Arc::new(Mutex::new(deadline));
    let subs: Vec<SubCtx> = (0..pairs)
        .map(|i| SubCtx::new(i, hs_deadline.clone()))
        .collect();

    // server side: one resume store per connection
    let (store, server_config) = match mode {
        TlsMode::Server => {
            let store = ResumeStore::new();
            let config = creds.server_config_with_store(store.clone());
            (Some(store), Some(config))
        }
        TlsMode::Client => (None, None),
    };

    // the demuxer must run before any handshake byte is exchanged
    {
        let shared = cnx.shared.clone();
        let sock = sock.clone();
        let raws: Vec<Fifo<Vec<u8>>> = subs.iter().map(|s| s.raw.clone()).collect();
        let fd = sock.as_raw_fd();
        cnx.spawn_receiver(format!("demux-{fd}"), move || run_demux(shared, sock, raws))?;
    }

    let expected = cnx.hostname();
    let server_name = match mode {
        TlsMode::Client => Some(cnx.server_name()?),
        TlsMode::Server => None,
    };

    let make_channel = |stream: u16| -> Result<TlsChannel, TlsError> {
        let push = Box::new(StreamPush {
            sock: sock.clone(),
            stream,
            policy: cnx.policy(),
        });
        match mode {
            TlsMode::Client => TlsChannel::client(
                creds.client_config(),
                server_name.clone().expect("client mode has a server name"),
                push,
            ),
            TlsMode::Server => TlsChannel::server(
                server_config.clone().expect("server mode has a config"),
                push,
            ),
        }
    };

    // master handshake on stream 0
    let master = Arc::new(make_channel(0)?);
    {
        let mut pull = subs[0].take_pull();
        let result = master
            .handshake(&mut pull, expected.as_deref())
            .and_then(|()| {
                let check_name = match mode {
                    TlsMode::Server => expected.as_deref(),
                    TlsMode::Client => None,
                };
                creds.verify_peer(&master, check_name)
            });
        if let Err(e) = &result {
            warn!(cnx = %shared.id, error = %e, "master tls handshake failed");
        }
        if result.is_ok() && mode == TlsMode::Client {
            // absorb the session tickets that follow the server Finished,
            // so the other streams can resume off them
            let grace = Instant::now() + TICKET_GRACE;
            while let Ok(record) = subs[0].raw.timed_get(grace) {
                master.feed_record(&record)?;
            }
        }
        *subs[0].pull.lock() = Some(pull);
        result?;
    }
    let _ = subs[0].channel.set(master.clone());

    // handshake the other streams in parallel
    let mut workers = Vec::with_capacity(pairs as usize - 1);
    for sub in subs.iter().skip(1) {
        let channel = Arc::new(make_channel(sub.stream)?);
        let _ = sub.channel.set(channel.clone());
        let mut pull = sub.take_pull();
        let creds = creds.clone();
        let expected = expected.clone();
        let id = shared.id.clone();
        let stream = sub.stream;
        let worker = thread::Builder::new()
            .name(format!("hs-resume-{stream}"))
            .spawn(move || {
                let result = channel
                    .handshake(&mut pull, expected.as_deref())
                    .and_then(|()| {
                        let resumed = channel.handshake_kind() == Some(HandshakeKind::Resumed);
                        if resumed {
                            debug!(cnx = %id, stream, "session resumed");
                            Ok(())
                        } else {
                            debug!(cnx = %id, stream, "session not resumed, full handshake");
                            match mode {
                                // a full handshake on the server side goes
                                // through credential verification again
                                TlsMode::Server => creds.verify_peer(&channel, expected.as_deref()),
                                TlsMode::Client => Ok(()),
                            }
                        }
                    });
                (pull, result)
            })
            .map_err(CnxError::Io)?;
        workers.push((sub.stream, worker));
    }

    let mut failures = 0;
    for (stream, worker) in workers {
        match worker.join() {
            Ok((pull, result)) => {
                *subs[stream as usize].pull.lock() = Some(pull);
                if let Err(e) = result {
                    warn!(cnx = %shared.id, stream, error = %e, "stream handshake failed");
                    failures += 1;
                }
            }
            Err(_) => failures += 1,
        }
    }
    if failures > 0 {
        return Err(CnxError::Tls(TlsError::Handshake(
            rustls::Error::HandshakeNotComplete,
        )));
    }

    hs_deadline.lock().take();

    Ok(TlsState {
        mode,
        master,
        wrapper: Some(Wrapper { subs, store }),
    })
}

/// Read the socket and deposit each record into the raw fifo of the
/// sub-context its stream id selects. A transport error tears the wrapper
/// down by closing every raw fifo.
fn run_demux(shared: Arc<Shared>, sock: Arc<SctpSocket>, raws: Vec<Fifo<Vec<u8>>>) {
    let policy = IoPolicy::new(shared.closing.clone());
    loop {
        match sock.recv_record(&policy) {
            Ok(Record::Data { stream, buf }) => {
                if let Some(raw) = raws.get(stream as usize) {
                    if raw.post(buf).is_err() {
                        break;
                    }
                } else {
                    warn!(
                        cnx = %shared.id,
                        stream,
                        peer = %shared.remote_id,
                        "record on out-of-range stream discarded"
                    );
                }
            }
            Ok(Record::EndpointChange(buf)) => {
                if shared.incoming.post(Event::EpChange(buf)).is_err() {
                    break;
                }
            }
            Err(e) => {
                if !shared.closing.load(Ordering::Acquire) {
                    warn!(cnx = %shared.id, error = %e, "demuxer error");
                    let _ = shared.incoming.post(Event::CnxError);
                }
                break;
            }
        }
    }
    // unblock every per-stream reader
    for raw in &raws {
        raw.close();
    }
    debug!(cnx = %shared.id, "demuxer terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_idempotent_for_identical_data() {
        let store = ResumeStore::new();
        assert_eq!(store.store(b"key".to_vec(), b"data".to_vec()), Ok(()));
        assert_eq!(store.store(b"key".to_vec(), b"data".to_vec()), Ok(()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch(b"key"), Some(b"data".to_vec()));
    }

    #[test]
    fn store_rejects_mismatched_data() {
        let store = ResumeStore::new();
        assert_eq!(store.store(b"key".to_vec(), b"data".to_vec()), Ok(()));
        assert_eq!(
            store.store(b"key".to_vec(), b"other".to_vec()),
            Err(StoreError::Mismatch)
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch(b"key"), Some(b"data".to_vec()));
    }

    #[test]
    fn fetch_returns_an_owned_copy() {
        let store = ResumeStore::new();
        store.store(b"k".to_vec(), b"v".to_vec()).unwrap();
        let copy = store.fetch(b"k").unwrap();
        drop(copy);
        assert_eq!(store.fetch(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn remove_deletes_exactly_one_entry() {
        let store = ResumeStore::new();
        store.store(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.store(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(store.remove(b"a"), Ok(()));
        assert_eq!(store.remove(b"a"), Err(StoreError::NotFound));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn session_callbacks_follow_single_use_tickets() {
        let store = ResumeStore::new();
        assert!(store.put(b"ticket".to_vec(), b"state".to_vec()));
        // duplicate put with different data is refused
        assert!(!store.put(b"ticket".to_vec(), b"changed".to_vec()));
        assert_eq!(store.get(b"ticket"), Some(b"state".to_vec()));
        // take consumes the entry
        assert_eq!(
            StoresServerSessions::take(&*store, b"ticket"),
            Some(b"state".to_vec())
        );
        assert_eq!(store.get(b"ticket"), None);
        assert!(store.can_cache());
    }

    #[test]
    fn stream_pull_serves_partial_reads() {
        let raw = Fifo::new();
        let mut pull = StreamPull {
            raw: raw.clone(),
            partial: Vec::new(),
            offset: 0,
            deadline: Arc::new(Mutex::new(None)),
        };
        raw.post(vec![1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(pull.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(pull.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [3, 4]);
        let mut rest = [0u8; 8];
        assert_eq!(pull.read(&mut rest).unwrap(), 1);
        assert_eq!(rest[0], 5);

        // a closed fifo reads as end of stream
        raw.close();
        assert_eq!(pull.read(&mut rest).unwrap(), 0);
    }
}
