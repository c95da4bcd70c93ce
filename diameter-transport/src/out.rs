// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-peer outbound pump.
//!
//! While a peer is open, one thread pulls from its `tosend` queue and
//! transmits. Requests get a fresh hop-by-hop identifier and are recorded
//! in the sent-request table *before* the bytes hit the wire, so an answer
//! can never race its own bookkeeping. When the peer is not started the
//! same sending primitive runs inline on the caller's thread.

use crate::cnx::{CnxError, Connection};
use diameter_core::{fifo::Fifo, Event, Message};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};
use tracing::{debug, info, warn};

/// A request awaiting its answer.
#[derive(Debug)]
pub struct SentRequest {
    pub msg: Message,
    pub sent_at: Instant,
}

/// Requests in flight on one peer link, keyed by hop-by-hop identifier.
#[derive(Debug, Default)]
pub struct SentRequests {
    map: Mutex<BTreeMap<u32, SentRequest>>,
}

impl SentRequests {
    /// Record a request. A colliding identifier means the previous request
    /// with that id is still unanswered; the caller must abort the send.
    /// The rejected record is handed back.
    pub fn insert(&self, hop_by_hop: u32, record: SentRequest) -> Result<(), SentRequest> {
        let mut map = self.map.lock();
        if map.contains_key(&hop_by_hop) {
            return Err(record);
        }
        map.insert(hop_by_hop, record);
        Ok(())
    }

    /// Match an answer: remove and return the request record.
    pub fn take(&self, hop_by_hop: u32) -> Option<SentRequest> {
        self.map.lock().remove(&hop_by_hop)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// The sending half of a peer: its connection, queue, hop-by-hop counter,
/// and in-flight request table.
pub struct PeerOut {
    peer_id: String,
    cnx: Connection,
    tosend: Fifo<Message>,
    /// The peer's event queue; send failures surface here.
    events: Fifo<Event>,
    /// Next hop-by-hop identifier, under the peer's lock.
    hbh: Mutex<u32>,
    sent: SentRequests,
    /// Where messages go when this link cannot take them (failover
    /// routing). Without one they are dropped.
    failover: Option<Fifo<Message>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl PeerOut {
    pub fn new(
        peer_id: impl Into<String>,
        cnx: Connection,
        events: Fifo<Event>,
        failover: Option<Fifo<Message>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.into(),
            cnx,
            tosend: Fifo::new(),
            events,
            hbh: Mutex::new(rand::rng().random()),
            sent: SentRequests::default(),
            failover,
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.cnx
    }

    #[inline]
    pub fn sent_requests(&self) -> &SentRequests {
        &self.sent
    }

    /// Queue a message for the out thread, or send it inline when the
    /// thread is not running (peer not yet open).
    pub fn send(&self, msg: Message) -> Result<(), CnxError> {
        if self.started.load(Ordering::Acquire) {
            if self.tosend.post(msg).is_err() {
                return Err(CnxError::Closed);
            }
            return Ok(());
        }
        self.do_send(msg)
    }

    /// Start the out thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let this = self.clone();
        let handle = thread::Builder::new()
            .name(format!("out-{}", self.peer_id))
            .spawn(move || this.run())?;
        *self.thread.lock() = Some(handle);
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the out thread and re-queue whatever it had not sent yet, so
    /// failover routing can pick it up.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.tosend.close();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        while let Ok(msg) = self.tosend.try_get() {
            self.requeue_or_drop(msg, "peer is stopping");
        }
    }

    fn run(&self) {
        loop {
            let msg = match self.tosend.get() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            if let Err(e) = self.do_send(msg) {
                debug!(peer = %self.peer_id, error = %e, "out thread pausing on send failure");
            }
        }
        debug!(peer = %self.peer_id, "out thread terminated");
    }

    /// Allocate the hop-by-hop id (for requests), record the request, log,
    /// and transmit. On failure the identifier is restored, the record
    /// dropped, and the error surfaced as a connection error event.
    fn do_send(&self, mut msg: Message) -> Result<(), CnxError> {
        let is_request = msg.is_request();
        let mut backup_hbh = 0;
        let mut assigned_hbh = 0;

        if is_request {
            backup_hbh = msg.hop_by_hop();
            let mut hbh = self.hbh.lock();
            assigned_hbh = *hbh;
            *hbh = hbh.wrapping_add(1);
            drop(hbh);
            msg.set_hop_by_hop(assigned_hbh);
        }

        let wire = msg.bytes().to_vec();
        let received = msg.received();
        let request_received = msg.request_received();
        let sent_at = Instant::now();

        // requests are recorded before the bytes hit the wire, so the
        // answer cannot arrive before its record exists
        let answer = if is_request {
            match self.sent.insert(
                assigned_hbh,
                SentRequest {
                    msg,
                    sent_at,
                },
            ) {
                Ok(()) => None,
                Err(rejected) => {
                    let mut msg = rejected.msg;
                    msg.set_hop_by_hop(backup_hbh);
                    warn!(
                        peer = %self.peer_id,
                        hop_by_hop = assigned_hbh,
                        "hop-by-hop identifier still in flight, message not sent"
                    );
                    self.requeue_or_drop(msg, "duplicate hop-by-hop identifier");
                    return Err(CnxError::InvalidState);
                }
            }
        } else {
            Some(msg)
        };

        info!(
            peer = %self.peer_id,
            cnx = %self.cnx.id(),
            len = wire.len(),
            request = is_request,
            hop_by_hop = if is_request { assigned_hbh } else { backup_hbh },
            "sent"
        );
        if let Some(received) = received {
            debug!(
                peer = %self.peer_id,
                forwarded_in = ?sent_at.duration_since(received),
                "timing"
            );
        } else if let (false, Some(request_received)) = (is_request, request_received) {
            debug!(
                peer = %self.peer_id,
                answered_in = ?sent_at.duration_since(request_received),
                "timing"
            );
        }

        match self.cnx.send(&wire) {
            Ok(()) => {
                // answers are done with; requests stay in the table until
                // their answer arrives
                drop(answer);
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "send failed");
                let msg = if is_request {
                    self.sent.take(assigned_hbh).map(|record| {
                        let mut msg = record.msg;
                        msg.set_hop_by_hop(backup_hbh);
                        msg
                    })
                } else {
                    answer
                };
                if let Some(msg) = msg {
                    self.requeue_or_drop(msg, "send failed");
                }
                let _ = self.events.post(Event::CnxError);
                Err(e)
            }
        }
    }

    fn requeue_or_drop(&self, msg: Message, reason: &str) {
        match &self.failover {
            Some(failover) if failover.post(msg.clone()).is_ok() => {
                debug!(peer = %self.peer_id, reason, "message re-queued for failover");
            }
            _ => {
                warn!(
                    peer = %self.peer_id,
                    len = msg.len(),
                    hop_by_hop = msg.hop_by_hop(),
                    reason,
                    "message dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for PeerOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerOut")
            .field("peer", &self.peer_id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("in_flight", &self.sent.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diameter_core::message::{CmdFlags, Header, HEADER_LEN};

    fn request(hbh: u32) -> Message {
        let mut buf = vec![0u8; HEADER_LEN + 4];
        Header {
            version: 1,
            length: (HEADER_LEN + 4) as u32,
            flags: CmdFlags::REQUEST,
            code: 257,
            application_id: 0,
            hop_by_hop: hbh,
            end_to_end: 1,
        }
        .encode((&mut buf[..HEADER_LEN]).try_into().unwrap());
        Message::new(buf).unwrap()
    }

    #[test]
    fn insert_rejects_in_flight_duplicates() {
        let sent = SentRequests::default();
        assert!(sent
            .insert(
                7,
                SentRequest {
                    msg: request(7),
                    sent_at: Instant::now(),
                }
            )
            .is_ok());
        // the identifier is still unanswered
        let rejected = sent.insert(
            7,
            SentRequest {
                msg: request(7),
                sent_at: Instant::now(),
            },
        );
        assert!(rejected.is_err());
        assert_eq!(sent.len(), 1);

        // once answered, the identifier is free again
        assert!(sent.take(7).is_some());
        assert!(sent.take(7).is_none());
        assert!(sent
            .insert(
                7,
                SentRequest {
                    msg: request(7),
                    sent_at: Instant::now(),
                }
            )
            .is_ok());
    }
}
