// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;
use diameter_core::{fifo::Fifo, message::Header};
use diameter_transport::{Connection, PeerOut, Server};
use std::{
    net::{IpAddr, Ipv4Addr},
    time::{Duration, Instant},
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn connected_pair() -> (Harness, Connection, Connection) {
    let config = test_config();
    let server = Server::tcp(&config, 0, Some(LOOPBACK), false).unwrap();
    let harness = start_server(server, &config, None);
    let addr = harness.server.local_addr().unwrap();

    let client = Connection::connect_tcp(&config, addr).unwrap();
    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    candidate.cnx.start_clear(true).unwrap();
    let accepted = candidate.cnx;
    (harness, client, accepted)
}

#[test]
fn requests_are_tracked_before_transmission() {
    init_tracing();
    let (harness, client, accepted) = connected_pair();

    let events = Fifo::new();
    let peer = PeerOut::new("peer.test.example", client.clone(), events.clone(), None);

    // peer not started yet: inline sending path
    peer.send(request_message(0x1122_3344, 4)).unwrap();
    assert_eq!(peer.sent_requests().len(), 1);

    let received = accepted.receive(Some(Duration::from_secs(5))).unwrap();
    let header = Header::parse(&received).unwrap();
    assert!(header.is_request());

    // the hop-by-hop identifier was overwritten and recorded; matching the
    // "answer" frees it
    let record = peer
        .sent_requests()
        .take(header.hop_by_hop)
        .expect("request recorded under the assigned identifier");
    assert_eq!(record.msg.hop_by_hop(), header.hop_by_hop);
    assert!(peer.sent_requests().is_empty());

    client.destroy();
    accepted.destroy();
    harness.server.stop();
}

#[test]
fn out_thread_assigns_consecutive_identifiers() {
    init_tracing();
    let (harness, client, accepted) = connected_pair();

    let events = Fifo::new();
    let peer = PeerOut::new("peer.test.example", client.clone(), events.clone(), None);
    peer.start().unwrap();

    for _ in 0..3 {
        peer.send(request_message(0, 4)).unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        let received = accepted.receive(Some(Duration::from_secs(5))).unwrap();
        ids.push(Header::parse(&received).unwrap().hop_by_hop);
    }
    assert_eq!(ids[1], ids[0].wrapping_add(1));
    assert_eq!(ids[2], ids[1].wrapping_add(1));

    // all three are unanswered, under distinct identifiers
    assert_eq!(peer.sent_requests().len(), 3);

    peer.stop();
    client.destroy();
    accepted.destroy();
    harness.server.stop();
}

#[test]
fn answers_are_sent_but_not_tracked() {
    init_tracing();
    let (harness, client, accepted) = connected_pair();

    let events = Fifo::new();
    let peer = PeerOut::new("peer.test.example", client.clone(), events.clone(), None);

    peer.send(answer_message(0x4242_4242, 12)).unwrap();
    let received = accepted.receive(Some(Duration::from_secs(5))).unwrap();
    let header = Header::parse(&received).unwrap();
    assert!(!header.is_request());
    // answers keep their hop-by-hop identifier and leave no record
    assert_eq!(header.hop_by_hop, 0x4242_4242);
    assert!(peer.sent_requests().is_empty());

    client.destroy();
    accepted.destroy();
    harness.server.stop();
}

#[test]
fn stopped_peer_requeues_to_failover() {
    init_tracing();
    let (harness, client, accepted) = connected_pair();

    let events = Fifo::new();
    let failover = Fifo::new();
    let peer = PeerOut::new(
        "peer.test.example",
        client.clone(),
        events.clone(),
        Some(failover.clone()),
    );

    // break the link first so the send fails
    accepted.destroy();
    client.destroy();

    peer.send(request_message(7, 4)).unwrap_err();

    // the message went to the failover queue with its identifier restored
    let rescued = failover
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(rescued.hop_by_hop(), 7);
    // and the failure was surfaced to the peer state machine
    assert!(matches!(
        events.timed_get(Instant::now() + Duration::from_secs(5)),
        Ok(diameter_core::Event::CnxError)
    ));
    assert!(peer.sent_requests().is_empty());

    harness.server.stop();
}
