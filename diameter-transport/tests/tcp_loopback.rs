// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;
use diameter_transport::{Connection, RecvError, Server};
use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, TcpStream},
    time::{Duration, Instant},
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[test]
fn tcp_loopback_round_trip() {
    init_tracing();
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
    client.start_clear(true).unwrap();

    // `01 00 00 1C` + 24 opaque bytes
    let msg = opaque_message(8);
    assert_eq!(msg.len(), 28);
    client.send(&msg).unwrap();
    let received = candidate
        .cnx
        .receive(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(received, msg);

    // and the other direction
    let reply = opaque_message(44);
    candidate.cnx.send(&reply).unwrap();
    assert_eq!(
        client.receive(Some(Duration::from_secs(5))).unwrap(),
        reply
    );

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
    // nothing fatal was signalled
    assert!(harness.main_events.try_get().is_err());
}

#[test]
fn several_messages_stay_in_order() {
    init_tracing();
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

    let messages: Vec<_> = (0..20).map(|i| opaque_message(i * 7)).collect();
    for msg in &messages {
        client.send(msg).unwrap();
    }
    for msg in &messages {
        let received = candidate
            .cnx
            .receive(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(&received, msg);
    }

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn oversize_length_is_rejected() {
    init_tracing();
    let config = test_config();
    let server = Server::tcp(&config, 0, Some(LOOPBACK), false).unwrap();
    let harness = start_server(server, &config, None);
    let addr = harness.server.local_addr().unwrap();

    let mut raw = TcpStream::connect(addr).unwrap();
    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    candidate.cnx.start_clear(true).unwrap();

    // length 16777215: no message may come out of this, only an error
    raw.write_all(&[0x01, 0xff, 0xff, 0xff]).unwrap();
    match candidate.cnx.receive(Some(Duration::from_secs(10))) {
        Err(RecvError::NotConnected) => {}
        other => panic!("expected a connection error, got {other:?}"),
    }

    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn wrong_version_is_rejected() {
    init_tracing();
    let config = test_config();
    let server = Server::tcp(&config, 0, Some(LOOPBACK), false).unwrap();
    let harness = start_server(server, &config, None);
    let addr = harness.server.local_addr().unwrap();

    let mut raw = TcpStream::connect(addr).unwrap();
    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    candidate.cnx.start_clear(true).unwrap();

    raw.write_all(&[0x02, 0x00, 0x00, 0x1c]).unwrap();
    match candidate.cnx.receive(Some(Duration::from_secs(10))) {
        Err(RecvError::NotConnected) => {}
        other => panic!("expected a connection error, got {other:?}"),
    }

    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn receive_times_out_when_idle() {
    init_tracing();
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

    let start = Instant::now();
    assert_eq!(
        candidate.cnx.receive(Some(Duration::from_millis(200))),
        Err(RecvError::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(200));

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn destroy_unblocks_and_joins_receivers() {
    init_tracing();
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
    client.start_clear(true).unwrap();

    // leave a pending event in the queue to be drained by destroy
    client.send(&opaque_message(4)).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // destroy must return with both receiver threads joined, well within
    // the two-socket-timeout bound
    let start = Instant::now();
    candidate.cnx.destroy();
    client.destroy();
    assert!(start.elapsed() < Duration::from_secs(7));

    // the queues are closed afterwards
    assert_eq!(
        candidate.cnx.receive(Some(Duration::from_millis(10))),
        Err(RecvError::Closed)
    );

    harness.server.stop();
}
