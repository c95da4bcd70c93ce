// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! SCTP end-to-end scenarios. These probe for kernel SCTP support at
//! runtime and skip (loudly) when the protocol is unavailable, so the
//! suite passes in containers without the SCTP module.

mod common;

use common::*;
use diameter_core::{Config, EndpointSet, EpFlags};
use diameter_transport::{sctp, Connection, Server, TlsMode};
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

fn sctp_config(streams: u16) -> Config {
    let mut config = test_config();
    // v4 loopback only, to keep the test independent of v6 routing
    config.flags.no_ip6 = true;
    config.sctp_streams = streams;
    config
}

macro_rules! require_sctp {
    () => {
        if !sctp::is_supported() {
            eprintln!("skipping: this kernel has no SCTP support");
            return;
        }
    };
}

#[test]
fn sctp_loopback_round_trip() {
    init_tracing();
    require_sctp!();

    let config = sctp_config(4);
    let server = Server::sctp(&config, 0, false).unwrap();
    let harness = start_server(server, &config, None);
    let port = harness.server.local_addr().unwrap().port();

    let mut endpoints = EndpointSet::new();
    endpoints.add_merge(
        SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        EpFlags::CONF,
    );
    let client = Connection::connect_sctp(&config, port, &endpoints).unwrap();
    assert!(client.sctp_params().str_out >= 1);

    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    candidate.cnx.start_clear(true).unwrap();
    client.start_clear(true).unwrap();

    let msg = opaque_message(16);
    client.send(&msg).unwrap();
    assert_eq!(
        candidate.cnx.receive(Some(Duration::from_secs(5))).unwrap(),
        msg
    );

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn sctp_stream_demux() {
    init_tracing();
    require_sctp!();

    let config = sctp_config(4);
    let server = Server::sctp(&config, 0, false).unwrap();
    let harness = start_server(server, &config, None);
    let port = harness.server.local_addr().unwrap().port();

    let mut endpoints = EndpointSet::new();
    endpoints.add_merge(
        SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        EpFlags::CONF,
    );
    let client = Connection::connect_sctp(&config, port, &endpoints).unwrap();

    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(5))
        .unwrap();
    candidate.cnx.start_clear(true).unwrap();

    // the round-robin selector places consecutive messages on different
    // streams; ordering is per stream only, so compare as a set
    let b1 = opaque_message(10);
    let b2 = opaque_message(21);
    client.send(&b1).unwrap();
    client.send(&b2).unwrap();

    let mut received = vec![
        candidate.cnx.receive(Some(Duration::from_secs(5))).unwrap(),
        candidate.cnx.receive(Some(Duration::from_secs(5))).unwrap(),
    ];
    received.sort_by_key(|buf| buf.len());
    let mut expected = vec![b1, b2];
    expected.sort_by_key(|buf| buf.len());
    assert_eq!(received, expected);

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
}

#[test]
fn sctp_multi_stream_tls_resumes_sessions() {
    init_tracing();
    require_sctp!();

    let pki = test_pki("server.test.example", "client.test.example");
    let config = sctp_config(4);
    let mut server_config = config.clone();
    server_config.identity = "server.test.example".to_string();

    let server = Server::sctp(&config, 0, true).unwrap();
    let harness = start_server(server, &server_config, Some(pki.server_creds.clone()));
    let port = harness.server.local_addr().unwrap().port();

    let mut endpoints = EndpointSet::new();
    endpoints.add_merge(
        SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        EpFlags::CONF,
    );
    let client = Connection::connect_sctp(&config, port, &endpoints).unwrap();
    client.set_hostname("server.test.example");
    client
        .handshake(
            TlsMode::Client,
            &pki.client_creds,
            Some(Instant::now() + Duration::from_secs(20)),
        )
        .unwrap();
    assert!(client.is_protected());

    let pairs = client.sctp_params().pairs;
    assert!(pairs > 1, "negotiation produced a single stream pair");

    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(20))
        .unwrap();
    assert!(candidate.cnx.is_protected());

    // the server-side resume store fed the abbreviated handshakes
    let store = candidate
        .cnx
        .resume_store()
        .expect("multi-stream server connection has a resume store");
    let (stores, _fetches, hits) = store.stats();
    assert!(stores >= 1, "master handshake stored no session state");
    assert!(hits >= 1, "no stream handshake resumed off the store");

    // data flows over every stream pair
    let messages: Vec<_> = (0..pairs as usize * 2)
        .map(|i| opaque_message(4 + i))
        .collect();
    for msg in &messages {
        client.send(msg).unwrap();
    }
    let mut received = Vec::new();
    for _ in &messages {
        received.push(
            candidate
                .cnx
                .receive(Some(Duration::from_secs(10)))
                .unwrap(),
        );
    }
    received.sort();
    let mut expected = messages.clone();
    expected.sort();
    assert_eq!(received, expected);

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
    assert!(harness.main_events.try_get().is_err());
}
