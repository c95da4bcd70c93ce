// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;
use diameter_core::fifo::Fifo;
use diameter_transport::{server::ServeCtx, CnxError, Connection, Server, TlsError, TlsMode};
use std::{
    net::{IpAddr, Ipv4Addr},
    time::{Duration, Instant},
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[test]
fn tls_round_trip_with_checked_hostname() {
    init_tracing();
    let pki = test_pki("server.test.example", "client.test.example");
    let config = test_config();

    let server = Server::tcp(&config, 0, Some(LOOPBACK), true).unwrap();
    let harness = start_server(server, &server_test_config(), Some(pki.server_creds.clone()));
    let addr = harness.server.local_addr().unwrap();

    let client = Connection::connect_tcp(&config, addr).unwrap();
    client.set_hostname("server.test.example");
    client
        .handshake(
            TlsMode::Client,
            &pki.client_creds,
            Some(Instant::now() + Duration::from_secs(10)),
        )
        .unwrap();
    assert!(client.is_protected());

    let candidate = harness
        .candidates
        .timed_get(Instant::now() + Duration::from_secs(10))
        .unwrap();
    assert!(candidate.cnx.is_protected());

    // protected reception is already active on both sides
    let msg = opaque_message(8);
    client.send(&msg).unwrap();
    assert_eq!(
        candidate.cnx.receive(Some(Duration::from_secs(5))).unwrap(),
        msg
    );

    let reply = opaque_message(100);
    candidate.cnx.send(&reply).unwrap();
    assert_eq!(client.receive(Some(Duration::from_secs(5))).unwrap(), reply);

    client.destroy();
    candidate.cnx.destroy();
    harness.server.stop();
    assert!(harness.main_events.try_get().is_err());
}

#[test]
fn tls_hostname_mismatch_is_diagnosed() {
    init_tracing();
    let pki = test_pki("server.test.example", "client.test.example");
    let config = test_config();

    let server = Server::tcp(&config, 0, Some(LOOPBACK), true).unwrap();
    let harness = start_server(server, &server_test_config(), Some(pki.server_creds.clone()));
    let addr = harness.server.local_addr().unwrap();

    let client = Connection::connect_tcp(&config, addr).unwrap();
    client.set_hostname("other.example");
    let err = client
        .handshake(
            TlsMode::Client,
            &pki.client_creds,
            Some(Instant::now() + Duration::from_secs(10)),
        )
        .unwrap_err();
    match err {
        CnxError::Tls(TlsError::NameMismatch(name)) => assert_eq!(name, "other.example"),
        other => panic!("expected a name-mismatch diagnostic, got {other:?}"),
    }

    client.destroy();
    harness.server.stop();
}

#[test]
fn untrusted_issuer_is_diagnosed() {
    init_tracing();
    // the client trusts a different root than the one that signed the
    // server's certificate
    let pki = test_pki("server.test.example", "client.test.example");
    let other = test_pki("server.test.example", "client.test.example");
    let config = test_config();

    let server = Server::tcp(&config, 0, Some(LOOPBACK), true).unwrap();
    let harness = start_server(server, &server_test_config(), Some(pki.server_creds.clone()));
    let addr = harness.server.local_addr().unwrap();

    let client = Connection::connect_tcp(&config, addr).unwrap();
    client.set_hostname("server.test.example");
    let err = client
        .handshake(
            TlsMode::Client,
            &other.client_creds,
            Some(Instant::now() + Duration::from_secs(10)),
        )
        .unwrap_err();
    match err {
        CnxError::Tls(TlsError::UnknownIssuer) => {}
        other => panic!("expected an unknown-issuer diagnostic, got {other:?}"),
    }

    client.destroy();
    harness.server.stop();
}

#[test]
fn local_identity_must_match_certificate() {
    init_tracing();
    let pki = test_pki("node.test.example", "client.test.example");

    pki.server_creds
        .validate_local_identity("node.test.example")
        .unwrap();

    let err = pki
        .server_creds
        .validate_local_identity("stranger.example")
        .unwrap_err();
    assert!(matches!(err, TlsError::NameMismatch(_)));
}

#[test]
fn secure_server_refuses_mismatched_identity() {
    init_tracing();
    let pki = test_pki("server.test.example", "client.test.example");
    let config = test_config();

    let server = Server::tcp(&config, 0, Some(LOOPBACK), true).unwrap();
    // the announced identity is not the one the certificate carries
    let err = server
        .start(ServeCtx {
            candidates: Fifo::new(),
            main_events: Fifo::new(),
            creds: Some(pki.server_creds.clone()),
            config: test_config(),
        })
        .unwrap_err();
    assert!(matches!(err, CnxError::Tls(TlsError::NameMismatch(_))));
}
