// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use diameter_core::{
    fifo::Fifo,
    message::{CmdFlags, Header, HEADER_LEN},
    Config, Event, Message,
};
use diameter_transport::{server::ServeCtx, Candidate, Server, TlsCreds};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> Config {
    Config::new("client.test.example", "test.example")
}

/// Configuration for the listening side; a secure server only starts when
/// its certificate carries this identity.
pub fn server_test_config() -> Config {
    Config::new("server.test.example", "test.example")
}

/// A valid-on-the-wire buffer: version 1, correct u24 length, opaque
/// remainder.
pub fn opaque_message(payload: usize) -> Vec<u8> {
    let total = HEADER_LEN + payload;
    let mut buf = vec![0u8; total];
    buf[0] = 1;
    buf[1..4].copy_from_slice(&(total as u32).to_be_bytes()[1..]);
    for (i, b) in buf[4..].iter_mut().enumerate() {
        *b = i as u8;
    }
    buf
}

pub fn request_message(hop_by_hop: u32, payload: usize) -> Message {
    let mut buf = vec![0u8; HEADER_LEN + payload];
    Header {
        version: 1,
        length: (HEADER_LEN + payload) as u32,
        flags: CmdFlags::REQUEST,
        code: 257,
        application_id: 0,
        hop_by_hop,
        end_to_end: 0xcafe,
    }
    .encode((&mut buf[..HEADER_LEN]).try_into().unwrap());
    Message::new(buf).unwrap()
}

pub fn answer_message(hop_by_hop: u32, payload: usize) -> Message {
    let mut buf = vec![0u8; HEADER_LEN + payload];
    Header {
        version: 1,
        length: (HEADER_LEN + payload) as u32,
        flags: CmdFlags::empty(),
        code: 257,
        application_id: 0,
        hop_by_hop,
        end_to_end: 0xcafe,
    }
    .encode((&mut buf[..HEADER_LEN]).try_into().unwrap());
    Message::new(buf).unwrap()
}

pub struct Harness {
    pub server: Server,
    pub candidates: Fifo<Candidate>,
    pub main_events: Fifo<Event>,
}

pub fn start_server(server: Server, config: &Config, creds: Option<Arc<TlsCreds>>) -> Harness {
    let candidates = Fifo::new();
    let main_events = Fifo::new();
    server
        .start(ServeCtx {
            candidates: candidates.clone(),
            main_events: main_events.clone(),
            creds,
            config: config.clone(),
        })
        .unwrap();
    Harness {
        server,
        candidates,
        main_events,
    }
}

pub struct TestPki {
    pub ca: CertificateDer<'static>,
    pub server_creds: Arc<TlsCreds>,
    pub client_creds: Arc<TlsCreds>,
}

/// Mint a throw-away CA plus one CA-signed leaf per side.
pub fn test_pki(server_name: &str, client_name: &str) -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "test root ca");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut leaf = |name: &str| -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
        (
            cert.der().clone(),
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
    };

    let (server_cert, server_key) = leaf(server_name);
    let (client_cert, client_key) = leaf(client_name);
    let ca = ca_cert.der().clone();

    TestPki {
        server_creds: TlsCreds::new(
            vec![server_cert],
            server_key,
            vec![ca.clone()],
            Vec::new(),
        )
        .unwrap(),
        client_creds: TlsCreds::new(
            vec![client_cert],
            client_key,
            vec![ca.clone()],
            Vec::new(),
        )
        .unwrap(),
        ca,
    }
}
