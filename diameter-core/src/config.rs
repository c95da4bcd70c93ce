// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration consumed by the transport core.
//!
//! Parsing a configuration file into this structure is the daemon frontend's
//! job; only the model and its validation rules live here. The TLS material
//! (certificate, key, trust store) is handled by the transport crate, which
//! also checks the local certificate against [`Config::identity`].

use crate::endpoint::EndpointSet;
use crate::message::DEFAULT_MSG_SIZE_MAX;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3868;
pub const DEFAULT_TLS_PORT: u16 = 3869;
pub const DEFAULT_SCTP_STREAMS: u16 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtocolFlags {
    pub no_ip4: bool,
    pub no_ip6: bool,
    pub no_tcp: bool,
    pub no_sctp: bool,
    pub prefer_tcp: bool,
    /// TLS negotiated in-band on the standard port instead of
    /// TLS-on-connect on the dedicated port.
    pub tls_inband: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Local DiameterIdentity (an FQDN).
    pub identity: String,
    pub realm: String,
    /// Local bind endpoints; empty means wildcard.
    pub endpoints: EndpointSet,
    pub port: u16,
    pub tls_port: u16,
    /// Requested number of outbound SCTP streams.
    pub sctp_streams: u16,
    pub flags: ProtocolFlags,
    /// Watchdog timer Tw.
    pub watchdog_timer: Duration,
    /// Connection establishment timer Tc, also fed into the SCTP INIT
    /// timeout.
    pub connect_timer: Duration,
    /// How long an incoming client may take to complete its handshake.
    pub incoming_timeout: Duration,
    pub msg_size_max: u32,
}

impl Config {
    pub fn new(identity: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            realm: realm.into(),
            endpoints: EndpointSet::new(),
            port: DEFAULT_PORT,
            tls_port: DEFAULT_TLS_PORT,
            sctp_streams: DEFAULT_SCTP_STREAMS,
            flags: ProtocolFlags::default(),
            watchdog_timer: Duration::from_secs(30),
            connect_timer: Duration::from_secs(30),
            incoming_timeout: Duration::from_secs(20),
            msg_size_max: DEFAULT_MSG_SIZE_MAX,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.realm.is_empty() {
            return Err(ConfigError::MissingRealm);
        }
        if self.flags.no_ip4 && self.flags.no_ip6 {
            return Err(ConfigError::NoAddressFamily);
        }
        if self.flags.no_tcp && self.flags.no_sctp {
            return Err(ConfigError::NoTransport);
        }
        if self.sctp_streams == 0 {
            return Err(ConfigError::NoStreams);
        }
        // SCTP retransmission tuning derives Tw/2 - 1 from this value
        if self.watchdog_timer < Duration::from_secs(6) {
            return Err(ConfigError::WatchdogTooShort {
                secs: self.watchdog_timer.as_secs(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("local identity is not set")]
    MissingIdentity,
    #[error("local realm is not set")]
    MissingRealm,
    #[error("both address families are disabled")]
    NoAddressFamily,
    #[error("both transport protocols are disabled")]
    NoTransport,
    #[error("at least one SCTP stream is required")]
    NoStreams,
    #[error("watchdog timer of {secs}s is below the 6s minimum")]
    WatchdogTooShort { secs: u64 },
}
