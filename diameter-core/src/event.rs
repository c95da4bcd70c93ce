// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Events exchanged between the receivers and their consumers. Payloads are
/// owned by the event; dequeuing transfers ownership.
#[derive(Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete message was received.
    MsgRecv(Vec<u8>),
    /// The connection failed. The receiver that posted this has terminated;
    /// the consumer owns the cleanup.
    CnxError,
    /// The transport reported an endpoint change (address added/removed,
    /// association restart). The payload is the raw notification.
    EpChange(Vec<u8>),
    /// Posted by the peer state machine's timers.
    Timeout,
    /// Fatal daemon-level condition; the main loop must exit.
    Terminate,
}

impl Event {
    pub const fn name(&self) -> &'static str {
        match self {
            Event::MsgRecv(_) => "MSG_RECV",
            Event::CnxError => "CNX_ERROR",
            Event::EpChange(_) => "EP_CHANGE",
            Event::Timeout => "TIMEOUT",
            Event::Terminate => "TERMINATE",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::MsgRecv(buf) => write!(f, "MsgRecv({} bytes)", buf.len()),
            Event::CnxError => write!(f, "CnxError"),
            Event::EpChange(buf) => write!(f, "EpChange({} bytes)", buf.len()),
            Event::Timeout => write!(f, "Timeout"),
            Event::Terminate => write!(f, "Terminate"),
        }
    }
}
