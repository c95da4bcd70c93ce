// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Diameter message header codec.
//!
//! Only the fixed 20-octet header is interpreted here; the AVP payload is
//! opaque to the transport core and handled by the dictionary layer.

use bitflags::bitflags;
use std::{fmt, time::Instant};

#[cfg(test)]
mod tests;

pub const DIAMETER_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;

/// Ceiling on the size of a message we accept to receive, to avoid huge
/// allocations on a trashed header. Configurable, see [`crate::Config`].
pub const DEFAULT_MSG_SIZE_MAX: u32 = 65535;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CmdFlags: u8 {
        const REQUEST = 0x80;
        const PROXYABLE = 0x40;
        const ERROR = 0x20;
        const RETRANSMIT = 0x10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("unsupported protocol version {version}")]
    Version { version: u8 },
    #[error("message length {length} outside [{HEADER_LEN}, {max}]")]
    Length { length: u32, max: u32 },
    #[error("buffer of {len} bytes does not hold a header")]
    Truncated { len: usize },
    #[error("declared length {length} does not match the {len}-byte buffer")]
    LengthMismatch { length: u32, len: usize },
}

/// Validate the first word of a message and return the declared total
/// length (header included). This is the only check the framed receivers
/// perform before allocating the reassembly buffer.
pub fn validate_prefix(prefix: [u8; 4], max: u32) -> Result<u32, HeaderError> {
    if prefix[0] != DIAMETER_VERSION {
        return Err(HeaderError::Version { version: prefix[0] });
    }
    let length = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]);
    if length < HEADER_LEN as u32 || length > max {
        return Err(HeaderError::Length { length, max });
    }
    Ok(length)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub length: u32,
    pub flags: CmdFlags,
    pub code: u32,
    pub application_id: u32,
    pub hop_by_hop: u32,
    pub end_to_end: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        if buf[0] != DIAMETER_VERSION {
            return Err(HeaderError::Version { version: buf[0] });
        }
        Ok(Self {
            version: buf[0],
            length: u32::from_be_bytes([0, buf[1], buf[2], buf[3]]),
            flags: CmdFlags::from_bits_retain(buf[4]),
            code: u32::from_be_bytes([0, buf[5], buf[6], buf[7]]),
            application_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            hop_by_hop: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            end_to_end: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = self.version;
        buf[1..4].copy_from_slice(&self.length.to_be_bytes()[1..]);
        buf[4] = self.flags.bits();
        buf[5..8].copy_from_slice(&self.code.to_be_bytes()[1..]);
        buf[8..12].copy_from_slice(&self.application_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.hop_by_hop.to_be_bytes());
        buf[16..20].copy_from_slice(&self.end_to_end.to_be_bytes());
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.flags.contains(CmdFlags::REQUEST)
    }
}

/// An encoded message moving through the send pipeline, together with the
/// timestamps the out-sender uses for its timing logs.
#[derive(Clone)]
pub struct Message {
    buf: Vec<u8>,
    /// When this message was received, for forwarded messages.
    received: Option<Instant>,
    /// When the request this message answers was received, for locally
    /// generated answers.
    request_received: Option<Instant>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        s.field("len", &self.buf.len());
        if let Ok(header) = Header::parse(&self.buf) {
            s.field("code", &header.code)
                .field("request", &header.is_request())
                .field("hop_by_hop", &header.hop_by_hop);
        }
        s.finish()
    }
}

impl Message {
    pub fn new(buf: Vec<u8>) -> Result<Self, HeaderError> {
        let header = Header::parse(&buf)?;
        if header.length as usize != buf.len() {
            return Err(HeaderError::LengthMismatch {
                length: header.length,
                len: buf.len(),
            });
        }
        Ok(Self {
            buf,
            received: None,
            request_received: None,
        })
    }

    pub fn with_received(mut self, at: Instant) -> Self {
        self.received = Some(at);
        self
    }

    pub fn with_request_received(mut self, at: Instant) -> Self {
        self.request_received = Some(at);
        self
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn header(&self) -> Header {
        Header::parse(&self.buf).expect("validated at construction")
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        CmdFlags::from_bits_retain(self.buf[4]).contains(CmdFlags::REQUEST)
    }

    #[inline]
    pub fn hop_by_hop(&self) -> u32 {
        u32::from_be_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]])
    }

    /// Overwrite the hop-by-hop identifier in place.
    #[inline]
    pub fn set_hop_by_hop(&mut self, value: u32) {
        self.buf[12..16].copy_from_slice(&value.to_be_bytes());
    }

    /// Clear the E bit (used when turning a request into a fresh answer).
    #[inline]
    pub fn clear_error_flag(&mut self) {
        self.buf[4] &= !CmdFlags::ERROR.bits();
    }

    #[inline]
    pub fn received(&self) -> Option<Instant> {
        self.received
    }

    #[inline]
    pub fn request_received(&self) -> Option<Instant> {
        self.request_received
    }
}
