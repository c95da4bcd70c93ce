// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use bolero::check;

fn request(hop_by_hop: u32, payload: usize) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + payload];
    Header {
        version: DIAMETER_VERSION,
        length: (HEADER_LEN + payload) as u32,
        flags: CmdFlags::REQUEST,
        code: 257,
        application_id: 0,
        hop_by_hop,
        end_to_end: 0x1234_5678,
    }
    .encode((&mut buf[..HEADER_LEN]).try_into().unwrap());
    buf
}

#[test]
fn prefix_accepts_valid_lengths() {
    assert_eq!(validate_prefix([1, 0, 0, 0x1c], 65535), Ok(28));
    assert_eq!(validate_prefix([1, 0, 0, 20], 65535), Ok(20));
    assert_eq!(validate_prefix([1, 0, 0xff, 0xff], 65535), Ok(65535));
}

#[test]
fn prefix_rejects_bad_version() {
    assert_eq!(
        validate_prefix([2, 0, 0, 0x1c], 65535),
        Err(HeaderError::Version { version: 2 })
    );
    assert_eq!(
        validate_prefix([0, 0, 0, 0x1c], 65535),
        Err(HeaderError::Version { version: 0 })
    );
}

#[test]
fn prefix_rejects_oversize() {
    // `01 FF FF FF`: length 16777215
    assert_eq!(
        validate_prefix([1, 0xff, 0xff, 0xff], 65535),
        Err(HeaderError::Length {
            length: 16_777_215,
            max: 65535,
        })
    );
}

#[test]
fn prefix_rejects_short_frames() {
    assert_eq!(
        validate_prefix([1, 0, 0, 19], 65535),
        Err(HeaderError::Length {
            length: 19,
            max: 65535,
        })
    );
}

#[test]
fn header_round_trip() {
    check!()
        .with_type::<(u32, u32, u32, u32, u8)>()
        .cloned()
        .for_each(|(code, application_id, hop_by_hop, end_to_end, flags)| {
            let header = Header {
                version: DIAMETER_VERSION,
                length: 20,
                flags: CmdFlags::from_bits_retain(flags),
                code: code & 0x00ff_ffff,
                application_id,
                hop_by_hop,
                end_to_end,
            };
            let mut buf = [0u8; HEADER_LEN];
            header.encode(&mut buf);
            assert_eq!(Header::parse(&buf), Ok(header));
        });
}

#[test]
fn hop_by_hop_overwrite() {
    let mut msg = Message::new(request(7, 8)).unwrap();
    assert!(msg.is_request());
    assert_eq!(msg.hop_by_hop(), 7);

    msg.set_hop_by_hop(0xdead_beef);
    assert_eq!(msg.hop_by_hop(), 0xdead_beef);
    assert_eq!(msg.header().hop_by_hop, 0xdead_beef);
    // the rest of the header is untouched
    assert_eq!(msg.header().end_to_end, 0x1234_5678);
}

#[test]
fn message_rejects_length_mismatch() {
    let mut buf = request(1, 4);
    buf.push(0);
    // declared 24, actual 25
    assert_eq!(
        Message::new(buf).unwrap_err(),
        HeaderError::LengthMismatch {
            length: 24,
            len: 25,
        }
    );
}

#[test]
fn clear_error_flag_is_bitwise() {
    let mut buf = request(1, 0);
    buf[4] |= CmdFlags::ERROR.bits();
    let mut msg = Message::new(buf).unwrap();
    msg.clear_error_flag();
    assert!(!msg.header().flags.contains(CmdFlags::ERROR));
    // the R bit survives
    assert!(msg.is_request());
}
