// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hand-declared subset of the Linux SCTP UAPI (`linux/sctp.h`).
//!
//! The libc crate does not carry the SCTP structures, so the ones this
//! crate needs are declared here, matching the kernel layout. One-to-one
//! (SOCK_STREAM) sockets only.

#![allow(non_camel_case_types)]

use libc::{c_int, sockaddr_storage};

pub const IPPROTO_SCTP: c_int = 132;
pub const SOL_SCTP: c_int = 132;

// socket option names
pub const SCTP_RTOINFO: c_int = 0;
pub const SCTP_ASSOCINFO: c_int = 1;
pub const SCTP_INITMSG: c_int = 2;
pub const SCTP_NODELAY: c_int = 3;
pub const SCTP_DISABLE_FRAGMENTS: c_int = 8;
pub const SCTP_EVENTS: c_int = 11;
pub const SCTP_I_WANT_MAPPED_V4_ADDR: c_int = 12;
pub const SCTP_STATUS: c_int = 14;
pub const SCTP_FRAGMENT_INTERLEAVE: c_int = 18;
pub const SCTP_AUTO_ASCONF: c_int = 30;

// setsockopt-based entry points of the bindx/connectx family
pub const SCTP_SOCKOPT_BINDX_ADD: c_int = 100;
pub const SCTP_GET_PEER_ADDRS: c_int = 108;
pub const SCTP_GET_LOCAL_ADDRS: c_int = 109;
pub const SCTP_SOCKOPT_CONNECTX: c_int = 110;

/// cmsg type carrying `sctp_sndrcvinfo`.
pub const SCTP_SNDRCV: c_int = 1;

/// Set in `msg_flags` when the payload is a notification, not user data.
pub const MSG_NOTIFICATION: c_int = 0x8000;

// notification types (sn_type); SCTP_SN_TYPE_BASE aliases SCTP_DATA_IO_EVENT
pub const SCTP_SN_TYPE_BASE: u16 = 1 << 15;
pub const SCTP_ASSOC_CHANGE: u16 = SCTP_SN_TYPE_BASE + 1;
pub const SCTP_PEER_ADDR_CHANGE: u16 = SCTP_SN_TYPE_BASE + 2;
pub const SCTP_SEND_FAILED: u16 = SCTP_SN_TYPE_BASE + 3;
pub const SCTP_REMOTE_ERROR: u16 = SCTP_SN_TYPE_BASE + 4;
pub const SCTP_SHUTDOWN_EVENT: u16 = SCTP_SN_TYPE_BASE + 5;
pub const SCTP_PARTIAL_DELIVERY_EVENT: u16 = SCTP_SN_TYPE_BASE + 6;

pub type sctp_assoc_t = i32;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_initmsg {
    pub sinit_num_ostreams: u16,
    pub sinit_max_instreams: u16,
    pub sinit_max_attempts: u16,
    pub sinit_max_init_timeo: u16,
}

/// Only the subscription flags this daemon uses are declared; the kernel
/// zero-fills the trailing events when handed a shorter structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_event_subscribe {
    pub sctp_data_io_event: u8,
    pub sctp_association_event: u8,
    pub sctp_address_event: u8,
    pub sctp_send_failure_event: u8,
    pub sctp_peer_error_event: u8,
    pub sctp_shutdown_event: u8,
    pub sctp_partial_delivery_event: u8,
    pub sctp_adaptation_layer_event: u8,
    pub sctp_authentication_event: u8,
    pub sctp_sender_dry_event: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_rtoinfo {
    pub srto_assoc_id: sctp_assoc_t,
    pub srto_initial: u32,
    pub srto_max: u32,
    pub srto_min: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_assocparams {
    pub sasoc_assoc_id: sctp_assoc_t,
    pub sasoc_asocmaxrxt: u16,
    pub sasoc_number_peer_destinations: u16,
    pub sasoc_peer_rwnd: u32,
    pub sasoc_local_rwnd: u32,
    pub sasoc_cookie_life: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_sndrcvinfo {
    pub sinfo_stream: u16,
    pub sinfo_ssn: u16,
    pub sinfo_flags: u16,
    pub sinfo_ppid: u32,
    pub sinfo_context: u32,
    pub sinfo_timetolive: u32,
    pub sinfo_tsn: u32,
    pub sinfo_cumtsn: u32,
    pub sinfo_assoc_id: sctp_assoc_t,
}

// The kernel declares the two status structures packed with 4-byte
// alignment; sockaddr_storage would otherwise push spinfo_address to an
// 8-byte boundary and shift every field after it.

#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct sctp_paddrinfo {
    pub spinfo_assoc_id: sctp_assoc_t,
    pub spinfo_address: sockaddr_storage,
    pub spinfo_state: i32,
    pub spinfo_cwnd: u32,
    pub spinfo_srtt: u32,
    pub spinfo_rto: u32,
    pub spinfo_mtu: u32,
}

#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct sctp_status {
    pub sstat_assoc_id: sctp_assoc_t,
    pub sstat_state: i32,
    pub sstat_rwnd: u32,
    pub sstat_unackdata: u16,
    pub sstat_penddata: u16,
    pub sstat_instrms: u16,
    pub sstat_outstrms: u16,
    pub sstat_fragmentation_point: u32,
    pub sstat_primary: sctp_paddrinfo,
}

/// Common prefix of every notification.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sctp_sn_header {
    pub sn_type: u16,
    pub sn_flags: u16,
    pub sn_length: u32,
}

/// Header of the buffer exchanged with SCTP_GET_LOCAL_ADDRS /
/// SCTP_GET_PEER_ADDRS; packed sockaddrs follow in place.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct sctp_getaddrs {
    pub assoc_id: sctp_assoc_t,
    pub addr_num: u32,
}
