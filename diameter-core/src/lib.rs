// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Protocol-independent building blocks for the Diameter daemon: the event
//! fifo exchanged between pipeline stages, endpoint bookkeeping, the message
//! header codec, and the configuration model.

pub mod config;
pub mod endpoint;
pub mod event;
pub mod fifo;
pub mod message;

pub use config::Config;
pub use endpoint::{EndpointSet, EpFlags};
pub use event::Event;
pub use fifo::Fifo;
pub use message::Message;
