// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Relay connectivity.
//!
//! [`RelayTransport`] / [`RelayLink`] abstract one framed connection to one
//! relay; [`WsTransport`] is the WebSocket implementation.  The
//! [`RelaySupervisor`] runs a long-lived subscription loop per relay with
//! exponential-backoff reconnection, tracks per-relay health, and fans
//! publishes out to every live relay in parallel.
//!
//! [`MockRelayNetwork`] is an in-process fake used by the test suites.

mod client;
mod error;
mod mock;
mod supervisor;

pub use client::{RelayLink, RelayTransport, WsTransport};
pub use error::RelayError;
pub use mock::MockRelayNetwork;
pub use supervisor::{
    IncomingEvent, PublishOutcome, RelayHealthSnapshot, RelaySupervisor, SupervisorConfig,
};
