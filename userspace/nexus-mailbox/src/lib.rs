// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Inter-isolate message passing with copy-on-send envelopes
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests per module, integration tests under tests/
//!
//! PUBLIC API:
//!   - Runtime / Isolate: explicit context and ownership domains
//!   - Mailbox: receiving endpoint with an unbounded FIFO
//!   - MailboxAddress: paired sending capability
//!   - Envelope: byte, stream and object payloads copied into the receiver
//!   - Channel / ServerChannel: bidirectional connections on top of mailboxes
//!   - NameService / NameRegistry: published mailbox names
//!
//! DEPENDENCIES:
//!   - parking_lot: queue locks and condition variables
//!   - thiserror: error enums
//!   - log: lifecycle and diagnostic logging
//!   - serde + toml: MailboxConfig loading
//!
//! Isolates never share a live object through this crate: every envelope is
//! copied on send, and its contents are readable only from the isolate it was
//! addressed to.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::time::Duration;

mod address;
mod channel;
mod config;
mod envelope;
mod error;
mod handler;
mod ids;
mod isolate;
mod mailbox;
mod registry;
mod server_channel;

pub use address::{AddressState, MailboxAddress};
pub use channel::Channel;
pub use config::{AcceptOrder, ConfigError, CopyFailurePolicy, MailboxConfig};
pub use envelope::{ByteStream, Contents, Copiable, CopyError, Envelope, EnvelopeKind};
pub use error::{Error, Result};
pub use handler::{CloseEvent, MailboxHandler, PrivateMailboxHandler, SharedMailboxHandler};
pub use ids::{AddressId, IsolateId, MailboxId};
pub use isolate::{EnterGuard, Isolate, Runtime, RuntimeBuilder};
pub use mailbox::Mailbox;
pub use registry::{NameRegistry, NameService};
pub use server_channel::ServerChannel;

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately with [`Error::WouldBlock`] if nothing is ready.
    NonBlocking,
    /// Block until the operation completes or fail with [`Error::Timeout`].
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_accessor() {
        let wait = Wait::Timeout(Duration::from_millis(5));
        assert_eq!(wait.timeout(), Some(Duration::from_millis(5)));
        assert!(Wait::NonBlocking.is_non_blocking());
        assert!(Wait::Blocking.timeout().is_none());
    }
}
