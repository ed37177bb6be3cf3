// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional connection built from an inbound mailbox and an outbound address.

use core::fmt;

use crate::address::MailboxAddress;
use crate::envelope::Envelope;
use crate::mailbox::Mailbox;
use crate::{Result, Wait};

/// One end of a bidirectional connection.
///
/// Envelopes sent through [`Channel::send`] arrive at the peer's inbound
/// mailbox; the peer's sends arrive at [`Channel::in_box`].
pub struct Channel {
    in_box: Mailbox,
    out_box: MailboxAddress,
}

impl Channel {
    pub(crate) fn new(out_box: MailboxAddress, in_box: Mailbox) -> Self {
        Self { in_box, out_box }
    }

    /// Connects to the server published as `name`.
    ///
    /// A private inbound mailbox is created for replies and closed again if
    /// the lookup fails.
    pub fn lookup(name: &str) -> Result<Channel> {
        let in_box = Mailbox::create()?;
        match MailboxAddress::lookup_mailbox(name, &in_box) {
            Ok(out_box) => Ok(Self::new(out_box, in_box)),
            Err(err) => {
                in_box.close();
                Err(err)
            }
        }
    }

    /// Sends `envelope` to the peer.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.out_box.send(envelope)
    }

    /// Blocks until the peer sends something.
    pub fn receive(&self) -> Result<Envelope> {
        self.in_box.receive()
    }

    /// Receives with the given wait behaviour.
    pub fn receive_wait(&self, wait: Wait) -> Result<Envelope> {
        self.in_box.receive_wait(wait)
    }

    /// Closes both halves. Idempotent.
    pub fn close(&self) {
        if self.out_box.is_open() {
            self.out_box.close();
        }
        if self.in_box.is_open() {
            self.in_box.close();
        }
    }

    /// Returns `true` while both halves are open.
    pub fn is_open(&self) -> bool {
        self.out_box.is_open() && self.in_box.is_open()
    }

    /// The inbound mailbox.
    pub fn in_box(&self) -> &Mailbox {
        &self.in_box
    }

    /// The outbound address.
    pub fn out_box(&self) -> &MailboxAddress {
        &self.out_box
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("in_box", &self.in_box.id())
            .field("out_box", &self.out_box.id())
            .field("open", &self.is_open())
            .finish()
    }
}
