// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connection hooks installed on a mailbox.

use crate::address::MailboxAddress;
use crate::mailbox::Mailbox;
use crate::{Error, Result};

/// What was closed when [`MailboxHandler::handle_close`] runs.
#[derive(Debug, Clone, Copy)]
pub enum CloseEvent<'a> {
    /// A client closed its logical connection through this address.
    Address(&'a MailboxAddress),
    /// The mailbox itself was closed.
    Mailbox(&'a Mailbox),
}

/// Manages the logical connections made to one mailbox.
///
/// Handlers run on whichever thread triggered the event: `handle_open` on the
/// client performing the lookup, `handle_close` on the receiving thread (for
/// address closes) or on the closing thread (for mailbox closes). No mailbox or
/// address lock is held while a handler runs.
pub trait MailboxHandler: Send + Sync {
    /// Called once per lookup of the mailbox.
    ///
    /// `original` is a fresh unowned address to `mailbox`. The handler returns
    /// the unowned address the client will use from now on, usually `original`
    /// itself or an address of a per-client sub-mailbox.
    fn handle_open(
        &self,
        mailbox: &Mailbox,
        original: MailboxAddress,
        reply: &MailboxAddress,
    ) -> Result<MailboxAddress>;

    /// Called after both ends of a lookup have been recorded with their owners.
    ///
    /// From this point `reply` may be used to send to the client.
    fn handle_connected(
        &self,
        _mailbox: &Mailbox,
        _address: &MailboxAddress,
        _reply: &MailboxAddress,
    ) {
    }

    /// Called when a logical connection or the mailbox closes.
    ///
    /// Returning an error makes pending and future `receive` calls on the
    /// mailbox fail with it once the queue is drained.
    fn handle_close(&self, event: CloseEvent<'_>) -> Option<Error>;
}

/// Handler for published mailboxes shared by many clients.
///
/// Clients keep the address the system created, and a client going away is
/// not an error for the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMailboxHandler;

impl MailboxHandler for SharedMailboxHandler {
    fn handle_open(
        &self,
        _mailbox: &Mailbox,
        original: MailboxAddress,
        _reply: &MailboxAddress,
    ) -> Result<MailboxAddress> {
        Ok(original)
    }

    fn handle_close(&self, _event: CloseEvent<'_>) -> Option<Error> {
        None
    }
}

/// Handler for private mailboxes with a single peer.
///
/// The peer closing its address surfaces as [`Error::AddressClosed`] from
/// `receive`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrivateMailboxHandler;

impl MailboxHandler for PrivateMailboxHandler {
    fn handle_open(
        &self,
        _mailbox: &Mailbox,
        original: MailboxAddress,
        _reply: &MailboxAddress,
    ) -> Result<MailboxAddress> {
        Ok(original)
    }

    fn handle_close(&self, event: CloseEvent<'_>) -> Option<Error> {
        match event {
            CloseEvent::Address(address) => Some(Error::AddressClosed(address.id())),
            CloseEvent::Mailbox(_) => None,
        }
    }
}
