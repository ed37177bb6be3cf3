// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every mailbox operation.

use thiserror::Error;

use crate::envelope::CopyError;
use crate::{AddressId, MailboxId};

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by mailboxes, addresses and channels.
///
/// `AddressClosed`, `MailboxClosed`, `NoSuchMailbox` and `NameInUse` describe
/// resource lifecycle events a caller is expected to handle ("the peer went
/// away"). `IllegalState`, `AccessViolation` and `IllegalArgument` report a
/// broken calling contract and point at a bug in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The logical connection behind an address has been torn down.
    #[error("address {0} is closed")]
    AddressClosed(AddressId),
    /// The mailbox itself has been closed.
    #[error("mailbox {0} is closed")]
    MailboxClosed(MailboxId),
    /// No mailbox is registered under the requested name.
    #[error("no mailbox registered as `{0}`")]
    NoSuchMailbox(String),
    /// Another mailbox is already registered under the requested name.
    #[error("mailbox name `{0}` is already in use")]
    NameInUse(String),
    /// The operation is not legal in the current state or calling context.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Envelope contents were read outside the receiving isolate.
    #[error("access violation: {0}")]
    AccessViolation(String),
    /// An argument was out of range.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    /// The payload could not be copied into the receiving isolate.
    #[error("envelope copy failed: {0}")]
    CopyFailed(CopyError),
    /// A non-blocking wait found nothing to return.
    #[error("operation would block")]
    WouldBlock,
    /// A timed wait expired.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Returns `true` for errors that mean the other side disconnected.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::AddressClosed(_) | Self::MailboxClosed(_) | Self::NoSuchMailbox(_))
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    pub(crate) fn access_violation(reason: impl Into<String>) -> Self {
        Self::AccessViolation(reason.into())
    }
}

impl From<CopyError> for Error {
    fn from(err: CopyError) -> Self {
        Self::CopyFailed(err)
    }
}
