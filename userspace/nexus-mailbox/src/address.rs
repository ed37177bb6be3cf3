// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sending capability to a mailbox, paired with a reply address
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - MailboxAddress::lookup_mailbox(): resolve a name into an owned address pair
//!   - MailboxAddress::send(): stamp, copy and enqueue an envelope
//!   - MailboxAddress::close(): close this end and its paired address
//!
//! LOCKING:
//!   - An address never holds its own lock while taking another address's lock
//!   - Lock order is address slot, then mailbox state or isolate table
//!   - Handlers never run with an address lock held
//!
//! Paired addresses refer to each other weakly so that a pair never keeps
//! itself alive; the owning isolates hold the strong references.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::handler::CloseEvent;
use crate::isolate::{Isolate, IsolateInner};
use crate::mailbox::Mailbox;
use crate::{AddressId, Error, IsolateId, Result};

const UNOWNED: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of a [`MailboxAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    /// Created by a handler, not yet bound to an owner.
    Unowned,
    /// Bound to its owner and usable for sending.
    Open,
    /// Closed; terminal.
    Closed,
}

struct AddressSlot {
    mailbox: Option<Mailbox>,
    owner: Weak<IsolateInner>,
}

struct AddressInner {
    id: AddressId,
    state: AtomicU8,
    owner: OnceLock<IsolateId>,
    other: OnceLock<Weak<AddressInner>>,
    slot: Mutex<AddressSlot>,
}

/// Capability to send envelopes to one mailbox.
///
/// Addresses are created in pairs by [`MailboxAddress::lookup_mailbox`]: the
/// client owns the address to the server mailbox and the server owns the
/// reply address to the client's mailbox. Closing either end closes both.
#[derive(Clone)]
pub struct MailboxAddress {
    inner: Arc<AddressInner>,
}

impl MailboxAddress {
    /// Creates an unowned address to `mailbox`.
    ///
    /// Handlers use this to hand out addresses to sub-mailboxes from
    /// [`crate::MailboxHandler::handle_open`].
    pub fn new(mailbox: &Mailbox) -> MailboxAddress {
        MailboxAddress {
            inner: Arc::new(AddressInner {
                id: mailbox.next_address_id(),
                state: AtomicU8::new(UNOWNED),
                owner: OnceLock::new(),
                other: OnceLock::new(),
                slot: Mutex::new(AddressSlot {
                    mailbox: Some(mailbox.clone()),
                    owner: Weak::new(),
                }),
            }),
        }
    }

    /// Looks up the mailbox published as `name` and connects to it.
    ///
    /// Replies from the server are delivered to `reply_mailbox`. The returned
    /// address is owned by the calling isolate; the paired reply address is
    /// owned by the server mailbox's isolate.
    pub fn lookup_mailbox(name: &str, reply_mailbox: &Mailbox) -> Result<MailboxAddress> {
        let caller = Isolate::require_current()?;
        let target = caller.shared().names.lookup(name)?;
        let server =
            target.owner_isolate().ok_or_else(|| Error::NoSuchMailbox(name.to_string()))?;

        let reply = MailboxAddress::new(reply_mailbox);
        let starting = MailboxAddress::new(&target);
        let address = target.call_handle_open(starting, &reply)?;

        if let Err(err) = address.record(&caller, &reply) {
            target.call_handle_close(CloseEvent::Address(&reply));
            return Err(err);
        }
        if let Err(err) = reply.record(&server, &address) {
            address.close();
            target.call_handle_close(CloseEvent::Address(&reply));
            return Err(err);
        }
        target.call_handle_connected(&address, &reply);
        debug!(
            "mailbox: {} connected to `{name}` via {} (reply {})",
            caller.id(),
            address.id(),
            reply.id()
        );
        Ok(address)
    }

    /// Binds an unowned address to `owner` and pairs it with `other`.
    pub(crate) fn record(&self, owner: &Isolate, other: &MailboxAddress) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        if self.state() != AddressState::Unowned {
            return Err(Error::illegal_state(format!(
                "{} is already {:?}",
                self.id(),
                self.state()
            )));
        }
        owner.record_address(self)?;
        // Both cells are only ever set here, under the slot lock, while unowned.
        let _ = self.inner.owner.set(owner.id());
        let _ = self.inner.other.set(Arc::downgrade(&other.inner));
        slot.owner = owner.downgrade();
        self.inner.state.store(OPEN, Ordering::Release);
        Ok(())
    }

    /// Identifier of the address.
    pub fn id(&self) -> AddressId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AddressState {
        match self.inner.state.load(Ordering::Acquire) {
            UNOWNED => AddressState::Unowned,
            OPEN => AddressState::Open,
            _ => AddressState::Closed,
        }
    }

    /// Returns `true` while the address is open. Reads without locking.
    pub fn is_open(&self) -> bool {
        self.state() == AddressState::Open
    }

    /// The owning isolate, or `None` before the address is recorded.
    pub fn owner(&self) -> Option<IsolateId> {
        self.inner.owner.get().copied()
    }

    /// Returns `true` when the address is open and owned by `isolate`.
    pub fn is_owner(&self, isolate: IsolateId) -> bool {
        self.is_open() && self.owner() == Some(isolate)
    }

    /// The paired address used for replies, which may already be closed.
    ///
    /// Returns `None` before pairing or once the paired address has been
    /// dropped by its owner.
    pub fn reply_address(&self) -> Option<MailboxAddress> {
        self.inner
            .other
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| MailboxAddress { inner })
    }

    /// Sends `envelope` to the mailbox behind this address.
    ///
    /// The envelope is stamped with this address and with the isolate owning
    /// the reply address, then the receiver's copy is enqueued. Only the owner
    /// may send.
    pub fn send(&self, mut envelope: Envelope) -> Result<()> {
        let caller = Isolate::current_id();
        let mut slot = self.inner.slot.lock();
        let state = self.state();
        let mailbox = match (state, slot.mailbox.as_ref()) {
            (AddressState::Closed, _) | (_, None) => {
                return Err(Error::AddressClosed(self.id()));
            }
            (_, Some(mailbox)) => mailbox.clone(),
        };
        if !mailbox.is_open() {
            let owner = self.clear_local(&mut slot);
            drop(slot);
            self.forget_in(owner);
            return Err(Error::AddressClosed(self.id()));
        }
        if state == AddressState::Unowned {
            return Err(Error::illegal_state(format!(
                "{} is not bound to an owner",
                self.id()
            )));
        }
        if self.owner() != caller {
            return Err(Error::illegal_state(format!(
                "{} is owned by {:?}, not by the calling isolate {:?}",
                self.id(),
                self.owner(),
                caller
            )));
        }

        let receiver = self
            .reply_address()
            .and_then(|reply| reply.owner())
            .unwrap_or_else(|| mailbox.owner());
        envelope.stamp(self.clone(), receiver)?;
        trace!("mailbox: {} -> {} ({:?})", self.id(), mailbox.id(), envelope.kind());
        // Enqueued under the slot lock: a close either waits for this envelope
        // or makes the send fail, so its notice is always last.
        match mailbox.handle_message(envelope) {
            Err(Error::MailboxClosed(_)) => {
                let owner = self.clear_local(&mut slot);
                drop(slot);
                self.forget_in(owner);
                Err(Error::AddressClosed(self.id()))
            }
            result => result,
        }
    }

    /// Closes the address and its paired address. Idempotent.
    ///
    /// A close notice is queued on the destination mailbox before the address
    /// is released, so the receiver observes the disconnect after every
    /// envelope sent through this address.
    pub fn close(&self) {
        let owner = {
            let mut slot = self.inner.slot.lock();
            if self.state() != AddressState::Open {
                return;
            }
            if let Some(mailbox) = slot.mailbox.clone() {
                let mut notice = Envelope::close_notice();
                if notice.stamp(self.clone(), mailbox.owner()).is_ok() {
                    if let Err(err) = mailbox.handle_message(notice) {
                        trace!("mailbox: close notice for {} dropped: {err}", self.id());
                    }
                }
            }
            self.clear_local(&mut slot)
        };
        self.forget_in(owner);
        debug!("mailbox: closed {}", self.id());

        if let Some(peer) = self.reply_address() {
            if peer.is_open() {
                peer.close();
            }
        }
    }

    /// Marks the address closed and detaches it from its owner. Returns the
    /// former owner so the caller can update its table once the slot lock is
    /// released.
    fn clear_local(&self, slot: &mut AddressSlot) -> Weak<IsolateInner> {
        if self.state() == AddressState::Closed {
            return Weak::new();
        }
        self.inner.state.store(CLOSED, Ordering::Release);
        slot.mailbox = None;
        core::mem::take(&mut slot.owner)
    }

    // Never called with the slot lock held: the upgraded handle may be the
    // owner's last one, and dropping it tears the isolate down.
    fn forget_in(&self, owner: Weak<IsolateInner>) {
        if let Some(owner) = owner.upgrade() {
            Isolate::from_inner(owner).forget_address(self.id());
        }
    }
}

impl PartialEq for MailboxAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for MailboxAddress {}

impl Hash for MailboxAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxAddress")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("owner", &self.owner())
            .finish()
    }
}

impl fmt::Display for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id(), self.state())
    }
}
