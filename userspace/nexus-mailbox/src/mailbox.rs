// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Receiving endpoint with an unbounded FIFO of envelopes
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - Mailbox::create() / create_named(): anonymous and published mailboxes
//!   - Mailbox::receive() / receive_wait(): owner-only dequeue
//!   - Mailbox::close(): idempotent teardown
//!
//! INVARIANTS:
//!   - Envelopes are delivered in enqueue order
//!   - Only threads bound to the owning isolate may receive
//!   - After close the queue is empty and every receive fails with `MailboxClosed`

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::address::MailboxAddress;
use crate::config::MailboxConfig;
use crate::envelope::Envelope;
use crate::handler::{CloseEvent, MailboxHandler, PrivateMailboxHandler};
use crate::ids::IdSource;
use crate::isolate::{Isolate, IsolateInner, RuntimeShared};
use crate::{AddressId, Error, IsolateId, MailboxId, Result, Wait};

struct MailboxState {
    queue: VecDeque<Envelope>,
    open: bool,
    disconnected: Option<Error>,
}

struct MailboxInner {
    id: MailboxId,
    name: Option<String>,
    owner: IsolateId,
    owner_ref: Weak<IsolateInner>,
    runtime: Weak<RuntimeShared>,
    ids: Arc<IdSource>,
    config: MailboxConfig,
    handler: Arc<dyn MailboxHandler>,
    open: AtomicBool,
    state: Mutex<MailboxState>,
    ready: Condvar,
}

/// Receiving endpoint owned by the isolate that created it.
///
/// `Mailbox` is a cheap handle; clones refer to the same queue.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Creates an anonymous private mailbox owned by the current isolate.
    pub fn create() -> Result<Mailbox> {
        let isolate = Isolate::require_current()?;
        let mailbox = Self::build(&isolate, None, Arc::new(PrivateMailboxHandler));
        isolate.record_mailbox(&mailbox)?;
        Ok(mailbox)
    }

    /// Creates a mailbox owned by the current isolate and publishes it under `name`.
    ///
    /// Fails with [`Error::NameInUse`] when another open mailbox holds the name.
    pub fn create_named(
        name: impl Into<String>,
        handler: impl MailboxHandler + 'static,
    ) -> Result<Mailbox> {
        let isolate = Isolate::require_current()?;
        let name = name.into();
        let mailbox = Self::build(&isolate, Some(name.clone()), Arc::new(handler));
        isolate.shared().names.register(&name, &mailbox)?;
        if let Err(err) = isolate.record_mailbox(&mailbox) {
            isolate.shared().names.unregister(&name, mailbox.id());
            return Err(err);
        }
        debug!("mailbox: {} published as `{name}` by {}", mailbox.id(), isolate.id());
        Ok(mailbox)
    }

    fn build(isolate: &Isolate, name: Option<String>, handler: Arc<dyn MailboxHandler>) -> Mailbox {
        let shared = isolate.shared();
        Mailbox {
            inner: Arc::new(MailboxInner {
                id: shared.ids.next_mailbox(),
                name,
                owner: isolate.id(),
                owner_ref: isolate.downgrade(),
                runtime: Arc::downgrade(shared),
                ids: Arc::clone(&shared.ids),
                config: shared.config.clone(),
                handler,
                open: AtomicBool::new(true),
                state: Mutex::new(MailboxState {
                    queue: VecDeque::new(),
                    open: true,
                    disconnected: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Creates an anonymous private mailbox owned by the same isolate as `self`.
    ///
    /// Used by handlers to give each client its own queue.
    pub fn create_sub_mailbox(&self) -> Result<Mailbox> {
        let owner = self.owner_isolate().ok_or_else(|| {
            Error::illegal_state(format!("owner {} of {} is gone", self.owner(), self.id()))
        })?;
        let mailbox = Self::build(&owner, None, Arc::new(PrivateMailboxHandler));
        owner.record_mailbox(&mailbox)?;
        Ok(mailbox)
    }

    /// Identifier of the mailbox.
    pub fn id(&self) -> MailboxId {
        self.inner.id
    }

    /// Published name, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The owning isolate.
    pub fn owner(&self) -> IsolateId {
        self.inner.owner
    }

    /// Returns `true` until the mailbox is closed.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Number of queued envelopes, including pending close notices.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub(crate) fn owner_isolate(&self) -> Option<Isolate> {
        self.inner.owner_ref.upgrade().map(Isolate::from_inner)
    }

    pub(crate) fn next_address_id(&self) -> AddressId {
        self.inner.ids.next_address()
    }

    /// Enqueues the receiver's copy of a stamped envelope.
    pub(crate) fn handle_message(&self, envelope: Envelope) -> Result<()> {
        let copy = envelope.copy(self.inner.config.copy_failure)?;
        drop(envelope);
        let depth = {
            let mut state = self.inner.state.lock();
            if !state.open {
                return Err(Error::MailboxClosed(self.id()));
            }
            state.queue.push_back(copy);
            state.queue.len()
        };
        self.inner.ready.notify_one();
        let threshold = self.inner.config.queue_warn_depth;
        if threshold != 0 && depth == threshold + 1 {
            warn!("mailbox: {} holds {depth} undelivered envelopes", self.id());
        }
        Ok(())
    }

    /// Runs the handler for a lookup of this mailbox.
    pub(crate) fn call_handle_open(
        &self,
        original: MailboxAddress,
        reply: &MailboxAddress,
    ) -> Result<MailboxAddress> {
        if !self.is_open() {
            return Err(Error::MailboxClosed(self.id()));
        }
        self.inner.handler.handle_open(self, original, reply)
    }

    pub(crate) fn call_handle_connected(&self, address: &MailboxAddress, reply: &MailboxAddress) {
        self.inner.handler.handle_connected(self, address, reply);
    }

    pub(crate) fn call_handle_close(&self, event: CloseEvent<'_>) -> Option<Error> {
        self.inner.handler.handle_close(event)
    }

    /// Blocks until an envelope arrives.
    pub fn receive(&self) -> Result<Envelope> {
        self.receive_wait(Wait::Blocking)
    }

    /// Dequeues the oldest envelope, waiting as described by `wait`.
    ///
    /// Close notices are consumed here and turned into handler callbacks; an
    /// error returned by the handler is reported now and again on every later
    /// call once the queue is empty.
    pub fn receive_wait(&self, wait: Wait) -> Result<Envelope> {
        self.check_owner()?;
        // A deadline past the end of `Instant` behaves like `Wait::Blocking`.
        let deadline = wait.timeout().and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.inner.state.lock();
        loop {
            if !state.open {
                return Err(Error::MailboxClosed(self.id()));
            }
            if let Some(envelope) = state.queue.pop_front() {
                if !envelope.is_close_notice() {
                    return Ok(envelope);
                }
                drop(state);
                let verdict = envelope
                    .to_address()
                    .and_then(|address| self.call_handle_close(CloseEvent::Address(address)));
                drop(envelope);
                state = self.inner.state.lock();
                if let Some(err) = verdict {
                    state.disconnected = Some(err.clone());
                    return Err(err);
                }
                continue;
            }
            if let Some(err) = &state.disconnected {
                return Err(err.clone());
            }
            match (wait, deadline) {
                (Wait::NonBlocking, _) => return Err(Error::WouldBlock),
                (Wait::Timeout(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.inner.ready.wait_until(&mut state, deadline);
                }
                _ => self.inner.ready.wait(&mut state),
            }
        }
    }

    fn check_owner(&self) -> Result<()> {
        match Isolate::current_id() {
            Some(caller) if caller == self.owner() => Ok(()),
            Some(caller) => Err(Error::illegal_state(format!(
                "{caller} cannot receive from {} owned by {}",
                self.id(),
                self.owner()
            ))),
            None => Err(Error::illegal_state("no isolate is bound to the calling thread")),
        }
    }

    /// Closes the mailbox. Idempotent.
    ///
    /// Queued envelopes are discarded, blocked receivers wake with
    /// [`Error::MailboxClosed`], the name (if any) becomes available again and
    /// the handler observes [`CloseEvent::Mailbox`].
    pub fn close(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            self.inner.open.store(false, Ordering::Release);
            core::mem::take(&mut state.queue)
        };
        self.inner.ready.notify_all();
        if !discarded.is_empty() {
            debug!("mailbox: {} closed with {} envelopes queued", self.id(), discarded.len());
        }
        drop(discarded);

        if let (Some(name), Some(runtime)) = (self.name(), self.inner.runtime.upgrade()) {
            runtime.names.unregister(name, self.id());
        }
        if let Some(owner) = self.owner_isolate() {
            owner.forget_mailbox(self.id());
        }
        debug!("mailbox: closed {}", self.id());
        self.call_handle_close(CloseEvent::Mailbox(self));
    }
}

impl PartialEq for Mailbox {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Mailbox {}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("owner", &self.owner())
            .field("open", &self.is_open())
            .finish()
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} `{name}`", self.id()),
            None => write!(f, "{}", self.id()),
        }
    }
}
