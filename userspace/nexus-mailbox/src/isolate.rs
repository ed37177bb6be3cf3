// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime context and isolate ownership domains
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - struct Runtime / RuntimeBuilder: explicit context holding config, ids and names
//!   - struct Isolate: ownership domain for mailboxes and addresses
//!   - struct EnterGuard: binds an isolate to the current thread
//!
//! An isolate records every mailbox it created and every address it owns.
//! `Isolate::shutdown` closes addresses first, then mailboxes, so peers always
//! observe a disconnect instead of a silent hang.

use core::cell::RefCell;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::Mutex;

use crate::address::MailboxAddress;
use crate::config::MailboxConfig;
use crate::ids::IdSource;
use crate::mailbox::Mailbox;
use crate::registry::{NameRegistry, NameService};
use crate::{AddressId, Error, IsolateId, MailboxId, Result};

pub(crate) struct RuntimeShared {
    pub(crate) config: MailboxConfig,
    pub(crate) names: Arc<dyn NameService>,
    pub(crate) ids: Arc<IdSource>,
    isolates: Mutex<HashMap<IsolateId, Weak<IsolateInner>>>,
}

impl RuntimeShared {
    pub(crate) fn isolate(&self, id: IsolateId) -> Option<Isolate> {
        // Upgrade after the lock is released; dropping the last strong
        // reference re-enters the table through `IsolateInner::drop`.
        let weak = self.isolates.lock().get(&id).cloned();
        weak.and_then(|weak| weak.upgrade()).map(|inner| Isolate { inner })
    }
}

/// Explicit context shared by a set of isolates.
///
/// Every runtime owns its own name service and id space. Cloning a runtime
/// yields another handle to the same context.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: MailboxConfig,
    names: Option<Arc<dyn NameService>>,
}

impl RuntimeBuilder {
    /// Uses `config` for every mailbox of the runtime.
    pub fn config(mut self, config: MailboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default in-memory [`NameRegistry`].
    pub fn name_service(mut self, names: Arc<dyn NameService>) -> Self {
        self.names = Some(names);
        self
    }

    /// Finishes the runtime.
    pub fn build(self) -> Runtime {
        let names = self.names.unwrap_or_else(|| Arc::new(NameRegistry::new()));
        Runtime {
            shared: Arc::new(RuntimeShared {
                config: self.config,
                names,
                ids: Arc::new(IdSource::new()),
                isolates: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Runtime {
    /// Creates a runtime with the default configuration and an empty registry.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a customised runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Creates a runtime with `config` and an empty registry.
    pub fn with_config(config: MailboxConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Configuration applied to mailboxes of this runtime.
    pub fn config(&self) -> &MailboxConfig {
        &self.shared.config
    }

    /// Name service of this runtime.
    pub fn names(&self) -> &dyn NameService {
        self.shared.names.as_ref()
    }

    /// Creates a new live isolate.
    pub fn spawn_isolate(&self, name: impl Into<String>) -> Isolate {
        let id = self.shared.ids.next_isolate();
        let inner = Arc::new(IsolateInner {
            id,
            name: name.into(),
            runtime: Arc::clone(&self.shared),
            alive: AtomicBool::new(true),
            mailboxes: Mutex::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
        });
        self.shared.isolates.lock().insert(id, Arc::downgrade(&inner));
        debug!("mailbox: spawned {id} `{}`", inner.name);
        Isolate { inner }
    }

    /// Resolves a live isolate handle by id.
    pub fn isolate(&self, id: IsolateId) -> Option<Isolate> {
        self.shared.isolate(id)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("isolates", &self.shared.isolates.lock().len())
            .finish()
    }
}

pub(crate) struct IsolateInner {
    id: IsolateId,
    name: String,
    runtime: Arc<RuntimeShared>,
    alive: AtomicBool,
    mailboxes: Mutex<HashMap<MailboxId, Mailbox>>,
    addresses: Mutex<HashMap<AddressId, MailboxAddress>>,
}

impl IsolateInner {
    /// Marks the isolate dead and empties both tables. Returns `None` when
    /// teardown already happened.
    fn take_tables(&self) -> Option<(Vec<MailboxAddress>, Vec<Mailbox>)> {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return None;
        }
        let addresses = self.addresses.lock().drain().map(|(_, address)| address).collect();
        let mailboxes = self.mailboxes.lock().drain().map(|(_, mailbox)| mailbox).collect();
        Some((addresses, mailboxes))
    }
}

/// Closes addresses first, so every peer receives a close notice, then mailboxes.
fn tear_down(addresses: Vec<MailboxAddress>, mailboxes: Vec<Mailbox>) {
    for address in &addresses {
        address.close();
    }
    for mailbox in &mailboxes {
        mailbox.close();
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        {
            let mut isolates = self.runtime.isolates.lock();
            if isolates.get(&self.id).is_some_and(|weak| weak.strong_count() == 0) {
                isolates.remove(&self.id);
            }
        }
        let Some((addresses, mailboxes)) = self.take_tables() else {
            return;
        };
        if !addresses.is_empty() || !mailboxes.is_empty() {
            debug!(
                "mailbox: {} `{}` dropped without shutdown ({} addresses, {} mailboxes)",
                self.id,
                self.name,
                addresses.len(),
                mailboxes.len()
            );
        }
        tear_down(addresses, mailboxes);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Isolate>> = const { RefCell::new(None) };
}

/// Ownership domain for mailboxes and addresses.
///
/// Code acts on behalf of an isolate while it is bound to the calling thread
/// through [`Isolate::enter`].
#[derive(Clone)]
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

/// Restores the previous thread binding when dropped.
#[must_use = "the isolate is unbound as soon as the guard is dropped"]
pub struct EnterGuard {
    previous: Option<Isolate>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The replaced handle may be the last one; drop it outside the borrow.
        let replaced =
            CURRENT.with(|current| core::mem::replace(&mut *current.borrow_mut(), previous));
        drop(replaced);
    }
}

impl Isolate {
    /// Identifier of the isolate.
    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    /// Human readable name given at spawn time.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runtime the isolate belongs to.
    pub fn runtime(&self) -> Runtime {
        Runtime { shared: Arc::clone(&self.inner.runtime) }
    }

    /// Binds the isolate to the calling thread until the guard drops.
    pub fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        EnterGuard { previous, _not_send: PhantomData }
    }

    /// Runs `f` with the isolate bound to the calling thread.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// The isolate bound to the calling thread, if any.
    pub fn current() -> Option<Isolate> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Identifier of the isolate bound to the calling thread, if any.
    pub fn current_id() -> Option<IsolateId> {
        CURRENT.with(|current| current.borrow().as_ref().map(Isolate::id))
    }

    pub(crate) fn require_current() -> Result<Isolate> {
        Self::current()
            .ok_or_else(|| Error::illegal_state("no isolate is bound to the calling thread"))
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.inner.runtime
    }

    pub(crate) fn downgrade(&self) -> Weak<IsolateInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<IsolateInner>) -> Self {
        Self { inner }
    }

    /// Returns `false` once [`Isolate::shutdown`] has started.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of mailboxes created by the isolate that are still open.
    pub fn mailbox_count(&self) -> usize {
        self.inner.mailboxes.lock().len()
    }

    /// Number of open addresses owned by the isolate.
    pub fn address_count(&self) -> usize {
        self.inner.addresses.lock().len()
    }

    pub(crate) fn record_mailbox(&self, mailbox: &Mailbox) -> Result<()> {
        let mut mailboxes = self.inner.mailboxes.lock();
        if !self.is_alive() {
            return Err(self.shut_down());
        }
        mailboxes.insert(mailbox.id(), mailbox.clone());
        Ok(())
    }

    pub(crate) fn forget_mailbox(&self, id: MailboxId) {
        let removed = self.inner.mailboxes.lock().remove(&id);
        drop(removed);
    }

    pub(crate) fn record_address(&self, address: &MailboxAddress) -> Result<()> {
        let mut addresses = self.inner.addresses.lock();
        if !self.is_alive() {
            return Err(self.shut_down());
        }
        addresses.insert(address.id(), address.clone());
        Ok(())
    }

    pub(crate) fn forget_address(&self, id: AddressId) {
        let removed = self.inner.addresses.lock().remove(&id);
        drop(removed);
    }

    fn shut_down(&self) -> Error {
        Error::illegal_state(format!("{} has been shut down", self.id()))
    }

    /// Tears the isolate down.
    ///
    /// All owned addresses are closed first, so every peer receives a close
    /// notice, then every mailbox the isolate created. Calling it again is a
    /// no-op. Dropping the last handle of a live isolate runs the same sequence.
    pub fn shutdown(&self) {
        let Some((addresses, mailboxes)) = self.inner.take_tables() else {
            return;
        };
        info!(
            "mailbox: shutting down {} `{}` ({} addresses, {} mailboxes)",
            self.id(),
            self.name(),
            addresses.len(),
            mailboxes.len()
        );
        tear_down(addresses, mailboxes);
    }
}

impl PartialEq for Isolate {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Isolate {}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}
