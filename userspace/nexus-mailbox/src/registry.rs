// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Name service resolving published mailbox names
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - trait NameService: register/lookup/unregister seam used by the runtime
//!   - struct NameRegistry: in-memory implementation
//!
//! A registry is owned by one `Runtime` and injected at construction time, so
//! two runtimes (or two tests) never observe each other's names.

use std::collections::HashMap;

use log::debug;
use parking_lot::Mutex;

use crate::mailbox::Mailbox;
use crate::{Error, MailboxId, Result};

/// Process-wide name table for published mailboxes.
pub trait NameService: Send + Sync {
    /// Publishes `mailbox` under `name`, failing with [`Error::NameInUse`] when taken.
    fn register(&self, name: &str, mailbox: &Mailbox) -> Result<()>;

    /// Resolves `name`, failing with [`Error::NoSuchMailbox`] when unknown.
    fn lookup(&self, name: &str) -> Result<Mailbox>;

    /// Removes `name` if it still refers to `mailbox`. Returns `true` when removed.
    fn unregister(&self, name: &str, mailbox: MailboxId) -> bool;
}

/// In-memory [`NameService`] guarded by a single lock.
#[derive(Default)]
pub struct NameRegistry {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
}

impl NameRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.mailboxes.lock().len()
    }

    /// Returns `true` when no name is registered.
    pub fn is_empty(&self) -> bool {
        self.mailboxes.lock().is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mailboxes.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl NameService for NameRegistry {
    fn register(&self, name: &str, mailbox: &Mailbox) -> Result<()> {
        let mut mailboxes = self.mailboxes.lock();
        if mailboxes.contains_key(name) {
            return Err(Error::NameInUse(name.to_string()));
        }
        mailboxes.insert(name.to_string(), mailbox.clone());
        debug!("mailbox: registered `{name}` -> {}", mailbox.id());
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Mailbox> {
        let mailboxes = self.mailboxes.lock();
        mailboxes.get(name).cloned().ok_or_else(|| Error::NoSuchMailbox(name.to_string()))
    }

    fn unregister(&self, name: &str, mailbox: MailboxId) -> bool {
        let removed = {
            let mut mailboxes = self.mailboxes.lock();
            match mailboxes.get(name) {
                Some(current) if current.id() == mailbox => mailboxes.remove(name),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!("mailbox: unregistered `{name}` ({mailbox})");
        }
        removed.is_some()
    }
}
