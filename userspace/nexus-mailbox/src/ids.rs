// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opaque identifiers for isolates, mailboxes and addresses.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Exposes the raw numeric value.
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies an isolate within one runtime.
    IsolateId,
    "isolate"
);
define_id!(
    /// Identifies a mailbox within one runtime.
    MailboxId,
    "mbox"
);
define_id!(
    /// Identifies a mailbox address within one runtime.
    AddressId,
    "addr"
);

/// Monotonic id source owned by a runtime.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub(crate) const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub(crate) fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-runtime allocators, shared with every mailbox so addresses can be
/// minted without reaching back into the runtime.
#[derive(Debug)]
pub(crate) struct IdSource {
    isolates: IdAllocator,
    mailboxes: IdAllocator,
    addresses: IdAllocator,
}

impl IdSource {
    pub(crate) const fn new() -> Self {
        Self {
            isolates: IdAllocator::new(),
            mailboxes: IdAllocator::new(),
            addresses: IdAllocator::new(),
        }
    }

    pub(crate) fn next_isolate(&self) -> IsolateId {
        IsolateId(self.isolates.next_raw())
    }

    pub(crate) fn next_mailbox(&self) -> MailboxId {
        MailboxId(self.mailboxes.next_raw())
    }

    pub(crate) fn next_address(&self) -> AddressId {
        AddressId(self.addresses.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_allocated_independently() {
        let ids = IdSource::new();
        assert_eq!(ids.next_isolate(), IsolateId::from_raw(1));
        assert_eq!(ids.next_mailbox(), MailboxId::from_raw(1));
        assert_eq!(ids.next_mailbox(), MailboxId::from_raw(2));
        assert_eq!(ids.next_address(), AddressId::from_raw(1));
    }

    #[test]
    fn allocator_is_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.next_raw();
        let b = ids.next_raw();
        assert!(b > a);
    }

    #[test]
    fn display_uses_prefix() {
        assert_eq!(MailboxId::from_raw(3).to_string(), "mbox#3");
        assert_eq!(IsolateId::from_raw(9).to_string(), "isolate#9");
    }
}
