// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Listening endpoint that turns lookups into per-client channels
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! Every client lookup gets its own sub-mailbox on the server side. The
//! resulting [`Channel`] is queued once both addresses of the connection have
//! been recorded, so an accepted channel can always send immediately.

use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::address::MailboxAddress;
use crate::channel::Channel;
use crate::config::AcceptOrder;
use crate::handler::{CloseEvent, MailboxHandler};
use crate::isolate::Isolate;
use crate::mailbox::Mailbox;
use crate::{AddressId, Error, MailboxId, Result, Wait};

#[derive(Default)]
struct AcceptState {
    connecting: HashMap<AddressId, Channel>,
    ready: VecDeque<Channel>,
    closed: Option<MailboxId>,
}

struct AcceptQueue {
    order: AcceptOrder,
    state: Mutex<AcceptState>,
    ready: Condvar,
}

impl AcceptQueue {
    fn new(order: AcceptOrder) -> Self {
        Self { order, state: Mutex::new(AcceptState::default()), ready: Condvar::new() }
    }

    fn stage(&self, reply: AddressId, channel: Channel) -> core::result::Result<(), Channel> {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Err(channel);
        }
        state.connecting.insert(reply, channel);
        Ok(())
    }

    fn promote(&self, reply: AddressId) {
        {
            let mut state = self.state.lock();
            let Some(channel) = state.connecting.remove(&reply) else {
                return;
            };
            state.ready.push_back(channel);
        }
        self.ready.notify_one();
    }

    fn abandon(&self, reply: AddressId) {
        let channel = self.state.lock().connecting.remove(&reply);
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn pop(&self, wait: Wait) -> Result<Channel> {
        // A deadline past the end of `Instant` behaves like `Wait::Blocking`.
        let deadline = wait.timeout().and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state.lock();
        loop {
            if let Some(id) = state.closed {
                return Err(Error::MailboxClosed(id));
            }
            let next = match self.order {
                AcceptOrder::Fifo => state.ready.pop_front(),
                AcceptOrder::Lifo => state.ready.pop_back(),
            };
            if let Some(channel) = next {
                return Ok(channel);
            }
            match (wait, deadline) {
                (Wait::NonBlocking, _) => return Err(Error::WouldBlock),
                (Wait::Timeout(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.ready.wait_until(&mut state, deadline);
                }
                _ => self.ready.wait(&mut state),
            }
        }
    }

    fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    fn close(&self, id: MailboxId) {
        let pending: Vec<Channel> = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(id);
            let connecting = core::mem::take(&mut state.connecting).into_values();
            let ready = core::mem::take(&mut state.ready);
            connecting.chain(ready).collect()
        };
        self.ready.notify_all();
        if !pending.is_empty() {
            debug!("mailbox: {id} closed with {} unaccepted channels", pending.len());
        }
        for channel in &pending {
            channel.close();
        }
    }
}

struct ConnectionHandler {
    queue: Arc<AcceptQueue>,
}

impl MailboxHandler for ConnectionHandler {
    fn handle_open(
        &self,
        mailbox: &Mailbox,
        _original: MailboxAddress,
        reply: &MailboxAddress,
    ) -> Result<MailboxAddress> {
        let in_box = mailbox.create_sub_mailbox()?;
        let address = MailboxAddress::new(&in_box);
        if let Err(channel) = self.queue.stage(reply.id(), Channel::new(reply.clone(), in_box)) {
            channel.close();
            return Err(Error::MailboxClosed(mailbox.id()));
        }
        Ok(address)
    }

    fn handle_connected(
        &self,
        _mailbox: &Mailbox,
        _address: &MailboxAddress,
        reply: &MailboxAddress,
    ) {
        self.queue.promote(reply.id());
    }

    fn handle_close(&self, event: CloseEvent<'_>) -> Option<Error> {
        match event {
            CloseEvent::Address(reply) => self.queue.abandon(reply.id()),
            CloseEvent::Mailbox(mailbox) => self.queue.close(mailbox.id()),
        }
        None
    }
}

/// Named endpoint accepting [`Channel`] connections.
pub struct ServerChannel {
    server_box: Mailbox,
    queue: Arc<AcceptQueue>,
}

impl ServerChannel {
    /// Publishes a server under `name`, owned by the current isolate.
    pub fn create(name: &str) -> Result<ServerChannel> {
        let isolate = Isolate::require_current()?;
        let queue = Arc::new(AcceptQueue::new(isolate.shared().config.accept_order));
        let handler = ConnectionHandler { queue: Arc::clone(&queue) };
        let server_box = Mailbox::create_named(name, handler)?;
        Ok(Self { server_box, queue })
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        self.server_box.name().unwrap_or_default()
    }

    /// The underlying named mailbox.
    pub fn mailbox(&self) -> &Mailbox {
        &self.server_box
    }

    /// Blocks until a client connects.
    pub fn accept(&self) -> Result<Channel> {
        self.accept_wait(Wait::Blocking)
    }

    /// Accepts with the given wait behaviour.
    ///
    /// Fails with [`Error::MailboxClosed`] once the server has been closed,
    /// including for callers already blocked here.
    pub fn accept_wait(&self, wait: Wait) -> Result<Channel> {
        let channel = self.queue.pop(wait)?;
        debug!("mailbox: `{}` accepted {:?}", self.name(), channel);
        Ok(channel)
    }

    /// Number of connected channels waiting for `accept`.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` until the server is closed.
    pub fn is_open(&self) -> bool {
        self.server_box.is_open()
    }

    /// Closes the server. Idempotent.
    ///
    /// The name becomes available again, blocked `accept` calls fail and
    /// channels that were never accepted are closed. Accepted channels stay open.
    pub fn close(&self) {
        self.server_box.close();
    }
}

impl fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChannel")
            .field("name", &self.name())
            .field("mailbox", &self.server_box.id())
            .field("pending", &self.pending())
            .finish()
    }
}
