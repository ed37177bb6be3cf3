// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for connection and teardown lifecycles
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Address pairing and the bidirectional close protocol
//!   - Name registration and reuse
//!   - Isolate teardown, explicit and on drop
//!   - Wakeups of blocked receivers
//!   - Server channel shutdown

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use nexus_mailbox::{
    AddressState, Channel, Envelope, Error, Mailbox, MailboxAddress, PrivateMailboxHandler,
    Runtime, ServerChannel, SharedMailboxHandler, Wait,
};

#[test]
fn lookup_produces_a_symmetric_pair() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let _server_box = server.run(|| Mailbox::create_named("svc", SharedMailboxHandler)).unwrap();

    let address = client.run(|| {
        let inbox = Mailbox::create().unwrap();
        MailboxAddress::lookup_mailbox("svc", &inbox).unwrap()
    });
    let reply = address.reply_address().expect("paired");

    assert_eq!(reply.reply_address(), Some(address.clone()));
    assert_eq!(address.owner(), Some(client.id()));
    assert_eq!(reply.owner(), Some(server.id()));
    assert_eq!(address.state(), AddressState::Open);
    assert_eq!(reply.state(), AddressState::Open);
}

#[test]
fn close_is_idempotent_from_either_end() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let _listener = server.run(|| ServerChannel::create("svc")).unwrap();

    let channel = client.run(|| Channel::lookup("svc")).unwrap();
    let reply = channel.out_box().reply_address().unwrap();

    for _ in 0..3 {
        channel.close();
        reply.close();
    }
    assert!(!channel.is_open());
    assert_eq!(reply.state(), AddressState::Closed);
    assert_eq!(client.address_count(), 0);
    assert_eq!(server.address_count(), 0);
}

#[test]
fn concurrent_mutual_close_terminates() {
    for _ in 0..200 {
        let runtime = Runtime::new();
        let server = runtime.spawn_isolate("server");
        let client = runtime.spawn_isolate("client");
        let _server_box =
            server.run(|| Mailbox::create_named("svc", SharedMailboxHandler)).unwrap();
        let address = client.run(|| {
            let inbox = Mailbox::create().unwrap();
            MailboxAddress::lookup_mailbox("svc", &inbox).unwrap()
        });
        let reply = address.reply_address().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let closers: Vec<_> = [address.clone(), reply.clone()]
            .into_iter()
            .map(|end| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    end.close();
                })
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }
        assert_eq!(address.state(), AddressState::Closed);
        assert_eq!(reply.state(), AddressState::Closed);
    }
}

#[test]
fn names_are_unique_until_closed() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let _guard = server.enter();

    let first = Mailbox::create_named("svc", SharedMailboxHandler).unwrap();
    assert_eq!(
        Mailbox::create_named("svc", SharedMailboxHandler).unwrap_err(),
        Error::NameInUse("svc".into())
    );
    first.close();
    let second = Mailbox::create_named("svc", SharedMailboxHandler).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(runtime.names().lookup("svc").unwrap(), second);
}

#[test]
fn isolate_shutdown_disconnects_peers() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let listener = server.run(|| ServerChannel::create("svc")).unwrap();

    let channel = client.run(|| Channel::lookup("svc")).unwrap();
    let accepted = server.run(|| listener.accept()).unwrap();

    let blocked = {
        let server = server.clone();
        thread::spawn(move || {
            let _guard = server.enter();
            accepted.receive()
        })
    };

    client.shutdown();
    assert!(!client.is_alive());
    assert!(!channel.is_open());
    assert_eq!(client.mailbox_count(), 0);
    assert_eq!(client.address_count(), 0);

    match blocked.join().unwrap() {
        Err(Error::AddressClosed(_)) => {}
        other => panic!("expected AddressClosed, got {other:?}"),
    }
    assert!(client.run(|| Channel::lookup("svc")).is_err());
}

#[test]
fn dropping_an_isolate_disconnects_its_peers() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let server_box = server.run(|| Mailbox::create_named("svc", SharedMailboxHandler)).unwrap();
    let (inbox, address) = client.run(|| {
        let inbox = Mailbox::create().unwrap();
        let address = MailboxAddress::lookup_mailbox("svc", &inbox).unwrap();
        (inbox, address)
    });

    drop(server);
    assert!(!server_box.is_open());
    assert!(!address.is_open());

    client.run(|| {
        let err = address.send(Envelope::bytes(vec![1])).unwrap_err();
        assert_eq!(err, Error::AddressClosed(address.id()));
        match inbox.receive_wait(Wait::Timeout(Duration::from_secs(1))) {
            Err(Error::AddressClosed(_)) => {}
            other => panic!("expected AddressClosed, got {other:?}"),
        }
    });

    assert!(runtime.names().lookup("svc").is_err());
    let successor = runtime.spawn_isolate("successor");
    let renamed = successor.run(|| Mailbox::create_named("svc", SharedMailboxHandler)).unwrap();
    assert_eq!(runtime.names().lookup("svc").unwrap(), renamed);
}

#[test]
fn close_wakes_a_blocked_receiver() {
    let runtime = Runtime::new();
    let owner = runtime.spawn_isolate("owner");
    let mailbox = owner.run(Mailbox::create).unwrap();

    let receiver = {
        let owner = owner.clone();
        let mailbox = mailbox.clone();
        thread::spawn(move || {
            let _guard = owner.enter();
            mailbox.receive()
        })
    };

    thread::sleep(Duration::from_millis(20));
    mailbox.close();
    let result = receiver.join().unwrap();
    assert_eq!(result.unwrap_err(), Error::MailboxClosed(mailbox.id()));
}

#[test]
fn close_notice_follows_every_accepted_send() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let server_box = server.run(|| Mailbox::create_named("svc", PrivateMailboxHandler)).unwrap();
    let address = client.run(|| {
        let inbox = Mailbox::create().unwrap();
        MailboxAddress::lookup_mailbox("svc", &inbox).unwrap()
    });
    let reply = address.reply_address().expect("paired");

    let sender = {
        let client = client.clone();
        thread::spawn(move || {
            let _guard = client.enter();
            let mut sent = 0u32;
            loop {
                match address.send(Envelope::bytes(sent.to_le_bytes().to_vec())) {
                    Ok(()) => sent += 1,
                    Err(Error::AddressClosed(_)) => return sent,
                    Err(other) => panic!("unexpected send error: {other:?}"),
                }
            }
        })
    };

    server.run(|| {
        let first = server_box.receive().unwrap();
        assert_eq!(first.data().unwrap(), &0u32.to_le_bytes());
        reply.close();
    });
    let sent = sender.join().unwrap();

    server.run(|| {
        for expected in 1..sent {
            let envelope = server_box.receive_wait(Wait::NonBlocking).unwrap();
            assert_eq!(envelope.data().unwrap(), &expected.to_le_bytes());
        }
        match server_box.receive_wait(Wait::NonBlocking) {
            Err(Error::AddressClosed(_)) => {}
            other => panic!("expected AddressClosed, got {other:?}"),
        }
        assert_eq!(server_box.pending(), 0);
    });
}

#[test]
fn server_close_wakes_blocked_accept() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let listener = Arc::new(server.run(|| ServerChannel::create("svc")).unwrap());

    let acceptor = {
        let server = server.clone();
        let listener = Arc::clone(&listener);
        thread::spawn(move || {
            let _guard = server.enter();
            listener.accept()
        })
    };

    thread::sleep(Duration::from_millis(20));
    server.run(|| listener.close());
    let result = acceptor.join().unwrap();
    assert_eq!(result.unwrap_err(), Error::MailboxClosed(listener.mailbox().id()));
}

#[test]
fn server_close_only_closes_unaccepted_channels() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let listener = server.run(|| ServerChannel::create("svc")).unwrap();

    let first = client.run(|| Channel::lookup("svc")).unwrap();
    let second = client.run(|| Channel::lookup("svc")).unwrap();
    let accepted = server.run(|| listener.accept()).unwrap();
    assert_eq!(listener.pending(), 1);

    listener.close();
    assert!(!listener.is_open());
    assert!(accepted.is_open());
    assert!(first.is_open());
    assert!(!second.out_box().is_open());

    client.run(|| {
        first.send(Envelope::bytes(vec![1])).unwrap();
        assert!(matches!(
            second.send(Envelope::bytes(vec![2])),
            Err(Error::AddressClosed(_))
        ));
        assert!(matches!(second.receive_wait(Wait::NonBlocking), Err(Error::AddressClosed(_))));
    });
    server.run(|| assert_eq!(accepted.receive().unwrap().data().unwrap(), &[1]));
}

#[test]
fn receiver_closing_its_mailbox_closes_senders_lazily() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let server_box = server.run(|| Mailbox::create_named("svc", SharedMailboxHandler)).unwrap();
    let address = client.run(|| {
        let inbox = Mailbox::create().unwrap();
        MailboxAddress::lookup_mailbox("svc", &inbox).unwrap()
    });

    server.run(|| server_box.close());
    assert!(address.is_open());
    let err = client.run(|| address.send(Envelope::bytes(vec![1]))).unwrap_err();
    assert_eq!(err, Error::AddressClosed(address.id()));
    assert!(err.is_disconnect());
    assert_eq!(address.state(), AddressState::Closed);
}
