// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for request/reply traffic between isolates
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! TEST_SCENARIOS:
//!   - echo_over_named_mailbox(): lookup, send, reply through the reply address
//!   - echo_over_channels(): 1000 round trips over a Channel/ServerChannel pair
//!   - many_clients_share_one_server(): per-client sub-mailboxes keep traffic apart
//!   - client_close_ends_the_server_loop(): disconnect surfaces as AddressClosed

use std::thread;

use nexus_mailbox::{
    Channel, Envelope, Error, Mailbox, MailboxAddress, Runtime, ServerChannel,
    SharedMailboxHandler,
};

/// Echoes every byte envelope on `channel` until the peer disconnects.
fn echo_loop(channel: &Channel) -> usize {
    let mut served = 0;
    loop {
        match channel.receive() {
            Ok(envelope) => {
                let data = envelope.data().expect("byte envelope").to_vec();
                channel.send(Envelope::bytes(data)).expect("echo reply");
                served += 1;
            }
            Err(err) => {
                assert!(err.is_disconnect(), "unexpected error: {err}");
                return served;
            }
        }
    }
}

#[test]
fn echo_over_named_mailbox() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let echo = server.run(|| Mailbox::create_named("echo", SharedMailboxHandler)).unwrap();

    let server_thread = {
        let server = server.clone();
        thread::spawn(move || {
            let _guard = server.enter();
            let request = echo.receive().expect("request");
            let received = request.data().expect("bytes").to_vec();
            let received_ptr = request.data().expect("bytes").as_ptr() as usize;
            let reply = request.reply_address().expect("reply address");
            reply.send(Envelope::bytes(received.clone())).expect("reply");
            (received, received_ptr)
        })
    };

    let (reply, sent_ptr) = client.run(|| {
        let inbox = Mailbox::create().unwrap();
        let address = MailboxAddress::lookup_mailbox("echo", &inbox).unwrap();
        let payload = vec![1u8, 2, 3];
        let sent_ptr = payload.as_ptr() as usize;
        address.send(Envelope::bytes(payload)).unwrap();
        let reply = inbox.receive().unwrap();
        (reply.data().unwrap().to_vec(), sent_ptr)
    });

    let (received, received_ptr) = server_thread.join().unwrap();
    assert_eq!(received, vec![1, 2, 3]);
    assert_ne!(received_ptr, sent_ptr, "server must see its own copy");
    assert_eq!(reply, vec![1, 2, 3]);
}

#[test]
fn echo_over_channels() {
    const ROUND_TRIPS: usize = 1000;

    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let listener = server.run(|| ServerChannel::create("echo")).unwrap();

    let server_thread = {
        let server = server.clone();
        thread::spawn(move || {
            let _guard = server.enter();
            let channel = listener.accept().expect("accept");
            let served = echo_loop(&channel);
            channel.close();
            listener.close();
            served
        })
    };

    let client_thread = thread::spawn(move || {
        let _guard = client.enter();
        let channel = Channel::lookup("echo").expect("lookup");
        for i in 0..ROUND_TRIPS {
            let message = format!("message {i}").into_bytes();
            channel.send(Envelope::bytes(message.clone())).expect("send");
            let reply = channel.receive().expect("reply");
            assert_eq!(reply.data().unwrap(), message.as_slice());
        }
        channel.close();
    });

    client_thread.join().unwrap();
    assert_eq!(server_thread.join().unwrap(), ROUND_TRIPS);
    assert!(runtime.names().lookup("echo").is_err());
}

#[test]
fn many_clients_share_one_server() {
    const CLIENTS: usize = 4;
    const MESSAGES: usize = 50;

    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let listener = server.run(|| ServerChannel::create("echo")).unwrap();

    let clients: Vec<_> = (0..CLIENTS)
        .map(|n| {
            let client = runtime.spawn_isolate(format!("client-{n}"));
            thread::spawn(move || {
                let _guard = client.enter();
                let channel = Channel::lookup("echo").expect("lookup");
                for i in 0..MESSAGES {
                    let message = format!("{n}:{i}").into_bytes();
                    channel.send(Envelope::bytes(message.clone())).unwrap();
                    assert_eq!(channel.receive().unwrap().data().unwrap(), message.as_slice());
                }
                channel.close();
            })
        })
        .collect();

    let _guard = server.enter();
    let workers: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let channel = listener.accept().expect("accept");
            let server = server.clone();
            thread::spawn(move || {
                let _guard = server.enter();
                echo_loop(&channel)
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    let served: usize = workers.into_iter().map(|worker| worker.join().unwrap()).sum();
    assert_eq!(served, CLIENTS * MESSAGES);
    listener.close();
}

#[test]
fn client_close_ends_the_server_loop() {
    let runtime = Runtime::new();
    let server = runtime.spawn_isolate("server");
    let client = runtime.spawn_isolate("client");
    let listener = server.run(|| ServerChannel::create("echo")).unwrap();

    let channel = client.run(|| Channel::lookup("echo")).unwrap();
    let accepted = server.run(|| listener.accept()).unwrap();

    client.run(|| {
        channel.send(Envelope::bytes(vec![7])).unwrap();
        channel.close();
    });
    assert!(!channel.is_open());

    server.run(|| {
        assert_eq!(accepted.receive().unwrap().data().unwrap(), &[7]);
        match accepted.receive() {
            Err(Error::AddressClosed(_)) => {}
            other => panic!("expected AddressClosed, got {other:?}"),
        }
        assert!(!accepted.out_box().is_open());
        assert!(matches!(accepted.send(Envelope::bytes(vec![1])), Err(Error::AddressClosed(_))));
    });
}
