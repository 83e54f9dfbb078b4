/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! End-to-end coverage over two real loopback sockets: spec.md §8
//! scenario 3 (parameter write propagation with subscriber exclusion).
//! The dispatcher/tree unit tests exercise this against an in-memory
//! fixture tree directly; this test drives the actual `connection.rs`
//! fan-out path (`EmberServer` bound to an OS-assigned port, two real
//! `TcpStream`s) since that is the only way to observe per-client
//! framing and the originator-exclusion invariant together.

use std::time::Duration;

use embercore::glow::{
    Command, Element, ElementCollection, ParameterAccess, ParameterContents, QualifiedParameter,
    Root, RootElement, Value,
};
use embercore::{codec, EmberServer, ServerConfig, Tree};
use futures_util::{SinkExt, StreamExt};
use rasn::types::ObjectIdentifier;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type ClientFramed = Framed<TcpStream, codec::S101Codec>;

fn fixture_tree() -> Tree {
    let mut tree = Tree::new();
    let root = tree.root();
    tree.add_parameter(
        root,
        1,
        "gain",
        ParameterAccess::ReadWrite,
        Some(Value::Integer(10)),
    );
    tree
}

async fn connect(addr: std::net::SocketAddr) -> ClientFramed {
    let stream = TcpStream::connect(addr).await.expect("connect");
    Framed::new(stream, codec::S101Codec::new())
}

async fn send_root(client: &mut ClientFramed, root: Root) {
    let bytes = embercore::glow::encode_root(&root).expect("encode");
    for frame in codec::ember_message_frames(&bytes) {
        client.send(frame).await.expect("send frame");
    }
}

/// Waits for the next decoded Ember message, ignoring keepalive
/// traffic (the server may send a keepalive-request before either
/// client has anything else to say).
async fn recv_root(client: &mut ClientFramed) -> Root {
    loop {
        match client.next().await.expect("stream closed").expect("decode error") {
            codec::CodecEvent::EmberMessage(bytes) => {
                return embercore::glow::decode_root(&bytes).expect("decode root");
            }
            codec::CodecEvent::KeepaliveRequest => {
                client
                    .send(codec::OutboundFrame::KeepaliveResponse)
                    .await
                    .expect("keepalive response");
            }
            codec::CodecEvent::KeepaliveResponse => {}
        }
    }
}

/// Asserts nothing else arrives for this client within a short
/// window — the subscriber-exclusion invariant for the originator.
async fn assert_no_further_message(client: &mut ClientFramed) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(
        outcome.is_err(),
        "expected no further message, got {outcome:?}"
    );
}

fn subscribe_request(path: &[u32]) -> Root {
    Root::from(RootElement::QualifiedParameter(QualifiedParameter {
        path: ObjectIdentifier::new(path.to_vec()).unwrap(),
        contents: None,
        children: Some(ElementCollection(vec![Element::Command(
            Command::subscribe(),
        )])),
    }))
}

fn set_value_request(path: &[u32], value: Value) -> Root {
    Root::from(RootElement::QualifiedParameter(QualifiedParameter {
        path: ObjectIdentifier::new(path.to_vec()).unwrap(),
        contents: Some(ParameterContents {
            identifier: None,
            description: None,
            value: Some(value),
            minimum: None,
            maximum: None,
            access: None,
            format: None,
            enumeration: None,
            factor: None,
            is_online: None,
            formula: None,
            step: None,
            default: None,
            r#type: None,
            stream_identifier: None,
            enum_map: None,
            stream_descriptor: None,
            schema_identifiers: None,
            template_reference: None,
        }),
        children: None,
    }))
}

fn value_of(root: &Root) -> Value {
    let Root::Elements(embercore::glow::RootElementCollection(elements)) = root else {
        panic!("expected a single-element root, got {root:?}");
    };
    assert_eq!(1, elements.len());
    match &elements[0] {
        RootElement::QualifiedParameter(q) => {
            q.contents.as_ref().and_then(|c| c.value.clone()).expect("value present")
        }
        other => panic!("expected a qualified parameter response, got {other:?}"),
    }
}

#[tokio::test]
async fn parameter_write_propagates_to_subscriber_and_excludes_originator() {
    let mut server = EmberServer::new(fixture_tree());
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_owned(),
        port: 0,
        ..Default::default()
    };
    let (addr, _events) = server.listen(config).await.expect("listen");

    let mut subscriber = connect(addr).await;
    send_root(&mut subscriber, subscribe_request(&[1])).await;

    let mut writer = connect(addr).await;
    send_root(&mut writer, set_value_request(&[1], Value::Integer(42))).await;

    // The originator gets exactly one direct response with the new value.
    let direct = recv_root(&mut writer).await;
    assert_eq!(Value::Integer(42), value_of(&direct));
    assert_no_further_message(&mut writer).await;

    // The subscriber gets the same notification, and only one copy of it.
    let fan_out = recv_root(&mut subscriber).await;
    assert_eq!(Value::Integer(42), value_of(&fan_out));
    assert_no_further_message(&mut subscriber).await;
}

#[tokio::test]
async fn two_clients_each_get_their_own_response_in_request_order() {
    let mut server = EmberServer::new(fixture_tree());
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_owned(),
        port: 0,
        ..Default::default()
    };
    let (addr, _events) = server.listen(config).await.expect("listen");

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    send_root(&mut a, set_value_request(&[1], Value::Integer(1))).await;
    let response_a = recv_root(&mut a).await;
    assert_eq!(Value::Integer(1), value_of(&response_a));

    send_root(&mut b, set_value_request(&[1], Value::Integer(2))).await;
    let response_b = recv_root(&mut b).await;
    assert_eq!(Value::Integer(2), value_of(&response_b));

    assert_no_further_message(&mut a).await;
    assert_no_further_message(&mut b).await;
}
