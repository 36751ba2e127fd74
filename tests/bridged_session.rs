//! Bridged sessions with OpenSSL behind the bridge

mod common;

use common::{
    client_config, establish, pattern, receive_until_closed, server_config, transfer,
    OpensslEngine,
};
use nbtls::bridge::{BridgedSession, BRIDGE_BUFFER_SIZE};
use nbtls::session::{MemoryPipe, PipeEnd};
use nbtls::{Session, SessionResult, SessionState};

type Bridged = BridgedSession<OpensslEngine, PipeEnd>;

fn bridged(config: &nbtls::tls::TlsConfig, transport: PipeEnd) -> Bridged {
    let mut session = BridgedSession::new(OpensslEngine::new(config));
    if let Some(name) = config.servername() {
        session.set_peer_name(name).unwrap();
    }
    session.set_transport(transport).unwrap();
    session
}

#[test]
fn test_bridged_pair_exchange() {
    let (a, b) = MemoryPipe::pair();
    let mut client = bridged(&client_config(), a);
    let mut server = bridged(&server_config(), b);
    establish(&mut client, &mut server, 50);

    let data = pattern(70_000);
    assert_eq!(transfer(&mut client, &mut server, &data, 4096, 10_000), data);
    assert_eq!(transfer(&mut server, &mut client, b"done", 64, 100), b"done");
}

#[test]
fn test_send_is_limited_by_bridge_buffer() {
    let (a, b) = MemoryPipe::pair();
    let mut client = bridged(&client_config(), a);
    let mut server = bridged(&server_config(), b);
    establish(&mut client, &mut server, 50);

    let data = pattern(BRIDGE_BUFFER_SIZE * 3);
    let (result, n) = client.send(&data);
    assert_eq!(result, SessionResult::Success);
    assert_eq!(n, BRIDGE_BUFFER_SIZE);
}

#[test]
fn test_small_receive_buffer_loses_nothing() {
    let (a, b) = MemoryPipe::pair();
    let mut client = bridged(&client_config(), a);
    let mut server = bridged(&server_config(), b);
    establish(&mut client, &mut server, 50);

    let data = pattern(10_000);
    assert_eq!(client.send(&data), (SessionResult::Success, data.len()));

    let mut received = Vec::new();
    let mut buf = [0u8; 100];
    let (result, n) = server.receive(&mut buf);
    assert_eq!(result, SessionResult::Success);
    received.extend_from_slice(&buf[..n]);
    assert!(server.buffered_plaintext() > 0);

    while received.len() < data.len() {
        let (result, n) = server.receive(&mut buf);
        assert!(!result.is_failed());
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, data);
    assert_eq!(server.buffered_plaintext(), 0);
}

#[test]
fn test_bridged_interoperates_with_record_engine() {
    let (a, b) = MemoryPipe::pair();
    let mut client = bridged(&client_config(), a);
    let mut server = server_config().record_session().unwrap();
    server.set_transport(b).unwrap();

    establish(&mut client, &mut server, 50);
    let data = pattern(30_000);
    assert_eq!(transfer(&mut client, &mut server, &data, 1000, 10_000), data);
    assert_eq!(transfer(&mut server, &mut client, &data, 1000, 10_000), data);

    assert_eq!(client.close(), SessionResult::Success);
    assert_eq!(client.state(), SessionState::Closed);
    assert!(receive_until_closed(&mut server, 100).is_empty());
}

#[test]
fn test_bridged_transport_failure_is_terminal() {
    let (a, b) = MemoryPipe::pair();
    let mut client = bridged(&client_config(), a);
    let mut server = bridged(&server_config(), b);
    establish(&mut client, &mut server, 50);

    server.transport_mut().unwrap().break_pipe();
    let mut buf = [0u8; 16];
    assert_eq!(server.receive(&mut buf), (SessionResult::Failed, 0));
    assert_eq!(server.state(), SessionState::Failed);
    assert_eq!(server.send(b"x"), (SessionResult::Failed, 0));
}
