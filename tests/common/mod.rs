//! Helpers shared by the integration tests

#![allow(dead_code)]

use nbtls::bridge::{BridgeIo, BridgeStatus, ManagedEngine, BRIDGE_BUFFER_SIZE};
use nbtls::tls::TlsConfig;
use nbtls::{Session, SessionResult};
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use std::io::{self, Read, Write};

/// Route `log` output through the test harness; set RUST_LOG to see it
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn client_config() -> TlsConfig {
    TlsConfig::client()
        .servername("example.com")
        .verify_peer(false)
        .build()
        .unwrap()
}

pub fn server_config() -> TlsConfig {
    TlsConfig::server().build().unwrap()
}

/// Step both handshakes until both report success
pub fn establish<A: Session, B: Session>(client: &mut A, server: &mut B, budget: usize) {
    init_logging();
    for _ in 0..budget {
        let c = client.handshake();
        let s = server.handshake();
        assert!(!c.is_failed(), "client handshake failed: {:?}", client.last_error());
        assert!(!s.is_failed(), "server handshake failed: {:?}", server.last_error());
        if c.is_success() && s.is_success() {
            return;
        }
    }
    panic!("handshake did not complete within {} steps", budget);
}

/// Push `data` through `from` and collect it at `to`
pub fn transfer<A: Session, B: Session>(
    from: &mut A,
    to: &mut B,
    data: &[u8],
    chunk: usize,
    budget: usize,
) -> Vec<u8> {
    let mut sent = 0;
    let mut received = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; chunk];
    for _ in 0..budget {
        if sent < data.len() {
            let (result, n) = from.send(&data[sent..]);
            assert!(!result.is_failed(), "send failed: {:?}", from.last_error());
            sent += n;
        }
        let (result, n) = to.receive(&mut buf);
        assert!(!result.is_failed(), "receive failed: {:?}", to.last_error());
        received.extend_from_slice(&buf[..n]);
        if sent == data.len() && received.len() >= data.len() {
            return received;
        }
    }
    panic!(
        "transfer stalled: sent {} received {} of {}",
        sent,
        received.len(),
        data.len()
    );
}

/// Read until the peer's close is observed
pub fn receive_until_closed<S: Session>(session: &mut S, budget: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    for _ in 0..budget {
        match session.receive(&mut buf) {
            (SessionResult::Success, 0) if session.is_peer_closed() => return received,
            (SessionResult::Failed, _) => panic!("receive failed: {:?}", session.last_error()),
            (_, n) => received.extend_from_slice(&buf[..n]),
        }
    }
    panic!("peer close not observed");
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// In-memory stream for driving a bare OpenSSL connection
#[derive(Default)]
pub struct Buffers {
    pub incoming: Vec<u8>,
    pub outgoing: Vec<u8>,
}

impl Read for Buffers {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.drain(..n);
        Ok(n)
    }
}

impl Write for Buffers {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// OpenSSL driven as an opaque engine that only sees the bridge
pub struct OpensslEngine {
    ssl: Option<Ssl>,
    stream: Option<SslStream<Buffers>>,
}

impl OpensslEngine {
    pub fn new(config: &TlsConfig) -> Self {
        let mut ssl: Ssl = config.new_ssl().unwrap();
        if config.is_server() {
            ssl.set_accept_state();
        } else {
            ssl.set_connect_state();
        }
        OpensslEngine {
            ssl: Some(ssl),
            stream: None,
        }
    }

    fn stream(&mut self) -> &mut SslStream<Buffers> {
        if let Some(ssl) = self.ssl.take() {
            self.stream = Some(SslStream::new(ssl, Buffers::default()).unwrap());
        }
        self.stream.as_mut().unwrap()
    }

    fn pump_in(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
        let (status, n) = io.read(&mut buf);
        self.stream().get_mut().incoming.extend_from_slice(&buf[..n]);
        status
    }

    fn pump_out(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        loop {
            let outgoing = &mut self.stream().get_mut().outgoing;
            if outgoing.is_empty() {
                return BridgeStatus::Ok;
            }
            let (status, n) = io.write(outgoing);
            outgoing.drain(..n);
            if status != BridgeStatus::Ok {
                return status;
            }
        }
    }
}

fn waiting(input: BridgeStatus) -> BridgeStatus {
    match input {
        BridgeStatus::Ok => BridgeStatus::WouldBlock,
        other => other,
    }
}

impl ManagedEngine for OpensslEngine {
    fn set_peer_name(&mut self, name: &str) -> BridgeStatus {
        let Some(ssl) = self.ssl.as_mut() else {
            return BridgeStatus::Error(1);
        };
        match ssl.set_hostname(name) {
            Ok(()) => BridgeStatus::Ok,
            Err(_) => BridgeStatus::Error(1),
        }
    }

    fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        if let BridgeStatus::Error(code) = self.pump_out(io) {
            return BridgeStatus::Error(code);
        }
        let input = self.pump_in(io);
        let result = self.stream().do_handshake();
        if let BridgeStatus::Error(code) = self.pump_out(io) {
            return BridgeStatus::Error(code);
        }
        match result {
            Ok(()) => BridgeStatus::Ok,
            Err(e) if e.code() == ErrorCode::WANT_READ => waiting(input),
            Err(_) => BridgeStatus::Error(2),
        }
    }

    fn write(&mut self, io: &mut dyn BridgeIo, data: &[u8]) -> (BridgeStatus, usize) {
        match self.stream().ssl_write(data) {
            Ok(n) => match self.pump_out(io) {
                BridgeStatus::Error(code) => (BridgeStatus::Error(code), 0),
                _ => (BridgeStatus::Ok, n),
            },
            Err(e) if e.code() == ErrorCode::WANT_READ => (BridgeStatus::WouldBlock, 0),
            Err(_) => (BridgeStatus::Error(3), 0),
        }
    }

    fn read(&mut self, io: &mut dyn BridgeIo, out: &mut Vec<u8>, hint: usize) -> BridgeStatus {
        let input = self.pump_in(io);
        let mut chunk = vec![0u8; hint.max(1)];
        let mut closed = false;
        loop {
            match self.stream().ssl_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    closed = true;
                    break;
                }
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(_) => return BridgeStatus::Error(4),
            }
        }
        if let BridgeStatus::Error(code) = self.pump_out(io) {
            return BridgeStatus::Error(code);
        }
        if closed {
            BridgeStatus::Closed
        } else if !out.is_empty() {
            BridgeStatus::Ok
        } else {
            waiting(input)
        }
    }

    fn close(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        match self.stream().shutdown() {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::WANT_READ => {}
            Err(_) => return BridgeStatus::Error(5),
        }
        self.pump_out(io)
    }
}
