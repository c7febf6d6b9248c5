//! Integration tests for the tunnel session.
//!
//! Each test runs a real `TunnelSession` against a fake gateway bound to
//! a loopback UDP socket in the same process. The fake gateway answers
//! the handshake and plays bus traffic; assertions look at the exact
//! datagrams exchanged.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use knx_tunnel::protocol::constants::{CEMIMessageCode, ServiceType, E_NO_MORE_CONNECTIONS};
use knx_tunnel::protocol::frame::{self, Frame, Hpai};
use knx_tunnel::protocol::services::{ConnectionHeader, TunnelingAck, TunnelingRequest};
use knx_tunnel::{ga, CemiCommand, CemiMessage, GroupAddress, KnxError, Payload, SessionPhase, TunnelConfig, TunnelSession, ValueCache};

const CHANNEL: u8 = 7;
const TEST_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-process stand-in for a KNXnet/IP gateway
struct FakeGateway {
    socket: UdpSocket,
    addr: SocketAddrV4,
}

impl FakeGateway {
    fn bind() -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("loopback socket is not IPv4");
        };
        Self { socket, addr }
    }

    fn config(&self) -> TunnelConfig {
        TunnelConfig::new(*self.addr.ip())
            .with_port(self.addr.port())
            .with_connect_timeout(Some(TEST_TIMEOUT))
            .with_read_timeout(Some(TEST_TIMEOUT))
    }

    fn recv(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 512];
        let (len, from) = self.socket.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), from)
    }

    fn expect_silence(&self) {
        self.socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 512];
        assert!(self.socket.recv_from(&mut buf).is_err(), "unexpected datagram");
        self.socket.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
    }

    /// Receive a `CONNECT_REQUEST` and answer it with `body`.
    ///
    /// Returns the request bytes and the data endpoint it announced.
    fn answer_connect(&self, service_type: ServiceType, body: &[u8]) -> (Vec<u8>, SocketAddrV4) {
        let (request, from) = self.recv();
        let frame = Frame::parse(&request).unwrap();
        assert_eq!(frame.service_type(), ServiceType::ConnectRequest);

        let data_endpoint = Hpai::parse(&frame.body()[8..16]).unwrap().socket_addr();
        self.socket.send_to(&frame::encode(service_type, body).unwrap(), from).unwrap();
        (request, data_endpoint)
    }

    /// Accept a tunnel on [`CHANNEL`]; returns the client's data endpoint.
    fn accept_connect(&self) -> SocketAddrV4 {
        let mut body = vec![CHANNEL, 0x00];
        Hpai::from(self.addr).encode_into(&mut body);
        body.extend_from_slice(&[0x04, 0x04, 0x11, 0x05]);
        self.answer_connect(ServiceType::ConnectResponse, &body).1
    }

    /// Receive a `TUNNELING_REQUEST` and decode its connection header and cEMI.
    fn recv_tunneling_request(&self) -> (Vec<u8>, ConnectionHeader, CemiMessage) {
        let (bytes, _) = self.recv();
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.service_type(), ServiceType::TunnellingRequest);

        let request = TunnelingRequest::parse(frame.body()).unwrap();
        let header = request.connection_header;
        let cemi = CemiMessage::decode(request.cemi_data).unwrap();
        (bytes, header, cemi)
    }

    /// Send bus traffic to the client as an `L_Data.ind`.
    fn send_indication(&self, to: SocketAddrV4, seq: u8, msg: CemiMessage) {
        let cemi = msg.with_message_code(CEMIMessageCode::LDataInd).encode();
        let frame = TunnelingRequest::new(ConnectionHeader::new(CHANNEL, seq), &cemi).build().unwrap();
        self.socket.send_to(&frame, to).unwrap();
    }

    fn recv_ack(&self) -> TunnelingAck {
        let (bytes, _) = self.recv();
        assert_eq!(bytes.len(), 10);
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.service_type(), ServiceType::TunnellingAck);
        TunnelingAck::parse(frame.body()).unwrap()
    }
}

/// Connect a session to `gateway`, returning it with its data endpoint.
fn connect(gateway: &FakeGateway, cache: Arc<ValueCache>) -> (TunnelSession, SocketAddrV4) {
    init_logging();
    thread::scope(|s| {
        let handle = s.spawn(|| gateway.accept_connect());
        let mut session = TunnelSession::with_cache(gateway.config(), cache);
        session.connect().unwrap();
        (session, handle.join().unwrap())
    })
}

fn cached(entries: &[(GroupAddress, &[u8])]) -> Arc<ValueCache> {
    let cache = ValueCache::new();
    for (addr, data) in entries {
        cache.set(*addr, Payload::from_slice(data).unwrap());
    }
    Arc::new(cache)
}

#[test]
fn test_connect_handshake() {
    init_logging();
    let gateway = FakeGateway::bind();

    let (session, request) = thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut body = vec![CHANNEL, 0x00];
            Hpai::from(gateway.addr).encode_into(&mut body);
            body.extend_from_slice(&[0x04, 0x04, 0x11, 0x05]);
            gateway.answer_connect(ServiceType::ConnectResponse, &body).0
        });
        let mut session = TunnelSession::new(gateway.config());
        session.connect().unwrap();
        (session, handle.join().unwrap())
    });

    assert_eq!(request.len(), 26);
    assert_eq!(request[..6], [0x06, 0x10, 0x02, 0x05, 0x00, 0x1A]);
    assert_eq!(request[6..10], [0x08, 0x01, 127, 0]);
    assert_eq!(request[14..18], [0x08, 0x01, 127, 0]);
    assert_eq!(request[22..26], [0x04, 0x04, 0x02, 0x00]);

    assert_eq!(session.phase(), SessionPhase::Connected);
    let state = session.connection_state().unwrap();
    assert_eq!(state.channel_id, CHANNEL);
    assert_eq!(state.remote_endpoint, gateway.addr);
    assert_eq!(state.local_endpoint.port(), u16::from_be_bytes([request[20], request[21]]));
}

#[test]
fn test_group_write_frames_and_sequence() {
    let gateway = FakeGateway::bind();
    let (session, _) = connect(&gateway, Arc::new(ValueCache::new()));

    session.group_write(ga!(1/2/3), &[1]).unwrap();
    let (bytes, header, _) = gateway.recv_tunneling_request();
    assert_eq!(
        bytes,
        [
            0x06, 0x10, 0x04, 0x20, 0x00, 0x15, // header, 21 bytes
            0x04, CHANNEL, 0x00, 0x00, // connection header, seq 0
            0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x81,
        ]
    );
    assert_eq!(header.sequence_counter, 0);

    session.group_write(ga!(1/2/4), &[0x0C, 0x1A]).unwrap();
    let (_, header, cemi) = gateway.recv_tunneling_request();
    assert_eq!(header.sequence_counter, 1);
    assert_eq!(cemi.command(), CemiCommand::Write);
    assert_eq!(cemi.destination(), ga!(1/2/4));
    assert_eq!(cemi.data(), &[0x0C, 0x1A]);

    let err = session.group_write(ga!(1/2/4), &[]).unwrap_err();
    assert!(matches!(err, KnxError::Cemi(_)));
}

#[test]
fn test_group_read_resolved_by_response() {
    let gateway = FakeGateway::bind();
    let (session, data_endpoint) = connect(&gateway, Arc::new(ValueCache::new()));
    let addr = ga!(1/2/4);

    let value = thread::scope(|s| {
        s.spawn(|| {
            let (_, header, cemi) = gateway.recv_tunneling_request();
            assert_eq!(header.channel_id, CHANNEL);
            assert_eq!(cemi.command(), CemiCommand::Read);
            assert_eq!(cemi.destination(), addr);

            let response = CemiMessage::group_response(addr, &[0x0C, 0x1A]).unwrap();
            gateway.send_indication(data_endpoint, 0, response);

            let ack = gateway.recv_ack();
            assert_eq!(ack.connection_header.channel_id, CHANNEL);
            assert_eq!(ack.connection_header.sequence_counter, 0);
            assert!(ack.is_ok());
        });

        session.group_read(addr, false).unwrap()
    });

    assert_eq!(value.as_slice(), &[0x0C, 0x1A]);
    assert_eq!(session.pending_reads(), 0);

    // Second read is served from the cache
    assert_eq!(session.group_read(addr, true).unwrap().as_slice(), &[0x0C, 0x1A]);
    gateway.expect_silence();
}

#[test]
fn test_concurrent_reads_resolve_by_address() {
    let gateway = FakeGateway::bind();
    let (session, data_endpoint) = connect(&gateway, Arc::new(ValueCache::new()));
    let light = ga!(1/0/1);
    let blind = ga!(2/0/1);

    thread::scope(|s| {
        let light_read = s.spawn(|| session.group_read(light, false));
        let blind_read = s.spawn(|| session.group_read(blind, false));

        let (_, _, first) = gateway.recv_tunneling_request();
        let (_, _, second) = gateway.recv_tunneling_request();

        // Answer in reverse order of arrival
        for (seq, request) in [second, first].into_iter().enumerate() {
            let dst = request.destination();
            let value = if dst == light { 1 } else { 0x42 };
            let response = CemiMessage::group_response(dst, &[value]).unwrap();
            gateway.send_indication(data_endpoint, seq as u8, response);
            gateway.recv_ack();
        }

        assert_eq!(light_read.join().unwrap().unwrap().as_slice(), &[1]);
        assert_eq!(blind_read.join().unwrap().unwrap().as_slice(), &[0x42]);
    });
}

#[test]
fn test_group_read_timeout() {
    let gateway = FakeGateway::bind();
    let config = gateway.config().with_read_timeout(Some(Duration::from_millis(200)));
    init_logging();

    let mut session = TunnelSession::new(config);
    thread::scope(|s| {
        let handle = s.spawn(|| gateway.accept_connect());
        session.connect().unwrap();
        handle.join().unwrap();
    });

    let err = session.group_read(ga!(3/3/3), false).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(session.pending_reads(), 0);

    // The read still went out
    let (_, _, cemi) = gateway.recv_tunneling_request();
    assert_eq!(cemi.command(), CemiCommand::Read);
}

#[test]
fn test_toggle_from_cache() {
    let gateway = FakeGateway::bind();
    let (session, _) = connect(&gateway, cached(&[(ga!(1/1/1), &[0]), (ga!(1/1/2), &[1])]));

    assert_eq!(session.group_toggle(ga!(1/1/1), true).unwrap(), 1);
    let (_, _, cemi) = gateway.recv_tunneling_request();
    assert_eq!(cemi.destination(), ga!(1/1/1));
    assert_eq!(cemi.tpci_apci(), 0x0081);
    assert_eq!(cemi.data(), &[1]);

    assert_eq!(session.group_toggle(ga!(1/1/2), true).unwrap(), 0);
    let (_, _, cemi) = gateway.recv_tunneling_request();
    assert_eq!(cemi.tpci_apci(), 0x0080);
    assert_eq!(cemi.data(), &[0]);
}

#[test]
fn test_toggle_rejects_non_boolean_values() {
    let gateway = FakeGateway::bind();
    let (session, _) = connect(&gateway, cached(&[(ga!(1/1/3), &[2]), (ga!(1/1/4), &[0, 1])]));

    let err = session.group_toggle(ga!(1/1/3), true).unwrap_err();
    assert!(err.is_invalid_operation());

    let err = session.group_toggle(ga!(1/1/4), true).unwrap_err();
    assert!(matches!(err, KnxError::InvalidOperation(ref e) if e.is_multi_byte()));

    gateway.expect_silence();
}

#[test]
fn test_inbound_write_is_acked_and_cached() {
    let gateway = FakeGateway::bind();
    let (session, data_endpoint) = connect(&gateway, Arc::new(ValueCache::new()));

    let write = CemiMessage::group_write(ga!(4/0/10), &[1]).unwrap();
    gateway.send_indication(data_endpoint, 5, write);

    let ack = gateway.recv_ack();
    assert_eq!(ack.connection_header, ConnectionHeader::new(CHANNEL, 5));
    assert_eq!(session.cache().get(ga!(4/0/10)).unwrap().as_slice(), &[1]);

    // Traffic on another channel is ignored
    let cemi = CemiMessage::group_write(ga!(4/0/11), &[1])
        .unwrap()
        .with_message_code(CEMIMessageCode::LDataInd)
        .encode();
    let foreign = TunnelingRequest::new(ConnectionHeader::new(CHANNEL + 1, 0), &cemi).build().unwrap();
    gateway.socket.send_to(&foreign, data_endpoint).unwrap();
    gateway.expect_silence();
    assert!(session.cache().get(ga!(4/0/11)).is_none());
}

#[test]
fn test_connect_rejected() {
    init_logging();
    let gateway = FakeGateway::bind();
    let mut session = TunnelSession::new(gateway.config());

    let result = thread::scope(|s| {
        s.spawn(|| gateway.answer_connect(ServiceType::ConnectResponse, &[0x00, E_NO_MORE_CONNECTIONS]));
        session.connect()
    });

    let err = result.unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.rejected_status() == Some(E_NO_MORE_CONNECTIONS)));
    assert_eq!(session.phase(), SessionPhase::Disconnected);

    // A refused handshake can be retried
    thread::scope(|s| {
        s.spawn(|| gateway.accept_connect());
        session.connect().unwrap();
    });
    assert_eq!(session.phase(), SessionPhase::Connected);
}

#[test]
fn test_connect_unexpected_service() {
    init_logging();
    let gateway = FakeGateway::bind();
    let mut session = TunnelSession::new(gateway.config());

    let err = thread::scope(|s| {
        s.spawn(|| gateway.answer_connect(ServiceType::TunnellingAck, &[0x04, 0x00, 0x00, 0x00]));
        session.connect()
    })
    .unwrap_err();

    assert!(matches!(err, KnxError::Connection(ref e) if e.unexpected_service() == Some(0x0421)));
    assert_eq!(session.phase(), SessionPhase::Disconnected);
}

#[test]
fn test_connect_timeout() {
    init_logging();
    let gateway = FakeGateway::bind();
    let config = gateway.config().with_connect_timeout(Some(Duration::from_millis(200)));
    let mut session = TunnelSession::new(config);

    let err = session.connect().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(session.phase(), SessionPhase::Disconnected);
}

#[test]
fn test_disconnect() {
    let gateway = FakeGateway::bind();
    let (mut session, _) = connect(&gateway, Arc::new(ValueCache::new()));
    assert_eq!(session.connection_state().unwrap().channel_id, CHANNEL);

    thread::scope(|s| {
        s.spawn(|| {
            let (bytes, from) = gateway.recv();
            let frame = Frame::parse(&bytes).unwrap();
            assert_eq!(frame.service_type(), ServiceType::DisconnectRequest);
            assert_eq!(frame.body()[..4], [CHANNEL, 0x00, 0x08, 0x01]);

            let response = frame::encode(ServiceType::DisconnectResponse, &[CHANNEL, 0x00]).unwrap();
            gateway.socket.send_to(&response, from).unwrap();
        });
        session.disconnect().unwrap();
    });

    assert_eq!(session.phase(), SessionPhase::Disconnected);
    assert!(session.connection_state().is_none());

    let err = session.group_write(ga!(1/2/3), &[1]).unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));
}

#[test]
fn test_connect_socket_failure_is_connection_error() {
    init_logging();
    // Reaching the limited broadcast address needs SO_BROADCAST
    let mut session = TunnelSession::new(TunnelConfig::new(Ipv4Addr::BROADCAST));

    let err = session.connect().unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.io_kind().is_some()), "{err}");
    assert_eq!(session.phase(), SessionPhase::Disconnected);
}

#[test]
fn test_connect_ignores_other_peers() {
    init_logging();
    let gateway = FakeGateway::bind();
    let stranger = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let mut session = TunnelSession::new(gateway.config());

    thread::scope(|s| {
        s.spawn(|| {
            let (request, from) = gateway.recv();
            let frame = Frame::parse(&request).unwrap();

            // A bogus acceptance from someone else arrives first
            let bogus = frame::encode(ServiceType::ConnectResponse, &[CHANNEL + 1, 0x00]).unwrap();
            stranger.send_to(&bogus, from).unwrap();

            let mut body = vec![CHANNEL, 0x00];
            Hpai::from(gateway.addr).encode_into(&mut body);
            body.extend_from_slice(&[0x04, 0x04, 0x11, 0x05]);
            gateway
                .socket
                .send_to(&frame::encode(ServiceType::ConnectResponse, &body).unwrap(), from)
                .unwrap();
        });
        session.connect().unwrap();
    });

    assert_eq!(session.connection_state().unwrap().channel_id, CHANNEL);
}

#[test]
fn test_send_failure_closes_session() {
    init_logging();
    let gateway = FakeGateway::bind();
    let mut session = TunnelSession::new(gateway.config());

    // Data endpoint the session cannot send to without SO_BROADCAST
    thread::scope(|s| {
        s.spawn(|| {
            let mut body = vec![CHANNEL, 0x00];
            Hpai::new(Ipv4Addr::BROADCAST, 3671).encode_into(&mut body);
            body.extend_from_slice(&[0x04, 0x04, 0x11, 0x05]);
            gateway.answer_connect(ServiceType::ConnectResponse, &body);
        });
        session.connect().unwrap();
    });

    let err = session.group_write(ga!(1/2/3), &[1]).unwrap_err();
    assert!(matches!(err, KnxError::Transport(_)), "{err}");
    assert_eq!(session.phase(), SessionPhase::Disconnected);

    let err = session.group_write(ga!(1/2/3), &[1]).unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.is_lost()));

    let err = session.connect().unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.is_closed()));
}

#[test]
fn test_connect_twice() {
    let gateway = FakeGateway::bind();
    let (mut session, _) = connect(&gateway, Arc::new(ValueCache::new()));

    let err = session.connect().unwrap_err();
    assert!(matches!(err, KnxError::Connection(ref e) if e.is_already_connected()));
    assert_eq!(session.phase(), SessionPhase::Connected);
}
