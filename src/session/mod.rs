//! Tunnel session over UDP.
//!
//! [`TunnelSession`] drives the sans-IO [`TunnelClient`] handshake over a
//! control socket, starts the data-channel listener and offers blocking
//! group read, write and toggle operations.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected
//!       ↑              │            │
//!       └──────────────┴────────────┘  (handshake failure, disconnect,
//!                                       transport failure)
//! ```
//!
//! A transport failure on an established tunnel is terminal: the session
//! refuses to connect again and must be replaced.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use knx_tunnel::{ga, TunnelConfig, TunnelSession};
//!
//! let mut session = TunnelSession::new(TunnelConfig::new(Ipv4Addr::new(192, 168, 1, 10)));
//! session.connect()?;
//!
//! session.group_write(ga!(1/2/3), &[1])?;
//! let value = session.group_read(ga!(1/2/4), true)?;
//! session.group_toggle(ga!(1/2/3), true)?;
//!
//! session.disconnect()?;
//! # Ok::<(), knx_tunnel::KnxError>(())
//! ```

mod listener;
mod pending;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::addressing::GroupAddress;
use crate::cache::ValueCache;
use crate::config::{TunnelConfig, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{KnxError, Result};
use crate::protocol::cemi::{CemiMessage, Payload};
use crate::protocol::constants::MAX_PACKET_SIZE;
use crate::protocol::frame::{Frame, Hpai};
use crate::protocol::tunnel::{Connected, ConnectionState, Disconnecting, TunnelClient};

use listener::{DataChannelListener, ListenerContext};
use pending::PendingReads;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No tunnel (initial state, and after disconnect or failure)
    Disconnected,
    /// `CONNECT_REQUEST` sent, waiting for the gateway
    Connecting,
    /// Tunnel established
    Connected,
}

impl SessionPhase {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Phase, channel and failure flag shared with the listener thread
#[derive(Debug)]
pub(crate) struct SharedState {
    phase: AtomicU8,
    channel: AtomicU8,
    failed: AtomicBool,
}

impl SharedState {
    pub(crate) const fn new() -> Self {
        Self {
            phase: AtomicU8::new(0),
            channel: AtomicU8::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    /// Channel of the established tunnel
    pub(crate) fn channel(&self) -> Option<u8> {
        (self.phase() == SessionPhase::Connected).then(|| self.channel.load(Ordering::Acquire))
    }

    pub(crate) fn mark_connected(&self, channel: u8) {
        self.channel.store(channel, Ordering::Release);
        self.set_phase(SessionPhase::Connected);
    }

    /// Transport failure: back to Disconnected for good
    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
        self.set_phase(SessionPhase::Disconnected);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Sockets and client of an established tunnel
#[derive(Debug)]
struct Link {
    client: Mutex<TunnelClient<Connected>>,
    data_socket: UdpSocket,
    control_socket: UdpSocket,
    remote_data: SocketAddrV4,
    listener: DataChannelListener,
}

/// A tunnel to one KNXnet/IP gateway.
///
/// Group operations take `&self` and may run from several threads at once;
/// sequence numbering and sends are serialized internally.
#[derive(Debug)]
pub struct TunnelSession {
    config: TunnelConfig,
    cache: Arc<ValueCache>,
    pending: Arc<PendingReads>,
    shared: Arc<SharedState>,
    link: Option<Link>,
}

impl TunnelSession {
    /// Create a disconnected session with an empty cache.
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_cache(config, Arc::new(ValueCache::new()))
    }

    /// Create a disconnected session that records values in `cache`.
    pub fn with_cache(config: TunnelConfig, cache: Arc<ValueCache>) -> Self {
        Self {
            config,
            cache,
            pending: Arc::new(PendingReads::new()),
            shared: Arc::new(SharedState::new()),
            link: None,
        }
    }

    /// Open the tunnel.
    ///
    /// Binds the data and control sockets on the interface that routes to
    /// the gateway, starts the listener and performs the handshake.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the gateway does not answer within the connect timeout
    /// - Connection error if a socket operation fails, if the gateway refuses
    ///   or answers with another service, if already connected, or if an
    ///   earlier transport failure closed this session
    pub fn connect(&mut self) -> Result<()> {
        if self.shared.is_failed() {
            return Err(KnxError::connection_closed());
        }
        if self.link.is_some() {
            return Err(KnxError::already_connected());
        }

        self.shared.set_phase(SessionPhase::Connecting);
        match self.open_link().map_err(KnxError::into_handshake_error) {
            Ok(link) => {
                let channel = lock(&link.client).channel_id();
                self.shared.mark_connected(channel);
                knx_log!(info, "Connected KNX IP tunnel to {} (channel {})", self.config.gateway, channel);
                self.link = Some(link);
                Ok(())
            }
            Err(err) => {
                self.shared.set_phase(SessionPhase::Disconnected);
                knx_log!(error, "Could not open tunnel to {}: {}", self.config.gateway, err);
                Err(err)
            }
        }
    }

    fn open_link(&self) -> Result<Link> {
        let gateway = self.config.gateway;
        let local_ip = local_ipv4_for(gateway)?;

        let data_socket = UdpSocket::bind((local_ip, 0))?;
        let control_socket = UdpSocket::bind((local_ip, 0))?;
        control_socket.set_read_timeout(self.config.connect_timeout)?;

        let listener = DataChannelListener::spawn(
            data_socket.try_clone()?,
            ListenerContext {
                cache: Arc::clone(&self.cache),
                pending: Arc::clone(&self.pending),
                shared: Arc::clone(&self.shared),
            },
        )?;

        let client = TunnelClient::new(gateway, local_hpai(&control_socket)?, local_hpai(&data_socket)?);
        let (client, request) = client.connect()?;
        control_socket.send_to(&request, gateway)?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = recv_from_gateway(&control_socket, gateway, &mut buf)?;
        let client = client.handle_connect_response(&parse_control_frame(&buf[..len])?)?;

        let remote_data = client
            .gateway_data_endpoint()
            .filter(|hpai| !hpai.ip_address.is_unspecified() && hpai.port != 0)
            .map_or(gateway, |hpai| hpai.socket_addr());

        Ok(Link {
            client: Mutex::new(client),
            data_socket,
            control_socket,
            remote_data,
            listener,
        })
    }

    /// Wrap `cemi` in a `TUNNELING_REQUEST` and send it to the gateway.
    ///
    /// Returns the sequence number used. A send failure closes the session.
    pub fn send_tunneling_request(&self, cemi: &CemiMessage) -> Result<u8> {
        let link = self.active_link()?;

        let mut client = lock(&link.client);
        let (seq, frame) = client.tunneling_request(cemi)?;

        if let Err(err) = link.data_socket.send_to(&frame, link.remote_data) {
            knx_log!(error, "Failed to send TUNNELING_REQUEST to {}: {}", link.remote_data, err);
            self.shared.mark_failed();
            self.pending.clear();
            return Err(KnxError::from(err));
        }

        knx_log!(debug, "Sent TUNNELING_REQUEST channel {} seq {}: {}", client.channel_id(), seq, cemi);
        Ok(seq)
    }

    /// Write `data` to a group address.
    ///
    /// Returns once the request is sent; the gateway's transport-level ack
    /// is not awaited.
    pub fn group_write(&self, addr: GroupAddress, data: &[u8]) -> Result<()> {
        let cemi = CemiMessage::group_write(addr, data)?;
        self.send_tunneling_request(&cemi).map(|_| ())
    }

    /// Read the value of a group address.
    ///
    /// With `use_cache`, a known value is returned without touching the bus.
    /// Otherwise a read is sent and the call blocks until a response for
    /// `addr` arrives or the read timeout expires.
    pub fn group_read(&self, addr: GroupAddress, use_cache: bool) -> Result<Payload> {
        if use_cache {
            if let Some(value) = self.cache.get(addr) {
                knx_log!(debug, "Got value of group address {} from cache: {:?}", addr, value.as_slice());
                return Ok(value);
            }
        }

        let read = self.pending.register(addr);
        if let Err(err) = self.send_tunneling_request(&CemiMessage::group_read(addr)) {
            self.pending.cancel(&read);
            return Err(err);
        }

        read.wait(self.config.read_timeout).inspect_err(|err| {
            self.pending.cancel(&read);
            if err.is_timeout() {
                knx_log!(warn, "No response for group address {} within {:?}", addr, self.config.read_timeout);
            }
        })
    }

    /// Flip a boolean group value and return the value written.
    ///
    /// # Errors
    ///
    /// Invalid operation if the current value is not a single `0` or `1`.
    pub fn group_toggle(&self, addr: GroupAddress, use_cache: bool) -> Result<u8> {
        let current = self.group_read(addr, use_cache)?;
        let next = toggled_value(&current).inspect_err(|err| {
            knx_log!(error, "Can't toggle group address {}: {}", addr, err);
        })?;

        self.group_write(addr, &[next])?;
        Ok(next)
    }

    /// Close the tunnel.
    ///
    /// Sends `DISCONNECT_REQUEST` and waits for the answer up to the connect
    /// timeout, then stops the listener and fails any pending reads.
    pub fn disconnect(&mut self) -> Result<()> {
        let Link {
            client,
            control_socket,
            mut listener,
            ..
        } = self.link.take().ok_or_else(KnxError::not_connected)?;

        let client = client.into_inner().unwrap_or_else(PoisonError::into_inner);
        let channel = client.channel_id();

        let result = if self.shared.is_failed() {
            Ok(())
        } else {
            self.close_tunnel(client, &control_socket)
        };

        listener.stop();
        self.pending.clear();
        self.shared.set_phase(SessionPhase::Disconnected);
        knx_log!(info, "Disconnected KNX IP tunnel (channel {})", channel);
        result
    }

    fn close_tunnel(&self, client: TunnelClient<Connected>, control_socket: &UdpSocket) -> Result<()> {
        let (client, request) = client.disconnect()?;
        control_socket.send_to(&request, self.config.gateway)?;
        control_socket.set_read_timeout(Some(self.config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)))?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let finished = recv_from_gateway(control_socket, self.config.gateway, &mut buf)
            .and_then(|len| client_finish(client, &buf[..len]));

        if let Err(err) = finished {
            knx_log!(warn, "No clean DISCONNECT_RESPONSE from {}: {}", self.config.gateway, err);
        }
        Ok(())
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Channel and endpoints of the open tunnel
    pub fn connection_state(&self) -> Option<ConnectionState> {
        let link = self.active_link().ok()?;
        Some(ConnectionState {
            remote_endpoint: link.remote_data,
            ..lock(&link.client).connection_state()
        })
    }

    /// Values seen on the bus
    pub fn cache(&self) -> &Arc<ValueCache> {
        &self.cache
    }

    /// Configuration this session was created with
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Number of reads waiting for a response
    pub fn pending_reads(&self) -> usize {
        self.pending.count()
    }

    fn active_link(&self) -> Result<&Link> {
        let link = self.link.as_ref().ok_or_else(KnxError::not_connected)?;
        if self.shared.is_failed() {
            return Err(KnxError::connection_lost());
        }
        Ok(link)
    }
}

/// Value a toggle writes for the current value `data`.
///
/// ```
/// use knx_tunnel::session::toggled_value;
///
/// assert_eq!(toggled_value(&[0]).unwrap(), 1);
/// assert_eq!(toggled_value(&[1]).unwrap(), 0);
/// assert!(toggled_value(&[2]).is_err());
/// assert!(toggled_value(&[0, 1]).is_err());
/// ```
pub fn toggled_value(data: &[u8]) -> Result<u8> {
    match data {
        [0] => Ok(1),
        [1] => Ok(0),
        [value] => Err(KnxError::non_boolean_toggle(*value)),
        _ => Err(KnxError::multi_byte_toggle(data.len())),
    }
}

fn client_finish(client: TunnelClient<Disconnecting>, datagram: &[u8]) -> Result<()> {
    client.finish(&Frame::parse(datagram)?).map(|_| ())
}

/// Parse a control-channel reply, reporting unknown service types as an
/// unexpected answer rather than a malformed frame.
fn parse_control_frame(datagram: &[u8]) -> Result<Frame<'_>> {
    Frame::parse(datagram).map_err(|err| {
        let unknown = match &err {
            KnxError::Frame(frame_err) => frame_err.service_type_id(),
            _ => None,
        };
        unknown.map_or(err, KnxError::unexpected_service)
    })
}

/// Receive the next datagram sent by `gateway`, skipping other peers.
fn recv_from_gateway(socket: &UdpSocket, gateway: SocketAddrV4, buf: &mut [u8]) -> Result<usize> {
    loop {
        let (len, peer) = socket.recv_from(buf)?;
        if peer == SocketAddr::V4(gateway) {
            return Ok(len);
        }
        knx_log!(warn, "Ignoring datagram from {} on the control endpoint", peer);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local address the OS would use to reach `gateway`.
fn local_ipv4_for(gateway: SocketAddrV4) -> Result<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(gateway)?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(KnxError::no_ipv4_route()),
    }
}

fn local_hpai(socket: &UdpSocket) -> Result<Hpai> {
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(Hpai::from(addr)),
        SocketAddr::V6(_) => Err(KnxError::no_ipv4_route()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggled_value() {
        assert_eq!(toggled_value(&[0]).unwrap(), 1);
        assert_eq!(toggled_value(&[1]).unwrap(), 0);

        let err = toggled_value(&[2]).unwrap_err();
        assert!(err.is_invalid_operation());

        let err = toggled_value(&[0, 1]).unwrap_err();
        assert!(matches!(err, KnxError::InvalidOperation(ref e) if e.is_multi_byte()));
        assert_eq!(err.to_string(), "Invalid operation: cannot toggle a 2-octet value");
    }

    #[test]
    fn test_phase_encoding() {
        for phase in [SessionPhase::Disconnected, SessionPhase::Connecting, SessionPhase::Connected] {
            assert_eq!(SessionPhase::from_u8(phase.to_u8()), phase);
        }
    }

    #[test]
    fn test_shared_state_failure_is_sticky() {
        let shared = SharedState::new();
        assert_eq!(shared.channel(), None);

        shared.mark_connected(4);
        assert_eq!(shared.channel(), Some(4));

        shared.mark_failed();
        assert_eq!(shared.phase(), SessionPhase::Disconnected);
        assert!(shared.is_failed());
        assert_eq!(shared.channel(), None);
    }

    #[test]
    fn test_operations_require_connection() {
        let session = TunnelSession::new(TunnelConfig::new(Ipv4Addr::LOCALHOST));
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert!(session.connection_state().is_none());

        let err = session.group_write(GroupAddress::from(1), &[1]).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));

        let err = session.group_read(GroupAddress::from(1), true).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));
        assert_eq!(session.pending_reads(), 0);
    }

    #[test]
    fn test_cached_read_needs_no_connection() {
        let cache = Arc::new(ValueCache::new());
        cache.set(GroupAddress::from(1), Payload::from_slice(&[1]).unwrap());
        let session = TunnelSession::with_cache(TunnelConfig::new(Ipv4Addr::LOCALHOST), cache);

        assert_eq!(session.group_read(GroupAddress::from(1), true).unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_disconnect_when_not_connected() {
        let mut session = TunnelSession::new(TunnelConfig::new(Ipv4Addr::LOCALHOST));
        let err = session.disconnect().unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_connected()));
    }
}
