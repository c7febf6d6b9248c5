//! KNXnet/IP tunneling client with the typestate pattern.
//!
//! The client is sans-IO: every transition returns the frame to send and
//! every response is fed back in as a parsed [`Frame`]. The session layer
//! owns the sockets and drives these transitions.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Connecting → Connected → Disconnecting → Idle
//!           ↓ (cancel)
//!          Idle
//! ```
//!
//! - `TunnelClient<Idle>` can only call `connect()`
//! - `TunnelClient<Connecting>` can only call `handle_connect_response()` or `cancel()`
//! - `TunnelClient<Connected>` can build tunneling requests or `disconnect()`
//! - `TunnelClient<Disconnecting>` can only finish
//!
//! ## Example
//!
//! ```
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use knx_tunnel::protocol::cemi::CemiMessage;
//! use knx_tunnel::protocol::frame::{Frame, Hpai};
//! use knx_tunnel::protocol::constants::ServiceType;
//! use knx_tunnel::protocol::tunnel::TunnelClient;
//! use knx_tunnel::ga;
//!
//! let local = Ipv4Addr::new(192, 168, 1, 20);
//! let client = TunnelClient::new(
//!     SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671),
//!     Hpai::new(local, 50000),
//!     Hpai::new(local, 50001),
//! );
//!
//! let (client, _connect_request) = client.connect().unwrap();
//! let response = Frame::new(ServiceType::ConnectResponse, &[0x05, 0x00]);
//! let mut client = client.handle_connect_response(&response).unwrap();
//! assert_eq!(client.channel_id(), 5);
//!
//! let (seq, _frame) = client.tunneling_request(&CemiMessage::group_read(ga!(1/2/3))).unwrap();
//! assert_eq!(seq, 0);
//! assert_eq!(client.send_sequence(), 1);
//! ```

use std::net::SocketAddrV4;

use crate::error::{KnxError, Result};
use crate::protocol::cemi::CemiMessage;
use crate::protocol::constants::{status_description, ServiceType};
use crate::protocol::frame::{Frame, Hpai};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionHeader, DisconnectRequest, DisconnectResponse, TunnelingRequest,
};

// =============================================================================
// State Types
// =============================================================================

/// Client is idle (not connected)
#[derive(Debug, Clone, Copy)]
pub struct Idle;

/// Connection request sent, waiting for response
#[derive(Debug, Clone, Copy)]
pub struct Connecting;

/// Connected and ready to send
#[derive(Debug, Clone, Copy)]
pub struct Connected {
    channel_id: u8,
    send_sequence: u8,
    gateway_data_endpoint: Option<Hpai>,
}

/// Disconnect request sent
#[derive(Debug, Clone, Copy)]
pub struct Disconnecting {
    channel_id: u8,
}

/// Snapshot of an established tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Channel id assigned by the gateway
    pub channel_id: u8,
    /// Local data endpoint the gateway sends bus traffic to
    pub local_endpoint: SocketAddrV4,
    /// Gateway endpoint requests are sent to
    pub remote_endpoint: SocketAddrV4,
}

// =============================================================================
// Tunneling Client with Generic State Parameter
// =============================================================================

/// Tunneling client for KNX gateway communication
///
/// The state parameter `S` determines which methods are available, so
/// sending before the handshake completes does not compile.
#[derive(Debug)]
pub struct TunnelClient<State> {
    gateway: SocketAddrV4,
    control_endpoint: Hpai,
    data_endpoint: Hpai,
    state: State,
}

impl<S> TunnelClient<S> {
    /// Gateway address (available in all states)
    #[inline]
    pub const fn gateway(&self) -> SocketAddrV4 {
        self.gateway
    }

    /// Local control endpoint announced in the handshake
    #[inline]
    pub const fn control_endpoint(&self) -> Hpai {
        self.control_endpoint
    }

    /// Local data endpoint announced in the handshake
    #[inline]
    pub const fn data_endpoint(&self) -> Hpai {
        self.data_endpoint
    }

    fn into_state<T>(self, state: T) -> TunnelClient<T> {
        TunnelClient {
            gateway: self.gateway,
            control_endpoint: self.control_endpoint,
            data_endpoint: self.data_endpoint,
            state,
        }
    }
}

// =============================================================================
// Idle
// =============================================================================

impl TunnelClient<Idle> {
    /// Create a new tunnel client (starts in Idle state)
    pub const fn new(gateway: SocketAddrV4, control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        TunnelClient {
            gateway,
            control_endpoint,
            data_endpoint,
            state: Idle,
        }
    }

    /// Start connection (Idle → Connecting)
    ///
    /// Returns the client in Connecting state along with the
    /// `CONNECT_REQUEST` frame to send from the control endpoint.
    pub fn connect(self) -> Result<(TunnelClient<Connecting>, Vec<u8>)> {
        let frame = ConnectRequest::new(self.control_endpoint, self.data_endpoint).build()?;
        Ok((self.into_state(Connecting), frame))
    }
}

// =============================================================================
// Connecting
// =============================================================================

impl TunnelClient<Connecting> {
    /// Handle `CONNECT_RESPONSE` (Connecting → Connected)
    ///
    /// # Errors
    ///
    /// - Connection error carrying the service type if `response` is not a
    ///   `CONNECT_RESPONSE`
    /// - Connection error carrying the status if the gateway refused
    pub fn handle_connect_response(self, response: &Frame<'_>) -> Result<TunnelClient<Connected>> {
        if response.service_type() != ServiceType::ConnectResponse {
            return Err(KnxError::unexpected_service(response.service_type().to_u16()));
        }

        let resp = ConnectResponse::parse(response.body())?;
        if !resp.is_ok() {
            knx_log!(
                warn,
                "Gateway {} refused tunnel: {} (0x{:02X})",
                self.gateway,
                status_description(resp.status),
                resp.status
            );
            return Err(KnxError::connection_rejected(resp.status));
        }

        Ok(self.into_state(Connected {
            channel_id: resp.channel_id,
            send_sequence: 0,
            gateway_data_endpoint: resp.data_endpoint,
        }))
    }

    /// Cancel connection attempt (Connecting → Idle)
    pub fn cancel(self) -> TunnelClient<Idle> {
        self.into_state(Idle)
    }
}

// =============================================================================
// Connected
// =============================================================================

impl TunnelClient<Connected> {
    /// Channel id assigned by the gateway
    #[inline]
    pub const fn channel_id(&self) -> u8 {
        self.state.channel_id
    }

    /// Sequence number the next request will carry
    #[inline]
    pub const fn send_sequence(&self) -> u8 {
        self.state.send_sequence
    }

    /// Data endpoint the gateway reported in its `CONNECT_RESPONSE`
    #[inline]
    pub const fn gateway_data_endpoint(&self) -> Option<Hpai> {
        self.state.gateway_data_endpoint
    }

    /// Build a `TUNNELING_REQUEST` carrying `cemi`.
    ///
    /// Returns the sequence number used and the frame. The counter advances
    /// by one per call and wraps from 255 to 0.
    pub fn tunneling_request(&mut self, cemi: &CemiMessage) -> Result<(u8, Vec<u8>)> {
        let seq = self.state.send_sequence;
        let cemi_data = cemi.encode();
        let frame = TunnelingRequest::new(ConnectionHeader::new(self.state.channel_id, seq), &cemi_data).build()?;

        self.state.send_sequence = seq.wrapping_add(1);
        Ok((seq, frame))
    }

    /// Describe the tunnel as seen from this side.
    pub const fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            channel_id: self.state.channel_id,
            local_endpoint: self.data_endpoint.socket_addr(),
            remote_endpoint: self.gateway,
        }
    }

    /// Start disconnect (Connected → Disconnecting)
    ///
    /// Returns the `DISCONNECT_REQUEST` frame to send from the control endpoint.
    pub fn disconnect(self) -> Result<(TunnelClient<Disconnecting>, Vec<u8>)> {
        let channel_id = self.state.channel_id;
        let frame = DisconnectRequest::new(channel_id, self.control_endpoint).build()?;
        Ok((self.into_state(Disconnecting { channel_id }), frame))
    }
}

// =============================================================================
// Disconnecting
// =============================================================================

impl TunnelClient<Disconnecting> {
    /// Handle `DISCONNECT_RESPONSE` and finish (Disconnecting → Idle)
    ///
    /// A response for another channel or a non-zero status is logged; the
    /// client returns to Idle regardless.
    pub fn finish(self, response: &Frame<'_>) -> Result<TunnelClient<Idle>> {
        if response.service_type() != ServiceType::DisconnectResponse {
            return Err(KnxError::unexpected_service(response.service_type().to_u16()));
        }

        let resp = DisconnectResponse::parse(response.body())?;
        if resp.channel_id != self.state.channel_id || !resp.is_ok() {
            knx_log!(
                warn,
                "Disconnect of channel {} answered for channel {} with {}",
                self.state.channel_id,
                resp.channel_id,
                status_description(resp.status)
            );
        }

        Ok(self.into_state(Idle))
    }

    /// Finish without waiting for a response
    pub fn finish_now(self) -> TunnelClient<Idle> {
        self.into_state(Idle)
    }
}
