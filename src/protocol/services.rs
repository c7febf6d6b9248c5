//! KNXnet/IP tunneling service bodies.
//!
//! Each request type builds a complete frame with [`build`](ConnectRequest::build);
//! each response type parses a frame body as returned by
//! [`Frame::body`](crate::protocol::frame::Frame::body).
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|  (control endpoint)
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|  (data endpoint)
//!   |<------ TUNNELING_REQUEST ------|  (bus traffic)
//!   |------- TUNNELING_ACK --------->|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|  (control endpoint)
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```
//!
//! ## Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use knx_tunnel::protocol::frame::Hpai;
//! use knx_tunnel::protocol::services::ConnectRequest;
//!
//! let ip = Ipv4Addr::new(10, 0, 0, 5);
//! let frame = ConnectRequest::new(Hpai::new(ip, 50000), Hpai::new(ip, 50001))
//!     .build()
//!     .unwrap();
//! assert_eq!(frame.len(), 26);
//! ```

use crate::error::{KnxError, Result};
use crate::protocol::constants::{ServiceType, E_NO_ERROR, TUNNEL_CONNECTION, TUNNEL_LINKLAYER};
use crate::protocol::frame::{self, Hpai};

/// Connection Request Information (CRI) for tunneling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestInfo {
    /// Connection type (`TUNNEL_CONNECTION` = 0x04)
    pub connection_type: u8,
    /// KNX layer (`TUNNEL_LINKLAYER` = 0x02)
    pub knx_layer: u8,
}

impl ConnectionRequestInfo {
    /// Size of the CRI structure
    pub const SIZE: usize = 4;

    /// Create a new CRI for tunnel link layer connection
    pub const fn tunnel_link_layer() -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            knx_layer: TUNNEL_LINKLAYER,
        }
    }

    /// Append the 4 wire bytes to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[Self::SIZE as u8, self.connection_type, self.knx_layer, 0x00]);
    }

    /// Decode CRI from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some(&[length, connection_type, knx_layer, _reserved]) = data.first_chunk::<{ Self::SIZE }>() else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        if usize::from(length) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }

        Ok(Self {
            connection_type,
            knx_layer,
        })
    }
}

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    /// Control endpoint (for connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (for tunneling data)
    pub data_endpoint: Hpai,
    /// Connection request information
    pub cri: ConnectionRequestInfo,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST`
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self {
            control_endpoint,
            data_endpoint,
            cri: ConnectionRequestInfo::tunnel_link_layer(),
        }
    }

    /// Build the complete frame
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(2 * Hpai::SIZE + ConnectionRequestInfo::SIZE);
        self.control_endpoint.encode_into(&mut body);
        self.data_endpoint.encode_into(&mut body);
        self.cri.encode_into(&mut body);
        frame::encode(ServiceType::ConnectRequest, &body)
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Data endpoint assigned by the gateway, when it sent one
    pub data_endpoint: Option<Hpai>,
}

impl ConnectResponse {
    /// Parse from frame body
    ///
    /// Gateways that reject a connection may send only the channel and
    /// status bytes, so the data endpoint is optional.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&[channel_id, status]) = data.first_chunk::<2>() else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        let data_endpoint = if data.len() >= 2 + Hpai::SIZE {
            Some(Hpai::parse(&data[2..])?)
        } else {
            None
        };

        Ok(Self {
            channel_id,
            status,
            data_endpoint,
        })
    }

    /// Check if connection was successful
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    /// Build the complete frame
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(2 + Hpai::SIZE);
        body.extend_from_slice(&[self.channel_id, 0x00]);
        self.control_endpoint.encode_into(&mut body);
        frame::encode(ServiceType::DisconnectRequest, &body)
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl DisconnectResponse {
    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&[channel_id, status]) = data.first_chunk::<2>() else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        Ok(Self { channel_id, status })
    }

    /// Check if disconnect was acknowledged
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// Connection header shared by tunneling requests and acks
///
/// The last byte is reserved in a request and carries the status in an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// Sequence counter
    pub sequence_counter: u8,
    /// Status (acks) or reserved zero (requests)
    pub status: u8,
}

impl ConnectionHeader {
    /// Size of the connection header
    pub const SIZE: usize = 4;

    /// Create a new connection header
    pub const fn new(channel_id: u8, sequence_counter: u8) -> Self {
        Self {
            channel_id,
            sequence_counter,
            status: E_NO_ERROR,
        }
    }

    /// Encode to the 4 wire bytes
    pub const fn encode(&self) -> [u8; Self::SIZE] {
        [Self::SIZE as u8, self.channel_id, self.sequence_counter, self.status]
    }

    /// Decode from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some(&[length, channel_id, sequence_counter, status]) = data.first_chunk::<{ Self::SIZE }>() else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        if usize::from(length) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }

        Ok(Self {
            channel_id,
            sequence_counter,
            status,
        })
    }
}

/// `TUNNELING_REQUEST` service (0x0420)
#[derive(Debug, Clone, Copy)]
pub struct TunnelingRequest<'a> {
    /// Connection header
    pub connection_header: ConnectionHeader,
    /// cEMI frame data
    pub cemi_data: &'a [u8],
}

impl<'a> TunnelingRequest<'a> {
    /// Create a new `TUNNELING_REQUEST`
    pub const fn new(connection_header: ConnectionHeader, cemi_data: &'a [u8]) -> Self {
        Self {
            connection_header,
            cemi_data,
        }
    }

    /// Build the complete frame
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + self.cemi_data.len());
        body.extend_from_slice(&self.connection_header.encode());
        body.extend_from_slice(self.cemi_data);
        frame::encode(ServiceType::TunnellingRequest, &body)
    }

    /// Parse from frame body
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let connection_header = ConnectionHeader::decode(data)?;

        Ok(Self {
            connection_header,
            cemi_data: &data[ConnectionHeader::SIZE..],
        })
    }
}

/// `TUNNELING_ACK` service (0x0421)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingAck {
    /// Connection header, status in its last byte
    pub connection_header: ConnectionHeader,
}

impl TunnelingAck {
    /// Create a new `TUNNELING_ACK`
    pub const fn new(channel_id: u8, sequence_counter: u8, status: u8) -> Self {
        Self {
            connection_header: ConnectionHeader {
                channel_id,
                sequence_counter,
                status,
            },
        }
    }

    /// Build the complete frame (always 10 bytes)
    pub fn build(&self) -> Result<Vec<u8>> {
        frame::encode(ServiceType::TunnellingAck, &self.connection_header.encode())
    }

    /// Parse from frame body
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            connection_header: ConnectionHeader::decode(data)?,
        })
    }

    /// Status code echoed by the ack
    pub const fn status(&self) -> u8 {
        self.connection_header.status
    }

    /// Check if request was acknowledged successfully
    pub const fn is_ok(&self) -> bool {
        self.connection_header.status == E_NO_ERROR
    }
}
