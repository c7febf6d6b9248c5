//! KNXnet/IP frame parsing and encoding.
//!
//! All KNXnet/IP frames follow this structure:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use knx_tunnel::protocol::constants::ServiceType;
//! use knx_tunnel::protocol::frame::Frame;
//!
//! let bytes = Frame::new(ServiceType::TunnellingAck, &[0x04, 0x07, 0x00, 0x00])
//!     .encode()
//!     .unwrap();
//! assert_eq!(bytes[..6], [0x06, 0x10, 0x04, 0x21, 0x00, 0x0A]);
//!
//! let frame = Frame::parse(&bytes).unwrap();
//! assert_eq!(frame.service_type(), ServiceType::TunnellingAck);
//! assert_eq!(frame.body(), &[0x04, 0x07, 0x00, 0x00]);
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{KnxError, Result};
use crate::protocol::constants::{ServiceType, HEADER_SIZE_10, IPV4_UDP, KNXNETIP_VERSION_10};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a header for a body of `body_length` bytes.
    pub fn new(service_type: ServiceType, body_length: usize) -> Result<Self> {
        let total_length = u16::try_from(Self::SIZE + body_length)
            .map_err(|_| KnxError::payload_too_large(body_length))?;

        Ok(Self {
            service_type,
            total_length,
        })
    }

    /// Parse a header from a byte slice
    ///
    /// # Errors
    ///
    /// Returns a frame error if:
    /// - Buffer is shorter than 6 bytes
    /// - Header length is not `0x06`
    /// - Protocol version is not `0x10`
    /// - Service type is unknown
    #[inline]
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&[header_length, protocol_version, st_hi, st_lo, len_hi, len_lo]) =
            data.first_chunk::<{ Self::SIZE }>()
        else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        if header_length != HEADER_SIZE_10 {
            return Err(KnxError::invalid_header_length(header_length));
        }

        if protocol_version != KNXNETIP_VERSION_10 {
            return Err(KnxError::unsupported_version(protocol_version));
        }

        let service_type_raw = u16::from_be_bytes([st_hi, st_lo]);
        let service_type = ServiceType::from_u16(service_type_raw)
            .ok_or_else(|| KnxError::unsupported_service_type(service_type_raw))?;

        Ok(Self {
            service_type,
            total_length: u16::from_be_bytes([len_hi, len_lo]),
        })
    }

    /// Encode the header into its 6 wire bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let [st_hi, st_lo] = self.service_type.to_u16().to_be_bytes();
        let [len_hi, len_lo] = self.total_length.to_be_bytes();
        [HEADER_SIZE_10, KNXNETIP_VERSION_10, st_hi, st_lo, len_hi, len_lo]
    }

    /// Get the expected body length from the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Zero-copy view of a KNXnet/IP frame: a service type plus its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    service_type: ServiceType,
    body: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Create a frame around an already encoded body.
    pub const fn new(service_type: ServiceType, body: &'a [u8]) -> Self {
        Self { service_type, body }
    }

    /// Parse a KNXnet/IP frame from a complete datagram.
    ///
    /// The declared total length must match `data.len()` exactly; a
    /// truncated or padded datagram is a frame error.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;

        if usize::from(header.total_length) != data.len() {
            return Err(KnxError::frame_length_mismatch(header.total_length, data.len()));
        }

        Ok(Self {
            service_type: header.service_type,
            body: &data[KnxnetIpHeader::SIZE..],
        })
    }

    /// Get the service type
    #[inline(always)]
    pub const fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Get the frame body (payload after header)
    #[inline(always)]
    pub const fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Encode header and body into a new datagram.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = KnxnetIpHeader::new(self.service_type, self.body.len())?;

        let mut buf = Vec::with_capacity(usize::from(header.total_length));
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(self.body);
        Ok(buf)
    }
}

/// Encode `body` as a frame of the given service type.
pub fn encode(service_type: ServiceType, body: &[u8]) -> Result<Vec<u8>> {
    Frame::new(service_type, body).encode()
}

/// Host Protocol Address Information (HPAI)
///
/// Structure containing endpoint information (IP address and port).
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// Host protocol code
    pub host_protocol: u8,
    /// IPv4 address
    pub ip_address: Ipv4Addr,
    /// UDP port
    pub port: u16,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Create a new HPAI for IPv4 UDP
    pub const fn new(ip_address: Ipv4Addr, port: u16) -> Self {
        Self {
            host_protocol: IPV4_UDP,
            ip_address,
            port,
        }
    }

    /// Parse HPAI from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&[structure_length, host_protocol, a, b, c, d, port_hi, port_lo]) =
            data.first_chunk::<{ Self::SIZE }>()
        else {
            return Err(KnxError::buffer_too_small(data.len()));
        };

        if usize::from(structure_length) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }

        Ok(Self {
            host_protocol,
            ip_address: Ipv4Addr::new(a, b, c, d),
            port: u16::from_be_bytes([port_hi, port_lo]),
        })
    }

    /// Append the 8 wire bytes to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(self.host_protocol);
        buf.extend_from_slice(&self.ip_address.octets());
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// The endpoint as a socket address.
    pub const fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip_address, self.port)
    }
}

impl From<SocketAddrV4> for Hpai {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}
