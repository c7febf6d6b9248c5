//! KNXnet/IP protocol constants and service type identifiers.

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Largest application payload a cEMI group message carries here.
///
/// The MPDU length field is a single byte and counts the TPCI/APCI byte,
/// so 254 data bytes is the ceiling.
pub const MAX_PAYLOAD_SIZE: usize = 254;

/// Receive buffer size for a single KNXnet/IP datagram
pub const MAX_PACKET_SIZE: usize = 512;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP Core Service Type Identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `SEARCH_REQUEST` - Device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,

    // Device Management (0x03xx)
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    // Tunnelling (0x04xx)
    /// `TUNNELLING_REQUEST` - Tunnelling data request
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK` - Tunnelling acknowledgement
    TunnellingAck = 0x0421,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE` - Routing lost message indication
    RoutingLostMessage = 0x0531,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnellingRequest),
            0x0421 => Some(Self::TunnellingAck),
            0x0530 => Some(Self::RoutingIndication),
            0x0531 => Some(Self::RoutingLostMessage),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Connection type for `REMLOG_CONNECTION`
pub const REMLOG_CONNECTION: u8 = 0x06;

/// Connection type for `REMCONF_CONNECTION`
pub const REMCONF_CONNECTION: u8 = 0x07;

/// Connection type for `OBJSVR_CONNECTION`
pub const OBJSVR_CONNECTION: u8 = 0x08;

/// Tunnel KNX layer: link layer (`TUNNEL_LINKLAYER`)
pub const TUNNEL_LINKLAYER: u8 = 0x02;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Error Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for unsupported host protocol
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;

/// Error code for unsupported protocol version
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;

/// Error code for out-of-order sequence number
pub const E_SEQUENCE_NUMBER: u8 = 0x04;

/// Error code for unknown channel id
pub const E_CONNECTION_ID: u8 = 0x21;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for KNX connection error
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Error code for tunnelling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;

/// Human-readable description of a KNXnet/IP status code.
///
/// ```
/// use knx_tunnel::protocol::constants::{status_description, E_NO_MORE_CONNECTIONS};
///
/// assert_eq!(status_description(E_NO_MORE_CONNECTIONS), "no more connections available");
/// ```
pub const fn status_description(status: u8) -> &'static str {
    match status {
        E_NO_ERROR => "no error",
        E_HOST_PROTOCOL_TYPE => "host protocol type not supported",
        E_VERSION_NOT_SUPPORTED => "protocol version not supported",
        E_SEQUENCE_NUMBER => "sequence number out of order",
        E_CONNECTION_ID => "unknown connection id",
        E_CONNECTION_TYPE => "connection type not supported",
        E_CONNECTION_OPTION => "connection option not supported",
        E_NO_MORE_CONNECTIONS => "no more connections available",
        E_DATA_CONNECTION => "data connection error",
        E_KNX_CONNECTION => "KNX connection error",
        E_TUNNELLING_LAYER => "tunnelling layer not supported",
        _ => "unknown status",
    }
}

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI Message Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CEMIMessageCode {
    /// `L_Raw.req` - Raw frame request
    LRawReq = 0x10,
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Poll_Data.req` - Poll data request
    LPollDataReq = 0x13,
    /// `L_Raw.ind` - Raw frame indication
    LRawInd = 0x2D,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
    /// `L_Busmon.ind` - Bus monitor indication
    LBusmonInd = 0x2B,
    /// `L_Raw.con` - Raw frame confirmation
    LRawCon = 0x2F,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `L_Poll_Data.con` - Poll data confirmation
    LPollDataCon = 0x25,
}

impl CEMIMessageCode {
    /// Convert u8 to `CEMIMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::LRawReq),
            0x11 => Some(Self::LDataReq),
            0x13 => Some(Self::LPollDataReq),
            0x2D => Some(Self::LRawInd),
            0x29 => Some(Self::LDataInd),
            0x2B => Some(Self::LBusmonInd),
            0x2F => Some(Self::LRawCon),
            0x2E => Some(Self::LDataCon),
            0x25 => Some(Self::LPollDataCon),
            _ => None,
        }
    }

    /// Convert `CEMIMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this code carries delivered or confirmed bus traffic
    /// that the gateway expects a `TUNNELLING_ACK` for.
    pub const fn is_data_delivery(self) -> bool {
        matches!(self, Self::LDataInd | Self::LDataCon)
    }
}

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority
    #[default]
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Convert u8 to Priority (only the low two bits are used)
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}
