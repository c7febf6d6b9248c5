//! Error types for KNXnet/IP tunneling.
//!
//! Every category is a struct wrapping a private kind plus a captured
//! backtrace, exposed through `is_*` predicates instead of public enums.
//! Backtraces are only materialised when `RUST_BACKTRACE` is set.

use core::fmt;
use std::backtrace::Backtrace;
use std::io;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// KNXnet/IP envelope error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameErrorKind {
    BufferTooSmall(usize),
    InvalidHeaderLength(u8),
    UnsupportedVersion(u8),
    UnsupportedServiceType(u16),
    LengthMismatch { declared: u16, actual: usize },
    PayloadTooLarge(usize),
    InvalidStructure,
}

/// cEMI error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CemiErrorKind {
    Truncated(usize),
    LengthMismatch { declared: u8, actual: usize },
    PayloadTooLarge(usize),
    EmptyPayload,
}

/// Connection error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionErrorKind {
    UnexpectedService(u16),
    Rejected(u8),
    NotConnected,
    AlreadyConnected,
    Lost,
    Closed,
    NoIpv4Route,
    Io(io::ErrorKind),
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressingErrorKind {
    InvalidIndividualAddress,
    InvalidGroupAddress,
    OutOfRange,
}

/// Configuration error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigErrorKind {
    MissingKey(&'static str),
    InvalidValue(&'static str),
}

/// Invalid operation variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvalidOperationKind {
    MultiByteToggle(usize),
    NonBooleanToggle(u8),
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNX tunneling error types.
///
/// This is the error type returned by all codec and session operations.
#[derive(Debug)]
pub enum KnxError {
    /// Malformed or length-mismatched KNXnet/IP envelope
    Frame(FrameError),
    /// Undecodable cEMI message, or a payload the builders refuse
    Cemi(CemiDecodeError),
    /// Unsupported cEMI message code received
    Protocol(ProtocolError),
    /// Handshake failure or unusable session
    Connection(ConnectionError),
    /// Socket-level failure
    Transport(TransportError),
    /// Invalid address format or range
    Addressing(AddressingError),
    /// Invalid configuration value
    Config(ConfigError),
    /// Operation not applicable to the current value
    InvalidOperation(InvalidOperation),
    /// A bounded wait expired
    Timeout,
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// KNXnet/IP envelope error with backtrace
#[derive(Debug)]
pub struct FrameError {
    kind: FrameErrorKind,
    backtrace: Backtrace,
}

impl FrameError {
    pub(crate) fn new(kind: FrameErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the declared total length disagrees with the datagram size
    pub fn is_length_mismatch(&self) -> bool {
        matches!(self.kind, FrameErrorKind::LengthMismatch { .. })
    }

    /// Check if the service type identifier is not known
    pub fn is_unsupported_service_type(&self) -> bool {
        matches!(self.kind, FrameErrorKind::UnsupportedServiceType(_))
    }

    /// The unknown service type identifier, if that is the failure
    pub fn service_type_id(&self) -> Option<u16> {
        match self.kind {
            FrameErrorKind::UnsupportedServiceType(id) => Some(id),
            _ => None,
        }
    }

    /// Check if the buffer ended before a complete structure
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self.kind, FrameErrorKind::BufferTooSmall(_))
    }

    /// Check if the protocol version byte is not 1.0
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self.kind, FrameErrorKind::UnsupportedVersion(_))
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// cEMI decode error with backtrace
#[derive(Debug)]
pub struct CemiDecodeError {
    kind: CemiErrorKind,
    backtrace: Backtrace,
}

impl CemiDecodeError {
    pub(crate) fn new(kind: CemiErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the declared MPDU length disagrees with the decoded data
    pub fn is_length_mismatch(&self) -> bool {
        matches!(self.kind, CemiErrorKind::LengthMismatch { .. })
    }

    /// Check if the message ended before the fixed fields
    pub fn is_truncated(&self) -> bool {
        matches!(self.kind, CemiErrorKind::Truncated(_))
    }

    /// Check if the payload exceeds the supported size
    pub fn is_payload_too_large(&self) -> bool {
        matches!(self.kind, CemiErrorKind::PayloadTooLarge(_))
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Unsupported cEMI message code with backtrace
#[derive(Debug)]
pub struct ProtocolError {
    message_code: u8,
    backtrace: Backtrace,
}

impl ProtocolError {
    pub(crate) fn new(message_code: u8) -> Self {
        Self {
            message_code,
            backtrace: Backtrace::capture(),
        }
    }

    /// The rejected cEMI message code
    pub fn message_code(&self) -> u8 {
        self.message_code
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Connection error with backtrace
#[derive(Debug)]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    source: Option<io::Error>,
    backtrace: Backtrace,
}

impl ConnectionError {
    pub(crate) fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    fn from_io(source: io::Error) -> Self {
        Self {
            kind: ConnectionErrorKind::Io(source.kind()),
            source: Some(source),
            backtrace: Backtrace::capture(),
        }
    }

    /// Kind of the socket error that failed the handshake
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self.kind {
            ConnectionErrorKind::Io(kind) => Some(kind),
            _ => None,
        }
    }

    /// Status code returned by the gateway, if it rejected the connection
    pub fn rejected_status(&self) -> Option<u8> {
        match self.kind {
            ConnectionErrorKind::Rejected(status) => Some(status),
            _ => None,
        }
    }

    /// Service type received instead of the expected response
    pub fn unexpected_service(&self) -> Option<u16> {
        match self.kind {
            ConnectionErrorKind::UnexpectedService(id) => Some(id),
            _ => None,
        }
    }

    /// Check if the session was not connected
    pub fn is_not_connected(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::NotConnected)
    }

    /// Check if the session was already connected
    pub fn is_already_connected(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::AlreadyConnected)
    }

    /// Check if the transport failed underneath the session
    pub fn is_lost(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Lost)
    }

    /// Check if the session was closed and cannot be reused
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Closed)
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Transport error wrapping the socket failure
#[derive(Debug)]
pub struct TransportError {
    source: io::Error,
    backtrace: Backtrace,
}

impl TransportError {
    pub(crate) fn new(source: io::Error) -> Self {
        Self {
            source,
            backtrace: Backtrace::capture(),
        }
    }

    /// Kind of the underlying I/O error
    pub fn io_kind(&self) -> io::ErrorKind {
        self.source.kind()
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Addressing error with backtrace
#[derive(Debug)]
pub struct AddressingError {
    kind: AddressingErrorKind,
    backtrace: Backtrace,
}

impl AddressingError {
    pub(crate) fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if address is out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::OutOfRange)
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Configuration error with backtrace
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    backtrace: Backtrace,
}

impl ConfigError {
    pub(crate) fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// The configuration key at fault
    pub fn key(&self) -> &'static str {
        match self.kind {
            ConfigErrorKind::MissingKey(key) | ConfigErrorKind::InvalidValue(key) => key,
        }
    }

    /// Check if a required key was absent
    pub fn is_missing(&self) -> bool {
        matches!(self.kind, ConfigErrorKind::MissingKey(_))
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// Operation refused for the current group value
#[derive(Debug)]
pub struct InvalidOperation {
    kind: InvalidOperationKind,
    backtrace: Backtrace,
}

impl InvalidOperation {
    pub(crate) fn new(kind: InvalidOperationKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if the value was wider than one byte
    pub fn is_multi_byte(&self) -> bool {
        matches!(self.kind, InvalidOperationKind::MultiByteToggle(_))
    }

    /// Captured backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Frame errors
    pub(crate) fn buffer_too_small(len: usize) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::BufferTooSmall(len)))
    }

    pub(crate) fn invalid_header_length(len: u8) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::InvalidHeaderLength(len)))
    }

    pub(crate) fn unsupported_version(version: u8) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::UnsupportedVersion(version)))
    }

    pub(crate) fn unsupported_service_type(id: u16) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::UnsupportedServiceType(id)))
    }

    pub(crate) fn frame_length_mismatch(declared: u16, actual: usize) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::LengthMismatch { declared, actual }))
    }

    pub(crate) fn payload_too_large(len: usize) -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::PayloadTooLarge(len)))
    }

    pub(crate) fn invalid_structure() -> Self {
        Self::Frame(FrameError::new(FrameErrorKind::InvalidStructure))
    }

    // cEMI errors
    pub(crate) fn cemi_truncated(len: usize) -> Self {
        Self::Cemi(CemiDecodeError::new(CemiErrorKind::Truncated(len)))
    }

    pub(crate) fn cemi_length_mismatch(declared: u8, actual: usize) -> Self {
        Self::Cemi(CemiDecodeError::new(CemiErrorKind::LengthMismatch { declared, actual }))
    }

    pub(crate) fn cemi_payload_too_large(len: usize) -> Self {
        Self::Cemi(CemiDecodeError::new(CemiErrorKind::PayloadTooLarge(len)))
    }

    pub(crate) fn cemi_empty_payload() -> Self {
        Self::Cemi(CemiDecodeError::new(CemiErrorKind::EmptyPayload))
    }

    // Protocol errors
    pub(crate) fn unsupported_message_code(code: u8) -> Self {
        Self::Protocol(ProtocolError::new(code))
    }

    // Connection errors
    pub(crate) fn unexpected_service(id: u16) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::UnexpectedService(id)))
    }

    pub(crate) fn connection_rejected(status: u8) -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Rejected(status)))
    }

    pub(crate) fn not_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotConnected))
    }

    pub(crate) fn already_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::AlreadyConnected))
    }

    pub(crate) fn connection_lost() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Lost))
    }

    pub(crate) fn connection_closed() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Closed))
    }

    pub(crate) fn no_ipv4_route() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NoIpv4Route))
    }

    /// Report a socket failure during the handshake as a connection error.
    pub(crate) fn into_handshake_error(self) -> Self {
        match self {
            Self::Transport(err) => Self::Connection(ConnectionError::from_io(err.source)),
            other => other,
        }
    }

    // Addressing errors
    pub(crate) fn invalid_group_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidGroupAddress))
    }

    pub(crate) fn invalid_individual_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidIndividualAddress))
    }

    pub(crate) fn address_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::OutOfRange))
    }

    // Configuration errors
    pub(crate) fn config_missing(key: &'static str) -> Self {
        Self::Config(ConfigError::new(ConfigErrorKind::MissingKey(key)))
    }

    pub(crate) fn config_invalid(key: &'static str) -> Self {
        Self::Config(ConfigError::new(ConfigErrorKind::InvalidValue(key)))
    }

    // Invalid operations
    pub(crate) fn multi_byte_toggle(len: usize) -> Self {
        Self::InvalidOperation(InvalidOperation::new(InvalidOperationKind::MultiByteToggle(len)))
    }

    pub(crate) fn non_boolean_toggle(value: u8) -> Self {
        Self::InvalidOperation(InvalidOperation::new(InvalidOperationKind::NonBooleanToggle(
            value,
        )))
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this is an invalid operation
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }

    /// Check if this is a connection error
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall(len) => write!(f, "buffer too small ({len} bytes)"),
            Self::InvalidHeaderLength(len) => write!(f, "invalid header length {len:#04x}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v:#04x}"),
            Self::UnsupportedServiceType(id) => write!(f, "unsupported service type {id:#06x}"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "total length is {declared} but datagram has {actual} bytes")
            }
            Self::PayloadTooLarge(len) => write!(f, "body of {len} bytes does not fit a frame"),
            Self::InvalidStructure => write!(f, "invalid structure length"),
        }
    }
}

impl fmt::Display for CemiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "message truncated ({len} bytes)"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "APDU length should be {declared} but is {actual}")
            }
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes is too large"),
            Self::EmptyPayload => write!(f, "payload is empty"),
        }
    }
}

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Frame(e) => write!(f, "Frame error: {}", e.kind),
            KnxError::Cemi(e) => write!(f, "cEMI error: {}", e.kind),
            KnxError::Protocol(e) => {
                write!(f, "Protocol error: unimplemented cEMI message code {:#04x}", e.message_code)
            }
            KnxError::Connection(e) => match e.kind {
                ConnectionErrorKind::UnexpectedService(id) => {
                    write!(f, "Connection error: could not initiate tunnel, service type {id:#06x}")
                }
                ConnectionErrorKind::Rejected(status) => write!(
                    f,
                    "Connection error: gateway rejected connection ({})",
                    crate::protocol::constants::status_description(status)
                ),
                ConnectionErrorKind::Io(_) => match &e.source {
                    Some(source) => write!(f, "Connection error: {source}"),
                    None => write!(f, "Connection error: {:?}", e.kind),
                },
                kind => write!(f, "Connection error: {kind:?}"),
            },
            KnxError::Transport(e) => write!(f, "Transport error: {}", e.source),
            KnxError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
            KnxError::Config(e) => match e.kind {
                ConfigErrorKind::MissingKey(key) => write!(f, "Config error: {key} is missing"),
                ConfigErrorKind::InvalidValue(key) => write!(f, "Config error: {key} is invalid"),
            },
            KnxError::InvalidOperation(e) => match e.kind {
                InvalidOperationKind::MultiByteToggle(len) => {
                    write!(f, "Invalid operation: cannot toggle a {len}-octet value")
                }
                InvalidOperationKind::NonBooleanToggle(value) => {
                    write!(f, "Invalid operation: cannot toggle value {value}")
                }
            },
            KnxError::Timeout => write!(f, "Operation timeout"),
        }
    }
}

impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KnxError::Transport(e) => Some(&e.source),
            KnxError::Connection(e) => e.source.as_ref().map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<io::Error> for KnxError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => KnxError::Timeout,
            _ => KnxError::Transport(TransportError::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err = KnxError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_timeout());

        let err = KnxError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = KnxError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(&err, KnxError::Transport(e) if e.io_kind() == io::ErrorKind::ConnectionRefused));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_handshake_io_error_becomes_connection_error() {
        let err = KnxError::from(io::Error::from(io::ErrorKind::PermissionDenied)).into_handshake_error();
        assert!(matches!(&err, KnxError::Connection(e) if e.io_kind() == Some(io::ErrorKind::PermissionDenied)));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("Connection error: "));

        let err = KnxError::from(io::Error::from(io::ErrorKind::TimedOut)).into_handshake_error();
        assert!(err.is_timeout());

        let err = KnxError::connection_rejected(0x24).into_handshake_error();
        assert!(matches!(err, KnxError::Connection(ref e) if e.rejected_status() == Some(0x24)));
    }

    #[test]
    fn test_display_messages() {
        let err = KnxError::cemi_length_mismatch(2, 3);
        assert_eq!(err.to_string(), "cEMI error: APDU length should be 2 but is 3");

        let err = KnxError::multi_byte_toggle(2);
        assert_eq!(err.to_string(), "Invalid operation: cannot toggle a 2-octet value");

        let err = KnxError::unexpected_service(0x0421);
        assert!(err.to_string().contains("0x0421"));
    }

    #[test]
    fn test_connection_helpers() {
        let KnxError::Connection(err) = KnxError::connection_rejected(0x24) else {
            panic!("expected connection error");
        };
        assert_eq!(err.rejected_status(), Some(0x24));
        assert_eq!(err.unexpected_service(), None);
        assert!(!err.is_closed());
    }

    #[test]
    fn test_errors_cross_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KnxError>();
    }
}
