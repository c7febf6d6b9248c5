//! Common External Message Interface (cEMI) group messages.
//!
//! cEMI is the link-layer message carried in the body of a
//! `TUNNELLING_REQUEST`. Only group-oriented `L_Data` traffic is handled
//! here: reads, writes and responses addressed to a [`GroupAddress`].
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable, skipped)      │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data)             │
//! │  ├─ Control Field 1 (1 byte)             │
//! │  ├─ Control Field 2 (1 byte)             │
//! │  ├─ Source Address (2 bytes)             │
//! │  ├─ Destination Address (2 bytes)        │
//! │  ├─ MPDU Length (1 byte)                 │
//! │  ├─ TPCI/APCI (2 bytes)                  │
//! │  └─ Data (variable)                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Values of up to 6 bits ride in the low bits of the APCI byte. Wider
//! values follow as explicit data bytes and the MPDU length counts them.
//!
//! ## Example
//!
//! ```
//! use knx_tunnel::protocol::cemi::{CemiCommand, CemiMessage};
//! use knx_tunnel::ga;
//!
//! let msg = CemiMessage::group_write(ga!(1/2/3), &[1]).unwrap();
//! let bytes = msg.encode();
//! assert_eq!(bytes[8..], [0x01, 0x00, 0x81]);
//!
//! let decoded = CemiMessage::decode(&bytes).unwrap();
//! assert_eq!(decoded.command(), CemiCommand::Write);
//! assert_eq!(decoded.data(), &[1]);
//! ```

use core::fmt;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{CEMIMessageCode, Priority, MAX_PAYLOAD_SIZE};

/// Group value bytes carried by a cEMI message.
pub type Payload = heapless::Vec<u8, MAX_PAYLOAD_SIZE>;

/// Bytes before the data section when no additional info is present.
const BASE_SIZE: usize = 11;

/// APCI bits for `A_GroupValue_Read`
const APCI_GROUP_READ: u16 = 0x0000;
/// APCI bits for `A_GroupValue_Response`
const APCI_GROUP_RESPONSE: u16 = 0x0040;
/// APCI bits for `A_GroupValue_Write`
const APCI_GROUP_WRITE: u16 = 0x0080;

/// Control Field 1 of `L_Data` frame
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 6: Reserved
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: System Broadcast (0=system, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request (0=no ack, 1=ack requested)
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlField1 {
    raw: u8,
}

impl ControlField1 {
    /// Outgoing group frames: standard frame, do not repeat, broadcast,
    /// low priority, no ack request (`0xBC`).
    pub const GROUP: Self = Self { raw: 0xBC };

    /// Get raw byte value
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if frame is standard (true) or extended (false)
    #[inline(always)]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Check if repeat flag is set (do not repeat if true)
    #[inline(always)]
    pub const fn do_not_repeat(self) -> bool {
        (self.raw & 0x20) != 0
    }

    /// Check if this is a broadcast
    #[inline(always)]
    pub const fn is_broadcast(self) -> bool {
        (self.raw & 0x10) != 0
    }

    /// Get priority
    #[inline(always)]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    /// Check if acknowledge is requested
    #[inline(always)]
    pub const fn ack_requested(self) -> bool {
        (self.raw & 0x02) != 0
    }

    /// Check if confirm error flag is set
    #[inline(always)]
    pub const fn has_error(self) -> bool {
        (self.raw & 0x01) != 0
    }
}

impl Default for ControlField1 {
    fn default() -> Self {
        Self::GROUP
    }
}

impl From<u8> for ControlField1 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField1> for u8 {
    #[inline(always)]
    fn from(ctrl: ControlField1) -> u8 {
        ctrl.raw
    }
}

/// Control Field 2 of `L_Data` frame
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlField2 {
    raw: u8,
}

impl ControlField2 {
    /// Group destination, hop count 6, standard format (`0xE0`).
    pub const GROUP: Self = Self { raw: 0xE0 };

    /// Get raw byte value
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if destination is group address (true) or individual (false)
    #[inline(always)]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get hop count (0-7)
    #[inline(always)]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }

    /// Get extended frame format
    #[inline(always)]
    pub const fn extended_format(self) -> u8 {
        self.raw & 0x0F
    }
}

impl Default for ControlField2 {
    fn default() -> Self {
        Self::GROUP
    }
}

impl From<u8> for ControlField2 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField2> for u8 {
    #[inline(always)]
    fn from(ctrl: ControlField2) -> u8 {
        ctrl.raw
    }
}

/// Application-layer command of a group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CemiCommand {
    /// `A_GroupValue_Read`
    Read,
    /// `A_GroupValue_Write`
    Write,
    /// `A_GroupValue_Response`
    Response,
    /// Any other APCI
    Unknown,
}

impl CemiCommand {
    /// Classify the low 10 bits of a TPCI/APCI field.
    ///
    /// The tests run in a fixed order: the write bit wins over the
    /// response bit, and only an all-zero APCI is a read.
    ///
    /// ```
    /// use knx_tunnel::protocol::cemi::CemiCommand;
    ///
    /// assert_eq!(CemiCommand::classify(0x0081), CemiCommand::Write);
    /// assert_eq!(CemiCommand::classify(0x0000), CemiCommand::Read);
    /// assert_eq!(CemiCommand::classify(0x0041), CemiCommand::Response);
    /// assert_eq!(CemiCommand::classify(0x00C0), CemiCommand::Write);
    /// assert_eq!(CemiCommand::classify(0x0001), CemiCommand::Unknown);
    /// ```
    pub const fn classify(tpci_apci: u16) -> Self {
        let apci = tpci_apci & 0x03FF;
        if apci & APCI_GROUP_WRITE != 0 {
            Self::Write
        } else if apci == APCI_GROUP_READ {
            Self::Read
        } else if apci & APCI_GROUP_RESPONSE != 0 {
            Self::Response
        } else {
            Self::Unknown
        }
    }

    /// Two-letter tag used in log output.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Read => "RD",
            Self::Write => "WR",
            Self::Response => "RS",
            Self::Unknown => "??",
        }
    }
}

/// A decoded or freshly built group-oriented cEMI message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CemiMessage {
    code: u8,
    ctrl1: ControlField1,
    ctrl2: ControlField2,
    source: IndividualAddress,
    destination: GroupAddress,
    tpci_apci: u16,
    command: CemiCommand,
    data: Payload,
}

impl CemiMessage {
    /// Decode a cEMI message body.
    ///
    /// Any additional info block is skipped. The declared MPDU length must
    /// equal the number of bytes from the APCI byte to the end of `cemi`.
    pub fn decode(cemi: &[u8]) -> Result<Self> {
        let offset = usize::from(*cemi.get(1).ok_or_else(|| KnxError::cemi_truncated(cemi.len()))?);
        if cemi.len() < BASE_SIZE + offset {
            return Err(KnxError::cemi_truncated(cemi.len()));
        }

        let code = cemi[0];
        let fields = &cemi[2 + offset..];
        let ctrl1 = ControlField1::from(fields[0]);
        let ctrl2 = ControlField2::from(fields[1]);
        let source = IndividualAddress::from(u16::from_be_bytes([fields[2], fields[3]]));
        let destination = GroupAddress::from(u16::from_be_bytes([fields[4], fields[5]]));
        let mpdu_len = fields[6];
        let tpci_apci = u16::from_be_bytes([fields[7], fields[8]]);
        let command = CemiCommand::classify(tpci_apci);

        // APCI low byte onwards
        let apdu = &fields[8..];
        if apdu.len() != usize::from(mpdu_len) {
            return Err(KnxError::cemi_length_mismatch(mpdu_len, apdu.len()));
        }

        let data = if apdu.len() == 1 {
            let mut inline = Payload::new();
            inline
                .push((tpci_apci & 0x3F) as u8)
                .map_err(|_| KnxError::cemi_payload_too_large(1))?;
            inline
        } else {
            Payload::from_slice(&apdu[1..]).map_err(|_| KnxError::cemi_payload_too_large(apdu.len() - 1))?
        };

        Ok(Self {
            code,
            ctrl1,
            ctrl2,
            source,
            destination,
            tpci_apci,
            command,
            data,
        })
    }

    /// Build an `L_Data.req` group write.
    ///
    /// `data` must hold between 1 and 254 bytes.
    pub fn group_write(destination: GroupAddress, data: &[u8]) -> Result<Self> {
        Self::group_value(destination, APCI_GROUP_WRITE, CemiCommand::Write, data)
    }

    /// Build an `L_Data.req` group read.
    pub fn group_read(destination: GroupAddress) -> Self {
        let data: Payload = [0].into_iter().collect();
        Self::group(destination, APCI_GROUP_READ, CemiCommand::Read, data)
    }

    /// Build a group response, as a device answering a read would send.
    pub fn group_response(destination: GroupAddress, data: &[u8]) -> Result<Self> {
        Self::group_value(destination, APCI_GROUP_RESPONSE, CemiCommand::Response, data)
    }

    /// Replace the message code, e.g. to mark a message as `L_Data.ind`.
    #[must_use]
    pub fn with_message_code(mut self, code: CEMIMessageCode) -> Self {
        self.code = code.to_u8();
        self
    }

    /// Replace the source address.
    #[must_use]
    pub fn with_source(mut self, source: IndividualAddress) -> Self {
        self.source = source;
        self
    }

    fn group_value(destination: GroupAddress, apci: u16, command: CemiCommand, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(KnxError::cemi_empty_payload());
        }
        let data = Payload::from_slice(data).map_err(|_| KnxError::cemi_payload_too_large(data.len()))?;
        Ok(Self::group(destination, apci, command, data))
    }

    fn group(destination: GroupAddress, tpci_apci: u16, command: CemiCommand, data: Payload) -> Self {
        Self {
            code: CEMIMessageCode::LDataReq.to_u8(),
            ctrl1: ControlField1::GROUP,
            ctrl2: ControlField2::GROUP,
            source: IndividualAddress::UNSPECIFIED,
            destination,
            tpci_apci,
            command,
            data,
        }
    }

    /// Encode the message without additional info.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BASE_SIZE + self.data.len());
        buf.push(self.code);
        buf.push(0x00);
        buf.push(self.ctrl1.raw());
        buf.push(self.ctrl2.raw());
        buf.extend_from_slice(&u16::from(self.source).to_be_bytes());
        buf.extend_from_slice(&u16::from(self.destination).to_be_bytes());

        let [tpci, apci] = self.tpci_apci.to_be_bytes();
        match self.data.as_slice() {
            // Fits in the low APCI bits unchanged
            &[value] if value & 0x03 == value => {
                buf.extend_from_slice(&[1, tpci, apci.wrapping_add(value)]);
            }
            data => {
                // Payload is capped at 254 bytes so 1 + len fits
                buf.extend_from_slice(&[1 + data.len() as u8, tpci, apci]);
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    /// Raw message code byte.
    #[inline(always)]
    pub const fn code(&self) -> u8 {
        self.code
    }

    /// Message code, if it is one this crate knows.
    pub const fn message_code(&self) -> Option<CEMIMessageCode> {
        CEMIMessageCode::from_u8(self.code)
    }

    /// Control field 1
    #[inline(always)]
    pub const fn control1(&self) -> ControlField1 {
        self.ctrl1
    }

    /// Control field 2
    #[inline(always)]
    pub const fn control2(&self) -> ControlField2 {
        self.ctrl2
    }

    /// Sender of the message (`0.0.0` on outgoing requests).
    #[inline(always)]
    pub const fn source(&self) -> IndividualAddress {
        self.source
    }

    /// Target group address
    #[inline(always)]
    pub const fn destination(&self) -> GroupAddress {
        self.destination
    }

    /// Raw TPCI/APCI field
    #[inline(always)]
    pub const fn tpci_apci(&self) -> u16 {
        self.tpci_apci
    }

    /// Classified command
    #[inline(always)]
    pub const fn command(&self) -> CemiCommand {
        self.command
    }

    /// Group value bytes
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Group value bytes as an owned payload.
    pub fn payload(&self) -> &Payload {
        &self.data
    }
}

impl fmt::Display for CemiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {} {:?}",
            self.source,
            self.destination,
            self.command.tag(),
            self.data.as_slice()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_inline_write() {
        let data = [0x29, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x81];
        let msg = CemiMessage::decode(&data).unwrap();

        assert_eq!(msg.message_code(), Some(CEMIMessageCode::LDataInd));
        assert_eq!(msg.command(), CemiCommand::Write);
        assert_eq!(u16::from(msg.destination()), 1);
        assert_eq!(msg.data(), &[1]);
        assert!(msg.control2().is_group_address());
        assert_eq!(msg.control2().hop_count(), 6);
    }

    #[test]
    fn test_decode_with_additional_info() {
        let data = [
            0x29, 0x02, 0xAA, 0xBB, // 2 bytes of additional info
            0xBC, 0xE0, 0x11, 0x05, 0x0A, 0x03, 0x03, 0x00, 0x40, 0x0C, 0x1A,
        ];
        let msg = CemiMessage::decode(&data).unwrap();

        assert_eq!(msg.command(), CemiCommand::Response);
        assert_eq!(msg.source().to_string(), "1.1.5");
        assert_eq!(msg.destination().to_string(), "1/2/3");
        assert_eq!(msg.data(), &[0x0C, 0x1A]);
    }

    #[test]
    fn test_decode_read() {
        let data = [0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x00, 0x07, 0x01, 0x00, 0x00];
        let msg = CemiMessage::decode(&data).unwrap();
        assert_eq!(msg.command(), CemiCommand::Read);
        assert_eq!(msg.data(), &[0]);
    }

    #[test]
    fn test_decode_length_mismatch() {
        // Declares 2 APDU bytes, carries 3
        let data = [0x29, 0x00, 0xBC, 0xE0, 0, 0, 0, 1, 0x02, 0x00, 0x80, 0x01, 0x02];
        let err = CemiMessage::decode(&data).unwrap_err();
        assert!(matches!(err, KnxError::Cemi(ref e) if e.is_length_mismatch()));
        assert_eq!(err.to_string(), "cEMI error: APDU length should be 2 but is 3");
    }

    #[test]
    fn test_decode_truncated() {
        for len in 0..BASE_SIZE {
            let data = [0x29, 0x00, 0xBC, 0xE0, 0, 0, 0, 1, 0x01, 0x00, 0x81];
            let err = CemiMessage::decode(&data[..len]).unwrap_err();
            assert!(matches!(err, KnxError::Cemi(ref e) if e.is_truncated()));
        }

        // Additional info length points past the end
        let data = [0x29, 0x05, 0xBC, 0xE0, 0, 0, 0, 1, 0x01, 0x00, 0x81];
        assert!(CemiMessage::decode(&data).is_err());
    }

    #[test]
    fn test_encode_group_read() {
        let msg = CemiMessage::group_read(GroupAddress::from(0x0A03));
        assert_eq!(
            msg.encode(),
            [0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x00]
        );
        assert_eq!(msg.command(), CemiCommand::Read);
        assert_eq!(msg.data(), &[0]);
    }

    #[test]
    fn test_encode_inline_boundary() {
        let dst = GroupAddress::from(1);

        for value in 0..=3u8 {
            let bytes = CemiMessage::group_write(dst, &[value]).unwrap().encode();
            assert_eq!(bytes.len(), BASE_SIZE);
            assert_eq!(bytes[8..], [0x01, 0x00, 0x80 + value]);
        }

        for value in [4u8, 0x3F, 0xFF] {
            let bytes = CemiMessage::group_write(dst, &[value]).unwrap().encode();
            assert_eq!(bytes[8..], [0x02, 0x00, 0x80, value]);
        }

        let bytes = CemiMessage::group_write(dst, &[0x00, 0x01]).unwrap().encode();
        assert_eq!(bytes[8..], [0x03, 0x00, 0x80, 0x00, 0x01]);
    }

    #[test]
    fn test_builder_rejects_bad_payloads() {
        let dst = GroupAddress::from(1);

        let err = CemiMessage::group_write(dst, &[]).unwrap_err();
        assert!(matches!(err, KnxError::Cemi(_)));

        let err = CemiMessage::group_write(dst, &[0u8; MAX_PAYLOAD_SIZE + 1]).unwrap_err();
        assert!(matches!(err, KnxError::Cemi(ref e) if e.is_payload_too_large()));

        assert!(CemiMessage::group_write(dst, &[0u8; MAX_PAYLOAD_SIZE]).is_ok());
    }

    #[test]
    fn test_group_response_as_indication() {
        let msg = CemiMessage::group_response(GroupAddress::from(0x0A03), &[1])
            .unwrap()
            .with_message_code(CEMIMessageCode::LDataInd)
            .with_source(IndividualAddress::from(0x1105));
        let bytes = msg.encode();
        assert_eq!(bytes[0], 0x29);
        assert_eq!(bytes[8..], [0x01, 0x00, 0x41]);

        let decoded = CemiMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.command(), CemiCommand::Response);
        assert_eq!(decoded.source(), msg.source());
        assert_eq!(decoded.data(), &[1]);
    }

    #[test]
    fn test_display() {
        let msg = CemiMessage::group_write(GroupAddress::from(0x0A03), &[0x0C, 0x1A]).unwrap();
        assert_eq!(msg.to_string(), "0.0.0 -> 1/2/3 WR [12, 26]");
    }

    #[test]
    fn test_control_field_defaults() {
        let ctrl1 = ControlField1::default();
        assert_eq!(ctrl1.raw(), 0xBC);
        assert!(ctrl1.is_standard_frame());
        assert!(ctrl1.do_not_repeat());
        assert!(ctrl1.is_broadcast());
        assert_eq!(ctrl1.priority(), Priority::Low);
        assert!(!ctrl1.ack_requested());
        assert!(!ctrl1.has_error());

        assert_eq!(u8::from(ControlField2::default()), 0xE0);
    }

    proptest! {
        #[test]
        fn test_group_write_round_trip(
            raw in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD_SIZE),
        ) {
            let dst = GroupAddress::from(raw);
            let decoded = CemiMessage::decode(&CemiMessage::group_write(dst, &data).unwrap().encode()).unwrap();

            prop_assert_eq!(decoded.command(), CemiCommand::Write);
            prop_assert_eq!(decoded.destination(), dst);
            prop_assert_eq!(decoded.data(), data.as_slice());
        }

        #[test]
        fn test_group_read_round_trip(raw in any::<u16>()) {
            let dst = GroupAddress::from(raw);
            let decoded = CemiMessage::decode(&CemiMessage::group_read(dst).encode()).unwrap();

            prop_assert_eq!(decoded.command(), CemiCommand::Read);
            prop_assert_eq!(decoded.destination(), dst);
            prop_assert_eq!(decoded.data(), &[0u8][..]);
        }
    }
}
