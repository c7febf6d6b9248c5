//! KNX Individual Address.
//!
//! Individual addresses identify physical devices on the bus, written
//! `area.line.device`:
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)
//!
//! In tunneling they appear as the cEMI source field. Outgoing group
//! requests carry `0.0.0` and the gateway substitutes its own address.

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Individual Address (Area.Line.Device)
///
/// # Examples
///
/// ```
/// use knx_tunnel::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
///
/// let addr: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x1105);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// The unassigned address `0.0.0`, filled in by the gateway.
    pub const UNSPECIFIED: Self = Self { raw: 0 };

    /// Create a new Individual Address from components.
    ///
    /// # Errors
    ///
    /// Returns an addressing error if area or line exceeds 15.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(KnxError::address_out_of_range());
        }

        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        Ok(Self { raw })
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the area component (0-15).
    #[inline(always)]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Get the line component (0-15).
    #[inline(always)]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Get the device component (0-255).
    #[inline(always)]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.').map(|p| p.parse::<u8>().ok());

        let (Some(Some(area)), Some(Some(line)), Some(Some(device)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(KnxError::invalid_individual_address());
        };

        Self::new(area, line, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_valid() {
        let addr = IndividualAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.line(), 2);
        assert_eq!(addr.device(), 3);
    }

    #[test]
    fn test_new_out_of_range() {
        assert!(IndividualAddress::new(16, 0, 0).is_err());
        assert!(IndividualAddress::new(0, 16, 0).is_err());
    }

    #[test]
    fn test_raw_conversions() {
        let addr = IndividualAddress::from(0x1203u16);
        assert_eq!(addr.to_string(), "1.2.3");
        assert_eq!(u16::from(addr), 0x1203);
        assert_eq!(IndividualAddress::UNSPECIFIED.to_string(), "0.0.0");
    }

    #[test]
    fn test_from_str_invalid() {
        assert!("1.2".parse::<IndividualAddress>().is_err());
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("1.2.3.4".parse::<IndividualAddress>().is_err());
        assert!("a.b.c".parse::<IndividualAddress>().is_err());
        assert!("".parse::<IndividualAddress>().is_err());
    }
}
