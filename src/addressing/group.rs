//! KNX Group Address.
//!
//! Group addresses name shared data points (a light, a sensor value)
//! that several devices read and write. Two notations exist:
//! - 3-level: Main/Middle/Sub (e.g., 1/2/3) - most common
//! - 2-level: Main/Sub (e.g., 1/234)
//!
//! Internally stored as 16 bits:
//! - Main: 5 bits (0-31)
//! - Middle: 3 bits (0-7)
//! - Sub: 8 bits (0-255)

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Group Address
///
/// # Examples
///
/// ```
/// use knx_tunnel::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let addr = GroupAddress::from(0x0A03u16);
/// assert_eq!((addr.main(), addr.middle(), addr.sub()), (1, 2, 3));
///
/// // Parsing auto-detects the notation
/// let addr: GroupAddress = "1/234".parse().unwrap();
/// assert_eq!(addr.sub_2level(), 234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub value for 2-level format (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Create a new 3-level Group Address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if main > 31 or middle > 7.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(KnxError::address_out_of_range());
        }

        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a new 2-level Group Address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if main > 31 or sub > 2047.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN || sub > Self::MAX_SUB_2LEVEL {
            return Err(KnxError::address_out_of_range());
        }

        let raw = (u16::from(main) << 11) | sub;
        Ok(Self { raw })
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the main group component (0-31).
    #[inline(always)]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component for 3-level format (0-7).
    #[inline(always)]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component for 3-level format (0-255).
    #[inline(always)]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the sub group component for 2-level format (0-2047).
    #[inline(always)]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// Format as 2-level string (Main/Sub).
    pub fn to_string_2level(&self) -> String {
        format!("{}/{}", self.main(), self.sub_2level())
    }
}

impl From<u16> for GroupAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline(always)]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    /// Format as 3-level address by default
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl core::str::FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');

        let main = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(KnxError::invalid_group_address)?;

        let second = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(KnxError::invalid_group_address)?;

        match (parts.next(), parts.next()) {
            // 2-level: the second part is the 11-bit sub group
            (None, _) => Self::new_2level(main, second),
            (Some(sub), None) => {
                let middle = u8::try_from(second).map_err(|_| KnxError::invalid_group_address())?;
                let sub = sub.parse::<u8>().map_err(|_| KnxError::invalid_group_address())?;
                Self::new(main, middle, sub)
            }
            (Some(_), Some(_)) => Err(KnxError::invalid_group_address()),
        }
    }
}
