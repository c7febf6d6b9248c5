//! KNX addressing.
//!
//! - Individual addresses for physical devices (Area.Line.Device)
//! - Group addresses for shared data points (Main/Middle/Sub or Main/Sub)

pub mod group;
pub mod individual;

pub use group::GroupAddress;
pub use individual::IndividualAddress;
