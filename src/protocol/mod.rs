//! KNXnet/IP protocol implementation.
//!
//! Frame envelope, cEMI group messages, tunneling service bodies and the
//! sans-IO tunnel handshake. Nothing in here touches a socket.

pub mod cemi;
pub mod constants;
pub mod frame;
pub mod services;
pub mod tunnel;

pub use cemi::{CemiCommand, CemiMessage, ControlField1, ControlField2, Payload};
pub use constants::{CEMIMessageCode, ServiceType};
pub use frame::{Frame, Hpai, KnxnetIpHeader};
pub use services::{ConnectionHeader, TunnelingAck, TunnelingRequest};
pub use tunnel::{ConnectionState, TunnelClient};
