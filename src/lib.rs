#![doc = include_str!("../README.md")]

//! ## Layout
//!
//! The [`protocol`] modules are pure codecs and never touch a socket.
//! [`TunnelSession`] owns the UDP sockets and the listener thread and is
//! the entry point for applications.

// Macro modules (must be declared before use)
#[macro_use]
mod logging;
#[macro_use]
pub mod macros;

pub mod addressing;
pub mod cache;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::{GroupAddress, IndividualAddress};
#[doc(inline)]
pub use cache::ValueCache;
#[doc(inline)]
pub use config::TunnelConfig;
#[doc(inline)]
pub use error::{KnxError, Result};
#[doc(inline)]
pub use protocol::{CemiCommand, CemiMessage, Frame, Payload};
#[doc(inline)]
pub use session::{SessionPhase, TunnelSession};

#[doc(hidden)]
pub use ::log as __log;
