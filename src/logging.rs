//! Logging macro for the tunneling engine.
//!
//! All crate logging goes through [`knx_log!`], which forwards to the
//! `log` facade under the `knx_tunnel` target. Installing a logger
//! (`env_logger`, `simple_logger`, ...) is left to the application, so
//! the engine stays silent unless one is present.
//!
//! # Usage
//!
//! ```rust
//! use knx_tunnel::knx_log;
//!
//! knx_log!(info, "Connection established");
//! knx_log!(debug, "Received {} bytes", 14);
//! knx_log!(warn, "Timeout occurred");
//! ```

/// Logs through the `log` facade with the crate's target.
///
/// Accepts the five `log` levels followed by a format string and
/// arguments.
#[macro_export]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { $crate::__log::info!(target: "knx_tunnel", $($arg)*) };
    (debug, $($arg:tt)*) => { $crate::__log::debug!(target: "knx_tunnel", $($arg)*) };
    (warn, $($arg:tt)*) => { $crate::__log::warn!(target: "knx_tunnel", $($arg)*) };
    (error, $($arg:tt)*) => { $crate::__log::error!(target: "knx_tunnel", $($arg)*) };
    (trace, $($arg:tt)*) => { $crate::__log::trace!(target: "knx_tunnel", $($arg)*) };
}
