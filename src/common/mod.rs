//! # Common Components
//!
//! Protocol pieces shared by the server and the upload client.
//!
//! ## Modules
//!
//! - [`frame`]: wire framing and response constants
//! - [`identifier`]: homework id validation
//! - [`error`]: per-upload failure kinds
//! - [`config`]: configuration parsing utilities
//! - [`logging`]: log output format shared by the binaries

pub mod config;
pub mod error;
pub mod frame;
pub mod identifier;
pub mod logging;
