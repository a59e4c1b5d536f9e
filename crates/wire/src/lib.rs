//! TCP framing for chunkferry requests.
//!
//! Every request opens a fresh connection, proves the capability token and
//! exchanges exactly one request frame for one response frame.
//!
//! # Wire format
//!
//! See [`frame`] module for the binary layout.

pub mod error;
pub mod frame;
pub mod token;

pub use error::ChannelError;
pub use frame::Frame;
pub use token::{generate_token, validate_token};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Size of each slice when streaming a chunk body (64 KB).
pub const BODY_SLICE_SIZE: usize = 64 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the authentication handshake.
pub const TCP_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
