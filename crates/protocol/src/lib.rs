//! Wire protocol for resumable chunked uploads.
//!
//! Every request and response is a JSON [`Message`] envelope. Chunk bytes
//! never travel inside JSON; the transport carries them as a raw frame body
//! next to the envelope.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WireError};
pub use types::SessionStatus;
