//! Pure PostgreSQL frontend/backend protocol v3.0 framing, parsing and
//! emission. Nothing in this module touches a socket: it only consumes and
//! produces byte buffers, so it can run on either side of the client/server
//! split without duplication.

mod protocol;

#[cfg(test)]
mod protocol_tests;

pub use protocol::*;

/// Default maximum frame length (length field value, covers itself),
/// matching the conservative ceiling used by mainstream poolers.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

pub const SSL_REQUEST_CODE: i32 = 80877103; // 0x04D2162F
pub const PROTOCOL_VERSION_3: u32 = 0x0003_0000;
