//! Control-plane protocol definitions
//!
//! This crate defines the messages exchanged on a tunnel connection's control
//! stream and the length-prefixed codec used to frame them.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
