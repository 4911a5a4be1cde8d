//! Wire protocols spoken over the device link.
//!
//! - [`frame`]: binary frames for the parameter and bootloader modes
//! - [`decoder`]: incremental stream decoder for both text and frames
//! - [`crc`]: frame checksum
//! - [`text`]: CLI-mode command lines and their replies

pub mod crc;
pub mod decoder;
pub mod frame;
pub mod text;

pub use decoder::{DecodeRules, Decoded, FrameDecoder};
pub use frame::{Command, Frame, Request, Status};
