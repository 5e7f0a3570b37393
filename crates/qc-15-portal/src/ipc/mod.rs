//! IPC Module for the Portal
//!
//! ## Wire Format
//!
//! - Inbound: `[metadata type, shard id, "request", base64(JSON envelope)]`
//! - Outbound: `[metadata type, shard id, status, JSON content]`

pub mod codec;
pub mod payloads;

pub use codec::{decode_action, encode_action, ActionEnvelope, BlockResult, Instruction};
pub use payloads::*;
