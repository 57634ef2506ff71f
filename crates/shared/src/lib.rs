//! Fleety Shared Types
//!
//! Wire types and errors shared by the Fleety support client crates.

pub mod chat;
pub mod error;
pub mod push;
pub mod types;

pub use chat::*;
pub use error::*;
pub use push::{PushKind, PushMessage};
pub use types::*;
