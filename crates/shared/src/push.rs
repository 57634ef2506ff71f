//! Ticket push channel messages
//!
//! Every frame on a ticket channel is `{"type": ..., "payload": ...}`. The
//! payload shape is not guaranteed complete, so it stays untyped until a
//! consumer asks for a specific view of it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Ticket;

/// Type tag of a push frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// A message was added to the ticket
    NewMessage,
    /// The ticket status changed
    StatusChange,
    /// Full ticket snapshot
    TicketUpdate,
    /// Server-side error on the channel
    Error,
    /// Subscription acknowledged
    Subscribed,
}

/// One frame received on a ticket channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: PushKind,
    #[serde(default)]
    pub payload: Value,
}

impl PushMessage {
    pub fn new(kind: PushKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Full ticket carried by a `ticket_update`, if the payload is complete
    pub fn ticket_snapshot(&self) -> Option<Ticket> {
        match self.kind {
            PushKind::TicketUpdate => serde_json::from_value(self.payload.clone()).ok(),
            _ => None,
        }
    }

    /// Whether the ticket must be fetched again to learn what changed
    pub fn requires_refetch(&self) -> bool {
        matches!(self.kind, PushKind::NewMessage | PushKind::StatusChange)
    }

    /// Human readable message of an `error` frame
    pub fn error_message(&self) -> Option<&str> {
        match self.kind {
            PushKind::Error => self
                .payload
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| self.payload.as_str()),
            _ => None,
        }
    }
}
