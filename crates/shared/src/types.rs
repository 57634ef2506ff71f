//! Common types used across the Fleety support client

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Prefix of message ids that only exist locally until the backend confirms them
pub const PROVISIONAL_ID_PREFIX: &str = "temp-";

// =============================================================================
// ID Wrappers
// =============================================================================

/// Project ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ticket slug wrapper (the stable, shareable identifier of a ticket)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketSlug(pub String);

impl TicketSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketSlug {
    fn from(slug: &str) -> Self {
        Self(slug.to_string())
    }
}

impl From<String> for TicketSlug {
    fn from(slug: String) -> Self {
        Self(slug)
    }
}

impl std::fmt::Display for TicketSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one push channel: a ticket within a project
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub project_id: ProjectId,
    pub ticket_slug: TicketSlug,
}

impl SubscriptionKey {
    pub fn new(project_id: impl Into<ProjectId>, ticket_slug: impl Into<TicketSlug>) -> Self {
        Self {
            project_id: project_id.into(),
            ticket_slug: ticket_slug.into(),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.ticket_slug)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Upper-case label for badges ("IN PROGRESS")
    pub fn label(&self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who wrote a ticket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAuthor {
    User,
    Admin,
    System,
}

impl MessageAuthor {
    /// Name shown to the visitor next to a message
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::User => "You",
            Self::Admin => "Support",
            Self::System => "System",
        }
    }
}

/// A party that can acknowledge a message as read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reader {
    User,
    Admin,
}

/// Kind of entry in a ticket thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    StatusChange,
}

// =============================================================================
// Tickets
// =============================================================================

/// Status transition attached to a `status_change` message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
}

/// One entry in a ticket thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: String,
    pub author: MessageAuthor,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub read_by: Vec<Reader>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StatusChangeMetadata>,
}

impl TicketMessage {
    /// An admin message the visitor has not acknowledged yet
    pub fn is_unread_by_user(&self) -> bool {
        self.author == MessageAuthor::Admin && !self.read_by.contains(&Reader::User)
    }

    /// True for locally created messages awaiting backend confirmation
    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_ID_PREFIX)
    }
}

/// Support ticket as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub slug: TicketSlug,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TicketStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub created_by_ai: bool,
    #[serde(default)]
    pub messages: Vec<TicketMessage>,
}

impl Ticket {
    /// Number of admin messages whose readers do not include the visitor
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_unread_by_user())
            .count()
    }
}

/// Locally persisted projection of a ticket the visitor created or loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTicket {
    pub slug: TicketSlug,
    pub title: String,
    pub status: TicketStatus,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: usize,
}

impl From<&Ticket> for SavedTicket {
    fn from(ticket: &Ticket) -> Self {
        Self {
            slug: ticket.slug.clone(),
            title: ticket.title.clone(),
            status: ticket.status,
            unread_count: ticket.unread_count(),
        }
    }
}

// =============================================================================
// API Request/Response Types
// =============================================================================

/// Session init request
#[derive(Debug, Clone, Serialize)]
pub struct InitSessionRequest {
    pub project_id: ProjectId,
}

/// Session init response
#[derive(Debug, Clone, Deserialize)]
pub struct InitSessionResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub project_id: ProjectId,
}

/// Create ticket request
#[derive(Debug, Clone, Serialize)]
pub struct CreateTicketRequest {
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Add message request
#[derive(Debug, Clone, Serialize)]
pub struct AddMessageRequest {
    pub author: MessageAuthor,
    pub content: String,
}

/// Mark messages read request
#[derive(Debug, Clone, Serialize)]
pub struct MarkReadRequest {
    pub reader: Reader,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message(author: &str, read_by: &str) -> String {
        format!(
            r#"{{"id":"m","author":"{}","content":"hi","timestamp":"2025-01-01T00:00:00Z","read_by":{}}}"#,
            author, read_by
        )
    }

    #[test]
    fn test_unread_count_only_counts_admin_messages_unread_by_user() {
        let json = format!(
            r#"{{"id":"1","slug":"abc-123","title":"Help","description":"d","status":"open",
                "created_at":"2025-01-01T00:00:00Z","updated_at":"2025-01-01T00:00:00Z",
                "messages":[{},{},{}]}}"#,
            message("admin", "[]"),
            message("admin", r#"["user"]"#),
            message("user", r#"["user"]"#),
        );
        let ticket: Ticket = serde_json::from_str(&json).unwrap();
        assert_eq!(ticket.unread_count(), 1);
    }

    #[test]
    fn test_missing_read_by_counts_as_unread() {
        let json = r#"{"id":"m","author":"admin","content":"hi","timestamp":"2025-01-01T00:00:00Z"}"#;
        let msg: TicketMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_unread_by_user());
        assert!(!msg.is_provisional());
    }

    #[test]
    fn test_status_change_message_metadata() {
        let json = r#"{"id":"s","author":"system","content":"Status changed","timestamp":"2025-01-01T00:00:00Z",
            "read_by":[],"type":"status_change","metadata":{"old_status":"open","new_status":"resolved"}}"#;
        let msg: TicketMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, Some(MessageKind::StatusChange));
        assert_eq!(
            msg.metadata.and_then(|m| m.new_status).as_deref(),
            Some("resolved")
        );
    }

    #[test]
    fn test_saved_ticket_uses_camel_case_unread_count() {
        let saved = SavedTicket {
            slug: TicketSlug::from("abc-123"),
            title: "Help".to_string(),
            status: TicketStatus::InProgress,
            unread_count: 2,
        };
        let json = serde_json::to_string(&saved).unwrap();
        assert_eq!(
            json,
            r#"{"slug":"abc-123","title":"Help","status":"in_progress","unreadCount":2}"#
        );
    }

    #[test]
    fn test_status_label() {
        assert_eq!(TicketStatus::InProgress.label(), "IN PROGRESS");
        assert_eq!(TicketStatus::Closed.label(), "CLOSED");
    }

    #[test]
    fn test_subscription_key_display() {
        let key = SubscriptionKey::new("proj", "abc-123");
        assert_eq!(key.to_string(), "proj/abc-123");
    }
}
