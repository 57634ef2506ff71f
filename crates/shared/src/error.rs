//! Error types for the Fleety support client

use std::time::Duration;

use thiserror::Error;

/// Failure kinds surfaced to the UI layer.
///
/// Transport and server errors are converted into one of these at the
/// component boundary; nothing above the client sees a raw HTTP error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WidgetError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Credits depleted: {0}")]
    CreditsDepleted(String),

    #[error("Session expired")]
    AuthExpired,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl WidgetError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Returns true if this error is transient and the request may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            WidgetError::Transport(_) => true,
            WidgetError::Server { status, .. } => matches!(status, 502..=504),

            WidgetError::RateLimited { .. } => false,
            WidgetError::CreditsDepleted(_) => false,
            WidgetError::AuthExpired => false,
            WidgetError::Validation(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WidgetError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The single line a UI renders for this failure
    pub fn notice(&self) -> String {
        match self {
            WidgetError::RateLimited {
                message,
                retry_after,
            } => {
                let wait = match retry_after {
                    Some(d) => format!("Please wait {} seconds before trying again.", d.as_secs()),
                    None => "Please wait a moment before trying again.".to_string(),
                };
                format!("⏰ {} {}", message, wait)
            }
            WidgetError::CreditsDepleted(message) => format!("💳 {}", message),
            WidgetError::AuthExpired => {
                "⚠️ Session expired. Please refresh the page and try again.".to_string()
            }
            WidgetError::Validation(message) => message.clone(),
            WidgetError::Transport(message) | WidgetError::Server { message, .. } => {
                format!("⚠️ Sorry, I encountered an error: {}. Please try again.", message)
            }
        }
    }
}

/// Result type alias for client operations
pub type WidgetResult<T> = Result<T, WidgetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_notice_includes_retry_after() {
        let err = WidgetError::RateLimited {
            message: "You're sending requests too fast.".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(
            err.notice(),
            "⏰ You're sending requests too fast. Please wait 30 seconds before trying again."
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(WidgetError::transport("connection reset").is_transient());
        assert!(WidgetError::Server {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(!WidgetError::Server {
            status: 500,
            message: "boom".to_string()
        }
        .is_transient());
        assert!(!WidgetError::AuthExpired.is_transient());
    }
}
