/// Error type shared by the transport, session, and dispatcher layers.
///
/// Errors never escape a session as panics; they end up as a terminal
/// [`crate::session::SessionOutcome::Failed`] plus the string from
/// [`ChatError::user_message`] written into the assistant placeholder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Backend error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream error: {0}")]
    Protocol(String),
    #[error("Stream idle for {secs}s")]
    IdleTimeout { secs: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category used to pick the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map a backend HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

const GENERIC_FAILURE: &str =
    "Sorry, something went wrong while generating a response. Please try again.";
const SIGN_IN_FAILURE: &str = "Your session has expired. Please sign in again and retry.";
const RATE_LIMIT_FAILURE: &str =
    "The assistant is receiving too many requests right now. Please try again in a moment.";

impl ChatError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::Auth(_) => ErrorCategory::Authentication,
            ChatError::Upstream { status, .. } => category_from_upstream_status(*status),
            ChatError::Config(_)
            | ChatError::Transport(_)
            | ChatError::Protocol(_)
            | ChatError::IdleTimeout { .. }
            | ChatError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// The text shown in place of a failed assistant reply.
    ///
    /// Stream-reported errors carry the backend's message; everything else is
    /// mapped from its category.
    #[must_use]
    pub fn user_message(&self) -> String {
        if let ChatError::Protocol(message) = self {
            return format!("Sorry, the assistant ran into a problem: {message}");
        }
        match self.category() {
            ErrorCategory::Authentication | ErrorCategory::Permission => {
                SIGN_IN_FAILURE.to_string()
            }
            ErrorCategory::RateLimit => RATE_LIMIT_FAILURE.to_string(),
            ErrorCategory::InvalidRequest | ErrorCategory::ServerError | ErrorCategory::Unknown => {
                GENERIC_FAILURE.to_string()
            }
        }
    }
}
