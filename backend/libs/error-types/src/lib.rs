use serde::{Deserialize, Serialize};

/// Unified API error body returned by every HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short HTTP reason phrase ("Not Found", "Conflict", ...)
    pub error: String,

    /// Human readable message
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// Error category used by clients to route handling.
    /// One of the constants in [`error_types`].
    pub error_type: String,

    /// Stable machine readable code, one of [`error_codes`]
    pub code: String,

    /// Whether repeating the same request later may succeed
    pub retryable: bool,

    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            retryable: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Stable error codes for the delivery core
pub mod error_codes {
    // Conversations
    pub const CONVERSATION_NOT_FOUND: &str = "CONVERSATION_NOT_FOUND";
    pub const GROUP_ALREADY_EXISTS: &str = "GROUP_ALREADY_EXISTS";
    pub const ALREADY_MEMBER: &str = "ALREADY_MEMBER";
    pub const INVITE_ALREADY_PENDING: &str = "INVITE_ALREADY_PENDING";
    pub const NOT_CONVERSATION_MEMBER: &str = "NOT_CONVERSATION_MEMBER";

    // Messages
    pub const MESSAGE_NOT_FOUND: &str = "MESSAGE_NOT_FOUND";
    pub const MESSAGE_DELETED: &str = "MESSAGE_DELETED";
    pub const EDIT_WINDOW_EXPIRED: &str = "EDIT_WINDOW_EXPIRED";
    pub const SEQUENCE_CONFLICT: &str = "SEQUENCE_CONFLICT";

    // Requests
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const IDENTITY_MISSING: &str = "IDENTITY_MISSING";

    // Database/System
    pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
}

/// Error categories
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}
