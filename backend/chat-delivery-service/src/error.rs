use crate::middleware::error_handling;
use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use thiserror::Error;

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// What a `NotFound` refers to, so clients get a precise error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Conversation,
    Group,
    Message,
    Invite,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Conversation => "conversation",
            Resource::Group => "group",
            Resource::Message => "message",
            Resource::Invite => "invite",
        };
        f.write_str(name)
    }
}

/// What an `AlreadyExists` collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Existing {
    GroupName(String),
    Membership,
    Invite,
}

impl fmt::Display for Existing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Existing::GroupName(name) => write!(f, "group {name:?}"),
            Existing::Membership => f.write_str("user is already a member"),
            Existing::Invite => f.write_str("invite already pending"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} not found")]
    NotFound(Resource),

    #[error("already exists: {0}")]
    AlreadyExists(Existing),

    #[error("message already deleted")]
    AlreadyDeleted,

    #[error("edit window expired (max_edit_secs: {max_edit_secs})")]
    EditWindowExpired { max_edit_secs: i64 },

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal server error")]
    Internal,
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            return AppError::Unavailable(e.to_string());
        }
        match e.code() {
            Some(code) if *code == tokio_postgres::error::SqlState::UNIQUE_VIOLATION => {
                AppError::Conflict(e.to_string())
            }
            Some(code) if *code == tokio_postgres::error::SqlState::T_R_SERIALIZATION_FAILURE => {
                AppError::Conflict(e.to_string())
            }
            _ => AppError::Unavailable(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Unavailable(e.to_string())
    }
}

impl AppError {
    pub fn not_member() -> Self {
        AppError::PermissionDenied("not a participant of this conversation".into())
    }

    /// Returns whether repeating the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Unavailable(_) | AppError::Conflict(_) | AppError::Internal
        )
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::PermissionDenied(_) | AppError::EditWindowExpired { .. } => 403,
            AppError::NotFound(_) => 404,
            AppError::AlreadyExists(_) | AppError::Conflict(_) => 409,
            AppError::AlreadyDeleted => 410,
            AppError::Unavailable(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }
}
