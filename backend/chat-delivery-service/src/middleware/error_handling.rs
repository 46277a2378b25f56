use crate::error::{AppError, Existing, Resource};
use actix_web::{http::StatusCode, HttpResponse};
use error_types::{error_codes, error_types as kinds, ErrorResponse};

/// Map domain errors to the shared HTTP error body
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (error_type, code) = match err {
        AppError::BadRequest(_) => (kinds::VALIDATION_ERROR, error_codes::INVALID_REQUEST),
        AppError::Unauthorized => (kinds::AUTHENTICATION_ERROR, error_codes::IDENTITY_MISSING),
        AppError::PermissionDenied(_) => (
            kinds::AUTHORIZATION_ERROR,
            error_codes::NOT_CONVERSATION_MEMBER,
        ),
        AppError::NotFound(Resource::Message) => {
            (kinds::NOT_FOUND_ERROR, error_codes::MESSAGE_NOT_FOUND)
        }
        AppError::NotFound(_) => (kinds::NOT_FOUND_ERROR, error_codes::CONVERSATION_NOT_FOUND),
        AppError::AlreadyExists(Existing::GroupName(_)) => {
            (kinds::CONFLICT_ERROR, error_codes::GROUP_ALREADY_EXISTS)
        }
        AppError::AlreadyExists(Existing::Membership) => {
            (kinds::CONFLICT_ERROR, error_codes::ALREADY_MEMBER)
        }
        AppError::AlreadyExists(Existing::Invite) => {
            (kinds::CONFLICT_ERROR, error_codes::INVITE_ALREADY_PENDING)
        }
        AppError::AlreadyDeleted => (kinds::CONFLICT_ERROR, error_codes::MESSAGE_DELETED),
        AppError::EditWindowExpired { .. } => {
            (kinds::AUTHORIZATION_ERROR, error_codes::EDIT_WINDOW_EXPIRED)
        }
        AppError::Conflict(_) => (kinds::CONFLICT_ERROR, error_codes::SEQUENCE_CONFLICT),
        AppError::Unavailable(_) => (
            kinds::SERVICE_UNAVAILABLE_ERROR,
            error_codes::STORAGE_UNAVAILABLE,
        ),
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            (kinds::SERVER_ERROR, error_codes::INTERNAL_SERVER_ERROR)
        }
    };

    // Storage details stay in the logs.
    let message = match err {
        AppError::Unavailable(_) => "storage temporarily unavailable".to_string(),
        AppError::Config(_) | AppError::StartServer(_) => "internal server error".to_string(),
        other => other.to_string(),
    };

    let response = ErrorResponse::new(
        status.canonical_reason().unwrap_or("Error"),
        &message,
        status.as_u16(),
        error_type,
        code,
    )
    .retryable(err.is_retryable());

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, response) = map_error(err);
    if status.is_server_error() {
        tracing::error!(error = %err, status = status.as_u16(), "request failed");
    }
    HttpResponse::build(status).json(response)
}
