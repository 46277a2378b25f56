//! Request identity.
//!
//! Authentication lives in front of this service; the gateway forwards the
//! verified caller as `X-User-Id` and the core trusts it.

use std::future::{ready, Ready};
use uuid::Uuid;

use crate::error::AppError;
use actix_web::{Error, FromRequest, HttpRequest};

pub const USER_ID_HEADER: &str = "X-User-Id";

/// Represents the authenticated caller of a request
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

impl User {
    pub fn from_headers(req: &HttpRequest) -> Result<Self, AppError> {
        let id = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or(AppError::Unauthorized)?;
        Ok(User { id })
    }
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        ready(User::from_headers(req).map_err(Error::from))
    }
}
