use crate::{error::AppError, middleware::guards::User, state::AppState};
use actix_web::{get, web, HttpResponse};

/// GET /notifications
/// Polling fallback for clients without a live socket
#[get("/notifications")]
pub async fn get_notifications(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let notifications = state.core.pending_notifications(user.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "total": notifications.len(),
        "notifications": notifications,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_notifications);
}
