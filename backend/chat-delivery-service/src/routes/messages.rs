use crate::{
    error::AppError,
    middleware::guards::User,
    models::Message,
    services::{HistoryQuery, SendRequest},
    state::AppState,
};
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Deserialize)]
pub struct ReadRequest {
    pub up_to_seq: i64,
}

#[derive(Deserialize)]
pub struct DeliveredRequest {
    pub message_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    /// Cursor for the next page, absent when the page is empty
    pub next_after_seq: Option<i64>,
}

/// POST /messages
/// Send to a conversation, a user (private) or a group by name
#[post("/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendRequest>,
) -> Result<HttpResponse, AppError> {
    let receipt = state.core.send(user.id, body.into_inner()).await?;
    if receipt.duplicate {
        return Ok(HttpResponse::Ok().json(receipt));
    }
    Ok(HttpResponse::Created().json(receipt))
}

/// GET /conversations/{id}/messages?after_seq=&skip=&limit=
#[get("/conversations/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .core
        .history(user.id, conversation_id.into_inner(), query.into_inner())
        .await?;
    let next_after_seq = messages.last().map(|m| m.seq);
    Ok(HttpResponse::Ok().json(HistoryResponse {
        messages,
        next_after_seq,
    }))
}

#[put("/messages/{id}")]
pub async fn edit_message(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
    body: web::Json<EditMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let message = state
        .core
        .edit(user.id, message_id.into_inner(), body.into_inner().body)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// DELETE /messages/{id}
/// Tombstones the message; repeating the call is a no-op
#[delete("/messages/{id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let message = state.core.delete(user.id, message_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(message))
}

#[post("/conversations/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<ReadRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .core
        .ack_read(user.id, conversation_id.into_inner(), body.up_to_seq)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

#[post("/conversations/{id}/delivered")]
pub async fn mark_delivered(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<DeliveredRequest>,
) -> Result<HttpResponse, AppError> {
    let updated = state
        .core
        .ack_delivered(user.id, conversation_id.into_inner(), &body.message_ids)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "updated": updated })))
}

/// GET /messages/{id}/delivery
/// Delivery state of the message for the caller
#[get("/messages/{id}/delivery")]
pub async fn delivery_state(
    state: web::Data<AppState>,
    user: User,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let message_id = message_id.into_inner();
    let delivery = state.core.delivery_state(user.id, message_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message_id": message_id,
        "state": delivery,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(send_message)
        .service(get_messages)
        .service(edit_message)
        .service(delete_message)
        .service(mark_read)
        .service(mark_delivered)
        .service(delivery_state);
}
