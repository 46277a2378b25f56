//! Conversation, group and invite endpoints

use crate::{error::AppError, middleware::guards::User, state::AppState};
use actix_web::{delete, get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct ListMembersQuery {
    pub after: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Serialize)]
pub struct MembersPage {
    pub members: Vec<Uuid>,
    pub next_after: Option<Uuid>,
}

// ============================================
// Endpoints
// ============================================

#[get("/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let summaries = state.core.conversations_for(user.id).await?;
    Ok(HttpResponse::Ok().json(summaries))
}

/// GET /private/{user_id}
/// Opens (or returns) the private conversation with another user
#[get("/private/{user_id}")]
pub async fn open_private(
    state: web::Data<AppState>,
    user: User,
    other: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let conversation = state.core.open_private(user.id, other.into_inner()).await?;
    Ok(HttpResponse::Ok().json(conversation))
}

#[post("/groups")]
pub async fn create_group(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let group = state.core.create_group(&body.name, user.id).await?;
    Ok(HttpResponse::Created().json(group))
}

#[get("/groups/{name}")]
pub async fn resolve_group(
    state: web::Data<AppState>,
    _user: User,
    name: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let group = state.core.resolve_group(&name).await?;
    Ok(HttpResponse::Ok().json(group))
}

/// POST /groups/{id}/members
/// Any member may add; adding an existing member is a no-op
#[post("/groups/{id}/members")]
pub async fn add_member(
    state: web::Data<AppState>,
    user: User,
    group_id: web::Path<Uuid>,
    body: web::Json<AddMemberRequest>,
) -> Result<HttpResponse, AppError> {
    let added = state
        .core
        .add_member(group_id.into_inner(), user.id, body.user_id)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "added": added })))
}

/// DELETE /groups/{id}/members/{user_id}
/// Members may leave; the creator may remove anyone
#[delete("/groups/{id}/members/{user_id}")]
pub async fn remove_member(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse, AppError> {
    let (group_id, member_id) = path.into_inner();
    let removed = state
        .core
        .remove_member(group_id, user.id, member_id)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "removed": removed })))
}

#[get("/groups/{id}/members")]
pub async fn list_members(
    state: web::Data<AppState>,
    user: User,
    group_id: web::Path<Uuid>,
    query: web::Query<ListMembersQuery>,
) -> Result<HttpResponse, AppError> {
    let members = state
        .core
        .members(group_id.into_inner(), user.id, query.after, query.limit)
        .await?;
    let next_after = members.last().copied();
    Ok(HttpResponse::Ok().json(MembersPage {
        members,
        next_after,
    }))
}

#[post("/groups/{id}/invites")]
pub async fn invite_member(
    state: web::Data<AppState>,
    user: User,
    group_id: web::Path<Uuid>,
    body: web::Json<InviteRequest>,
) -> Result<HttpResponse, AppError> {
    let invite = state
        .core
        .invite(group_id.into_inner(), user.id, body.user_id)
        .await?;
    Ok(HttpResponse::Created().json(invite))
}

#[get("/invites")]
pub async fn list_invites(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let invites = state.core.pending_invites(user.id).await?;
    Ok(HttpResponse::Ok().json(invites))
}

#[post("/groups/{id}/invites/accept")]
pub async fn accept_invite(
    state: web::Data<AppState>,
    user: User,
    group_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let group = state
        .core
        .accept_invite(group_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(group))
}

#[post("/groups/{id}/invites/decline")]
pub async fn decline_invite(
    state: web::Data<AppState>,
    user: User,
    group_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    state
        .core
        .decline_invite(group_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_conversations)
        .service(open_private)
        .service(create_group)
        .service(resolve_group)
        .service(add_member)
        .service(remove_member)
        .service(list_members)
        .service(invite_member)
        .service(list_invites)
        .service(accept_invite)
        .service(decline_invite);
}
