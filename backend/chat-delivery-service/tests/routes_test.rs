mod common;

use actix_web::{http::StatusCode, test, web, App};
use chat_delivery_service::config::Config;
use chat_delivery_service::middleware::guards::USER_ID_HEADER;
use chat_delivery_service::routes;
use chat_delivery_service::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn state() -> AppState {
    AppState::new(common::core().core, Arc::new(Config::test_defaults()))
}

#[actix_rt::test]
async fn test_requests_without_identity_are_rejected() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state()))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/notifications").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "IDENTITY_MISSING");
}

#[actix_rt::test]
async fn test_send_and_read_history_over_http() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state()))
            .configure(routes::configure),
    )
    .await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/messages")
        .insert_header((USER_ID_HEADER, alice.to_string()))
        .set_json(json!({ "target": { "type": "user", "id": bob }, "body": "hi" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let receipt: Value = test::read_body_json(resp).await;
    assert_eq!(receipt["seq"], 1);
    assert_eq!(receipt["delivery"], "delivered");
    let conversation_id = receipt["conversation_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{conversation_id}/messages?after_seq=0&limit=10"))
        .insert_header((USER_ID_HEADER, bob.to_string()))
        .to_request();
    let page: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(page["messages"][0]["body"], "hi");
    assert_eq!(page["next_after_seq"], 1);

    let req = test::TestRequest::get()
        .uri("/notifications")
        .insert_header((USER_ID_HEADER, bob.to_string()))
        .to_request();
    let pending: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pending["total"], 1);

    let req = test::TestRequest::post()
        .uri(&format!("/conversations/{conversation_id}/read"))
        .insert_header((USER_ID_HEADER, bob.to_string()))
        .set_json(json!({ "up_to_seq": 1 }))
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["last_read_seq"], 1);
    assert_eq!(outcome["cleared"], 1);
}

#[actix_rt::test]
async fn test_domain_errors_map_to_status_codes() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state()))
            .configure(routes::configure),
    )
    .await;
    let (admin, outsider) = (Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/groups")
        .insert_header((USER_ID_HEADER, admin.to_string()))
        .set_json(json!({ "name": "3D Chat" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let group: Value = test::read_body_json(resp).await;
    assert_eq!(group["kind"], "group");

    let req = test::TestRequest::post()
        .uri("/groups")
        .insert_header((USER_ID_HEADER, outsider.to_string()))
        .set_json(json!({ "name": "3D Chat" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = test::TestRequest::post()
        .uri("/messages")
        .insert_header((USER_ID_HEADER, outsider.to_string()))
        .set_json(json!({ "target": { "type": "group", "id": "3D Chat" }, "body": "let me in" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri("/groups/Unknown")
        .insert_header((USER_ID_HEADER, admin.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "CONVERSATION_NOT_FOUND");

    let req = test::TestRequest::delete()
        .uri(&format!("/messages/{}", Uuid::new_v4()))
        .insert_header((USER_ID_HEADER, admin.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn test_health_and_metrics() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state()))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}
