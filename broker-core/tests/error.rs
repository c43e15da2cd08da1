use axum::http::StatusCode;
use axum::response::IntoResponse;
use broker_core::error::BrokerError;
use http_body_util::BodyExt;

async fn error_parts(err: BrokerError) -> (StatusCode, serde_json::Value) {
    let resp = err.into_response();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn not_found_maps_to_404() {
    let (status, body) = error_parts(BrokerError::NotFound("resource missing".into())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "resource missing");
}

#[tokio::test]
async fn access_denied_maps_to_403() {
    let (status, _) = error_parts(BrokerError::AccessDenied("nope".into())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn timeout_maps_to_408() {
    let (status, _) = error_parts(BrokerError::Timeout("deadline exceeded".into())).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn service_unavailable_maps_to_503() {
    let (status, _) = error_parts(BrokerError::ServiceUnavailable("no subscriber".into())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
