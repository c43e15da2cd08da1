//! HTTP edge (C8): maps the REST-reachable patterns a set of resources
//! declare onto an axum [`Router`], dispatching each request through
//! [`Provider::request_bytes`] and rendering the `Message` reply as JSON,
//! a data-file response, or an HTTP error.
//!
//! The router carries the same middleware shape `broker-core` uses
//! internally: request-id propagation, tracing, panic-catching, CORS, and
//! a request timeout — all `tower-http` layers, no hand-rolled
//! middleware.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use bytes::Bytes;
use broker_core::envelope::{FilePayload, Message};
use broker_core::provider::Provider;
use broker_core::rid::{Pattern, Resource, Verb};
use sha2::{Digest, Sha256};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Builds the REST router for a set of resources against a shared
/// `Provider`. Holds no service state beyond that handle, so one
/// `HttpEdge` can front every resource a process hosts.
pub struct HttpEdge {
    provider: Arc<dyn Provider>,
    request_timeout: Duration,
}

impl HttpEdge {
    pub fn new(provider: Arc<dyn Provider>, request_timeout: Duration) -> Self {
        Self { provider, request_timeout }
    }

    /// Collects every HTTP-reachable pattern from `resources`, one route
    /// per distinct REST path (multiple verbs on the same path share a
    /// `MethodRouter`), plus `GET /` and `GET /health` liveness routes.
    pub fn router(&self, resources: &[Arc<dyn Resource>]) -> Router {
        let mut grouped: BTreeMap<String, Vec<Pattern>> = BTreeMap::new();
        for resource in resources {
            for pattern in resource.patterns() {
                if !pattern.verb().is_http() {
                    continue;
                }
                grouped.entry(pattern.endpoint_rest()).or_default().push(pattern);
            }
        }

        let mut router = Router::new();
        for (path, patterns) in grouped {
            let mut method_router = MethodRouter::new();
            for pattern in patterns {
                let verb = pattern.verb();
                let provider = self.provider.clone();
                let handler = move |path_params: Path<BTreeMap<String, String>>, headers: HeaderMap, body: Bytes| {
                    let provider = provider.clone();
                    let pattern = pattern.clone();
                    async move { dispatch(provider, pattern, path_params, headers, body).await }
                };
                method_router = match verb {
                    Verb::Get => method_router.get(handler),
                    Verb::Post => method_router.post(handler),
                    Verb::Put => method_router.put(handler),
                    Verb::Patch => method_router.patch(handler),
                    Verb::Delete => method_router.delete(handler),
                    _ => method_router,
                };
            }
            router = router.route(&path, method_router);
        }

        router
            .route("/", get(|| async { StatusCode::OK }))
            .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }
}

async fn dispatch(
    provider: Arc<dyn Provider>,
    pattern: Pattern,
    Path(path_params): Path<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bound: Vec<(&str, &str)> = path_params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let pattern = pattern.bind(&bound);
    let token = bearer_token(&headers);
    let payload = if body.is_empty() { b"null".to_vec() } else { body.to_vec() };

    match provider.request_bytes(&pattern, payload, token).await {
        Ok(bytes) => render_reply(bytes),
        Err(err) => err.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<Vec<u8>> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.as_bytes().to_vec())
}

/// Decodes the pipeline's `Message` reply and maps it to an HTTP
/// response: a non-200 code becomes that status with a `{code, message}`
/// body; a successful reply whose data decodes as a non-empty
/// `FilePayload` streams the file with an `ETag`/`Content-Disposition`;
/// otherwise the data is returned as a plain 200 JSON body.
fn render_reply(bytes: Vec<u8>) -> Response {
    let message: Message = match serde_json::from_slice(&bytes) {
        Ok(m) => m,
        Err(_) => return (StatusCode::OK, Json(serde_json::Value::Null)).into_response(),
    };

    if message.code != 200 {
        let status = StatusCode::from_u16(message.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({ "code": message.code, "message": message.message.unwrap_or_default() });
        return (status, Json(body)).into_response();
    }

    if let Some(data) = &message.data {
        if let Ok(file) = serde_json::from_value::<FilePayload>(data.clone()) {
            if let Ok(raw) = file.bytes() {
                if !raw.is_empty() {
                    return file_response(&file, raw);
                }
            }
        }
    }

    (StatusCode::OK, Json(message.data.unwrap_or(serde_json::Value::Null))).into_response()
}

fn file_response(file: &FilePayload, bytes: Vec<u8>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(content_type) = HeaderValue::from_str(&file.content_type) {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    let etag = format!("\"{:x}\"", Sha256::digest(&bytes));
    if let Ok(etag_value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, etag_value);
    }
    if let Some(filename) = &file.filename {
        if let Ok(cd) = HeaderValue::from_str(&format!("inline; filename=\"{filename}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, cd);
        }
    }
    (StatusCode::OK, headers, bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::envelope::Call;
    use broker_core::provider::{CallHandler, ProviderBase};
    use broker_core::rid::Method;
    use broker_test::TestProvider;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait::async_trait]
    impl CallHandler for Echo {
        async fn handle(&self, call: Call) {
            call.ok_with(&serde_json::json!({"id": call.path_param("ID")})).await.unwrap();
        }
    }

    struct Sample;

    impl Resource for Sample {
        fn service(&self) -> &str {
            "sample"
        }
        fn http_prefix(&self) -> &str {
            "api"
        }
        fn ws_prefix(&self) -> &str {
            "ws"
        }
        fn patterns(&self) -> Vec<Pattern> {
            vec![Method::new("sample", "api", "get", "get.$ID", Verb::Get).pattern()]
        }
    }

    #[tokio::test]
    async fn routes_request_to_the_matching_pattern() {
        let test_provider = TestProvider::new();
        let pattern = Method::new("sample", "api", "get", "get.$ID", Verb::Get).pattern();
        test_provider.register_mock(pattern.endpoint_name(), Arc::new(Echo));
        let base = ProviderBase::new(test_provider, Duration::from_secs(1));
        let edge = HttpEdge::new(base, Duration::from_secs(1));
        let resources: Vec<Arc<dyn Resource>> = vec![Arc::new(Sample)];
        let router = edge.router(&resources);

        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/api/sample/get/42")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id"], "42");
    }

    #[tokio::test]
    async fn missing_mock_surfaces_as_service_unavailable() {
        let test_provider = TestProvider::new();
        let base = ProviderBase::new(test_provider, Duration::from_secs(1));
        let edge = HttpEdge::new(base, Duration::from_secs(1));
        let resources: Vec<Arc<dyn Resource>> = vec![Arc::new(Sample)];
        let router = edge.router(&resources);

        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/api/sample/get/42")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn render_reply_maps_error_status() {
        let msg = Message { code: 404, data: None, message: Some("missing".into()), traces: Vec::new() };
        let response = render_reply(serde_json::to_vec(&msg).unwrap());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn render_reply_streams_file_payload() {
        let file = FilePayload::new("text/plain", b"hi").with_filename("a.txt");
        let msg = Message::ok_with(serde_json::to_value(&file).unwrap());
        let response = render_reply(serde_json::to_vec(&msg).unwrap());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "inline; filename=\"a.txt\""
        );
    }
}
