//! In-process HTTP test client wrapping an Axum `Router` (C14). Uses
//! `tower::ServiceExt::oneshot` to dispatch requests without binding a
//! TCP port.

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tower::util::ServiceExt;

pub struct TestApp {
    router: Router,
}

impl TestApp {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Send an arbitrary request.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.expect("failed to send request");

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();

        TestResponse { status, body }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        let req = Request::builder().method(Method::GET).uri(path).body(Body::empty()).unwrap();
        self.send(req).await
    }

    pub async fn get_authenticated(&self, path: &str, token: &str) -> TestResponse {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }

    pub async fn post_json(&self, path: &str, body: &impl serde::Serialize) -> TestResponse {
        let json = serde_json::to_vec(body).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .unwrap();
        self.send(req).await
    }

    pub async fn post_json_authenticated(&self, path: &str, body: &impl serde::Serialize, token: &str) -> TestResponse {
        let json = serde_json::to_vec(body).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(json))
            .unwrap();
        self.send(req).await
    }

    pub async fn put_json_authenticated(&self, path: &str, body: &impl serde::Serialize, token: &str) -> TestResponse {
        let json = serde_json::to_vec(body).unwrap();
        let req = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(json))
            .unwrap();
        self.send(req).await
    }

    pub async fn delete_authenticated(&self, path: &str, token: &str) -> TestResponse {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl TestResponse {
    pub fn assert_ok(self) -> Self {
        assert_eq!(self.status, StatusCode::OK, "Expected 200 OK, got {}", self.status);
        self
    }

    pub fn assert_created(self) -> Self {
        assert_eq!(self.status, StatusCode::CREATED, "Expected 201 Created, got {}", self.status);
        self
    }

    pub fn assert_bad_request(self) -> Self {
        assert_eq!(self.status, StatusCode::BAD_REQUEST, "Expected 400 Bad Request, got {}", self.status);
        self
    }

    pub fn assert_unauthorized(self) -> Self {
        assert_eq!(self.status, StatusCode::UNAUTHORIZED, "Expected 401 Unauthorized, got {}", self.status);
        self
    }

    pub fn assert_forbidden(self) -> Self {
        assert_eq!(self.status, StatusCode::FORBIDDEN, "Expected 403 Forbidden, got {}", self.status);
        self
    }

    pub fn assert_not_found(self) -> Self {
        assert_eq!(self.status, StatusCode::NOT_FOUND, "Expected 404 Not Found, got {}", self.status);
        self
    }

    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(self.status, expected, "Expected {expected}, got {}", self.status);
        self
    }

    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| panic!("Failed to parse JSON: {e}\nBody: {}", self.text()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}
