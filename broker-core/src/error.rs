use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// The broker-wide error taxonomy. Every variant carries the HTTP status
/// it maps to at the edge.
#[derive(Clone)]
pub enum BrokerError {
    InformationAlreadyExists(String),
    InvalidParams(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Timeout(String),
    InternalServerError(String),
    AccessDenied(String),
    ServiceUnavailable(String),
    Custom {
        status: StatusCode,
        body: serde_json::Value,
    },
}

impl BrokerError {
    pub fn code(&self) -> u16 {
        match self {
            BrokerError::InformationAlreadyExists(_) => 208,
            BrokerError::InvalidParams(_) => 400,
            BrokerError::Unauthorized(_) => 401,
            BrokerError::Forbidden(_) | BrokerError::AccessDenied(_) => 403,
            BrokerError::NotFound(_) => 404,
            BrokerError::Timeout(_) => 408,
            BrokerError::InternalServerError(_) => 500,
            BrokerError::ServiceUnavailable(_) => 503,
            BrokerError::Custom { status, .. } => status.as_u16(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            BrokerError::InformationAlreadyExists(m)
            | BrokerError::InvalidParams(m)
            | BrokerError::Unauthorized(m)
            | BrokerError::Forbidden(m)
            | BrokerError::NotFound(m)
            | BrokerError::Timeout(m)
            | BrokerError::InternalServerError(m)
            | BrokerError::AccessDenied(m)
            | BrokerError::ServiceUnavailable(m) => m.clone(),
            BrokerError::Custom { body, .. } => body.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Serialize as the wire `Message` error body: `{code, message}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code(), "message": self.message() })
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        match self {
            BrokerError::Custom { status, body } => (status, Json(body)).into_response(),
            other => {
                let status = other.status();
                let body = other.to_json();
                (status, Json(body)).into_response()
            }
        }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message())
    }
}

impl std::fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::InternalServerError(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::InvalidParams(err.to_string())
    }
}

/// Generate `From<E> for BrokerError` implementations that map error types
/// to a specific variant.
///
/// ```ignore
/// broker_core::map_error! {
///     sqlx::Error => InternalServerError,
/// }
/// ```
#[macro_export]
macro_rules! map_error {
    ( $( $err_ty:ty => $variant:ident ),* $(,)? ) => {
        $(
            impl From<$err_ty> for $crate::error::BrokerError {
                fn from(err: $err_ty) -> Self {
                    $crate::error::BrokerError::$variant(err.to_string())
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: BrokerError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn taxonomy_maps_to_documented_status_codes() {
        let cases: Vec<(BrokerError, u16)> = vec![
            (BrokerError::InformationAlreadyExists("x".into()), 208),
            (BrokerError::InvalidParams("x".into()), 400),
            (BrokerError::Unauthorized("x".into()), 401),
            (BrokerError::Forbidden("x".into()), 403),
            (BrokerError::NotFound("x".into()), 404),
            (BrokerError::Timeout("x".into()), 408),
            (BrokerError::InternalServerError("x".into()), 500),
            (BrokerError::ServiceUnavailable("x".into()), 503),
        ];
        for (err, code) in cases {
            let (status, body) = error_parts(err).await;
            assert_eq!(status.as_u16(), code);
            assert_eq!(body["code"], code);
        }
    }

    #[tokio::test]
    async fn custom_preserves_status_and_body() {
        let custom_body = serde_json::json!({"detail": "teapot"});
        let (status, body) = error_parts(BrokerError::Custom {
            status: StatusCode::IM_A_TEAPOT,
            body: custom_body.clone(),
        })
        .await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body, custom_body);
    }

    #[test]
    fn display_includes_code_and_message() {
        assert_eq!(BrokerError::NotFound("missing".into()).to_string(), "[404] missing");
    }

    #[test]
    fn from_io_error_is_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: BrokerError = io_err.into();
        assert_eq!(err.code(), 500);
    }
}
