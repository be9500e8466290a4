// =============================================================================
// Bearer Token Authentication — Axum Middleware
// =============================================================================
//
// Extracts and validates a Bearer token from the `Authorization` header
// against the `KESTREL_ADMIN_TOKEN` environment variable. Comparison is
// performed in constant time to prevent timing side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(AuthBearer(token): AuthBearer, ...) { ... }
//
// A missing or invalid token short-circuits the request with 403 before the
// handler body executes.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Axum extractor yielding the validated raw token string.
pub struct AuthBearer(pub String);

#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so token rotation needs no restart.
        let expected = std::env::var("KESTREL_ADMIN_TOKEN").unwrap_or_default();

        if expected.is_empty() {
            warn!("KESTREL_ADMIN_TOKEN is not set — all authenticated requests will be rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_slices_compare_equal() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
    }

    #[test]
    fn unequal_slices_compare_unequal() {
        assert!(!constant_time_eq(b"secret-token", b"secret-tokex"));
        assert!(!constant_time_eq(b"short", b"longer-token"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    fn parts_with_auth(value: &str) -> Parts {
        let request = axum::http::Request::builder()
            .header(axum::http::header::AUTHORIZATION, value)
            .body(())
            .unwrap();
        request.into_parts().0
    }

    #[tokio::test]
    async fn extractor_accepts_matching_token_and_rejects_others() {
        std::env::set_var("KESTREL_ADMIN_TOKEN", "kestrel-test-token");

        let mut parts = parts_with_auth("Bearer kestrel-test-token");
        let AuthBearer(token) = AuthBearer::from_request_parts(&mut parts, &())
            .await
            .expect("configured token must be accepted");
        assert_eq!(token, "kestrel-test-token");

        let mut parts = parts_with_auth("Bearer wrong-token");
        assert!(AuthBearer::from_request_parts(&mut parts, &())
            .await
            .is_err());

        let mut parts = parts_with_auth("Basic kestrel-test-token");
        assert!(AuthBearer::from_request_parts(&mut parts, &())
            .await
            .is_err());
    }
}
