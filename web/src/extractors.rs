//! Custom Axum extractors.
//!
//! - [`CorrelationId`]: the request's correlation id
//! - [`IdempotencyKeyHeader`]: the optional `Idempotency-Key` header
//! - [`UserIdHeader`]: the caller identity forwarded by the gateway in `X-User-Id`
//!
//! Authentication happens upstream; these services trust `X-User-Id`.

use crate::error::AppError;
use crate::middleware::correlation_id_from_headers;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Correlation ID for request tracing.
///
/// Uses the id stored by the correlation middleware when present, then the
/// `X-Correlation-ID` header, and generates a fresh one otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<Self>() {
            return Ok(*id);
        }
        Ok(Self(
            correlation_id_from_headers(&parts.headers).unwrap_or_else(Uuid::new_v4),
        ))
    }
}

/// Raw `Idempotency-Key` header value, if the client sent one.
///
/// Validation is left to the domain so one rule applies to header and body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyKeyHeader(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKeyHeader
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(IDEMPOTENCY_KEY_HEADER) {
            None => Ok(Self(None)),
            Some(value) => value
                .to_str()
                .map(|s| Self(Some(s.trim().to_string())))
                .map_err(|_| AppError::bad_request("Idempotency-Key must be ASCII")),
        }
    }
}

/// Caller identity from `X-User-Id`. Requests without it are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdHeader(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::bad_request("X-User-Id header is required"))?;
        value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Self)
            .ok_or_else(|| AppError::bad_request("X-User-Id must be a UUID"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).expect("valid request").into_parts().0
    }

    #[tokio::test]
    async fn test_correlation_id_from_header() {
        let uuid = Uuid::new_v4();
        let mut parts = parts(Request::builder().header("X-Correlation-ID", uuid.to_string()));
        let id = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(id.0, uuid);
    }

    #[tokio::test]
    async fn test_correlation_id_prefers_extension() {
        let stored = Uuid::new_v4();
        let mut parts = parts(Request::builder().header("X-Correlation-ID", Uuid::new_v4().to_string()));
        parts.extensions.insert(CorrelationId(stored));
        let id = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(id.0, stored);
    }

    #[tokio::test]
    async fn test_idempotency_key_optional() {
        let mut missing = parts(Request::builder());
        let key = IdempotencyKeyHeader::from_request_parts(&mut missing, &()).await.unwrap();
        assert_eq!(key.0, None);

        let mut present = parts(Request::builder().header(IDEMPOTENCY_KEY_HEADER, " abc "));
        let key = IdempotencyKeyHeader::from_request_parts(&mut present, &()).await.unwrap();
        assert_eq!(key.0.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_user_id_required() {
        let mut missing = parts(Request::builder());
        let err = UserIdHeader::from_request_parts(&mut missing, &()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let mut invalid = parts(Request::builder().header(USER_ID_HEADER, "bob"));
        assert!(UserIdHeader::from_request_parts(&mut invalid, &()).await.is_err());

        let user = Uuid::new_v4();
        let mut valid = parts(Request::builder().header(USER_ID_HEADER, user.to_string()));
        let id = UserIdHeader::from_request_parts(&mut valid, &()).await.unwrap();
        assert_eq!(id.0, user);
    }
}
