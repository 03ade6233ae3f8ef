//! Error responses

use axum::{http::StatusCode, Json};

use kw_core::api::ApiError;
use kw_core::KwError;

/// Status and body returned for a failed request
pub type ApiFailure = (StatusCode, Json<ApiError>);

/// Result type of every JSON handler
pub type ApiResult<T> = Result<Json<T>, ApiFailure>;

/// Map a lifecycle error to its HTTP response
pub fn failure(err: KwError) -> ApiFailure {
    (status_of(&err), Json(ApiError::from(&err)))
}

pub(crate) fn status_of(err: &KwError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status_codes() {
        let cases = [
            (KwError::Conflict("x".into()), StatusCode::CONFLICT),
            (KwError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (KwError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (KwError::Precondition("x".into()), StatusCode::PRECONDITION_FAILED),
            (KwError::AuthFailed("x".into()), StatusCode::UNAUTHORIZED),
            (KwError::KeyRejected("x".into()), StatusCode::BAD_GATEWAY),
            (KwError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (KwError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (KwError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let (got, Json(body)) = failure(err.clone());
            assert_eq!(got, status, "{:?}", err);
            assert_eq!(body.code, err.code());
        }
    }
}
