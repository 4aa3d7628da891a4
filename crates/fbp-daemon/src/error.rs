// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface mapping for the backplane error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fbp_error::{ErrorCode, FleetError, FleetErrorDto};
use serde_json::json;

/// A [`FleetError`] dressed for the wire.
#[derive(Debug)]
pub struct ApiError {
    /// Mapped HTTP status.
    pub status: StatusCode,
    /// The underlying error snapshot.
    pub error: FleetErrorDto,
}

impl ApiError {
    /// Status mapping per the error taxonomy. Crypto failures look like
    /// bad requests from the outside; job-transition conflicts are 409.
    pub fn status_for(code: ErrorCode) -> StatusCode {
        match code {
            ErrorCode::Unauthorized | ErrorCode::ProvisioningKeyInvalid => StatusCode::UNAUTHORIZED,
            ErrorCode::BadRequest | ErrorCode::CryptoFailure | ErrorCode::ConfigInvalid => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidJobTransition => StatusCode::CONFLICT,
            ErrorCode::LicenseExpired
            | ErrorCode::LicenseInvalid
            | ErrorCode::LicenseFeatureDenied
            | ErrorCode::LicenseLimitExceeded => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RetryableStorage => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InvariantViolation | ErrorCode::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self {
            status: Self::status_for(err.code),
            error: (&err).into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.error.code,
                "message": self.error.message,
            }
        });
        if !self.error.context.is_empty() {
            body["error"]["context"] = json!(self.error.context);
        }
        let mut resp = (self.status, Json(body)).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE
            || self.status == StatusCode::TOO_MANY_REQUESTS
        {
            resp.headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        for (code, status) in [
            (ErrorCode::Unauthorized, StatusCode::UNAUTHORIZED),
            (ErrorCode::ProvisioningKeyInvalid, StatusCode::UNAUTHORIZED),
            (ErrorCode::BadRequest, StatusCode::BAD_REQUEST),
            (ErrorCode::CryptoFailure, StatusCode::BAD_REQUEST),
            (ErrorCode::NotFound, StatusCode::NOT_FOUND),
            (ErrorCode::InvalidJobTransition, StatusCode::CONFLICT),
            (ErrorCode::LicenseLimitExceeded, StatusCode::FORBIDDEN),
            (ErrorCode::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (ErrorCode::RetryableStorage, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorCode::DeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
            (ErrorCode::InvariantViolation, StatusCode::INTERNAL_SERVER_ERROR),
        ] {
            assert_eq!(ApiError::status_for(code), status, "for {code}");
        }
    }

    #[test]
    fn retryable_responses_carry_retry_after() {
        let api: ApiError = FleetError::retryable_storage("busy").into();
        let resp = api.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key("retry-after"));
    }
}
