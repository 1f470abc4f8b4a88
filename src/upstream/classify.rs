//! Maps upstream HTTP status codes and body `errorCode`s into
//! [`UpstreamError`] variants (spec.md §4.2, §6). Grounded 1:1 on
//! `_handle_response` in `dhan_api_client.py`.

use reqwest::StatusCode;

use crate::error::UpstreamError;

use super::types::UpstreamErrorBody;

const RATE_LIMIT_CODES: &[&str] = &["DH-904", "805"];
const AUTH_CODES: &[&str] = &["DH-901", "DH-808", "DH-809"];

/// Classifies a non-2xx HTTP status into the appropriate error
/// variant before even attempting to parse a body.
pub fn classify_status(status: StatusCode) -> Option<UpstreamError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(UpstreamError::RateLimitExceeded(
            "HTTP 429 rate limit exceeded".to_string(),
        ));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(UpstreamError::Auth(format!(
            "authentication error: HTTP {status}"
        )));
    }
    if status.is_server_error() {
        return Some(UpstreamError::Transient(format!(
            "upstream server error: HTTP {status}"
        )));
    }
    if !status.is_success() {
        return Some(UpstreamError::MalformedResponse(format!(
            "unexpected HTTP status {status}"
        )));
    }
    None
}

/// Classifies a `{status:"error", errorCode, errorMessage}` envelope
/// embedded in an otherwise-2xx response body.
pub fn classify_error_body(body: &UpstreamErrorBody) -> UpstreamError {
    if RATE_LIMIT_CODES.contains(&body.error_code.as_str()) {
        UpstreamError::RateLimitExceeded(body.error_message.clone())
    } else if AUTH_CODES.contains(&body.error_code.as_str()) {
        UpstreamError::Auth(body.error_message.clone())
    } else {
        UpstreamError::MalformedResponse(format!(
            "API error {}: {}",
            body.error_code, body.error_message
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_body(code: &str) -> UpstreamErrorBody {
        UpstreamErrorBody {
            status: "error".to_string(),
            error_code: code.to_string(),
            error_message: "boom".to_string(),
        }
    }

    #[test]
    fn maps_known_rate_limit_codes() {
        assert!(matches!(
            classify_error_body(&error_body("DH-904")),
            UpstreamError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            classify_error_body(&error_body("805")),
            UpstreamError::RateLimitExceeded(_)
        ));
    }

    #[test]
    fn maps_known_auth_codes() {
        assert!(matches!(
            classify_error_body(&error_body("DH-901")),
            UpstreamError::Auth(_)
        ));
        assert!(matches!(
            classify_error_body(&error_body("DH-808")),
            UpstreamError::Auth(_)
        ));
    }

    #[test]
    fn unknown_codes_are_malformed_response() {
        assert!(matches!(
            classify_error_body(&error_body("DH-000")),
            UpstreamError::MalformedResponse(_)
        ));
    }

    #[test]
    fn http_429_maps_to_rate_limit() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(UpstreamError::RateLimitExceeded(_))
        ));
    }

    #[test]
    fn http_5xx_maps_to_transient() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(UpstreamError::Transient(_))
        ));
    }
}
