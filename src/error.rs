use crate::middleware::builder::{
    RateLimitHeaders, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
use actix_web::http::header::{HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Machine readable code carried in the body of a rejected request.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Signals that a request was rejected by a rate limiter.
///
/// Always recoverable: the client only has to wait `reset` seconds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many requests, please try again in {reset} seconds")]
    QuotaExceeded {
        /// The configured request cap.
        limit: u64,
        /// Always zero for a rejected request.
        remaining: u64,
        /// Seconds until the window resets.
        reset: u64,
    },
}

impl RateLimitError {
    pub fn quota_exceeded<O: RateLimitHeaders>(output: &O) -> Self {
        Self::QuotaExceeded {
            limit: output.limit(),
            remaining: 0,
            reset: output.seconds_until_reset(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => RATE_LIMIT_EXCEEDED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl ResponseError for RateLimitError {
    fn status_code(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    fn error_response(&self) -> HttpResponse {
        let Self::QuotaExceeded {
            limit,
            remaining,
            reset,
        } = self;
        let mut response = HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        });
        let map = response.headers_mut();
        map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(*limit));
        map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(*remaining));
        map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(*reset));
        map.insert(RETRY_AFTER, HeaderValue::from(*reset));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_response() {
        let error = RateLimitError::QuotaExceeded {
            limit: 5,
            remaining: 0,
            reset: 42,
        };
        assert_eq!(error.code(), "RATE_LIMIT_EXCEEDED");
        let response = error.error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "42");
        assert_eq!(headers.get("retry-after").unwrap(), "42");

        let body = to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            body["message"],
            "Too many requests, please try again in 42 seconds"
        );
    }
}
