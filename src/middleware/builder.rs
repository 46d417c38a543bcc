use crate::backend::Backend;
use crate::error::RateLimitError;
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Which response outcomes are handed back to the quota once the handler has finished.
///
/// An exempt request is still counted while it is in flight, so bursts stay bounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Exemption {
    /// Status < 400
    pub(crate) success: bool,
    /// Status >= 400
    pub(crate) failure: bool,
}

impl Exemption {
    pub(crate) fn applies(self, status: StatusCode) -> bool {
        if status.as_u16() < 400 {
            self.success
        } else {
            self.failure
        }
    }
}

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    exemption: Exemption,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_| HttpResponse::TooManyRequests().finish()),
            exemption: Exemption::default(),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// Denied responses carry a [RateLimitError::QuotaExceeded] JSON body.
    ///
    /// Already applied by [RateLimiter::builder]; call it again to restore the defaults after
    /// overriding them.
    pub fn add_headers(mut self) -> Self
    where
        BO: RateLimitHeaders,
    {
        self.allowed_transformation = Some(Rc::new(|map, output| {
            if let Some(status) = output {
                insert_headers(map, status);
            }
        }));
        self.denied_response =
            Rc::new(|status| RateLimitError::quota_exceeded(status).error_response());
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// [RateLimiter::builder] sets the rate limit headers, [RateLimiter::bare_builder] makes no
    /// changes. Passing `None` removes the transformation.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// [RateLimiter::builder] responds with a [RateLimitError::QuotaExceeded],
    /// [RateLimiter::bare_builder] with an empty body and status 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// Give the quota back for requests that complete with a status below 400.
    ///
    /// Default is false.
    pub fn exempt_success(mut self, exempt: bool) -> Self {
        self.exemption.success = exempt;
        self
    }

    /// Give the quota back for requests that complete with a status of 400 or above.
    ///
    /// Default is false.
    pub fn exempt_failure(mut self, exempt: bool) -> Self {
        self.exemption.failure = exempt;
        self
    }

    /// After processing a request, attempt to rollback the request count based on the status code
    /// of the returned response. Checked in addition to the exemptions.
    ///
    /// By default the rate limit is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
            exemption: self.exemption,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn insert_headers<O: RateLimitHeaders>(map: &mut HeaderMap, output: &O) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(output.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(output.seconds_until_reset()),
    );
}

/// Quota state that can be reported through the `x-ratelimit-*` headers, required by
/// [RateLimiterBuilder::add_headers].
pub trait RateLimitHeaders {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exemption() {
        let none = Exemption::default();
        assert!(!none.applies(StatusCode::OK));
        assert!(!none.applies(StatusCode::BAD_REQUEST));

        let success = Exemption {
            success: true,
            failure: false,
        };
        assert!(success.applies(StatusCode::OK));
        assert!(success.applies(StatusCode::FOUND));
        assert!(!success.applies(StatusCode::BAD_REQUEST));
        assert!(!success.applies(StatusCode::INTERNAL_SERVER_ERROR));

        let failure = Exemption {
            success: false,
            failure: true,
        };
        assert!(!failure.applies(StatusCode::NO_CONTENT));
        assert!(failure.applies(StatusCode::BAD_REQUEST));
        assert!(failure.applies(StatusCode::SERVICE_UNAVAILABLE));
    }
}
