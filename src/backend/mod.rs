mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

pub use input_builder::{SimpleInputFunctionBuilder, SimpleInputFuture, UNKNOWN_KEY};
use std::future::Future;

use crate::policy::Policy;
use crate::RateLimitHeaders;
use actix_web::rt::time::Instant;
use std::time::Duration;

/// Outcome of asking a [Backend] whether a request may proceed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// A rate limiting store and algorithm.
///
/// A Backend must be [Clone]; clones share the same counters. Wrap the store in an
/// [Arc](std::sync::Arc) if it is not already reference counted.
pub trait Backend<I: 'static = SimpleInput>: Clone {
    type Output;
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// Returns whether to admit the request, output describing the quota state (used for the
    /// response headers), and a token that allows the count to be adjusted once the response
    /// status is known.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output, Self::RollbackToken), Self::Error>>;

    /// Give back the quota consumed by an admitted request.
    ///
    /// Called after the downstream handler has produced a response whose status matched the
    /// configured exemption. A failure here can only be logged, since the request has already
    /// been served.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// Input for a fixed window [Backend]: the tracking key and the policy applied to it.
#[derive(Debug, Clone)]
pub struct SimpleInput {
    /// The rate limiting window.
    pub interval: Duration,
    /// The total requests to be admitted within the window.
    pub max_requests: u64,
    /// The rate limit key to be used for this request.
    pub key: String,
}

impl SimpleInput {
    pub fn new(policy: Policy, key: impl Into<String>) -> Self {
        Self {
            interval: policy.window,
            max_requests: policy.max_requests,
            key: key.into(),
        }
    }
}

/// Quota state reported by a fixed window [Backend].
#[derive(Debug, Clone)]
pub struct SimpleOutput {
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of requests that will be permitted until the window resets.
    pub remaining: u64,
    /// Time at which the window resets.
    pub reset: Instant,
}

/// Additional functions for a [Backend] that uses [SimpleInput] and [SimpleOutput].
pub trait SimpleBackend: Backend<SimpleInput, Output = SimpleOutput> {
    /// Removes the record for a given rate limit key.
    ///
    /// Intended to be used to reset a key before changing the window.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}

impl RateLimitHeaders for SimpleOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the window resets, rounded upwards so that the window is guaranteed to have
    /// reset after waiting for the duration.
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        millis.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_seconds_until_reset() {
        tokio::time::pause();
        let output = SimpleOutput {
            limit: 0,
            remaining: 0,
            reset: Instant::now() + Duration::from_secs(60),
        };
        tokio::time::advance(Duration::from_secs_f64(29.9)).await;
        // 30.1 seconds left, rounded up
        assert_eq!(output.seconds_until_reset(), 31);
    }

    #[actix_web::test]
    async fn test_seconds_until_reset_after_expiry() {
        tokio::time::pause();
        let output = SimpleOutput {
            limit: 1,
            remaining: 0,
            reset: Instant::now() + Duration::from_millis(100),
        };
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(output.seconds_until_reset(), 0);
    }

    #[test]
    fn test_input_from_policy() {
        let input = SimpleInput::new(Policy::upload(), "10.0.0.1");
        assert_eq!(input.interval, Duration::from_secs(60 * 60));
        assert_eq!(input.max_requests, 50);
        assert_eq!(input.key, "10.0.0.1");
    }

    #[test]
    fn test_decision() {
        assert!(Decision::from_allowed(true).is_allowed());
        assert!(Decision::from_allowed(false).is_denied());
    }
}
