//! Window and request cap presets for the limiters mounted in front of the CMS routes.
//!
//! Each preset is meant for its own limiter instance, with its own backend:
//!
//! | Policy      | Window     | Requests               |
//! |-------------|------------|------------------------|
//! | `general`   | 15 minutes | 1000                   |
//! | `auth`      | 15 minutes | 5 (3 in test mode)     |
//! | `upload`    | 1 hour     | 50                     |
//! | `api`       | 15 minutes | 500                    |

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// A fixed window policy: at most `max_requests` per key within each `window`.
///
/// Deserializes from `{ "window_ms": 60000, "max_requests": 5 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPolicy")]
pub struct Policy {
    /// The rate limiting window.
    pub window: Duration,
    /// The total requests to be allowed within the window.
    pub max_requests: u64,
}

impl Policy {
    pub const fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// Coarse per-client limit for all traffic.
    pub const fn general() -> Self {
        Self::new(FIFTEEN_MINUTES, 1000)
    }

    /// Login and other authentication attempts.
    pub const fn auth(test_mode: bool) -> Self {
        Self::new(FIFTEEN_MINUTES, if test_mode { 3 } else { 5 })
    }

    /// File uploads.
    pub const fn upload() -> Self {
        Self::new(ONE_HOUR, 50)
    }

    /// Generic API calls.
    pub const fn api() -> Self {
        Self::new(FIFTEEN_MINUTES, 500)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Rate limit window must be non-zero")]
    ZeroWindow,
}

#[derive(Deserialize)]
struct RawPolicy {
    window_ms: u64,
    max_requests: u64,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        if raw.window_ms == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        Ok(Policy::new(
            Duration::from_millis(raw.window_ms),
            raw.max_requests,
        ))
    }
}

/// The `rate_limit` section of the server configuration.
///
/// Every policy is optional and falls back to its preset.
#[derive(Debug, Clone, Deserialize)]
pub struct Policies {
    #[serde(default = "Policy::general")]
    pub general: Policy,
    #[serde(default)]
    auth: Option<Policy>,
    #[serde(default = "Policy::upload")]
    pub upload: Policy,
    #[serde(default = "Policy::api")]
    pub api: Policy,
    /// Tightens the auth preset so test suites can hit the limit quickly.
    #[serde(default)]
    pub test_mode: bool,
}

impl Policies {
    pub fn new(test_mode: bool) -> Self {
        Self {
            general: Policy::general(),
            auth: None,
            upload: Policy::upload(),
            api: Policy::api(),
            test_mode,
        }
    }

    /// The configured auth policy, or the preset for the current mode.
    pub fn auth(&self) -> Policy {
        self.auth.unwrap_or(Policy::auth(self.test_mode))
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self::new(false)
    }
}
