//! In-process fixed window store.
//!
//! ```no_run
//! use actix_web::{App, HttpServer};
//! use cms_rate_limit::backend::memory::InMemoryBackend;
//! use cms_rate_limit::backend::SimpleInputFunctionBuilder;
//! use cms_rate_limit::policy::Policies;
//! use cms_rate_limit::RateLimiter;
//!
//! # async fn run() -> std::io::Result<()> {
//! let policies = Policies::default();
//! // One backend per limiter, so the limits never share counters
//! let general = InMemoryBackend::builder().build();
//! let auth = InMemoryBackend::builder().build();
//! HttpServer::new(move || {
//!     let general = RateLimiter::builder(
//!         general.clone(),
//!         SimpleInputFunctionBuilder::from_policy(policies.general).build(),
//!     )
//!     .build();
//!     let auth = RateLimiter::builder(
//!         auth.clone(),
//!         SimpleInputFunctionBuilder::from_policy(policies.auth()).build(),
//!     )
//!     .exempt_success(true)
//!     .build();
//!     App::new()
//!         .service(actix_web::web::scope("/auth").wrap(auth))
//!         .wrap(general)
//! })
//! .bind(("127.0.0.1", 8080))?
//! .run()
//! .await
//! # }
//! ```

use crate::backend::{Backend, Decision, SimpleBackend, SimpleInput, SimpleOutput};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60;

/// A fixed window rate limiter [Backend] that keeps its records in a [DashMap].
///
/// Every backend owns its own map, so independently built limiters never share counters. Clones
/// share the map and the garbage collector; the collector is stopped once the last clone is
/// dropped.
///
/// Counters live only in this process. Restarting resets them, and separate processes each keep
/// their own view of a key.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Record>>,
    gc: Option<Arc<GarbageCollector>>,
}

/// The quota state of one key for the current window.
///
/// The window started at `reset_at - interval`.
struct Record {
    count: u64,
    reset_at: Instant,
}

impl Record {
    fn open(now: Instant, interval: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now
                .checked_add(interval)
                .expect("Interval unexpectedly large"),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.reset_at
    }
}

struct GarbageCollector(JoinHandle<()>);

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    /// Counts a request against `input.key` and decides whether it is admitted.
    ///
    /// The lookup, window roll-over, check and increment all happen while holding the map shard
    /// lock for the key, so concurrent requests for the same key can never admit more than
    /// `max_requests` within one window. A denied request does not consume quota.
    pub fn admit(&self, input: &SimpleInput) -> (Decision, SimpleOutput) {
        let now = Instant::now();
        let mut record = self
            .map
            .entry(input.key.clone())
            .or_insert_with(|| Record::open(now, input.interval));
        if record.is_expired(now) {
            // Replace rather than merge, the old window no longer matters
            *record = Record::open(now, input.interval);
        }

        let decision = if record.count >= input.max_requests {
            Decision::Denied
        } else {
            record.count += 1;
            Decision::Allowed
        };
        let output = SimpleOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(record.count),
            reset: record.reset_at,
        };
        (decision, output)
    }

    /// Number of keys currently tracked, including expired records not yet collected.
    pub fn tracked_keys(&self) -> usize {
        self.map.len()
    }

    fn garbage_collector(map: Arc<DashMap<String, Record>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                let before = map.len();
                map.retain(|_k, v| !v.is_expired(now));
                let removed = before.saturating_sub(map.len());
                if removed > 0 {
                    log::trace!("Rate limit GC removed {removed} expired records");
                }
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl Backend<SimpleInput> for InMemoryBackend {
    type Output = SimpleOutput;
    type RollbackToken = String;
    type Error = actix_web::Error;

    async fn request(
        &self,
        input: SimpleInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let (decision, output) = self.admit(&input);
        Ok((decision, output, input.key))
    }

    /// Decrements whatever record the key currently holds. If the window rolled over while the
    /// request was in flight, the new window is the one credited.
    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        if let Some(mut record) = self.map.get_mut(&token) {
            record.count = record.count.saturating_sub(1);
        }
        Ok(())
    }
}

impl SimpleBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing records whose window
    /// has expired. It never touches the counts of live records.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Must be called from within an actix (tokio) runtime when garbage collection is enabled.
    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Record>::new());
        let gc = self.gc_interval.map(|gc_interval| {
            Arc::new(GarbageCollector(InMemoryBackend::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        InMemoryBackend { map, gc }
    }
}
