use crate::backend::SimpleInput;
use crate::policy::Policy;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Key used for any component that cannot be derived from the request.
pub const UNKNOWN_KEY: &str = "unknown";

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Option<String>>;

pub type SimpleInputFuture = Ready<Result<SimpleInput, actix_web::Error>>;

/// Utility to create an input function that produces a [SimpleInput].
///
/// The key is made of the selected components joined with `-`. When no component is selected the
/// connection peer IP is used. Key derivation never fails: a component that cannot be extracted
/// from the request is replaced by [UNKNOWN_KEY].
///
/// You should take care to ensure that you are producing unique keys per backend.
pub struct SimpleInputFunctionBuilder {
    policy: Policy,
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    header_key: Option<HeaderName>,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl SimpleInputFunctionBuilder {
    pub fn new(interval: Duration, max_requests: u64) -> Self {
        Self::from_policy(Policy::new(interval, max_requests))
    }

    pub fn from_policy(policy: Policy) -> Self {
        Self {
            policy,
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            header_key: None,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the client's real IP to the rate limiting key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the rate limiting key.
    ///
    /// This is suitable when clients connect directly to the application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the rate limiting key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add the value of a request header (e.g. an API key) to the rate limiting key
    pub fn header_key(mut self, name: HeaderName) -> Self {
        self.header_key = Some(name);
        self
    }

    /// Add a static component to the rate limiting key.
    ///
    /// Used on its own this gives every request the same key, i.e. one shared quota. Combine it
    /// with [SimpleInputFunctionBuilder::peer_ip_key] to prefix per-client keys.
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a component to the rate limiting key.
    ///
    /// Returning [None] substitutes [UNKNOWN_KEY].
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    fn uses_default_key(&self) -> bool {
        !self.real_ip_key
            && !self.peer_ip_key
            && !self.path_key
            && self.header_key.is_none()
            && self.custom_key.is_none()
            && self.custom_fn.is_none()
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static {
        let peer_ip_key = self.peer_ip_key || self.uses_default_key();
        move |req| {
            let mut components = Vec::new();
            if let Some(custom) = &self.custom_key {
                components.push(custom.clone());
            }
            if self.real_ip_key {
                let info = req.connection_info();
                components.push(or_unknown("real ip", info.realip_remote_addr().and_then(ip_key)));
            }
            if peer_ip_key {
                let info = req.connection_info();
                components.push(or_unknown("peer ip", info.peer_addr().and_then(ip_key)));
            }
            if self.path_key {
                components.push(req.path().to_owned());
            }
            if let Some(name) = &self.header_key {
                let value = req
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(ToOwned::to_owned);
                components.push(or_unknown(name.as_str(), value));
            }
            if let Some(f) = &self.custom_fn {
                components.push(or_unknown("custom", f(req)));
            }

            ready(Ok(SimpleInput::new(self.policy, components.join("-"))))
        }
    }
}

fn or_unknown(component: &str, value: Option<String>) -> String {
    value.unwrap_or_else(|| {
        log::debug!("Unable to derive rate limit key component `{component}`, using `{UNKNOWN_KEY}`");
        UNKNOWN_KEY.to_owned()
    })
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: &str) -> Option<String> {
    let ip = match addr.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => addr.parse::<SocketAddr>().ok()?.ip(),
    };
    Some(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Some(v4.to_string());
            }
            let segments = v6.segments();
            let subnet = Ipv6Addr::new(segments[0], segments[1], segments[2], segments[3], 0, 0, 0, 0);
            format!("{subnet}/64")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn key_for(builder: SimpleInputFunctionBuilder, req: TestRequest) -> String {
        let input_fn = builder.build();
        input_fn(&req.to_srv_request()).await.unwrap().key
    }

    #[test]
    fn test_ip_key() {
        // Check that IPv4 addresses are preserved
        assert_eq!(ip_key("142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv4 mapped addresses are preserved
        assert_eq!(ip_key("::FFFF:142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv6 addresses are grouped into /64 subnets
        assert_eq!(
            ip_key("2a00:1450:4009:81f::200e").unwrap(),
            "2a00:1450:4009:81f::/64"
        );
        // Ports are ignored
        assert_eq!(ip_key("10.1.2.3:8080").unwrap(), "10.1.2.3");
        assert!(ip_key("not-an-address").is_none());
    }

    #[actix_web::test]
    async fn test_default_key_is_peer_ip() {
        let req = TestRequest::get().peer_addr("10.1.2.3:4567".parse().unwrap());
        let key = key_for(SimpleInputFunctionBuilder::new(MINUTE, 5), req).await;
        assert_eq!(key, "10.1.2.3");
    }

    #[actix_web::test]
    async fn test_missing_peer_falls_back_to_unknown() {
        let key = key_for(SimpleInputFunctionBuilder::new(MINUTE, 5), TestRequest::get()).await;
        assert_eq!(key, UNKNOWN_KEY);
    }

    #[actix_web::test]
    async fn test_composed_key() {
        let req = TestRequest::get()
            .uri("/api/documents")
            .peer_addr("10.1.2.3:4567".parse().unwrap());
        let builder = SimpleInputFunctionBuilder::new(MINUTE, 5)
            .custom_key("upload")
            .peer_ip_key()
            .path_key();
        assert_eq!(key_for(builder, req).await, "upload-10.1.2.3-/api/documents");
    }

    #[actix_web::test]
    async fn test_header_key() {
        let name = HeaderName::from_static("x-api-key");
        let req = TestRequest::get().insert_header(("x-api-key", "client-a"));
        let key = key_for(
            SimpleInputFunctionBuilder::new(MINUTE, 5).header_key(name.clone()),
            req,
        )
        .await;
        assert_eq!(key, "client-a");

        let key = key_for(
            SimpleInputFunctionBuilder::new(MINUTE, 5).header_key(name),
            TestRequest::get(),
        )
        .await;
        assert_eq!(key, UNKNOWN_KEY);
    }

    #[actix_web::test]
    async fn test_lone_custom_key_is_shared() {
        let builder = SimpleInputFunctionBuilder::new(MINUTE, 5).custom_key("maintenance");
        let req = TestRequest::get().peer_addr("10.1.2.3:4567".parse().unwrap());
        assert_eq!(key_for(builder, req).await, "maintenance");
    }

    #[actix_web::test]
    async fn test_custom_fn_none_is_unknown() {
        let builder = SimpleInputFunctionBuilder::new(MINUTE, 5)
            .custom_key("auth")
            .custom_fn(|_req| None);
        assert_eq!(key_for(builder, TestRequest::get()).await, "auth-unknown");
    }

    #[actix_web::test]
    async fn test_policy_is_carried() {
        let input_fn = SimpleInputFunctionBuilder::from_policy(Policy::auth(true)).build();
        let input = input_fn(&TestRequest::get().to_srv_request()).await.unwrap();
        assert_eq!(input.max_requests, 3);
        assert_eq!(input.interval, Duration::from_secs(15 * 60));
    }
}
