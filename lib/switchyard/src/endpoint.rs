//! Backend endpoints and load balancing.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

use switchyard_config::ConfigurationError;
use tracing::{debug, warn};

use crate::config::ClientConfiguration;

/// A backend endpoint, addressed by host and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates a new `Endpoint`.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the value for an HTTP `Host` header addressing this endpoint.
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| "missing port".to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("missing host".to_string());
        }

        let port = port.parse::<u16>().map_err(|e| format!("invalid port: {}", e))?;
        Ok(Self::new(host, port))
    }
}

/// Selects the endpoint for each attempt of an operation.
///
/// Implementations are shared by every request issued through a client, so selection must be thread-safe.
pub trait LoadBalancer: Send + Sync {
    /// Chooses the endpoint for the next attempt.
    ///
    /// `tried` lists the endpoints already attempted for the current operation, oldest first. Implementations should
    /// prefer an endpoint not in `tried`, but may return one of them when nothing else is available. Returns `None`
    /// when there is no endpoint at all.
    fn choose(&self, tried: &[Endpoint]) -> Option<Endpoint>;

    /// Records a failure that the retry policy considers circuit-tripping.
    fn record_failure(&self, _endpoint: &Endpoint) {}

    /// Records a successful attempt.
    fn record_success(&self, _endpoint: &Endpoint) {}
}

/// Round-robin load balancer over a fixed list of endpoints.
///
/// This is the load balancer derived from [`ClientConfiguration::endpoints`] when the caller does not supply one.
#[derive(Debug)]
pub struct StaticLoadBalancer {
    endpoints: Vec<Endpoint>,
    next: AtomicUsize,
}

impl StaticLoadBalancer {
    /// Creates a new `StaticLoadBalancer` over the given endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    /// Creates a `StaticLoadBalancer` from the endpoints in the given configuration.
    ///
    /// An empty endpoint list is allowed: every request through the resulting load balancer fails with
    /// [`RequestError::NoEndpointAvailable`][crate::RequestError::NoEndpointAvailable].
    ///
    /// # Errors
    ///
    /// If any endpoint is malformed, an error will be returned.
    pub fn from_configuration(config: &ClientConfiguration) -> Result<Self, ConfigurationError> {
        let endpoints = config.parsed_endpoints()?;
        if endpoints.is_empty() {
            warn!(client = %config.client_name, "No endpoints configured. Every request will fail.");
        }

        debug!(client = %config.client_name, endpoints = endpoints.len(), "Derived load balancer from configuration.");
        Ok(Self::new(endpoints))
    }

    /// Returns the endpoints being balanced over.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

impl LoadBalancer for StaticLoadBalancer {
    fn choose(&self, tried: &[Endpoint]) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }

        let len = self.endpoints.len();
        let start = self.next.fetch_add(1, Relaxed);
        let fresh = (0..len)
            .map(|offset| &self.endpoints[(start + offset) % len])
            .find(|endpoint| !tried.contains(endpoint));

        Some(fresh.unwrap_or(&self.endpoints[start % len]).clone())
    }
}

/// Returns the supplied load balancer, or derives one from configuration.
///
/// # Errors
///
/// If no load balancer is supplied and the configured endpoints are malformed, an error will be returned.
pub fn resolve(
    config: &ClientConfiguration, explicit: Option<Arc<dyn LoadBalancer>>,
) -> Result<Arc<dyn LoadBalancer>, ConfigurationError> {
    match explicit {
        Some(load_balancer) => Ok(load_balancer),
        None => Ok(Arc::new(StaticLoadBalancer::from_configuration(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(raw: &[&str]) -> Vec<Endpoint> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn parse_endpoint() {
        assert_eq!("example.com:80".parse::<Endpoint>(), Ok(Endpoint::new("example.com", 80)));
        assert_eq!("[::1]:9000".parse::<Endpoint>(), Ok(Endpoint::new("::1", 9000)));
        assert_eq!(Endpoint::new("::1", 9000).to_string(), "[::1]:9000");
        assert!("example.com".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("example.com:http".parse::<Endpoint>().is_err());
    }

    #[test]
    fn round_robin_cycles() {
        let lb = StaticLoadBalancer::new(endpoints(&["a:1", "b:1", "c:1"]));
        let chosen = (0..6).map(|_| lb.choose(&[]).unwrap().host().to_string()).collect::<Vec<_>>();
        assert_eq!(chosen, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn prefers_untried_endpoints() {
        let lb = StaticLoadBalancer::new(endpoints(&["a:1", "b:1", "c:1"]));
        let tried = endpoints(&["a:1", "b:1"]);

        for _ in 0..5 {
            assert_eq!(lb.choose(&tried).unwrap().host(), "c");
        }
    }

    #[test]
    fn falls_back_to_tried_endpoint_when_exhausted() {
        let lb = StaticLoadBalancer::new(endpoints(&["a:1"]));
        assert_eq!(lb.choose(&endpoints(&["a:1"])).unwrap().host(), "a");
        assert!(StaticLoadBalancer::new(Vec::new()).choose(&[]).is_none());
    }

    #[test]
    fn resolve_prefers_explicit() {
        let explicit: Arc<dyn LoadBalancer> = Arc::new(StaticLoadBalancer::new(endpoints(&["x:1"])));
        let resolved = resolve(&ClientConfiguration::default(), Some(Arc::clone(&explicit))).unwrap();
        assert!(Arc::ptr_eq(&explicit, &resolved));
    }

    #[test]
    fn resolve_derives_from_configured_endpoints() {
        let config = ClientConfiguration {
            endpoints: vec!["a:1".to_string()],
            ..Default::default()
        };
        let derived = resolve(&config, None).unwrap();
        assert_eq!(derived.choose(&[]), Some(Endpoint::new("a", 1)));

        let malformed = ClientConfiguration {
            endpoints: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(resolve(&malformed, None).is_err());
    }

    #[test]
    fn empty_configuration_derives_empty_load_balancer() {
        let derived = resolve(&ClientConfiguration::default(), None).unwrap();
        assert!(derived.choose(&[]).is_none());
    }
}
