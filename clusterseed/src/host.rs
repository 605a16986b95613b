//! Host address discovery and value templating.

use crate::errors::HostAddressError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Token replaced with the host address in templated chart values.
pub const HOST_PLACEHOLDER: &str = "K8SHOST";

/// Public address used to pick the outbound interface. Nothing is sent.
pub const DEFAULT_ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 80);

/// The bootstrap host's outward-facing IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostAddress(IpAddr);

impl HostAddress {
    /// Wraps an IP address.
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    /// The wrapped IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0
    }

    /// Replaces every [`HOST_PLACEHOLDER`] in `template` with this address.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        template.replace(HOST_PLACEHOLDER, &self.0.to_string())
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Source of the host address.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Discovers the address other nodes and the API server should use.
    async fn discover(&self) -> Result<HostAddress, HostAddressError>;
}

/// Finds the address of the interface holding the default route.
///
/// Connecting a UDP socket only selects a route; no packet leaves the host.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRouteResolver {
    probe: SocketAddr,
}

impl Default for DefaultRouteResolver {
    fn default() -> Self {
        Self {
            probe: DEFAULT_ROUTE_PROBE,
        }
    }
}

impl DefaultRouteResolver {
    /// Uses `probe` instead of the default public address.
    #[must_use]
    pub const fn with_probe(probe: SocketAddr) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl HostResolver for DefaultRouteResolver {
    async fn discover(&self) -> Result<HostAddress, HostAddressError> {
        let bind: SocketAddr = match self.probe {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await.map_err(HostAddressError::Discovery)?;
        socket.connect(self.probe).await.map_err(HostAddressError::Discovery)?;
        let local = socket.local_addr().map_err(HostAddressError::Discovery)?;

        Ok(HostAddress(local.ip()))
    }
}

/// Always returns the configured address.
#[derive(Debug, Clone, Copy)]
pub struct StaticHostResolver(pub HostAddress);

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn discover(&self) -> Result<HostAddress, HostAddressError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub() -> HostAddress {
        HostAddress::new("10.0.0.5".parse().unwrap())
    }

    #[test]
    fn test_render_replaces_placeholder() {
        let rendered = stub().render("k8sServiceHost: K8SHOST\nk8sServicePort: 6443\n");

        assert!(rendered.contains("10.0.0.5"));
        assert!(!rendered.contains(HOST_PLACEHOLDER));
    }

    #[test]
    fn test_render_replaces_every_occurrence() {
        let rendered = stub().render("a: K8SHOST\nb: https://K8SHOST:6443\n");

        assert_eq!(rendered, "a: 10.0.0.5\nb: https://10.0.0.5:6443\n");
    }

    #[test]
    fn test_render_without_placeholder_is_identity() {
        assert_eq!(stub().render("replicas: 1\n"), "replicas: 1\n");
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(stub().to_string(), "10.0.0.5");
        assert_eq!(serde_json::to_value(stub()).unwrap(), serde_json::json!("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        assert_eq!(StaticHostResolver(stub()).discover().await.unwrap(), stub());
    }

    #[tokio::test]
    async fn test_default_route_resolver_loopback_probe() {
        let resolver = DefaultRouteResolver::with_probe("127.0.0.1:9".parse().unwrap());
        let address = resolver.discover().await.unwrap();

        assert!(address.ip().is_loopback());
    }
}
