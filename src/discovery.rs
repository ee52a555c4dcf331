//! Service discovery of Wi-Fi drones
//!
//! Bebop drones advertise their control port over mDNS. The discovery itself
//! is left to a [`ServiceDiscovery`] implementation; [`StaticDiscovery`]
//! answers with a known address, which is what the Mambo needs since its
//! firmware stopped advertising.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

/// Address and control port of a discovered drone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Drone address
    pub address: IpAddr,
    /// TCP port of the handshake
    pub port: u16,
}

impl ServiceInfo {
    /// Socket address of the handshake
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Source of drone addresses
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Look for `service` once, `None` if it has not been seen yet
    async fn poll(&self, service: &str) -> Option<ServiceInfo>;
}

/// Discovery answering every service with a fixed address
#[derive(Debug, Clone, Copy)]
pub struct StaticDiscovery {
    info: ServiceInfo,
}

impl StaticDiscovery {
    /// Always answer `address`
    pub fn new(address: SocketAddr) -> Self {
        StaticDiscovery { info: ServiceInfo { address: address.ip(), port: address.port() } }
    }

    /// Address of a Mambo FPV camera access point
    pub fn mambo() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 99, 3)), 44444))
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn poll(&self, _service: &str) -> Option<ServiceInfo> {
        Some(self.info)
    }
}

/// Poll `discovery` up to `num_retries` times, `interval` apart
pub async fn discover(
    discovery: &dyn ServiceDiscovery,
    service: &str,
    num_retries: u32,
    interval: Duration,
) -> Option<ServiceInfo> {
    for attempt in 0..num_retries.max(1) {
        if let Some(info) = discovery.poll(service).await {
            log::info!("Found {} at {}", service, info.socket_addr());
            return Some(info);
        }
        log::debug!("{} not seen yet (poll {}/{})", service, attempt + 1, num_retries);
        tokio::time::sleep(interval).await;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct LateDiscovery {
        polls: AtomicU32,
        answer_on: u32,
    }

    #[async_trait]
    impl ServiceDiscovery for LateDiscovery {
        async fn poll(&self, _service: &str) -> Option<ServiceInfo> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            (n >= self.answer_on).then(|| StaticDiscovery::mambo().info)
        }
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let info = StaticDiscovery::mambo().poll("_arsdk-090b._udp.local.").await.unwrap();
        assert_eq!(info.socket_addr(), "192.168.99.3:44444".parse().unwrap());
    }

    #[tokio::test]
    async fn test_discover_waits_for_service() {
        let discovery = LateDiscovery { polls: AtomicU32::new(0), answer_on: 3 };
        let info = discover(&discovery, "_arsdk-0901._udp.local.", 5, Duration::from_millis(1)).await;
        assert!(info.is_some());
        assert_eq!(discovery.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_discover_is_bounded() {
        let discovery = LateDiscovery { polls: AtomicU32::new(0), answer_on: u32::MAX };
        let info = discover(&discovery, "_arsdk-0901._udp.local.", 4, Duration::from_millis(1)).await;
        assert!(info.is_none());
        assert_eq!(discovery.polls.load(Ordering::SeqCst), 4);
    }
}
