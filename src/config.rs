use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::bail;
use crate::endpoint::Endpoint;

/// The well-known multicast group peers announce themselves on unless configured otherwise
pub const DEFAULT_ANNOUNCE_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 100, 1);


#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// A connected transport notifies its listener if no data arrived for this long. The
    ///  notification is advisory, the connection stays open. `Duration::ZERO` disables it.
    pub read_timeout: Duration,
    /// time an initiating transport (or a server that failed to listen) waits before it retries
    pub restart_delay: Duration,
    pub read_buffer_size: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            read_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(3),
            read_buffer_size: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be greater than zero");
        }
        if self.restart_delay.is_zero() {
            bail!("restart delay must be greater than zero");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}


#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    /// Datagrams go to this endpoint. If its address is a multicast group, the announcer joins it.
    pub endpoint: Endpoint,
    /// peers connecting here receive the description once, then the connection is closed
    pub tcp_endpoint: Endpoint,
    pub announce_period: Duration,
    pub restart_delay: Duration,
}

impl AnnouncerConfig {
    pub fn new(endpoint: Endpoint, tcp_endpoint: Endpoint) -> AnnouncerConfig {
        AnnouncerConfig {
            endpoint,
            tcp_endpoint,
            announce_period: Duration::from_secs(1),
            restart_delay: Duration::from_secs(3),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.announce_period.is_zero() {
            bail!("announce period must be greater than zero");
        }
        if self.restart_delay.is_zero() {
            bail!("restart delay must be greater than zero");
        }
        if self.endpoint.port == 0 {
            bail!("announce endpoint needs an explicit port");
        }
        Ok(())
    }
}


#[derive(Debug, Clone)]
pub struct DiscovererConfig {
    /// the endpoint announcers send to
    pub endpoint: Endpoint,
    pub restart_delay: Duration,
    /// upper bound for pulling a description from a peer's TCP responder
    pub pull_timeout: Duration,
}

impl DiscovererConfig {
    pub fn new(endpoint: Endpoint) -> DiscovererConfig {
        DiscovererConfig {
            endpoint,
            restart_delay: Duration::from_secs(3),
            pull_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.restart_delay.is_zero() {
            bail!("restart delay must be greater than zero");
        }
        if self.pull_timeout.is_zero() {
            bail!("pull timeout must be greater than zero");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        TransportConfig::new().validate().unwrap();
        AnnouncerConfig::new(Endpoint::new(DEFAULT_ANNOUNCE_GROUP, 9999), Endpoint::any(9998)).validate().unwrap();
        DiscovererConfig::new(Endpoint::new(DEFAULT_ANNOUNCE_GROUP, 9999)).validate().unwrap();
    }

    #[test]
    fn test_zero_read_timeout_is_valid() {
        let mut config = TransportConfig::new();
        config.read_timeout = Duration::ZERO;
        config.validate().unwrap();
    }

    #[rstest]
    #[case::no_buffer(0, Duration::from_secs(1))]
    #[case::no_restart_delay(1024, Duration::ZERO)]
    fn test_invalid_transport_config(#[case] read_buffer_size: usize, #[case] restart_delay: Duration) {
        let mut config = TransportConfig::new();
        config.read_buffer_size = read_buffer_size;
        config.restart_delay = restart_delay;
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_period(Duration::ZERO, 9999)]
    #[case::no_port(Duration::from_secs(1), 0)]
    fn test_invalid_announcer_config(#[case] announce_period: Duration, #[case] port: u16) {
        let mut config = AnnouncerConfig::new(Endpoint::new(DEFAULT_ANNOUNCE_GROUP, port), Endpoint::any(0));
        config.announce_period = announce_period;
        assert!(config.validate().is_err());
    }
}
