use std::net::Ipv4Addr;
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum NetworkRole {
    Server = 0,
    Client = 1,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum TransportType {
    Tcp = 0,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransportSpec {
    pub transport_type: TransportType,
    pub endpoint: Endpoint,
}

/// The network setup of a peer: its role, the transports it listens on (server) or connects to
///  (client), and the services it offers over every connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NetConfig {
    pub role: NetworkRole,
    pub transports: Vec<TransportSpec>,
    pub services: Vec<u32>,
}

impl NetConfig {
    pub fn new(role: NetworkRole) -> NetConfig {
        NetConfig {
            role,
            transports: Vec::new(),
            services: Vec::new(),
        }
    }

    /// returns `false` if there is a transport for `endpoint` already
    pub fn add_transport(&mut self, transport_type: TransportType, endpoint: Endpoint) -> bool {
        if self.transports.iter().any(|t| t.endpoint == endpoint) {
            return false;
        }
        self.transports.push(TransportSpec { transport_type, endpoint });
        true
    }

    /// returns `false` if the service was added before
    pub fn add_service(&mut self, service_id: u32) -> bool {
        if self.services.contains(&service_id) {
            return false;
        }
        self.services.push(service_id);
        true
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transports.is_empty() {
            bail!("network configuration has no transports");
        }
        if self.services.is_empty() {
            bail!("network configuration has no services");
        }
        Ok(())
    }

    /// The configuration of a client that connects to the server described by `self`, running
    ///  at `address`.
    pub fn mirror(&self, address: Ipv4Addr) -> NetConfig {
        NetConfig {
            role: NetworkRole::Client,
            transports: self.transports.iter()
                .map(|t| TransportSpec {
                    transport_type: t.transport_type,
                    endpoint: Endpoint::new(address, t.endpoint.port),
                })
                .collect(),
            services: self.services.clone(),
        }
    }
}
