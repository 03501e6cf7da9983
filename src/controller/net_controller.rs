use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use crate::config::TransportConfig;
use crate::controller::ControllerStatus;
use crate::endpoint::Endpoint;
use crate::net_config::{NetConfig, NetworkRole};
use crate::proto::proto_driver::ProtoDriver;
use crate::service_registrar::{ServiceContext, ServiceRegistrar};
use crate::transport::listener::{ClientListener, ServerListener};
use crate::transport::tcp_client_transport::TcpClientTransport;
use crate::transport::tcp_server_transport::TcpServerTransport;
use crate::transport::TransportId;

#[derive(Default)]
struct Clients {
    stopping: bool,
    running: FxHashMap<TransportId, TcpClientTransport>,
}

struct ControllerShared {
    config: NetConfig,
    registrar: Arc<ServiceRegistrar>,
    context: ServiceContext,
    servers: Vec<TcpServerTransport>,
    clients: Mutex<Clients>,
    /// number of started transports (servers and clients) that did not terminate yet
    live: watch::Sender<usize>,
}

impl ControllerShared {
    fn clients(&self) -> MutexGuard<'_, Clients> {
        self.clients.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Starts `client` with a fresh protocol driver. Returns `false` if the controller is
    ///  stopping, in which case the client is started and stopped right away so it still
    ///  terminates (and gets reclaimed) like every other client.
    fn start_client(self: &Arc<Self>, client: &TcpClientTransport, role: NetworkRole, server: Option<TcpServerTransport>) -> anyhow::Result<bool> {
        let driver = ProtoDriver::new(
            role,
            &self.config.services,
            self.registrar.clone(),
            self.context.clone(),
            Arc::new(client.clone()),
        );
        let listener = Arc::new(ConnectionListener {
            driver,
            controller: Arc::downgrade(self),
            server,
        });

        let stopping = {
            let mut clients = self.clients();
            if !clients.stopping {
                clients.running.insert(client.id(), client.clone());
            }
            clients.stopping
        };

        self.live.send_modify(|n| *n += 1);
        if let Err(e) = client.start(listener) {
            self.clients().running.remove(&client.id());
            self.live.send_modify(|n| *n -= 1);
            return Err(e);
        }
        if stopping {
            client.stop()?;
        }
        Ok(!stopping)
    }

    fn on_terminated(&self, client: Option<TransportId>) {
        if let Some(id) = client {
            self.clients().running.remove(&id);
        }
        self.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Runs the transports of a [NetConfig] and a [ProtoDriver] for every connection on them.
///
/// In server role there is a listening server transport per configured transport, and every
///  accepted connection gets its own driver and service instances. In client role there is an
///  initiator per configured transport, which keeps reconnecting until the controller is stopped.
#[derive(Clone)]
pub struct NetController {
    inner: Arc<ControllerShared>,
}

impl NetController {
    pub fn start(config: NetConfig, registrar: Arc<ServiceRegistrar>, context: ServiceContext, transport_config: TransportConfig) -> anyhow::Result<NetController> {
        config.validate()?;
        transport_config.validate()?;

        let servers = match config.role {
            NetworkRole::Server => config.transports.iter()
                .map(|t| TcpServerTransport::new(t.endpoint, transport_config.clone()))
                .collect(),
            NetworkRole::Client => Vec::new(),
        };

        let inner = Arc::new(ControllerShared {
            config,
            registrar,
            context,
            servers,
            clients: Default::default(),
            live: watch::Sender::new(0),
        });

        match inner.config.role {
            NetworkRole::Server => {
                for server in &inner.servers {
                    inner.live.send_modify(|n| *n += 1);
                    server.start(Arc::new(SpawnListener { controller: Arc::downgrade(&inner) }))?;
                }
            }
            NetworkRole::Client => {
                for transport in &inner.config.transports {
                    let client = TcpClientTransport::new_initiator(transport.endpoint, transport_config.clone());
                    inner.start_client(&client, NetworkRole::Client, None)?;
                }
            }
        }

        info!("started {:?} controller with {} transports", inner.config.role, inner.config.transports.len());
        Ok(NetController { inner })
    }

    pub fn role(&self) -> NetworkRole {
        self.inner.config.role
    }

    /// `Started` from a successful start until the controller is stopped
    pub fn status(&self) -> ControllerStatus {
        if self.inner.clients().stopping {
            ControllerStatus::NotStarted
        }
        else {
            ControllerStatus::Started
        }
    }

    /// Drops every live connection. Initiators reconnect after their restart delay, accepted
    ///  connections terminate while the servers keep listening.
    pub fn restart(&self) {
        let clients: Vec<TcpClientTransport> = self.inner.clients().running.values().cloned().collect();
        info!("restarting {} connections", clients.len());
        for client in clients {
            client.reset();
        }
    }

    /// the number of transports that were started and did not terminate yet
    pub fn live_count(&self) -> usize {
        *self.inner.live.borrow()
    }

    /// the endpoints the server transports are listening on, once all of them are
    pub async fn listening_endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        let mut result = Vec::with_capacity(self.inner.servers.len());
        for server in &self.inner.servers {
            result.push(server.listening_endpoint().await?);
        }
        Ok(result)
    }

    /// Stops all servers and connections, resolving once every one of them terminated.
    ///  Stopping a controller twice is a usage error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let clients: Vec<TcpClientTransport> = {
            let mut clients = self.inner.clients();
            if clients.stopping {
                error!("net controller was stopped twice");
                bail!("net controller is already stopped");
            }
            clients.stopping = true;
            clients.running.values().cloned().collect()
        };

        info!("stopping {} servers and {} connections", self.inner.servers.len(), clients.len());
        for server in &self.inner.servers {
            if let Err(e) = server.stop() {
                warn!("{}", e);
            }
        }
        for client in clients {
            if let Err(e) = client.stop() {
                warn!("{}", e);
            }
        }

        let mut live = self.inner.live.subscribe();
        live.wait_for(|n| *n == 0).await
            .map_err(|_| anyhow!("net controller state was dropped"))?;
        info!("stopped");
        Ok(())
    }
}


struct SpawnListener {
    controller: Weak<ControllerShared>,
}

#[async_trait]
impl ServerListener for SpawnListener {
    async fn on_transport_spawned(&self, server: &TcpServerTransport, client: &TcpClientTransport) {
        let Some(controller) = self.controller.upgrade() else {
            warn!("controller is gone, dropping {:?}", client);
            let _ = server.reclaim_client(client.id());
            return;
        };
        match controller.start_client(client, NetworkRole::Server, Some(server.clone())) {
            Ok(true) => debug!("started {:?}", client),
            Ok(false) => debug!("stopping {:?} right away, the controller is stopping", client),
            Err(e) => {
                error!("starting {:?} failed: {}", client, e);
                let _ = server.reclaim_client(client.id());
            }
        }
    }

    async fn on_transport_terminated(&self, server: &TcpServerTransport) {
        debug!("{:?} terminated", server);
        if let Some(controller) = self.controller.upgrade() {
            controller.on_terminated(None);
        }
    }
}


/// Forwards a transport's notifications to its connection's driver
struct ConnectionListener {
    driver: Arc<ProtoDriver>,
    controller: Weak<ControllerShared>,
    /// the server that spawned the transport, if it was accepted
    server: Option<TcpServerTransport>,
}

#[async_trait]
impl ClientListener for ConnectionListener {
    async fn on_transport_connected(&self, _transport: &TcpClientTransport, remote: Endpoint) {
        self.driver.on_connected(remote);
    }

    async fn on_transport_disconnected(&self, _transport: &TcpClientTransport, error: Option<io::ErrorKind>) {
        debug!("connection lost: {:?}", error);
        self.driver.on_disconnected();
    }

    async fn on_transport_data_received(&self, transport: &TcpClientTransport, data: &[u8]) {
        if !self.driver.on_data_received(data) {
            warn!("protocol violation on {:?}, resetting the connection", transport);
            transport.reset();
        }
    }

    async fn on_transport_send_complete(&self, _transport: &TcpClientTransport) {
        self.driver.on_send_complete();
    }

    async fn on_transport_read_timeout(&self, transport: &TcpClientTransport) {
        if !self.driver.on_read_timeout() {
            transport.reset();
        }
    }

    async fn on_transport_terminated(&self, transport: &TcpClientTransport) {
        self.driver.release_services();
        if let Some(server) = &self.server {
            if let Err(e) = server.reclaim_client(transport.id()) {
                error!("{}", e);
            }
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.on_terminated(Some(transport.id()));
        }
    }
}
