use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::net::close_barrier::CloseBarrier;
use crate::net::deadline_timer::DeadlineTimer;
use crate::net::tcp_acceptor::TcpAcceptor;
use crate::net::EventSink;
use crate::transport::listener::ServerListener;
use crate::transport::tcp_client_transport::TcpClientTransport;
use crate::transport::TransportId;

enum ServerEvent {
    Start,
    Stop,
    Accepted(io::Result<TcpStream>),
    TimerFired(u64),
    Closed,
    Terminate,
}

impl Debug for ServerEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerEvent::Start => write!(f, "Start"),
            ServerEvent::Stop => write!(f, "Stop"),
            ServerEvent::Accepted(result) => write!(f, "Accepted({:?})", result.as_ref().map(|s| s.peer_addr().ok())),
            ServerEvent::TimerFired(generation) => write!(f, "TimerFired({})", generation),
            ServerEvent::Closed => write!(f, "Closed"),
            ServerEvent::Terminate => write!(f, "Terminate"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ServerState {
    Idle,
    Listening,
    Closing,
    RestartPending,
    Terminating,
    Terminated,
}

struct ServerShared {
    endpoint: Endpoint,
    config: TransportConfig,
    events: EventSink<ServerEvent>,
    pending_start: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    spawned: Mutex<FxHashMap<TransportId, TcpClientTransport>>,
    stop_requested: AtomicBool,
    listening: watch::Sender<Option<Endpoint>>,
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let num_spawned = self.spawned.get_mut()
            .map(|spawned| spawned.len())
            .unwrap_or(0);
        debug_assert!(num_spawned == 0, "server transport dropped with {} spawned clients that were never reclaimed", num_spawned);
    }
}

/// Listens on an endpoint and spawns an accepted [TcpClientTransport] for every incoming
///  connection.
///
/// The server owns the clients it spawned until they are handed back through
///  [TcpServerTransport::reclaim_client], typically once they terminated. Every spawned client
///  must be reclaimed before the server is dropped.
#[derive(Clone)]
pub struct TcpServerTransport {
    inner: Arc<ServerShared>,
}

impl Debug for TcpServerTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpServerTransport{{{}}}", self.inner.endpoint)
    }
}

impl TcpServerTransport {
    /// `config` is used for the server's own restarts and for all clients it spawns
    pub fn new(endpoint: Endpoint, config: TransportConfig) -> TcpServerTransport {
        let (send, recv) = mpsc::unbounded_channel();
        TcpServerTransport {
            inner: Arc::new(ServerShared {
                endpoint,
                config,
                events: send,
                pending_start: Mutex::new(Some(recv)),
                spawned: Default::default(),
                stop_requested: AtomicBool::new(false),
                listening: watch::Sender::new(None),
            })
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub fn start(&self, listener: Arc<dyn ServerListener>) -> anyhow::Result<()> {
        self.inner.config.validate()?;

        let pending = self.inner.pending_start.lock()
            .map_err(|_| anyhow!("server state is poisoned"))?
            .take();
        let Some(events) = pending else {
            bail!("server transport {} was already started", self.endpoint());
        };

        let actor = ServerActor {
            server: self.clone(),
            listener,
            events: self.inner.events.clone(),
            acceptor: TcpAcceptor::new(),
            timer: DeadlineTimer::new(),
            barrier: CloseBarrier::new(),
            state: ServerState::Idle,
            terminating: false,
        };

        let span = span!(Level::INFO, "server", endpoint = %self.endpoint());
        tokio::spawn(actor.run(events).instrument(span));
        self.post(ServerEvent::Start);
        Ok(())
    }

    /// Stops listening for good. This does not touch spawned clients, those are the owner's to
    ///  stop. Stopping a server twice is a usage error.
    pub fn stop(&self) -> anyhow::Result<()> {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            error!("server transport {} was stopped twice", self.endpoint());
            bail!("server transport {} is already stopped", self.endpoint());
        }
        self.post(ServerEvent::Stop);
        Ok(())
    }

    /// Hands a spawned client back, removing it from the server. Reclaiming a client that this
    ///  server did not spawn, or that was reclaimed already, is a usage error.
    pub fn reclaim_client(&self, id: TransportId) -> anyhow::Result<()> {
        match self.spawned()?.remove(&id) {
            Some(client) => {
                debug!("reclaimed {:?}", client);
                Ok(())
            }
            None => {
                error!("reclaiming {} which is not a spawned client of {}", id, self.endpoint());
                bail!("{} is not a spawned client of {}", id, self.endpoint())
            }
        }
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned()
            .map(|spawned| spawned.len())
            .unwrap_or(0)
    }

    pub fn spawned_clients(&self) -> Vec<TcpClientTransport> {
        self.spawned()
            .map(|spawned| spawned.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolves to the endpoint the server is listening on, once it is. This is the way to find
    ///  out the actual port when the server was configured with port 0.
    pub async fn listening_endpoint(&self) -> anyhow::Result<Endpoint> {
        let mut receiver = self.inner.listening.subscribe();
        let endpoint = *receiver.wait_for(|e| e.is_some()).await?;
        endpoint.ok_or_else(|| anyhow!("server is not listening"))
    }

    fn spawned(&self) -> anyhow::Result<MutexGuard<'_, FxHashMap<TransportId, TcpClientTransport>>> {
        self.inner.spawned.lock()
            .map_err(|_| anyhow!("server state is poisoned"))
    }

    fn post(&self, event: ServerEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("server transport {} is already terminated", self.endpoint());
        }
    }
}


struct ServerActor {
    server: TcpServerTransport,
    listener: Arc<dyn ServerListener>,
    events: EventSink<ServerEvent>,
    acceptor: TcpAcceptor,
    timer: DeadlineTimer,
    barrier: CloseBarrier,
    state: ServerState,
    terminating: bool,
}

impl ServerActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) -> bool {
        trace!("{:?} in state {:?}", event, self.state);

        match event {
            ServerEvent::Start => {
                if self.state == ServerState::Idle && !self.terminating {
                    self.do_start();
                }
            }
            ServerEvent::Stop => {
                self.terminating = true;
                self.do_close();
            }
            ServerEvent::Accepted(Ok(stream)) => self.on_accepted(stream).await,
            ServerEvent::Accepted(Err(e)) => {
                if self.state == ServerState::Listening {
                    warn!("accepting connections failed: {}", e);
                    self.do_close();
                }
            }
            ServerEvent::TimerFired(generation) => {
                if self.timer.is_current(generation) && self.state == ServerState::RestartPending {
                    self.do_start();
                }
            }
            ServerEvent::Closed => {
                if self.barrier.confirm() {
                    self.on_all_closed();
                }
            }
            ServerEvent::Terminate => {
                self.state = ServerState::Terminated;
                info!("terminated");
                self.listener.on_transport_terminated(&self.server).await;
                return false;
            }
        }
        true
    }

    fn do_start(&mut self) {
        let endpoint = self.server.endpoint();
        let bound = self.acceptor.bind(endpoint)
            .and_then(|_| self.acceptor.local_endpoint());

        match bound {
            Ok(local) => {
                info!("listening on {}", local);
                self.state = ServerState::Listening;
                self.acceptor.start_listen(&self.events, ServerEvent::Accepted);
                self.server.inner.listening.send_replace(Some(local));
            }
            Err(e) => {
                warn!("listening on {} failed: {}", endpoint, e);
                self.state = ServerState::Listening;
                self.do_close();
            }
        }
    }

    async fn on_accepted(&mut self, stream: TcpStream) {
        if self.state != ServerState::Listening {
            return;
        }

        let client = TcpClientTransport::new_accepted(stream, self.server.inner.config.clone());
        debug!("spawned {:?}", client);
        match self.server.spawned() {
            Ok(mut spawned) => {
                spawned.insert(client.id(), client.clone());
            }
            Err(e) => {
                error!("dropping accepted connection: {}", e);
                return;
            }
        }
        self.listener.on_transport_spawned(&self.server, &client).await;
    }

    fn do_close(&mut self) {
        if !matches!(self.state, ServerState::Idle | ServerState::Listening | ServerState::RestartPending) {
            return;
        }
        self.state = ServerState::Closing;
        self.server.inner.listening.send_replace(None);

        if self.acceptor.close(&self.events, || ServerEvent::Closed) {
            self.barrier.register();
        }
        if self.timer.close(&self.events, || ServerEvent::Closed) {
            self.barrier.register();
        }
        if self.barrier.is_idle() {
            self.on_all_closed();
        }
    }

    fn on_all_closed(&mut self) {
        if self.terminating {
            self.state = ServerState::Terminating;
            let _ = self.events.send(ServerEvent::Terminate);
        }
        else {
            let delay = self.server.inner.config.restart_delay;
            debug!("listening again in {:?}", delay);
            self.state = ServerState::RestartPending;
            self.timer.wait(delay, &self.events, ServerEvent::TimerFired);
        }
    }
}
