use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::AnnouncerConfig;
use crate::controller::ControllerStatus;
use crate::discovery::{is_multicast, MAX_ANNOUNCE_SIZE};
use crate::endpoint::Endpoint;
use crate::net::close_barrier::CloseBarrier;
use crate::net::deadline_timer::DeadlineTimer;
use crate::net::tcp_acceptor::TcpAcceptor;
use crate::net::udp_socket::UdpSocket;
use crate::net::EventSink;

/// Fills the buffer with the current description and returns its length. Returning zero means
///  there is nothing to announce right now.
pub type DataCallback = Arc<dyn Fn(&mut [u8]) -> usize + Send + Sync>;

enum AnnouncerEvent {
    Start,
    Stop,
    Restart,
    TimerFired(u64),
    SendDone(io::Result<usize>),
    Accepted(io::Result<TcpStream>),
    Closed,
    Bye,
}

impl Debug for AnnouncerEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnouncerEvent::Start => write!(f, "Start"),
            AnnouncerEvent::Stop => write!(f, "Stop"),
            AnnouncerEvent::Restart => write!(f, "Restart"),
            AnnouncerEvent::TimerFired(generation) => write!(f, "TimerFired({})", generation),
            AnnouncerEvent::SendDone(result) => write!(f, "SendDone({:?})", result),
            AnnouncerEvent::Accepted(result) => write!(f, "Accepted({:?})", result.as_ref().map(|s| s.peer_addr().ok())),
            AnnouncerEvent::Closed => write!(f, "Closed"),
            AnnouncerEvent::Bye => write!(f, "Bye"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AnnouncerState {
    Idle,
    Running,
    Closing,
    RestartPending,
    Terminating,
}

struct AnnouncerShared {
    config: AnnouncerConfig,
    events: EventSink<AnnouncerEvent>,
    stop_requested: AtomicBool,
    status: watch::Sender<ControllerStatus>,
    tcp_endpoint: watch::Sender<Option<Endpoint>>,
    terminated: watch::Sender<bool>,
}

/// Announces a peer description via UDP and answers TCP pulls for it.
///
/// If either the UDP socket or the TCP responder can not be set up, or fails while running,
///  everything is closed and started again after the restart delay.
#[derive(Clone)]
pub struct Announcer {
    inner: Arc<AnnouncerShared>,
}

impl Debug for Announcer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Announcer{{{}, tcp {}}}", self.inner.config.endpoint, self.inner.config.tcp_endpoint)
    }
}

impl Announcer {
    pub fn start(config: AnnouncerConfig, data_callback: DataCallback) -> anyhow::Result<Announcer> {
        config.validate()?;

        let (send, recv) = mpsc::unbounded_channel();
        let announcer = Announcer {
            inner: Arc::new(AnnouncerShared {
                config,
                events: send.clone(),
                stop_requested: AtomicBool::new(false),
                status: watch::Sender::new(ControllerStatus::NotStarted),
                tcp_endpoint: watch::Sender::new(None),
                terminated: watch::Sender::new(false),
            }),
        };

        let actor = AnnouncerActor {
            announcer: announcer.clone(),
            data_callback,
            events: send,
            socket: UdpSocket::new(),
            acceptor: TcpAcceptor::new(),
            timer: DeadlineTimer::new(),
            barrier: CloseBarrier::new(),
            state: AnnouncerState::Idle,
            terminating: false,
            send_in_flight: false,
            scratch: vec![0; MAX_ANNOUNCE_SIZE],
        };

        let span = span!(Level::INFO, "announcer", endpoint = %announcer.inner.config.endpoint);
        tokio::spawn(actor.run(recv).instrument(span));
        announcer.post(AnnouncerEvent::Start);
        Ok(announcer)
    }

    pub fn status(&self) -> ControllerStatus {
        *self.inner.status.borrow()
    }

    pub async fn wait_status(&self, status: ControllerStatus) -> anyhow::Result<()> {
        let mut receiver = self.inner.status.subscribe();
        receiver.wait_for(|s| *s == status).await?;
        Ok(())
    }

    /// Resolves to the endpoint the TCP responder listens on, once it does
    pub async fn tcp_endpoint(&self) -> anyhow::Result<Endpoint> {
        let mut receiver = self.inner.tcp_endpoint.subscribe();
        let endpoint = *receiver.wait_for(|e| e.is_some()).await?;
        endpoint.ok_or_else(|| anyhow!("announcer is not listening"))
    }

    /// closes everything and starts again after the restart delay
    pub fn restart(&self) {
        self.post(AnnouncerEvent::Restart);
    }

    /// Stops the announcer for good, resolving once all its sockets are closed. Stopping an
    ///  announcer twice is a usage error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            error!("{:?} was stopped twice", self);
            bail!("announcer is already stopped");
        }
        self.post(AnnouncerEvent::Stop);

        let mut terminated = self.inner.terminated.subscribe();
        terminated.wait_for(|t| *t).await?;
        Ok(())
    }

    fn post(&self, event: AnnouncerEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("announcer is already terminated");
        }
    }
}


struct AnnouncerActor {
    announcer: Announcer,
    data_callback: DataCallback,
    events: EventSink<AnnouncerEvent>,
    socket: UdpSocket,
    acceptor: TcpAcceptor,
    timer: DeadlineTimer,
    barrier: CloseBarrier,
    state: AnnouncerState,
    terminating: bool,
    send_in_flight: bool,
    scratch: Vec<u8>,
}

impl AnnouncerActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<AnnouncerEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
    }

    fn config(&self) -> &AnnouncerConfig {
        &self.announcer.inner.config
    }

    fn handle_event(&mut self, event: AnnouncerEvent) -> bool {
        trace!("{:?} in state {:?}", event, self.state);

        match event {
            AnnouncerEvent::Start => {
                if self.state == AnnouncerState::Idle && !self.terminating {
                    self.do_start();
                }
            }
            AnnouncerEvent::Stop => {
                self.terminating = true;
                self.do_close();
            }
            AnnouncerEvent::Restart => {
                if self.state == AnnouncerState::Running {
                    info!("restarting");
                    self.do_close();
                }
            }
            AnnouncerEvent::TimerFired(generation) => {
                if self.timer.is_current(generation) {
                    match self.state {
                        AnnouncerState::Running => self.on_tick(),
                        AnnouncerState::RestartPending => self.do_start(),
                        _ => {}
                    }
                }
            }
            AnnouncerEvent::SendDone(result) => {
                if self.state == AnnouncerState::Running {
                    self.send_in_flight = false;
                    match result {
                        Ok(n) => trace!("announced {} bytes", n),
                        Err(e) => {
                            warn!("announcing failed: {}", e);
                            self.do_close();
                        }
                    }
                }
            }
            AnnouncerEvent::Accepted(Ok(stream)) => {
                if self.state == AnnouncerState::Running {
                    self.respond(stream);
                }
            }
            AnnouncerEvent::Accepted(Err(e)) => {
                if self.state == AnnouncerState::Running {
                    warn!("accepting pulls failed: {}", e);
                    self.do_close();
                }
            }
            AnnouncerEvent::Closed => {
                if self.barrier.confirm() {
                    self.on_all_closed();
                }
            }
            AnnouncerEvent::Bye => {
                info!("stopped");
                self.announcer.inner.terminated.send_replace(true);
                return false;
            }
        }
        true
    }

    fn open_udp(&mut self) -> io::Result<()> {
        let endpoint = self.config().endpoint;
        self.socket.bind(Endpoint::any(endpoint.port), true)?;
        if is_multicast(&endpoint) {
            self.socket.join_multicast_group(endpoint.address)?;
        }
        Ok(())
    }

    fn open_tcp(&mut self) -> io::Result<Endpoint> {
        self.acceptor.bind(self.config().tcp_endpoint)?;
        self.acceptor.local_endpoint()
    }

    fn do_start(&mut self) {
        let udp = self.open_udp();
        let tcp = self.open_tcp();

        if let Err(e) = &udp {
            warn!("opening UDP socket for {} failed: {}", self.config().endpoint, e);
        }
        if let Err(e) = &tcp {
            warn!("opening TCP responder on {} failed: {}", self.config().tcp_endpoint, e);
        }

        self.state = AnnouncerState::Running;
        match (udp, tcp) {
            (Ok(()), Ok(tcp_endpoint)) => {
                info!("announcing to {}, responding on {}", self.config().endpoint, tcp_endpoint);
                self.timer.wait(Duration::ZERO, &self.events, AnnouncerEvent::TimerFired);
                self.acceptor.start_listen(&self.events, AnnouncerEvent::Accepted);
                self.announcer.inner.tcp_endpoint.send_replace(Some(tcp_endpoint));
                self.announcer.inner.status.send_replace(ControllerStatus::Started);
            }
            _ => {
                if !self.terminating {
                    self.announcer.inner.status.send_replace(ControllerStatus::StartFailed);
                }
                self.do_close();
            }
        }
    }

    /// Broadcasts the current description unless there is none. The cadence is kept either way.
    fn on_tick(&mut self) {
        let period = self.config().announce_period;
        self.timer.wait(period, &self.events, AnnouncerEvent::TimerFired);

        if self.send_in_flight {
            debug!("previous announcement still in flight, skipping");
            return;
        }
        let len = (self.data_callback)(&mut self.scratch).min(self.scratch.len());
        if len == 0 {
            trace!("nothing to announce");
            return;
        }

        self.send_in_flight = true;
        let target = self.config().endpoint;
        let data = Bytes::copy_from_slice(&self.scratch[..len]);
        self.socket.send_to(data, target, &self.events, AnnouncerEvent::SendDone);
    }

    /// Writes the description to a peer that connected to the responder, then closes the
    ///  connection. The write runs detached from the announcer's lifecycle.
    fn respond(&mut self, mut stream: TcpStream) {
        let len = (self.data_callback)(&mut self.scratch).min(self.scratch.len());
        if len == 0 {
            debug!("nothing to respond with, closing pull connection");
            return;
        }

        let data = self.scratch[..len].to_vec();
        tokio::spawn(async move {
            let result = match stream.write_all(&data).await {
                Ok(()) => stream.shutdown().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => trace!("responded with {} bytes", data.len()),
                Err(e) => debug!("responding failed: {}", e),
            }
        }.in_current_span());
    }

    fn do_close(&mut self) {
        if !matches!(self.state, AnnouncerState::Idle | AnnouncerState::Running | AnnouncerState::RestartPending) {
            return;
        }
        self.state = AnnouncerState::Closing;
        self.send_in_flight = false;
        self.announcer.inner.tcp_endpoint.send_replace(None);

        if self.socket.close(&self.events, || AnnouncerEvent::Closed) {
            self.barrier.register();
        }
        if self.acceptor.close(&self.events, || AnnouncerEvent::Closed) {
            self.barrier.register();
        }
        if self.timer.close(&self.events, || AnnouncerEvent::Closed) {
            self.barrier.register();
        }
        if self.barrier.is_idle() {
            self.on_all_closed();
        }
    }

    fn on_all_closed(&mut self) {
        if self.terminating {
            self.state = AnnouncerState::Terminating;
            let _ = self.events.send(AnnouncerEvent::Bye);
        }
        else {
            let delay = self.config().restart_delay;
            debug!("starting again in {:?}", delay);
            self.state = AnnouncerState::RestartPending;
            self.timer.wait(delay, &self.events, AnnouncerEvent::TimerFired);
        }
    }
}
