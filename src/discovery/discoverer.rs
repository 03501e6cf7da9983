use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::DiscovererConfig;
use crate::controller::ControllerStatus;
use crate::discovery::{is_multicast, MAX_ANNOUNCE_SIZE};
use crate::endpoint::Endpoint;
use crate::net::close_barrier::CloseBarrier;
use crate::net::deadline_timer::DeadlineTimer;
use crate::net::tcp_socket::TcpSocket;
use crate::net::udp_socket::UdpSocket;
use crate::net::EventSink;

/// Receives every announcement and every pulled description, with the endpoint it came from
pub type DataReadyCallback = Arc<dyn Fn(&[u8], Endpoint) + Send + Sync>;

const PULL_READ_SIZE: usize = 4096;

enum DiscovererEvent {
    Start,
    Stop,
    Restart,
    TimerFired(u64),
    Received(io::Result<(Bytes, Endpoint)>),
    Discover(Endpoint),
    PullConnected(u64, io::Result<TcpStream>),
    PullRead(u64, io::Result<usize>, Vec<u8>),
    PullTimeout(u64),
    Closed,
    Bye,
}

impl Debug for DiscovererEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscovererEvent::Start => write!(f, "Start"),
            DiscovererEvent::Stop => write!(f, "Stop"),
            DiscovererEvent::Restart => write!(f, "Restart"),
            DiscovererEvent::TimerFired(generation) => write!(f, "TimerFired({})", generation),
            DiscovererEvent::Received(result) => write!(f, "Received({:?})", result.as_ref().map(|(data, from)| (data.len(), *from))),
            DiscovererEvent::Discover(endpoint) => write!(f, "Discover({})", endpoint),
            DiscovererEvent::PullConnected(pull, result) => write!(f, "PullConnected({}, {:?})", pull, result.as_ref().map(|_| ())),
            DiscovererEvent::PullRead(pull, result, _) => write!(f, "PullRead({}, {:?})", pull, result),
            DiscovererEvent::PullTimeout(generation) => write!(f, "PullTimeout({})", generation),
            DiscovererEvent::Closed => write!(f, "Closed"),
            DiscovererEvent::Bye => write!(f, "Bye"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum DiscovererState {
    Idle,
    Running,
    Closing,
    RestartPending,
    Terminating,
}

struct DiscovererShared {
    config: DiscovererConfig,
    events: EventSink<DiscovererEvent>,
    stop_requested: AtomicBool,
    pull_in_flight: AtomicBool,
    status: watch::Sender<ControllerStatus>,
    terminated: watch::Sender<bool>,
}

/// Listens for announcements, and pulls descriptions from announcers' TCP responders on request
#[derive(Clone)]
pub struct Discoverer {
    inner: Arc<DiscovererShared>,
}

impl Debug for Discoverer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Discoverer{{{}}}", self.inner.config.endpoint)
    }
}

impl Discoverer {
    pub fn start(config: DiscovererConfig, data_ready: DataReadyCallback) -> anyhow::Result<Discoverer> {
        config.validate()?;

        let (send, recv) = mpsc::unbounded_channel();
        let discoverer = Discoverer {
            inner: Arc::new(DiscovererShared {
                config,
                events: send.clone(),
                stop_requested: AtomicBool::new(false),
                pull_in_flight: AtomicBool::new(false),
                status: watch::Sender::new(ControllerStatus::NotStarted),
                terminated: watch::Sender::new(false),
            }),
        };

        let actor = DiscovererActor {
            discoverer: discoverer.clone(),
            data_ready,
            events: send,
            socket: UdpSocket::new(),
            timer: DeadlineTimer::new(),
            pull_socket: TcpSocket::new(),
            pull_timer: DeadlineTimer::new(),
            pull: None,
            next_pull_id: 0,
            barrier: CloseBarrier::new(),
            state: DiscovererState::Idle,
            terminating: false,
        };

        let span = span!(Level::INFO, "discoverer", endpoint = %discoverer.inner.config.endpoint);
        tokio::spawn(actor.run(recv).instrument(span));
        discoverer.post(DiscovererEvent::Start);
        Ok(discoverer)
    }

    pub fn status(&self) -> ControllerStatus {
        *self.inner.status.borrow()
    }

    pub async fn wait_status(&self, status: ControllerStatus) -> anyhow::Result<()> {
        let mut receiver = self.inner.status.subscribe();
        receiver.wait_for(|s| *s == status).await?;
        Ok(())
    }

    /// Pulls a description from the announcer whose TCP responder listens on `endpoint`. The
    ///  result goes to the data ready callback. Returns `false` if the discoverer is not running
    ///  or another pull is still in flight.
    pub fn try_discover_device(&self, endpoint: Endpoint) -> bool {
        if self.inner.stop_requested.load(Ordering::Acquire) || self.status() != ControllerStatus::Started {
            return false;
        }
        if self.inner.pull_in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("pull from {} rejected, another one is in flight", endpoint);
            return false;
        }
        self.post(DiscovererEvent::Discover(endpoint));
        true
    }

    pub fn restart(&self) {
        self.post(DiscovererEvent::Restart);
    }

    /// Stops the discoverer for good, resolving once all its sockets are closed. Stopping a
    ///  discoverer twice is a usage error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            error!("{:?} was stopped twice", self);
            bail!("discoverer is already stopped");
        }
        self.post(DiscovererEvent::Stop);

        let mut terminated = self.inner.terminated.subscribe();
        terminated.wait_for(|t| *t).await?;
        Ok(())
    }

    fn post(&self, event: DiscovererEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("discoverer is already terminated");
        }
    }
}


struct Pull {
    id: u64,
    from: Endpoint,
    data: Vec<u8>,
}

struct DiscovererActor {
    discoverer: Discoverer,
    data_ready: DataReadyCallback,
    events: EventSink<DiscovererEvent>,
    socket: UdpSocket,
    timer: DeadlineTimer,
    pull_socket: TcpSocket,
    pull_timer: DeadlineTimer,
    pull: Option<Pull>,
    next_pull_id: u64,
    barrier: CloseBarrier,
    state: DiscovererState,
    terminating: bool,
}

impl DiscovererActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DiscovererEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
    }

    fn config(&self) -> &DiscovererConfig {
        &self.discoverer.inner.config
    }

    fn handle_event(&mut self, event: DiscovererEvent) -> bool {
        trace!("{:?} in state {:?}", event, self.state);

        match event {
            DiscovererEvent::Start => {
                if self.state == DiscovererState::Idle && !self.terminating {
                    self.do_start();
                }
            }
            DiscovererEvent::Stop => {
                self.terminating = true;
                self.do_close();
            }
            DiscovererEvent::Restart => {
                if self.state == DiscovererState::Running {
                    info!("restarting");
                    self.do_close();
                }
            }
            DiscovererEvent::TimerFired(generation) => {
                if self.timer.is_current(generation) && self.state == DiscovererState::RestartPending {
                    self.do_start();
                }
            }
            DiscovererEvent::Received(Ok((data, from))) => {
                if self.state == DiscovererState::Running {
                    trace!("{} bytes from {}", data.len(), from);
                    (self.data_ready)(&data, from);
                }
            }
            DiscovererEvent::Received(Err(e)) => {
                if self.state == DiscovererState::Running {
                    warn!("receiving announcements failed: {}", e);
                    self.do_close();
                }
            }
            DiscovererEvent::Discover(endpoint) => self.start_pull(endpoint),
            DiscovererEvent::PullConnected(id, result) => self.on_pull_connected(id, result),
            DiscovererEvent::PullRead(id, result, buf) => self.on_pull_read(id, result, buf),
            DiscovererEvent::PullTimeout(generation) => {
                if self.pull_timer.is_current(generation) {
                    if let Some(pull) = &self.pull {
                        warn!("pulling from {} timed out", pull.from);
                    }
                    self.finish_pull();
                }
            }
            DiscovererEvent::Closed => {
                if self.barrier.confirm() && self.state == DiscovererState::Closing {
                    self.on_all_closed();
                }
            }
            DiscovererEvent::Bye => {
                info!("stopped");
                self.discoverer.inner.terminated.send_replace(true);
                return false;
            }
        }
        true
    }

    fn open_udp(&mut self) -> io::Result<()> {
        let endpoint = self.config().endpoint;
        if is_multicast(&endpoint) {
            self.socket.bind(Endpoint::any(endpoint.port), true)?;
            self.socket.join_multicast_group(endpoint.address)
        }
        else {
            self.socket.bind(endpoint, true)
        }
    }

    fn do_start(&mut self) {
        self.state = DiscovererState::Running;
        match self.open_udp() {
            Ok(()) => {
                info!("listening for announcements");
                self.socket.start_receive(&self.events, DiscovererEvent::Received);
                self.discoverer.inner.status.send_replace(ControllerStatus::Started);
            }
            Err(e) => {
                warn!("listening for announcements on {} failed: {}", self.config().endpoint, e);
                if !self.terminating {
                    self.discoverer.inner.status.send_replace(ControllerStatus::StartFailed);
                }
                self.do_close();
            }
        }
    }

    fn start_pull(&mut self, endpoint: Endpoint) {
        if self.state != DiscovererState::Running {
            debug!("not running, dropping pull from {}", endpoint);
            self.discoverer.inner.pull_in_flight.store(false, Ordering::Release);
            return;
        }

        debug!("pulling description from {}", endpoint);
        let id = self.next_pull_id;
        self.next_pull_id += 1;
        self.pull = Some(Pull {
            id,
            from: endpoint,
            data: Vec::new(),
        });
        self.pull_socket.connect(endpoint, &self.events, move |result| DiscovererEvent::PullConnected(id, result));
        let timeout = self.config().pull_timeout;
        self.pull_timer.wait(timeout, &self.events, DiscovererEvent::PullTimeout);
    }

    fn is_current_pull(&self, id: u64) -> bool {
        self.pull.as_ref()
            .map(|pull| pull.id == id)
            .unwrap_or(false)
    }

    fn on_pull_connected(&mut self, id: u64, result: io::Result<TcpStream>) {
        if !self.is_current_pull(id) {
            return;
        }

        match result.and_then(|stream| self.pull_socket.attach(stream)) {
            Ok(()) => self.pull_socket.read_some(vec![0; PULL_READ_SIZE], &self.events, move |result, buf| DiscovererEvent::PullRead(id, result, buf)),
            Err(e) => {
                warn!("connecting for a pull failed: {}", e);
                self.finish_pull();
            }
        }
    }

    fn on_pull_read(&mut self, id: u64, result: io::Result<usize>, buf: Vec<u8>) {
        if !self.is_current_pull(id) {
            return;
        }
        let Some(pull) = self.pull.as_mut() else {
            return;
        };

        match result {
            Ok(0) => {
                debug!("pulled {} bytes from {}", pull.data.len(), pull.from);
                if !pull.data.is_empty() {
                    (self.data_ready)(&pull.data, pull.from);
                }
                self.finish_pull();
            }
            Ok(n) => {
                pull.data.extend_from_slice(&buf[..n]);
                if pull.data.len() > MAX_ANNOUNCE_SIZE {
                    warn!("description pulled from {} exceeds {} bytes", pull.from, MAX_ANNOUNCE_SIZE);
                    self.finish_pull();
                }
                else {
                    self.pull_socket.read_some(buf, &self.events, move |result, buf| DiscovererEvent::PullRead(id, result, buf));
                }
            }
            Err(e) => {
                warn!("pulling from {} failed: {}", pull.from, e);
                self.finish_pull();
            }
        }
    }

    /// Closes the pull's socket and timer. The closes count towards the barrier, so a stop
    ///  that happens meanwhile waits for them.
    fn finish_pull(&mut self) {
        self.pull = None;
        if self.pull_socket.close(&self.events, || DiscovererEvent::Closed) {
            self.barrier.register();
        }
        if self.pull_timer.close(&self.events, || DiscovererEvent::Closed) {
            self.barrier.register();
        }
        self.discoverer.inner.pull_in_flight.store(false, Ordering::Release);
    }

    fn do_close(&mut self) {
        if !matches!(self.state, DiscovererState::Idle | DiscovererState::Running | DiscovererState::RestartPending) {
            return;
        }
        self.state = DiscovererState::Closing;

        self.finish_pull();
        if self.socket.close(&self.events, || DiscovererEvent::Closed) {
            self.barrier.register();
        }
        if self.timer.close(&self.events, || DiscovererEvent::Closed) {
            self.barrier.register();
        }
        if self.barrier.is_idle() {
            self.on_all_closed();
        }
    }

    fn on_all_closed(&mut self) {
        if self.terminating {
            self.state = DiscovererState::Terminating;
            let _ = self.events.send(DiscovererEvent::Bye);
        }
        else {
            let delay = self.config().restart_delay;
            debug!("starting again in {:?}", delay);
            self.state = DiscovererState::RestartPending;
            self.timer.wait(delay, &self.events, DiscovererEvent::TimerFired);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::io::AsyncWriteExt;
    use crate::config::{AnnouncerConfig, DEFAULT_ANNOUNCE_GROUP};
    use crate::discovery::announcer::{Announcer, DataCallback};
    use crate::test_util::{free_udp_port, reusable_udp_socket, NOTIFICATION_TIMEOUT};
    use crate::test_util::listener::next_notification;

    fn config(endpoint: Endpoint) -> DiscovererConfig {
        let mut config = DiscovererConfig::new(endpoint);
        config.restart_delay = Duration::from_millis(100);
        config.pull_timeout = Duration::from_millis(500);
        config
    }

    fn recording_callback() -> (DataReadyCallback, mpsc::UnboundedReceiver<(Vec<u8>, Endpoint)>) {
        let (send, recv) = mpsc::unbounded_channel();
        let callback: DataReadyCallback = Arc::new(move |data: &[u8], from: Endpoint| {
            let _ = send.send((data.to_vec(), from));
        });
        (callback, recv)
    }

    async fn started(config: DiscovererConfig, callback: DataReadyCallback) -> Discoverer {
        let discoverer = Discoverer::start(config, callback).unwrap();
        tokio::time::timeout(NOTIFICATION_TIMEOUT, discoverer.wait_status(ControllerStatus::Started)).await.unwrap().unwrap();
        discoverer
    }

    #[tokio::test]
    async fn test_receives_datagrams() {
        let port = free_udp_port();
        let (callback, mut received) = recording_callback();
        let discoverer = started(config(Endpoint::localhost(port)), callback).await;

        let sender = reusable_udp_socket(Endpoint::localhost(0));
        sender.send_to(b"announcement", Endpoint::localhost(port).to_socket_addr()).await.unwrap();

        let (data, from) = next_notification(&mut received).await;
        assert_eq!(data, b"announcement");
        assert_eq!(from, Endpoint::try_from(sender.local_addr().unwrap()).unwrap());

        discoverer.stop().await.unwrap();
        assert!(discoverer.stop().await.is_err());
        assert!(!discoverer.try_discover_device(Endpoint::localhost(1)));
    }

    #[tokio::test]
    async fn test_receives_announcer() {
        let port = free_udp_port();
        let (callback, mut received) = recording_callback();
        let discoverer = started(config(Endpoint::localhost(port)), callback).await;

        let mut announcer_config = AnnouncerConfig::new(Endpoint::localhost(port), Endpoint::localhost(0));
        announcer_config.announce_period = Duration::from_millis(50);
        let description: DataCallback = Arc::new(|buf: &mut [u8]| {
            buf[..4].copy_from_slice(b"peer");
            4
        });
        let announcer = Announcer::start(announcer_config, description).unwrap();

        let (data, _) = next_notification(&mut received).await;
        assert_eq!(data, b"peer");

        let tcp_endpoint = announcer.tcp_endpoint().await.unwrap();
        assert!(discoverer.try_discover_device(tcp_endpoint));
        loop {
            let (data, from) = next_notification(&mut received).await;
            if from == tcp_endpoint {
                assert_eq!(data, b"peer");
                break;
            }
        }

        announcer.stop().await.unwrap();
        discoverer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_pull_in_flight() {
        let (callback, mut received) = recording_callback();
        let discoverer = started(config(Endpoint::localhost(free_udp_port())), callback).await;

        let responder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let responder_endpoint = Endpoint::try_from(responder.local_addr().unwrap()).unwrap();

        assert!(discoverer.try_discover_device(responder_endpoint));
        assert!(!discoverer.try_discover_device(responder_endpoint));

        let (mut stream, _) = responder.accept().await.unwrap();
        stream.write_all(b"first part, ").await.unwrap();
        stream.write_all(b"second part").await.unwrap();
        drop(stream);

        let (data, from) = next_notification(&mut received).await;
        assert_eq!(data, b"first part, second part");
        assert_eq!(from, responder_endpoint);

        tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
            while !discoverer.try_discover_device(responder_endpoint) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        discoverer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_timeout() {
        let (callback, mut received) = recording_callback();
        let discoverer = started(config(Endpoint::localhost(free_udp_port())), callback).await;

        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_endpoint = Endpoint::try_from(silent.local_addr().unwrap()).unwrap();
        assert!(discoverer.try_discover_device(silent_endpoint));
        let (_stream, _) = silent.accept().await.unwrap();

        tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
            while !discoverer.try_discover_device(silent_endpoint) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
        assert!(received.try_recv().is_err());

        discoverer.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a multicast capable network interface"]
    async fn test_multicast() {
        let port = free_udp_port();
        let (callback, mut received) = recording_callback();
        let discoverer = started(config(Endpoint::new(DEFAULT_ANNOUNCE_GROUP, port)), callback).await;

        let sender = reusable_udp_socket(Endpoint::any(0));
        sender.send_to(b"to the group", Endpoint::new(DEFAULT_ANNOUNCE_GROUP, port).to_socket_addr()).await.unwrap();

        let (data, _) = next_notification(&mut received).await;
        assert_eq!(data, b"to the group");

        discoverer.stop().await.unwrap();
    }
}
