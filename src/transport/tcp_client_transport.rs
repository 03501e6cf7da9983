use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::net::close_barrier::CloseBarrier;
use crate::net::deadline_timer::DeadlineTimer;
use crate::net::tcp_socket::TcpSocket;
use crate::net::EventSink;
use crate::transport::listener::{ClientListener, ClientTransport};
use crate::transport::TransportId;

enum ClientEvent {
    Start,
    Stop,
    Reset,
    Send(Vec<Bytes>),
    ConnectDone(io::Result<TcpStream>),
    ReadDone(io::Result<usize>, Vec<u8>),
    WriteDone(io::Result<()>),
    TimerFired(u64),
    Closed,
    Terminate,
}

impl Debug for ClientEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Start => write!(f, "Start"),
            ClientEvent::Stop => write!(f, "Stop"),
            ClientEvent::Reset => write!(f, "Reset"),
            ClientEvent::Send(buffers) => write!(f, "Send({} buffers)", buffers.len()),
            ClientEvent::ConnectDone(result) => write!(f, "ConnectDone({:?})", result.as_ref().map(|_| ())),
            ClientEvent::ReadDone(result, _) => write!(f, "ReadDone({:?})", result),
            ClientEvent::WriteDone(result) => write!(f, "WriteDone({:?})", result),
            ClientEvent::TimerFired(generation) => write!(f, "TimerFired({})", generation),
            ClientEvent::Closed => write!(f, "Closed"),
            ClientEvent::Terminate => write!(f, "Terminate"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ClientState {
    Idle,
    Connecting,
    Connected,
    /// waiting for the socket and timer to confirm their close
    Closing,
    /// connection lost, waiting for the restart delay before reconnecting
    RestartPending,
    Terminating,
    Terminated,
}

struct PendingStart {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    accepted: Option<TcpStream>,
}

struct ClientShared {
    id: TransportId,
    target: Option<Endpoint>,
    config: TransportConfig,
    events: EventSink<ClientEvent>,
    pending_start: Mutex<Option<PendingStart>>,
    connected: AtomicBool,
    write_in_flight: AtomicBool,
    stop_requested: AtomicBool,
}

/// Handle to a single logical TCP connection. Cloning the handle is cheap, all clones refer to
///  the same transport.
#[derive(Clone)]
pub struct TcpClientTransport {
    inner: Arc<ClientShared>,
}

impl Debug for TcpClientTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.inner.target {
            Some(target) => write!(f, "TcpClientTransport{{{}->{}}}", self.inner.id, target),
            None => write!(f, "TcpClientTransport{{{}:accepted}}", self.inner.id),
        }
    }
}

impl TcpClientTransport {
    /// a transport that connects to `target`, and reconnects whenever the connection is lost
    pub fn new_initiator(target: Endpoint, config: TransportConfig) -> TcpClientTransport {
        TcpClientTransport::new(Some(target), None, config)
    }

    /// a transport for a connection that was accepted elsewhere; it terminates when the connection is lost
    pub fn new_accepted(stream: TcpStream, config: TransportConfig) -> TcpClientTransport {
        TcpClientTransport::new(None, Some(stream), config)
    }

    fn new(target: Option<Endpoint>, accepted: Option<TcpStream>, config: TransportConfig) -> TcpClientTransport {
        let (send, recv) = mpsc::unbounded_channel();
        TcpClientTransport {
            inner: Arc::new(ClientShared {
                id: TransportId::next(),
                target,
                config,
                events: send,
                pending_start: Mutex::new(Some(PendingStart {
                    events: recv,
                    accepted,
                })),
                connected: AtomicBool::new(false),
                write_in_flight: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
            })
        }
    }

    pub fn id(&self) -> TransportId {
        self.inner.id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.target.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn target(&self) -> Option<Endpoint> {
        self.inner.target
    }

    /// Starts the transport, which delivers all its notifications to `listener`. This can be
    ///  done only once; a stopped transport can not be restarted.
    pub fn start(&self, listener: Arc<dyn ClientListener>) -> anyhow::Result<()> {
        self.inner.config.validate()?;

        let pending = self.inner.pending_start.lock()
            .map_err(|_| anyhow!("transport state is poisoned"))?
            .take();
        let Some(pending) = pending else {
            bail!("transport {} was already started", self.id());
        };

        let actor = ClientActor {
            transport: self.clone(),
            listener,
            events: self.inner.events.clone(),
            accepted: pending.accepted,
            socket: TcpSocket::new(),
            timer: DeadlineTimer::new(),
            barrier: CloseBarrier::new(),
            state: ClientState::Idle,
            terminating: false,
            read_buf: None,
        };

        let span = span!(Level::INFO, "transport", id = %self.id());
        tokio::spawn(actor.run(pending.events).instrument(span));
        self.post(ClientEvent::Start);
        Ok(())
    }

    /// Closes the connection for good. Stopping a transport twice is a usage error.
    pub fn stop(&self) -> anyhow::Result<()> {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            error!("transport {} was stopped twice", self.id());
            bail!("transport {} is already stopped", self.id());
        }
        self.post(ClientEvent::Stop);
        Ok(())
    }

    pub fn reset(&self) {
        self.post(ClientEvent::Reset);
    }

    pub fn send(&self, buffers: Vec<Bytes>) -> anyhow::Result<()> {
        if !self.is_connected() {
            bail!("transport {} is not connected", self.id());
        }
        if self.inner.write_in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            error!("send on transport {} while a write is in flight", self.id());
            bail!("transport {} has a write in flight", self.id());
        }
        self.post(ClientEvent::Send(buffers));
        Ok(())
    }

    fn post(&self, event: ClientEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("transport {} is already terminated", self.id());
        }
    }
}

impl ClientTransport for TcpClientTransport {
    fn id(&self) -> TransportId {
        TcpClientTransport::id(self)
    }

    fn send(&self, buffers: Vec<Bytes>) -> anyhow::Result<()> {
        TcpClientTransport::send(self, buffers)
    }

    fn reset(&self) {
        TcpClientTransport::reset(self)
    }
}


/// Owns all of a transport's mutable state, processing its events one at a time
struct ClientActor {
    transport: TcpClientTransport,
    listener: Arc<dyn ClientListener>,
    events: EventSink<ClientEvent>,
    accepted: Option<TcpStream>,
    socket: TcpSocket,
    timer: DeadlineTimer,
    barrier: CloseBarrier,
    state: ClientState,
    terminating: bool,
    read_buf: Option<Vec<u8>>,
}

impl ClientActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    fn shared(&self) -> &ClientShared {
        &self.transport.inner
    }

    fn config(&self) -> &TransportConfig {
        &self.transport.inner.config
    }

    /// returns `false` after the transport terminated
    async fn handle_event(&mut self, event: ClientEvent) -> bool {
        trace!("{:?} in state {:?}", event, self.state);

        match event {
            ClientEvent::Start => self.on_start().await,
            ClientEvent::Stop => {
                self.terminating = true;
                self.cleanup(None).await;
            }
            ClientEvent::Reset => {
                if matches!(self.state, ClientState::Connecting | ClientState::Connected) {
                    self.cleanup(None).await;
                }
            }
            ClientEvent::Send(buffers) => self.on_send(buffers),
            ClientEvent::ConnectDone(result) => self.on_connect_done(result).await,
            ClientEvent::ReadDone(result, buf) => self.on_read_done(result, buf).await,
            ClientEvent::WriteDone(result) => self.on_write_done(result).await,
            ClientEvent::TimerFired(generation) => self.on_timer(generation).await,
            ClientEvent::Closed => {
                if self.barrier.confirm() {
                    self.on_all_closed();
                }
            }
            ClientEvent::Terminate => {
                self.state = ClientState::Terminated;
                self.shared().connected.store(false, Ordering::Release);
                debug!("terminated");
                self.listener.on_transport_terminated(&self.transport).await;
                return false;
            }
        }
        true
    }

    async fn on_start(&mut self) {
        if self.state != ClientState::Idle || self.terminating {
            return;
        }

        match self.accepted.take() {
            Some(stream) => {
                if let Err(e) = self.socket.attach(stream) {
                    warn!("error preparing accepted connection: {}", e);
                    self.cleanup(Some(e.kind())).await;
                    return;
                }
                self.on_connected().await;
            }
            None => self.connect(),
        }
    }

    fn connect(&mut self) {
        let Some(target) = self.transport.target() else {
            return;
        };
        debug!("connecting to {}", target);
        self.state = ClientState::Connecting;
        self.socket.connect(target, &self.events, ClientEvent::ConnectDone);
    }

    async fn on_connect_done(&mut self, result: io::Result<TcpStream>) {
        if self.state != ClientState::Connecting {
            return;
        }

        let result = result.and_then(|stream| self.socket.attach(stream));
        match result {
            Ok(()) => self.on_connected().await,
            Err(e) => {
                debug!("connecting failed: {}", e);
                self.cleanup(Some(e.kind())).await;
            }
        }
    }

    async fn on_connected(&mut self) {
        let remote = match self.socket.remote_endpoint() {
            Ok(remote) => remote,
            Err(e) => {
                warn!("connection has no remote endpoint: {}", e);
                self.cleanup(Some(e.kind())).await;
                return;
            }
        };

        self.start_read();
        self.arm_read_timeout();
        self.state = ClientState::Connected;
        self.shared().write_in_flight.store(false, Ordering::Release);
        self.shared().connected.store(true, Ordering::Release);

        info!("connected to {}", remote);
        self.listener.on_transport_connected(&self.transport, remote).await;
    }

    fn start_read(&mut self) {
        let buf = match self.read_buf.take() {
            Some(buf) => buf,
            None => vec![0; self.config().read_buffer_size],
        };
        self.socket.read_some(buf, &self.events, ClientEvent::ReadDone);
    }

    fn arm_read_timeout(&mut self) {
        let timeout = self.config().read_timeout;
        if !timeout.is_zero() {
            self.timer.wait(timeout, &self.events, ClientEvent::TimerFired);
        }
    }

    async fn on_read_done(&mut self, result: io::Result<usize>, buf: Vec<u8>) {
        if self.state != ClientState::Connected {
            self.read_buf = Some(buf);
            return;
        }

        match result {
            Ok(0) => {
                self.read_buf = Some(buf);
                debug!("connection closed by peer");
                self.cleanup(Some(io::ErrorKind::UnexpectedEof)).await;
            }
            Ok(n) => {
                trace!("received {} bytes", n);
                self.listener.on_transport_data_received(&self.transport, &buf[..n]).await;
                self.read_buf = Some(buf);
                self.arm_read_timeout();
                self.start_read();
            }
            Err(e) => {
                self.read_buf = Some(buf);
                warn!("read failed: {}", e);
                self.cleanup(Some(e.kind())).await;
            }
        }
    }

    fn on_send(&mut self, buffers: Vec<Bytes>) {
        if self.state != ClientState::Connected {
            debug!("connection lost before send, dropping {} buffers", buffers.len());
            self.shared().write_in_flight.store(false, Ordering::Release);
            return;
        }
        self.socket.write_all(buffers, &self.events, ClientEvent::WriteDone);
    }

    async fn on_write_done(&mut self, result: io::Result<()>) {
        if self.state != ClientState::Connected {
            return;
        }
        self.shared().write_in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => self.listener.on_transport_send_complete(&self.transport).await,
            Err(e) => {
                warn!("write failed: {}", e);
                self.cleanup(Some(e.kind())).await;
            }
        }
    }

    async fn on_timer(&mut self, generation: u64) {
        if !self.timer.is_current(generation) {
            trace!("ignoring stale timer event");
            return;
        }

        match self.state {
            ClientState::Connected => {
                debug!("read timeout");
                self.listener.on_transport_read_timeout(&self.transport).await;
                self.arm_read_timeout();
            }
            ClientState::RestartPending => self.connect(),
            _ => {}
        }
    }

    /// Tears down the current connection. The listener is notified of the disconnect before
    ///  anything else happens, so it sees no I/O notifications for the connection afterwards.
    async fn cleanup(&mut self, error: Option<io::ErrorKind>) {
        if matches!(self.state, ClientState::Closing | ClientState::Terminating | ClientState::Terminated) {
            return;
        }

        let was_connected = self.state == ClientState::Connected;
        self.state = ClientState::Closing;
        if was_connected {
            self.shared().connected.store(false, Ordering::Release);
            info!("disconnected: {:?}", error);
            self.listener.on_transport_disconnected(&self.transport, error).await;
        }

        if self.socket.close(&self.events, || ClientEvent::Closed) {
            self.barrier.register();
        }
        if self.timer.close(&self.events, || ClientEvent::Closed) {
            self.barrier.register();
        }
        if self.barrier.is_idle() {
            self.on_all_closed();
        }
    }

    fn on_all_closed(&mut self) {
        if self.terminating || !self.transport.is_initiator() {
            self.state = ClientState::Terminating;
            // posted rather than handled inline, so the listener is never re-entered from inside a notification
            let _ = self.events.send(ClientEvent::Terminate);
        }
        else {
            let delay = self.config().restart_delay;
            debug!("reconnecting in {:?}", delay);
            self.state = ClientState::RestartPending;
            self.timer.wait(delay, &self.events, ClientEvent::TimerFired);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use crate::test_util::listener::{next_notification, ClientNotification, RecordingClientListener};

    fn test_config() -> TransportConfig {
        let mut config = TransportConfig::new();
        config.read_timeout = Duration::ZERO;
        config.restart_delay = Duration::from_millis(200);
        config
    }

    async fn listen() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::try_from(listener.local_addr().unwrap()).unwrap();
        (listener, endpoint)
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let (server, endpoint) = listen().await;
        let (listener, mut notifications) = RecordingClientListener::new();

        let transport = TcpClientTransport::new_initiator(endpoint, test_config());
        assert!(transport.is_initiator());
        transport.start(listener).unwrap();
        let (mut peer, _) = server.accept().await.unwrap();

        match next_notification(&mut notifications).await {
            ClientNotification::Connected(id, remote) => {
                assert_eq!(id, transport.id());
                assert_eq!(remote, endpoint);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(transport.is_connected());

        transport.send(vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]).unwrap();
        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::SendComplete(_)));

        peer.write_all(b"reply").await.unwrap();
        let received = RecordingClientListener::receive_exactly(&mut notifications, 5).await;
        assert_eq!(received, b"reply");

        transport.stop().unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Disconnected(_, None)));
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Terminated(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_after_restart_delay() {
        let (server, endpoint) = listen().await;
        let (listener, mut notifications) = RecordingClientListener::new();
        let config = test_config();
        let restart_delay = config.restart_delay;

        let transport = TcpClientTransport::new_initiator(endpoint, config);
        transport.start(listener).unwrap();

        let (peer, _) = server.accept().await.unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));

        drop(peer);
        let disconnected_at = Instant::now();
        match next_notification(&mut notifications).await {
            ClientNotification::Disconnected(_, Some(_)) => {}
            other => panic!("unexpected {:?}", other),
        }

        let (_peer, _) = server.accept().await.unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));
        assert!(disconnected_at.elapsed() >= restart_delay);

        transport.stop().unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Disconnected(_, None)));
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Terminated(_)));
    }

    #[tokio::test]
    async fn test_single_write_in_flight() {
        let (server, endpoint) = listen().await;
        let (listener, mut notifications) = RecordingClientListener::new();

        let transport = TcpClientTransport::new_initiator(endpoint, test_config());
        transport.start(listener).unwrap();
        let (mut peer, _) = server.accept().await.unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));

        transport.send(vec![Bytes::from_static(b"first")]).unwrap();
        assert!(transport.send(vec![Bytes::from_static(b"second")]).is_err());

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::SendComplete(_)));

        transport.send(vec![Bytes::from_static(b"third")]).unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"third");

        transport.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stop_twice_is_an_error() {
        let (_server, endpoint) = listen().await;
        let (listener, mut notifications) = RecordingClientListener::new();

        let transport = TcpClientTransport::new_initiator(endpoint, test_config());
        transport.start(listener.clone()).unwrap();
        assert!(transport.start(listener).is_err());

        transport.stop().unwrap();
        assert!(transport.stop().is_err());
        loop {
            if let ClientNotification::Terminated(_) = next_notification(&mut notifications).await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_send_while_not_connected() {
        let transport = TcpClientTransport::new_initiator(Endpoint::localhost(1), test_config());
        assert!(transport.send(vec![Bytes::from_static(b"x")]).is_err());
    }

    #[tokio::test]
    async fn test_read_timeout_is_advisory() {
        let (server, endpoint) = listen().await;
        let (listener, mut notifications) = RecordingClientListener::new();
        let mut config = test_config();
        config.read_timeout = Duration::from_millis(100);

        let transport = TcpClientTransport::new_initiator(endpoint, config);
        transport.start(listener).unwrap();
        let (mut peer, _) = server.accept().await.unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));

        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::ReadTimeout(_)));
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::ReadTimeout(_)));
        assert!(transport.is_connected());

        peer.write_all(b"still alive").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 11 {
            match next_notification(&mut notifications).await {
                ClientNotification::DataReceived(_, data) => received.extend_from_slice(&data),
                ClientNotification::ReadTimeout(_) => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, b"still alive");

        transport.stop().unwrap();
    }

    #[tokio::test]
    async fn test_accepted_transport_terminates_on_disconnect() {
        let (server, endpoint) = listen().await;
        let peer = TcpStream::connect(endpoint.to_socket_addr()).await.unwrap();
        let (stream, _) = server.accept().await.unwrap();

        let (listener, mut notifications) = RecordingClientListener::new();
        let transport = TcpClientTransport::new_accepted(stream, test_config());
        assert!(!transport.is_initiator());
        transport.start(listener).unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));

        drop(peer);
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Disconnected(_, Some(_))));
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Terminated(_)));
    }

    #[tokio::test]
    async fn test_reset_accepted_transport_terminates() {
        let (server, endpoint) = listen().await;
        let _peer = TcpStream::connect(endpoint.to_socket_addr()).await.unwrap();
        let (stream, _) = server.accept().await.unwrap();

        let (listener, mut notifications) = RecordingClientListener::new();
        let transport = TcpClientTransport::new_accepted(stream, test_config());
        transport.start(listener).unwrap();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Connected(..)));

        transport.reset();
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Disconnected(_, None)));
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Terminated(_)));
    }

    #[tokio::test]
    async fn test_stop_while_unreachable() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (listener, mut notifications) = RecordingClientListener::new();

        let transport = TcpClientTransport::new_initiator(Endpoint::localhost(port), test_config());
        transport.start(listener).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        transport.stop().unwrap();
        // never connected, so there is no disconnect notification
        assert!(matches!(next_notification(&mut notifications).await, ClientNotification::Terminated(_)));
    }
}
