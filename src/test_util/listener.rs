use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::mpsc;
use crate::endpoint::Endpoint;
use crate::test_util::NOTIFICATION_TIMEOUT;
use crate::transport::listener::{ClientListener, ServerListener};
use crate::transport::tcp_client_transport::TcpClientTransport;
use crate::transport::tcp_server_transport::TcpServerTransport;
use crate::transport::TransportId;

/// Waits for the next notification, panicking if none arrives within [NOTIFICATION_TIMEOUT]
pub async fn next_notification<T>(recv: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(NOTIFICATION_TIMEOUT, recv.recv()).await
        .expect("timeout waiting for notification")
        .expect("notification channel closed")
}


#[derive(Debug)]
pub enum ClientNotification {
    Connected(TransportId, Endpoint),
    Disconnected(TransportId, Option<io::ErrorKind>),
    DataReceived(TransportId, Vec<u8>),
    SendComplete(TransportId),
    ReadTimeout(TransportId),
    Terminated(TransportId),
}

pub struct RecordingClientListener {
    notifications: mpsc::UnboundedSender<ClientNotification>,
}

impl RecordingClientListener {
    pub fn new() -> (Arc<RecordingClientListener>, mpsc::UnboundedReceiver<ClientNotification>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(RecordingClientListener { notifications: send }), recv)
    }

    /// Gathers received data until `len` bytes arrived. Any other notification is a test failure.
    pub async fn receive_exactly(recv: &mut mpsc::UnboundedReceiver<ClientNotification>, len: usize) -> Vec<u8> {
        let mut result = Vec::new();
        while result.len() < len {
            match next_notification(recv).await {
                ClientNotification::DataReceived(_, data) => result.extend_from_slice(&data),
                other => panic!("expected data, got {:?}", other),
            }
        }
        result
    }

    fn record(&self, notification: ClientNotification) {
        let _ = self.notifications.send(notification);
    }
}

#[async_trait]
impl ClientListener for RecordingClientListener {
    async fn on_transport_connected(&self, transport: &TcpClientTransport, remote: Endpoint) {
        self.record(ClientNotification::Connected(transport.id(), remote));
    }

    async fn on_transport_disconnected(&self, transport: &TcpClientTransport, error: Option<io::ErrorKind>) {
        self.record(ClientNotification::Disconnected(transport.id(), error));
    }

    async fn on_transport_data_received(&self, transport: &TcpClientTransport, data: &[u8]) {
        self.record(ClientNotification::DataReceived(transport.id(), data.to_vec()));
    }

    async fn on_transport_send_complete(&self, transport: &TcpClientTransport) {
        self.record(ClientNotification::SendComplete(transport.id()));
    }

    async fn on_transport_read_timeout(&self, transport: &TcpClientTransport) {
        self.record(ClientNotification::ReadTimeout(transport.id()));
    }

    async fn on_transport_terminated(&self, transport: &TcpClientTransport) {
        self.record(ClientNotification::Terminated(transport.id()));
    }
}


#[derive(Debug)]
pub enum ServerNotification {
    Spawned(TcpClientTransport),
    Terminated,
}

/// Records server notifications. Spawned clients are started with `client_listener` if one is
///  given, and left unstarted otherwise.
pub struct RecordingServerListener {
    notifications: mpsc::UnboundedSender<ServerNotification>,
    client_listener: Option<Arc<dyn ClientListener>>,
}

impl RecordingServerListener {
    pub fn new(client_listener: Option<Arc<dyn ClientListener>>) -> (Arc<RecordingServerListener>, mpsc::UnboundedReceiver<ServerNotification>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(RecordingServerListener { notifications: send, client_listener }), recv)
    }
}

#[async_trait]
impl ServerListener for RecordingServerListener {
    async fn on_transport_spawned(&self, _server: &TcpServerTransport, client: &TcpClientTransport) {
        if let Some(listener) = &self.client_listener {
            if let Err(e) = client.start(listener.clone()) {
                panic!("starting spawned client failed: {}", e);
            }
        }
        let _ = self.notifications.send(ServerNotification::Spawned(client.clone()));
    }

    async fn on_transport_terminated(&self, _server: &TcpServerTransport) {
        let _ = self.notifications.send(ServerNotification::Terminated);
    }
}
