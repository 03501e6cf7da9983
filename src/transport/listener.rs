use std::io;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::endpoint::Endpoint;
use crate::transport::tcp_client_transport::TcpClientTransport;
use crate::transport::tcp_server_transport::TcpServerTransport;
use crate::transport::TransportId;

/// Notifications of a client transport. They are delivered one at a time, in order, and the
///  transport does not proceed until a notification returned.
///
/// After `on_transport_disconnected` there are no data or send notifications for the
///  connection. `on_transport_terminated` is the last notification a transport delivers.
#[async_trait]
pub trait ClientListener: Send + Sync + 'static {
    async fn on_transport_connected(&self, transport: &TcpClientTransport, remote: Endpoint);

    /// `error` is `None` if the connection was closed locally (stop or reset)
    async fn on_transport_disconnected(&self, transport: &TcpClientTransport, error: Option<io::ErrorKind>);

    async fn on_transport_data_received(&self, transport: &TcpClientTransport, data: &[u8]);

    /// The transport accepts the next send from here on, including from inside this notification.
    async fn on_transport_send_complete(&self, transport: &TcpClientTransport);

    /// No data arrived for the configured read timeout. The connection stays open, it is up to
    ///  the listener to decide what to do about it.
    async fn on_transport_read_timeout(&self, transport: &TcpClientTransport);

    async fn on_transport_terminated(&self, transport: &TcpClientTransport);
}

#[async_trait]
pub trait ServerListener: Send + Sync + 'static {
    /// A new accepted transport. It is not started yet; the listener starts it. The server owns it
    ///  until it is reclaimed with [TcpServerTransport::reclaim_client].
    async fn on_transport_spawned(&self, server: &TcpServerTransport, client: &TcpClientTransport);

    async fn on_transport_terminated(&self, server: &TcpServerTransport);
}

/// The sending side of a client transport, as seen by the protocol layer on top of it
#[cfg_attr(test, automock)]
pub trait ClientTransport: Send + Sync + 'static {
    fn id(&self) -> TransportId;

    /// Hands a gather list to the transport for writing. Only one write may be in flight at a
    ///  time: a send before the previous one's completion notification is rejected, as is a send
    ///  while not connected.
    fn send(&self, buffers: Vec<Bytes>) -> anyhow::Result<()>;

    /// drops the current connection; initiators reconnect after their restart delay
    fn reset(&self);
}
