use std::fmt::{Debug, Formatter};
use std::sync::Weak;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::endpoint::Endpoint;
use crate::proto::proto_driver::ProtoDriver;

/// A service attached to one channel of a connection.
///
/// Notifications are delivered without any internal lock held, so implementations may call
///  [Channel::send] from inside them.
#[cfg_attr(test, automock)]
pub trait ChannelListener: Send + Sync + 'static {
    fn on_channel_open(&self, channel: &Channel);

    fn on_channel_closed(&self, channel: &Channel, reason: &str);

    fn on_packet_received(&self, channel: &Channel, data: Bytes);

    /// The packet was written completely, or dropped because the connection was lost. Either
    ///  way the channel has no further use for its data, which is handed back.
    fn on_packet_sent(&self, channel: &Channel, packet_id: u32, data: Bytes);

    /// the remote side acknowledged receiving the packet
    fn on_packet_delivered(&self, channel: &Channel, packet_id: u32);
}

/// A logical stream of packets over a connection, identified by its channel id
#[derive(Clone)]
pub struct Channel {
    channel_id: u32,
    remote: Endpoint,
    driver: Weak<ProtoDriver>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{{}@{}}}", self.channel_id, self.remote)
    }
}

impl Channel {
    pub(crate) fn new(channel_id: u32, remote: Endpoint, driver: Weak<ProtoDriver>) -> Channel {
        Channel { channel_id, remote, driver }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.remote
    }

    /// Queues a packet for sending, returning its packet id. Returns `None` if the channel is not
    ///  open or the packet is empty.
    pub fn send(&self, data: Bytes) -> Option<u32> {
        self.driver.upgrade()?
            .send_data(self.channel_id, data)
    }
}
