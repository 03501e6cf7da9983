use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::channel::{Channel, ChannelListener};

/// The opened channel is handed out so a test can send on it
#[derive(Debug, Clone)]
pub enum ChannelNotification {
    Open(Channel),
    Closed(u32, String),
    PacketReceived(u32, Bytes),
    PacketSent(u32, u32),
    PacketDelivered(u32, u32),
}

/// A channel listener that records every notification, tagged with its channel id. In echo mode
///  it sends every received packet back on the same channel.
pub struct RecordingChannelListener {
    notifications: mpsc::UnboundedSender<ChannelNotification>,
    echo: bool,
}

impl RecordingChannelListener {
    pub fn new() -> (Arc<RecordingChannelListener>, mpsc::UnboundedReceiver<ChannelNotification>) {
        Self::create(false)
    }

    pub fn new_echo() -> (Arc<RecordingChannelListener>, mpsc::UnboundedReceiver<ChannelNotification>) {
        Self::create(true)
    }

    fn create(echo: bool) -> (Arc<RecordingChannelListener>, mpsc::UnboundedReceiver<ChannelNotification>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(RecordingChannelListener { notifications: send, echo }), recv)
    }

    fn record(&self, notification: ChannelNotification) {
        let _ = self.notifications.send(notification);
    }
}

impl ChannelListener for RecordingChannelListener {
    fn on_channel_open(&self, channel: &Channel) {
        self.record(ChannelNotification::Open(channel.clone()));
    }

    fn on_channel_closed(&self, channel: &Channel, reason: &str) {
        self.record(ChannelNotification::Closed(channel.channel_id(), reason.to_string()));
    }

    fn on_packet_received(&self, channel: &Channel, data: Bytes) {
        if self.echo {
            channel.send(data.clone());
        }
        self.record(ChannelNotification::PacketReceived(channel.channel_id(), data));
    }

    fn on_packet_sent(&self, channel: &Channel, packet_id: u32, _data: Bytes) {
        self.record(ChannelNotification::PacketSent(channel.channel_id(), packet_id));
    }

    fn on_packet_delivered(&self, channel: &Channel, packet_id: u32) {
        self.record(ChannelNotification::PacketDelivered(channel.channel_id(), packet_id));
    }
}
