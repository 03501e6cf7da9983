use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::channel::{Channel, ChannelListener};
use crate::endpoint::Endpoint;
use crate::net_config::NetworkRole;
use crate::proto::proto_decoder::{DecodeResult, DecodeStatus, ProtoDecoder};
use crate::proto::proto_header::{FrameType, ProtoHeader};
use crate::service_registrar::{ServiceContext, ServiceRegistrar};
use crate::transport::listener::ClientTransport;
use crate::transport::TransportId;

pub const REMOTE_SERVICE_UNAVAILABLE: &str = "Remote service is unavailable";
pub const CONNECTION_LOST: &str = "Connection lost";

fn next_packet_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct ChannelSlot {
    channel_id: u32,
    confirmed: bool,
    service: Option<Arc<dyn ChannelListener>>,
}

struct OutgoingPacket {
    channel_id: u32,
    packet_id: u32,
    data: Bytes,
    sent: usize,
}

enum FrameOutcome {
    Continue,
    Invalid,
    /// a channel query for a channel without a service, to be answered once it was created
    NeedsService(u32),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Sending {
    Idle,
    Control,
    Data,
}

enum Notification {
    Open,
    Closed(&'static str),
    Received(Bytes),
    Sent(u32, Bytes),
    Delivered(u32),
}

/// collected while the state is locked, delivered after it was released
struct PendingNotification {
    service: Arc<dyn ChannelListener>,
    channel_id: u32,
    remote: Endpoint,
    notification: Notification,
}

struct DriverState {
    decoder: ProtoDecoder,
    connected: bool,
    remote: Endpoint,
    channels: Vec<ChannelSlot>,
    sending: Sending,
    cur_packet: Option<OutgoingPacket>,
    data_queue: VecDeque<OutgoingPacket>,
    control_queue: VecDeque<ProtoHeader>,
    /// (channel id, packet id) of packets that were sent completely, in the order they were sent
    pending_acks: VecDeque<(u32, u32)>,
    pending_pong: bool,
}

impl DriverState {
    fn notify(&self, channel_id: u32, notification: Notification, out: &mut Vec<PendingNotification>) {
        let service = self.channels.iter()
            .find(|slot| slot.channel_id == channel_id)
            .and_then(|slot| slot.service.clone());
        if let Some(service) = service {
            out.push(PendingNotification {
                service,
                channel_id,
                remote: self.remote,
                notification,
            });
        }
    }

    /// Puts a freshly created service into its slot. If the slot got one in the meantime, the
    ///  new service goes to `unused` to be handed back to the registrar.
    fn install_service(&mut self, channel_id: u32, service: Option<Arc<dyn ChannelListener>>, unused: &mut Vec<(u32, Arc<dyn ChannelListener>)>) {
        let Some(service) = service else {
            return;
        };
        match self.slot_mut(channel_id) {
            Some(slot) if slot.service.is_none() => slot.service = Some(service),
            _ => unused.push((channel_id, service)),
        }
    }

    fn slot_mut(&mut self, channel_id: u32) -> Option<&mut ChannelSlot> {
        self.channels.iter_mut()
            .find(|slot| slot.channel_id == channel_id)
    }

    fn queue_control(&mut self, frame_type: FrameType, channel_id: u32, packet_id: u32) {
        let mut header = ProtoHeader::default();
        ProtoDecoder::encode_control_frame(&mut header, frame_type, channel_id, packet_id);
        self.control_queue.push_back(header);
    }
}

/// The channel protocol for one connection.
///
/// Every configured service gets a channel whose id is the service id. A client asks for each
///  of its channels with CHANNEL_QUERY once connected; the server creates the service through the
///  registrar and answers CHANNEL_ALLOW, or CHANNEL_DENY if it can not. Packets are sent one
///  at a time as 1..n DATA frames, control frames go first whenever a write completes. The
///  receiver acknowledges every packet with DELIVERY_ACK.
///
/// The owner forwards its transport's notifications to the driver. It must reset the transport
///  when `on_data_received` or `on_read_timeout` return `false`.
pub struct ProtoDriver {
    me: Weak<ProtoDriver>,
    role: NetworkRole,
    registrar: Arc<ServiceRegistrar>,
    context: ServiceContext,
    transport: Arc<dyn ClientTransport>,
    state: Mutex<DriverState>,
}

impl ProtoDriver {
    pub fn new(
        role: NetworkRole,
        services: &[u32],
        registrar: Arc<ServiceRegistrar>,
        context: ServiceContext,
        transport: Arc<dyn ClientTransport>,
    ) -> Arc<ProtoDriver> {
        let channels = services.iter()
            .map(|&channel_id| ChannelSlot {
                channel_id,
                confirmed: false,
                service: None,
            })
            .collect();

        Arc::new_cyclic(|me| ProtoDriver {
            me: me.clone(),
            role,
            registrar,
            context,
            transport,
            state: Mutex::new(DriverState {
                decoder: ProtoDecoder::new(),
                connected: false,
                remote: Endpoint::any(0),
                channels,
                sending: Sending::Idle,
                cur_packet: None,
                data_queue: VecDeque::new(),
                control_queue: VecDeque::new(),
                pending_acks: VecDeque::new(),
                pending_pong: false,
            }),
        })
    }

    pub fn transport_id(&self) -> TransportId {
        self.transport.id()
    }

    pub fn is_channel_open(&self, channel_id: u32) -> bool {
        self.lock().channels.iter()
            .any(|slot| slot.channel_id == channel_id && slot.confirmed)
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        // the state stays consistent even if a thread panicked while holding the lock
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_connected(&self, remote: Endpoint) {
        let created: Vec<(u32, Option<Arc<dyn ChannelListener>>)> = if self.role == NetworkRole::Client {
            let missing: Vec<u32> = self.lock().channels.iter()
                .filter(|slot| slot.service.is_none())
                .map(|slot| slot.channel_id)
                .collect();
            missing.into_iter()
                .map(|channel_id| (channel_id, self.registrar.create(channel_id, &self.context)))
                .collect()
        }
        else {
            Vec::new()
        };

        let mut unused = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            state.connected = true;
            state.remote = remote;
            state.decoder = ProtoDecoder::new();
            state.sending = Sending::Idle;
            state.pending_pong = false;

            for (channel_id, service) in created {
                state.install_service(channel_id, service, &mut unused);
            }

            if self.role == NetworkRole::Client {
                let mut queries = Vec::new();
                for slot in &state.channels {
                    match slot.service {
                        Some(_) => queries.push(slot.channel_id),
                        None => warn!("no service for channel {}", slot.channel_id),
                    }
                }
                for channel_id in queries {
                    state.queue_control(FrameType::ChannelQuery, channel_id, 0);
                }
            }
            self.send_next(state);
        }
        self.delete_services(unused);
    }

    /// Closes all open channels. Packets that were queued or in flight are reported as sent.
    pub fn on_disconnected(&self) {
        let mut notifications = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.connected = false;

            let closed: Vec<u32> = state.channels.iter_mut()
                .filter(|slot| slot.confirmed)
                .map(|slot| {
                    slot.confirmed = false;
                    slot.channel_id
                })
                .collect();
            for channel_id in closed {
                state.notify(channel_id, Notification::Closed(CONNECTION_LOST), &mut notifications);
            }

            let unsent: Vec<OutgoingPacket> = state.cur_packet.take().into_iter()
                .chain(state.data_queue.drain(..))
                .collect();
            for packet in unsent {
                state.notify(packet.channel_id, Notification::Sent(packet.packet_id, packet.data), &mut notifications);
            }

            state.control_queue.clear();
            state.pending_acks.clear();
            state.sending = Sending::Idle;
            state.pending_pong = false;
        }
        self.dispatch(notifications);
    }

    /// Returns `false` if the data violates the protocol.
    ///
    /// Decoding stops at a channel query that needs a new service. The state is unlocked while
    ///  the registrar creates it, and decoding continues with the query's answer afterwards.
    pub fn on_data_received(&self, data: &[u8]) -> bool {
        let mut notifications = Vec::new();
        let mut unused = Vec::new();
        let mut pos = 0;
        let mut created: Option<(u32, Option<Arc<dyn ChannelListener>>)> = None;
        self.lock().pending_pong = false;

        let is_valid = loop {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some((channel_id, service)) = created.take() {
                state.install_service(channel_id, service, &mut unused);
                self.answer_channel_query(state, channel_id, &mut notifications);
            }

            let outcome = loop {
                if pos >= data.len() {
                    break FrameOutcome::Continue;
                }
                let mut result = DecodeResult::default();
                let status = state.decoder.decode(&data[pos..], &mut result);
                pos += result.decoded_size;

                match status {
                    DecodeStatus::Ok => match self.on_frame(state, result, &mut notifications) {
                        FrameOutcome::Continue => {}
                        other => break other,
                    },
                    DecodeStatus::Incomplete => {}
                    DecodeStatus::Invalid => break FrameOutcome::Invalid,
                }
            };

            match outcome {
                FrameOutcome::NeedsService(channel_id) => {
                    drop(guard);
                    created = Some((channel_id, self.registrar.create(channel_id, &self.context)));
                }
                FrameOutcome::Continue => {
                    self.send_next(state);
                    break true;
                }
                FrameOutcome::Invalid => {
                    self.send_next(state);
                    break false;
                }
            }
        };
        self.delete_services(unused);
        self.dispatch(notifications);
        is_valid
    }

    fn answer_channel_query(&self, state: &mut DriverState, channel_id: u32, notifications: &mut Vec<PendingNotification>) {
        let allowed = match state.slot_mut(channel_id) {
            Some(slot) => {
                slot.confirmed = slot.service.is_some();
                slot.confirmed
            }
            None => false,
        };
        if allowed {
            debug!("channel {} allowed", channel_id);
            state.queue_control(FrameType::ChannelAllow, channel_id, 0);
            state.notify(channel_id, Notification::Open, notifications);
        }
        else {
            debug!("channel {} denied", channel_id);
            state.queue_control(FrameType::ChannelDeny, channel_id, 0);
        }
    }

    fn delete_services(&self, services: Vec<(u32, Arc<dyn ChannelListener>)>) {
        for (channel_id, service) in services {
            self.registrar.delete(channel_id, service, &self.context);
        }
    }

    fn on_frame(&self, state: &mut DriverState, result: DecodeResult, notifications: &mut Vec<PendingNotification>) -> FrameOutcome {
        let channel_id = result.channel_id;

        match result.frame_type {
            Some(FrameType::Data) => {
                match state.slot_mut(channel_id) {
                    Some(slot) if slot.confirmed => {}
                    _ => {
                        warn!("data for channel {} which is not open", channel_id);
                        return FrameOutcome::Invalid;
                    }
                }
                state.notify(channel_id, Notification::Received(result.data), notifications);
                state.queue_control(FrameType::DeliveryAck, channel_id, result.packet_id);
            }
            Some(FrameType::ChannelQuery) => {
                if self.role != NetworkRole::Server {
                    warn!("channel query received by a client");
                    return FrameOutcome::Invalid;
                }
                if let Some(slot) = state.slot_mut(channel_id) {
                    if slot.service.is_none() {
                        return FrameOutcome::NeedsService(channel_id);
                    }
                }
                self.answer_channel_query(state, channel_id, notifications);
            }
            Some(FrameType::ChannelAllow) => {
                match state.slot_mut(channel_id) {
                    Some(slot) if slot.service.is_some() => slot.confirmed = true,
                    _ => {
                        warn!("channel allow for unknown channel {}", channel_id);
                        return FrameOutcome::Invalid;
                    }
                }
                state.notify(channel_id, Notification::Open, notifications);
            }
            Some(FrameType::ChannelDeny) => {
                if let Some(slot) = state.slot_mut(channel_id) {
                    slot.confirmed = false;
                }
                state.notify(channel_id, Notification::Closed(REMOTE_SERVICE_UNAVAILABLE), notifications);
            }
            Some(FrameType::Ping) => state.queue_control(FrameType::Pong, 0, 0),
            Some(FrameType::Pong) => {}
            Some(FrameType::DeliveryAck) => {
                match state.pending_acks.pop_front() {
                    Some((ch, packet_id)) if ch == channel_id && packet_id == result.packet_id => {
                        state.notify(channel_id, Notification::Delivered(packet_id), notifications);
                    }
                    other => {
                        warn!("unexpected delivery ack for {}/{}, expected {:?}", channel_id, result.packet_id, other);
                        return FrameOutcome::Invalid;
                    }
                }
            }
            None => return FrameOutcome::Invalid,
        }
        FrameOutcome::Continue
    }

    pub fn on_send_complete(&self) {
        let mut notifications = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.sending == Sending::Data {
                let is_complete = state.cur_packet.as_ref()
                    .map(|p| p.sent == p.data.len())
                    .unwrap_or(false);
                if is_complete {
                    if let Some(packet) = state.cur_packet.take() {
                        trace!("packet {} on channel {} sent", packet.packet_id, packet.channel_id);
                        state.notify(packet.channel_id, Notification::Sent(packet.packet_id, packet.data), &mut notifications);
                    }
                }
            }
            state.sending = Sending::Idle;
            self.send_next(state);
        }
        self.dispatch(notifications);
    }

    /// Sends a ping. Returns `false` if the previous ping was not answered by any data.
    pub fn on_read_timeout(&self) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.pending_pong {
            warn!("no response to ping from {}", state.remote);
            return false;
        }
        state.pending_pong = true;
        state.queue_control(FrameType::Ping, 0, 0);
        self.send_next(state);
        true
    }

    /// Hands all services back to the registrar. They are created anew on the next connection.
    pub fn release_services(&self) {
        let services: Vec<(u32, Arc<dyn ChannelListener>)> = self.lock().channels.iter_mut()
            .filter_map(|slot| {
                slot.confirmed = false;
                slot.service.take().map(|service| (slot.channel_id, service))
            })
            .collect();
        self.delete_services(services);
    }

    pub(crate) fn send_data(&self, channel_id: u32, data: Bytes) -> Option<u32> {
        if data.is_empty() || data.len() > u32::MAX as usize {
            warn!("can not send a packet of {} bytes", data.len());
            return None;
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.slot_mut(channel_id).map(|slot| slot.confirmed).unwrap_or(false) {
            debug!("channel {} is not open", channel_id);
            return None;
        }

        let packet_id = next_packet_id();
        state.data_queue.push_back(OutgoingPacket {
            channel_id,
            packet_id,
            data,
            sent: 0,
        });
        self.send_next(state);
        Some(packet_id)
    }

    fn send_next(&self, state: &mut DriverState) {
        if state.sending != Sending::Idle || !state.connected {
            return;
        }

        if let Some(header) = state.control_queue.front() {
            trace!("sending control frame {:?}", header);
            if self.try_send(vec![header.to_bytes()]) {
                state.control_queue.pop_front();
                state.sending = Sending::Control;
            }
            return;
        }

        if state.cur_packet.is_none() {
            state.cur_packet = state.data_queue.pop_front();
        }
        let Some(packet) = &mut state.cur_packet else {
            return;
        };

        let mut header = ProtoHeader::default();
        let chunk = ProtoDecoder::encode_data_frame(&mut header, packet.channel_id, packet.packet_id, packet.data.len(), packet.sent);
        let payload = packet.data.slice(packet.sent..packet.sent + chunk);
        if self.try_send(vec![header.to_bytes(), payload]) {
            packet.sent += chunk;
            state.sending = Sending::Data;
            if packet.sent == packet.data.len() {
                // the ack can only arrive after the last frame was handed over
                state.pending_acks.push_back((packet.channel_id, packet.packet_id));
            }
        }
    }

    fn try_send(&self, buffers: Vec<Bytes>) -> bool {
        match self.transport.send(buffers) {
            Ok(()) => true,
            Err(e) => {
                debug!("transport rejected frame: {}", e);
                false
            }
        }
    }

    fn dispatch(&self, notifications: Vec<PendingNotification>) {
        for n in notifications {
            let channel = Channel::new(n.channel_id, n.remote, self.me.clone());
            match n.notification {
                Notification::Open => n.service.on_channel_open(&channel),
                Notification::Closed(reason) => n.service.on_channel_closed(&channel, reason),
                Notification::Received(data) => n.service.on_packet_received(&channel, data),
                Notification::Sent(packet_id, data) => n.service.on_packet_sent(&channel, packet_id, data),
                Notification::Delivered(packet_id) => n.service.on_packet_delivered(&channel, packet_id),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use bytes::BufMut;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::channel::MockChannelListener;
    use crate::proto::proto_header::PROTO_MAX_FRAME_DATA_SIZE;
    use crate::transport::listener::MockClientTransport;

    const CHANNEL: u32 = 42;
    const REMOTE: Endpoint = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 9999);

    type Written = Arc<Mutex<Vec<Vec<u8>>>>;

    fn mock_transport(written: &Written) -> Arc<dyn ClientTransport> {
        let written = written.clone();
        let mut transport = MockClientTransport::new();
        transport.expect_send()
            .returning(move |buffers| {
                written.lock().unwrap().push(buffers.concat());
                Ok(())
            });
        transport.expect_id()
            .returning(TransportId::next);
        Arc::new(transport)
    }

    fn registrar_for(service: Arc<MockChannelListener>) -> Arc<ServiceRegistrar> {
        let service: Arc<dyn ChannelListener> = service;
        let mut registrar = ServiceRegistrar::new();
        registrar.register(CHANNEL, "test", move |_, _| Some(service.clone()), |_, _| {});
        Arc::new(registrar)
    }

    fn frame(frame_type: FrameType, channel_id: u32, packet_id: u32) -> Vec<u8> {
        let mut header = ProtoHeader::default();
        ProtoDecoder::encode_control_frame(&mut header, frame_type, channel_id, packet_id);
        header.to_bytes().to_vec()
    }

    fn data_frames(channel_id: u32, packet_id: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut sent = 0;
        while sent < data.len() {
            let mut header = ProtoHeader::default();
            let chunk = ProtoDecoder::encode_data_frame(&mut header, channel_id, packet_id, data.len(), sent);
            header.ser(&mut out);
            out.put_slice(&data[sent..sent+chunk]);
            sent += chunk;
        }
        out
    }

    fn decode_header(written: &[u8]) -> ProtoHeader {
        ProtoHeader::deser(&mut &written[..]).unwrap()
    }

    #[test]
    fn test_client_opens_channel_and_sends() {
        let mut service = MockChannelListener::new();
        service.expect_on_channel_open()
            .withf(|channel| channel.channel_id() == CHANNEL && channel.remote_endpoint() == REMOTE)
            .times(1)
            .return_const(());
        service.expect_on_packet_sent()
            .withf(|_, _, data| &data[..] == b"abc")
            .times(1)
            .return_const(());
        service.expect_on_packet_delivered()
            .times(1)
            .return_const(());

        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Client, &[CHANNEL], registrar_for(Arc::new(service)), ServiceContext::none(), mock_transport(&written));

        driver.on_connected(REMOTE);
        {
            let written = written.lock().unwrap();
            assert_eq!(written.len(), 1);
            assert_eq!(decode_header(&written[0]).typ(), Some(FrameType::ChannelQuery));
            assert_eq!(decode_header(&written[0]).channel_id, CHANNEL);
        }
        assert!(!driver.is_channel_open(CHANNEL));

        driver.on_send_complete();
        assert!(driver.on_data_received(&frame(FrameType::ChannelAllow, CHANNEL, 0)));
        assert!(driver.is_channel_open(CHANNEL));

        let channel = Channel::new(CHANNEL, REMOTE, Arc::downgrade(&driver));
        let packet_id = channel.send(Bytes::from_static(b"abc")).unwrap();
        {
            let written = written.lock().unwrap();
            assert_eq!(written.len(), 2);
            assert_eq!(written[1], data_frames(CHANNEL, packet_id, b"abc"));
        }

        driver.on_send_complete();
        assert!(driver.on_data_received(&frame(FrameType::DeliveryAck, CHANNEL, packet_id)));
    }

    #[test]
    fn test_client_channel_denied() {
        let mut service = MockChannelListener::new();
        service.expect_on_channel_closed()
            .withf(|_, reason| reason == REMOTE_SERVICE_UNAVAILABLE)
            .times(1)
            .return_const(());

        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Client, &[CHANNEL], registrar_for(Arc::new(service)), ServiceContext::none(), mock_transport(&written));

        driver.on_connected(REMOTE);
        driver.on_send_complete();
        assert!(driver.on_data_received(&frame(FrameType::ChannelDeny, CHANNEL, 0)));
        assert!(!driver.is_channel_open(CHANNEL));
        assert!(Channel::new(CHANNEL, REMOTE, Arc::downgrade(&driver)).send(Bytes::from_static(b"x")).is_none());
    }

    #[test]
    fn test_server_answers_queries() {
        let mut service = MockChannelListener::new();
        service.expect_on_channel_open()
            .times(1)
            .return_const(());
        service.expect_on_packet_received()
            .with(mockall::predicate::always(), eq(Bytes::from_static(b"payload")))
            .times(1)
            .return_const(());

        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Server, &[CHANNEL], registrar_for(Arc::new(service)), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);
        assert!(written.lock().unwrap().is_empty());

        let mut input = frame(FrameType::ChannelQuery, CHANNEL, 0);
        input.extend_from_slice(&frame(FrameType::ChannelQuery, CHANNEL + 1, 0));
        input.extend_from_slice(&data_frames(CHANNEL, 77, b"payload"));
        assert!(driver.on_data_received(&input));

        // one write at a time: the answers follow as earlier writes complete
        driver.on_send_complete();
        driver.on_send_complete();
        let written = written.lock().unwrap();
        assert_eq!(written.len(), 3);
        let answers: Vec<_> = written.iter()
            .map(|w| { let h = decode_header(w); (h.typ().unwrap(), h.channel_id, h.packet_id) })
            .collect();
        assert_eq!(answers, vec![
            (FrameType::ChannelAllow, CHANNEL, 0),
            (FrameType::ChannelDeny, CHANNEL + 1, 0),
            (FrameType::DeliveryAck, CHANNEL, 77),
        ]);
    }

    #[test]
    fn test_large_packet_is_split_into_frames() {
        let mut service = MockChannelListener::new();
        service.expect_on_channel_open().return_const(());
        service.expect_on_packet_sent()
            .times(1)
            .return_const(());

        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Server, &[CHANNEL], registrar_for(Arc::new(service)), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);
        assert!(driver.on_data_received(&frame(FrameType::ChannelQuery, CHANNEL, 0)));
        driver.on_send_complete();

        let data: Vec<u8> = (0..2*PROTO_MAX_FRAME_DATA_SIZE + 10).map(|i| i as u8).collect();
        let packet_id = Channel::new(CHANNEL, REMOTE, Arc::downgrade(&driver)).send(Bytes::from(data.clone())).unwrap();
        driver.on_send_complete();
        driver.on_send_complete();
        driver.on_send_complete();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 4);
        assert_eq!(written[1..].concat(), data_frames(CHANNEL, packet_id, &data));
    }

    #[test]
    fn test_ping_on_read_timeout() {
        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Client, &[], Arc::new(ServiceRegistrar::new()), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);

        assert!(driver.on_read_timeout());
        assert_eq!(decode_header(&written.lock().unwrap()[0]).typ(), Some(FrameType::Ping));
        driver.on_send_complete();

        // a second timeout without any data in between
        assert!(!driver.on_read_timeout());

        assert!(driver.on_data_received(&frame(FrameType::Pong, 0, 0)));
        assert!(driver.on_read_timeout());
    }

    #[test]
    fn test_answers_ping() {
        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Server, &[], Arc::new(ServiceRegistrar::new()), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);

        assert!(driver.on_data_received(&frame(FrameType::Ping, 0, 0)));
        assert_eq!(decode_header(&written.lock().unwrap()[0]).typ(), Some(FrameType::Pong));
    }

    #[rstest]
    #[case::invalid_header(vec![0xff; 16])]
    #[case::data_on_closed_channel(data_frames(CHANNEL, 1, b"not open"))]
    #[case::unexpected_ack(frame(FrameType::DeliveryAck, CHANNEL, 1))]
    #[case::query_to_client(frame(FrameType::ChannelQuery, CHANNEL, 0))]
    #[case::allow_for_unknown_channel(frame(FrameType::ChannelAllow, CHANNEL + 1, 0))]
    fn test_protocol_violations(#[case] input: Vec<u8>) {
        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Client, &[CHANNEL], Arc::new(ServiceRegistrar::new()), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);

        assert!(!driver.on_data_received(&input));
    }

    #[test]
    fn test_disconnect_releases_queued_packets() {
        let mut service = MockChannelListener::new();
        service.expect_on_channel_open().return_const(());
        service.expect_on_packet_sent()
            .times(2)
            .return_const(());
        service.expect_on_channel_closed()
            .withf(|_, reason| reason == CONNECTION_LOST)
            .times(1)
            .return_const(());

        let written = Written::default();
        let driver = ProtoDriver::new(NetworkRole::Server, &[CHANNEL], registrar_for(Arc::new(service)), ServiceContext::none(), mock_transport(&written));
        driver.on_connected(REMOTE);
        assert!(driver.on_data_received(&frame(FrameType::ChannelQuery, CHANNEL, 0)));

        let channel = Channel::new(CHANNEL, REMOTE, Arc::downgrade(&driver));
        channel.send(Bytes::from_static(b"one")).unwrap();
        channel.send(Bytes::from_static(b"two")).unwrap();

        driver.on_disconnected();
        assert!(!driver.is_channel_open(CHANNEL));
        assert!(channel.send(Bytes::from_static(b"three")).is_none());
    }

    /// registers a service whose creator records whether the driver's state was unlocked
    fn lock_checking_registrar(driver: Arc<std::sync::OnceLock<Weak<ProtoDriver>>>, unlocked: Arc<Mutex<Vec<bool>>>) -> Arc<ServiceRegistrar> {
        let mut registrar = ServiceRegistrar::new();
        registrar.register(CHANNEL, "test", move |_, _| {
            let driver = driver.get().and_then(|d| d.upgrade()).unwrap();
            unlocked.lock().unwrap().push(driver.state.try_lock().is_ok());

            let mut service = MockChannelListener::new();
            service.expect_on_channel_open().return_const(());
            let service: Arc<dyn ChannelListener> = Arc::new(service);
            Some(service)
        }, |_, _| {});
        Arc::new(registrar)
    }

    #[rstest]
    #[case::client(NetworkRole::Client)]
    #[case::server(NetworkRole::Server)]
    fn test_services_are_created_without_the_lock(#[case] role: NetworkRole) {
        let driver_cell = Arc::new(std::sync::OnceLock::new());
        let unlocked = Arc::new(Mutex::new(Vec::new()));
        let written = Written::default();
        let driver = ProtoDriver::new(role, &[CHANNEL], lock_checking_registrar(driver_cell.clone(), unlocked.clone()), ServiceContext::none(), mock_transport(&written));
        driver_cell.set(Arc::downgrade(&driver)).unwrap();

        driver.on_connected(REMOTE);
        if role == NetworkRole::Server {
            let mut input = frame(FrameType::ChannelQuery, CHANNEL, 0);
            input.extend_from_slice(&frame(FrameType::Ping, 0, 0));
            assert!(driver.on_data_received(&input));

            driver.on_send_complete();
            let written = written.lock().unwrap();
            assert_eq!(decode_header(&written[0]).typ(), Some(FrameType::ChannelAllow));
            assert_eq!(decode_header(&written[1]).typ(), Some(FrameType::Pong));
            assert!(driver.is_channel_open(CHANNEL));
        }
        else {
            assert_eq!(decode_header(&written.lock().unwrap()[0]).typ(), Some(FrameType::ChannelQuery));
        }
        assert_eq!(*unlocked.lock().unwrap(), vec![true]);
    }
}
