use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::task::JoinHandle;
use tracing::debug;
use crate::endpoint::Endpoint;
use crate::net::{post, spawn_close, EventSink};

const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Default)]
pub struct UdpSocket {
    socket: Option<Arc<tokio::net::UdpSocket>>,
    send_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

impl UdpSocket {
    pub fn new() -> UdpSocket {
        UdpSocket::default()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// With `reuse_address`, several sockets (in this process or others) can bind the same port,
    ///  which is what lets peers on one host share a well-known announce port.
    pub fn bind(&mut self, endpoint: Endpoint, reuse_address: bool) -> io::Result<()> {
        debug_assert!(self.socket.is_none(), "socket is already bound");

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&endpoint.to_socket_addr().into())?;

        let socket = tokio::net::UdpSocket::from_std(socket.into())?;
        debug!("UDP socket bound to {:?}", socket.local_addr());
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match &self.socket {
            Some(socket) => Endpoint::try_from(socket.local_addr()?),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn join_multicast_group(&self, group: Ipv4Addr) -> io::Result<()> {
        match &self.socket {
            Some(socket) => {
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                socket.set_multicast_loop_v4(true)
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn send_to<E: Send + 'static>(&mut self, data: Bytes, target: Endpoint, sink: &EventSink<E>, on_done: impl FnOnce(io::Result<usize>) -> E + Send + 'static) {
        debug_assert!(self.send_task.as_ref().map(|t| t.is_finished()).unwrap_or(true), "send already in flight");

        let Some(socket) = self.socket.clone() else {
            post(sink, on_done(Err(io::ErrorKind::NotConnected.into())));
            return;
        };

        let sink = sink.clone();
        self.send_task = Some(tokio::spawn(async move {
            let result = socket.send_to(&data, target.to_socket_addr()).await;
            post(&sink, on_done(result));
        }));
    }

    /// Posts every received datagram. The first receive error is posted as well and ends the
    ///  receive loop.
    pub fn start_receive<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_receive: impl Fn(io::Result<(Bytes, Endpoint)>) -> E + Send + 'static) {
        let Some(socket) = self.socket.clone() else {
            post(sink, on_receive(Err(io::ErrorKind::NotConnected.into())));
            return;
        };

        let sink = sink.clone();
        self.receive_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let result = match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => Endpoint::try_from(from)
                        .map(|from| (Bytes::copy_from_slice(&buf[..len]), from)),
                    Err(e) => Err(e),
                };
                let failed = result.is_err();
                if sink.send(on_receive(result)).is_err() || failed {
                    break;
                }
            }
        }));
    }

    /// Returns `false` if the socket was not bound; no close event is posted then.
    pub fn close<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_closed: impl FnOnce() -> E + Send + 'static) -> bool {
        let Some(socket) = self.socket.take() else {
            return false;
        };
        let tasks = [self.send_task.take(), self.receive_task.take()]
            .into_iter()
            .flatten()
            .collect();
        spawn_close(tasks, socket, sink.clone(), on_closed);
        true
    }
}
