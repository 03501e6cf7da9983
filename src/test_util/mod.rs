//! This module contains utilities for testing code built on transports and channels. They are
//!  used for testing the crate itself, but they are also exported for application testing.
//!
//! The recording listeners forward every notification into an `mpsc` channel, so a test can
//!  `await` notifications in the order they were delivered.

pub mod channel;
pub mod listener;

use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};
use crate::endpoint::Endpoint;

/// Upper bound for waiting on a single notification in tests
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// a UDP port on localhost that was free a moment ago
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("no free UDP port")
}

/// a TCP port on localhost that was free a moment ago
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("no free TCP port")
}

/// A UDP socket bound with reuse-address, so it can share its port with an announcer or a
///  discoverer
pub fn reusable_udp_socket(endpoint: Endpoint) -> tokio::net::UdpSocket {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).expect("creating UDP socket");
    socket.set_reuse_address(true).expect("setting reuse-address");
    socket.set_nonblocking(true).expect("setting non-blocking");
    socket.bind(&endpoint.to_socket_addr().into()).expect("binding UDP socket");
    tokio::net::UdpSocket::from_std(socket.into()).expect("registering UDP socket")
}
