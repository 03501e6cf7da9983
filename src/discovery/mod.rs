//! Peer discovery without prior configuration.
//!
//! An [announcer::Announcer] periodically sends a serialized description of its peer to a UDP
//!  endpoint, typically a multicast group, and hands out the same description to anybody who
//!  connects to its TCP responder. A [discoverer::Discoverer] listens for the datagrams and can
//!  pull a description from a responder directly.

pub mod announcer;
pub mod discoverer;

use crate::endpoint::Endpoint;

/// the largest payload of a single UDP datagram over IPv4
pub const MAX_ANNOUNCE_SIZE: usize = 65507;

fn is_multicast(endpoint: &Endpoint) -> bool {
    endpoint.address.is_multicast()
}
