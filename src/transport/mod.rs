//! Managed TCP connections with their own lifecycle, independent of the raw socket.
//!
//! A [tcp_client_transport::TcpClientTransport] is either an *initiator* that connects to an
//!  endpoint and reconnects after a delay whenever the connection is lost, or an *accepted*
//!  transport wrapping a connection a [tcp_server_transport::TcpServerTransport] accepted. An
//!  accepted transport terminates when its connection is lost, and its server keeps it until
//!  the owner reclaims it.

pub mod listener;
pub mod tcp_client_transport;
pub mod tcp_server_transport;

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide unique identity of a client transport
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransportId(u64);

impl TransportId {
    pub(crate) fn next() -> TransportId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TransportId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for TransportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl Display for TransportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}
