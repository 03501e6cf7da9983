//! Asynchronous peer-to-peer networking over TCP and UDP.
//!
//! The layers, bottom up:
//! * [net]: socket and timer primitives that post their completions as events
//! * [transport]: TCP client and server transports with reconnect and lifecycle management
//! * [proto]: the framed channel protocol, and the driver that runs it on a connection
//! * [controller]: runs the transports of a [net_config::NetConfig] with their channels, and
//!   tracks all controllers of an application
//! * [discovery]: announcing a [peer_description::PeerDescription] and discovering peers

pub mod channel;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod endpoint;
pub mod net;
pub mod net_config;
pub mod peer_description;
pub mod proto;
pub mod service_registrar;
pub mod test_util;
pub mod transport;
pub mod util;
