//! The channel protocol: a stream of frames, each with a 16 byte header, multiplexing logical
//!  channels over one connection.

pub mod proto_decoder;
pub mod proto_driver;
pub mod proto_header;
