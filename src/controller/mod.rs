//! Controllers are the long-running top level components: the [net_controller::NetController]
//!  that runs the transports and channels of a [crate::net_config::NetConfig], and the
//!  announcer and discoverer in [crate::discovery]. A [net_core::NetCore] keeps track of all
//!  of them.

pub mod net_controller;
pub mod net_core;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControllerStatus {
    NotStarted,
    Started,
    /// the last attempt to start failed; the controller retries after its restart delay
    StartFailed,
}
