use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use crate::config::{AnnouncerConfig, DiscovererConfig, TransportConfig};
use crate::controller::net_controller::NetController;
use crate::controller::ControllerStatus;
use crate::discovery::announcer::{Announcer, DataCallback};
use crate::discovery::discoverer::{DataReadyCallback, Discoverer};
use crate::endpoint::Endpoint;
use crate::net_config::NetConfig;
use crate::service_registrar::{ServiceContext, ServiceRegistrar};

/// Identifies a controller created through a [NetCore]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TrackId(u64);

impl Display for TrackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DiscoverStartResult {
    /// no discoverer was created, or it was destroyed
    ControllerNotCreated,
    ControllerNotStartedYet,
    /// the discoverer still waits for the previous pull to finish
    ClosingPreviousDiscover,
    DiscoverStarted,
}

#[derive(Clone)]
enum Tracked {
    Controller(NetController),
    Announcer(Announcer),
    Discoverer(Discoverer),
}

impl Tracked {
    fn kind(&self) -> &'static str {
        match self {
            Tracked::Controller(_) => "net controller",
            Tracked::Announcer(_) => "announcer",
            Tracked::Discoverer(_) => "discoverer",
        }
    }

    fn status(&self) -> ControllerStatus {
        match self {
            Tracked::Controller(c) => c.status(),
            Tracked::Announcer(a) => a.status(),
            Tracked::Discoverer(d) => d.status(),
        }
    }

    fn restart(&self) {
        match self {
            Tracked::Controller(c) => c.restart(),
            Tracked::Announcer(a) => a.restart(),
            Tracked::Discoverer(d) => d.restart(),
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match self {
            Tracked::Controller(c) => c.stop().await,
            Tracked::Announcer(a) => a.stop().await,
            Tracked::Discoverer(d) => d.stop().await,
        }
    }
}

struct TrackedEntry {
    tracked: Tracked,
    destroying: bool,
}

#[derive(Default)]
struct CoreState {
    finishing: bool,
    next_id: u64,
    tracked: FxHashMap<TrackId, TrackedEntry>,
    discoverer: Option<TrackId>,
}

struct CoreShared {
    registrar: Arc<ServiceRegistrar>,
    state: Mutex<CoreState>,
    /// bumped whenever a destroyed controller was removed
    removed: watch::Sender<u64>,
}

impl CoreShared {
    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of all controllers, announcers and discoverers of an application.
///
/// Every component is tracked by a [TrackId] from creation until it was destroyed and has
///  stopped completely. Destroying happens in the background: the destroy methods resolve
///  once the components are gone, but dropping their futures does not cancel the destruction.
#[derive(Clone)]
pub struct NetCore {
    inner: Arc<CoreShared>,
}

impl NetCore {
    pub fn new(registrar: Arc<ServiceRegistrar>) -> NetCore {
        NetCore {
            inner: Arc::new(CoreShared {
                registrar,
                state: Default::default(),
                removed: watch::Sender::new(0),
            }),
        }
    }

    pub fn create_controller(&self, config: NetConfig, context: ServiceContext, transport_config: TransportConfig) -> anyhow::Result<TrackId> {
        self.check_active()?;
        let controller = NetController::start(config, self.inner.registrar.clone(), context, transport_config)?;
        Ok(self.track(Tracked::Controller(controller)))
    }

    pub fn create_announcer(&self, config: AnnouncerConfig, data_callback: DataCallback) -> anyhow::Result<TrackId> {
        self.check_active()?;
        let announcer = Announcer::start(config, data_callback)?;
        Ok(self.track(Tracked::Announcer(announcer)))
    }

    /// There is a single discoverer for [NetCore::try_discover_device]: creating another one
    ///  replaces it there, though both keep running.
    pub fn create_discoverer(&self, config: DiscovererConfig, data_ready: DataReadyCallback) -> anyhow::Result<TrackId> {
        self.check_active()?;
        let discoverer = Discoverer::start(config, data_ready)?;
        let id = self.track(Tracked::Discoverer(discoverer));
        self.inner.state().discoverer = Some(id);
        Ok(id)
    }

    fn check_active(&self) -> anyhow::Result<()> {
        if self.inner.state().finishing {
            error!("creating a controller after the net core was finished");
            bail!("net core is finished");
        }
        Ok(())
    }

    fn track(&self, tracked: Tracked) -> TrackId {
        let mut state = self.inner.state();
        state.next_id += 1;
        let id = TrackId(state.next_id);
        debug!("tracking {} as {}", tracked.kind(), id);
        state.tracked.insert(id, TrackedEntry { tracked, destroying: false });
        id
    }

    /// `None` if `id` is unknown, e.g. because the controller was destroyed
    pub fn controller_status(&self, id: TrackId) -> Option<ControllerStatus> {
        self.inner.state().tracked.get(&id)
            .map(|entry| entry.tracked.status())
    }

    /// the number of tracked components, including those that are being destroyed
    pub fn controllers_count(&self) -> usize {
        self.inner.state().tracked.len()
    }

    /// Stops the component and stops tracking it, resolving once it is gone. Destroying a
    ///  component that is already being destroyed waits for that.
    pub async fn destroy_controller(&self, id: TrackId) -> anyhow::Result<()> {
        let mut removed = self.inner.removed.subscribe();
        {
            let mut state = self.inner.state();
            if state.discoverer == Some(id) {
                state.discoverer = None;
            }
            match state.tracked.get_mut(&id) {
                Some(entry) => {
                    if !entry.destroying {
                        entry.destroying = true;
                        self.post_destroy(id, entry.tracked.clone());
                    }
                }
                None => {
                    error!("destroying unknown controller {}", id);
                    bail!("controller {} is not tracked", id);
                }
            }
        }

        while self.inner.state().tracked.contains_key(&id) {
            removed.changed().await?;
        }
        Ok(())
    }

    /// Destroys every tracked component, resolving once all of them are gone
    pub async fn destroy_all_controllers(&self) -> anyhow::Result<()> {
        let mut removed = self.inner.removed.subscribe();
        self.post_all_to_destroy();

        while !self.inner.state().tracked.is_empty() {
            removed.changed().await?;
        }
        Ok(())
    }

    /// Closes and reopens the sockets of every component that is not being destroyed, e.g.
    ///  after the OS invalidated them while the application was suspended.
    pub fn restart_all_controllers(&self) {
        let to_restart: Vec<Tracked> = self.inner.state().tracked.values()
            .filter(|entry| !entry.destroying)
            .map(|entry| entry.tracked.clone())
            .collect();
        info!("restarting {} controllers", to_restart.len());
        for tracked in to_restart {
            tracked.restart();
        }
    }

    /// Destroys all components and refuses to create new ones afterwards. Resolves once
    ///  everything is stopped.
    pub async fn finish(&self) -> anyhow::Result<()> {
        {
            let mut state = self.inner.state();
            if !state.finishing {
                info!("finishing with {} controllers", state.tracked.len());
                state.finishing = true;
            }
        }
        self.destroy_all_controllers().await?;
        info!("finished");
        Ok(())
    }

    /// Starts pulling a peer's description through the discoverer. The description arrives at
    ///  the discoverer's data ready callback.
    pub fn try_discover_device(&self, endpoint: Endpoint) -> DiscoverStartResult {
        let discoverer = {
            let state = self.inner.state();
            let Some(id) = state.discoverer else {
                return DiscoverStartResult::ControllerNotCreated;
            };
            match state.tracked.get(&id) {
                Some(TrackedEntry { tracked: Tracked::Discoverer(d), destroying: false }) => d.clone(),
                _ => return DiscoverStartResult::ControllerNotCreated,
            }
        };

        if discoverer.status() != ControllerStatus::Started {
            return DiscoverStartResult::ControllerNotStartedYet;
        }
        if discoverer.try_discover_device(endpoint) {
            DiscoverStartResult::DiscoverStarted
        }
        else {
            DiscoverStartResult::ClosingPreviousDiscover
        }
    }

    fn post_all_to_destroy(&self) {
        let mut state = self.inner.state();
        state.discoverer = None;
        for (id, entry) in state.tracked.iter_mut() {
            if !entry.destroying {
                entry.destroying = true;
                self.post_destroy(*id, entry.tracked.clone());
            }
        }
    }

    fn post_destroy(&self, id: TrackId, tracked: Tracked) {
        debug!("destroying {} {}", tracked.kind(), id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = tracked.stop().await {
                warn!("stopping {} {}: {}", tracked.kind(), id, e);
            }
            inner.state().tracked.remove(&id);
            inner.removed.send_modify(|n| *n += 1);
            debug!("{} {} destroyed", tracked.kind(), id);
        }.in_current_span());
    }
}
