use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use crate::channel::ChannelListener;

/// Opaque application state handed to service creators and deleters
#[derive(Clone, Default)]
pub struct ServiceContext(Option<Arc<dyn Any + Send + Sync>>);

impl ServiceContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> ServiceContext {
        ServiceContext(Some(Arc::new(value)))
    }

    pub fn none() -> ServiceContext {
        ServiceContext(None)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref()
    }
}

impl Debug for ServiceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(_) => write!(f, "ServiceContext{{..}}"),
            None => write!(f, "ServiceContext{{}}"),
        }
    }
}

pub type ServiceCreator = Box<dyn Fn(u32, &ServiceContext) -> Option<Arc<dyn ChannelListener>> + Send + Sync>;
pub type ServiceDeleter = Box<dyn Fn(Arc<dyn ChannelListener>, &ServiceContext) + Send + Sync>;

struct ServiceEntry {
    name: String,
    creator: ServiceCreator,
    deleter: ServiceDeleter,
}

/// Maps service ids to the functions that create and dispose of service instances.
///
/// Services are registered up front, before the registrar is shared; afterwards it is only read.
#[derive(Default)]
pub struct ServiceRegistrar {
    entries: FxHashMap<u32, ServiceEntry>,
}

impl Debug for ServiceRegistrar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.iter()
            .map(|(id, e)| (*id, e.name.as_str()))
            .collect();
        names.sort();
        write!(f, "ServiceRegistrar{{{:?}}}", names)
    }
}

impl ServiceRegistrar {
    pub fn new() -> ServiceRegistrar {
        ServiceRegistrar::default()
    }

    /// returns `false` without changing anything if `service_id` is already registered
    pub fn register<C, D>(&mut self, service_id: u32, name: impl Into<String>, creator: C, deleter: D) -> bool
    where
        C: Fn(u32, &ServiceContext) -> Option<Arc<dyn ChannelListener>> + Send + Sync + 'static,
        D: Fn(Arc<dyn ChannelListener>, &ServiceContext) + Send + Sync + 'static,
    {
        if self.entries.contains_key(&service_id) {
            warn!("service {} is already registered", service_id);
            return false;
        }

        let name = name.into();
        debug!("registering service {} as {:?}", service_id, name);
        self.entries.insert(service_id, ServiceEntry {
            name,
            creator: Box::new(creator),
            deleter: Box::new(deleter),
        });
        true
    }

    pub fn is_registered(&self, service_id: u32) -> bool {
        self.entries.contains_key(&service_id)
    }

    pub fn name(&self, service_id: u32) -> Option<&str> {
        self.entries.get(&service_id)
            .map(|e| e.name.as_str())
    }

    pub fn create(&self, service_id: u32, context: &ServiceContext) -> Option<Arc<dyn ChannelListener>> {
        let entry = self.entries.get(&service_id)?;
        (entry.creator)(service_id, context)
    }

    /// returns `false` if `service_id` is not registered, dropping `service` without its deleter
    pub fn delete(&self, service_id: u32, service: Arc<dyn ChannelListener>, context: &ServiceContext) -> bool {
        match self.entries.get(&service_id) {
            Some(entry) => {
                (entry.deleter)(service, context);
                true
            }
            None => false,
        }
    }

    pub fn unregister_all(&mut self) {
        self.entries.clear();
    }
}
