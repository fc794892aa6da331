use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::AppConfig;
use crate::error::{PiIoError, Result};
use crate::events::{EventBus, EventSink, IoEvent};
use crate::iogroup::{GroupContext, IoGroup, create_io_group};
use crate::lease::PinLeaseRegistry;
use crate::platform::Platform;

/// Owns every configured IO-group together with the lease registry and
/// event bus they share.
pub struct IoManager<P: Platform> {
    platform: Arc<P>,
    leases: Arc<PinLeaseRegistry>,
    events: EventSink,
    groups: BTreeMap<String, IoGroup<P>>,
}

impl<P: Platform> IoManager<P> {
    /// Builds all groups. A group that fails to come up is logged and left
    /// out; the others are still built.
    pub fn new(config: &AppConfig, platform: Arc<P>) -> Self {
        let leases = Arc::new(PinLeaseRegistry::new(platform.board().clone()));
        let events = Arc::new(EventBus::new(
            config.broadcast_capacity,
            config.event_history_capacity,
        ));
        let context = GroupContext {
            leases: leases.clone(),
            events: events.clone(),
        };

        let mut groups = BTreeMap::new();
        for group_config in &config.iogroups {
            if groups.contains_key(&group_config.name) {
                warn!("Duplicate io group '{}' ignored", group_config.name);
                continue;
            }
            match create_io_group(group_config, &platform, &context) {
                Ok(group) => {
                    info!("Io group '{}' ({:?}) ready", group.name(), group.kind());
                    groups.insert(group_config.name.clone(), group);
                }
                Err(e) => error!("Io group '{}' failed: {e}", group_config.name),
            }
        }

        Self {
            platform,
            leases,
            events,
            groups,
        }
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn leases(&self) -> &PinLeaseRegistry {
        &self.leases
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn groups(&self) -> impl Iterator<Item = &IoGroup<P>> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Result<&IoGroup<P>> {
        self.groups
            .get(name)
            .ok_or_else(|| PiIoError::InvalidArgument(format!("No such io group '{name}'")))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IoEvent> {
        self.events.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<IoEvent> {
        self.events.stream()
    }

    pub fn history(&self, group: &str, limit: Option<usize>) -> Result<Vec<IoEvent>> {
        self.group(group)?;
        Ok(self.events.history(group, limit))
    }
}
