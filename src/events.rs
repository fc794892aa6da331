use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Change notification published by an IO-group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum IoEvent {
    ButtonPressed { group: String, handle: String },
    ButtonHeld { group: String, handle: String },
    InputChanged { group: String, handle: String, value: bool },
    OutputChanged { group: String, handle: String, value: bool },
    MultibitInputChanged { group: String, handle: String, value: u32 },
    MultibitOutputChanged { group: String, handle: String, value: u32 },
    PwmChanged { group: String, handle: String, value: f64 },
    CriticalError { group: String, message: String },
}

impl IoEvent {
    pub fn group(&self) -> &str {
        match self {
            IoEvent::ButtonPressed { group, .. }
            | IoEvent::ButtonHeld { group, .. }
            | IoEvent::InputChanged { group, .. }
            | IoEvent::OutputChanged { group, .. }
            | IoEvent::MultibitInputChanged { group, .. }
            | IoEvent::MultibitOutputChanged { group, .. }
            | IoEvent::PwmChanged { group, .. }
            | IoEvent::CriticalError { group, .. } => group,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            IoEvent::ButtonPressed { handle, .. }
            | IoEvent::ButtonHeld { handle, .. }
            | IoEvent::InputChanged { handle, .. }
            | IoEvent::OutputChanged { handle, .. }
            | IoEvent::MultibitInputChanged { handle, .. }
            | IoEvent::MultibitOutputChanged { handle, .. }
            | IoEvent::PwmChanged { handle, .. } => Some(handle),
            IoEvent::CriticalError { .. } => None,
        }
    }

    /// `group.handle`, or just the group for group-wide events.
    pub fn path(&self) -> String {
        match self.handle() {
            Some(handle) => format!("{}.{}", self.group(), handle),
            None => self.group().to_string(),
        }
    }
}

/// Fan-out of [`IoEvent`]s to broadcast subscribers plus a bounded
/// per-group history.
pub struct EventBus {
    event_tx: broadcast::Sender<IoEvent>,
    event_history: RwLock<FxHashMap<String, VecDeque<IoEvent>>>,
    event_history_capacity: usize,
}

pub type EventSink = Arc<EventBus>;

impl EventBus {
    pub fn new(broadcast_capacity: usize, event_history_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            event_tx,
            event_history: RwLock::new(FxHashMap::default()),
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: IoEvent) {
        if self.event_history_capacity > 0 {
            let mut map = self.event_history.write();
            let history = map.entry(event.group().to_string()).or_default();
            while history.len() >= self.event_history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IoEvent> {
        self.event_tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<IoEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Oldest-first history of `group`, limited to the newest `limit` events.
    pub fn history(&self, group: &str, limit: Option<usize>) -> Vec<IoEvent> {
        let map = self.event_history.read();
        let Some(history) = map.get(group) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn last_event(&self, group: &str) -> Option<IoEvent> {
        self.event_history
            .read()
            .get(group)
            .and_then(|history| history.back().cloned())
    }
}
