//! Robot event notifications.
//!
//! Two delivery paths share one [`EventBus`]:
//!
//! - per-kind listeners registered with [`EventBus::subscribe`], called
//!   synchronously on the emitting task (listeners must not block);
//! - a broadcast stream from [`EventBus::event_stream`] for presentation
//!   layers. Delivery is best-effort: a lagging receiver loses events.

use cell_common::axis::AxisId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::robot::{RobotMode, RobotState};
use crate::sequence::SequenceKind;

/// Event discriminant used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RobotEventKind {
    StateChanged,
    ModeChanged,
    MotionComplete,
    HomingComplete,
    PositionReached,
    LimitStop,
    AxisAlarm,
    EmergencyStop,
    EmergencyReleased,
    SequenceStarted,
    SequenceProgress,
    SequencePaused,
    SequenceResumed,
    SequenceError,
    SequenceComplete,
    SequenceStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum RobotEvent {
    StateChanged { from: RobotState, to: RobotState },
    ModeChanged { mode: RobotMode },
    MotionComplete { axis: AxisId, position: f64 },
    /// `axis` is `None` once every axis has been homed.
    HomingComplete { axis: Option<AxisId> },
    PositionReached { name: String },
    LimitStop { axis: AxisId, position: f64 },
    AxisAlarm { axis: AxisId, code: u16, message: String },
    EmergencyStop,
    EmergencyReleased,
    SequenceStarted { kind: SequenceKind, total_steps: usize },
    SequenceProgress { step: usize, total_steps: usize, name: String },
    SequencePaused { step: usize },
    SequenceResumed { step: usize },
    SequenceError { step: usize, message: String },
    SequenceComplete { kind: SequenceKind },
    SequenceStopped { step: usize },
}

impl RobotEvent {
    pub fn kind(&self) -> RobotEventKind {
        match self {
            Self::StateChanged { .. } => RobotEventKind::StateChanged,
            Self::ModeChanged { .. } => RobotEventKind::ModeChanged,
            Self::MotionComplete { .. } => RobotEventKind::MotionComplete,
            Self::HomingComplete { .. } => RobotEventKind::HomingComplete,
            Self::PositionReached { .. } => RobotEventKind::PositionReached,
            Self::LimitStop { .. } => RobotEventKind::LimitStop,
            Self::AxisAlarm { .. } => RobotEventKind::AxisAlarm,
            Self::EmergencyStop => RobotEventKind::EmergencyStop,
            Self::EmergencyReleased => RobotEventKind::EmergencyReleased,
            Self::SequenceStarted { .. } => RobotEventKind::SequenceStarted,
            Self::SequenceProgress { .. } => RobotEventKind::SequenceProgress,
            Self::SequencePaused { .. } => RobotEventKind::SequencePaused,
            Self::SequenceResumed { .. } => RobotEventKind::SequenceResumed,
            Self::SequenceError { .. } => RobotEventKind::SequenceError,
            Self::SequenceComplete { .. } => RobotEventKind::SequenceComplete,
            Self::SequenceStopped { .. } => RobotEventKind::SequenceStopped,
        }
    }
}

/// Event with its emission time, as carried on the stream.
#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RobotEvent,
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&RobotEvent) + Send + Sync>;

/// Listener registry plus broadcast stream.
pub struct EventBus {
    listeners: RwLock<HashMap<RobotEventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<TimedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    /// Register `listener` for one event kind.
    pub fn subscribe(
        &self,
        kind: RobotEventKind,
        listener: impl Fn(&RobotEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(entry, _)| *entry != id);
            removed |= entries.len() != before;
        }
        removed
    }

    pub fn event_stream(&self) -> broadcast::Receiver<TimedEvent> {
        self.stream.subscribe()
    }

    /// Deliver to the listeners of the event's kind, then to the stream.
    pub fn emit(&self, event: RobotEvent) {
        trace!(?event, "robot event");
        // Listeners run without the registry lock so they may subscribe.
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in targets {
            listener(&event);
        }
        // No stream receivers is fine.
        let _ = self.stream.send(TimedEvent {
            timestamp: Utc::now(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_only_see_their_kind() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(RobotEventKind::EmergencyStop, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(RobotEvent::EmergencyReleased);
        bus.emit(RobotEvent::EmergencyStop);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = bus.subscribe(RobotEventKind::EmergencyStop, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(RobotEvent::EmergencyStop);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stream_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.event_stream();
        bus.emit(RobotEvent::EmergencyStop);
        bus.emit(RobotEvent::EmergencyReleased);
        assert_eq!(rx.try_recv().unwrap().event, RobotEvent::EmergencyStop);
        assert_eq!(rx.try_recv().unwrap().event, RobotEvent::EmergencyReleased);
    }

    #[test]
    fn lagging_stream_loses_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.event_stream();
        for step in 0..5 {
            bus.emit(RobotEvent::SequencePaused { step });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(RobotEvent::PositionReached {
            name: "P001".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "PositionReached");
        assert_eq!(json["name"], "P001");
    }
}
