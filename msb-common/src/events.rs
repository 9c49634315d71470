//! Event types for the msb event system
//!
//! The EventBus is the only cross-task channel in the service: sources
//! publish discoveries, clients publish scrobble outcomes, and the dashboard
//! consumes everything over SSE. Subscribers receive clones, never
//! references into a component's private buffers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::play::Play;

/// Which side of the pipeline a component sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Source,
    Client,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Source => write!(f, "source"),
            ComponentKind::Client => write!(f, "client"),
        }
    }
}

/// Lifecycle status of a source or client, as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentStatus {
    NotInitialized,
    Initializing,
    Initialized,
    /// Source actively polling its upstream
    Polling,
    /// Push-style source waiting for ingress
    AwaitingData,
    Idle,
    /// Client worker draining its queue
    Running,
    Errored,
    Stopped,
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentStatus::NotInitialized => "not-initialized",
            ComponentStatus::Initializing => "initializing",
            ComponentStatus::Initialized => "initialized",
            ComponentStatus::Polling => "polling",
            ComponentStatus::AwaitingData => "awaiting-data",
            ComponentStatus::Idle => "idle",
            ComponentStatus::Running => "running",
            ComponentStatus::Errored => "errored",
            ComponentStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// msb event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
/// Delivery order within a single publisher is preserved; cross-publisher
/// ordering is not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MsbEvent {
    /// A source decided a play is new and broadcast it
    ///
    /// Every subscribing client receives its own copy and decides
    /// independently whether to queue it.
    NewPlay {
        /// Source name
        name: String,
        play: Play,
        timestamp: DateTime<Utc>,
    },

    /// A client accepted a play into its scrobble queue
    ScrobbleQueued {
        /// Client name
        name: String,
        /// Source the play came from
        source: String,
        id: Uuid,
        play: Play,
        timestamp: DateTime<Utc>,
    },

    /// A client worker picked a play off its queue
    ScrobbleDequeued {
        name: String,
        id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A client successfully scrobbled a play upstream
    Scrobbled {
        name: String,
        play: Play,
        timestamp: DateTime<Utc>,
    },

    /// A scrobble failed non-fatally and moved to the dead-letter queue
    DeadLetter {
        name: String,
        id: Uuid,
        retries: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A component moved through its lifecycle
    StatusChange {
        name: String,
        from: ComponentKind,
        old_status: ComponentStatus,
        new_status: ComponentStatus,
        timestamp: DateTime<Utc>,
    },
}

impl MsbEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            MsbEvent::NewPlay { .. } => "NewPlay",
            MsbEvent::ScrobbleQueued { .. } => "ScrobbleQueued",
            MsbEvent::ScrobbleDequeued { .. } => "ScrobbleDequeued",
            MsbEvent::Scrobbled { .. } => "Scrobbled",
            MsbEvent::DeadLetter { .. } => "DeadLetter",
            MsbEvent::StatusChange { .. } => "StatusChange",
        }
    }

    /// Name of the component that published the event
    pub fn publisher(&self) -> &str {
        match self {
            MsbEvent::NewPlay { name, .. }
            | MsbEvent::ScrobbleQueued { name, .. }
            | MsbEvent::ScrobbleDequeued { name, .. }
            | MsbEvent::Scrobbled { name, .. }
            | MsbEvent::DeadLetter { name, .. }
            | MsbEvent::StatusChange { name, .. } => name,
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MsbEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity.
    ///
    /// Events beyond capacity overwrite the oldest buffered events for
    /// subscribers that have fallen behind.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<MsbEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns `Ok(subscriber_count)`, or `Err` if no subscriber is
    /// listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: MsbEvent) -> Result<usize, broadcast::error::SendError<MsbEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring whether anyone is listening.
    ///
    /// Status and progress events are acceptable to lose when no dashboard
    /// or client is connected yet.
    pub fn emit_lossy(&self, event: MsbEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::{PlayData, PlayMeta};
    use chrono::TimeZone;

    fn sample_play() -> Play {
        Play {
            data: PlayData {
                track: "Song".to_string(),
                artists: vec!["Artist".to_string()],
                album_artists: Vec::new(),
                album: None,
                duration: None,
                play_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                listened_for: None,
            },
            meta: PlayMeta::default(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_subscribe() {
        let bus = EventBus::new(100);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_eventbus_emit_no_subscribers() {
        let bus = EventBus::new(100);
        let event = MsbEvent::NewPlay {
            name: "spotify".to_string(),
            play: sample_play(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        assert!(bus.emit(event).is_err());
    }

    #[test]
    fn test_eventbus_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = MsbEvent::Scrobbled {
            name: "listenbrainz".to_string(),
            play: sample_play(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        bus.emit(event).expect("emit should succeed");

        assert_eq!(rx1.try_recv().unwrap().event_type(), "Scrobbled");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "Scrobbled");
    }

    #[test]
    fn test_emit_lossy_on_full_channel() {
        let bus = EventBus::new(2);
        let mut _rx = bus.subscribe();

        for _ in 0..10 {
            bus.emit_lossy(MsbEvent::ScrobbleDequeued {
                name: "listenbrainz".to_string(),
                id: Uuid::new_v4(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            });
        }

        assert_eq!(bus.capacity(), 2);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = MsbEvent::StatusChange {
            name: "spotify".to_string(),
            from: ComponentKind::Source,
            old_status: ComponentStatus::Initializing,
            new_status: ComponentStatus::Polling,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"StatusChange\""));
        assert!(json.contains("\"from\":\"source\""));
        assert!(json.contains("\"new_status\":\"polling\""));

        let back: MsbEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "StatusChange");
        assert_eq!(back.publisher(), "spotify");
    }
}
