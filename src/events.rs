//! Connection events and the notifier boundary
//!
//! Managers report every state transition and every push-notification
//! arrival through an [`EventSink`]. The receiving layer (the web gateway,
//! in the full deployment) fans events out to connected browser sessions;
//! it must not block the calling task. Events are delivered synchronously
//! in the order the underlying transitions occur.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::surface::avatar::Hotkey;

/// Which control surface produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Compositor,
    Avatar,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::Compositor => write!(f, "compositor"),
            Surface::Avatar => write!(f, "avatar"),
        }
    }
}

/// Event discriminator exposed to the fan-out layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Status,
    PushData,
}

/// Fine-grained status carried by a [`StatusUpdate`].
///
/// `AwaitingApproval` covers the avatar tool's recoverable soft states
/// (plugin permission pending, API not ready): the connection is up but
/// not usable yet, and the read loop keeps waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connected,
    Disconnected,
    AwaitingApproval,
}

/// Connection status payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub surface: Surface,
    #[serde(rename = "state")]
    pub kind: StatusKind,
    pub connected: bool,
    pub message: String,
}

impl StatusUpdate {
    pub fn new(surface: Surface, kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            surface,
            kind,
            connected: kind == StatusKind::Connected,
            message: message.into(),
        }
    }
}

/// Data pushed by a control surface outside any request/response cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushBody {
    Hotkeys(Vec<Hotkey>),
}

/// Push payload with its originating surface.
#[derive(Debug, Clone, Serialize)]
pub struct PushUpdate {
    pub surface: Surface,
    pub body: PushBody,
}

/// A single notifier event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    Status(StatusUpdate),
    Push(PushUpdate),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Status(_) => EventKind::Status,
            Event::Push(_) => EventKind::PushData,
        }
    }

    pub fn surface(&self) -> Surface {
        match self {
            Event::Status(s) => s.surface,
            Event::Push(p) => p.surface,
        }
    }
}

/// Callback boundary between the managers and the fan-out layer.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: Event);
}

/// Shared handle to an event sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that writes events to the log. Installed by the binary when no
/// web layer is attached.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: Event) {
        match &event {
            Event::Status(s) => {
                info!(surface = %s.surface, connected = s.connected, "{}", s.message)
            }
            Event::Push(p) => debug!(surface = %p.surface, "push data received"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_connected_flag() {
        let up = StatusUpdate::new(Surface::Avatar, StatusKind::Connected, "ready");
        assert!(up.connected);

        let down = StatusUpdate::new(Surface::Avatar, StatusKind::Disconnected, "gone");
        assert!(!down.connected);

        let pending =
            StatusUpdate::new(Surface::Avatar, StatusKind::AwaitingApproval, "approve");
        assert!(!pending.connected);
    }

    #[test]
    fn test_event_kind_dispatch() {
        let status = Event::Status(StatusUpdate::new(
            Surface::Compositor,
            StatusKind::Connected,
            "up",
        ));
        assert_eq!(status.kind(), EventKind::Status);
        assert_eq!(status.surface(), Surface::Compositor);

        let push = Event::Push(PushUpdate {
            surface: Surface::Avatar,
            body: PushBody::Hotkeys(vec![]),
        });
        assert_eq!(push.kind(), EventKind::PushData);
        assert_eq!(push.surface(), Surface::Avatar);
    }

    #[test]
    fn test_status_serializes_for_fanout() {
        let up = StatusUpdate::new(Surface::Compositor, StatusKind::Connected, "up");
        let json = serde_json::to_value(&up).unwrap();
        assert_eq!(json["surface"], "compositor");
        assert_eq!(json["state"], "connected");
        assert_eq!(json["connected"], true);
    }
}
