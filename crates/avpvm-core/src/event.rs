//! Event sink for runtime-originated lifecycle events.

use std::fmt;

use tokio::sync::broadcast;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 64;

/// Why a virtual machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The guest or the hardware halted on its own.
    Guest,
    /// The halt followed a stop requested by the caller.
    UserRequest,
}

/// Asynchronous lifecycle events reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    /// The virtual machine stopped.
    Stopped {
        /// Stop cause.
        reason: StopReason,
    },
    /// The virtual machine failed and can no longer be used.
    Failed {
        /// Runtime diagnostic.
        diagnostic: String,
    },
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped {
                reason: StopReason::Guest,
            } => write!(f, "guest stopped"),
            Self::Stopped {
                reason: StopReason::UserRequest,
            } => write!(f, "stopped by user request"),
            Self::Failed { diagnostic } => write!(f, "failed: {diagnostic}"),
        }
    }
}

/// Broadcast sink relaying runtime events to any number of subscribers.
///
/// Events published while nobody is subscribed are dropped. Delivery is not
/// ordered with respect to the return of `start`, so subscribe before
/// starting and re-check the controller state afterwards.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<VmEvent>,
}

impl EventSink {
    /// Creates a new event sink.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publishes an event.
    pub fn publish(&self, event: VmEvent) {
        tracing::debug!(%event, subscribers = self.sender.receiver_count(), "publishing event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
