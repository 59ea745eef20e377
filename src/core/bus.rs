//! In-process command/event bus.
//!
//! Commands and facts travel over an unbounded tokio channel. The dispatcher
//! spawns one task per message, so executions make progress in parallel;
//! ordering within an execution comes from the execution guard.

use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::error::EngineError;
use crate::domain::{Event, EventKind};

/// A recorded entry travelling on the bus
#[derive(Debug, Clone)]
pub enum Message {
    /// A command, already recorded in the log
    Command(Event),

    /// A fact that was appended and applied
    Event(Event),
}

impl Message {
    pub fn from_event(event: Event) -> Self {
        match event.kind {
            EventKind::Command => Self::Command(event),
            EventKind::Fact => Self::Event(event),
        }
    }

    pub fn event(&self) -> &Event {
        match self {
            Self::Command(event) | Self::Event(event) => event,
        }
    }
}

/// Receives every message published on the bus
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message);
}

/// Sending half of the bus
#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<Message>,
}

impl Bus {
    /// Create a bus and the receiver to pass to [`Bus::dispatch`]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: Message) -> Result<(), EngineError> {
        trace!(
            kind = ?message.event().kind,
            event = message.event().payload.name(),
            "Publishing"
        );
        self.tx.send(message).map_err(|_| EngineError::BusClosed)
    }

    /// Deliver messages until the handler is dropped or every sender closes
    pub fn dispatch<H: Handler>(mut rx: mpsc::UnboundedReceiver<Message>, handler: Weak<H>) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    handler.handle(message).await;
                });
            }
            debug!("Bus dispatcher stopped");
        });
    }
}
