//! Replies and notifications sent from the reclamation context.

use patchbay_core::{Path, Value};

use crate::{error::EngineError, graph::ObjectType};

/// Identifies a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub(crate) u64);

impl EventId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Receives the outcome of a submitted event.
///
/// Every event is answered exactly once, after it has been executed or
/// with [`EngineError::Cancelled`] when the engine shuts down first.
pub trait Responder: Send + 'static {
    fn respond(&mut self, id: EventId, result: Result<(), EngineError>);
}

impl<F> Responder for F
where
    F: FnMut(EventId, Result<(), EngineError>) + Send + 'static,
{
    fn respond(&mut self, id: EventId, result: Result<(), EngineError>) {
        (self)(id, result)
    }
}

/// A [`Responder`] that ignores the reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResponder;

impl Responder for NullResponder {
    fn respond(&mut self, _id: EventId, _result: Result<(), EngineError>) {}
}

/// A change to the graph broadcast to every interested client.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ObjectCreated { path: Path, object_type: ObjectType },
    ObjectDestroyed { path: Path },
    PatchCleared { path: Path },
    Connected { src: Path, dst: Path },
    Disconnected { src: Path, dst: Path },
    PropertyChanged { path: Path, key: String, value: Value },
    /// The value of a broadcast port changed.
    PortValue { path: Path, value: f32 },
    /// An error that is not the reply to a particular event.
    Error(EngineError),
}

/// Receives [`Notification`]s.
pub trait NotificationSink: Send + 'static {
    fn notify(&mut self, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: FnMut(Notification) + Send + 'static,
{
    fn notify(&mut self, notification: Notification) {
        (self)(notification)
    }
}
