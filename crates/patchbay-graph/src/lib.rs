//! A realtime signal-processing graph engine.
//!
//! The engine is split into three halves that each run in their own
//! context:
//!
//! * [`Engine`] runs in the control context. It pre-processes submitted
//!   commands and owns the [`graph::GraphObjectStore`].
//! * [`EngineProcessor`] runs in the realtime context. It executes the
//!   pre-processed events and runs the compiled graph once per cycle.
//! * [`PostProcessor`] runs in the reclamation context. It replies to
//!   executed events, broadcasts [`Notification`]s and frees whatever
//!   the realtime context retired.

pub mod basic_units;
mod context;
pub mod driver;
mod engine;
mod error;
mod event;
pub mod graph;
mod notify;
mod post;
mod processor;
mod rt;

pub use context::{ControlContext, RealtimeContext};
pub use engine::{AudioParams, Engine, EngineConfig};
pub use error::EngineError;
pub use event::Command;
pub use notify::{EventId, Notification, NotificationSink, NullResponder, Responder};
pub use post::PostProcessor;
pub use processor::EngineProcessor;
