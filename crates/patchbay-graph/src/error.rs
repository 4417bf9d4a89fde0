use patchbay_core::Path;

/// An error produced while handling a command.
///
/// Errors are detected while an event is pre-processed, carried through
/// the realtime thread untouched, and reported to the responder (and
/// the notification sink) when the event is post-processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// An object already exists at the given path.
    #[error("object {0} already exists")]
    ObjectExists(Path),
    /// No object exists at the given path.
    #[error("object {0} not found")]
    ObjectNotFound(Path),
    /// The parent of the given path does not exist or can't own it.
    #[error("parent of {0} not found")]
    ParentNotFound(Path),
    /// The requested polyphony or voice is out of range.
    #[error("invalid polyphony {poly} for {path}")]
    InvalidPolyphony { path: Path, poly: i64 },
    /// A value, port type or port direction did not match what the
    /// operation requires.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// The plugin host could not instantiate the plugin.
    #[error("failed to instantiate plugin {plugin:?} for {path}")]
    InstantiationFailed { path: Path, plugin: String },
    /// The connection would introduce a cycle between nodes that run in
    /// the same execution context.
    #[error("connecting {src} to {dst} would create a cycle")]
    CycleRejected { src: Path, dst: Path },
    /// A transfer queue between execution contexts was full and data
    /// was dropped.
    #[error("transfer queue {src} -> {dst} overflowed, {dropped} samples dropped")]
    QueueOverflow { src: Path, dst: Path, dropped: u64 },
    /// The event was dropped with the engine before it completed.
    #[error("the engine shut down before the event completed")]
    Cancelled,
    /// An invariant of the engine was violated.
    #[error("internal error: {0}")]
    InternalError(String),
}
