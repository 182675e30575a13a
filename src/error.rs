use std::any::Any;
use thiserror::Error;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the dispatch engine.
///
/// Most variants are wiring mistakes (adding to a closed stage, routing a
/// keyed context down the single-threaded path, sequence regressions). They
/// are never swallowed: callers are expected to treat them as fatal.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The stage queue is closed and accepts no new events
    #[error("Stage {0} is closed")]
    Closed(String),

    /// `close()` was called on a queue that was already closed
    #[error("Stage {0} is already closed")]
    AlreadyClosed(String),

    /// A context with a scheduling capability was sent down the single-threaded path
    #[error("Context for stage {0} declares a scheduling key; use add_multi_threaded")]
    NotSingleThreaded(String),

    /// A context without a scheduling capability was sent down the multi-threaded path
    #[error("Context for stage {0} has no scheduling capability; use add_single_threaded")]
    NotMultiThreaded(String),

    /// Stage manager has already been started
    #[error("Stage manager has already been started")]
    AlreadyStarted,

    /// A stage with the same name is already registered
    #[error("Stage {0} already exists")]
    DuplicateStage(String),

    /// No stage registered under this name
    #[error("No stage named {0}")]
    UnknownStage(String),

    /// `get_stage` asked for a different context type than the stage was created with
    #[error("Stage {name} handles {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// `start` was called on a stage whose workers are already running
    #[error("Stage {0} is already running")]
    StageRunning(String),

    /// Ordered sink received a sequence at or below its watermark
    #[error("Sequence {seq} is at or below the delivered watermark {current}")]
    SequenceRegression { seq: u64, current: u64 },

    /// Ordered sink received a sequence that is already buffered
    #[error("Sequence {0} is already buffered")]
    DuplicateSequence(u64),

    /// A pipeline monitor was closed twice
    #[error("Pipeline monitor is already closed")]
    MonitorClosed,

    /// Work entered a stage while a direct (inline) execution was running
    #[error("Direct execution on stage {0} overlapped with queued work")]
    DirectExecutionRace(String),

    /// Event handler failure that stopped a worker
    #[error("Stage {stage} handler failed: {source}")]
    Handler {
        stage: String,
        #[source]
        source: HandlerError,
    },

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Errors returned by event handlers and specialized events.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The runtime is tearing down. Expected during shutdown races; logged, not escalated.
    #[error("System is shutting down")]
    ShuttingDown,

    /// Handler-specific failure
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; treated like any other fatal failure
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Wrapped error from the handler's own domain
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Build a `Failed` error from any displayable message
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    /// Wrap a panic payload caught around handler code
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };
        HandlerError::Panicked(message)
    }

    /// Whether this error is the expected shutdown signal
    pub fn is_shutdown(&self) -> bool {
        matches!(self, HandlerError::ShuttingDown)
    }
}
