//! # Error Handling
//!
//! Error taxonomy for the execution core. Every fallible runtime operation
//! returns an [`ExecutionError`], a tagged kind callers match exhaustively to
//! tell user bugs from engine bugs:
//!
//! - **User**: the user function failed in one of its lifecycle stages. The
//!   cause is preserved as the error source.
//! - **Internal**: an engine-side consistency violation ([`InternalError`]):
//!   key-encoding failure, watermark regression, malformed side-input routing,
//!   state backend failure.
//! - **Unsupported**: an explicit unsupported-operation signal
//!   ([`UnsupportedOperation`]), e.g. a processing-time timer.
//!
//! Configuration problems are rejected at construction time with a
//! [`ConfigError`] and never surface at runtime.
//!
//! None of these are retried or swallowed here. Any error raised while a
//! bundle is open discards that bundle's staged output.

use std::fmt;
use thiserror::Error;

use crate::state::StateError;
use crate::time::{Instant, TimeDomain};

/// Boxed error type returned by user functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for runtime operations of the execution core.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Lifecycle stage of a user function, recorded on user failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LifecycleStage {
    /// One-time setup before the first bundle.
    Setup,
    /// Start of a bundle.
    StartBundle,
    /// Per-element processing.
    ProcessElement,
    /// Timer callback.
    OnTimer,
    /// End of a bundle.
    FinishBundle,
    /// One-time teardown.
    Teardown,
    /// One bounded step of a splittable restriction.
    ProcessRestriction,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::StartBundle => "start_bundle",
            Self::ProcessElement => "process_element",
            Self::OnTimer => "on_timer",
            Self::FinishBundle => "finish_bundle",
            Self::Teardown => "teardown",
            Self::ProcessRestriction => "process_restriction",
        };
        f.write_str(name)
    }
}

/// Error returned by the execution core at runtime.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The user function failed.
    #[error("user function failed in {stage}: {source}")]
    User {
        /// Stage the failure happened in.
        stage: LifecycleStage,
        /// The user's error.
        #[source]
        source: BoxError,
    },
    /// The engine detected an internal consistency violation.
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),
    /// The requested operation is not supported.
    #[error("unsupported operation: {0}")]
    Unsupported(#[from] UnsupportedOperation),
}

impl ExecutionError {
    /// Wraps a user-function failure.
    pub fn user(stage: LifecycleStage, source: impl Into<BoxError>) -> Self {
        Self::User {
            stage,
            source: source.into(),
        }
    }

    /// Returns `true` if the user function caused this error.
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Returns `true` if this is an engine-side violation.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<StateError> for ExecutionError {
    fn from(err: StateError) -> Self {
        Self::Internal(InternalError::State(err))
    }
}

/// Engine-side consistency violations. These abort the current bundle.
#[derive(Error, Debug)]
pub enum InternalError {
    /// A key could not be encoded with its declared codec.
    #[error("unable to encode key {key} using {codec}: {source}")]
    KeyEncoding {
        /// Debug rendering of the offending key.
        key: String,
        /// Name of the codec.
        codec: String,
        /// Codec failure.
        #[source]
        source: CodecError,
    },
    /// An input watermark moved backwards.
    #[error("input watermark regression from {current} to {attempted}")]
    WatermarkRegression {
        /// The current input watermark.
        current: Instant,
        /// The rejected, earlier watermark.
        attempted: Instant,
    },
    /// A partition reported a low watermark beyond its high watermark.
    #[error("low watermark {low} cannot be later than high watermark {high} (source {source_id})")]
    WatermarkInverted {
        /// Reporting source.
        source_id: u32,
        /// Merged low watermark.
        low: Instant,
        /// Merged high watermark.
        high: Instant,
    },
    /// A partition's synchronized processing time did not advance.
    #[error("synchronized processing time must advance (source {source_id}: {current} -> {attempted})")]
    SynchronizedTimeStalled {
        /// Reporting source.
        source_id: u32,
        /// Stored synchronized processing time.
        current: Instant,
        /// Reported synchronized processing time.
        attempted: Instant,
    },
    /// Side-input data arrived on an ordinal with no declared view.
    #[error("side input ordinal {index} out of range ({declared} declared)")]
    UnknownSideInput {
        /// Ordinal carried by the message.
        index: usize,
        /// Number of declared views.
        declared: usize,
    },
    /// Output was sent to a tag that was never declared.
    #[error("output tag {0} is not bound to a channel")]
    UnboundOutputTag(String),
    /// A keyed facility (state, timers) was used outside a keyed invocation.
    #[error("{0} requires a current key, but the invocation is not keyed")]
    NoCurrentKey(&'static str),
    /// An element-scoped facility was used in start or finish of a bundle.
    #[error("{0} requires a current element or timer")]
    NoCurrentElement(&'static str),
    /// A spawned bundle task panicked or was cancelled.
    #[error("bundle task failed: {0}")]
    TaskFailed(String),
    /// The state backend failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Explicit unsupported-operation signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedOperation {
    /// Timers in this domain are not supported.
    #[error("timers in the {0} domain are not supported")]
    TimerDomain(TimeDomain),
    /// The clock is not available to this runner.
    #[error("reading the current {0} is not supported")]
    Clock(TimeDomain),
}

/// Construction-time configuration errors. No instance is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// More side-output tags than the static channel capacity.
    #[error("too many side outputs: {declared} declared, capacity is {capacity}")]
    TooManySideOutputs {
        /// Number of declared side-output tags.
        declared: usize,
        /// Static channel capacity.
        capacity: usize,
    },
    /// The same tag was declared twice (or a side tag equals the main tag).
    #[error("output tag {0} declared more than once")]
    DuplicateOutputTag(String),
    /// A splittable budget is unusable.
    #[error("invalid splittable budget: {0}")]
    InvalidBudget(String),
    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// Failure encoding a value with a [`Coder`](crate::codec::Coder).
#[derive(Error, Debug)]
pub enum CodecError {
    /// serde_json could not serialize the value.
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// Codec-specific failure.
    #[error("{0}")]
    Custom(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn user_errors_preserve_cause() {
        let err = ExecutionError::user(LifecycleStage::ProcessElement, Boom);
        assert!(err.is_user());
        assert!(!err.is_internal());
        assert_eq!(err.to_string(), "user function failed in process_element: boom");
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn internal_errors_convert() {
        let err: ExecutionError = InternalError::WatermarkRegression {
            current: Instant::from_millis(100),
            attempted: Instant::from_millis(90),
        }
        .into();
        assert!(err.is_internal());
        assert_eq!(
            err.to_string(),
            "internal error: input watermark regression from 100ms to 90ms"
        );
    }

    #[test]
    fn state_errors_are_internal() {
        let err: ExecutionError = StateError::LockPoisoned.into();
        assert!(matches!(err, ExecutionError::Internal(InternalError::State(_))));
    }

    #[test]
    fn unsupported_is_distinct() {
        let err: ExecutionError = UnsupportedOperation::TimerDomain(TimeDomain::ProcessingTime).into();
        assert!(!err.is_user() && !err.is_internal());
        assert_eq!(
            err.to_string(),
            "unsupported operation: timers in the processing-time domain are not supported"
        );
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::TooManySideOutputs {
            declared: 6,
            capacity: 5,
        };
        assert_eq!(err.to_string(), "too many side outputs: 6 declared, capacity is 5");
    }
}
