//! Error types for the Quicktier tiering engine
//!
//! Tiering failures are never correctness failures: compile failures are
//! retried later, OSR failures leave the loop in its current tier, and every
//! failed speculation funnels into deoptimization. Only language-level
//! exceptions and construction-time defects surface as errors.

use crate::bytecode::FunctionId;
use std::fmt;
use thiserror::Error;

/// Why a compilation request did not produce a `CompiledUnit`.
///
/// All variants are retryable; the tier manager simply tries again once the
/// function becomes hot again with fresher feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileFailure {
    /// The function has never run, so there is nothing to speculate on
    InsufficientFeedback,
    /// The feedback snapshot was taken against a different code version
    ContradictoryFeedback,
    /// The function is pinned to the interpreter
    NeverOptimize,
    /// The function is cooling down after repeated deopts
    Ineligible,
    /// A newer request replaced this one before it finished
    Superseded,
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileFailure::InsufficientFeedback => write!(f, "insufficient feedback"),
            CompileFailure::ContradictoryFeedback => write!(f, "contradictory feedback"),
            CompileFailure::NeverOptimize => write!(f, "function is marked never-optimize"),
            CompileFailure::Ineligible => write!(f, "function is ineligible for optimization"),
            CompileFailure::Superseded => write!(f, "compilation superseded"),
        }
    }
}

/// Why an on-stack replacement could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsrTransferFailure {
    /// The loop header is not an OSR entry of the compiled unit
    NoEntryForLoop,
    /// Interpreter frame layout does not match the compiled frame
    FrameLayoutMismatch { expected: usize, actual: usize },
    /// The unit was invalidated before control reached it
    Invalidated,
}

impl fmt::Display for OsrTransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsrTransferFailure::NoEntryForLoop => write!(f, "no OSR entry for loop"),
            OsrTransferFailure::FrameLayoutMismatch { expected, actual } => write!(
                f,
                "frame layout mismatch: expected {} registers, found {}",
                expected, actual
            ),
            OsrTransferFailure::Invalidated => write!(f, "OSR code was invalidated"),
        }
    }
}

/// Language-level error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - unknown binding
    ReferenceError,
    /// RangeError - value out of range
    RangeError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::ReferenceError => write!(f, "ReferenceError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
        }
    }
}

/// Main error type for Quicktier
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable compilation failure
    #[error("CompileFailure: {0}")]
    CompileFailed(CompileFailure),

    /// OSR could not transplant the running frame
    #[error("OSRTransferFailure: {0}")]
    OsrTransferFailed(OsrTransferFailure),

    /// A deopt-capable LIR instruction was emitted without a frame state.
    /// This is a compiler defect, never a runtime condition.
    #[error("FrameStateCoverageGap: {function} has no frame state at LIR {lir_index}")]
    FrameStateCoverageGap { function: FunctionId, lir_index: usize },

    /// Runtime error - TypeError, ReferenceError, etc.
    #[error("{kind}: {message}")]
    RuntimeError { kind: ErrorKind, message: String },

    /// An exception escaped the outermost frame
    #[error("Uncaught {message}")]
    Uncaught { message: String },

    /// Invalid engine configuration
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// Internal engine error
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::TypeError,
            message: message.into(),
        }
    }

    /// Create a ReferenceError
    pub fn reference_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::ReferenceError,
            message: message.into(),
        }
    }

    /// Create a RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::RangeError,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Fatal errors indicate a defect in the engine itself
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FrameStateCoverageGap { .. } | Error::InternalError(_))
    }

    /// Retryable errors are silent performance degradations
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CompileFailed(_) | Error::OsrTransferFailed(_))
    }
}

impl From<CompileFailure> for Error {
    fn from(failure: CompileFailure) -> Self {
        Error::CompileFailed(failure)
    }
}

impl From<OsrTransferFailure> for Error {
    fn from(failure: OsrTransferFailure) -> Self {
        Error::OsrTransferFailed(failure)
    }
}

/// Result type alias for Quicktier
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error message templates
pub mod messages {
    pub const NOT_A_FUNCTION: &str = "is not a function";
    pub const NOT_AN_OBJECT: &str = "is not an object";
    pub const UNKNOWN_FUNCTION: &str = "unknown function";
    pub const MAXIMUM_CALL_STACK: &str = "Maximum call stack size exceeded";

    /// Format a "X is not a function" error message
    pub fn not_a_function(what: &str) -> String {
        format!("{} {}", what, NOT_A_FUNCTION)
    }

    /// Format a "Cannot set property 'X' of Y" error message
    pub fn cannot_set_property(prop: &str, of: &str) -> String {
        format!("Cannot set property '{}' of {}", prop, of)
    }

    /// Format a "Cannot read property 'X' of Y" error message
    pub fn cannot_read_property(prop: &str, of: &str) -> String {
        format!("Cannot read property '{}' of {}", prop, of)
    }
}
