//! Tiered Compilation with Speculative Optimization
//!
//! Functions start in the interpreter, which records type feedback. Hot
//! functions are compiled to a non-speculative Baseline tier and then to an
//! Optimized tier whose code specializes on that feedback behind guards.
//! Every guard carries a frame state, so a failed speculation rebuilds the
//! interpreter frames and execution continues there.
//!
//! # Pipeline
//!
//! | Stage | Module |
//! |-------|--------|
//! | Type feedback | [`feedback`] |
//! | Tier-up decisions | [`tiering`] |
//! | LIR generation | [`compiler`] |
//! | Deopt metadata | [`frame_state`] |
//! | Fallback | [`deopt`] |
//! | Hot loops | [`osr`] |
//! | Background compiles | [`dispatcher`] |
//! | Running compiled code | [`executor`] |

pub mod compiler;
pub mod deopt;
pub mod dispatcher;
pub mod executor;
pub mod feedback;
pub mod frame_state;
pub mod osr;
pub mod tiering;

pub use compiler::{CompileRequest, CompiledUnit, CompilerOptions, Lir, SpeculativeCompiler, UnitKind};
pub use deopt::{DeoptReason, DeoptRecord, DeoptimizationEngine, ResumeAt};
pub use dispatcher::{CompileDispatcher, CompileOutcome};
pub use feedback::{FeedbackEntry, FeedbackSnapshot, FeedbackStore, TypeSet};
pub use frame_state::{FrameStateEntry, FrameStateId, FrameStateRecorder, Representation, Slot};
pub use osr::OsrController;
pub use tiering::{FunctionRecord, Tier, TierManager};
