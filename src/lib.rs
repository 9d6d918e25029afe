//! Quicktier: tiered execution and deoptimization for a dynamic-language VM
//!
//! Functions start in a reference interpreter that records type feedback.
//! Hot functions are compiled to a non-speculative Baseline tier and then to
//! a speculative Optimized tier. Every speculation is guarded, and every
//! guard can rebuild the interpreter frames it stands for, so a failed
//! guard (a deoptimization) continues in the interpreter with exactly the
//! state the interpreter would have had. Long-running loops are moved into
//! optimized code mid-execution through on-stack replacement.
//!
//! # Quick Start
//!
//! ```
//! use quicktier::bytecode::{BinaryOp, FunctionBuilder, Instruction, Program};
//! use quicktier::{Engine, EngineConfig, Value};
//!
//! fn main() -> quicktier::Result<()> {
//!     let mut program = Program::new();
//!     let mut b = FunctionBuilder::new("mul", 2);
//!     let r = b.register();
//!     b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: r, lhs: 0, rhs: 1 });
//!     b.emit(Instruction::Return { src: r });
//!     let mul = program.add(b)?;
//!
//!     let mut engine = Engine::new(program, EngineConfig::default())?;
//!     engine.call(mul, &[Value::Smi(6), Value::Smi(7)])?;
//!     engine.optimize_on_next_call(mul);
//!     assert_eq!(engine.call(mul, &[Value::Smi(6), Value::Smi(7)])?, Value::Smi(42));
//!     assert!(engine.is_optimized(mul));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`bytecode`], [`runtime`], [`interpreter`], [`error`](Error) |
//! | **Tiering** | [`jit`] (feedback, tiering, compiler, frame state, deopt, OSR) |
//! | **Driving** | [`engine`], [`config`], [`debugger`], [`scenarios`] |
// Clippy configuration.
//
// - too_many_arguments: executor and compiler helpers pass the frame context
// - new_without_default: Program and the stores have required initialization
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod bytecode;
pub mod config;
pub mod debugger;
pub mod engine;
pub mod interpreter;
pub mod jit;
pub mod runtime;
pub mod scenarios;

mod error;

pub use config::{CompileMode, EngineConfig};
pub use debugger::{BreakEvent, DebugAction, DebugListener, RecordingListener};
pub use engine::{Engine, FunctionSnapshot, TieringStats};
pub use error::{messages, CompileFailure, Error, ErrorKind, OsrTransferFailure, Result};
pub use jit::{DeoptReason, DeoptRecord, Tier};
pub use runtime::Value;

/// Quicktier version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
