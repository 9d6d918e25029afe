//! Engine configuration
//!
//! Thresholds, cooldowns and concurrent-compilation knobs. Configuration is
//! plain JSON (camelCase keys); every field is optional and falls back to
//! its default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How compile requests are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompileMode {
    /// Compile on the calling thread and activate immediately
    Synchronous,
    /// Compile on background workers; activate at the next safe point
    Concurrent,
}

impl std::str::FromStr for CompileMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synchronous" | "sync" => Ok(CompileMode::Synchronous),
            "concurrent" => Ok(CompileMode::Concurrent),
            other => Err(Error::ConfigError(format!("unknown compile mode '{}'", other))),
        }
    }
}

/// Tiering engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Invocations before an interpreted function is compiled to Baseline
    pub invocation_threshold: u64,
    /// Invocations before a function is compiled to Optimized
    pub optimize_threshold: u64,
    /// Back-edges of one loop before OSR is attempted
    pub osr_threshold: u32,
    /// Deopts at the same (point, reason) before the function is ineligible
    pub deopt_threshold: u32,
    /// Invocations an ineligible function waits before it may tier up again
    pub ineligible_cooldown: u64,
    /// Synchronous or concurrent compilation
    pub compile_mode: CompileMode,
    /// Background compile workers (concurrent mode)
    pub worker_threads: usize,
    /// Maximum queued compile jobs (concurrent mode)
    pub queue_capacity: usize,
    /// Artificial delay before each background compile, for testing
    pub recompilation_delay_ms: u64,
    /// Largest callee (in instructions) considered for inlining
    pub max_inline_bytecode_length: usize,
    /// Maximum nesting of inlined frames
    pub max_inline_depth: usize,
    /// Shapes tracked per property site before it goes megamorphic
    pub max_polymorphism: usize,
    /// Maximum call depth before a RangeError
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invocation_threshold: 8,
            optimize_threshold: 32,
            osr_threshold: 100,
            deopt_threshold: 3,
            ineligible_cooldown: 64,
            compile_mode: CompileMode::Synchronous,
            worker_threads: 1,
            queue_capacity: 8,
            recompilation_delay_ms: 0,
            max_inline_bytecode_length: 24,
            max_inline_depth: 2,
            max_polymorphism: 4,
            max_call_depth: 512,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("Failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.optimize_threshold < self.invocation_threshold {
            return Err(Error::ConfigError(
                "optimizeThreshold must not be below invocationThreshold".to_string(),
            ));
        }
        if self.compile_mode == CompileMode::Concurrent && self.worker_threads == 0 {
            return Err(Error::ConfigError(
                "concurrent mode needs at least one worker thread".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::ConfigError("queueCapacity must be positive".to_string()));
        }
        if self.max_polymorphism == 0 {
            return Err(Error::ConfigError("maxPolymorphism must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_compile_mode(mut self, mode: CompileMode) -> Self {
        self.compile_mode = mode;
        self
    }

    pub fn with_thresholds(mut self, invocation: u64, optimize: u64) -> Self {
        self.invocation_threshold = invocation;
        self.optimize_threshold = optimize;
        self
    }

    pub fn with_osr_threshold(mut self, threshold: u32) -> Self {
        self.osr_threshold = threshold;
        self
    }

    pub fn with_deopt_threshold(mut self, threshold: u32, cooldown: u64) -> Self {
        self.deopt_threshold = threshold;
        self.ineligible_cooldown = cooldown;
        self
    }

    pub fn with_recompilation_delay(mut self, delay_ms: u64) -> Self {
        self.recompilation_delay_ms = delay_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "osrThreshold": 5, "compileMode": "concurrent" }"#)
            .unwrap();
        assert_eq!(config.osr_threshold, 5);
        assert_eq!(config.compile_mode, CompileMode::Concurrent);
        assert_eq!(config.deopt_threshold, EngineConfig::default().deopt_threshold);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let err = EngineConfig::from_json(r#"{ "invocationThreshold": 10, "optimizeThreshold": 2 }"#)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "deoptThreshold": 7, "workerThreads": 2 }}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.deopt_threshold, 7);
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_compile_mode_from_str() {
        assert_eq!("concurrent".parse::<CompileMode>().unwrap(), CompileMode::Concurrent);
        assert_eq!("sync".parse::<CompileMode>().unwrap(), CompileMode::Synchronous);
        assert!("eager".parse::<CompileMode>().is_err());
    }
}
