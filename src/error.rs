//! Error hierarchy for the Teascript core engine.
//!
//! Grounded in the teacher's phase-specific `thiserror` hierarchy
//! (`src/core/error.rs`, `crates/angelscript-core/src/error.rs`): every
//! fallible core operation returns `TeaResult<T>` instead of a bare
//! `String`, and runtime failures carry a traceback the way a host
//! front-end would print one.

use thiserror::Error;

/// One entry in a runtime error's traceback, built from the chunk's line
/// table as each frame is unwound.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub line: u32,
    /// The function name, or `"script"` for the top-level chunk.
    pub function: String,
}

/// A runtime error: message plus the call-frame traceback active when it
/// was raised, innermost frame first.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), trace: Vec::new() }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "  [line {}] in {}", frame.line, frame.function)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The three error kinds the core reports (§7). `Compile` is never produced
/// by the core itself — it is how a host-supplied compile step surfaces a
/// failure through the same protected-call channel as a runtime error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TeaError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The host allocator returned failure. Per §7 this is unrecoverable in
    /// language terms; the embedding API surfaces it so the host can abort,
    /// matching `teaM_reallocate`'s `exit(1)` on OOM.
    #[error("out of memory")]
    Memory,
}

impl TeaError {
    pub fn runtime(message: impl Into<String>) -> Self {
        TeaError::Runtime(RuntimeError::new(message))
    }
}

pub type TeaResult<T> = Result<T, TeaError>;

/// Front-end process exit codes (§6). The core never calls `exit`; this is
/// a constants module for an external front-end to reuse.
pub mod exit_codes {
    pub const USAGE: i32 = 64;
    pub const COMPILE_ERROR: i32 = 65;
    pub const RUNTIME_ERROR: i32 = 70;
    pub const IO_ERROR: i32 = 74;
}
