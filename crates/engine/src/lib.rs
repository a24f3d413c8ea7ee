//! Sandboxed snippet execution for scriptbox.
//!
//! # Architecture
//!
//! A request flows through five components, leaves first:
//!
//! 1. **Console interceptor** (`console`) captures `console.*`/`print` output
//! 2. **Capability resolver** (`capabilities`) grants `http`, `date`, `color` by allowlist
//! 3. **Snippet compiler** (`compiler`, `scan`) turns source into one callable unit
//! 4. **Sandbox runtime** (`sandbox`) owns a fresh Lua VM and runs the unit under limits
//! 5. **Execution controller** (`controller`) drives the run on a worker thread
//!
//! # Critical Rule
//!
//! **Nothing escapes [`Engine::execute`].**
//!
//! Compile errors, snippet errors, denied capabilities, limit trips and
//! worker panics all come back as an [`ExecutionResult`] with status 1 and
//! the error as the last log entry.
//!
//! # Safety Guarantees
//!
//! - **Isolated**: one VM per request, no filesystem/process/env access
//! - **Limited**: wall-clock timeout, instruction budget, heap ceiling, log cap,
//!   pattern work estimate, runaway worker cap
//! - **Allowlisted**: capabilities outside the request's allowlist raise

pub mod capabilities;
pub mod compiler;
pub mod console;
pub mod controller;
pub mod error;
pub mod patterns;
pub mod request;
pub mod sandbox;
pub mod scan;

pub use capabilities::{Capability, CapabilitySet, DENIED_AMBIENT};
pub use compiler::{CompiledUnit, Snippet, SnippetMode, CHUNK_NAME};
pub use console::{ConsoleLevel, ConsoleLog, ConsoleSink, LogEntry};
pub use controller::{Engine, Execution, RunState, WORKER_GRACE};
pub use error::{EngineError, ErrorKind};
pub use request::{ExecutionRequest, ExecutionResult, STATUS_FAILED, STATUS_OK};
pub use sandbox::{
    Abort, CancelToken, RunGuard, Sandbox, SandboxLimits, DATA_BINDING, INSTRUCTION_HOOK_INTERVAL,
    NULL_BINDING, RESULT_BINDING,
};
pub use scan::GuardViolation;
