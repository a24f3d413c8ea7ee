use std::fmt;
use std::time::Duration;

/// Failure category surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The snippet never became an executable unit.
    Compile,
    /// The unit started and failed (including limits and denied capabilities).
    Runtime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Lua syntax error or oversized source.
    Compile(String),
    /// Expression rejected by the injection guard before embedding.
    Injection(String),
    /// Error raised while the unit ran (including `error(...)` in the snippet).
    Runtime(String),
    /// Snippet referenced a capability it was not granted.
    /// `listed` is true for capabilities that exist but were left out of the allowlist.
    CapabilityDenied { name: String, listed: bool },
    /// Wall-clock budget exhausted.
    Timeout(Duration),
    /// VM instruction budget exhausted.
    InstructionLimit(u64),
    /// Lua heap ceiling reached.
    MemoryLimit(usize),
    /// Caller cancelled the run.
    Cancelled,
    /// VM or environment could not be prepared.
    Setup(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile(_) | Self::Injection(_) => ErrorKind::Compile,
            _ => ErrorKind::Runtime,
        }
    }

    /// Returns true for failures caused by a sandbox limit rather than the snippet's own logic.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::InstructionLimit(_) | Self::MemoryLimit(_) | Self::Cancelled
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(msg) => write!(f, "CompileError: {msg}"),
            Self::Injection(reason) => write!(f, "CompileError: rejected snippet: {reason}"),
            Self::Runtime(msg) => write!(f, "RuntimeError: {msg}"),
            Self::CapabilityDenied { name, listed: true } => {
                write!(f, "RuntimeError: capability '{name}' is not available (not in allowlist)")
            }
            Self::CapabilityDenied { name, listed: false } => {
                write!(f, "RuntimeError: capability '{name}' is not available")
            }
            Self::Timeout(limit) => {
                write!(f, "RuntimeError: execution timeout ({}ms limit)", limit.as_millis())
            }
            Self::InstructionLimit(limit) => {
                write!(f, "RuntimeError: instruction limit exceeded ({limit} instructions)")
            }
            Self::MemoryLimit(bytes) => {
                write!(f, "RuntimeError: memory limit exceeded ({bytes} bytes)")
            }
            Self::Cancelled => write!(f, "RuntimeError: execution cancelled"),
            Self::Setup(msg) => write!(f, "RuntimeError: sandbox setup failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(EngineError::Compile("x".into()).kind(), ErrorKind::Compile);
        assert_eq!(EngineError::Injection("x".into()).kind(), ErrorKind::Compile);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Runtime);
        assert_eq!(
            EngineError::CapabilityDenied { name: "http".into(), listed: true }.kind(),
            ErrorKind::Runtime
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EngineError::Timeout(Duration::from_millis(250)).to_string(),
            "RuntimeError: execution timeout (250ms limit)"
        );
        assert_eq!(
            EngineError::CapabilityDenied { name: "http".into(), listed: true }.to_string(),
            "RuntimeError: capability 'http' is not available (not in allowlist)"
        );
        assert_eq!(
            EngineError::CapabilityDenied { name: "os".into(), listed: false }.to_string(),
            "RuntimeError: capability 'os' is not available"
        );
        assert_eq!(
            EngineError::Injection("unbalanced ')' at byte 3".into()).to_string(),
            "CompileError: rejected snippet: unbalanced ')' at byte 3"
        );
    }
}
