//! Snippet compiler: lowers source text into one callable Lua function.
//!
//! Statement snippets are loaded verbatim as their own chunk. Expression
//! snippets are embedded in a `return (...)` wrapper, but only after the
//! injection guard in [`crate::scan`] has proven the text cannot close the
//! wrapper early or swallow its tail.

use std::borrow::Cow;

use mlua::{ChunkMode, Function, Lua, Table};

use crate::error::EngineError;
use crate::sandbox::SandboxLimits;
use crate::scan;

/// Chunk name used in error positions (`snippet:1: ...`).
pub const CHUNK_NAME: &str = "=snippet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetMode {
    /// A statement block. The value is `result` (or an explicit `return`).
    Statements,
    /// A single expression whose value is the result.
    Expression,
}

#[derive(Debug, Clone, Copy)]
pub struct Snippet<'a> {
    pub code: &'a str,
    pub mode: SnippetMode,
}

impl<'a> Snippet<'a> {
    pub fn new(code: &'a str, is_expression: bool) -> Self {
        let mode = if is_expression {
            SnippetMode::Expression
        } else {
            SnippetMode::Statements
        };
        Self { code, mode }
    }
}

/// A compiled snippet bound to one sandbox environment.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    function: Function,
    mode: SnippetMode,
}

impl CompiledUnit {
    pub fn mode(&self) -> SnippetMode {
        self.mode
    }

    pub(crate) fn function(&self) -> &Function {
        &self.function
    }
}

/// Guard-check an expression and embed it in the return wrapper.
///
/// The trailing newline keeps a line comment at the end of the expression
/// from commenting out the closing parenthesis.
pub fn embed_expression(code: &str) -> Result<String, EngineError> {
    scan::check_expression(code).map_err(|violation| EngineError::Injection(violation.to_string()))?;
    Ok(format!("return ({}\n)", code))
}

/// Produce the chunk source for `snippet`.
pub fn prepare_source<'a>(snippet: &Snippet<'a>, max_code_bytes: usize) -> Result<Cow<'a, str>, EngineError> {
    if snippet.code.len() > max_code_bytes {
        return Err(EngineError::Compile(format!(
            "snippet is {} bytes, limit is {} bytes",
            snippet.code.len(),
            max_code_bytes
        )));
    }
    match snippet.mode {
        SnippetMode::Statements => Ok(Cow::Borrowed(snippet.code)),
        SnippetMode::Expression => embed_expression(snippet.code).map(Cow::Owned),
    }
}

/// Compile `snippet` into a function whose `_ENV` is `env`.
///
/// Only text chunks are accepted; precompiled bytecode is refused by the VM.
pub fn compile(lua: &Lua, snippet: &Snippet<'_>, env: &Table, limits: &SandboxLimits) -> Result<CompiledUnit, EngineError> {
    let source = prepare_source(snippet, limits.max_code_bytes)?;

    let function = lua
        .load(source.as_ref())
        .set_name(CHUNK_NAME)
        .set_mode(ChunkMode::Text)
        .set_environment(env.clone())
        .into_function()
        .map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => EngineError::Compile(message),
            mlua::Error::MemoryError(_) => EngineError::MemoryLimit(limits.memory_limit),
            other => EngineError::Compile(other.to_string()),
        })?;

    Ok(CompiledUnit {
        function,
        mode: snippet.mode,
    })
}
