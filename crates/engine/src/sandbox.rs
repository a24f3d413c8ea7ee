//! Sandbox runtime: one fresh Lua VM per invocation.
//!
//! # Isolation
//!
//! - Only `string`, `table`, `math` and `utf8` are loaded. `os`, `io`,
//!   `package` and `debug` never exist in the VM; `string.dump` is removed.
//! - Snippets run with a private `_ENV` table built from a safe subset of the
//!   base library. Host globals are unreachable.
//! - Capability tables and standard libraries are read-only proxies.
//!
//! # Limits
//!
//! A [`RunGuard`] is consulted from an instruction-count hook every
//! [`INSTRUCTION_HOOK_INTERVAL`] instructions. It enforces the wall-clock
//! timeout, the instruction budget and cooperative cancellation. The heap
//! ceiling is enforced by the VM allocator. Once any limit trips the run is
//! aborted for good: `pcall`/`xpcall` re-raise the abort instead of handing
//! the snippet a catchable error.
//!
//! The pattern functions of `string` run in C, out of the hook's reach. They
//! are wrapped so that a call first consults the guard and is refused when
//! its worst-case work estimate exceeds the pattern work limit.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Table, Value,
    VmState,
};
use scriptbox_config::{HttpSettings, SandboxSettings};

use crate::capabilities::{self, freeze_table, CapabilityContext, CapabilitySet};
use crate::compiler::{self, CompiledUnit, Snippet, SnippetMode};
use crate::console::{self, json_options, ConsoleSink};
use crate::error::EngineError;
use crate::patterns::{self, PatternOp};

/// How often to check the guard (every N instructions).
pub const INSTRUCTION_HOOK_INTERVAL: u32 = 10_000;

/// Name the data context is bound under.
pub const DATA_BINDING: &str = "data";

/// Statement-mode result variable.
pub const RESULT_BINDING: &str = "result";

/// JSON-null sentinel.
pub const NULL_BINDING: &str = "null";

/// Cancel token for a run.
/// Set to true to signal the snippet should stop.
pub type CancelToken = Arc<AtomicBool>;

/// Base-library functions copied into every sandbox environment.
const SAFE_BASE: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "select",
    "tonumber",
    "tostring",
    "type",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "setmetatable",
    "getmetatable",
];

/// Standard libraries exposed (frozen) to snippets.
const SAFE_LIBS: &[&str] = &["string", "table", "math", "utf8"];

/// Lua's message for an allocation failure.
const OUT_OF_MEMORY: &str = "not enough memory";

/// Resource bounds for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub instruction_limit: u64,
    pub memory_limit: usize,
    pub max_log_entries: usize,
    pub max_code_bytes: usize,
    pub strict_globals: bool,
    pub pattern_work_limit: u64,
}

impl From<&SandboxSettings> for SandboxLimits {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            instruction_limit: settings.instruction_limit,
            memory_limit: settings.memory_limit_bytes,
            max_log_entries: settings.max_log_entries,
            max_code_bytes: settings.max_code_bytes,
            strict_globals: settings.strict_globals,
            pattern_work_limit: settings.pattern_work_limit,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxSettings::default())
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    Timeout,
    InstructionLimit,
    MemoryLimit,
    Cancelled,
}

/// Shared limit state for one run. The first abort recorded wins.
#[derive(Debug)]
pub struct RunGuard {
    started: Instant,
    timeout: Duration,
    instruction_limit: u64,
    memory_limit: usize,
    budget: AtomicI64,
    cancel: Option<CancelToken>,
    abort: Mutex<Option<Abort>>,
}

impl RunGuard {
    pub fn new(limits: &SandboxLimits, cancel: Option<CancelToken>) -> Self {
        Self {
            started: Instant::now(),
            timeout: limits.timeout,
            instruction_limit: limits.instruction_limit,
            memory_limit: limits.memory_limit,
            budget: AtomicI64::new(i64::try_from(limits.instruction_limit).unwrap_or(i64::MAX)),
            cancel,
            abort: Mutex::new(None),
        }
    }

    /// Time left before the wall-clock deadline.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record an abort. Later aborts do not replace the first.
    pub fn trip(&self, abort: Abort) {
        let mut slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            log::info!("run aborted: {:?} after {}ms", abort, self.started.elapsed().as_millis());
            *slot = Some(abort);
        }
    }

    pub fn tripped(&self) -> Option<Abort> {
        *self.abort.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Charge `instructions` against the budget and check every limit.
    pub fn check(&self, instructions: u32) -> Result<(), Abort> {
        if let Some(abort) = self.tripped() {
            return Err(abort);
        }

        // Check cancel flag first
        if let Some(ref cancel) = self.cancel {
            if cancel.load(Ordering::Relaxed) {
                self.trip(Abort::Cancelled);
                return Err(Abort::Cancelled);
            }
        }

        if self.started.elapsed() > self.timeout {
            self.trip(Abort::Timeout);
            return Err(Abort::Timeout);
        }

        let charge = instructions as i64;
        let before = self.budget.fetch_sub(charge, Ordering::Relaxed);
        if before <= charge {
            self.trip(Abort::InstructionLimit);
            return Err(Abort::InstructionLimit);
        }
        Ok(())
    }

    pub fn error_for(&self, abort: Abort) -> EngineError {
        match abort {
            Abort::Timeout => EngineError::Timeout(self.timeout),
            Abort::InstructionLimit => EngineError::InstructionLimit(self.instruction_limit),
            Abort::MemoryLimit => EngineError::MemoryLimit(self.memory_limit),
            Abort::Cancelled => EngineError::Cancelled,
        }
    }
}

/// A prepared VM and environment for exactly one run.
pub struct Sandbox {
    lua: Lua,
    env: Table,
    guard: Arc<RunGuard>,
    limits: SandboxLimits,
}

impl Sandbox {
    /// Build a fresh VM with the base environment, console and limit hook installed.
    pub fn new(limits: &SandboxLimits, console: &ConsoleSink, cancel: Option<CancelToken>) -> Result<Self, EngineError> {
        Self::with_guard(limits, console, Arc::new(RunGuard::new(limits, cancel)))
    }

    /// Like [`Sandbox::new`], with a guard the caller keeps a handle to.
    pub fn with_guard(limits: &SandboxLimits, console: &ConsoleSink, guard: Arc<RunGuard>) -> Result<Self, EngineError> {
        let setup = |e: mlua::Error| EngineError::Setup(e.to_string());

        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::new(),
        )
        .map_err(setup)?;
        lua.set_memory_limit(limits.memory_limit).map_err(setup)?;

        let env = build_environment(&lua, &guard, limits).map_err(|e| classify_error(&e, limits.memory_limit))?;
        console::install(&lua, &env, console, &guard).map_err(|e| classify_error(&e, limits.memory_limit))?;

        let hook_guard = guard.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_lua, _debug| match hook_guard.check(INSTRUCTION_HOOK_INTERVAL) {
                Ok(()) => Ok(VmState::Continue),
                Err(abort) => Err(mlua::Error::external(hook_guard.error_for(abort))),
            },
        );

        Ok(Self {
            lua,
            env,
            guard,
            limits: limits.clone(),
        })
    }

    pub fn guard(&self) -> &Arc<RunGuard> {
        &self.guard
    }

    /// Bind the data context and the granted capabilities.
    pub fn bind(&self, data: &serde_json::Value, capabilities: &CapabilitySet, http: &HttpSettings) -> Result<(), EngineError> {
        let bound = self.bind_inner(data, capabilities, http);
        bound.map_err(|e| self.classify(e))
    }

    fn bind_inner(&self, data: &serde_json::Value, capabilities: &CapabilitySet, http: &HttpSettings) -> mlua::Result<()> {
        self.env.raw_set(DATA_BINDING, self.lua.to_value(data)?)?;

        let ctx = CapabilityContext {
            guard: self.guard.clone(),
            http: http.clone(),
        };
        capabilities::install(&self.lua, &self.env, capabilities, &ctx)?;
        capabilities::install_resolver(&self.lua, &self.env, capabilities, self.limits.strict_globals)
    }

    pub fn compile(&self, snippet: &Snippet<'_>) -> Result<CompiledUnit, EngineError> {
        compiler::compile(&self.lua, snippet, &self.env, &self.limits)
    }

    /// Run a compiled unit and normalize its value.
    ///
    /// Expression units yield the expression. Statement units yield an
    /// explicit non-nil `return` value, otherwise the `result` variable.
    pub fn run(&self, unit: &CompiledUnit) -> Result<Option<serde_json::Value>, EngineError> {
        let returned = unit
            .function()
            .call::<Value>(())
            .map_err(|e| self.classify(e))?;

        // A limit tripped inside a callback may have been turned into a return value
        if let Some(abort) = self.guard.tripped() {
            return Err(self.guard.error_for(abort));
        }

        let value = match unit.mode() {
            SnippetMode::Expression => returned,
            SnippetMode::Statements if !returned.is_nil() => returned,
            SnippetMode::Statements => self
                .env
                .raw_get::<Value>(RESULT_BINDING)
                .map_err(|e| self.classify(e))?,
        };
        self.to_json(value)
    }

    /// Convert a Lua value to JSON with sorted keys. Nil means "no value".
    pub fn to_json(&self, value: Value) -> Result<Option<serde_json::Value>, EngineError> {
        if value.is_nil() {
            return Ok(None);
        }
        match self.lua.from_value_with::<serde_json::Value>(value, json_options()) {
            Ok(json) => Ok(Some(json)),
            Err(e) => match self.guard.tripped() {
                Some(abort) => Err(self.guard.error_for(abort)),
                None => Err(EngineError::Runtime(format!("result is not serializable: {}", e))),
            },
        }
    }

    fn classify(&self, err: mlua::Error) -> EngineError {
        if let Some(abort) = self.guard.tripped() {
            return self.guard.error_for(abort);
        }
        let classified = classify_error(&err, self.limits.memory_limit);
        if matches!(classified, EngineError::MemoryLimit(_)) {
            self.guard.trip(Abort::MemoryLimit);
        }
        classified
    }
}

/// Build the snippet's `_ENV`: safe base functions, frozen libraries,
/// abort-aware `pcall`/`xpcall`, the `null` sentinel and `_G`.
fn build_environment(lua: &Lua, guard: &Arc<RunGuard>, limits: &SandboxLimits) -> mlua::Result<Table> {
    let globals = lua.globals();
    let env = lua.create_table()?;

    for name in SAFE_BASE {
        let value: Value = globals.get(*name)?;
        env.raw_set(*name, value)?;
    }

    for name in SAFE_LIBS {
        let lib: Table = globals.get(*name)?;
        if *name == "string" {
            // Patched in place; the string metatable indexes this same table
            lib.raw_set("dump", Value::Nil)?;
            guard_pattern_functions(lua, &lib, guard, limits.pattern_work_limit)?;
        }
        env.raw_set(*name, freeze_table(lua, &lib)?)?;
    }

    env.raw_set("pcall", abort_aware(lua, globals.get("pcall")?, guard.clone())?)?;
    env.raw_set("xpcall", abort_aware(lua, globals.get("xpcall")?, guard.clone())?)?;
    env.raw_set(NULL_BINDING, lua.null())?;
    env.raw_set("_G", env.clone())?;
    Ok(env)
}

/// Replace `find`, `match`, `gmatch` and `gsub` with versions that check the
/// guard and refuse calls estimated to exceed `limit` matcher steps.
fn guard_pattern_functions(lua: &Lua, string: &Table, guard: &Arc<RunGuard>, limit: u64) -> mlua::Result<()> {
    for op in PatternOp::ALL {
        let native: Function = string.raw_get(op.name())?;
        let guard = guard.clone();
        let wrapped = lua.create_function(move |lua, args: MultiValue| {
            if let Err(abort) = guard.check(0) {
                return Err(mlua::Error::external(guard.error_for(abort)));
            }
            if let Some((subject_len, cost)) = pattern_call_cost(lua, op, &args)? {
                if cost > limit {
                    log::debug!("refused string.{}: estimate {} over {}", op.name(), cost, limit);
                    return Err(mlua::Error::external(EngineError::Runtime(format!(
                        "string.{}: pattern is too expensive for a {}-byte subject (limit {} steps)",
                        op.name(),
                        subject_len,
                        limit
                    ))));
                }
            }
            native.call::<MultiValue>(args)
        })?;
        string.raw_set(op.name(), wrapped)?;
    }
    Ok(())
}

/// Subject length and work estimate, or `None` when the arguments are not
/// strings (the native function raises the argument error).
fn pattern_call_cost(lua: &Lua, op: PatternOp, args: &MultiValue) -> mlua::Result<Option<(usize, u64)>> {
    let subject = match args.front() {
        Some(value) => lua.coerce_string(value.clone())?,
        None => None,
    };
    let pattern = match args.get(1) {
        Some(value) => lua.coerce_string(value.clone())?,
        None => None,
    };
    let (Some(subject), Some(pattern)) = (subject, pattern) else {
        return Ok(None);
    };

    let plain = args
        .get(3)
        .is_some_and(|v| !matches!(v, Value::Nil | Value::Boolean(false)));
    let subject = subject.as_bytes();
    let cost = patterns::estimate_call(op, &subject, &pattern.as_bytes(), plain);
    Ok(Some((subject.len(), cost)))
}

/// Wrap a protected-call function so it cannot swallow an aborted run.
fn abort_aware(lua: &Lua, native: Function, guard: Arc<RunGuard>) -> mlua::Result<Function> {
    lua.create_function(move |_, args: MultiValue| {
        let results: MultiValue = native.call(args)?;

        if guard.tripped().is_none() && caught_out_of_memory(&results) {
            guard.trip(Abort::MemoryLimit);
        }
        if let Some(abort) = guard.tripped() {
            return Err(mlua::Error::external(guard.error_for(abort)));
        }
        Ok(results)
    })
}

fn caught_out_of_memory(results: &MultiValue) -> bool {
    let mut iter = results.iter();
    match (iter.next(), iter.next()) {
        (Some(Value::Boolean(false)), Some(Value::String(msg))) => {
            msg.to_string_lossy().contains(OUT_OF_MEMORY)
        }
        (Some(Value::Boolean(false)), Some(Value::Error(err))) => {
            matches!(classify_error(err, 0), EngineError::MemoryLimit(_))
        }
        _ => false,
    }
}

/// Map an mlua error onto the engine's failure model.
pub(crate) fn classify_error(err: &mlua::Error, memory_limit: usize) -> EngineError {
    match err {
        mlua::Error::CallbackError { cause, .. } => classify_error(cause, memory_limit),
        mlua::Error::WithContext { cause, .. } => classify_error(cause, memory_limit),
        mlua::Error::ExternalError(inner) => match inner.downcast_ref::<EngineError>() {
            Some(engine_err) => engine_err.clone(),
            None => EngineError::Runtime(strip_traceback(&inner.to_string())),
        },
        mlua::Error::MemoryError(_) => EngineError::MemoryLimit(memory_limit),
        mlua::Error::SyntaxError { message, .. } => EngineError::Compile(strip_traceback(message)),
        mlua::Error::RuntimeError(msg) => EngineError::Runtime(strip_traceback(msg)),
        other => EngineError::Runtime(strip_traceback(&other.to_string())),
    }
}

/// Keep the message, drop any `stack traceback:` section.
fn strip_traceback(msg: &str) -> String {
    match msg.find("\nstack traceback:") {
        Some(idx) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}
