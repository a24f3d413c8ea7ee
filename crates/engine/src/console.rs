//! Console interceptor.
//!
//! `console.log/info/warn/error` and `print` are rebound inside the sandbox to
//! closures that normalize their arguments to strings and append them to a
//! shared [`ConsoleLog`]. The log outlives the VM: the controller reads it even
//! when the worker running the snippet has to be abandoned.
//!
//! Normalization never raises. A value that cannot be turned into text (a
//! cyclic table, a table holding functions) drops the whole entry and bumps
//! the `dropped` counter instead.

use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{DeserializeOptions, Function, Lua, LuaSerdeExt, MultiValue, Table, Value};

use crate::capabilities::freeze_table;
use crate::sandbox::RunGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 4] = [Self::Log, Self::Info, Self::Warn, Self::Error];

    /// Method name on the sandbox `console` table.
    pub fn method(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Ordered capture buffer for one run.
#[derive(Debug)]
pub struct ConsoleLog {
    entries: Vec<LogEntry>,
    max_entries: usize,
    truncated: bool,
    dropped: usize,
}

impl ConsoleLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            truncated: false,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() < self.max_entries {
            self.entries.push(entry);
        } else {
            self.truncated = true;
        }
    }

    /// Record an emission whose value could not be serialized.
    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Messages in emission order, plus a truncation notice if the cap was hit.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.entries.iter().map(|e| e.message.clone()).collect();
        if self.truncated {
            lines.push(format!("... log truncated ({} entry limit)", self.max_entries));
        }
        lines
    }
}

/// Shared handle to a run's [`ConsoleLog`].
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    inner: Arc<Mutex<ConsoleLog>>,
}

impl ConsoleSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsoleLog::new(max_entries))),
        }
    }

    /// Lock the log. A poisoned lock still yields the entries captured so far.
    pub fn lock(&self) -> MutexGuard<'_, ConsoleLog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Normalize one diagnostic call and append it. Never fails.
    pub fn capture(&self, lua: &Lua, level: ConsoleLevel, args: &MultiValue, separator: &str, tostring: &Function) {
        let mut parts = Vec::with_capacity(args.len());
        for value in args.iter() {
            match normalize(lua, value, tostring) {
                Ok(text) => parts.push(text),
                Err(reason) => {
                    log::debug!("dropping console.{} entry: {}", level.method(), reason);
                    self.lock().record_dropped();
                    return;
                }
            }
        }

        // console.log() with no arguments behaves like console.log(undefined)
        let message = if parts.is_empty() {
            "undefined".to_string()
        } else {
            parts.join(separator)
        };
        log::trace!(target: "scriptbox::console", "[{}] {}", level.method(), message);
        self.lock().push(LogEntry { level, message });
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().lines()
    }

    pub fn dropped(&self) -> usize {
        self.lock().dropped()
    }
}

/// Options for turning Lua tables into JSON: stable key order, cycles rejected.
pub(crate) fn json_options() -> DeserializeOptions {
    DeserializeOptions::new()
        .sort_keys(true)
        .deny_recursive_tables(true)
        .deny_unsupported_types(true)
}

/// Returns true for the JSON-null sentinel (`null` in the sandbox).
pub(crate) fn is_json_null(value: &Value) -> bool {
    matches!(value, Value::LightUserData(ud) if ud.0.is_null())
}

/// Convert one emitted value to its log text.
pub fn normalize(lua: &Lua, value: &Value, tostring: &Function) -> Result<String, String> {
    match value {
        Value::Nil => Ok("undefined".to_string()),
        v if is_json_null(v) => Ok("null".to_string()),
        Value::String(s) => Ok(s.to_string_lossy().to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(format_number(*n)),
        Value::Table(t) => {
            if has_tostring(t) {
                return tostring.call::<String>(value.clone()).map_err(|e| e.to_string());
            }
            let json: serde_json::Value = lua
                .from_value_with(value.clone(), json_options())
                .map_err(|e| e.to_string())?;
            serde_json::to_string(&json).map_err(|e| e.to_string())
        }
        _ => tostring.call::<String>(value.clone()).map_err(|e| e.to_string()),
    }
}

fn has_tostring(table: &Table) -> bool {
    table
        .get_metatable()
        .map(|mt| !matches!(mt.raw_get::<Value>("__tostring"), Ok(Value::Nil) | Err(_)))
        .unwrap_or(false)
}

/// Integral floats print without a fractional part, like the console UI.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// Bind `console` and `print` into the sandbox environment.
pub(crate) fn install(lua: &Lua, env: &Table, sink: &ConsoleSink, guard: &Arc<RunGuard>) -> mlua::Result<()> {
    let tostring: Function = lua.globals().get("tostring")?;

    let console = lua.create_table()?;
    for level in ConsoleLevel::ALL {
        let emitter = create_emitter(lua, sink.clone(), guard.clone(), level, " ", tostring.clone())?;
        console.set(level.method(), emitter)?;
    }
    env.raw_set("console", freeze_table(lua, &console)?)?;

    let print = create_emitter(lua, sink.clone(), guard.clone(), ConsoleLevel::Log, "\t", tostring)?;
    env.raw_set("print", print)?;
    Ok(())
}

fn create_emitter(
    lua: &Lua,
    sink: ConsoleSink,
    guard: Arc<RunGuard>,
    level: ConsoleLevel,
    separator: &'static str,
    tostring: Function,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        sink.capture(lua, level, &args, separator, &tostring);
        // A limit tripped inside a __tostring metamethod must not be swallowed
        if let Some(abort) = guard.tripped() {
            return Err(mlua::Error::external(guard.error_for(abort)));
        }
        Ok(())
    })
}
