//! Capability resolver.
//!
//! A snippet reaches outside its data context only through named
//! capabilities. The allowlist is resolved per request into an immutable
//! [`CapabilitySet`]; each granted capability is installed into the sandbox
//! environment as a frozen table. Everything else is denied.
//!
//! There is no bypass mode. A request with no allowlist gets the configured
//! default set, never "everything".

pub mod color;
pub mod date;
pub mod http;

use std::sync::Arc;

use mlua::{Lua, Table, Value};
use scriptbox_config::HttpSettings;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::sandbox::RunGuard;

// ============================================================================
// Capability
// ============================================================================

/// A named facility a snippet may be granted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound HTTP requests.
    Http,
    /// Date parsing, formatting and arithmetic.
    Date,
    /// Hex color parsing and manipulation.
    Color,
    /// Names this build does not implement.
    /// Unknown caps are preserved on roundtrip but never granted.
    #[serde(untagged)]
    Unknown(String),
}

impl Capability {
    /// Every capability this build can grant.
    pub const KNOWN: [Capability; 3] = [Capability::Http, Capability::Date, Capability::Color];

    /// Map a name to a capability. Unrecognized names become `Unknown`.
    pub fn from_name(name: &str) -> Self {
        Self::known(name).unwrap_or_else(|| Capability::Unknown(name.to_string()))
    }

    /// Map a name to a capability this build implements.
    pub fn known(name: &str) -> Option<Self> {
        match name {
            "http" => Some(Capability::Http),
            "date" => Some(Capability::Date),
            "color" => Some(Capability::Color),
            _ => None,
        }
    }

    /// Global name the capability is bound under.
    pub fn name(&self) -> &str {
        match self {
            Capability::Http => "http",
            Capability::Date => "date",
            Capability::Color => "color",
            Capability::Unknown(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Capability::Unknown(_))
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Ambient facilities that are never available, whatever the allowlist says.
pub const DENIED_AMBIENT: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadfile",
    "dofile",
    "loadstring",
    "collectgarbage",
    "coroutine",
];

// ============================================================================
// CapabilitySet
// ============================================================================

/// The capabilities granted to one request. Built per request, never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    granted: Vec<Capability>,
}

impl CapabilitySet {
    /// Resolve a request's allowlist.
    ///
    /// `None` means the configured `defaults`. Unknown names are logged and
    /// dropped; duplicates collapse to their first occurrence.
    pub fn resolve(requested: Option<&[Capability]>, defaults: &[String]) -> Self {
        let candidates: Vec<Capability> = match requested {
            Some(caps) => caps.to_vec(),
            None => defaults.iter().map(|name| Capability::from_name(name)).collect(),
        };

        let mut granted = Vec::with_capacity(candidates.len());
        for cap in candidates {
            if !cap.is_known() {
                log::warn!("ignoring unknown capability '{}'", cap);
                continue;
            }
            if !granted.contains(&cap) {
                granted.push(cap);
            }
        }
        Self { granted }
    }

    /// An empty set: no capability is granted.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.granted.contains(cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.granted.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.granted.iter().map(|c| c.name()).collect()
    }
}

// ============================================================================
// Installation
// ============================================================================

/// Per-run state the capability tables close over.
#[derive(Clone)]
pub(crate) struct CapabilityContext {
    pub guard: Arc<RunGuard>,
    pub http: HttpSettings,
}

/// Bind every granted capability into `env` as a frozen table.
pub(crate) fn install(lua: &Lua, env: &Table, set: &CapabilitySet, ctx: &CapabilityContext) -> mlua::Result<()> {
    for cap in set.iter() {
        let table = match cap {
            Capability::Http => http::create_table(lua, ctx)?,
            Capability::Date => date::create_table(lua)?,
            Capability::Color => color::create_table(lua)?,
            Capability::Unknown(_) => continue,
        };
        env.raw_set(cap.name(), freeze_table(lua, &table)?)?;
    }
    Ok(())
}

/// Attach the missing-name resolver to `env`.
///
/// Lookups that miss the environment table land here: a known capability
/// outside the allowlist or a denied ambient facility raises, anything else
/// yields nil (or raises when `strict` is set).
pub(crate) fn install_resolver(lua: &Lua, env: &Table, set: &CapabilitySet, strict: bool) -> mlua::Result<()> {
    let set = set.clone();
    let resolver = lua.create_function(move |_, (_env, key): (Table, Value)| {
        let name = match &key {
            Value::String(s) => s.to_string_lossy().to_string(),
            _ => return Ok(Value::Nil),
        };

        if let Some(cap) = Capability::known(&name) {
            if set.contains(&cap) {
                // Granted, but the snippet cleared the binding itself
                return Ok(Value::Nil);
            }
            log::warn!("snippet referenced capability '{}' outside its allowlist", name);
            return Err(mlua::Error::external(EngineError::CapabilityDenied { name, listed: true }));
        }

        if DENIED_AMBIENT.contains(&name.as_str()) {
            log::warn!("snippet referenced denied facility '{}'", name);
            return Err(mlua::Error::external(EngineError::CapabilityDenied { name, listed: false }));
        }

        if strict && name != crate::sandbox::RESULT_BINDING {
            return Err(mlua::Error::external(EngineError::Runtime(format!(
                "'{}' is not defined",
                name
            ))));
        }
        Ok(Value::Nil)
    })?;

    let mt = lua.create_table()?;
    mt.set("__index", resolver)?;
    mt.set("__metatable", false)?;
    env.set_metatable(Some(mt));
    Ok(())
}

/// Wrap `original` in a read-only proxy.
pub(crate) fn freeze_table(lua: &Lua, original: &Table) -> mlua::Result<Table> {
    let mt = lua.create_table()?;
    mt.set("__index", original.clone())?;
    mt.set(
        "__newindex",
        lua.create_function(|_, _: mlua::MultiValue| {
            Err::<(), _>(mlua::Error::RuntimeError("cannot modify a read-only table".to_string()))
        })?,
    )?;
    mt.set("__metatable", false)?;

    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(mt));
    Ok(proxy)
}

// ============================================================================
// Argument helpers shared by the capability tables
// ============================================================================

/// Runtime error raised from a capability function.
pub(crate) fn cap_error(cap: &str, msg: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::external(EngineError::Runtime(format!("{}: {}", cap, msg)))
}

/// Read a number argument, accepting integers and floats.
pub(crate) fn number_arg(cap: &str, what: &str, value: &Value) -> mlua::Result<f64> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        other => Err(cap_error(cap, format!("{} must be a number, got {}", what, other.type_name()))),
    }
}
