//! `http` capability: outbound requests through a blocking reqwest client.
//!
//! The client is created lazily, once per run, and dropped with the VM.
//! Every request is bounded by the smaller of the configured HTTP timeout and
//! the time left before the run deadline, so a slow server cannot hold a
//! worker past the sandbox timeout.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, LuaSerdeExt, Table, Value};
use reqwest::redirect::Policy;
use scriptbox_config::HttpSettings;
use url::Url;

use super::{cap_error, CapabilityContext};
use crate::console::json_options;
use crate::sandbox::{Abort, RunGuard};

const CAP: &str = "http";

const MAX_REDIRECTS: usize = 5;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

/// Request body as supplied by the snippet.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    /// Sent as `application/json`.
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased names, in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub is_json: bool,
}

/// Check a URL against the scheme rules and host policy.
pub fn validate_url(settings: &HttpSettings, raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid url '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("scheme '{}' is not allowed", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| format!("url '{}' has no host", raw))?;
    if !settings.host_allowed(host) {
        return Err(format!("host '{}' is not in the allowed host list", host));
    }
    Ok(url)
}

/// Per-run HTTP state shared by the `http.*` functions.
struct HttpCapability {
    settings: HttpSettings,
    guard: Arc<RunGuard>,
    client: RefCell<Option<reqwest::blocking::Client>>,
}

impl HttpCapability {
    fn new(settings: HttpSettings, guard: Arc<RunGuard>) -> Self {
        Self {
            settings,
            guard,
            client: RefCell::new(None),
        }
    }

    fn client(&self) -> mlua::Result<reqwest::blocking::Client> {
        let mut slot = self.client.borrow_mut();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        // Redirects are re-checked against the same policy as the first hop
        let policy_settings = self.settings.clone();
        let client = reqwest::blocking::Client::builder()
            .user_agent(self.settings.user_agent.clone())
            .redirect(Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if validate_url(&policy_settings, attempt.url().as_str()).is_ok() {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .build()
            .map_err(|e| cap_error(CAP, format!("client setup failed: {}", e)))?;

        *slot = Some(client.clone());
        Ok(client)
    }

    /// Time this request may take: configured timeout capped by the run deadline.
    fn request_timeout(&self) -> mlua::Result<Duration> {
        let remaining = self.guard.remaining();
        if remaining.is_zero() {
            return Err(self.deadline_error());
        }
        Ok(Duration::from_millis(self.settings.timeout_ms).min(remaining))
    }

    fn deadline_error(&self) -> mlua::Error {
        self.guard.trip(Abort::Timeout);
        match self.guard.tripped() {
            Some(abort) => mlua::Error::external(self.guard.error_for(abort)),
            None => cap_error(CAP, "request timed out"),
        }
    }

    fn transport_error(&self, err: reqwest::Error, timeout: Duration) -> mlua::Error {
        if err.is_timeout() {
            if self.guard.remaining().is_zero() {
                return self.deadline_error();
            }
            return cap_error(CAP, format!("request timed out after {}ms", timeout.as_millis()));
        }
        cap_error(CAP, format!("request failed: {}", err))
    }

    fn send(&self, spec: RequestSpec) -> mlua::Result<HttpResponse> {
        // A cancelled or expired run must not start another request
        if let Err(abort) = self.guard.check(0) {
            return Err(mlua::Error::external(self.guard.error_for(abort)));
        }

        let url = validate_url(&self.settings, &spec.url).map_err(|e| cap_error(CAP, e))?;

        let method_name = spec.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method_name.as_str()) {
            return Err(cap_error(CAP, format!("method '{}' is not supported", spec.method)));
        }
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|e| cap_error(CAP, e))?;

        let timeout = self.request_timeout()?;
        let mut builder = self.client()?.request(method, url.clone()).timeout(timeout);
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match spec.body {
            Some(Body::Text(text)) => builder.body(text),
            Some(Body::Json(json)) => builder.json(&json),
            None => builder,
        };

        log::debug!("http {} {}", method_name, url);
        let response = builder.send().map_err(|e| self.transport_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let is_json = headers
            .iter()
            .any(|(name, value)| name == "content-type" && value.to_ascii_lowercase().contains("json"));

        let max = self.settings.max_response_bytes;
        let mut buf = Vec::new();
        response
            .take(max as u64 + 1)
            .read_to_end(&mut buf)
            .map_err(|e| {
                if self.guard.remaining().is_zero() {
                    self.deadline_error()
                } else {
                    cap_error(CAP, format!("reading response failed: {}", e))
                }
            })?;
        if buf.len() > max {
            return Err(cap_error(CAP, format!("response body exceeds {} bytes", max)));
        }

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&buf).to_string(),
            is_json,
        })
    }
}

fn response_table(lua: &Lua, response: HttpResponse) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("status", response.status)?;
    table.set("ok", (200..300).contains(&response.status))?;

    let headers = lua.create_table()?;
    for (name, value) in &response.headers {
        headers.set(name.as_str(), value.as_str())?;
    }
    table.set("headers", headers)?;

    if response.is_json {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&response.body) {
            table.set("json", lua.to_value(&json)?)?;
        }
    }
    table.set("body", response.body)?;
    Ok(table)
}

fn headers_arg(headers: Option<Table>) -> mlua::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    if let Some(table) = headers {
        for pair in table.pairs::<String, String>() {
            out.push(pair.map_err(|e| cap_error(CAP, format!("invalid header: {}", e)))?);
        }
    }
    Ok(out)
}

fn body_arg(lua: &Lua, value: Value) -> mlua::Result<Option<Body>> {
    match value {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(Body::Text(s.to_string_lossy().to_string()))),
        Value::Integer(i) => Ok(Some(Body::Text(i.to_string()))),
        Value::Number(n) => Ok(Some(Body::Text(n.to_string()))),
        table @ Value::Table(_) => {
            let json: serde_json::Value = lua
                .from_value_with(table, json_options())
                .map_err(|e| cap_error(CAP, format!("body is not serializable: {}", e)))?;
            Ok(Some(Body::Json(json)))
        }
        other => Err(cap_error(CAP, format!("unsupported body type {}", other.type_name()))),
    }
}

pub(crate) fn create_table(lua: &Lua, ctx: &CapabilityContext) -> mlua::Result<Table> {
    let state = Rc::new(HttpCapability::new(ctx.http.clone(), ctx.guard.clone()));
    let http = lua.create_table()?;

    let s = state.clone();
    http.set(
        "get",
        lua.create_function(move |lua, (url, headers): (String, Option<Table>)| {
            let spec = RequestSpec {
                headers: headers_arg(headers)?,
                ..RequestSpec::get(url)
            };
            response_table(lua, s.send(spec)?)
        })?,
    )?;

    let s = state.clone();
    http.set(
        "post",
        lua.create_function(move |lua, (url, body, headers): (String, Value, Option<Table>)| {
            let spec = RequestSpec {
                method: "POST".to_string(),
                url,
                headers: headers_arg(headers)?,
                body: body_arg(lua, body)?,
            };
            response_table(lua, s.send(spec)?)
        })?,
    )?;

    let s = state;
    http.set(
        "request",
        lua.create_function(move |lua, opts: Table| {
            let url: Option<String> = opts.get("url")?;
            let url = url.ok_or_else(|| cap_error(CAP, "request requires a url"))?;
            let method: Option<String> = opts.get("method")?;
            let spec = RequestSpec {
                method: method.unwrap_or_else(|| "GET".to_string()),
                url,
                headers: headers_arg(opts.get("headers")?)?,
                body: body_arg(lua, opts.get("body")?)?,
            };
            response_table(lua, s.send(spec)?)
        })?,
    )?;

    Ok(http)
}
