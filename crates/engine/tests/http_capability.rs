// Integration tests for the `http` capability against a local mock server.
//
// Run with: cargo test -p scriptbox-engine --test http_capability

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use httpmock::prelude::*;
use scriptbox_config::Settings;
use scriptbox_engine::{Capability, Engine, ExecutionRequest, ExecutionResult, STATUS_FAILED, STATUS_OK};
use serde_json::json;

fn engine_with(configure: impl FnOnce(&mut Settings)) -> Engine {
    let mut settings = Settings::default();
    configure(&mut settings);
    Engine::new(settings)
}

fn run_http(engine: &Engine, code: String) -> ExecutionResult {
    engine.execute(&ExecutionRequest::statements(code).with_capabilities([Capability::Http]))
}

fn last_log(result: &ExecutionResult) -> &str {
    result.log.last().map(String::as_str).unwrap_or("")
}

#[test]
fn get_decodes_json_responses() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/grades");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "scores": [70, 85, 90], "course": "cs101" }));
    });

    let code = format!(
        "local r = http.get('{}')\n\
         result = {{ status = r.status, ok = r.ok, n = #r.json.scores, course = r.json.course }}",
        server.url("/grades")
    );
    let result = run_http(&Engine::default(), code);

    mock.assert();
    assert_eq!(result.status, STATUS_OK, "log: {:?}", result.log);
    assert_eq!(
        result.value,
        Some(json!({ "course": "cs101", "n": 3, "ok": true, "status": 200 }))
    );
}

#[test]
fn get_sends_headers() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/roster").header("x-course", "cs101");
        then.status(200).body("alice,bob");
    });

    let code = format!(
        "local r = http.get('{}', {{ ['x-course'] = 'cs101' }})\n\
         result = {{ body = r.body, has_json = r.json ~= nil }}",
        server.url("/roster")
    );
    let result = run_http(&Engine::default(), code);

    mock.assert();
    assert_eq!(result.value, Some(json!({ "body": "alice,bob", "has_json": false })));
}

#[test]
fn post_encodes_table_bodies_as_json() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/submit")
            .header("content-type", "application/json")
            .json_body(json!({ "student": "s-17", "score": 88 }));
        then.status(201).body("created");
    });

    let code = format!(
        "local r = http.post('{}', {{ student = 's-17', score = 88 }})\n\
         result = {{ status = r.status, body = r.body }}",
        server.url("/submit")
    );
    let result = run_http(&Engine::default(), code);

    mock.assert();
    assert_eq!(result.value, Some(json!({ "body": "created", "status": 201 })));
}

#[test]
fn request_supports_other_methods() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(PUT).path("/grades/7").body("A-");
        then.status(204);
    });

    let code = format!(
        "local r = http.request({{ method = 'put', url = '{}', body = 'A-' }})\nresult = r.status",
        server.url("/grades/7")
    );
    let result = run_http(&Engine::default(), code);

    mock.assert();
    assert_eq!(result.value, Some(json!(204)));
}

#[test]
fn error_statuses_are_values_not_failures() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404).body("nope");
    });

    let code = format!(
        "local r = http.get('{}')\nresult = {{ ok = r.ok, status = r.status }}",
        server.url("/missing")
    );
    let result = run_http(&Engine::default(), code);

    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.value, Some(json!({ "ok": false, "status": 404 })));
}

#[test]
fn http_outside_allowlist_never_reaches_the_network() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    let code = format!("return http.get('{}')", server.url("/grades"));
    let request = ExecutionRequest::statements(code).with_capabilities([Capability::Date]);
    let result = Engine::default().execute(&request);

    mock.assert_hits(0);
    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(
        last_log(&result),
        "RuntimeError: capability 'http' is not available (not in allowlist)"
    );
}

#[test]
fn host_policy_is_enforced() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    let engine = engine_with(|s| s.http.allowed_hosts = vec!["api.example.edu".into()]);
    let result = run_http(&engine, format!("return http.get('{}')", server.url("/grades")));

    mock.assert_hits(0);
    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(
        last_log(&result),
        "RuntimeError: http: host '127.0.0.1' is not in the allowed host list"
    );
}

#[test]
fn non_http_schemes_are_refused() {
    let result = run_http(
        &Engine::default(),
        "local ok, err = pcall(http.get, 'file:///etc/passwd')\nresult = { ok = ok, err = tostring(err) }".to_string(),
    );
    assert_eq!(result.status, STATUS_OK, "log: {:?}", result.log);
    let value = result.value.unwrap();
    assert_eq!(value["ok"], json!(false));
    assert!(value["err"].as_str().unwrap().contains("scheme 'file' is not allowed"), "{}", value["err"]);
}

#[test]
fn oversized_response_fails_the_call() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/big");
        then.status(200).body("x".repeat(64));
    });

    let engine = engine_with(|s| s.http.max_response_bytes = 16);
    let result = run_http(&engine, format!("return http.get('{}')", server.url("/big")));

    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(last_log(&result), "RuntimeError: http: response body exceeds 16 bytes");
}

#[test]
fn redirects_to_disallowed_hosts_are_not_followed() {
    let server = MockServer::start();
    let hop = server.mock(|when, then| {
        when.method(GET).path("/hop");
        then.status(302).header("location", "http://elsewhere.invalid/stolen");
    });

    let engine = engine_with(|s| s.http.allowed_hosts = vec!["127.0.0.1".into()]);
    let result = run_http(
        &engine,
        format!("local r = http.get('{}')\nresult = r.status", server.url("/hop")),
    );

    hop.assert();
    assert_eq!(result.status, STATUS_OK, "log: {:?}", result.log);
    assert_eq!(result.value, Some(json!(302)));
}

#[test]
fn unsupported_method_is_refused() {
    let result = run_http(
        &Engine::default(),
        "return http.request({ method = 'TRACE', url = 'http://127.0.0.1:9/' })".to_string(),
    );
    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(last_log(&result), "RuntimeError: http: method 'TRACE' is not supported");
}

#[test]
fn cancelled_run_sends_nothing() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    // Straight-line code never reaches the instruction hook before the call
    let code = format!("local r = http.get('{}')\nresult = r.status", server.url("/grades"));
    let request = ExecutionRequest::statements(code).with_capabilities([Capability::Http]);
    let result = Engine::default().execute_with_cancel(&request, Arc::new(AtomicBool::new(true)));

    mock.assert_hits(0);
    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(last_log(&result), "RuntimeError: execution cancelled");
}

#[test]
fn slow_response_is_bounded_by_the_run_timeout() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(std::time::Duration::from_secs(3));
    });

    let engine = engine_with(|s| s.sandbox.timeout_ms = 300);
    let started = std::time::Instant::now();
    let result = run_http(&engine, format!("return http.get('{}')", server.url("/slow")));

    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(last_log(&result), "RuntimeError: execution timeout (300ms limit)");
    assert!(started.elapsed() < std::time::Duration::from_secs(2), "took {:?}", started.elapsed());
}
