// Integration tests for work that escapes the instruction hook.
//
// A run that ends must not leave a worker burning CPU behind it. This file
// holds a single test so that the process CPU clock only sees its own work.
//
// Run with: cargo test -p scriptbox-engine --test runaway_workers

#![cfg(target_os = "linux")]

use std::thread;
use std::time::{Duration, Instant};

use scriptbox_config::Settings;
use scriptbox_engine::{Engine, EngineError, ExecutionRequest, STATUS_FAILED};

fn engine_with(configure: impl FnOnce(&mut Settings)) -> Engine {
    let mut settings = Settings::default();
    configure(&mut settings);
    Engine::new(settings)
}

/// User plus system CPU time of this process, in clock ticks.
fn cpu_ticks() -> u64 {
    let stat = std::fs::read_to_string("/proc/self/stat").unwrap();
    // Fields after the parenthesized command name start at `state`
    let rest = &stat[stat.rfind(')').unwrap() + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    fields[11].parse::<u64>().unwrap() + fields[12].parse::<u64>().unwrap()
}

fn wait_for_workers(engine: &Engine, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    while engine.running_workers() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    engine.running_workers()
}

#[test]
fn finished_runs_leave_no_work_behind() {
    // Backtracking pattern: refused up front, nothing keeps running
    let engine = engine_with(|s| s.sandbox.timeout_ms = 300);
    let started = Instant::now();
    let result = engine.execute(&ExecutionRequest::statements(
        "local s = string.rep('a', 200000) result = s:find('.-.-.-.-b')",
    ));
    assert_eq!(result.status, STATUS_FAILED);
    assert!(
        result.log.last().unwrap().contains("pattern is too expensive"),
        "{:?}",
        result.log
    );
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    let before = cpu_ticks();
    thread::sleep(Duration::from_secs(1));
    let spent = cpu_ticks() - before;
    assert!(spent < 50, "{} ticks spent after the run returned", spent);
    assert_eq!(wait_for_workers(&engine, Duration::from_secs(5)), 0);

    // Busy loop: the hook stops it, the worker exits
    let engine = engine_with(|s| {
        s.sandbox.timeout_ms = 150;
        s.sandbox.instruction_limit = u64::MAX;
    });
    let result = engine.execute(&ExecutionRequest::statements("while true do end"));
    assert_eq!(result.status, STATUS_FAILED);
    assert_eq!(wait_for_workers(&engine, Duration::from_secs(5)), 0);
    assert_eq!(engine.detached_workers(), 0);

    // With the pattern estimate disabled, the stuck worker is detached and
    // counts against the cap until it exits
    let engine = engine_with(|s| {
        s.sandbox.timeout_ms = 100;
        s.sandbox.pattern_work_limit = u64::MAX;
        s.sandbox.max_detached_workers = 1;
    });
    let execution = engine.execute_detailed(
        &ExecutionRequest::statements("result = string.rep('a', 1000):find('.-.-.-b')"),
        None,
    );
    assert!(matches!(execution.error, Some(EngineError::Timeout(_))), "{:?}", execution.error);
    assert_eq!(engine.detached_workers(), 1);

    let refused = engine.execute(&ExecutionRequest::expression("1"));
    assert_eq!(refused.status, STATUS_FAILED);
    assert!(
        refused.log[0].ends_with("1 runaway workers are still running (limit 1)"),
        "{:?}",
        refused.log
    );
}
