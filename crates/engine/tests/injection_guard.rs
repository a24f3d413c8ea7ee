// Property-based tests for the expression injection guard.
// CI: 128 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release
//
// An expression snippet is embedded as `return (<code>\n)`. The guard must
// accept every self-contained expression and refuse every text that could
// close the wrapper early or swallow its tail. A refused snippet never runs.

use proptest::prelude::*;
use scriptbox_engine::scan::{check_expression, scan, TokenKind};
use scriptbox_engine::{Engine, ExecutionRequest, STATUS_FAILED, STATUS_OK};
use serde_json::json;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_128() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(128),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn config_512() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(512),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn engine() -> Engine {
    let mut settings = scriptbox_config::Settings::default();
    settings.sandbox.timeout_ms = 1_000;
    Engine::new(settings)
}

fn assert_rejected_without_running(code: &str) {
    let result = engine().execute(&ExecutionRequest::expression(code));
    assert_eq!(result.status, STATUS_FAILED, "accepted {:?}", code);
    assert_eq!(result.log.len(), 1, "something ran before rejecting {:?}: {:?}", code, result.log);
    assert!(
        result.log[0].starts_with("CompileError: rejected snippet:"),
        "{:?} -> {:?}",
        code,
        result.log
    );
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Well-formed numeric expression with its expected value. Brackets also
/// appear inside strings and comments, where they are not structure.
fn arb_balanced() -> impl Strategy<Value = (String, i64)> {
    let leaf = (0i64..100).prop_map(|n| (n.to_string(), n));
    leaf.prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|((a, x), (b, y))| (format!("({} + {})", a, b), x + y)),
            (inner.clone(), inner.clone())
                .prop_map(|((a, x), (b, y))| (format!("math.max({}, {})", a, b), x.max(y))),
            (inner.clone(), inner.clone())
                .prop_map(|((a, _), (b, _))| (format!("#{{{}, {}, \")\"}}", a, b), 3)),
            inner
                .clone()
                .prop_map(|(a, x)| (format!("({{{}, [[ ) ]]}})[1]", a), x)),
            inner.prop_map(|(a, x)| (format!("({} --[[ ) ]] )", a), x)),
        ]
    })
}

/// Arbitrary text built from the fragments that matter to the lexer.
fn arb_fragments() -> impl Strategy<Value = String> {
    let fragment = prop_oneof![
        Just("("),
        Just(")"),
        Just("["),
        Just("]"),
        Just("{"),
        Just("}"),
        Just("\""),
        Just("'"),
        Just("\\"),
        Just("--"),
        Just("--[["),
        Just("[["),
        Just("]]"),
        Just("[=["),
        Just("]=]"),
        Just(";"),
        Just("\n"),
        Just("\r"),
        Just(" "),
        Just("1"),
        Just("x"),
        Just(" + "),
        Just(", "),
        Just(" .. "),
        Just("function()"),
        Just("do"),
        Just("end"),
        Just("print('pwned')"),
    ];
    prop::collection::vec(fragment, 0..16).prop_map(|parts| parts.concat())
}

/// Tails that try to leave the wrapper and run a statement.
fn arb_escape() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(") print('pwned') ("),
        Just(")) print('pwned') (("),
        Just("); print('pwned'); ("),
        Just(" --[["),
        Just(" [["),
        Just(" \"unterminated"),
        Just("}"),
        Just("]"),
    ]
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn balanced_expressions_are_accepted_and_evaluate((code, expected) in arb_balanced()) {
        prop_assert!(check_expression(&code).is_ok(), "guard refused {:?}", code);

        let result = engine().execute(&ExecutionRequest::expression(code.clone()));
        prop_assert_eq!(result.status, STATUS_OK, "{:?} -> {:?}", code, result.log);
        prop_assert_eq!(result.value, Some(json!(expected)));
    }
}

proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn trailing_line_comment_cannot_swallow_wrapper((code, expected) in arb_balanced()) {
        let code = format!("{} -- )", code);
        let result = engine().execute(&ExecutionRequest::expression(code.clone()));
        prop_assert_eq!(result.status, STATUS_OK, "{:?} -> {:?}", code, result.log);
        prop_assert_eq!(result.value, Some(json!(expected)));
    }
}

proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn escape_attempts_are_rejected((code, _) in arb_balanced(), tail in arb_escape()) {
        let attack = format!("{}{}", code, tail);
        prop_assert!(check_expression(&attack).is_err(), "guard accepted {:?}", attack);
        assert_rejected_without_running(&attack);
    }
}

proptest! {
    #![proptest_config(config_512())]
    #[test]
    fn accepted_text_never_closes_the_wrapper(code in arb_fragments()) {
        prop_assume!(check_expression(&code).is_ok());

        // The wrapper's `(` must be matched by the wrapper's `)`, and nothing
        // in between may be an unterminated string or comment.
        let wrapped = format!("({}\n)", code);
        let tokens = scan(&wrapped);
        let mut depth = 0usize;
        for (index, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::Open(_) => depth += 1,
                TokenKind::Close(_) => {
                    prop_assert!(depth > 0, "unbalanced close in {:?}", wrapped);
                    depth -= 1;
                    if depth == 0 {
                        prop_assert_eq!(index, tokens.len() - 1, "wrapper closed early in {:?}", wrapped);
                        prop_assert_eq!(token.range.end, wrapped.len());
                    }
                }
                TokenKind::String { terminated } | TokenKind::Comment { terminated } => {
                    prop_assert!(terminated, "dangling literal in {:?}", wrapped);
                }
                _ => {}
            }
        }
        prop_assert_eq!(depth, 0);
    }
}

proptest! {
    #![proptest_config(config_128())]
    #[test]
    fn arbitrary_text_never_escapes_the_contract(code in arb_fragments()) {
        let result = engine().execute(&ExecutionRequest::expression(code.clone()));
        prop_assert!(result.status == STATUS_OK || result.status == STATUS_FAILED);
        if result.status == STATUS_FAILED {
            let last = result.log.last().cloned().unwrap_or_default();
            prop_assert!(
                last.starts_with("CompileError: ") || last.starts_with("RuntimeError: "),
                "{:?} -> {:?}",
                code,
                result.log
            );
        }
        if check_expression(&code).is_err() {
            prop_assert_eq!(result.log.len(), 1, "{:?} ran before rejection", code);
        }
    }
}

// ---------------------------------------------------------------------------
// Regressions
// ---------------------------------------------------------------------------

#[test]
fn known_attacks_are_rejected() {
    for attack in [
        "1) print(\"pwned\") (",
        "1) print('pwned') (1",
        "1 --[[",
        "\"abc",
        "'abc\n) print('pwned') ('",
        "1; print(\"x\")",
        "1 --\r) print('pwned') (",
        "[==[ ]] ) ",
        "({1)",
        "1]",
    ] {
        assert!(check_expression(attack).is_err(), "guard accepted {:?}", attack);
        assert_rejected_without_running(attack);
    }
}

#[test]
fn literal_brackets_are_not_structure() {
    let engine = engine();
    for (code, expected) in [
        ("\")\"", json!(")")),
        ("[[ ) ]]", json!(" ) ")),
        ("'(' .. \")\"", json!("()")),
        ("(function() local a = 1; return a end)()", json!(1)),
        ("#{ 1, 2; 3 }", json!(3)),
        ("1 --[[ ) ]] + 1", json!(2)),
        ("2 -- )", json!(2)),
    ] {
        let result = engine.execute(&ExecutionRequest::expression(code));
        assert_eq!(result.status, STATUS_OK, "{:?} -> {:?}", code, result.log);
        assert_eq!(result.value, Some(expected), "{:?}", code);
    }
}

#[test]
fn statements_are_not_guarded() {
    // Statement snippets are their own chunk; `;` and bare calls are normal code
    let result = engine().execute(&ExecutionRequest::statements("print('a'); print('b'); result = 1"));
    assert_eq!(result.status, STATUS_OK);
    assert_eq!(result.log, vec!["a", "b"]);
}
