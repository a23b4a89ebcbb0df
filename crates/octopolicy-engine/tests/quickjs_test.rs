//! QuickJS isolation and compile-deadline tests.

use std::sync::Arc;
use std::time::Duration;

use octopolicy_engine::{
    CapabilityRegistry, EvalScope, PolicyRuntime, PreparedQuery, Query, QuickJsConfig,
    QuickJsRuntime, RuntimeError,
};
use serde_json::{Value, json};

fn runtime(timeout_ms: u64) -> QuickJsRuntime {
    QuickJsRuntime::new(
        QuickJsConfig::default().with_timeout_ms(timeout_ms),
        Arc::new(CapabilityRegistry::new()),
    )
}

async fn compile(source: &str, data: Value) -> Arc<dyn PreparedQuery> {
    runtime(1_000)
        .compile(
            "policies.isolation",
            source,
            &Query::policy_result().with_data(data),
        )
        .await
        .unwrap()
}

async fn result(prepared: &Arc<dyn PreparedQuery>, input: Value) -> Value {
    let rows = prepared.evaluate(input, EvalScope::default()).await.unwrap();
    rows[0]["result"].clone()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_globals_do_not_survive_between_evaluations() {
    let source = r#"
        globalThis.seen = (globalThis.seen || 0) + 1;
        try { data.list.push(input.n); } catch (e) {}
        return { len: data.list.length, seen: globalThis.seen };
    "#;
    let prepared = compile(source, json!({"list": []})).await;

    for n in 0..3 {
        let out = result(&prepared, json!({"n": n})).await;
        assert_eq!(out, json!({"len": 0, "seen": 1}));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nested_data_is_frozen() {
    let source = r#"
        "use strict";
        data.user.roles.push("admin");
        return true;
    "#;
    let prepared = compile(source, json!({"user": {"roles": ["reader"]}})).await;

    let err = prepared
        .evaluate(json!({}), EvalScope::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Evaluation(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_prototypes_are_reset() {
    let source = r#"
        Array.prototype.marks = (Array.prototype.marks || 0) + 1;
        return [].marks;
    "#;
    let prepared = compile(source, Value::Null).await;

    assert_eq!(result(&prepared, json!({})).await, json!(1));
    assert_eq!(result(&prepared, json!({})).await, json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_source_cannot_escape_function_body() {
    let compiled = tokio::time::timeout(
        Duration::from_secs(3),
        runtime(1_000).compile(
            "policies.escape",
            "}; while (true) {}; function __x() {",
            &Query::policy_result(),
        ),
    )
    .await
    .expect("compile must not hang");

    let err = compiled.err().unwrap();
    assert!(
        matches!(err, RuntimeError::Compile { ref module, .. } if module == "policies.escape"),
        "{err:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compile_does_not_run_policy_body() {
    let prepared = tokio::time::timeout(
        Duration::from_secs(3),
        runtime(50).compile("policies.spin", "while (true) {}", &Query::policy_result()),
    )
    .await
    .expect("compile must not hang")
    .unwrap();

    let err = prepared
        .evaluate(json!({}), EvalScope::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout(50)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_expression_sees_frozen_data() {
    let prepared = runtime(1_000)
        .compile(
            "policies.expr",
            "return input.n;",
            &Query::new("total", "module(input) + data.offset").with_data(json!({"offset": 10})),
        )
        .await
        .unwrap();

    let rows = prepared
        .evaluate(json!({"n": 5}), EvalScope::default())
        .await
        .unwrap();
    assert_eq!(rows[0]["total"], json!(15));
}
