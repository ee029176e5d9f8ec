mod common;

use std::sync::Arc;

use common::{engine, read};
use pretty_assertions::assert_eq;
use riverscript::{
    codec, parser::MockParser, validate, BinaryOp, CancelSignal, Engine, EngineConfig, Error,
    Expr, ScriptSource, Stmt, Value,
};

fn counter_script() -> Vec<Stmt> {
    vec![
        Stmt::assign_to("n", Expr::int(0)),
        Stmt::while_loop(
            Some(Expr::binary(BinaryOp::Lt, Expr::ident("n"), Expr::int(5))),
            vec![Stmt::op_assign(Expr::ident("n"), BinaryOp::Add, Expr::int(1))],
        ),
        read("n"),
    ]
}

#[tokio::test]
async fn test_bytecode_runs_like_the_tree() {
    let bytes = codec::encode(&counter_script()).unwrap();
    assert!(codec::is_bytecode(&bytes));
    let engine = engine();
    let value = engine
        .run_source(&CancelSignal::new(), ScriptSource::Bytecode(&bytes))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));
}

#[test]
fn test_validate_reports_unbounded_loop() {
    let engine = engine();
    let spin = vec![Stmt::while_loop(None, vec![Stmt::assign_to("x", Expr::int(1))])];
    let bytes = codec::encode(&spin).unwrap();
    let error = engine
        .validate(&CancelSignal::new(), ScriptSource::Bytecode(&bytes))
        .unwrap_err();
    assert!(matches!(error, Error::Validation(_)), "{:?}", error);

    let bounded = codec::encode(&counter_script()).unwrap();
    engine
        .validate(&CancelSignal::new(), ScriptSource::Bytecode(&bounded))
        .unwrap();
}

#[test]
fn test_validate_observes_cancel() {
    let engine = engine();
    let cancel = CancelSignal::new();
    cancel.cancel();
    let bytes = codec::encode(&counter_script()).unwrap();
    let error = engine
        .validate(&cancel, ScriptSource::Bytecode(&bytes))
        .unwrap_err();
    assert!(error.is_interrupt());
}

#[test]
fn test_garbage_bytecode_is_rejected() {
    let engine = engine();
    assert!(matches!(
        engine.load(ScriptSource::Bytecode(b"not a script")),
        Err(Error::Codec(_))
    ));
}

#[test]
fn test_referenced_symbols_lists_free_names() {
    let script = vec![
        Stmt::assign_to("local", Expr::int(1)),
        Stmt::expr(Expr::call(
            Expr::ident("print"),
            vec![Expr::binary(BinaryOp::Add, Expr::ident("local"), Expr::ident("offset"))],
        )),
    ];
    assert_eq!(
        validate::referenced_symbols(&script),
        vec!["offset".to_string(), "print".to_string()]
    );
}

#[tokio::test]
async fn test_parser_output_is_validated_and_run() {
    let mut parser = MockParser::new();
    parser.expect_parse().returning(|_| Ok(counter_script()));
    let engine = engine().with_parser(Arc::new(parser));
    let cancel = CancelSignal::new();
    engine.validate(&cancel, ScriptSource::Text("n = 0 ...")).unwrap();
    let value = engine
        .run_source(&cancel, ScriptSource::Text("n = 0 ..."))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));
}

#[tokio::test]
async fn test_rate_limit_slows_but_completes() {
    let config: EngineConfig = serde_json::from_str(
        r#"{ "rate_limit": 10, "rate_window": 20, "max_scopes": 64 }"#,
    )
    .unwrap();
    assert_eq!(config.max_scopes, 64);
    let engine = Engine::new(config).unwrap();
    let started = std::time::Instant::now();
    let value = engine
        .run(&CancelSignal::new(), &counter_script())
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));
    assert!(engine.cycles() > 10);
    assert!(started.elapsed() >= std::time::Duration::from_millis(20));
}

#[tokio::test]
async fn test_variadic_function_without_parameters_is_rejected() {
    let script = vec![
        Stmt::variadic_func("f", &[], vec![]),
        Stmt::expr(Expr::call(Expr::ident("f"), vec![Expr::int(1)])),
    ];
    let bytes = codec::encode(&script).unwrap();
    let engine = engine();
    let error = engine
        .validate(&CancelSignal::new(), ScriptSource::Bytecode(&bytes))
        .unwrap_err();
    assert!(matches!(error, Error::Validation(_)), "{:?}", error);

    let error = engine
        .run_source(&CancelSignal::new(), ScriptSource::Bytecode(&bytes))
        .await
        .unwrap_err();
    let root = error.as_eval().map(|error| error.root());
    assert!(
        matches!(root, Some(riverscript::EvalError::InvalidOperation(_))),
        "{:?}",
        error
    );
}
