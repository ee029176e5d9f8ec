mod common;

use std::sync::Arc;

use common::{call, engine, int_list, ints, read};
use futures::FutureExt;
use pretty_assertions::assert_eq;
use riverscript::{
    convert, CancelSignal, Engine, EngineConfig, EvalError, Expr, HostFunction, HostType,
    IntKind, Scope, Stmt, StructType, TypeExpr, Value,
};

async fn run(engine: &Engine, script: &[Stmt]) -> Result<Value, riverscript::Error> {
    engine.run(&CancelSignal::new(), script).await
}

fn root_error(error: &riverscript::Error) -> &EvalError {
    error.as_eval().map(EvalError::root).unwrap_or_else(|| panic!("not an evaluation error: {:?}", error))
}

fn adder() -> HostFunction {
    HostFunction::new(
        "add",
        vec![HostType::int(), HostType::int()],
        vec![HostType::int()],
        |args| Ok(vec![Value::Int(args[0].to_int() + args[1].to_int())]),
    )
}

fn summer() -> HostFunction {
    HostFunction::new(
        "sum",
        vec![HostType::slice(HostType::int())],
        vec![HostType::int()],
        |args| {
            let Value::List(list) = &args[0] else {
                return Err(EvalError::Internal("expected packed arguments".to_string()));
            };
            Ok(vec![Value::Int(list.snapshot().iter().map(Value::to_int).sum())])
        },
    )
    .variadic()
}

#[tokio::test]
async fn test_host_function_converts_arguments() {
    let engine = engine();
    engine.define_function(adder()).unwrap();
    let value = run(
        &engine,
        &[call("add", vec![Expr::float(2.9), Expr::int(3)])],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::Int(5));
}

#[tokio::test]
async fn test_argument_count_is_checked_before_conversion() {
    let engine = engine();
    engine.define_function(adder()).unwrap();
    let error = run(&engine, &[call("add", vec![Expr::string("x")])])
        .await
        .unwrap_err();
    assert!(
        matches!(root_error(&error), EvalError::ArgumentCount { received: 1, .. }),
        "{:?}",
        error
    );

    let error = run(
        &engine,
        &[call("add", vec![Expr::string("x"), Expr::int(1)])],
    )
    .await
    .unwrap_err();
    assert_eq!(
        root_error(&error).to_string(),
        "type mismatch: wants type int64 but received type string"
    );
}

#[tokio::test]
async fn test_variadic_host_function() {
    let engine = engine();
    engine.define_function(summer()).unwrap();
    let discrete = run(
        &engine,
        &[call("sum", vec![Expr::int(1), Expr::int(2), Expr::float(3.5)])],
    )
    .await
    .unwrap();
    assert_eq!(discrete, Value::Int(6));

    let spread = run(
        &engine,
        &[Stmt::expr(Expr::call_spread(
            Expr::ident("sum"),
            vec![common::int_list(&[4, 5, 6])],
        ))],
    )
    .await
    .unwrap();
    assert_eq!(spread, Value::Int(15));

    let empty = run(&engine, &[call("sum", vec![])]).await.unwrap();
    assert_eq!(empty, Value::Int(0));
}

#[tokio::test]
async fn test_multiple_returns_destructure() {
    let engine = engine();
    engine
        .define_function(HostFunction::new(
            "divmod",
            vec![HostType::int(), HostType::int()],
            vec![HostType::int(), HostType::int()],
            |args| {
                let (a, b) = (args[0].to_int(), args[1].to_int());
                if b == 0 {
                    return Err(EvalError::InvalidOperation("division by zero".to_string()));
                }
                Ok(vec![Value::Int(a / b), Value::Int(a % b)])
            },
        ))
        .unwrap();
    let script = vec![
        Stmt::assign_many(
            vec![Expr::ident("q"), Expr::ident("r")],
            vec![Expr::call(
                Expr::ident("divmod"),
                vec![Expr::int(17), Expr::int(5)],
            )],
        ),
        Stmt::expr(Expr::list(vec![Expr::ident("q"), Expr::ident("r")])),
    ];
    assert_eq!(run(&engine, &script).await.unwrap(), ints(&[3, 2]));
}

#[tokio::test]
async fn test_short_host_results_are_rejected() {
    let engine = engine();
    engine
        .define_function(HostFunction::new(
            "split",
            vec![],
            vec![HostType::int(), HostType::int()],
            |_| Ok(vec![Value::Int(1)]),
        ))
        .unwrap();
    let error = run(&engine, &[call("split", vec![])]).await.unwrap_err();
    assert!(matches!(root_error(&error), EvalError::InvalidOperation(message) if message.contains("split")));
}

#[tokio::test]
async fn test_past_end_assignment_on_host_slice() {
    let engine = engine();
    let typed = convert(ints(&[1, 2]), &HostType::slice(HostType::int())).unwrap();
    engine.define("typed", typed).unwrap();
    let store = |name: &str, index: i64| {
        Stmt::assign(Expr::index(Expr::ident(name), Expr::int(index)), Expr::int(9))
    };

    let script = vec![
        Stmt::assign_to("plain", int_list(&[1, 2])),
        store("plain", 2),
        read("plain"),
    ];
    assert_eq!(run(&engine, &script).await.unwrap(), ints(&[1, 2, 9]));

    let error = run(&engine, &[store("plain", 4)]).await.unwrap_err();
    assert!(matches!(root_error(&error), EvalError::IndexOutOfRange { index: 4, len: 3 }));

    run(&engine, &[store("typed", 1)]).await.unwrap();
    for index in [2, 3] {
        let error = run(&engine, &[store("typed", index)]).await.unwrap_err();
        assert!(
            matches!(root_error(&error), EvalError::IndexOutOfRange { len: 2, .. }),
            "{:?}",
            error
        );
    }
    assert_eq!(engine.get("typed").unwrap(), ints(&[1, 9]));
}

#[tokio::test]
async fn test_typed_container_parameters() {
    let engine = engine();
    engine
        .define_function(HostFunction::new(
            "describe",
            vec![HostType::slice(HostType::float()), HostType::map(HostType::String, HostType::Int(IntKind::U8))],
            vec![HostType::String],
            |args| Ok(vec![Value::String(format!("{} {}", args[0].type_name(), args[1].type_name()))]),
        ))
        .unwrap();
    let value = run(
        &engine,
        &[call(
            "describe",
            vec![
                common::int_list(&[1, 2]),
                Expr::map(vec![(Expr::string("k"), Expr::int(300))]),
            ],
        )],
    )
    .await
    .unwrap();
    assert_eq!(value, Value::string("[]float64 map[string]uint8"));

    let error = run(
        &engine,
        &[call(
            "describe",
            vec![
                Expr::list(vec![Expr::string("a")]),
                Expr::map(vec![]),
            ],
        )],
    )
    .await
    .unwrap_err();
    assert_eq!(
        root_error(&error).to_string(),
        "type mismatch: wants type []float64 but received type []interface {}"
    );
}

#[tokio::test]
async fn test_host_struct_fields_are_typed() {
    let engine = engine();
    let point = StructType::new("Point")
        .field("X", HostType::int())
        .field("Y", HostType::int())
        .into_type();
    engine.define_type("Point", point.clone()).unwrap();
    engine
        .define_function(HostFunction::new(
            "manhattan",
            vec![point],
            vec![HostType::int()],
            |args| {
                let Value::Handle(point) = &args[0] else {
                    return Err(EvalError::Internal("expected a Point".to_string()));
                };
                let x = point.get_field("X")?.to_int();
                let y = point.get_field("Y")?.to_int();
                Ok(vec![Value::Int(x.abs() + y.abs())])
            },
        ))
        .unwrap();

    let script = vec![
        Stmt::assign_to("p", Expr::new_of(TypeExpr::named("Point"))),
        Stmt::assign(Expr::member(Expr::ident("p"), "X"), Expr::float(-2.5)),
        Stmt::assign_to(
            "fromStruct",
            Expr::call(Expr::ident("manhattan"), vec![Expr::ident("p")]),
        ),
        Stmt::assign_to(
            "fromMap",
            Expr::call(
                Expr::ident("manhattan"),
                vec![Expr::map(vec![
                    (Expr::string("X"), Expr::int(3)),
                    (Expr::string("Y"), Expr::int(-4)),
                ])],
            ),
        ),
        Stmt::expr(Expr::list(vec![
            Expr::member(Expr::ident("p"), "X"),
            Expr::ident("fromStruct"),
            Expr::ident("fromMap"),
        ])),
    ];
    assert_eq!(run(&engine, &script).await.unwrap(), ints(&[-2, 2, 7]));

    let error = run(
        &engine,
        &[Stmt::assign(
            Expr::member(Expr::ident("p"), "Z"),
            Expr::int(1),
        )],
    )
    .await
    .unwrap_err();
    assert!(error.to_string().contains("has no field Z"), "{}", error);
}

#[derive(Debug)]
struct Connection {
    id: u32,
}

#[tokio::test]
async fn test_opaque_handles_round_trip() {
    let engine = engine();
    engine
        .define("conn", Value::opaque("Connection", Connection { id: 7 }))
        .unwrap();
    engine
        .define_function(HostFunction::new(
            "connectionId",
            vec![HostType::Handle("Connection".to_string())],
            vec![HostType::int()],
            |args| {
                let conn = args[0]
                    .downcast_ref::<Connection>()
                    .ok_or_else(|| EvalError::Internal("not a connection".to_string()))?;
                Ok(vec![Value::Int(conn.id as i64)])
            },
        ))
        .unwrap();
    let script = vec![
        Stmt::assign_to("alias", Expr::ident("conn")),
        call("connectionId", vec![Expr::ident("alias")]),
    ];
    assert_eq!(run(&engine, &script).await.unwrap(), Value::Int(7));

    let kind = run(&engine, &[call("typeOf", vec![Expr::ident("conn")])])
        .await
        .unwrap();
    assert_eq!(kind, Value::string("Connection"));
    assert_eq!(
        engine.get("conn").unwrap().downcast_ref::<Connection>().map(|c| c.id),
        Some(7)
    );
}

#[tokio::test]
async fn test_async_host_function_calls_back_into_script() {
    let engine = engine();
    engine
        .define_function(HostFunction::new_async(
            "twice",
            vec![HostType::Func, HostType::Any],
            vec![HostType::Any],
            |ctx, args| {
                async move {
                    let once = ctx.call(&args[0], vec![args[1].clone()]).await?;
                    let twice = ctx.call(&args[0], vec![once]).await?;
                    Ok(vec![twice])
                }
                .boxed()
            },
        ))
        .unwrap();
    let script = vec![
        Stmt::func(
            "inc",
            &["x"],
            vec![Stmt::ret(Expr::binary(
                riverscript::BinaryOp::Add,
                Expr::ident("x"),
                Expr::int(1),
            ))],
        ),
        call("twice", vec![Expr::ident("inc"), Expr::int(40)]),
    ];
    assert_eq!(run(&engine, &script).await.unwrap(), Value::Int(42));

    // script errors raised inside the callback surface to the run
    let failing = vec![
        Stmt::func("boom", &["x"], vec![Stmt::throw(Expr::string("bad"))]),
        call("twice", vec![Expr::ident("boom"), Expr::int(1)]),
    ];
    let error = run(&engine, &failing).await.unwrap_err();
    assert!(matches!(root_error(&error), EvalError::Thrown(Value::String(s)) if s == "bad"));
}

#[tokio::test]
async fn test_packages_are_namespaced() {
    let engine = engine();
    let math = engine.new_package();
    math.define("pi", Value::Float(3.5)).unwrap();
    math.define("square", HostFunction::new(
        "square",
        vec![HostType::float()],
        vec![HostType::float()],
        |args| Ok(vec![Value::Float(args[0].to_float() * args[0].to_float())]),
    )
    .into_value())
    .unwrap();
    engine.define_package("math", math).unwrap();

    let script = vec![Stmt::expr(Expr::call(
        Expr::member(Expr::ident("math"), "square"),
        vec![Expr::member(Expr::ident("math"), "pi")],
    ))];
    assert_eq!(run(&engine, &script).await.unwrap(), Value::Float(12.25));
    assert!(engine.get("pi").is_err());
}

#[tokio::test]
async fn test_copied_scope_leaves_host_scope_untouched() {
    let host = Scope::new();
    host.define("limit", Value::Int(10)).unwrap();
    host.define("items", Value::list(vec![Value::Int(1)])).unwrap();

    let config = EngineConfig {
        copy_scope: true,
        ..EngineConfig::default()
    };
    let engine = Engine::with_scope(config, host.clone()).unwrap();
    run(
        &engine,
        &[
            Stmt::assign_to("limit", Expr::int(20)),
            call("append", vec![Expr::ident("items"), Expr::int(2)]),
            Stmt::assign(Expr::index(Expr::ident("items"), Expr::int(0)), Expr::int(9)),
        ],
    )
    .await
    .unwrap();
    assert_eq!(engine.get("limit").unwrap(), Value::Int(20));
    assert_eq!(host.get("limit").unwrap(), Value::Int(10));
    assert_eq!(host.get("items").unwrap(), ints(&[1]));

    let borrowed = EngineConfig {
        copy_scope: false,
        ..EngineConfig::default()
    };
    let shared = Engine::with_scope(borrowed, host.clone()).unwrap();
    run(&shared, &[Stmt::assign_to("limit", Expr::int(30))])
        .await
        .unwrap();
    assert_eq!(host.get("limit").unwrap(), Value::Int(30));
    drop(shared);
    // a borrowed scope survives the engine
    assert_eq!(read_limit(&host), Value::Int(30));
}

fn read_limit(scope: &Arc<Scope>) -> Value {
    scope.lookup("limit").unwrap_or_default()
}

#[tokio::test]
async fn test_host_reads_script_definitions() {
    let engine = engine();
    run(
        &engine,
        &[
            Stmt::assign_to(
                "cfg",
                Expr::typed_map(
                    TypeExpr::named("string"),
                    TypeExpr::named("int"),
                    vec![(Expr::string("retries"), Expr::float(3.0))],
                ),
            ),
            read("cfg"),
        ],
    )
    .await
    .unwrap();
    let Value::Map(cfg) = engine.get("cfg").unwrap() else {
        panic!("cfg should be a map");
    };
    assert_eq!(cfg.get_str("retries"), Some(Value::Int(3)));
    assert_eq!(Value::Map(cfg).type_name(), "map[string]int64");
}
