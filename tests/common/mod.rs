#![allow(dead_code)]

use riverscript::{CancelSignal, Engine, EngineConfig, EngineResult, Expr, Stmt, Value};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ実行したい処理
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("engine with default config")
}

/// Run `statements` on a fresh engine.
pub async fn eval(statements: &[Stmt]) -> EngineResult<Value> {
    engine().run(&CancelSignal::new(), statements).await
}

pub fn ints(values: &[i64]) -> Value {
    Value::list(values.iter().map(|v| Value::Int(*v)).collect())
}

pub fn int_list(values: &[i64]) -> Expr {
    Expr::list(values.iter().map(|v| Expr::int(*v)).collect())
}

pub fn call(name: &str, args: Vec<Expr>) -> Stmt {
    Stmt::expr(Expr::call(Expr::ident(name), args))
}

pub fn read(name: &str) -> Stmt {
    Stmt::expr(Expr::ident(name))
}
