//! Core builtins registered into the root scope unless disabled in
//! [`EngineConfig`](crate::config::EngineConfig).

use std::sync::Arc;

use futures::FutureExt;

use super::{
    bridge::HostType,
    evaluator::{EvalError, EvalResult},
    function::CallContext,
    scope::Scope,
    value::{HostFunction, ListValue, Value},
};

fn any(count: usize) -> Vec<HostType> {
    vec![HostType::Any; count]
}

fn wrong_type(name: &str, value: &Value) -> EvalError {
    EvalError::InvalidOperation(format!(
        "invalid argument {} (type {}) for {}",
        value,
        value.type_name(),
        name
    ))
}

fn rest(mut args: Vec<Value>) -> Vec<Value> {
    match args.pop() {
        Some(Value::List(list)) => list.snapshot(),
        _ => Vec::new(),
    }
}

fn len(args: Vec<Value>) -> EvalResult<Vec<Value>> {
    let n = match &args[0] {
        Value::Nil => 0,
        Value::String(s) => s.chars().count(),
        Value::List(list) => list.len(),
        Value::Map(map) => map.len(),
        Value::Chan(chan) => chan.len(),
        other => return Err(wrong_type("len", other)),
    };
    Ok(vec![Value::Int(n as i64)])
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`; `stop` is exclusive.
///
/// Built in chunks so a long range observes cancellation and the element ceiling.
async fn range(ctx: CallContext, args: Vec<Value>) -> EvalResult<Vec<Value>> {
    let bounds: Vec<i64> = rest(args).iter().map(Value::to_int).collect();
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(EvalError::ArgumentCount {
                name: "range".to_string(),
                expected: "1 to 3".to_string(),
                received: bounds.len(),
            })
        }
    };
    if step == 0 {
        return Err(EvalError::InvalidOperation(
            "range argument 3 must not be zero".to_string(),
        ));
    }
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let span = if step > 0 { stop - start } else { start - stop };
    let count = if span <= 0 {
        0
    } else {
        (span + step.abs() - 1) / step.abs()
    };
    let count = usize::try_from(count).map_err(|_| {
        EvalError::InvalidOperation(format!("range of {} elements is too large", count))
    })?;
    let items = ctx
        .execution()
        .build(count, |i| Ok(Value::Int((start + i as i128 * step) as i64)))
        .await?;
    Ok(vec![Value::list(items)])
}

/// Returns a new sequence; the source is never grown in place.
fn append(mut args: Vec<Value>) -> EvalResult<Vec<Value>> {
    let items = rest(args.split_off(1));
    let appended = match &args[0] {
        Value::Nil => ListValue::new(Vec::new()),
        Value::List(list) => ListValue::typed(list.snapshot(), list.elem_type().cloned(), false),
        other => return Err(wrong_type("append", other)),
    };
    for item in items {
        appended.push(item)?;
    }
    Ok(vec![Value::List(Arc::new(appended))])
}

fn delete(args: Vec<Value>) -> EvalResult<Vec<Value>> {
    match &args[0] {
        Value::Map(map) => {
            map.remove(&args[1])?;
            Ok(vec![])
        }
        Value::Nil => Ok(vec![]),
        other => Err(wrong_type("delete", other)),
    }
}

fn keys(args: Vec<Value>) -> EvalResult<Vec<Value>> {
    match &args[0] {
        Value::Map(map) => Ok(vec![Value::list(map.keys())]),
        Value::Nil => Ok(vec![Value::list(vec![])]),
        other => Err(wrong_type("keys", other)),
    }
}

fn close(args: Vec<Value>) -> EvalResult<Vec<Value>> {
    match &args[0] {
        Value::Chan(chan) => {
            chan.close()?;
            Ok(vec![])
        }
        other => Err(wrong_type("close", other)),
    }
}

/// Host functions making up the core library, in registration order.
pub fn core_functions() -> Vec<HostFunction> {
    vec![
        HostFunction::new("len", any(1), vec![HostType::int()], len),
        HostFunction::new_async("range", any(1), vec![HostType::Any], |ctx, args| {
            range(ctx, args).boxed()
        })
        .variadic(),
        HostFunction::new("append", any(2), vec![HostType::Any], append).variadic(),
        HostFunction::new("delete", any(2), vec![], delete),
        HostFunction::new("keys", any(1), vec![HostType::Any], keys),
        HostFunction::new("close", any(1), vec![], close),
        HostFunction::new("typeOf", any(1), vec![HostType::String], |args| {
            Ok(vec![Value::String(args[0].type_name())])
        }),
        HostFunction::new("kindOf", any(1), vec![HostType::String], |args| {
            Ok(vec![Value::String(args[0].kind())])
        }),
        HostFunction::new("toString", any(1), vec![HostType::String], |args| {
            Ok(vec![Value::String(args[0].to_string())])
        }),
        HostFunction::new("toInt", any(1), vec![HostType::int()], |args| {
            Ok(vec![Value::Int(args[0].to_int())])
        }),
        HostFunction::new("toFloat", any(1), vec![HostType::float()], |args| {
            Ok(vec![Value::Float(args[0].to_float())])
        }),
        HostFunction::new("toBool", any(1), vec![HostType::Bool], |args| {
            Ok(vec![Value::Bool(args[0].loose_bool())])
        }),
    ]
}

/// Bind the core library into `scope`. Names the scope already binds are left alone.
pub fn register(scope: &Scope) -> EvalResult<()> {
    for func in core_functions() {
        if scope.contains_local(&func.name) {
            continue;
        }
        let name = func.name.clone();
        scope.define(&name, func.into_value())?;
    }
    Ok(())
}
