use std::sync::Arc;

use async_recursion::async_recursion;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    bridge::{adapt_host_args, adapt_returns},
    context::ExecutionContext,
    evaluator::{EvalError, EvalResult, Evaluator},
    governor::CancelSignal,
    scope::Scope,
    statement::{ControlFlow, StatementResult},
    value::{Function, HostFunction, ScriptFunction, Value},
};
use crate::ast::FuncDef;

/// A call registered by `defer`; callee and arguments are evaluated at registration.
#[derive(Debug)]
pub struct DeferredCall {
    pub callee: Value,
    pub args: Vec<Value>,
    pub spread: bool,
}

/// Per-invocation bookkeeping: the deferred calls of one function body.
#[derive(Debug, Default)]
pub struct Frame {
    defers: Mutex<Vec<DeferredCall>>,
}

impl Frame {
    pub fn defer(&self, call: DeferredCall) {
        self.defers.lock().push(call);
    }

    fn pop(&self) -> Option<DeferredCall> {
        self.defers.lock().pop()
    }
}

/// Handed to host functions so they can observe the run and call back into scripts.
#[derive(Debug, Clone)]
pub struct CallContext {
    evaluator: Evaluator,
}

impl CallContext {
    pub(crate) fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }

    pub fn run_id(&self) -> Uuid {
        self.evaluator.ctx.run_id()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        self.evaluator.ctx.cancel_signal()
    }

    pub fn cycles(&self) -> u64 {
        self.evaluator.ctx.cycles()
    }

    pub(crate) fn execution(&self) -> &ExecutionContext {
        &self.evaluator.ctx
    }

    /// Call a script or host function value with already-evaluated arguments.
    pub async fn call(&self, func: &Value, args: Vec<Value>) -> EvalResult<Value> {
        self.evaluator.call_value(func.clone(), args, false).await
    }
}

/// Split call arguments into fixed positional arguments and the variadic rest.
///
/// A spread call to a variadic function must supply exactly the fixed
/// arguments plus the spread sequence; discrete trailing arguments and a spread
/// never mix. A spread call to a non-variadic function expands the sequence
/// before the arity check.
pub fn bind_arguments(
    name: &str,
    fixed: usize,
    variadic: bool,
    mut args: Vec<Value>,
    spread: bool,
) -> EvalResult<(Vec<Value>, Option<Vec<Value>>)> {
    if spread {
        let expanded = match args.pop() {
            Some(Value::List(list)) => list.snapshot(),
            Some(Value::Nil) => Vec::new(),
            Some(other) => {
                return Err(EvalError::InvalidOperation(format!(
                    "cannot spread value of type {}",
                    other.type_name()
                )))
            }
            None => {
                return Err(EvalError::InvalidOperation(
                    "spread call without arguments".to_string(),
                ))
            }
        };
        if variadic {
            if args.len() != fixed {
                return Err(EvalError::ArgumentCount {
                    name: name.to_string(),
                    expected: fixed.to_string(),
                    received: args.len(),
                });
            }
            return Ok((args, Some(expanded)));
        }
        args.extend(expanded);
    }

    if variadic {
        if args.len() < fixed {
            return Err(EvalError::ArgumentCount {
                name: name.to_string(),
                expected: format!("at least {}", fixed),
                received: args.len(),
            });
        }
        let rest = args.split_off(fixed);
        Ok((args, Some(rest)))
    } else {
        if args.len() != fixed {
            return Err(EvalError::ArgumentCount {
                name: name.to_string(),
                expected: fixed.to_string(),
                received: args.len(),
            });
        }
        Ok((args, None))
    }
}

impl Evaluator {
    /// Close over `scope`. The scope is shared, never copied.
    pub fn make_closure(&self, def: &Arc<FuncDef>, scope: &Arc<Scope>, self_bound: bool) -> Value {
        Value::Func(Arc::new(Function::Script(ScriptFunction {
            def: def.clone(),
            scope: scope.clone(),
            self_bound: self_bound && def.name.is_some(),
        })))
    }

    #[async_recursion]
    pub async fn call_value(&self, callee: Value, args: Vec<Value>, spread: bool) -> EvalResult<Value> {
        let Value::Func(func) = callee else {
            return Err(EvalError::InvalidOperation(format!(
                "cannot call non-function value of type {}",
                callee.type_name()
            )));
        };
        match func.as_ref() {
            Function::Script(script) => self.call_script(&func, script, args, spread).await,
            Function::Host(host) => self.call_host(host, args, spread).await,
        }
    }

    async fn call_script(
        &self,
        func: &Arc<Function>,
        script: &ScriptFunction,
        args: Vec<Value>,
        spread: bool,
    ) -> EvalResult<Value> {
        let def = &script.def;
        let fixed = def
            .params
            .len()
            .checked_sub(usize::from(def.variadic))
            .ok_or_else(|| {
                EvalError::InvalidOperation(format!(
                    "variadic function {} has no parameters",
                    def.display_name()
                ))
            })?;
        let (fixed_args, rest) =
            bind_arguments(def.display_name(), fixed, def.variadic, args, spread)?;

        let call_scope = script.scope.new_child()?;
        if script.self_bound {
            if let Some(name) = &def.name {
                call_scope.define(name, Value::Func(func.clone()))?;
            }
        }
        for (name, value) in def.params.iter().zip(fixed_args) {
            call_scope.define(name, value)?;
        }
        if let (Some(rest), Some(name)) = (rest, def.params.last()) {
            call_scope.define(name, Value::list(rest))?;
        }

        let frame = Frame::default();
        let result = self.eval_block(&def.body, &call_scope, &frame).await;
        match self.run_defers(&frame, result).await? {
            StatementResult::Value(_) => Ok(Value::Nil),
            StatementResult::Control(ControlFlow::Return(value)) => Ok(value),
            StatementResult::Control(flow) => Err(EvalError::InvalidOperation(format!(
                "{} outside of a loop",
                flow
            ))),
        }
    }

    async fn call_host(&self, host: &HostFunction, args: Vec<Value>, spread: bool) -> EvalResult<Value> {
        let (fixed_args, rest) =
            bind_arguments(&host.name, host.fixed_arity(), host.variadic, args, spread)?;
        let args = adapt_host_args(host, fixed_args, rest)?;
        let results = host.invoke(CallContext::new(self.clone()), args).await?;
        adapt_returns(host, results)
    }

    /// Run deferred calls last-registered-first. The body's error wins over a
    /// deferred call's error.
    pub(crate) async fn run_defers(
        &self,
        frame: &Frame,
        mut result: EvalResult<StatementResult>,
    ) -> EvalResult<StatementResult> {
        while let Some(call) = frame.pop() {
            if let Err(error) = self.call_value(call.callee, call.args, call.spread).await {
                if result.is_ok() {
                    result = Err(error);
                } else {
                    debug!(%error, "deferred call failed after an earlier error");
                }
            }
        }
        result
    }

    /// Run a call on its own task, sharing this run's context.
    pub(crate) fn spawn_call(&self, callee: Value, args: Vec<Value>, spread: bool) {
        let evaluator = self.clone();
        let run_id = self.ctx.run_id();
        tokio::spawn(async move {
            debug!(%run_id, "spawned task started");
            match evaluator.call_value(callee, args, spread).await {
                Ok(_) => debug!(%run_id, "spawned task finished"),
                Err(error) if error.is_interrupt() => {
                    debug!(%run_id, "spawned task interrupted")
                }
                Err(error) => warn!(%run_id, %error, "spawned task failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn test_fixed_arity() {
        let (fixed, rest) = bind_arguments("f", 2, false, ints(&[1, 2]), false).unwrap();
        assert_eq!(fixed, ints(&[1, 2]));
        assert!(rest.is_none());
        assert!(matches!(
            bind_arguments("f", 2, false, ints(&[1]), false),
            Err(EvalError::ArgumentCount { received: 1, .. })
        ));
    }

    #[test]
    fn test_variadic_collects_rest() {
        let (fixed, rest) = bind_arguments("f", 1, true, ints(&[1, 2, 3]), false).unwrap();
        assert_eq!(fixed, ints(&[1]));
        assert_eq!(rest, Some(ints(&[2, 3])));
        let (_, rest) = bind_arguments("f", 1, true, ints(&[1]), false).unwrap();
        assert_eq!(rest, Some(vec![]));
    }

    #[test]
    fn test_spread_into_variadic() {
        let args = vec![Value::list(ints(&[1, 2]))];
        let (fixed, rest) = bind_arguments("a", 0, true, args, true).unwrap();
        assert!(fixed.is_empty());
        assert_eq!(rest, Some(ints(&[1, 2])));

        let mixed = vec![Value::Int(1), Value::list(ints(&[2]))];
        assert!(matches!(
            bind_arguments("a", 0, true, mixed, true),
            Err(EvalError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_spread_into_fixed_checks_expanded_arity() {
        let args = vec![Value::Int(1), Value::list(ints(&[2]))];
        assert!(matches!(
            bind_arguments("a", 1, false, args, true),
            Err(EvalError::ArgumentCount { received: 2, .. })
        ));
        let args = vec![Value::Int(1), Value::list(ints(&[2]))];
        let (fixed, _) = bind_arguments("a", 2, false, args, true).unwrap();
        assert_eq!(fixed, ints(&[1, 2]));
    }
}
