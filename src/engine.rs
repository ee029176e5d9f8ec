use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::ast::Stmt;
use crate::codec;
use crate::config::EngineConfig;
use crate::error::{EngineResult, Error};
use crate::eval::{
    builtins,
    bridge::HostType,
    context::ExecutionContext,
    evaluator::{EvalError, Evaluator},
    governor::{CancelSignal, Governor, RateLimiter},
    scope::Scope,
    value::{HostFunction, Value},
};
use crate::parser::Parser;
use crate::validate;

/// Script input for [`Engine::run_source`] and [`Engine::validate`].
#[derive(Debug, Clone, Copy)]
pub enum ScriptSource<'a> {
    /// Source text, handed to the configured [`Parser`].
    Text(&'a str),
    /// Output of [`codec::encode`].
    Bytecode(&'a [u8]),
}

/// An interpreter bound to one root scope.
///
/// Runs share the root scope, so definitions made by one run are visible to the
/// next. Every run gets its own execution context: cancellation, rate limiting
/// and cycle accounting never leak between runs.
pub struct Engine {
    config: EngineConfig,
    governor: Arc<Governor>,
    scope: Arc<Scope>,
    owns_scope: bool,
    parser: Option<Arc<dyn Parser>>,
    last_cycles: Mutex<Arc<AtomicU64>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let governor = Arc::new(Governor::new(config.max_scopes));
        let scope = Scope::new_root(governor.clone());
        Self::assemble(config, governor, scope, true)
    }

    /// Run against a host-supplied scope. With `copy_scope` the engine works on
    /// a deep copy and the host's scope is never touched.
    pub fn with_scope(config: EngineConfig, scope: Arc<Scope>) -> EngineResult<Self> {
        if config.copy_scope {
            let governor = Arc::new(Governor::new(config.max_scopes));
            let copy = scope.deep_copy(governor.clone());
            Self::assemble(config, governor, copy, true)
        } else {
            let governor = scope.governor().clone();
            Self::assemble(config, governor, scope, false)
        }
    }

    fn assemble(
        config: EngineConfig,
        governor: Arc<Governor>,
        scope: Arc<Scope>,
        owns_scope: bool,
    ) -> EngineResult<Self> {
        if config.core_builtins {
            builtins::register(&scope)?;
        }
        debug!(?config, owns_scope, "engine created");
        Ok(Self {
            config,
            governor,
            scope,
            owns_scope,
            parser: None,
            last_cycles: Mutex::new(Arc::new(AtomicU64::new(0))),
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    fn protect(&self, value: Value) -> Value {
        match value {
            Value::Map(_) if self.config.protect_maps => value.deep_copy(),
            other => other,
        }
    }

    pub fn define(&self, name: &str, value: Value) -> EngineResult<()> {
        Ok(self.scope.define(name, self.protect(value))?)
    }

    pub fn define_function(&self, func: HostFunction) -> EngineResult<()> {
        let name = func.name.clone();
        self.define(&name, func.into_value())
    }

    pub fn define_type(&self, name: &str, ty: HostType) -> EngineResult<()> {
        Ok(self.scope.define_type(name, ty)?)
    }

    /// An empty namespace to fill and register with [`Engine::define_package`].
    pub fn new_package(&self) -> Arc<Scope> {
        Scope::new_root(self.governor.clone())
    }

    pub fn define_package(&self, name: &str, package: Arc<Scope>) -> EngineResult<()> {
        Ok(self.scope.define_package(name, package)?)
    }

    pub fn get(&self, name: &str) -> EngineResult<Value> {
        Ok(self.scope.get(name)?)
    }

    /// Mutate the binding if it exists, define it otherwise.
    pub fn set(&self, name: &str, value: Value) -> EngineResult<()> {
        Ok(self.scope.assign(name, self.protect(value))?)
    }

    pub fn names(&self) -> Vec<String> {
        self.scope.names()
    }

    /// Cycles accounted by the most recent run so far.
    pub fn cycles(&self) -> u64 {
        self.last_cycles.lock().load(Ordering::Relaxed)
    }

    fn context(&self, cancel: &CancelSignal) -> Arc<ExecutionContext> {
        let cycles = Arc::new(AtomicU64::new(0));
        *self.last_cycles.lock() = cycles.clone();
        let limiter = if self.config.rate_limit == 0 {
            RateLimiter::unlimited()
        } else {
            RateLimiter::new(self.config.rate_limit, self.config.rate_window)
        };
        Arc::new(
            ExecutionContext::new(cancel.clone(), limiter, cycles)
                .with_max_elements(self.config.max_elements),
        )
    }

    /// Evaluate `statements` in the root scope.
    #[instrument(level = "debug", skip(self, cancel, statements), fields(statements = statements.len()))]
    pub async fn run(&self, cancel: &CancelSignal, statements: &[Stmt]) -> EngineResult<Value> {
        let ctx = self.context(cancel);
        let run_id = ctx.run_id();
        let evaluator = Evaluator::new(ctx);
        let outcome = AssertUnwindSafe(evaluator.run(statements, &self.scope))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                if error.is_interrupt() {
                    info!(%run_id, cycles = self.cycles(), "run interrupted");
                } else {
                    debug!(%run_id, %error, "run failed");
                }
                Err(error.into())
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(%run_id, %message, "evaluation panicked");
                Err(EvalError::Internal(message).into())
            }
        }
    }

    /// Parse or decode `source`, then run it.
    pub async fn run_source(&self, cancel: &CancelSignal, source: ScriptSource<'_>) -> EngineResult<Value> {
        let statements = self.load(source)?;
        self.run(cancel, &statements).await
    }

    /// Parse or decode `source` and check its structure without running it.
    #[instrument(level = "debug", skip(self, cancel, source))]
    pub fn validate(&self, cancel: &CancelSignal, source: ScriptSource<'_>) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EvalError::Interrupt.into());
        }
        let statements = self.load(source)?;
        validate::validate(&statements)?;
        Ok(())
    }

    pub fn load(&self, source: ScriptSource<'_>) -> EngineResult<Vec<Stmt>> {
        match source {
            ScriptSource::Text(text) => {
                let parser = self
                    .parser
                    .as_ref()
                    .ok_or_else(|| Error::internal("no parser configured for source text"))?;
                Ok(parser.parse(text)?)
            }
            ScriptSource::Bytecode(bytes) => Ok(codec::decode(bytes)?),
        }
    }
}

impl Drop for Engine {
    // クロージャが自分のスコープを捕捉している循環を断つ
    fn drop(&mut self) {
        if self.owns_scope {
            self.scope.clear();
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "evaluation panicked".to_string()
    }
}
