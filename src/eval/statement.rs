use std::sync::Arc;

use async_recursion::async_recursion;
use futures::future::select_all;

use super::{
    evaluator::{EvalError, EvalResult, Evaluator},
    function::{DeferredCall, Frame},
    operators::equal,
    scope::Scope,
    value::{ChanRef, Value},
};
use crate::ast::{
    BinaryOp, Block, Expr, ExprKind, FuncDef, SelectCase, SelectOp, Stmt, StmtKind, SwitchCase,
};

/// 文の評価結果を表す型
#[derive(Debug, Clone)]
pub enum StatementResult {
    /// 値を返す文 (nilを含む)
    Value(Value),

    /// 制御フロー
    Control(ControlFlow),
}

#[derive(Debug, Clone, strum::Display)]
pub enum ControlFlow {
    #[strum(serialize = "break")]
    Break,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "return")]
    Return(Value),
}

fn unit() -> EvalResult<StatementResult> {
    Ok(StatementResult::Value(Value::Nil))
}

// ループ本体の結果
enum LoopStep {
    Next,
    Exit,
    Propagate(StatementResult),
}

fn loop_step(result: StatementResult) -> LoopStep {
    match result {
        StatementResult::Value(_) | StatementResult::Control(ControlFlow::Continue) => LoopStep::Next,
        StatementResult::Control(ControlFlow::Break) => LoopStep::Exit,
        returned => LoopStep::Propagate(returned),
    }
}

// switch/select は break を消費する
fn consume_break(result: StatementResult) -> StatementResult {
    match result {
        StatementResult::Control(ControlFlow::Break) => StatementResult::Value(Value::Nil),
        other => other,
    }
}

impl Evaluator {
    /// Evaluate one statement. Every statement is a checkpoint: cancellation is
    /// observed and one cycle is accounted before dispatch.
    #[async_recursion]
    pub async fn eval_statement(
        &self,
        stmt: &Stmt,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        self.ctx.checkpoint().await?;
        self.dispatch_statement(stmt, scope, frame)
            .await
            .map_err(|error| error.at(stmt.pos))
    }

    async fn dispatch_statement(
        &self,
        stmt: &Stmt,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        match &stmt.kind {
            StmtKind::Expr(expr) => Ok(StatementResult::Value(self.eval_expr(expr, scope).await?)),
            StmtKind::Var { names, values } => self.eval_var(names, values, scope).await,
            StmtKind::Assign { targets, values } => self.eval_assign(targets, values, scope).await,
            StmtKind::OpAssign { target, op, value } => {
                self.eval_op_assign(target, *op, value, scope).await
            }
            StmtKind::If {
                condition,
                then_block,
                else_block,
            } => {
                self.eval_if(condition, then_block, else_block.as_ref(), scope, frame)
                    .await
            }
            StmtKind::Switch {
                discriminant,
                cases,
                default,
            } => {
                self.eval_switch(discriminant, cases, default.as_ref(), scope, frame)
                    .await
            }
            StmtKind::Select { cases, default } => {
                self.eval_select(cases, default.as_ref(), scope, frame).await
            }
            StmtKind::Loop { condition, body } => {
                self.eval_loop(condition.as_ref(), body, scope, frame).await
            }
            StmtKind::ForClause {
                init,
                condition,
                post,
                body,
            } => {
                self.eval_for_clause(
                    init.as_deref(),
                    condition.as_ref(),
                    post.as_deref(),
                    body,
                    scope,
                    frame,
                )
                .await
            }
            StmtKind::ForIn {
                vars,
                iterable,
                body,
            } => self.eval_for_in(vars, iterable, body, scope, frame).await,
            StmtKind::Func(def) => self.eval_func_decl(def, scope),
            StmtKind::Return(values) => {
                let value = self.eval_return(values, scope).await?;
                Ok(StatementResult::Control(ControlFlow::Return(value)))
            }
            StmtKind::Break => Ok(StatementResult::Control(ControlFlow::Break)),
            StmtKind::Continue => Ok(StatementResult::Control(ControlFlow::Continue)),
            StmtKind::Throw(expr) => Err(EvalError::Thrown(self.eval_expr(expr, scope).await?)),
            StmtKind::Try {
                body,
                catch_var,
                catch_block,
                finally_block,
            } => {
                self.eval_try(
                    body,
                    catch_var.as_deref(),
                    catch_block.as_ref(),
                    finally_block.as_ref(),
                    scope,
                    frame,
                )
                .await
            }
            StmtKind::Defer(expr) => {
                let (callee, args, spread) = self.eval_call_parts(expr, scope, "defer").await?;
                frame.defer(DeferredCall {
                    callee,
                    args,
                    spread,
                });
                unit()
            }
            StmtKind::Module { name, body } => self.eval_module(name, body, scope).await,
            StmtKind::Go(expr) => {
                let (callee, args, spread) = self.eval_call_parts(expr, scope, "go").await?;
                self.spawn_call(callee, args, spread);
                unit()
            }
            StmtKind::Send { channel, value } => {
                let chan = self.eval_channel(channel, scope).await?;
                let value = self.eval_expr(value, scope).await?;
                chan.send(value, self.ctx.cancel_signal()).await?;
                unit()
            }
            StmtKind::Block(body) => self.eval_scoped_block(body, scope, frame).await,
        }
    }

    /// Evaluate statements in `scope` itself, stopping at the first control-flow signal.
    pub async fn eval_block(
        &self,
        statements: &[Stmt],
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let mut last = Value::Nil;
        for stmt in statements.iter() {
            match self.eval_statement(stmt, scope, frame).await? {
                StatementResult::Value(value) => last = value,
                control => return Ok(control),
            }
        }
        Ok(StatementResult::Value(last))
    }

    async fn eval_scoped_block(
        &self,
        statements: &[Stmt],
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let block_scope = scope.new_child()?;
        self.eval_block(statements, &block_scope, frame).await
    }

    /// Right-hand values for `count` targets: one value per target, one
    /// sequence destructured positionally, or a comma-ok form.
    async fn eval_values(
        &self,
        values: &[Expr],
        count: usize,
        scope: &Arc<Scope>,
    ) -> EvalResult<Vec<Value>> {
        if values.is_empty() {
            return Ok(vec![Value::Nil; count]);
        }
        if values.len() == count {
            let mut evaluated = Vec::with_capacity(count);
            for value in values {
                evaluated.push(self.eval_expr(value, scope).await?);
            }
            return Ok(evaluated);
        }
        if values.len() != 1 {
            return Err(EvalError::InvalidOperation(format!(
                "mismatched assignment: {} targets but got {} values",
                count,
                values.len()
            )));
        }

        let (value, ok) = self.eval_comma_ok(&values[0], scope).await?;
        if let (Some(ok), 2) = (ok, count) {
            return Ok(vec![value, Value::Bool(ok)]);
        }
        match value {
            Value::List(list) => {
                let items = list.snapshot();
                if items.len() != count {
                    return Err(EvalError::InvalidOperation(format!(
                        "mismatched assignment: {} targets but got {} values",
                        count,
                        items.len()
                    )));
                }
                Ok(items)
            }
            _ => Err(EvalError::InvalidOperation(format!(
                "cannot assign single value to {} targets",
                count
            ))),
        }
    }

    async fn eval_var(
        &self,
        names: &[String],
        values: &[Expr],
        scope: &Arc<Scope>,
    ) -> EvalResult<StatementResult> {
        let evaluated = self.eval_values(values, names.len(), scope).await?;
        let mut last = Value::Nil;
        for (name, value) in names.iter().zip(evaluated) {
            scope.define(name, value.clone())?;
            last = value;
        }
        Ok(StatementResult::Value(last))
    }

    async fn eval_assign(
        &self,
        targets: &[Expr],
        values: &[Expr],
        scope: &Arc<Scope>,
    ) -> EvalResult<StatementResult> {
        let evaluated = self.eval_values(values, targets.len(), scope).await?;
        let mut last = Value::Nil;
        for (target, value) in targets.iter().zip(evaluated) {
            self.assign_target(target, value.clone(), scope).await?;
            last = value;
        }
        Ok(StatementResult::Value(last))
    }

    async fn eval_op_assign(
        &self,
        target: &Expr,
        op: BinaryOp,
        value: &Expr,
        scope: &Arc<Scope>,
    ) -> EvalResult<StatementResult> {
        let place = self.eval_place(target, scope).await?;
        let current = place.read(scope)?;
        let operand = self.eval_expr(value, scope).await?;
        let updated = self.combine(op, &current, &operand).await?;
        place.write(scope, updated.clone())?;
        Ok(StatementResult::Value(updated))
    }

    async fn eval_if(
        &self,
        condition: &Expr,
        then_block: &Block,
        else_block: Option<&Block>,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        if self.eval_expr(condition, scope).await?.truthy() {
            self.eval_scoped_block(then_block, scope, frame).await
        } else if let Some(else_block) = else_block {
            self.eval_scoped_block(else_block, scope, frame).await
        } else {
            unit()
        }
    }

    async fn eval_switch(
        &self,
        discriminant: &Expr,
        cases: &[SwitchCase],
        default: Option<&Block>,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let subject = self.eval_expr(discriminant, scope).await?;
        for case in cases {
            for candidate in &case.values {
                let candidate = self.eval_expr(candidate, scope).await?;
                if equal(&subject, &candidate) {
                    let result = self.eval_scoped_block(&case.body, scope, frame).await?;
                    return Ok(consume_break(result));
                }
            }
        }
        match default {
            Some(body) => Ok(consume_break(
                self.eval_scoped_block(body, scope, frame).await?,
            )),
            None => Ok(StatementResult::Value(subject)),
        }
    }

    /// Channel operands are evaluated once; readiness is then polled in case
    /// order until one case proceeds, the default runs, or the run is cancelled.
    async fn eval_select(
        &self,
        cases: &[SelectCase],
        default: Option<&Block>,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let mut prepared: Vec<(ChanRef, Option<Value>)> = Vec::with_capacity(cases.len());
        for case in cases {
            match &case.op {
                SelectOp::Recv { channel, .. } => {
                    prepared.push((self.eval_channel(channel, scope).await?, None));
                }
                SelectOp::Send { channel, value } => {
                    let chan = self.eval_channel(channel, scope).await?;
                    let value = self.eval_expr(value, scope).await?;
                    prepared.push((chan, Some(value)));
                }
            }
        }

        // 受信ケースは待機中の受信者として登録し、select 側の送信と待ち合わせる
        let mut receivers = Vec::new();
        if default.is_none() {
            for (chan, outgoing) in &prepared {
                let sends_here = prepared
                    .iter()
                    .any(|(other, value)| value.is_some() && Arc::ptr_eq(chan, other));
                if outgoing.is_none() && !sends_here {
                    receivers.push(chan.register_receiver());
                }
            }
        }

        loop {
            self.ctx.check_cancelled()?;
            let watches: Vec<_> = prepared.iter().map(|(chan, _)| chan.watch()).collect();
            for (case, (chan, outgoing)) in cases.iter().zip(prepared.iter()) {
                let received = match outgoing {
                    Some(value) => {
                        if !chan.try_send(value.clone())? {
                            continue;
                        }
                        None
                    }
                    None => match chan.try_recv() {
                        Some(received) => Some(received),
                        None => continue,
                    },
                };
                receivers.clear();
                return self.eval_select_case(case, received, scope, frame).await;
            }
            if let Some(body) = default {
                return Ok(consume_break(
                    self.eval_scoped_block(body, scope, frame).await?,
                ));
            }
            let cancel = self.ctx.cancel_signal();
            if watches.is_empty() {
                cancel.cancelled().await;
                return Err(EvalError::Interrupt);
            }
            tokio::select! {
                _ = select_all(watches) => {}
                _ = cancel.cancelled() => return Err(EvalError::Interrupt),
            }
        }
    }

    async fn eval_select_case(
        &self,
        case: &SelectCase,
        received: Option<(Value, bool)>,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let case_scope = scope.new_child()?;
        if let (SelectOp::Recv { value, ok, .. }, Some((received, present))) = (&case.op, received) {
            if let Some(name) = value {
                case_scope.define(name, received)?;
            }
            if let Some(name) = ok {
                case_scope.define(name, Value::Bool(present))?;
            }
        }
        Ok(consume_break(
            self.eval_block(&case.body, &case_scope, frame).await?,
        ))
    }

    async fn eval_loop(
        &self,
        condition: Option<&Expr>,
        body: &Block,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        loop {
            self.ctx.checkpoint().await?;
            if let Some(condition) = condition {
                if !self.eval_expr(condition, scope).await?.truthy() {
                    break;
                }
            }
            match loop_step(self.eval_scoped_block(body, scope, frame).await?) {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Propagate(result) => return Ok(result),
            }
        }
        unit()
    }

    /// A `var` init clause gets its own loop scope; any other init runs in the
    /// enclosing scope and its bindings outlive the loop.
    async fn eval_for_clause(
        &self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        post: Option<&Stmt>,
        body: &Block,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let loop_scope = match init {
            Some(Stmt {
                kind: StmtKind::Var { .. },
                ..
            }) => scope.new_child()?,
            _ => scope.clone(),
        };
        if let Some(init) = init {
            self.eval_statement(init, &loop_scope, frame).await?;
        }
        loop {
            self.ctx.checkpoint().await?;
            if let Some(condition) = condition {
                if !self.eval_expr(condition, &loop_scope).await?.truthy() {
                    break;
                }
            }
            match loop_step(self.eval_scoped_block(body, &loop_scope, frame).await?) {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Propagate(result) => return Ok(result),
            }
            if let Some(post) = post {
                self.eval_statement(post, &loop_scope, frame).await?;
            }
        }
        unit()
    }

    async fn eval_for_in(
        &self,
        vars: &[String],
        iterable: &Expr,
        body: &Block,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        if vars.is_empty() || vars.len() > 2 {
            return Err(EvalError::InvalidOperation(format!(
                "for-in takes one or two variables, got {}",
                vars.len()
            )));
        }
        let pair = vars.len() == 2;
        let rows: Box<dyn Iterator<Item = Vec<Value>> + Send> =
            match self.eval_expr(iterable, scope).await? {
                Value::List(list) => Box::new(list.snapshot().into_iter().enumerate().map(
                    move |(index, item)| {
                        if pair {
                            vec![Value::Int(index as i64), item]
                        } else {
                            vec![item]
                        }
                    },
                )),
                Value::Map(map) => Box::new(map.snapshot().into_iter().map(move |(key, value)| {
                    if pair {
                        vec![key, value]
                    } else {
                        vec![key]
                    }
                })),
                Value::String(text) => {
                    let chars: Vec<char> = text.chars().collect();
                    Box::new(chars.into_iter().enumerate().map(move |(index, c)| {
                        let c = Value::String(c.to_string());
                        if pair {
                            vec![Value::Int(index as i64), c]
                        } else {
                            vec![c]
                        }
                    }))
                }
                Value::Int(n) => Box::new((0..n.max(0)).map(|i| vec![Value::Int(i), Value::Int(i)])),
                Value::Chan(chan) => return self.eval_for_chan(vars, &chan, body, scope, frame).await,
                Value::Nil => return unit(),
                other => {
                    return Err(EvalError::InvalidOperation(format!(
                        "cannot range over {}",
                        other.type_name()
                    )))
                }
            };

        for row in rows {
            match self.eval_iteration(vars, row, body, scope, frame).await? {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Propagate(result) => return Ok(result),
            }
        }
        unit()
    }

    async fn eval_for_chan(
        &self,
        vars: &[String],
        chan: &ChanRef,
        body: &Block,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        if vars.len() != 1 {
            return Err(EvalError::InvalidOperation(
                "for-in over a channel takes one variable".to_string(),
            ));
        }
        loop {
            let (value, ok) = chan.recv(self.ctx.cancel_signal()).await?;
            if !ok {
                break;
            }
            match self.eval_iteration(vars, vec![value], body, scope, frame).await? {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Propagate(result) => return Ok(result),
            }
        }
        unit()
    }

    // 反復ごとに子スコープを作る
    async fn eval_iteration(
        &self,
        vars: &[String],
        values: Vec<Value>,
        body: &Block,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<LoopStep> {
        self.ctx.checkpoint().await?;
        let iteration_scope = scope.new_child()?;
        for (name, value) in vars.iter().zip(values) {
            iteration_scope.define(name, value)?;
        }
        Ok(loop_step(
            self.eval_block(body, &iteration_scope, frame).await?,
        ))
    }

    fn eval_func_decl(&self, def: &Arc<FuncDef>, scope: &Arc<Scope>) -> EvalResult<StatementResult> {
        let name = def.name.as_deref().ok_or_else(|| {
            EvalError::InvalidOperation("function declaration without a name".to_string())
        })?;
        let func = self.make_closure(def, scope, false);
        scope.define(name, func.clone())?;
        Ok(StatementResult::Value(func))
    }

    async fn eval_return(&self, values: &[Expr], scope: &Arc<Scope>) -> EvalResult<Value> {
        match values {
            [] => Ok(Value::Nil),
            [single] => self.eval_expr(single, scope).await,
            many => {
                let mut evaluated = Vec::with_capacity(many.len());
                for value in many {
                    evaluated.push(self.eval_expr(value, scope).await?);
                }
                Ok(Value::list(evaluated))
            }
        }
    }

    /// Script-level errors raised by the body are caught; interrupts and fatal
    /// errors pass through. `finally` always runs and its own failure or
    /// control flow takes precedence.
    async fn eval_try(
        &self,
        body: &Block,
        catch_var: Option<&str>,
        catch_block: Option<&Block>,
        finally_block: Option<&Block>,
        scope: &Arc<Scope>,
        frame: &Frame,
    ) -> EvalResult<StatementResult> {
        let mut result = self.eval_scoped_block(body, scope, frame).await;
        let caught = match (&result, catch_block) {
            (Err(error), Some(_)) if error.is_catchable() => Some(error.to_value()),
            _ => None,
        };
        if let (Some(error_value), Some(catch_block)) = (caught, catch_block) {
            let catch_scope = scope.new_child()?;
            if let Some(name) = catch_var {
                catch_scope.define(name, error_value)?;
            }
            result = self.eval_block(catch_block, &catch_scope, frame).await;
        }
        if let Some(finally_block) = finally_block {
            let outcome = self.eval_scoped_block(finally_block, scope, frame).await?;
            if let StatementResult::Control(_) = outcome {
                return Ok(outcome);
            }
        }
        result
    }

    async fn eval_module(
        &self,
        name: &str,
        body: &Block,
        scope: &Arc<Scope>,
    ) -> EvalResult<StatementResult> {
        let module_scope = scope.new_child()?;
        let frame = Frame::default();
        let result = self.eval_block(body, &module_scope, &frame).await;
        if let StatementResult::Control(flow) = self.run_defers(&frame, result).await? {
            return Err(EvalError::InvalidOperation(format!(
                "{} is not allowed in module {}",
                flow, name
            )));
        }
        scope.define_package(name, module_scope)?;
        unit()
    }

    pub(crate) async fn eval_channel(&self, expr: &Expr, scope: &Arc<Scope>) -> EvalResult<ChanRef> {
        match self.eval_expr(expr, scope).await? {
            Value::Chan(chan) => Ok(chan),
            other => Err(EvalError::InvalidOperation(format!(
                "channel operation on non-channel type {}",
                other.type_name()
            ))),
        }
    }

    /// Callee and arguments of a `defer`/`go` operand, evaluated now.
    async fn eval_call_parts(
        &self,
        expr: &Expr,
        scope: &Arc<Scope>,
        keyword: &str,
    ) -> EvalResult<(Value, Vec<Value>, bool)> {
        let ExprKind::Call {
            callee,
            args,
            spread,
        } = &expr.kind
        else {
            return Err(EvalError::InvalidOperation(format!(
                "{} requires a function call",
                keyword
            )));
        };
        let callee = self.eval_expr(callee, scope).await?;
        let args = self.eval_args(args, scope).await?;
        Ok((callee, args, *spread))
    }
}
