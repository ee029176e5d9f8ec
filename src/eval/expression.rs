use std::sync::Arc;

use async_recursion::async_recursion;

use super::{
    bridge::{convert, make, make_size, resolve_type, HostType},
    evaluator::{EvalError, EvalResult, Evaluator},
    operators::{binary_op, equal, repeat_operands, unary_op, update},
    scope::Scope,
    value::{ListValue, MapValue, Value},
};
use crate::ast::{BinaryOp, Expr, ExprKind, Literal, TypeExpr, UpdateOp};

fn index_number(index: &Value) -> EvalResult<i64> {
    match index {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(*f as i64),
        other => Err(EvalError::IndexNotNumber {
            found: other.type_name(),
        }),
    }
}

fn checked_position(index: i64, len: usize) -> EvalResult<usize> {
    if index < 0 || index as usize >= len {
        return Err(EvalError::IndexOutOfRange { index, len });
    }
    Ok(index as usize)
}

/// `target[index]` for an already evaluated container. Missing map keys read as nil.
pub fn index_value(target: &Value, index: &Value) -> EvalResult<Value> {
    match target {
        Value::List(list) => {
            let position = checked_position(index_number(index)?, list.len())?;
            Ok(list.get(position).unwrap_or_default())
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let position = checked_position(index_number(index)?, chars.len())?;
            Ok(Value::String(chars[position].to_string()))
        }
        Value::Map(map) => Ok(map.get(index)?.unwrap_or_default()),
        Value::Handle(handle) => match index {
            Value::String(name) => handle.get_field(name),
            other => Err(EvalError::InvalidOperation(format!(
                "cannot index {} with {}",
                handle.type_name(),
                other.type_name()
            ))),
        },
        other => Err(EvalError::InvalidOperation(format!(
            "type {} does not support indexing",
            other.type_name()
        ))),
    }
}

/// `target.name` for an already evaluated value.
pub fn member_value(target: &Value, name: &str) -> EvalResult<Value> {
    match target {
        Value::Map(map) => Ok(map.get_str(name).unwrap_or_default()),
        Value::Handle(handle) => handle.get_field(name),
        other => Err(EvalError::InvalidOperation(format!(
            "type {} has no field or method {}",
            other.type_name(),
            name
        ))),
    }
}

fn slice_bound(bound: Option<Value>, default: usize, len: usize) -> EvalResult<i64> {
    let bound = match bound {
        Some(value) => index_number(&value)?,
        None => default as i64,
    };
    if bound < 0 || bound as usize > len {
        return Err(EvalError::IndexOutOfRange { index: bound, len });
    }
    Ok(bound)
}

/// `target[start:end]`. Bounds lie in `[0, len]`; the result keeps the source's element kind.
pub fn slice_value(target: &Value, start: Option<Value>, end: Option<Value>) -> EvalResult<Value> {
    let len = match target {
        Value::List(list) => list.len(),
        Value::String(text) => text.chars().count(),
        other => {
            return Err(EvalError::InvalidOperation(format!(
                "type {} does not support slicing",
                other.type_name()
            )))
        }
    };
    let start = slice_bound(start, 0, len)?;
    let end = slice_bound(end, len, len)?;
    if start > end {
        return Err(EvalError::InvalidSliceIndex { start, end });
    }
    let (start, end) = (start as usize, end as usize);
    match target {
        Value::List(list) => Ok(Value::List(Arc::new(ListValue::typed(
            list.range(start, end),
            list.elem_type().cloned(),
            false,
        )))),
        Value::String(text) => Ok(Value::String(
            text.chars().skip(start).take(end - start).collect(),
        )),
        _ => unreachable!("slice length computed for lists and strings only"),
    }
}

fn store_index(target: &Value, index: &Value, value: Value) -> EvalResult<()> {
    match target {
        Value::List(list) => list.store(index_number(index)?, value),
        Value::Map(map) => map.store(index, value),
        Value::Handle(handle) => match index {
            Value::String(name) => handle.set_field(name, value),
            other => Err(EvalError::InvalidOperation(format!(
                "cannot index {} with {}",
                handle.type_name(),
                other.type_name()
            ))),
        },
        other => Err(EvalError::InvalidOperation(format!(
            "cannot assign to an element of {}",
            other.type_name()
        ))),
    }
}

/// Where an assignment lands, with its container and key already evaluated.
pub(crate) enum Place {
    Name(String),
    Element { container: Value, index: Value },
    Field { container: Value, name: String },
    Package { package: Arc<Scope>, name: String },
}

impl Place {
    pub(crate) fn read(&self, scope: &Scope) -> EvalResult<Value> {
        match self {
            Place::Name(name) => scope.get(name),
            Place::Element { container, index } => index_value(container, index),
            Place::Field { container, name } => member_value(container, name),
            Place::Package { package, name } => package.get(name),
        }
    }

    pub(crate) fn write(&self, scope: &Scope, value: Value) -> EvalResult<()> {
        match self {
            Place::Name(name) => scope.assign(name, value),
            Place::Element { container, index } => store_index(container, index, value),
            Place::Field { container, name } => match container {
                Value::Map(map) => map.store(&Value::String(name.clone()), value),
                Value::Handle(handle) => handle.set_field(name, value),
                other => Err(EvalError::InvalidOperation(format!(
                    "cannot assign field {} of {}",
                    name,
                    other.type_name()
                ))),
            },
            Place::Package { package, name } => package.assign(name, value),
        }
    }
}

fn eval_literal(literal: &Literal) -> Value {
    match literal {
        Literal::Nil => Value::Nil,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::String(s.clone()),
    }
}

impl Evaluator {
    /// Evaluate one expression, accounting one cycle.
    #[async_recursion]
    pub async fn eval_expr(&self, expr: &Expr, scope: &Arc<Scope>) -> EvalResult<Value> {
        self.ctx.step().await?;
        self.dispatch_expr(expr, scope)
            .await
            .map_err(|error| error.at(expr.pos))
    }

    async fn dispatch_expr(&self, expr: &Expr, scope: &Arc<Scope>) -> EvalResult<Value> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(eval_literal(literal)),
            ExprKind::Ident(name) => scope.get(name),
            ExprKind::Binary { op, left, right } => self.eval_binary(*op, left, right, scope).await,
            ExprKind::Unary { op, operand } => unary_op(*op, &self.eval_expr(operand, scope).await?),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval_expr(condition, scope).await?.truthy() {
                    self.eval_expr(then_expr, scope).await
                } else {
                    self.eval_expr(else_expr, scope).await
                }
            }
            ExprKind::NilCoalesce { left, right } => {
                let value = self.eval_expr(left, scope).await?;
                if value.truthy() {
                    Ok(value)
                } else {
                    self.eval_expr(right, scope).await
                }
            }
            ExprKind::Member { object, name } => self.eval_member(object, name, scope).await,
            ExprKind::Index { object, index } => {
                let target = self.eval_expr(object, scope).await?;
                let index = self.eval_expr(index, scope).await?;
                index_value(&target, &index)
            }
            ExprKind::Slice { object, start, end } => {
                let target = self.eval_expr(object, scope).await?;
                let start = match start {
                    Some(start) => Some(self.eval_expr(start, scope).await?),
                    None => None,
                };
                let end = match end {
                    Some(end) => Some(self.eval_expr(end, scope).await?),
                    None => None,
                };
                slice_value(&target, start, end)
            }
            ExprKind::Call {
                callee,
                args,
                spread,
            } => {
                let callee = self.eval_expr(callee, scope).await?;
                let args = self.eval_args(args, scope).await?;
                self.call_value(callee, args, *spread).await
            }
            ExprKind::Func(def) => Ok(self.make_closure(def, scope, true)),
            ExprKind::List { elem_type, items } => {
                self.eval_list(elem_type.as_ref(), items, scope).await
            }
            ExprKind::Map { types, entries } => self.eval_map(types.as_ref(), entries, scope).await,
            ExprKind::In { item, container } => {
                let item = self.eval_expr(item, scope).await?;
                let container = self.eval_expr(container, scope).await?;
                contains(&item, &container)
            }
            ExprKind::Update { target, op } => self.eval_update(target, *op, scope).await,
            ExprKind::Recv(channel) => {
                let chan = self.eval_channel(channel, scope).await?;
                let (value, _) = chan.recv(self.ctx.cancel_signal()).await?;
                Ok(value)
            }
            ExprKind::Make { ty, args } => {
                let ty = resolve_type(ty, scope)?;
                let args = self.eval_args(args, scope).await?;
                match &ty {
                    HostType::Slice(elem) => {
                        let len = make_size(&args, 0)?;
                        let items = self.ctx.build(len, |_| Ok(elem.zero_value())).await?;
                        Ok(Value::List(Arc::new(ListValue::typed(
                            items,
                            Some(elem.as_ref().clone()),
                            false,
                        ))))
                    }
                    _ => make(&ty, &args),
                }
            }
            ExprKind::New(ty) => Ok(resolve_type(ty, scope)?.zero_value()),
        }
    }

    pub(crate) async fn eval_args(&self, args: &[Expr], scope: &Arc<Scope>) -> EvalResult<Vec<Value>> {
        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            evaluated.push(self.eval_expr(arg, scope).await?);
        }
        Ok(evaluated)
    }

    // && と || は右辺を評価しないことがある
    async fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        scope: &Arc<Scope>,
    ) -> EvalResult<Value> {
        let left = self.eval_expr(left, scope).await?;
        match op {
            BinaryOp::And if !left.truthy() => Ok(Value::Bool(false)),
            BinaryOp::Or if left.truthy() => Ok(Value::Bool(true)),
            BinaryOp::And | BinaryOp::Or => {
                Ok(Value::Bool(self.eval_expr(right, scope).await?.truthy()))
            }
            _ => {
                let right = self.eval_expr(right, scope).await?;
                self.combine(op, &left, &right).await
            }
        }
    }

    /// `binary_op`, except string repetition is built under the run's element ceiling.
    pub(crate) async fn combine(&self, op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
        match repeat_operands(op, left, right) {
            Some((text, count)) => self.ctx.repeat(text, count).await,
            None => binary_op(op, left, right),
        }
    }

    /// `pkg.name` resolves through the package namespace when `pkg` is not a variable.
    async fn eval_member(&self, object: &Expr, name: &str, scope: &Arc<Scope>) -> EvalResult<Value> {
        if let ExprKind::Ident(package) = &object.kind {
            if scope.lookup(package).is_none() {
                if let Some(package) = scope.get_package(package) {
                    return package.get(name);
                }
            }
        }
        let target = self.eval_expr(object, scope).await?;
        member_value(&target, name)
    }

    async fn eval_list(
        &self,
        elem_type: Option<&TypeExpr>,
        items: &[Expr],
        scope: &Arc<Scope>,
    ) -> EvalResult<Value> {
        let values = self.eval_args(items, scope).await?;
        let Some(elem_type) = elem_type else {
            return Ok(Value::list(values));
        };
        let elem_type = resolve_type(elem_type, scope)?;
        let values = values
            .into_iter()
            .map(|value| convert(value, &elem_type))
            .collect::<EvalResult<Vec<_>>>()?;
        Ok(Value::List(Arc::new(ListValue::typed(
            values,
            Some(elem_type),
            false,
        ))))
    }

    async fn eval_map(
        &self,
        types: Option<&(TypeExpr, TypeExpr)>,
        entries: &[(Expr, Expr)],
        scope: &Arc<Scope>,
    ) -> EvalResult<Value> {
        let map = match types {
            Some((key, value)) => {
                MapValue::new(Some(resolve_type(key, scope)?), Some(resolve_type(value, scope)?))
            }
            None => MapValue::new(None, None),
        };
        for (key, value) in entries {
            let key = self.eval_expr(key, scope).await?;
            let value = self.eval_expr(value, scope).await?;
            map.store(&key, value)?;
        }
        Ok(Value::Map(Arc::new(map)))
    }

    async fn eval_update(&self, target: &Expr, op: UpdateOp, scope: &Arc<Scope>) -> EvalResult<Value> {
        let place = self.eval_place(target, scope).await?;
        let updated = update(op, &place.read(scope)?)?;
        place.write(scope, updated.clone())?;
        Ok(updated)
    }

    /// Evaluate the container and key of an assignable expression once.
    pub(crate) async fn eval_place(&self, target: &Expr, scope: &Arc<Scope>) -> EvalResult<Place> {
        match &target.kind {
            ExprKind::Ident(name) => Ok(Place::Name(name.clone())),
            ExprKind::Index { object, index } => {
                let container = self.eval_expr(object, scope).await?;
                let index = self.eval_expr(index, scope).await?;
                Ok(Place::Element { container, index })
            }
            ExprKind::Member { object, name } => {
                if let ExprKind::Ident(package) = &object.kind {
                    if scope.lookup(package).is_none() {
                        if let Some(package) = scope.get_package(package) {
                            return Ok(Place::Package {
                                package,
                                name: name.clone(),
                            });
                        }
                    }
                }
                let container = self.eval_expr(object, scope).await?;
                Ok(Place::Field {
                    container,
                    name: name.clone(),
                })
            }
            _ => Err(EvalError::InvalidOperation(
                "left side of assignment is not assignable".to_string(),
            )),
        }
    }

    /// Write `value` through an assignable expression: a name, an element or a field.
    pub(crate) async fn assign_target(
        &self,
        target: &Expr,
        value: Value,
        scope: &Arc<Scope>,
    ) -> EvalResult<()> {
        self.eval_place(target, scope).await?.write(scope, value)
    }

    /// Evaluate a right-hand side that may report presence: `m[k]` on a map
    /// and `<-ch` yield `Some(ok)`, everything else `None`.
    pub(crate) async fn eval_comma_ok(
        &self,
        expr: &Expr,
        scope: &Arc<Scope>,
    ) -> EvalResult<(Value, Option<bool>)> {
        match &expr.kind {
            ExprKind::Index { object, index } => {
                self.ctx.step().await?;
                let target = self.eval_expr(object, scope).await?;
                let index = self.eval_expr(index, scope).await?;
                if let Value::Map(map) = &target {
                    let found = map.get(&index).map_err(|error| error.at(expr.pos))?;
                    let present = found.is_some();
                    return Ok((found.unwrap_or_default(), Some(present)));
                }
                let value = index_value(&target, &index).map_err(|error| error.at(expr.pos))?;
                Ok((value, None))
            }
            ExprKind::Recv(channel) => {
                self.ctx.step().await?;
                let chan = self.eval_channel(channel, scope).await?;
                let (value, ok) = chan.recv(self.ctx.cancel_signal()).await?;
                Ok((value, Some(ok)))
            }
            _ => Ok((self.eval_expr(expr, scope).await?, None)),
        }
    }
}

/// Membership for `in`: sequence elements, map keys, substrings.
pub fn contains(item: &Value, container: &Value) -> EvalResult<Value> {
    let found = match container {
        Value::List(list) => list.snapshot().iter().any(|element| equal(item, element)),
        Value::Map(map) => map.contains(item).unwrap_or(false),
        Value::String(text) => match item {
            Value::String(needle) => text.contains(needle.as_str()),
            other => text.contains(&other.to_string()),
        },
        Value::Nil => false,
        other => {
            return Err(EvalError::InvalidOperation(format!(
                "operator in not defined on {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::Bool(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;
    use crate::eval::context::ExecutionContext;
    use crate::eval::governor::CancelSignal;
    use pretty_assertions::assert_eq;

    fn setup() -> (Evaluator, Arc<Scope>) {
        let ctx = ExecutionContext::detached(CancelSignal::new());
        (Evaluator::new(Arc::new(ctx)), Scope::new())
    }

    async fn eval(expr: Expr) -> EvalResult<Value> {
        let (evaluator, scope) = setup();
        evaluator.eval_expr(&expr, &scope).await
    }

    fn abc() -> Expr {
        Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)])
    }

    #[tokio::test]
    async fn test_literal_evaluation() {
        assert_eq!(eval(Expr::int(42)).await.unwrap(), Value::Int(42));
        assert_eq!(eval(Expr::float(1.5)).await.unwrap(), Value::Float(1.5));
        assert_eq!(eval(Expr::string("s")).await.unwrap(), Value::string("s"));
        assert_eq!(eval(Expr::nil()).await.unwrap(), Value::Nil);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_failing_operand() {
        let missing = || Expr::call(Expr::ident("undefined_fn"), vec![]);
        let and = Expr::binary(BinaryOp::And, Expr::bool(false), missing());
        assert_eq!(eval(and).await.unwrap(), Value::Bool(false));
        let or = Expr::binary(BinaryOp::Or, Expr::bool(true), missing());
        assert_eq!(eval(or).await.unwrap(), Value::Bool(true));
        let evaluated = Expr::binary(BinaryOp::And, Expr::bool(true), missing());
        assert!(matches!(
            eval(evaluated).await.unwrap_err().root(),
            EvalError::UndefinedSymbol { name } if name == "undefined_fn"
        ));
    }

    #[tokio::test]
    async fn test_ternary_and_coalesce_evaluate_one_branch() {
        let ternary = Expr::ternary(Expr::int(0), Expr::ident("nope"), Expr::string("else"));
        assert_eq!(eval(ternary).await.unwrap(), Value::string("else"));

        for falsy in [Expr::nil(), Expr::string("0.0"), Expr::list(vec![]), Expr::int(0)] {
            let coalesce = Expr::coalesce(falsy, Expr::string("fallback"));
            assert_eq!(eval(coalesce).await.unwrap(), Value::string("fallback"));
        }
        let kept = Expr::coalesce(Expr::string("x"), Expr::ident("nope"));
        assert_eq!(eval(kept).await.unwrap(), Value::string("x"));
    }

    #[tokio::test]
    async fn test_slicing() {
        let ok = Expr::slice(abc(), Some(Expr::int(1)), Some(Expr::int(3)));
        assert_eq!(
            eval(ok).await.unwrap(),
            Value::list(vec![Value::Int(2), Value::Int(3)])
        );

        let reversed = Expr::slice(abc(), Some(Expr::int(3)), Some(Expr::int(2)));
        assert!(matches!(
            eval(reversed).await.unwrap_err().root(),
            EvalError::InvalidSliceIndex { start: 3, end: 2 }
        ));

        let past_end = Expr::slice(abc(), Some(Expr::int(4)), Some(Expr::int(4)));
        assert!(matches!(
            eval(past_end).await.unwrap_err().root(),
            EvalError::IndexOutOfRange { index: 4, len: 3 }
        ));

        let open = Expr::slice(Expr::string("héllo"), Some(Expr::int(1)), None);
        assert_eq!(eval(open).await.unwrap(), Value::string("éllo"));
    }

    #[tokio::test]
    async fn test_index_errors_are_distinct() {
        let out_of_range = Expr::index(abc(), Expr::int(3));
        assert!(matches!(
            eval(out_of_range).await.unwrap_err().root(),
            EvalError::IndexOutOfRange { .. }
        ));
        let not_number = Expr::index(abc(), Expr::string("a"));
        assert!(matches!(
            eval(not_number).await.unwrap_err().root(),
            EvalError::IndexNotNumber { .. }
        ));
        let missing_key = Expr::index(Expr::map(vec![]), Expr::string("z"));
        assert_eq!(eval(missing_key).await.unwrap(), Value::Nil);
    }

    #[tokio::test]
    async fn test_membership() {
        let in_list = Expr::contains(Expr::float(2.0), abc());
        assert_eq!(eval(in_list).await.unwrap(), Value::Bool(true));
        let in_map = Expr::contains(
            Expr::string("k"),
            Expr::map(vec![(Expr::string("k"), Expr::nil())]),
        );
        assert_eq!(eval(in_map).await.unwrap(), Value::Bool(true));
        let in_string = Expr::contains(Expr::string("ell"), Expr::string("hello"));
        assert_eq!(eval(in_string).await.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn test_typed_list_literal_converts() {
        let typed = Expr::typed_list(
            TypeExpr::named("float64"),
            vec![Expr::int(1), Expr::float(2.5)],
        );
        let value = eval(typed).await.unwrap();
        assert_eq!(value.type_name(), "[]float64");
        assert_eq!(value, Value::list(vec![Value::Float(1.0), Value::Float(2.5)]));

        let bad = Expr::typed_list(TypeExpr::named("int"), vec![Expr::string("x")]);
        assert!(matches!(
            eval(bad).await.unwrap_err().root(),
            EvalError::TypeMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_element_assignment_and_append() {
        let (evaluator, scope) = setup();
        evaluator
            .run(
                &[
                    Stmt::assign_to("a", abc()),
                    Stmt::assign(Expr::index(Expr::ident("a"), Expr::int(3)), Expr::int(4)),
                    Stmt::assign(Expr::index(Expr::ident("a"), Expr::int(0)), Expr::int(9)),
                ],
                &scope,
            )
            .await
            .unwrap();
        assert_eq!(
            scope.get("a").unwrap().to_string(),
            "[9 2 3 4]"
        );
    }

    #[tokio::test]
    async fn test_update_expression() {
        let (evaluator, scope) = setup();
        scope.define("n", Value::string("41")).unwrap();
        let result = evaluator
            .eval_expr(&Expr::update(Expr::ident("n"), UpdateOp::Inc), &scope)
            .await
            .unwrap();
        assert_eq!(result, Value::Int(42));
        assert_eq!(scope.get("n").unwrap(), Value::Int(42));
    }
}
