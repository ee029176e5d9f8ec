//! Structural checks run before a script is accepted, and free-symbol analysis
//! for hosts that allow-list what scripts may touch.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::ast::{Block, Expr, ExprKind, FuncDef, Position, SelectOp, Stmt, StmtKind};
use crate::eval::scope::is_valid_identifier;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationKind {
    #[error("unbounded loop without break, return or throw")]
    UnboundedLoop,
    #[error("break outside of a loop, switch or select")]
    BreakOutsideLoop,
    #[error("continue outside of a loop")]
    ContinueOutsideLoop,
    #[error("defer requires a function call")]
    DeferNotCall,
    #[error("go requires a function call")]
    GoNotCall,
    #[error("invalid assignment target")]
    InvalidAssignTarget,
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("duplicate parameter '{0}'")]
    DuplicateParameter(String),
    #[error("variadic function without parameters")]
    VariadicWithoutParameters,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} at {position}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub position: Position,
}

type CheckResult = Result<(), ValidationError>;

/// Dry-run the tree's structure without evaluating anything.
pub fn validate(statements: &[Stmt]) -> CheckResult {
    Checker::default().block(statements)
}

fn exits(block: &[Stmt], nested: bool) -> bool {
    block.iter().any(|stmt| stmt_exits(stmt, nested))
}

// `nested`: a bare break here targets an inner loop, switch or select
fn stmt_exits(stmt: &Stmt, nested: bool) -> bool {
    match &stmt.kind {
        StmtKind::Break => !nested,
        StmtKind::Return(_) | StmtKind::Throw(_) => true,
        StmtKind::If {
            then_block,
            else_block,
            ..
        } => exits(then_block, nested) || else_block.as_ref().is_some_and(|b| exits(b, nested)),
        StmtKind::Switch { cases, default, .. } => {
            cases.iter().any(|case| exits(&case.body, true))
                || default.as_ref().is_some_and(|b| exits(b, true))
        }
        StmtKind::Select { cases, default } => {
            cases.iter().any(|case| exits(&case.body, true))
                || default.as_ref().is_some_and(|b| exits(b, true))
        }
        StmtKind::Loop { body, .. }
        | StmtKind::ForClause { body, .. }
        | StmtKind::ForIn { body, .. } => exits(body, true),
        StmtKind::Try {
            body,
            catch_block,
            finally_block,
            ..
        } => {
            exits(body, nested)
                || catch_block.as_ref().is_some_and(|b| exits(b, nested))
                || finally_block.as_ref().is_some_and(|b| exits(b, nested))
        }
        StmtKind::Block(body) => exits(body, nested),
        _ => false,
    }
}

fn is_assignable(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Member { .. }
    )
}

fn fail(kind: ValidationKind, position: Position) -> CheckResult {
    Err(ValidationError { kind, position })
}

#[derive(Default)]
struct Checker {
    loops: usize,
    breakables: usize,
}

impl Checker {
    fn block(&mut self, block: &[Stmt]) -> CheckResult {
        block.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn identifier(&self, name: &str, pos: Position) -> CheckResult {
        if is_valid_identifier(name) {
            Ok(())
        } else {
            fail(ValidationKind::InvalidIdentifier(name.to_string()), pos)
        }
    }

    fn target(&mut self, target: &Expr, pos: Position) -> CheckResult {
        if !is_assignable(target) {
            return fail(ValidationKind::InvalidAssignTarget, pick(target.pos, pos));
        }
        self.expr(target, pos)
    }

    fn nested(&mut self, block: &[Stmt], is_loop: bool) -> CheckResult {
        self.breakables += 1;
        self.loops += usize::from(is_loop);
        let result = self.block(block);
        self.breakables -= 1;
        self.loops -= usize::from(is_loop);
        result
    }

    fn detached(&mut self, block: &[Stmt]) -> CheckResult {
        let saved = (self.loops, self.breakables);
        self.loops = 0;
        self.breakables = 0;
        let result = self.block(block);
        (self.loops, self.breakables) = saved;
        result
    }

    fn func(&mut self, def: &FuncDef, pos: Position) -> CheckResult {
        if let Some(name) = &def.name {
            self.identifier(name, pos)?;
        }
        if def.variadic && def.params.is_empty() {
            return fail(ValidationKind::VariadicWithoutParameters, pos);
        }
        let mut seen = HashSet::new();
        for param in &def.params {
            self.identifier(param, pos)?;
            if !seen.insert(param.as_str()) {
                return fail(ValidationKind::DuplicateParameter(param.clone()), pos);
            }
        }
        self.detached(&def.body)
    }

    fn stmt(&mut self, stmt: &Stmt) -> CheckResult {
        let pos = stmt.pos;
        match &stmt.kind {
            StmtKind::Expr(expr) | StmtKind::Throw(expr) => self.expr(expr, pos),
            StmtKind::Var { names, values } => {
                for name in names {
                    self.identifier(name, pos)?;
                }
                self.exprs(values, pos)
            }
            StmtKind::Assign { targets, values } => {
                for target in targets {
                    self.target(target, pos)?;
                }
                self.exprs(values, pos)
            }
            StmtKind::OpAssign { target, value, .. } => {
                self.target(target, pos)?;
                self.expr(value, pos)
            }
            StmtKind::If {
                condition,
                then_block,
                else_block,
            } => {
                self.expr(condition, pos)?;
                self.block(then_block)?;
                match else_block {
                    Some(block) => self.block(block),
                    None => Ok(()),
                }
            }
            StmtKind::Switch {
                discriminant,
                cases,
                default,
            } => {
                self.expr(discriminant, pos)?;
                for case in cases {
                    self.exprs(&case.values, pos)?;
                    self.nested(&case.body, false)?;
                }
                match default {
                    Some(block) => self.nested(block, false),
                    None => Ok(()),
                }
            }
            StmtKind::Select { cases, default } => {
                for case in cases {
                    match &case.op {
                        SelectOp::Recv { channel, value, ok } => {
                            self.expr(channel, pos)?;
                            for name in value.iter().chain(ok.iter()) {
                                self.identifier(name, pos)?;
                            }
                        }
                        SelectOp::Send { channel, value } => {
                            self.expr(channel, pos)?;
                            self.expr(value, pos)?;
                        }
                    }
                    self.nested(&case.body, false)?;
                }
                match default {
                    Some(block) => self.nested(block, false),
                    None => Ok(()),
                }
            }
            StmtKind::Loop { condition, body } => {
                match condition {
                    Some(condition) => self.expr(condition, pos)?,
                    None if !exits(body, false) => return fail(ValidationKind::UnboundedLoop, pos),
                    None => {}
                }
                self.nested(body, true)
            }
            StmtKind::ForClause {
                init,
                condition,
                post,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                match condition {
                    Some(condition) => self.expr(condition, pos)?,
                    None if !exits(body, false) => return fail(ValidationKind::UnboundedLoop, pos),
                    None => {}
                }
                if let Some(post) = post {
                    self.stmt(post)?;
                }
                self.nested(body, true)
            }
            StmtKind::ForIn {
                vars,
                iterable,
                body,
            } => {
                for var in vars {
                    self.identifier(var, pos)?;
                }
                self.expr(iterable, pos)?;
                self.nested(body, true)
            }
            StmtKind::Func(def) => self.func(def, pos),
            StmtKind::Return(values) => self.exprs(values, pos),
            StmtKind::Break if self.breakables == 0 => fail(ValidationKind::BreakOutsideLoop, pos),
            StmtKind::Continue if self.loops == 0 => fail(ValidationKind::ContinueOutsideLoop, pos),
            StmtKind::Break | StmtKind::Continue => Ok(()),
            StmtKind::Try {
                body,
                catch_var,
                catch_block,
                finally_block,
            } => {
                self.block(body)?;
                if let Some(name) = catch_var {
                    self.identifier(name, pos)?;
                }
                for block in catch_block.iter().chain(finally_block.iter()) {
                    self.block(block)?;
                }
                Ok(())
            }
            StmtKind::Defer(call) | StmtKind::Go(call) => {
                if !matches!(call.kind, ExprKind::Call { .. }) {
                    let kind = match &stmt.kind {
                        StmtKind::Defer(_) => ValidationKind::DeferNotCall,
                        _ => ValidationKind::GoNotCall,
                    };
                    return fail(kind, pos);
                }
                self.expr(call, pos)
            }
            StmtKind::Module { name, body } => {
                self.identifier(name, pos)?;
                self.detached(body)
            }
            StmtKind::Send { channel, value } => {
                self.expr(channel, pos)?;
                self.expr(value, pos)
            }
            StmtKind::Block(body) => self.block(body),
        }
    }

    fn exprs(&mut self, exprs: &[Expr], pos: Position) -> CheckResult {
        exprs.iter().try_for_each(|expr| self.expr(expr, pos))
    }

    fn expr(&mut self, expr: &Expr, pos: Position) -> CheckResult {
        let pos = pick(expr.pos, pos);
        match &expr.kind {
            ExprKind::Literal(_) => Ok(()),
            ExprKind::Ident(name) => self.identifier(name, pos),
            ExprKind::Binary { left, right, .. }
            | ExprKind::NilCoalesce { left, right }
            | ExprKind::In {
                item: left,
                container: right,
            }
            | ExprKind::Index {
                object: left,
                index: right,
            } => {
                self.expr(left, pos)?;
                self.expr(right, pos)
            }
            ExprKind::Unary { operand, .. } | ExprKind::Recv(operand) => self.expr(operand, pos),
            ExprKind::Member { object, .. } => self.expr(object, pos),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.expr(condition, pos)?;
                self.expr(then_expr, pos)?;
                self.expr(else_expr, pos)
            }
            ExprKind::Slice { object, start, end } => {
                self.expr(object, pos)?;
                for bound in start.iter().chain(end.iter()) {
                    self.expr(bound, pos)?;
                }
                Ok(())
            }
            ExprKind::Call { callee, args, .. } => {
                self.expr(callee, pos)?;
                self.exprs(args, pos)
            }
            ExprKind::Func(def) => self.func(def, pos),
            ExprKind::List { items, .. } => self.exprs(items, pos),
            ExprKind::Map { entries, .. } => entries.iter().try_for_each(|(key, value)| {
                self.expr(key, pos)?;
                self.expr(value, pos)
            }),
            ExprKind::Update { target, .. } => self.target(target, pos),
            ExprKind::Make { args, .. } => self.exprs(args, pos),
            ExprKind::New(_) => Ok(()),
        }
    }
}

fn pick(own: Position, fallback: Position) -> Position {
    if own.is_known() {
        own
    } else {
        fallback
    }
}

/// Free identifiers the script reads or calls: names it uses without binding
/// them first, plus packages it reaches into. Sorted and deduplicated.
pub fn referenced_symbols(statements: &[Stmt]) -> Vec<String> {
    let mut collector = Collector::default();
    collector.scoped(statements, &[]);
    collector.found.into_iter().collect()
}

#[derive(Default)]
struct Collector {
    scopes: Vec<HashSet<String>>,
    found: BTreeSet<String>,
}

impl Collector {
    fn declare(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn reference(&mut self, name: &str) {
        if !self.is_bound(name) {
            self.found.insert(name.to_string());
        }
    }

    // function declarations are visible to the whole block
    fn scoped(&mut self, block: &[Stmt], bound: &[&str]) {
        self.scopes.push(bound.iter().map(|name| name.to_string()).collect());
        for stmt in block {
            match &stmt.kind {
                StmtKind::Func(def) => self.declare(def.display_name()),
                StmtKind::Module { name, .. } => self.declare(name),
                _ => {}
            }
        }
        for stmt in block {
            self.stmt(stmt);
        }
        self.scopes.pop();
    }

    fn opt_block(&mut self, block: &Option<Block>) {
        if let Some(block) = block {
            self.scoped(block, &[]);
        }
    }

    fn func(&mut self, def: &Arc<FuncDef>) {
        let mut bound: Vec<&str> = def.params.iter().map(String::as_str).collect();
        if let Some(name) = &def.name {
            bound.push(name);
        }
        self.scoped(&def.body, &bound);
    }

    fn assign_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Ident(name) => {
                if !self.is_bound(name) {
                    self.declare(name);
                }
            }
            _ => self.expr(target),
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) | StmtKind::Throw(expr) | StmtKind::Defer(expr) | StmtKind::Go(expr) => {
                self.expr(expr)
            }
            StmtKind::Var { names, values } => {
                values.iter().for_each(|value| self.expr(value));
                names.iter().for_each(|name| self.declare(name));
            }
            StmtKind::Assign { targets, values } => {
                values.iter().for_each(|value| self.expr(value));
                targets.iter().for_each(|target| self.assign_target(target));
            }
            StmtKind::OpAssign { target, value, .. } => {
                self.expr(value);
                self.expr(target);
            }
            StmtKind::If {
                condition,
                then_block,
                else_block,
            } => {
                self.expr(condition);
                self.scoped(then_block, &[]);
                self.opt_block(else_block);
            }
            StmtKind::Switch {
                discriminant,
                cases,
                default,
            } => {
                self.expr(discriminant);
                for case in cases {
                    case.values.iter().for_each(|value| self.expr(value));
                    self.scoped(&case.body, &[]);
                }
                self.opt_block(default);
            }
            StmtKind::Select { cases, default } => {
                for case in cases {
                    match &case.op {
                        SelectOp::Recv { channel, value, ok } => {
                            self.expr(channel);
                            let bound: Vec<&str> =
                                value.iter().chain(ok.iter()).map(String::as_str).collect();
                            self.scoped(&case.body, &bound);
                        }
                        SelectOp::Send { channel, value } => {
                            self.expr(channel);
                            self.expr(value);
                            self.scoped(&case.body, &[]);
                        }
                    }
                }
                self.opt_block(default);
            }
            StmtKind::Loop { condition, body } => {
                if let Some(condition) = condition {
                    self.expr(condition);
                }
                self.scoped(body, &[]);
            }
            StmtKind::ForClause {
                init,
                condition,
                post,
                body,
            } => {
                self.scopes.push(HashSet::new());
                if let Some(init) = init {
                    self.stmt(init);
                }
                if let Some(condition) = condition {
                    self.expr(condition);
                }
                if let Some(post) = post {
                    self.stmt(post);
                }
                self.scoped(body, &[]);
                self.scopes.pop();
            }
            StmtKind::ForIn {
                vars,
                iterable,
                body,
            } => {
                self.expr(iterable);
                let bound: Vec<&str> = vars.iter().map(String::as_str).collect();
                self.scoped(body, &bound);
            }
            StmtKind::Func(def) => self.func(def),
            StmtKind::Return(values) => values.iter().for_each(|value| self.expr(value)),
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Try {
                body,
                catch_var,
                catch_block,
                finally_block,
            } => {
                self.scoped(body, &[]);
                if let Some(block) = catch_block {
                    let bound: Vec<&str> = catch_var.iter().map(String::as_str).collect();
                    self.scoped(block, &bound);
                }
                self.opt_block(finally_block);
            }
            StmtKind::Module { body, .. } => self.scoped(body, &[]),
            StmtKind::Send { channel, value } => {
                self.expr(channel);
                self.expr(value);
            }
            StmtKind::Block(body) => self.scoped(body, &[]),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::New(_) => {}
            ExprKind::Ident(name) => self.reference(name),
            ExprKind::Binary { left, right, .. }
            | ExprKind::NilCoalesce { left, right }
            | ExprKind::In {
                item: left,
                container: right,
            }
            | ExprKind::Index {
                object: left,
                index: right,
            } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Unary { operand, .. } | ExprKind::Recv(operand) => self.expr(operand),
            ExprKind::Member { object, .. } => self.expr(object),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.expr(condition);
                self.expr(then_expr);
                self.expr(else_expr);
            }
            ExprKind::Slice { object, start, end } => {
                self.expr(object);
                start.iter().chain(end.iter()).for_each(|bound| self.expr(bound));
            }
            ExprKind::Call { callee, args, .. } => {
                self.expr(callee);
                args.iter().for_each(|arg| self.expr(arg));
            }
            ExprKind::Func(def) => self.func(def),
            ExprKind::List { items, .. } => items.iter().for_each(|item| self.expr(item)),
            ExprKind::Map { entries, .. } => entries.iter().for_each(|(key, value)| {
                self.expr(key);
                self.expr(value);
            }),
            ExprKind::Update { target, .. } => self.expr(target),
            ExprKind::Make { args, .. } => args.iter().for_each(|arg| self.expr(arg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, SwitchCase};
    use pretty_assertions::assert_eq;

    fn kind_of(statements: &[Stmt]) -> Option<ValidationKind> {
        validate(statements).err().map(|error| error.kind)
    }

    #[test]
    fn test_unbounded_loop() {
        let spin = Stmt::while_loop(None, vec![Stmt::expr(Expr::int(1))]).at(3, 1);
        let err = validate(&[spin]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::UnboundedLoop);
        assert_eq!(err.position, Position::new(3, 1));

        let with_break = Stmt::while_loop(
            None,
            vec![Stmt::if_else(Expr::bool(true), vec![Stmt::brk()], None)],
        );
        assert_eq!(kind_of(&[with_break]), None);

        // break inside a switch only leaves the switch
        let switch_break = Stmt::while_loop(
            None,
            vec![Stmt::switch(
                Expr::int(1),
                vec![SwitchCase {
                    values: vec![Expr::int(1)],
                    body: vec![Stmt::brk()],
                }],
                None,
            )],
        );
        assert_eq!(kind_of(&[switch_break]), Some(ValidationKind::UnboundedLoop));

        let conditional = Stmt::while_loop(Some(Expr::bool(true)), vec![]);
        assert_eq!(kind_of(&[conditional]), None);
    }

    #[test]
    fn test_control_flow_placement() {
        assert_eq!(kind_of(&[Stmt::brk()]), Some(ValidationKind::BreakOutsideLoop));
        assert_eq!(kind_of(&[Stmt::cont()]), Some(ValidationKind::ContinueOutsideLoop));
        let in_closure = Stmt::for_in(
            &["x"],
            Expr::ident("xs"),
            vec![Stmt::expr(Expr::func(&[], vec![Stmt::brk()]))],
        );
        assert_eq!(kind_of(&[in_closure]), Some(ValidationKind::BreakOutsideLoop));
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(kind_of(&[Stmt::defer(Expr::ident("f"))]), Some(ValidationKind::DeferNotCall));
        assert_eq!(kind_of(&[Stmt::go(Expr::int(1))]), Some(ValidationKind::GoNotCall));
        assert_eq!(
            kind_of(&[Stmt::assign(Expr::int(1), Expr::int(2))]),
            Some(ValidationKind::InvalidAssignTarget)
        );
        assert_eq!(
            kind_of(&[Stmt::var("1a", Expr::nil())]),
            Some(ValidationKind::InvalidIdentifier("1a".to_string()))
        );
        assert_eq!(
            kind_of(&[Stmt::func("f", &["a", "a"], vec![])]),
            Some(ValidationKind::DuplicateParameter("a".to_string()))
        );
        assert_eq!(
            kind_of(&[Stmt::variadic_func("f", &[], vec![])]),
            Some(ValidationKind::VariadicWithoutParameters)
        );
    }

    #[test]
    fn test_referenced_symbols() {
        let script = vec![
            Stmt::assign_to("total", Expr::int(0)),
            Stmt::func(
                "add",
                &["n"],
                vec![Stmt::op_assign(Expr::ident("total"), BinaryOp::Add, Expr::ident("n"))],
            ),
            Stmt::for_in(
                &["x"],
                Expr::call(Expr::ident("fetch"), vec![Expr::ident("limit")]),
                vec![Stmt::expr(Expr::call(Expr::ident("add"), vec![Expr::ident("x")]))],
            ),
            Stmt::expr(Expr::call(Expr::member(Expr::ident("strings"), "Join"), vec![])),
        ];
        assert_eq!(referenced_symbols(&script), vec!["fetch", "limit", "strings"]);
    }
}
