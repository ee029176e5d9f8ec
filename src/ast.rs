use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// Source location attached by the parser
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

pub type Block = Vec<Stmt>;

// 文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(Expr),
    /// `var a, b = x, y` always binds in the current scope
    Var {
        names: Vec<String>,
        values: Vec<Expr>,
    },
    /// `a, b = x, y` mutates the nearest binding, defining it locally if absent
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
    },
    OpAssign {
        target: Expr,
        op: BinaryOp,
        value: Expr,
    },
    If {
        condition: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    Switch {
        discriminant: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Block>,
    },
    Select {
        cases: Vec<SelectCase>,
        default: Option<Block>,
    },
    /// `for { }` and `for cond { }`
    Loop {
        condition: Option<Expr>,
        body: Block,
    },
    /// `for init; cond; post { }`
    ForClause {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Block,
    },
    /// `for k, v in iterable { }`
    ForIn {
        vars: Vec<String>,
        iterable: Expr,
        body: Block,
    },
    Func(Arc<FuncDef>),
    Return(Vec<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Try {
        body: Block,
        catch_var: Option<String>,
        catch_block: Option<Block>,
        finally_block: Option<Block>,
    },
    Defer(Expr),
    Module {
        name: String,
        body: Block,
    },
    Go(Expr),
    Send {
        channel: Expr,
        value: Expr,
    },
    Block(Block),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub values: Vec<Expr>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectCase {
    pub op: SelectOp,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectOp {
    Recv {
        channel: Expr,
        value: Option<String>,
        ok: Option<String>,
    },
    Send {
        channel: Expr,
        value: Expr,
    },
}

// 式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    Ident(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    NilCoalesce {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        object: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    /// `spread` expands the final argument: `f(a, rest...)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        spread: bool,
    },
    Func(Arc<FuncDef>),
    List {
        elem_type: Option<TypeExpr>,
        items: Vec<Expr>,
    },
    Map {
        types: Option<(TypeExpr, TypeExpr)>,
        entries: Vec<(Expr, Expr)>,
    },
    In {
        item: Box<Expr>,
        container: Box<Expr>,
    },
    Update {
        target: Box<Expr>,
        op: UpdateOp,
    },
    Recv(Box<Expr>),
    Make {
        ty: TypeExpr,
        args: Vec<Expr>,
    },
    New(TypeExpr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub variadic: bool,
    pub body: Block,
}

impl FuncDef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

// 型式 (make/new/型付きリテラル用)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    Named(String),
    Slice(Box<TypeExpr>),
    Array(Box<TypeExpr>, usize),
    Map(Box<TypeExpr>, Box<TypeExpr>),
    Chan(Box<TypeExpr>),
}

impl TypeExpr {
    pub fn named(name: &str) -> Self {
        TypeExpr::Named(name.to_string())
    }

    pub fn slice(elem: TypeExpr) -> Self {
        TypeExpr::Slice(Box::new(elem))
    }

    pub fn array(elem: TypeExpr, len: usize) -> Self {
        TypeExpr::Array(Box::new(elem), len)
    }

    pub fn map(key: TypeExpr, value: TypeExpr) -> Self {
        TypeExpr::Map(Box::new(key), Box::new(value))
    }

    pub fn chan(elem: TypeExpr) -> Self {
        TypeExpr::Chan(Box::new(elem))
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Named(name) => write!(f, "{}", name),
            TypeExpr::Slice(elem) => write!(f, "[]{}", elem),
            TypeExpr::Array(elem, len) => write!(f, "[{}]{}", len, elem),
            TypeExpr::Map(key, value) => write!(f, "map[{}]{}", key, value),
            TypeExpr::Chan(elem) => write!(f, "chan {}", elem),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UnaryOp {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "^")]
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UpdateOp {
    #[strum(serialize = "++")]
    Inc,
    #[strum(serialize = "--")]
    Dec,
}

impl From<StmtKind> for Stmt {
    fn from(kind: StmtKind) -> Self {
        Stmt {
            kind,
            pos: Position::default(),
        }
    }
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Self {
        Expr {
            kind,
            pos: Position::default(),
        }
    }
}

impl From<Expr> for Stmt {
    fn from(expr: Expr) -> Self {
        let pos = expr.pos;
        Stmt {
            kind: StmtKind::Expr(expr),
            pos,
        }
    }
}

// Builders for hosts that assemble trees directly
impl Expr {
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.pos = Position::new(line, column);
        self
    }

    pub fn nil() -> Self {
        ExprKind::Literal(Literal::Nil).into()
    }

    pub fn bool(value: bool) -> Self {
        ExprKind::Literal(Literal::Bool(value)).into()
    }

    pub fn int(value: i64) -> Self {
        ExprKind::Literal(Literal::Int(value)).into()
    }

    pub fn float(value: f64) -> Self {
        ExprKind::Literal(Literal::Float(value)).into()
    }

    pub fn string(value: &str) -> Self {
        ExprKind::Literal(Literal::String(value.to_string())).into()
    }

    pub fn ident(name: &str) -> Self {
        ExprKind::Ident(name.to_string()).into()
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
        .into()
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        ExprKind::Unary {
            op,
            operand: Box::new(operand),
        }
        .into()
    }

    pub fn ternary(condition: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        ExprKind::Ternary {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        }
        .into()
    }

    pub fn coalesce(left: Expr, right: Expr) -> Self {
        ExprKind::NilCoalesce {
            left: Box::new(left),
            right: Box::new(right),
        }
        .into()
    }

    pub fn member(object: Expr, name: &str) -> Self {
        ExprKind::Member {
            object: Box::new(object),
            name: name.to_string(),
        }
        .into()
    }

    pub fn index(object: Expr, index: Expr) -> Self {
        ExprKind::Index {
            object: Box::new(object),
            index: Box::new(index),
        }
        .into()
    }

    pub fn slice(object: Expr, start: Option<Expr>, end: Option<Expr>) -> Self {
        ExprKind::Slice {
            object: Box::new(object),
            start: start.map(Box::new),
            end: end.map(Box::new),
        }
        .into()
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        ExprKind::Call {
            callee: Box::new(callee),
            args,
            spread: false,
        }
        .into()
    }

    pub fn call_spread(callee: Expr, args: Vec<Expr>) -> Self {
        ExprKind::Call {
            callee: Box::new(callee),
            args,
            spread: true,
        }
        .into()
    }

    pub fn func(params: &[&str], body: Block) -> Self {
        ExprKind::Func(Arc::new(FuncDef {
            name: None,
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic: false,
            body,
        }))
        .into()
    }

    pub fn func_def(def: FuncDef) -> Self {
        ExprKind::Func(Arc::new(def)).into()
    }

    pub fn list(items: Vec<Expr>) -> Self {
        ExprKind::List {
            elem_type: None,
            items,
        }
        .into()
    }

    pub fn typed_list(elem_type: TypeExpr, items: Vec<Expr>) -> Self {
        ExprKind::List {
            elem_type: Some(elem_type),
            items,
        }
        .into()
    }

    pub fn map(entries: Vec<(Expr, Expr)>) -> Self {
        ExprKind::Map {
            types: None,
            entries,
        }
        .into()
    }

    pub fn typed_map(key: TypeExpr, value: TypeExpr, entries: Vec<(Expr, Expr)>) -> Self {
        ExprKind::Map {
            types: Some((key, value)),
            entries,
        }
        .into()
    }

    pub fn contains(item: Expr, container: Expr) -> Self {
        ExprKind::In {
            item: Box::new(item),
            container: Box::new(container),
        }
        .into()
    }

    pub fn update(target: Expr, op: UpdateOp) -> Self {
        ExprKind::Update {
            target: Box::new(target),
            op,
        }
        .into()
    }

    pub fn recv(channel: Expr) -> Self {
        ExprKind::Recv(Box::new(channel)).into()
    }

    pub fn make(ty: TypeExpr, args: Vec<Expr>) -> Self {
        ExprKind::Make { ty, args }.into()
    }

    pub fn new_of(ty: TypeExpr) -> Self {
        ExprKind::New(ty).into()
    }
}

impl Stmt {
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.pos = Position::new(line, column);
        self
    }

    pub fn expr(expr: Expr) -> Self {
        expr.into()
    }

    pub fn var(name: &str, value: Expr) -> Self {
        StmtKind::Var {
            names: vec![name.to_string()],
            values: vec![value],
        }
        .into()
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        StmtKind::Assign {
            targets: vec![target],
            values: vec![value],
        }
        .into()
    }

    pub fn assign_to(name: &str, value: Expr) -> Self {
        Self::assign(Expr::ident(name), value)
    }

    pub fn assign_many(targets: Vec<Expr>, values: Vec<Expr>) -> Self {
        StmtKind::Assign { targets, values }.into()
    }

    pub fn op_assign(target: Expr, op: BinaryOp, value: Expr) -> Self {
        StmtKind::OpAssign { target, op, value }.into()
    }

    pub fn if_else(condition: Expr, then_block: Block, else_block: Option<Block>) -> Self {
        StmtKind::If {
            condition,
            then_block,
            else_block,
        }
        .into()
    }

    pub fn while_loop(condition: Option<Expr>, body: Block) -> Self {
        StmtKind::Loop { condition, body }.into()
    }

    pub fn for_clause(
        init: Option<Stmt>,
        condition: Option<Expr>,
        post: Option<Stmt>,
        body: Block,
    ) -> Self {
        StmtKind::ForClause {
            init: init.map(Box::new),
            condition,
            post: post.map(Box::new),
            body,
        }
        .into()
    }

    pub fn for_in(vars: &[&str], iterable: Expr, body: Block) -> Self {
        StmtKind::ForIn {
            vars: vars.iter().map(|v| v.to_string()).collect(),
            iterable,
            body,
        }
        .into()
    }

    pub fn func(name: &str, params: &[&str], body: Block) -> Self {
        StmtKind::Func(Arc::new(FuncDef {
            name: Some(name.to_string()),
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic: false,
            body,
        }))
        .into()
    }

    pub fn variadic_func(name: &str, params: &[&str], body: Block) -> Self {
        StmtKind::Func(Arc::new(FuncDef {
            name: Some(name.to_string()),
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic: true,
            body,
        }))
        .into()
    }

    pub fn ret(value: Expr) -> Self {
        StmtKind::Return(vec![value]).into()
    }

    pub fn ret_many(values: Vec<Expr>) -> Self {
        StmtKind::Return(values).into()
    }

    pub fn brk() -> Self {
        StmtKind::Break.into()
    }

    pub fn cont() -> Self {
        StmtKind::Continue.into()
    }

    pub fn throw(value: Expr) -> Self {
        StmtKind::Throw(value).into()
    }

    pub fn try_catch(
        body: Block,
        catch_var: Option<&str>,
        catch_block: Option<Block>,
        finally_block: Option<Block>,
    ) -> Self {
        StmtKind::Try {
            body,
            catch_var: catch_var.map(str::to_string),
            catch_block,
            finally_block,
        }
        .into()
    }

    pub fn defer(call: Expr) -> Self {
        StmtKind::Defer(call).into()
    }

    pub fn go(call: Expr) -> Self {
        StmtKind::Go(call).into()
    }

    pub fn send(channel: Expr, value: Expr) -> Self {
        StmtKind::Send { channel, value }.into()
    }

    pub fn module(name: &str, body: Block) -> Self {
        StmtKind::Module {
            name: name.to_string(),
            body,
        }
        .into()
    }

    pub fn switch(discriminant: Expr, cases: Vec<SwitchCase>, default: Option<Block>) -> Self {
        StmtKind::Switch {
            discriminant,
            cases,
            default,
        }
        .into()
    }

    pub fn select(cases: Vec<SelectCase>, default: Option<Block>) -> Self {
        StmtKind::Select { cases, default }.into()
    }

    pub fn block(body: Block) -> Self {
        StmtKind::Block(body).into()
    }
}
