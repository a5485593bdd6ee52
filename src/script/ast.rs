//! Syntax tree produced by the parser.
//!
//! The tree is immutable after parsing and is shared between executions
//! through `Arc<Program>`, so it holds no interpreter state.

use std::sync::Arc;

/// A parsed script.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// Statement with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        value: Expr,
    },
    /// `target = value;` where target is a name, index or member expression.
    Assign {
        target: Expr,
        value: Expr,
    },
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Fn(Arc<FnDecl>),
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Block(Vec<Stmt>),
}

/// A function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// Expression with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    /// Height of the tree rooted here; leaves are 1.
    pub depth: usize,
}

impl Expr {
    /// Wrap `kind`, computing the depth from its direct children.
    pub fn new(kind: ExprKind, line: u32) -> Self {
        let children = match &kind {
            ExprKind::Array(items) | ExprKind::Call(_, items) => {
                items.iter().map(|e| e.depth).max().unwrap_or(0)
            }
            ExprKind::Object(entries) => entries.iter().map(|(_, e)| e.depth).max().unwrap_or(0),
            _ => 0,
        };
        let operands = match &kind {
            ExprKind::Unary(_, e) | ExprKind::Member(e, _) | ExprKind::Call(e, _) => e.depth,
            ExprKind::Binary(_, l, r)
            | ExprKind::And(l, r)
            | ExprKind::Or(l, r)
            | ExprKind::Index(l, r) => l.depth.max(r.depth),
            _ => 0,
        };
        Self {
            kind,
            line,
            depth: 1 + children.max(operands),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
}

impl ExprKind {
    /// Whether this expression may appear on the left of `=`.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            ExprKind::Ident(_) | ExprKind::Index(..) | ExprKind::Member(..)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
        }
    }
}
