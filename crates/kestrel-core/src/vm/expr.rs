//! Expression trees.
//!
//! Expressions are immutable, `Arc`-shared nodes. The evaluator never
//! walks them recursively: each node becomes a code frame whose seq-id
//! tracks how far its evaluation has progressed.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::mantra::Function;

/// A literal embedded in the tree. Strings materialize a fresh heap value
/// at each evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    /// Name of the operator-overload slot a user object may provide.
    #[must_use]
    pub fn slot_name(self) -> &'static str {
        match self {
            BinOp::Add => "__add__",
            BinOp::Sub => "__sub__",
            BinOp::Mul => "__mul__",
            BinOp::Div => "__div__",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// Applies the relation to an already-computed ordering.
    #[must_use]
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Const),
    /// Variable read, resolved dynamically: dynamic binds, then function
    /// variables, then module globals, then space exports.
    Name(String),
    Assign {
        target: String,
        value: Arc<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Arc<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
    },
    /// Short-circuit conjunction; yields a boolean.
    And {
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
    },
    /// Short-circuit disjunction; yields a boolean.
    Or {
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
    },
    Ternary {
        cond: Arc<Expr>,
        on_true: Arc<Expr>,
        on_false: Arc<Expr>,
    },
    Call {
        callee: Arc<Expr>,
        args: Vec<Arc<Expr>>,
    },
    /// Closure materialization point for a declared function.
    Closure(Arc<Function>),
}
