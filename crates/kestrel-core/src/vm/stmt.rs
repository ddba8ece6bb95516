//! Statement trees.

use std::sync::Arc;

use crate::vm::Expr;

#[derive(Debug, Clone)]
pub enum Stmt {
    /// Evaluate for effect; the value is discarded.
    Expr(Arc<Expr>),
    Block(Vec<Arc<Stmt>>),
    If {
        cond: Arc<Expr>,
        then_body: Arc<Stmt>,
        else_body: Option<Arc<Stmt>>,
    },
    While {
        cond: Arc<Expr>,
        body: Arc<Stmt>,
    },
    Return(Option<Arc<Expr>>),
    /// Binds the named module globals into the current frame, shadowing
    /// same-named locals for the rest of the frame.
    Global {
        names: Vec<String>,
        line: u32,
    },
    /// Runs `body`; if it raises, unwinds to this point, binds the error's
    /// rendering to `catch_var` and runs `handler`.
    Try {
        body: Arc<Stmt>,
        catch_var: String,
        handler: Arc<Stmt>,
    },
}
