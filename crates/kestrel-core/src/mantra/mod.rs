//! Mantras: the named, module-owned executable entities.
//!
//! A mantra is either a [`Function`] or a [`ClassDef`]. Functions carry a
//! variable map (parameters, locals, closed-over names), a declarative
//! signature, and a body that is either a native callable or a syntactic
//! tree executed by the VM. Classes are a constructor plus a method table
//! and a pending-static-init marker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::errors::{Error, RunResult};
use crate::item::{new_cell, Item, VarCell};
use crate::module::Module;
use crate::vm::{Stmt, VmContext};

/// Native function bodies run inside the calling context. They must either
/// call `ctx.return_frame(..)` themselves or push steps that eventually do.
pub type NativeFn = Arc<dyn Fn(&mut VmContext, usize) -> RunResult<()> + Send + Sync>;

/// Where a variable of a function lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSlot {
    /// nth parameter; stack slot `base + n`.
    Param(usize),
    /// nth local; stack slot `base + param_count + n`.
    Local(usize),
    /// Closed-over variable, satisfied by the enclosing closure's capture.
    Closed(usize),
}

/// Ordered variable declarations of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarMap {
    params: Vec<String>,
    locals: Vec<String>,
    closed: Vec<String>,
}

impl VarMap {
    pub fn add_param(&mut self, name: impl Into<String>) {
        self.params.push(name.into());
    }

    pub fn add_local(&mut self, name: impl Into<String>) {
        self.locals.push(name.into());
    }

    pub fn add_closed(&mut self, name: impl Into<String>) {
        self.closed.push(name.into());
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    #[must_use]
    pub fn locals(&self) -> &[String] {
        &self.locals
    }

    #[must_use]
    pub fn closed(&self) -> &[String] {
        &self.closed
    }

    /// Looks a name up, params first, then locals, then closed variables.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<VarSlot> {
        if let Some(i) = self.params.iter().position(|p| p == name) {
            return Some(VarSlot::Param(i));
        }
        if let Some(i) = self.locals.iter().position(|l| l == name) {
            return Some(VarSlot::Local(i));
        }
        if let Some(i) = self.closed.iter().position(|c| c == name) {
            return Some(VarSlot::Closed(i));
        }
        None
    }
}

/// The executable body of a function.
pub enum FuncBody {
    Native(NativeFn),
    Syntactic(Arc<Stmt>),
}

impl fmt::Debug for FuncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuncBody::Native(_) => f.write_str("Native(..)"),
            FuncBody::Syntactic(_) => f.write_str("Syntactic(..)"),
        }
    }
}

/// A callable unit: name, declared variables, signature, body.
#[derive(Debug)]
pub struct Function {
    name: String,
    line: u32,
    module: OnceLock<Weak<Module>>,
    method_of: Option<String>,
    eta: bool,
    signature: String,
    vars: VarMap,
    body: FuncBody,
}

impl Function {
    #[must_use]
    pub fn new(name: impl Into<String>, line: u32, body: FuncBody) -> Self {
        Function {
            name: name.into(),
            line,
            module: OnceLock::new(),
            method_of: None,
            eta: false,
            signature: String::new(),
            vars: VarMap::default(),
            body,
        }
    }

    /// Convenience constructor for host-provided callables.
    #[must_use]
    pub fn native(name: impl Into<String>, f: NativeFn) -> Self {
        Function::new(name, 0, FuncBody::Native(f))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn set_signature(&mut self, sig: impl Into<String>) {
        self.signature = sig.into();
    }

    #[must_use]
    pub fn is_eta(&self) -> bool {
        self.eta
    }

    pub fn set_eta(&mut self, eta: bool) {
        self.eta = eta;
    }

    #[must_use]
    pub fn method_of(&self) -> Option<&str> {
        self.method_of.as_deref()
    }

    pub fn set_method_of(&mut self, class: impl Into<String>) {
        self.method_of = Some(class.into());
    }

    #[must_use]
    pub fn vars(&self) -> &VarMap {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VarMap {
        &mut self.vars
    }

    #[must_use]
    pub fn body(&self) -> &FuncBody {
        &self.body
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.vars.param_count()
    }

    /// Binds the owning module. May be set once; later calls are ignored
    /// (a function never migrates between modules).
    pub fn set_module(&self, module: &Arc<Module>) {
        let _ = self.module.set(Arc::downgrade(module));
    }

    #[must_use]
    pub fn module(&self) -> Option<Arc<Module>> {
        self.module.get().and_then(Weak::upgrade)
    }

    /// Parses a compact declaration like `"&head:X,rest:[A]"`: a leading
    /// `&` flags the function as eta, then each comma-separated entry is
    /// `name:typespec`. The entry list is validated in full before any
    /// state changes, so a malformed description leaves the function
    /// untouched.
    pub fn parse_description(&mut self, desc: &str) -> RunResult<()> {
        let mut rest = desc;
        let eta = rest.starts_with('&');
        if eta {
            rest = &rest[1..];
        }

        let mut params: Vec<(String, String)> = Vec::new();
        if !rest.is_empty() {
            for entry in rest.split(',') {
                let Some(colon) = entry.find(':') else {
                    return Err(Error::param(format!(
                        "malformed parameter entry '{entry}' in description of {}",
                        self.name
                    )));
                };
                if colon == 0 {
                    return Err(Error::param(format!(
                        "parameter name missing in description of {}",
                        self.name
                    )));
                }
                let name = &entry[..colon];
                let spec = &entry[colon + 1..];
                params.push((name.to_string(), spec.to_string()));
            }
        }

        // validated; commit
        self.eta = eta;
        let mut sig = String::new();
        for (name, spec) in params {
            if !sig.is_empty() {
                sig.push(',');
            }
            sig.push_str(&spec);
            self.vars.add_param(name);
        }
        self.signature = sig;
        Ok(())
    }

    /// The canonical invalid-parameters error for this function.
    #[must_use]
    pub fn param_error(&self) -> Error {
        let mut err = Error::param(format!("{}({})", self.name, self.signature))
            .in_symbol(self.name.clone())
            .at_line(self.line);
        if let Some(m) = self.module() {
            err = err.in_module(m.name().to_string());
        }
        err
    }

    /// Runs the body in `ctx`. The caller has already pushed the call
    /// frame; completion may be synchronous (the body returns the frame
    /// itself) or deferred through pushed steps. Callers must not assume
    /// the call completed when this returns.
    pub fn invoke(self: &Arc<Self>, ctx: &mut VmContext, argc: usize) -> RunResult<()> {
        match &self.body {
            FuncBody::Native(f) => {
                let f = Arc::clone(f);
                f(ctx, argc)
            }
            FuncBody::Syntactic(stmt) => {
                ctx.adjust_arity(self, argc);
                ctx.push_stmt(Arc::clone(stmt));
                Ok(())
            }
        }
    }

    /// Materializes a closure over this function, resolving each
    /// closed-over name through `resolve`. Returns `None` when the
    /// function closes over nothing: callers then push the bare function,
    /// which stays shared.
    #[must_use]
    pub fn close(
        self: &Arc<Self>,
        mut resolve: impl FnMut(&str) -> Option<VarCell>,
    ) -> Option<Closure> {
        if self.vars.closed().is_empty() {
            return None;
        }
        let captured = self
            .vars
            .closed()
            .iter()
            .map(|name| {
                let cell = resolve(name).unwrap_or_else(|| new_cell(Item::Nil));
                (name.clone(), cell)
            })
            .collect();
        Some(Closure {
            function: Arc::clone(self),
            captured,
        })
    }
}

/// A function plus the variable cells it closed over. Heap-allocated; the
/// base function stays shared between the closure and its module.
#[derive(Debug, Clone)]
pub struct Closure {
    function: Arc<Function>,
    captured: Vec<(String, VarCell)>,
}

impl Closure {
    #[must_use]
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.captured.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    #[must_use]
    pub fn capture(&self, name: &str) -> Option<VarCell> {
        self.captured
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| Arc::clone(c))
    }

    #[must_use]
    pub fn captures(&self) -> &[(String, VarCell)] {
        &self.captured
    }

    pub(crate) fn contained_items(&self, out: &mut Vec<Item>) {
        for (_, cell) in &self.captured {
            out.push(*cell.read().unwrap());
        }
    }
}

/// A script class: optional constructor, method table, and the marker that
/// queues the class for static initialization after unflattening.
#[derive(Debug)]
pub struct ClassDef {
    name: String,
    line: u32,
    needs_init: bool,
    init: Option<Arc<Function>>,
    methods: RwLock<BTreeMap<String, Arc<Function>>>,
}

impl ClassDef {
    #[must_use]
    pub fn new(name: impl Into<String>, line: u32, needs_init: bool) -> Self {
        ClassDef {
            name: name.into(),
            line,
            needs_init,
            init: None,
            methods: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// True when the class carries static initialization that must run
    /// before first use.
    #[must_use]
    pub fn needs_init(&self) -> bool {
        self.needs_init
    }

    #[must_use]
    pub fn constructor(&self) -> Option<&Arc<Function>> {
        self.init.as_ref()
    }

    pub fn set_constructor(&mut self, f: Arc<Function>) {
        self.init = Some(f);
    }

    pub fn add_method(&self, f: Arc<Function>) {
        self.methods
            .write()
            .unwrap()
            .insert(f.name().to_string(), f);
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<Arc<Function>> {
        self.methods.read().unwrap().get(name).cloned()
    }

    /// Snapshot of the method table in name order.
    #[must_use]
    pub fn methods(&self) -> Vec<Arc<Function>> {
        self.methods.read().unwrap().values().cloned().collect()
    }
}

/// A named executable entity owned by a module.
#[derive(Debug, Clone)]
pub enum Mantra {
    Function(Arc<Function>),
    Class(Arc<ClassDef>),
}

impl Mantra {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Mantra::Function(f) => f.name(),
            Mantra::Class(c) => c.name(),
        }
    }

    #[must_use]
    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Mantra::Function(f) => Some(f),
            Mantra::Class(_) => None,
        }
    }

    #[must_use]
    pub fn as_class(&self) -> Option<&Arc<ClassDef>> {
        match self {
            Mantra::Class(c) => Some(c),
            Mantra::Function(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Stmt;

    fn stub() -> Function {
        Function::new("f", 1, FuncBody::Syntactic(Arc::new(Stmt::Block(vec![]))))
    }

    #[test]
    fn test_parse_description_params_and_signature() {
        let mut f = stub();
        f.parse_description("head:X,rest:[A]").unwrap();
        assert!(!f.is_eta());
        assert_eq!(f.vars().params(), ["head", "rest"]);
        assert_eq!(f.signature(), "X,[A]");
    }

    #[test]
    fn test_parse_description_eta_prefix() {
        let mut f = stub();
        f.parse_description("&cond:X").unwrap();
        assert!(f.is_eta());
        assert_eq!(f.vars().params(), ["cond"]);
    }

    #[test]
    fn test_parse_description_missing_colon_fails_without_mutation() {
        let mut f = stub();
        f.parse_description("good:X,bad").unwrap_err();
        assert_eq!(f.param_count(), 0);
        assert_eq!(f.signature(), "");
        assert!(!f.is_eta());
    }

    #[test]
    fn test_parse_description_leading_colon_fails() {
        let mut f = stub();
        f.parse_description(":X").unwrap_err();
        assert_eq!(f.param_count(), 0);
    }

    #[test]
    fn test_varmap_lookup_order() {
        let mut vm = VarMap::default();
        vm.add_param("a");
        vm.add_local("b");
        vm.add_closed("c");
        assert_eq!(vm.find("a"), Some(VarSlot::Param(0)));
        assert_eq!(vm.find("b"), Some(VarSlot::Local(0)));
        assert_eq!(vm.find("c"), Some(VarSlot::Closed(0)));
        assert_eq!(vm.find("d"), None);
    }

    #[test]
    fn test_close_without_captures_yields_bare_function() {
        let f = Arc::new(stub());
        assert!(f.close(|_| None).is_none());
    }

    #[test]
    fn test_close_captures_cells() {
        let mut f = stub();
        f.vars_mut().add_closed("x");
        let f = Arc::new(f);
        let cell = new_cell(Item::Int(9));
        let captured = Arc::clone(&cell);
        let c = f.close(move |name| (name == "x").then(|| Arc::clone(&captured)));
        let c = c.unwrap();
        assert_eq!(c.len(), 1);
        *cell.write().unwrap() = Item::Int(10);
        assert_eq!(*c.capture("x").unwrap().read().unwrap(), Item::Int(10));
    }
}
