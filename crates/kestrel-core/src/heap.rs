//! Heap value kinds.
//!
//! Every collectable value is one variant of the closed [`HeapObject`] enum.
//! The enum is the engine's whole capability surface: marking for the
//! collector, textual description, and the type name exposed to scripts.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::gc::Collector;
use crate::item::Item;
use crate::mantra::{ClassDef, Closure, Function};
use crate::module::Module;
use crate::vm::Expr;

/// A script-defined object instance: a class reference plus named fields.
#[derive(Debug)]
pub struct UserObject {
    class: Arc<ClassDef>,
    fields: RwLock<BTreeMap<String, Item>>,
}

impl UserObject {
    #[must_use]
    pub fn new(class: Arc<ClassDef>) -> Self {
        UserObject {
            class,
            fields: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<Item> {
        self.fields.read().unwrap().get(name).copied()
    }

    pub fn set_field(&self, name: impl Into<String>, value: Item) {
        self.fields.write().unwrap().insert(name.into(), value);
    }

    fn contained(&self, out: &mut Vec<Item>) {
        out.extend(self.fields.read().unwrap().values().copied());
    }
}

/// One collectable value.
#[derive(Debug)]
pub enum HeapObject {
    Str(String),
    Array(RwLock<Vec<Item>>),
    Func(Arc<Function>),
    Class(Arc<ClassDef>),
    Closure(Closure),
    Object(UserObject),
    Module(Arc<Module>),
    /// A quoted, unevaluated expression tree. Eta functions receive their
    /// arguments in this form.
    Tree(Arc<Expr>),
}

impl HeapObject {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "String",
            HeapObject::Array(_) => "Array",
            HeapObject::Func(_) => "Function",
            HeapObject::Class(_) => "Class",
            HeapObject::Closure(_) => "Closure",
            HeapObject::Object(_) => "Object",
            HeapObject::Module(_) => "Module",
            HeapObject::Tree(_) => "Tree",
        }
    }

    /// Pushes every item directly contained in this value onto `out`.
    /// The collector drains `out` as a worklist, so deep structures are
    /// traversed without native recursion.
    pub fn contained_items(&self, out: &mut Vec<Item>) {
        match self {
            HeapObject::Str(_)
            | HeapObject::Func(_)
            | HeapObject::Class(_)
            | HeapObject::Tree(_) => {}
            HeapObject::Array(items) => out.extend(items.read().unwrap().iter().copied()),
            HeapObject::Closure(c) => c.contained_items(out),
            HeapObject::Object(o) => o.contained(out),
            HeapObject::Module(m) => m.contained_items(out),
        }
    }

    /// Renders the value for diagnostics. `depth` caps nested rendering so
    /// cyclic arrays terminate.
    #[must_use]
    pub fn describe(&self, gc: &Collector, depth: u8) -> String {
        match self {
            HeapObject::Str(s) => format!("\"{s}\""),
            HeapObject::Array(items) => {
                if depth == 0 {
                    return "[...]".to_string();
                }
                let items = items.read().unwrap();
                let inner: Vec<String> = items
                    .iter()
                    .map(|it| gc.describe_item(it, depth - 1))
                    .collect();
                format!("[{}]", inner.join(", "))
            }
            HeapObject::Func(f) => format!("{}()", f.name()),
            HeapObject::Class(c) => format!("class {}", c.name()),
            HeapObject::Closure(c) => format!("{}() closing {}", c.function().name(), c.len()),
            HeapObject::Object(o) => format!("instance of {}", o.class().name()),
            HeapObject::Module(m) => format!("module {}", m.name()),
            HeapObject::Tree(_) => "<tree>".to_string(),
        }
    }
}
