//! Per-module symbol table.
//!
//! Globals name a storage cell owned by the module; externs are satisfied
//! at link time through an import definition (or a plain cross-space
//! lookup when they have none). Function-local variables are not symbols:
//! they live in each function's `VarMap`.

use std::collections::BTreeMap;

use crate::item::VarCell;

/// An extern symbol awaiting (or holding) its link-time binding.
#[derive(Debug, Clone, Default)]
pub struct ExternSym {
    /// Declaration line, for diagnostics.
    pub line: u32,
    /// Owning import definition id, when the extern came from an explicit
    /// import; `None` for implicit dependencies.
    pub import_def: Option<u32>,
    /// Name of the symbol in the exporting module, when renamed.
    pub source_name: Option<String>,
    /// The exporter's cell, filled by linking.
    pub cell: Option<VarCell>,
}

#[derive(Debug, Clone)]
pub enum Symbol {
    /// Module-level variable; index into the module's globals vector.
    Global { slot: u32 },
    Extern(ExternSym),
}

impl Symbol {
    #[must_use]
    pub fn is_extern(&self) -> bool {
        matches!(self, Symbol::Extern(_))
    }
}

/// Name to symbol map, deterministic iteration order.
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    pub fn insert(&mut self, name: impl Into<String>, sym: Symbol) {
        self.map.insert(name.into(), sym);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.map.get_mut(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.map.iter()
    }

    /// Externs in name order, as serialized in the external-dependency
    /// table.
    pub fn externs(&self) -> impl Iterator<Item = (&String, &ExternSym)> {
        self.map.iter().filter_map(|(n, s)| match s {
            Symbol::Extern(e) => Some((n, e)),
            Symbol::Global { .. } => None,
        })
    }

    /// Externs still missing their link-time binding.
    pub fn unresolved(&self) -> impl Iterator<Item = &String> {
        self.map.iter().filter_map(|(n, s)| match s {
            Symbol::Extern(e) if e.cell.is_none() => Some(n),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_externs_filtered_and_ordered() {
        let mut t = SymbolTable::default();
        t.insert("zeta", Symbol::Extern(ExternSym::default()));
        t.insert("alpha", Symbol::Global { slot: 0 });
        t.insert("beta", Symbol::Extern(ExternSym::default()));
        let names: Vec<&String> = t.externs().map(|(n, _)| n).collect();
        assert_eq!(names, ["beta", "zeta"]);
    }

    #[test]
    fn test_unresolved_tracks_binding() {
        let mut t = SymbolTable::default();
        t.insert("x", Symbol::Extern(ExternSym::default()));
        assert_eq!(t.unresolved().count(), 1);
        if let Some(Symbol::Extern(e)) = t.get_mut("x") {
            e.cell = Some(crate::item::new_cell(crate::item::Item::Nil));
        }
        assert_eq!(t.unresolved().count(), 0);
    }
}
