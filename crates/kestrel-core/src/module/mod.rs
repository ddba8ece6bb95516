//! Modules: the unit of loading, linking and serialization.
//!
//! A module owns its global storage cells, its mantras, the requests it
//! makes on other modules and the import definitions that satisfy its
//! extern symbols. Modules are shared (`Arc`) between their space, the
//! heap and any function that back-references them; interior state is
//! behind `RwLock`s so contexts on different threads can read concurrently.

pub mod loader;
pub mod serial;
pub mod space;
pub mod symbols;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::errors::{Error, RunResult};
use crate::item::{new_cell, Item, VarCell};
use crate::mantra::{ClassDef, Function, Mantra};

use self::symbols::{ExternSym, Symbol, SymbolTable};

/// Name under which a module's entry function is registered; the mantra
/// with this name is re-flagged as the module main when unflattening.
pub const MAIN_NAME: &str = "__main__";

/// A request for another module, by logical name or by URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRequest {
    pub name: String,
    pub is_uri: bool,
    /// `load` semantics (run the target's entry code) rather than plain
    /// import.
    pub is_load: bool,
    /// Import definitions satisfied through this request, by id.
    pub import_defs: Vec<u32>,
}

/// One import declaration: which symbols, from which request, into which
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDef {
    /// Originating request id; `None` means the symbols resolve against
    /// the surrounding space.
    pub request: Option<u32>,
    /// Imported symbol names; empty with `wildcard` set imports all.
    pub symbols: Vec<String>,
    pub wildcard: bool,
    /// Local namespace prefix the symbols land under.
    pub target_ns: Option<String>,
}

/// A mantra registered in a module, with its export flag.
#[derive(Debug, Clone)]
pub struct MantraEntry {
    pub mantra: Mantra,
    pub exported: bool,
}

#[derive(Debug)]
pub struct Module {
    name: String,
    uri: RwLock<String>,
    native: bool,
    symbols: RwLock<SymbolTable>,
    globals: RwLock<Vec<VarCell>>,
    mantras: RwLock<BTreeMap<String, MantraEntry>>,
    requests: RwLock<Vec<ModRequest>>,
    imports: RwLock<Vec<ImportDef>>,
    ns_trans: RwLock<BTreeMap<String, u32>>,
    attributes: RwLock<BTreeMap<String, Item>>,
    istrings: RwLock<BTreeSet<String>>,
    init_classes: RwLock<Vec<Arc<ClassDef>>>,
    main: RwLock<Option<Arc<Function>>>,
    /// Names declared exported ahead of registration; restore fills this
    /// so mantras re-added by unflattening keep their export flag.
    declared_exports: RwLock<BTreeSet<String>>,
}

impl Module {
    #[must_use]
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Arc<Self> {
        Module::build(name, uri, false)
    }

    /// A native module: provided by the host, never flattened beyond its
    /// identity.
    #[must_use]
    pub fn native(name: impl Into<String>, uri: impl Into<String>) -> Arc<Self> {
        Module::build(name, uri, true)
    }

    fn build(name: impl Into<String>, uri: impl Into<String>, native: bool) -> Arc<Self> {
        Arc::new(Module {
            name: name.into(),
            uri: RwLock::new(uri.into()),
            native,
            symbols: RwLock::new(SymbolTable::default()),
            globals: RwLock::new(Vec::new()),
            mantras: RwLock::new(BTreeMap::new()),
            requests: RwLock::new(Vec::new()),
            imports: RwLock::new(Vec::new()),
            ns_trans: RwLock::new(BTreeMap::new()),
            attributes: RwLock::new(BTreeMap::new()),
            istrings: RwLock::new(BTreeSet::new()),
            init_classes: RwLock::new(Vec::new()),
            main: RwLock::new(None),
            declared_exports: RwLock::new(BTreeSet::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn uri(&self) -> String {
        self.uri.read().unwrap().clone()
    }

    pub fn set_uri(&self, uri: impl Into<String>) {
        *self.uri.write().unwrap() = uri.into();
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.native
    }

    // ===== globals and symbols =====

    /// Declares a module-level variable, returning its slot id.
    pub fn add_global(&self, name: impl Into<String>, value: Item) -> u32 {
        let mut globals = self.globals.write().unwrap();
        let slot = u32::try_from(globals.len()).expect("too many globals");
        globals.push(new_cell(value));
        self.symbols
            .write()
            .unwrap()
            .insert(name, Symbol::Global { slot });
        slot
    }

    /// Declares an extern symbol to be satisfied at link time.
    pub fn add_extern(
        &self,
        name: impl Into<String>,
        line: u32,
        import_def: Option<u32>,
        source_name: Option<String>,
    ) {
        self.symbols.write().unwrap().insert(
            name,
            Symbol::Extern(ExternSym {
                line,
                import_def,
                source_name,
                cell: None,
            }),
        );
    }

    #[must_use]
    pub fn global_cell(&self, slot: u32) -> Option<VarCell> {
        self.globals.read().unwrap().get(slot as usize).cloned()
    }

    /// Resolves a name to its storage cell: globals directly, externs
    /// through their link-time binding.
    #[must_use]
    pub fn cell_for(&self, name: &str) -> Option<VarCell> {
        let symbols = self.symbols.read().unwrap();
        match symbols.get(name)? {
            Symbol::Global { slot } => self.global_cell(*slot),
            Symbol::Extern(e) => e.cell.clone(),
        }
    }

    pub fn with_symbols<T>(&self, f: impl FnOnce(&SymbolTable) -> T) -> T {
        f(&self.symbols.read().unwrap())
    }

    pub fn with_symbols_mut<T>(&self, f: impl FnOnce(&mut SymbolTable) -> T) -> T {
        f(&mut self.symbols.write().unwrap())
    }

    #[must_use]
    pub fn global_count(&self) -> usize {
        self.globals.read().unwrap().len()
    }

    /// Global symbol names indexed by slot.
    #[must_use]
    pub fn global_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.global_count()];
        self.with_symbols(|t| {
            for (n, s) in t.iter() {
                if let Symbol::Global { slot } = s {
                    names[*slot as usize] = n.clone();
                }
            }
        });
        names
    }

    // ===== mantras =====

    /// Marks a name as exported before its mantra is registered.
    pub fn declare_export(&self, name: impl Into<String>) {
        self.declared_exports.write().unwrap().insert(name.into());
    }

    /// Registers a mantra and gives it a global cell of the same name
    /// (reusing the cell when the symbol already exists, as it does after
    /// a structural restore). The cell holds Nil until linking publishes
    /// the mantra's heap item.
    pub fn add_mantra(self: &Arc<Self>, mantra: Mantra, exported: bool) -> RunResult<()> {
        let name = mantra.name().to_string();
        let exported = exported || self.declared_exports.read().unwrap().contains(&name);
        if self.mantras.read().unwrap().contains_key(&name) {
            return Err(Error::code(format!("duplicate mantra '{name}'"))
                .in_module(self.name.clone()));
        }
        if let Mantra::Function(f) = &mantra {
            f.set_module(self);
        }
        if let Mantra::Class(c) = &mantra {
            for m in c.methods() {
                m.set_module(self);
            }
            if let Some(ctor) = c.constructor() {
                ctor.set_module(self);
            }
            if c.needs_init() {
                self.init_classes.write().unwrap().push(Arc::clone(c));
            }
        }
        let have_symbol = self.with_symbols(|t| t.get(&name).is_some());
        if !have_symbol {
            self.add_global(name.clone(), Item::Nil);
        }
        if name == MAIN_NAME {
            if let Mantra::Function(f) = &mantra {
                *self.main.write().unwrap() = Some(Arc::clone(f));
            }
        }
        self.mantras
            .write()
            .unwrap()
            .insert(name, MantraEntry { mantra, exported });
        Ok(())
    }

    #[must_use]
    pub fn get_mantra(&self, name: &str) -> Option<Mantra> {
        self.mantras
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.mantra.clone())
    }

    /// Mantra entries in name order.
    #[must_use]
    pub fn mantra_entries(&self) -> Vec<(String, MantraEntry)> {
        self.mantras
            .read()
            .unwrap()
            .iter()
            .map(|(n, e)| (n.clone(), e.clone()))
            .collect()
    }

    /// Names of exported mantras, in order.
    #[must_use]
    pub fn exported_names(&self) -> Vec<String> {
        self.mantras
            .read()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.exported)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Exported names paired with their storage cells: exported mantras
    /// plus any explicitly declared exports (globals included).
    #[must_use]
    pub fn exported_cells(&self) -> Vec<(String, VarCell)> {
        let mut names: BTreeSet<String> = self.declared_exports.read().unwrap().clone();
        names.extend(self.exported_names());
        names
            .into_iter()
            .filter_map(|n| self.cell_for(&n).map(|c| (n, c)))
            .collect()
    }

    #[must_use]
    pub fn main_function(&self) -> Option<Arc<Function>> {
        self.main.read().unwrap().clone()
    }

    pub fn set_main(&self, f: Arc<Function>) {
        *self.main.write().unwrap() = Some(f);
    }

    #[must_use]
    pub fn pending_init_classes(&self) -> Vec<Arc<ClassDef>> {
        self.init_classes.read().unwrap().clone()
    }

    // ===== requests and imports =====

    pub fn add_request(&self, name: impl Into<String>, is_uri: bool, is_load: bool) -> u32 {
        let mut requests = self.requests.write().unwrap();
        let id = u32::try_from(requests.len()).expect("too many requests");
        requests.push(ModRequest {
            name: name.into(),
            is_uri,
            is_load,
            import_defs: Vec::new(),
        });
        id
    }

    /// Adds an import definition; when it names a request, the request's
    /// association list is updated too. An out-of-range request id is a
    /// code error.
    pub fn add_import(&self, def: ImportDef) -> RunResult<u32> {
        let mut imports = self.imports.write().unwrap();
        let id = u32::try_from(imports.len()).expect("too many imports");
        if let Some(req) = def.request {
            let mut requests = self.requests.write().unwrap();
            let entry = requests.get_mut(req as usize).ok_or_else(|| {
                Error::code(format!("import refers to unknown request {req}"))
                    .in_module(self.name.clone())
            })?;
            entry.import_defs.push(id);
        }
        imports.push(def);
        Ok(id)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<ModRequest> {
        self.requests.read().unwrap().clone()
    }

    #[must_use]
    pub fn imports(&self) -> Vec<ImportDef> {
        self.imports.read().unwrap().clone()
    }

    /// Maps a namespace alias to the import definition it translates to.
    pub fn set_ns_translation(&self, alias: impl Into<String>, import_def: u32) {
        self.ns_trans.write().unwrap().insert(alias.into(), import_def);
    }

    #[must_use]
    pub fn ns_translation(&self, alias: &str) -> Option<u32> {
        self.ns_trans.read().unwrap().get(alias).copied()
    }

    #[must_use]
    pub fn ns_translations(&self) -> Vec<(String, u32)> {
        self.ns_trans
            .read()
            .unwrap()
            .iter()
            .map(|(a, i)| (a.clone(), *i))
            .collect()
    }

    // ===== attributes and international strings =====

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Item> {
        self.attributes.read().unwrap().get(name).copied()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Item) {
        self.attributes.write().unwrap().insert(name.into(), value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Item> {
        self.attributes.write().unwrap().remove(name)
    }

    #[must_use]
    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.read().unwrap().keys().cloned().collect()
    }

    pub fn add_istring(&self, s: impl Into<String>) {
        self.istrings.write().unwrap().insert(s.into());
    }

    #[must_use]
    pub fn istrings(&self) -> Vec<String> {
        self.istrings.read().unwrap().iter().cloned().collect()
    }

    // ===== GC participation =====

    /// Items reachable from this module: global cells and attribute
    /// values. Mantra heap items are reachable through the global cells
    /// linking published them into.
    pub(crate) fn contained_items(&self, out: &mut Vec<Item>) {
        for cell in self.globals.read().unwrap().iter() {
            out.push(*cell.read().unwrap());
        }
        out.extend(self.attributes.read().unwrap().values().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mantra::FuncBody;
    use crate::vm::Stmt;

    fn func(name: &str) -> Mantra {
        Mantra::Function(Arc::new(Function::new(
            name,
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Block(vec![]))),
        )))
    }

    #[test]
    fn test_add_mantra_creates_global_and_backref() {
        let m = Module::new("m", "kes:/m");
        m.add_mantra(func("f"), true).unwrap();
        assert!(m.cell_for("f").is_some());
        let f = m.get_mantra("f").unwrap();
        assert_eq!(f.as_function().unwrap().module().unwrap().name(), "m");
    }

    #[test]
    fn test_duplicate_mantra_rejected() {
        let m = Module::new("m", "kes:/m");
        m.add_mantra(func("f"), false).unwrap();
        let err = m.add_mantra(func("f"), false).unwrap_err();
        assert!(err.to_string().contains("duplicate mantra"));
    }

    #[test]
    fn test_main_name_sets_entry() {
        let m = Module::new("m", "kes:/m");
        m.add_mantra(func(MAIN_NAME), false).unwrap();
        assert!(m.main_function().is_some());
    }

    #[test]
    fn test_import_updates_request_association() {
        let m = Module::new("m", "kes:/m");
        let req = m.add_request("dep", false, false);
        let id = m
            .add_import(ImportDef {
                request: Some(req),
                symbols: vec!["x".to_string()],
                wildcard: false,
                target_ns: None,
            })
            .unwrap();
        assert_eq!(m.requests()[0].import_defs, vec![id]);
    }

    #[test]
    fn test_import_with_bad_request_rejected() {
        let m = Module::new("m", "kes:/m");
        let err = m
            .add_import(ImportDef {
                request: Some(7),
                symbols: vec![],
                wildcard: true,
                target_ns: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown request"));
        assert!(m.imports().is_empty());
    }

    #[test]
    fn test_attributes_surface() {
        let m = Module::new("m", "kes:/m");
        m.set_attribute("version", Item::Int(3));
        assert_eq!(m.attribute("version"), Some(Item::Int(3)));
        assert_eq!(m.remove_attribute("version"), Some(Item::Int(3)));
        assert_eq!(m.attribute("version"), None);
    }
}
