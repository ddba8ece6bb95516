//! Module spaces: visibility scopes for loaded modules and their exports.
//!
//! A space owns the modules loaded into it and an export table mapping
//! exported names to their storage cells. Spaces form a parent chain:
//! lookups see the own space first, then ancestors, never siblings or
//! children. Linking publishes mantra heap items into their module's
//! global cells and binds extern symbols, committing only when every
//! extern resolves.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{Error, RunResult};
use crate::gc::{Collector, GcRoot, Marker};
use crate::heap::HeapObject;
use crate::item::VarCell;
use crate::mantra::{Function, Mantra};
use crate::module::loader::ModLoader;
use crate::module::symbols::Symbol;
use crate::module::Module;
use crate::vm::{Step, VmContext};

/// How a module should be brought into a space.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Treat the path as a URI instead of a logical name.
    pub is_uri: bool,
    /// Run the module's entry code before delivering it.
    pub as_load: bool,
    /// Record the module as the space's main module.
    pub as_main: bool,
    /// Register the module (and publish its exports); off for private
    /// loads.
    pub add_to_space: bool,
}

pub struct ModSpace {
    gc: Arc<Collector>,
    parent: Option<Arc<ModSpace>>,
    loader: Arc<ModLoader>,
    by_name: RwLock<HashMap<String, Arc<Module>>>,
    by_uri: RwLock<HashMap<String, Arc<Module>>>,
    exports: RwLock<HashMap<String, VarCell>>,
    main_module: RwLock<Option<Arc<Module>>>,
}

impl ModSpace {
    #[must_use]
    pub fn new(
        gc: Arc<Collector>,
        parent: Option<Arc<ModSpace>>,
        loader: Arc<ModLoader>,
    ) -> Arc<Self> {
        Arc::new(ModSpace {
            gc,
            parent,
            loader,
            by_name: RwLock::new(HashMap::new()),
            by_uri: RwLock::new(HashMap::new()),
            exports: RwLock::new(HashMap::new()),
            main_module: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<ModSpace>> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn loader(&self) -> &Arc<ModLoader> {
        &self.loader
    }

    /// Module registered under `name` in this space only; ancestors are
    /// not consulted.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.by_name.read().unwrap().get(name).cloned()
    }

    #[must_use]
    pub fn find_by_uri(&self, uri: &str) -> Option<Arc<Module>> {
        self.by_uri.read().unwrap().get(uri).cloned()
    }

    /// Module visible from this space: own table, then the parent chain.
    #[must_use]
    pub fn find_module(&self, name: &str) -> Option<Arc<Module>> {
        if let Some(m) = self.find_by_name(name) {
            return Some(m);
        }
        self.parent.as_ref().and_then(|p| p.find_module(name))
    }

    /// Resolves an exported name: own exports, then the parent chain.
    /// Siblings never see each other's exports.
    #[must_use]
    pub fn resolve_export(&self, name: &str) -> Option<VarCell> {
        if let Some(cell) = self.exports.read().unwrap().get(name) {
            return Some(Arc::clone(cell));
        }
        self.parent.as_ref().and_then(|p| p.resolve_export(name))
    }

    #[must_use]
    pub fn main_module(&self) -> Option<Arc<Module>> {
        self.main_module.read().unwrap().clone()
    }

    /// Links `module` and registers it, publishing its exports. Nothing
    /// is registered when any step fails.
    pub fn add_module(&self, module: &Arc<Module>) -> RunResult<()> {
        if self.by_name.read().unwrap().contains_key(module.name()) {
            return Err(Error::code(format!(
                "module '{}' already registered",
                module.name()
            )));
        }
        let exported = module.exported_cells();
        {
            let exports = self.exports.read().unwrap();
            for (name, _) in &exported {
                if exports.contains_key(name) {
                    return Err(Error::access(format!(
                        "export '{name}' already defined in this space"
                    ))
                    .in_module(module.name()));
                }
            }
        }
        self.link(module)?;
        self.by_name
            .write()
            .unwrap()
            .insert(module.name().to_string(), Arc::clone(module));
        self.by_uri
            .write()
            .unwrap()
            .insert(module.uri(), Arc::clone(module));
        let mut exports = self.exports.write().unwrap();
        for (name, cell) in exported {
            exports.insert(name, cell);
        }
        Ok(())
    }

    /// Publishes mantra heap items into their global cells and binds every
    /// unresolved extern. Extern bindings commit all-or-nothing: a single
    /// unresolvable symbol leaves the module unlinked.
    pub fn link(&self, module: &Arc<Module>) -> RunResult<()> {
        for (name, entry) in module.mantra_entries() {
            let item = self.gc.store_item(match &entry.mantra {
                Mantra::Function(f) => HeapObject::Func(Arc::clone(f)),
                Mantra::Class(c) => HeapObject::Class(Arc::clone(c)),
            });
            if let Some(cell) = module.cell_for(&name) {
                *cell.write().unwrap() = item;
            }
        }
        let imports = module.imports();
        let requests = module.requests();
        let plan = module.with_symbols(|t| -> RunResult<Vec<(String, VarCell)>> {
            let mut plan = Vec::new();
            for (name, e) in t.externs() {
                if e.cell.is_some() {
                    continue;
                }
                let cell = self
                    .locate_extern(module, name, e, &imports, &requests)?
                    .ok_or_else(|| {
                        Error::code(format!("undefined symbol '{name}'"))
                            .in_module(module.name())
                            .at_line(e.line)
                    })?;
                plan.push((name.clone(), cell));
            }
            Ok(plan)
        })?;
        module.with_symbols_mut(|t| {
            for (name, cell) in plan {
                if let Some(Symbol::Extern(e)) = t.get_mut(&name) {
                    e.cell = Some(cell);
                }
            }
        });
        Ok(())
    }

    fn locate_extern(
        &self,
        module: &Arc<Module>,
        name: &str,
        e: &crate::module::symbols::ExternSym,
        imports: &[crate::module::ImportDef],
        requests: &[crate::module::ModRequest],
    ) -> RunResult<Option<VarCell>> {
        let Some(def_id) = e.import_def else {
            return Ok(self.resolve_export(name));
        };
        let def = imports.get(def_id as usize).ok_or_else(|| {
            Error::code(format!("extern '{name}' refers to unknown import {def_id}"))
                .in_module(module.name())
        })?;
        // strip the local namespace prefix before looking upstream
        let local = match &def.target_ns {
            Some(ns) => name.strip_prefix(&format!("{ns}.")).unwrap_or(name),
            None => name,
        };
        let lookup = e.source_name.as_deref().unwrap_or(local);
        let Some(req_id) = def.request else {
            return Ok(self.resolve_export(lookup));
        };
        let req = requests.get(req_id as usize).ok_or_else(|| {
            Error::code(format!("import refers to unknown request {req_id}"))
                .in_module(module.name())
        })?;
        let dep = self.find_module(&req.name).ok_or_else(|| {
            Error::code(format!(
                "module '{}' required by '{}' is not loaded",
                req.name,
                module.name()
            ))
        })?;
        Ok(dep
            .exported_cells()
            .into_iter()
            .find(|(n, _)| n == lookup)
            .map(|(_, c)| c))
    }

    /// Loads a module (and its transitive requests) and schedules the
    /// delivery continuation on `ctx`: entry code of freshly loaded
    /// `load`-requested modules runs first, then the module item lands on
    /// the data stack.
    pub fn load_module_in_context(
        self: &Arc<Self>,
        path: &str,
        opts: LoadOptions,
        ctx: &mut VmContext,
        requester: Option<&Arc<Module>>,
    ) -> RunResult<Arc<Module>> {
        let mut stack = Vec::new();
        let mut mains = Vec::new();
        let loaded = self.load_tree(path, opts.is_uri, opts.add_to_space, &mut stack, &mut mains);
        let (module, fresh) = loaded.map_err(|e| match requester {
            Some(rq) if e.module().is_none() => e.in_module(rq.name()),
            _ => e,
        })?;
        if opts.as_main {
            *self.main_module.write().unwrap() = Some(Arc::clone(&module));
        }
        if opts.as_load && fresh {
            if let Some(main) = module.main_function() {
                mains.push(main);
            }
        }
        let item = self.gc.store_item(HeapObject::Module(Arc::clone(&module)));
        ctx.push_step(Step::PushItem(item));
        for main in mains.iter().rev() {
            ctx.push_step(Step::Discard);
            ctx.push_step(Step::Invoke(Arc::clone(main)));
        }
        Ok(module)
    }

    /// Depth-first load of `path` and its requests. Returns the module and
    /// whether it was freshly loaded; entry functions of freshly loaded
    /// `load` requests are collected in dependency order.
    fn load_tree(
        self: &Arc<Self>,
        path: &str,
        is_uri: bool,
        add: bool,
        stack: &mut Vec<String>,
        mains: &mut Vec<Arc<Function>>,
    ) -> RunResult<(Arc<Module>, bool)> {
        let existing = if is_uri {
            self.find_by_uri(path)
        } else {
            self.find_by_name(path)
        };
        if let Some(m) = existing {
            return Ok((m, false));
        }
        if stack.iter().any(|s| s == path) {
            return Err(Error::code(format!("circular dependency through '{path}'")));
        }
        stack.push(path.to_string());
        let module = if is_uri {
            self.loader.load_uri(&self.gc, path)
        } else {
            self.loader.load_name(&self.gc, path)
        }?;
        for req in module.requests() {
            let (dep, dep_fresh) = self.load_tree(&req.name, req.is_uri, true, stack, mains)?;
            if req.is_load && dep_fresh {
                if let Some(main) = dep.main_function() {
                    mains.push(main);
                }
            }
        }
        stack.pop();
        if add {
            self.add_module(&module)?;
        } else {
            self.link(&module)?;
        }
        Ok((module, true))
    }

    /// Modules registered here, for host enumeration and collection.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.by_name.read().unwrap().values().cloned().collect()
    }
}

impl GcRoot for ModSpace {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        let mut items = Vec::new();
        for module in self.by_name.read().unwrap().values() {
            module.contained_items(&mut items);
        }
        // the main module may have been loaded privately and not registered
        if let Some(main) = self.main_module.read().unwrap().as_ref() {
            main.contained_items(&mut items);
        }
        for cell in self.exports.read().unwrap().values() {
            items.push(*cell.read().unwrap());
        }
        for item in items {
            marker.trace(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::item::Item;
    use crate::module::loader::SourceCompiler;
    use crate::testutil::LineCompiler;
    use crate::vfs::{MemFs, Vfs};

    fn space_over(fs: &Arc<MemFs>, parent: Option<Arc<ModSpace>>) -> Arc<ModSpace> {
        let gc = match &parent {
            Some(p) => Arc::clone(&p.gc),
            None => Arc::new(Collector::new()),
        };
        let loader = ModLoader::new(
            Arc::clone(fs) as Arc<dyn Vfs>,
            Some(Arc::new(LineCompiler)),
        );
        loader.append_path("mem:/lib");
        ModSpace::new(gc, parent, Arc::new(loader))
    }

    fn compile(src: &str, uri: &str) -> Arc<Module> {
        LineCompiler.compile(uri, src, false).unwrap()
    }

    #[test]
    fn test_add_module_publishes_exports() {
        let fs = Arc::new(MemFs::new());
        let space = space_over(&fs, None);
        let m = compile("export answer = 42\nglobal hidden = 1\n", "mem:/lib/m.kes");
        space.add_module(&m).unwrap();
        let cell = space.resolve_export("answer").unwrap();
        assert_eq!(*cell.read().unwrap(), Item::Int(42));
        assert!(space.resolve_export("hidden").is_none());
    }

    #[test]
    fn test_child_sees_parent_but_not_vice_versa() {
        let fs = Arc::new(MemFs::new());
        let parent = space_over(&fs, None);
        let child = space_over(&fs, Some(Arc::clone(&parent)));
        let up = compile("export shared = 1\n", "mem:/lib/up.kes");
        parent.add_module(&up).unwrap();
        let down = compile("export private = 2\n", "mem:/lib/down.kes");
        child.add_module(&down).unwrap();
        assert!(child.resolve_export("shared").is_some());
        assert!(parent.resolve_export("private").is_none());
        assert!(child.find_module("up").is_some());
        assert!(parent.find_by_name("down").is_none());
    }

    #[test]
    fn test_siblings_are_isolated() {
        let fs = Arc::new(MemFs::new());
        let parent = space_over(&fs, None);
        let a = space_over(&fs, Some(Arc::clone(&parent)));
        let b = space_over(&fs, Some(Arc::clone(&parent)));
        a.add_module(&compile("export only_a = 1\n", "mem:/lib/a.kes"))
            .unwrap();
        assert!(b.resolve_export("only_a").is_none());
    }

    #[test]
    fn test_link_binds_extern_through_import() {
        let fs = Arc::new(MemFs::new());
        let space = space_over(&fs, None);
        space
            .add_module(&compile("export helper = 7\n", "mem:/lib/dep.kes"))
            .unwrap();
        let user = compile("import helper from dep\n", "mem:/lib/user.kes");
        space.add_module(&user).unwrap();
        let cell = user.cell_for("helper").unwrap();
        assert_eq!(*cell.read().unwrap(), Item::Int(7));
    }

    #[test]
    fn test_unresolved_extern_rejects_module() {
        let fs = Arc::new(MemFs::new());
        let space = space_over(&fs, None);
        space
            .add_module(&compile("global helper = 7\n", "mem:/lib/dep.kes"))
            .unwrap();
        // dep exists but does not export helper
        let user = compile("import helper from dep\n", "mem:/lib/user.kes");
        let err = space.add_module(&user).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Code(_)));
        assert!(space.find_by_name("user").is_none());
    }

    #[test]
    fn test_duplicate_export_is_access_error() {
        let fs = Arc::new(MemFs::new());
        let space = space_over(&fs, None);
        space
            .add_module(&compile("export x = 1\n", "mem:/lib/one.kes"))
            .unwrap();
        let err = space
            .add_module(&compile("export x = 2\n", "mem:/lib/two.kes"))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Access(_)));
        assert!(space.find_by_name("two").is_none());
    }

    #[test]
    fn test_load_runs_entry_then_delivers_module() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/app.kes", "global v = 0\nmain v = 9\n");
        let space = space_over(&fs, None);
        let mut ctx = VmContext::new(1, Arc::clone(&space.gc), Some(Arc::clone(&space)));
        let opts = LoadOptions {
            as_load: true,
            as_main: true,
            add_to_space: true,
            ..LoadOptions::default()
        };
        let module = space
            .load_module_in_context("app", opts, &mut ctx, None)
            .unwrap();
        ctx.run().unwrap();
        // entry code ran
        assert_eq!(*module.cell_for("v").unwrap().read().unwrap(), Item::Int(9));
        // the module item is the delivered result
        let top = ctx.pop_data();
        let obj = ctx.gc().deref(&top).unwrap();
        match &*obj {
            HeapObject::Module(m) => assert_eq!(m.name(), "app"),
            other => panic!("expected module, got {}", other.type_name()),
        }
        assert_eq!(space.main_module().unwrap().name(), "app");
    }

    #[test]
    fn test_load_pulls_dependencies_first() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/dep.kes", "export helper = 5\n");
        fs.put("mem:/lib/app.kes", "import helper from dep\n");
        let space = space_over(&fs, None);
        let mut ctx = VmContext::new(1, Arc::clone(&space.gc), Some(Arc::clone(&space)));
        let opts = LoadOptions {
            add_to_space: true,
            ..LoadOptions::default()
        };
        let app = space
            .load_module_in_context("app", opts, &mut ctx, None)
            .unwrap();
        assert!(space.find_by_name("dep").is_some());
        assert_eq!(
            *app.cell_for("helper").unwrap().read().unwrap(),
            Item::Int(5)
        );
    }

    #[test]
    fn test_circular_dependency_detected() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/a.kes", "import from_b from b\n");
        fs.put("mem:/lib/b.kes", "import from_a from a\n");
        let space = space_over(&fs, None);
        let mut ctx = VmContext::new(1, Arc::clone(&space.gc), Some(Arc::clone(&space)));
        let opts = LoadOptions {
            add_to_space: true,
            ..LoadOptions::default()
        };
        let err = space
            .load_module_in_context("a", opts, &mut ctx, None)
            .unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn test_private_main_module_stays_rooted() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/app.kes", "func seven = 7\n");
        let space = space_over(&fs, None);
        let mut ctx = VmContext::new(1, Arc::clone(&space.gc), Some(Arc::clone(&space)));
        // main module, but kept out of the registration tables
        let opts = LoadOptions {
            as_main: true,
            ..LoadOptions::default()
        };
        let module = space
            .load_module_in_context("app", opts, &mut ctx, None)
            .unwrap();
        let item = *module.cell_for("seven").unwrap().read().unwrap();
        assert!(space.find_by_name("app").is_none());
        drop(ctx);
        space.gc.collect(&[&*space as &dyn GcRoot]);
        assert!(space.gc.deref(&item).is_some());
    }
}
