//! Kestrel Core - Execution engine for the Kestrel scripting language
//!
//! This crate provides the core runtime:
//! - Items: the universal value representation
//! - Heap and GC: arena-slot collector with explicit roots
//! - Mantras: functions, closures and classes
//! - VM: sequence-id tree evaluator with suspend/resume
//! - Modules: loading, linking, serialization and spaces
//! - VFS: pluggable source and cache resolution

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error taxonomy shared by every engine operation
pub mod errors;

/// Universal value representation and variable cells
pub mod item;

/// Heap value kinds
pub mod heap;

/// Garbage collection - slot arena, marking, pins
pub mod gc;

/// Object pooling for hot allocation paths
pub mod pool;

/// Binary stream primitives for module serialization
pub mod serial;

/// Callable units - functions, closures, classes
pub mod mantra;

/// Modules - loading, linking, spaces, serialization
pub mod module;

/// The evaluator - contexts, expression and statement steps
pub mod vm;

/// Virtual file system backing the module loader
pub mod vfs;

/// The engine root tying collector, spaces and contexts together
pub mod runtime;

/// Test utilities - a toy compiler for exercising the load pipeline
pub mod testutil;

/// Convenience re-export of the error types
pub use errors::{Error, ErrorKind, RunResult};

/// Convenience re-export of the value type
pub use item::Item;

/// Convenience re-export of the collector
pub use gc::Collector;

/// Convenience re-export of the heap value enum
pub use heap::HeapObject;

/// Convenience re-export of the module type
pub use module::Module;

/// Convenience re-export of the loader and space types
pub use module::loader::ModLoader;
pub use module::space::ModSpace;

/// Convenience re-export of the runtime root
pub use runtime::Runtime;

/// Convenience re-export of the evaluator context
pub use vm::{RunOutcome, VmContext};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::serial::{DataReader, DataWriter};
    use crate::testutil::LineCompiler;
    use crate::vfs::{MemFs, Vfs};

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }

    fn runtime_with(fs: Arc<MemFs>) -> (Arc<Runtime>, Arc<ModSpace>) {
        let rt = Runtime::new();
        let loader = ModLoader::new(fs as Arc<dyn Vfs>, Some(Arc::new(LineCompiler)));
        loader.append_path("mem:/lib");
        let space = rt.new_space(None, Arc::new(loader));
        (rt, space)
    }

    #[test]
    fn test_source_to_execution_pipeline() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/app.kes", "global v = 0\nmain v = 21\n");
        let (rt, space) = runtime_with(fs);
        let module = space.loader().load_name(rt.collector(), "app").unwrap();
        space.add_module(&module).unwrap();
        let mut ctx = rt.new_context(Some(Arc::clone(&space)));
        ctx.call_main(&module).unwrap();
        assert_eq!(
            *module.cell_for("v").unwrap().read().unwrap(),
            Item::Int(21)
        );
    }

    #[test]
    fn test_precompiled_cache_round_trip_through_runtime() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/app.kes", "global v = 0\nmain v = 8\n");
        let (rt, space) = runtime_with(Arc::clone(&fs));
        // first load compiles and writes the cache
        let first = space.loader().load_name(rt.collector(), "app").unwrap();
        assert!(fs.contains("mem:/lib/app.kfm"));
        drop(first);

        // second engine reads the cache alone
        let bytes = fs.get("mem:/lib/app.kfm").unwrap();
        let rt2 = Runtime::new();
        let module = Module::restore_precompiled(
            rt2.collector(),
            &mut DataReader::new(std::io::Cursor::new(bytes)),
        )
        .unwrap();
        let mut ctx = rt2.new_context(None);
        ctx.call_main(&module).unwrap();
        assert_eq!(*module.cell_for("v").unwrap().read().unwrap(), Item::Int(8));
    }

    #[test]
    fn test_space_visibility_across_engine_layers() {
        let fs = Arc::new(MemFs::new());
        fs.put("mem:/lib/base.kes", "export origin = 1\n");
        let (rt, parent) = runtime_with(Arc::clone(&fs));
        let module = space_load(&parent, rt.collector(), "base");
        parent.add_module(&module).unwrap();

        let child_loader = ModLoader::new(
            Arc::clone(&fs) as Arc<dyn Vfs>,
            Some(Arc::new(LineCompiler)),
        );
        child_loader.append_path("mem:/lib");
        let child = rt.new_space(Some(Arc::clone(&parent)), Arc::new(child_loader));
        // a context bound to the child resolves the parent's export by name
        let mut ctx = rt.new_context(Some(child));
        let v = ctx
            .eval_in(None, Arc::new(vm::Expr::Name("origin".to_string())))
            .unwrap();
        assert_eq!(v, Item::Int(1));
    }

    fn space_load(space: &Arc<ModSpace>, gc: &Arc<Collector>, name: &str) -> Arc<Module> {
        space.loader().load_name(gc, name).unwrap()
    }

    #[test]
    fn test_serial_primitives_round_trip() {
        let mut buf = Vec::new();
        {
            let mut w = DataWriter::new(&mut buf);
            w.write_i64(-42).unwrap();
            w.write_str("kestrel").unwrap();
            w.write_bool(true).unwrap();
            w.flush().unwrap();
        }
        let mut r = DataReader::new(std::io::Cursor::new(buf));
        assert_eq!(r.read_i64().unwrap(), -42);
        assert_eq!(r.read_str().unwrap(), "kestrel");
        assert!(r.read_bool().unwrap());
    }
}
