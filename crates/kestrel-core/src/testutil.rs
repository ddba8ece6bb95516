//! Test helpers: a deliberately tiny line-oriented compiler so loader and
//! space tests can exercise the full pipeline without a real grammar.
//!
//! The toy language, one directive per line (`#` starts a comment):
//!
//! ```text
//! global counter = 0        # module-level variable
//! export answer = 42        # exported module-level variable
//! import helper from dep    # extern satisfied by module `dep`
//! func seven = 7            # exported function returning 7
//! main counter = 1          # entry code assigning a global
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Error, RunResult};
use crate::item::Item;
use crate::mantra::{FuncBody, Function, Mantra};
use crate::module::loader::SourceCompiler;
use crate::module::{ImportDef, Module, MAIN_NAME};
use crate::vm::{Const, Expr, Stmt};

pub struct LineCompiler;

impl SourceCompiler for LineCompiler {
    fn compile(&self, uri: &str, source: &str, template: bool) -> RunResult<Arc<Module>> {
        let module = Module::new(module_name(uri), uri);
        if template {
            module.set_attribute("template", Item::Bool(true));
        }
        let mut requests: HashMap<String, u32> = HashMap::new();
        for (i, raw) in source.lines().enumerate() {
            let line = u32::try_from(i + 1).unwrap_or(u32::MAX);
            let text = raw.split('#').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }
            let mut words = text.split_whitespace();
            match words.next() {
                Some("global") => {
                    let (name, value) = parse_binding(words, line)?;
                    module.add_global(name, Item::Int(value));
                }
                Some("export") => {
                    let (name, value) = parse_binding(words, line)?;
                    module.add_global(name.clone(), Item::Int(value));
                    module.declare_export(name);
                }
                Some("import") => {
                    let name = words.next();
                    let kw = words.next();
                    let from = words.next();
                    let (Some(name), Some("from"), Some(dep)) = (name, kw, from) else {
                        return Err(directive_error(text, line));
                    };
                    let req = *requests
                        .entry(dep.to_string())
                        .or_insert_with(|| module.add_request(dep, false, false));
                    let def = module.add_import(ImportDef {
                        request: Some(req),
                        symbols: vec![name.to_string()],
                        wildcard: false,
                        target_ns: None,
                    })?;
                    module.add_extern(name, line, Some(def), None);
                }
                Some("func") => {
                    let (name, value) = parse_binding(words, line)?;
                    let body = Stmt::Return(Some(Arc::new(Expr::Lit(Const::Int(value)))));
                    let f = Function::new(name, line, FuncBody::Syntactic(Arc::new(body)));
                    module.add_mantra(Mantra::Function(Arc::new(f)), true)?;
                }
                Some("main") => {
                    let (name, value) = parse_binding(words, line)?;
                    let body = Stmt::Expr(Arc::new(Expr::Assign {
                        target: name,
                        value: Arc::new(Expr::Lit(Const::Int(value))),
                    }));
                    let f = Function::new(MAIN_NAME, line, FuncBody::Syntactic(Arc::new(body)));
                    module.add_mantra(Mantra::Function(Arc::new(f)), false)?;
                }
                _ => return Err(directive_error(text, line)),
            }
        }
        Ok(module)
    }
}

fn parse_binding<'a>(
    mut words: impl Iterator<Item = &'a str>,
    line: u32,
) -> RunResult<(String, i64)> {
    let name = words.next();
    let eq = words.next();
    let value = words.next();
    let (Some(name), Some("="), Some(value)) = (name, eq, value) else {
        return Err(Error::code("malformed binding").at_line(line));
    };
    let value = value
        .parse::<i64>()
        .map_err(|_| Error::code(format!("bad integer '{value}'")).at_line(line))?;
    Ok((name.to_string(), value))
}

fn directive_error(text: &str, line: u32) -> Error {
    Error::code(format!("unknown directive '{text}'")).at_line(line)
}

fn module_name(uri: &str) -> String {
    let tail = uri.rsplit('/').next().unwrap_or(uri);
    match tail.rfind('.') {
        Some(dot) => tail[..dot].to_string(),
        None => tail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_compile_globals_and_exports() {
        let m = LineCompiler
            .compile("mem:/lib/m.kes", "global a = 1\nexport b = 2\n", false)
            .unwrap();
        assert_eq!(m.name(), "m");
        assert_eq!(*m.cell_for("a").unwrap().read().unwrap(), Item::Int(1));
        let exported: Vec<String> = m.exported_cells().into_iter().map(|(n, _)| n).collect();
        assert_eq!(exported, vec!["b".to_string()]);
    }

    #[test]
    fn test_compile_import_declares_extern() {
        let m = LineCompiler
            .compile("mem:/lib/m.kes", "import helper from dep\n", false)
            .unwrap();
        assert_eq!(m.requests().len(), 1);
        assert_eq!(m.requests()[0].name, "dep");
        assert!(m.cell_for("helper").is_none()); // unbound until link
    }

    #[test]
    fn test_compile_main_registers_entry() {
        let m = LineCompiler
            .compile("mem:/lib/m.kes", "global v = 0\nmain v = 5\n", false)
            .unwrap();
        assert!(m.main_function().is_some());
    }

    #[test]
    fn test_malformed_line_is_code_error() {
        let err = LineCompiler
            .compile("mem:/lib/m.kes", "banana\n", false)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Code(_)));
        assert_eq!(err.line(), 1);
    }
}
