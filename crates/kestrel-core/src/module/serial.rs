//! Module serialization: the structural store/restore pair, the live-state
//! flatten/unflatten pair, and the precompiled container that combines
//! them.
//!
//! `store`/`restore` cover everything identity-shaped: names, requests,
//! import definitions, extern dependencies, namespace translations,
//! attribute names, international strings and export declarations.
//! Cross-references travel as positional ids assigned in write order;
//! restore re-checks every id against the lists read so far and rejects
//! the stream on any mismatch, discarding the partial module.
//!
//! `flatten`/`unflatten` move the live state: global values, mantras,
//! pending-init classes and attribute values, as a flat item vector with
//! Nil sentinels between the four sections.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::errors::{Error, RunResult};
use crate::gc::Collector;
use crate::heap::HeapObject;
use crate::item::Item;
use crate::mantra::{ClassDef, FuncBody, Function, Mantra};
use crate::module::{ImportDef, Module};
use crate::serial::{DataReader, DataWriter};
use crate::vm::{BinOp, CmpOp, Const, Expr, Stmt, UnaryOp};

const MAGIC: [u8; 4] = *b"KMOD";
const FORMAT_VERSION: u16 = 1;

/// Ceiling on every serialized count; a prefix above it means corruption.
const MAX_COUNT: u32 = 1 << 20;

/// Nesting cap for serialized trees and items.
const MAX_DEPTH: u32 = 200;

fn check_count(n: u32, what: &str) -> RunResult<()> {
    if n > MAX_COUNT {
        return Err(Error::deser(format!("unreasonable {what} count {n}")));
    }
    Ok(())
}

fn checked_vec<T>(n: u32, what: &str) -> RunResult<Vec<T>> {
    check_count(n, what)?;
    Ok(Vec::with_capacity(n as usize))
}

fn opt_id(id: Option<u32>) -> i32 {
    id.map_or(-1, |v| i32::try_from(v).unwrap_or(-1))
}

impl Module {
    // ===== structural store/restore =====

    pub fn store<W: Write>(&self, w: &mut DataWriter<W>) -> RunResult<()> {
        w.write_bool(self.is_native())?;
        w.write_str(self.name())?;
        w.write_str(&self.uri())?;
        if self.is_native() {
            // native modules are identity only; the host re-provides their
            // mantras
            return Ok(());
        }

        let globals = self.global_names();
        w.write_u32(globals.len() as u32)?;
        for name in &globals {
            w.write_str(name)?;
        }

        let requests = self.requests();
        w.write_u32(requests.len() as u32)?;
        for req in &requests {
            w.write_str(&req.name)?;
            w.write_bool(req.is_uri)?;
            w.write_bool(req.is_load)?;
        }

        let imports = self.imports();
        w.write_u32(imports.len() as u32)?;
        for def in &imports {
            w.write_i32(opt_id(def.request))?;
            w.write_bool(def.wildcard)?;
            w.write_u32(def.symbols.len() as u32)?;
            for s in &def.symbols {
                w.write_str(s)?;
            }
            match &def.target_ns {
                Some(ns) => {
                    w.write_bool(true)?;
                    w.write_str(ns)?;
                }
                None => w.write_bool(false)?,
            }
        }

        // per-request import associations, re-checked on restore
        for req in &requests {
            w.write_u32(req.import_defs.len() as u32)?;
            for id in &req.import_defs {
                w.write_u32(*id)?;
            }
        }

        let externs: Vec<_> = self.with_symbols(|t| {
            t.externs()
                .map(|(n, e)| (n.clone(), e.line, e.import_def, e.source_name.clone()))
                .collect()
        });
        w.write_u32(externs.len() as u32)?;
        for (name, line, import_def, source_name) in &externs {
            w.write_str(name)?;
            w.write_u32(*line)?;
            w.write_i32(opt_id(*import_def))?;
            match source_name {
                Some(s) => {
                    w.write_bool(true)?;
                    w.write_str(s)?;
                }
                None => w.write_bool(false)?,
            }
        }

        let trans = self.ns_translations();
        w.write_u32(trans.len() as u32)?;
        for (alias, def) in &trans {
            w.write_str(alias)?;
            w.write_u32(*def)?;
        }

        let attrs = self.attribute_names();
        w.write_u32(attrs.len() as u32)?;
        for name in &attrs {
            w.write_str(name)?;
        }

        let istrings = self.istrings();
        w.write_u32(istrings.len() as u32)?;
        for s in &istrings {
            w.write_str(s)?;
        }

        let exports = self.exported_names();
        w.write_u32(exports.len() as u32)?;
        for name in &exports {
            w.write_str(name)?;
        }
        Ok(())
    }

    /// Reads a structural image. The module is only returned on full
    /// success; any integrity failure drops the partial construction.
    pub fn restore<R: Read>(r: &mut DataReader<R>) -> RunResult<Arc<Module>> {
        let native = r.read_bool()?;
        let name = r.read_str()?;
        let uri = r.read_str()?;
        if native {
            return Ok(Module::native(name, uri));
        }
        let m = Module::new(name, uri);

        let n_globals = r.read_u32()?;
        check_count(n_globals, "global")?;
        for _ in 0..n_globals {
            let gname = r.read_str()?;
            m.add_global(gname, Item::Nil);
        }

        let n_requests = r.read_u32()?;
        check_count(n_requests, "request")?;
        for _ in 0..n_requests {
            let rname = r.read_str()?;
            let is_uri = r.read_bool()?;
            let is_load = r.read_bool()?;
            m.add_request(rname, is_uri, is_load);
        }

        let n_imports = r.read_u32()?;
        check_count(n_imports, "import")?;
        for _ in 0..n_imports {
            let req = r.read_i32()?;
            let request = if req < 0 {
                None
            } else {
                let req = req as u32;
                if req >= n_requests {
                    return Err(Error::deser(format!(
                        "import refers to request {req} of {n_requests}"
                    )));
                }
                Some(req)
            };
            let wildcard = r.read_bool()?;
            let n_syms = r.read_u32()?;
            let mut symbols = checked_vec::<String>(n_syms, "import symbol")?;
            for _ in 0..n_syms {
                symbols.push(r.read_str()?);
            }
            let target_ns = if r.read_bool()? {
                Some(r.read_str()?)
            } else {
                None
            };
            m.add_import(ImportDef {
                request,
                symbols,
                wildcard,
                target_ns,
            })
            .map_err(|e| Error::deser(e.to_string()))?;
        }

        // association lists must match what add_import rebuilt
        let rebuilt = m.requests();
        for (idx, req) in rebuilt.iter().enumerate() {
            let n = r.read_u32()?;
            let mut stored = checked_vec::<u32>(n, "association")?;
            for _ in 0..n {
                let id = r.read_u32()?;
                if id >= n_imports {
                    return Err(Error::deser(format!(
                        "request {idx} associates import {id} of {n_imports}"
                    )));
                }
                stored.push(id);
            }
            if stored != req.import_defs {
                return Err(Error::deser(format!(
                    "request {idx} association list does not match its imports"
                )));
            }
        }

        let n_externs = r.read_u32()?;
        check_count(n_externs, "extern")?;
        for _ in 0..n_externs {
            let ename = r.read_str()?;
            let line = r.read_u32()?;
            let def = r.read_i32()?;
            let import_def = if def < 0 {
                None
            } else {
                let def = def as u32;
                if def >= n_imports {
                    return Err(Error::deser(format!(
                        "extern '{ename}' refers to import {def} of {n_imports}"
                    )));
                }
                Some(def)
            };
            let source_name = if r.read_bool()? {
                Some(r.read_str()?)
            } else {
                None
            };
            m.add_extern(ename, line, import_def, source_name);
        }

        let n_trans = r.read_u32()?;
        check_count(n_trans, "namespace translation")?;
        for _ in 0..n_trans {
            let alias = r.read_str()?;
            let def = r.read_u32()?;
            if def >= n_imports {
                return Err(Error::deser(format!(
                    "namespace alias '{alias}' refers to import {def} of {n_imports}"
                )));
            }
            m.set_ns_translation(alias, def);
        }

        let n_attrs = r.read_u32()?;
        check_count(n_attrs, "attribute")?;
        for _ in 0..n_attrs {
            let aname = r.read_str()?;
            m.set_attribute(aname, Item::Nil);
        }

        let n_istr = r.read_u32()?;
        check_count(n_istr, "istring")?;
        for _ in 0..n_istr {
            m.add_istring(r.read_str()?);
        }

        let n_exports = r.read_u32()?;
        check_count(n_exports, "export")?;
        for _ in 0..n_exports {
            m.declare_export(r.read_str()?);
        }

        Ok(m)
    }

    // ===== live-state flatten/unflatten =====

    /// Collapses the live state into a flat item vector: global values,
    /// mantras, pending-init classes and attribute values, each section
    /// closed by a Nil sentinel. Native modules flatten to nothing.
    pub fn flatten(&self, gc: &Collector) -> RunResult<Vec<Item>> {
        let mut out = Vec::new();
        if self.is_native() {
            return Ok(out);
        }
        for cell in self.globals.read().unwrap().iter() {
            out.push(*cell.read().unwrap());
        }
        out.push(Item::Nil);
        for (_, entry) in self.mantra_entries() {
            let obj = match entry.mantra {
                Mantra::Function(f) => HeapObject::Func(f),
                Mantra::Class(c) => HeapObject::Class(c),
            };
            out.push(gc.store_item(obj));
        }
        out.push(Item::Nil);
        for class in self.pending_init_classes() {
            out.push(gc.store_item(HeapObject::Class(class)));
        }
        out.push(Item::Nil);
        for name in self.attribute_names() {
            out.push(self.attribute(&name).unwrap_or(Item::Nil));
        }
        out.push(Item::Nil);
        Ok(out)
    }

    /// Rebuilds live state from a flattened vector onto a structurally
    /// restored module of the same shape. A mantra carrying the entry name
    /// is re-flagged as the module main.
    pub fn unflatten(self: &Arc<Self>, gc: &Collector, items: &[Item]) -> RunResult<()> {
        if self.is_native() {
            return Ok(());
        }
        let mut cursor = items.iter();
        let mut next = || cursor.next().copied();

        let globals = self.globals.read().unwrap().clone();
        for cell in &globals {
            let v = next().ok_or_else(|| Error::deser("flattened globals truncated"))?;
            *cell.write().unwrap() = v;
        }
        drop(globals);
        if next() != Some(Item::Nil) {
            return Err(Error::deser("missing sentinel after globals"));
        }

        loop {
            let item = next().ok_or_else(|| Error::deser("flattened mantras truncated"))?;
            if item == Item::Nil {
                break;
            }
            let obj = gc
                .deref(&item)
                .ok_or_else(|| Error::deser("dangling mantra reference"))?;
            let mantra = match &*obj {
                HeapObject::Func(f) => Mantra::Function(Arc::clone(f)),
                HeapObject::Class(c) => Mantra::Class(Arc::clone(c)),
                other => {
                    return Err(Error::deser(format!(
                        "{} is not a mantra",
                        other.type_name()
                    )));
                }
            };
            self.add_mantra(mantra, false)
                .map_err(|e| Error::deser(e.to_string()))?;
        }

        loop {
            let item = next().ok_or_else(|| Error::deser("flattened init list truncated"))?;
            if item == Item::Nil {
                break;
            }
            let obj = gc
                .deref(&item)
                .ok_or_else(|| Error::deser("dangling class reference"))?;
            let HeapObject::Class(class) = &*obj else {
                return Err(Error::deser("pending-init entry is not a class"));
            };
            if self.get_mantra(class.name()).is_none() {
                return Err(Error::deser(format!(
                    "pending-init class '{}' is not registered",
                    class.name()
                )));
            }
        }

        for name in self.attribute_names() {
            let v = next().ok_or_else(|| Error::deser("flattened attributes truncated"))?;
            self.set_attribute(name, v);
        }
        if next() != Some(Item::Nil) {
            return Err(Error::deser("missing sentinel after attributes"));
        }
        Ok(())
    }

    // ===== the precompiled container =====

    /// Writes the full precompiled image: magic, format version, the
    /// structural store, then the live state.
    pub fn save_precompiled<W: Write>(
        &self,
        gc: &Collector,
        w: &mut DataWriter<W>,
    ) -> RunResult<()> {
        w.write_bytes(&MAGIC)?;
        w.write_u16(FORMAT_VERSION)?;
        self.store(w)?;
        if self.is_native() {
            return w.flush();
        }

        // mantras first so global values can reference them by name
        let entries = self.mantra_entries();
        w.write_u32(entries.len() as u32)?;
        for (_, entry) in &entries {
            match &entry.mantra {
                Mantra::Function(f) => {
                    w.write_u8(1)?;
                    write_function(w, f)?;
                }
                Mantra::Class(c) => {
                    w.write_u8(2)?;
                    write_class(w, c)?;
                }
            }
        }

        for cell in self.globals.read().unwrap().iter() {
            encode_item(gc, self, w, &cell.read().unwrap().clone(), 0)?;
        }

        let pending = self.pending_init_classes();
        w.write_u32(pending.len() as u32)?;
        for class in &pending {
            w.write_str(class.name())?;
        }

        for name in self.attribute_names() {
            let v = self.attribute(&name).unwrap_or(Item::Nil);
            encode_item(gc, self, w, &v, 0)?;
        }
        w.flush()
    }

    /// Reads a precompiled image. A foreign or corrupt stream fails with a
    /// deserialization error and nothing is registered anywhere.
    pub fn restore_precompiled<R: Read>(
        gc: &Collector,
        r: &mut DataReader<R>,
    ) -> RunResult<Arc<Module>> {
        let mut magic = [0u8; 4];
        for b in &mut magic {
            *b = r.read_u8()?;
        }
        if magic != MAGIC {
            return Err(Error::deser("not a precompiled module"));
        }
        let version = r.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(Error::deser(format!(
                "unsupported container version {version}"
            )));
        }
        let m = Module::restore(r)?;
        if m.is_native() {
            return Ok(m);
        }

        let n_mantras = r.read_u32()?;
        check_count(n_mantras, "mantra")?;
        for _ in 0..n_mantras {
            let mantra = match r.read_u8()? {
                1 => Mantra::Function(Arc::new(read_function(r, 0)?)),
                2 => Mantra::Class(Arc::new(read_class(r, 0)?)),
                k => return Err(Error::deser(format!("unknown mantra kind {k}"))),
            };
            m.add_mantra(mantra, false)
                .map_err(|e| Error::deser(e.to_string()))?;
        }

        let globals = m.globals.read().unwrap().clone();
        for cell in &globals {
            let v = decode_item(gc, &m, r, 0)?;
            *cell.write().unwrap() = v;
        }

        let n_pending = r.read_u32()?;
        check_count(n_pending, "pending class")?;
        for _ in 0..n_pending {
            let cname = r.read_str()?;
            match m.get_mantra(&cname) {
                Some(Mantra::Class(c)) if c.needs_init() => {}
                _ => {
                    return Err(Error::deser(format!(
                        "pending-init class '{cname}' is not a registered class"
                    )));
                }
            }
        }

        for name in m.attribute_names() {
            let v = decode_item(gc, &m, r, 0)?;
            m.set_attribute(name, v);
        }
        Ok(m)
    }
}

// ===== item codec =====

const ITEM_NIL: u8 = 0;
const ITEM_BOOL: u8 = 1;
const ITEM_INT: u8 = 2;
const ITEM_FLOAT: u8 = 3;
const ITEM_STR: u8 = 4;
const ITEM_ARRAY: u8 = 5;
const ITEM_FUNC: u8 = 6;
const ITEM_CLASS: u8 = 7;
const ITEM_REF: u8 = 8;

fn encode_item<W: Write>(
    gc: &Collector,
    module: &Module,
    w: &mut DataWriter<W>,
    item: &Item,
    depth: u32,
) -> RunResult<()> {
    if depth > MAX_DEPTH {
        return Err(Error::param("item nesting too deep to serialize"));
    }
    match item {
        Item::Nil => w.write_u8(ITEM_NIL),
        Item::Bool(b) => {
            w.write_u8(ITEM_BOOL)?;
            w.write_bool(*b)
        }
        Item::Int(i) => {
            w.write_u8(ITEM_INT)?;
            w.write_i64(*i)
        }
        Item::Float(f) => {
            w.write_u8(ITEM_FLOAT)?;
            w.write_f64(*f)
        }
        Item::User(_) => Err(Error::param("object instances are not serializable")),
        Item::Deep(_) => {
            let obj = gc
                .deref(item)
                .ok_or_else(|| Error::param("dangling reference in serialized state"))?;
            match &*obj {
                HeapObject::Str(s) => {
                    w.write_u8(ITEM_STR)?;
                    w.write_str(s)
                }
                HeapObject::Array(items) => {
                    let items = items.read().unwrap().clone();
                    w.write_u8(ITEM_ARRAY)?;
                    w.write_u32(items.len() as u32)?;
                    for it in &items {
                        encode_item(gc, module, w, it, depth + 1)?;
                    }
                    Ok(())
                }
                HeapObject::Func(f) => {
                    if let Some(Mantra::Function(own)) = module.get_mantra(f.name()) {
                        if Arc::ptr_eq(&own, f) {
                            w.write_u8(ITEM_REF)?;
                            return w.write_str(f.name());
                        }
                    }
                    w.write_u8(ITEM_FUNC)?;
                    write_function(w, f)
                }
                HeapObject::Class(c) => {
                    if let Some(Mantra::Class(own)) = module.get_mantra(c.name()) {
                        if Arc::ptr_eq(&own, c) {
                            w.write_u8(ITEM_REF)?;
                            return w.write_str(c.name());
                        }
                    }
                    w.write_u8(ITEM_CLASS)?;
                    write_class(w, c)
                }
                other => Err(Error::param(format!(
                    "{} values are not serializable",
                    other.type_name()
                ))),
            }
        }
    }
}

fn decode_item<R: Read>(
    gc: &Collector,
    module: &Arc<Module>,
    r: &mut DataReader<R>,
    depth: u32,
) -> RunResult<Item> {
    if depth > MAX_DEPTH {
        return Err(Error::deser("item nesting too deep"));
    }
    let tag = r.read_u8()?;
    let item = match tag {
        ITEM_NIL => Item::Nil,
        ITEM_BOOL => Item::Bool(r.read_bool()?),
        ITEM_INT => Item::Int(r.read_i64()?),
        ITEM_FLOAT => Item::Float(r.read_f64()?),
        ITEM_STR => gc.store_item(HeapObject::Str(r.read_str()?)),
        ITEM_ARRAY => {
            let n = r.read_u32()?;
            let mut items = checked_vec::<Item>(n, "array element")?;
            for _ in 0..n {
                items.push(decode_item(gc, module, r, depth + 1)?);
            }
            gc.store_item(HeapObject::Array(std::sync::RwLock::new(items)))
        }
        ITEM_FUNC => gc.store_item(HeapObject::Func(Arc::new(read_function(r, 0)?))),
        ITEM_CLASS => gc.store_item(HeapObject::Class(Arc::new(read_class(r, 0)?))),
        ITEM_REF => {
            let name = r.read_str()?;
            match module.get_mantra(&name) {
                Some(Mantra::Function(f)) => gc.store_item(HeapObject::Func(f)),
                Some(Mantra::Class(c)) => gc.store_item(HeapObject::Class(c)),
                None => {
                    return Err(Error::deser(format!(
                        "reference to unknown mantra '{name}'"
                    )));
                }
            }
        }
        other => return Err(Error::deser(format!("unknown item tag {other}"))),
    };
    Ok(item)
}

// ===== mantra codec =====

fn write_function<W: Write>(w: &mut DataWriter<W>, f: &Function) -> RunResult<()> {
    let FuncBody::Syntactic(body) = f.body() else {
        return Err(Error::param(format!(
            "native function '{}' cannot be serialized",
            f.name()
        )));
    };
    w.write_str(f.name())?;
    w.write_u32(f.line())?;
    w.write_bool(f.is_eta())?;
    w.write_str(f.signature())?;
    match f.method_of() {
        Some(c) => {
            w.write_bool(true)?;
            w.write_str(c)?;
        }
        None => w.write_bool(false)?,
    }
    write_names(w, f.vars().params())?;
    write_names(w, f.vars().locals())?;
    write_names(w, f.vars().closed())?;
    write_stmt(w, body, 0)
}

fn read_function<R: Read>(r: &mut DataReader<R>, depth: u32) -> RunResult<Function> {
    let name = r.read_str()?;
    let line = r.read_u32()?;
    let eta = r.read_bool()?;
    let signature = r.read_str()?;
    let method_of = if r.read_bool()? {
        Some(r.read_str()?)
    } else {
        None
    };
    let params = read_names(r)?;
    let locals = read_names(r)?;
    let closed = read_names(r)?;
    let body = read_stmt(r, depth)?;

    let mut f = Function::new(name, line, FuncBody::Syntactic(Arc::new(body)));
    f.set_eta(eta);
    f.set_signature(signature);
    if let Some(c) = method_of {
        f.set_method_of(c);
    }
    for p in params {
        f.vars_mut().add_param(p);
    }
    for l in locals {
        f.vars_mut().add_local(l);
    }
    for c in closed {
        f.vars_mut().add_closed(c);
    }
    Ok(f)
}

fn write_class<W: Write>(w: &mut DataWriter<W>, c: &ClassDef) -> RunResult<()> {
    w.write_str(c.name())?;
    w.write_u32(c.line())?;
    w.write_bool(c.needs_init())?;
    match c.constructor() {
        Some(ctor) => {
            w.write_bool(true)?;
            write_function(w, ctor)?;
        }
        None => w.write_bool(false)?,
    }
    let methods = c.methods();
    w.write_u32(methods.len() as u32)?;
    for m in &methods {
        write_function(w, m)?;
    }
    Ok(())
}

fn read_class<R: Read>(r: &mut DataReader<R>, depth: u32) -> RunResult<ClassDef> {
    let name = r.read_str()?;
    let line = r.read_u32()?;
    let needs_init = r.read_bool()?;
    let mut class = ClassDef::new(name, line, needs_init);
    if r.read_bool()? {
        class.set_constructor(Arc::new(read_function(r, depth)?));
    }
    let n = r.read_u32()?;
    check_count(n, "method")?;
    for _ in 0..n {
        class.add_method(Arc::new(read_function(r, depth)?));
    }
    Ok(class)
}

fn write_names<W: Write>(w: &mut DataWriter<W>, names: &[String]) -> RunResult<()> {
    w.write_u32(names.len() as u32)?;
    for n in names {
        w.write_str(n)?;
    }
    Ok(())
}

fn read_names<R: Read>(r: &mut DataReader<R>) -> RunResult<Vec<String>> {
    let n = r.read_u32()?;
    let mut names = checked_vec::<String>(n, "name")?;
    for _ in 0..n {
        names.push(r.read_str()?);
    }
    Ok(names)
}

// ===== code tree codec =====

const STMT_EXPR: u8 = 0;
const STMT_BLOCK: u8 = 1;
const STMT_IF: u8 = 2;
const STMT_WHILE: u8 = 3;
const STMT_RETURN: u8 = 4;
const STMT_GLOBAL: u8 = 5;
const STMT_TRY: u8 = 6;

fn write_stmt<W: Write>(w: &mut DataWriter<W>, s: &Stmt, depth: u32) -> RunResult<()> {
    if depth > MAX_DEPTH {
        return Err(Error::param("statement tree too deep to serialize"));
    }
    match s {
        Stmt::Expr(e) => {
            w.write_u8(STMT_EXPR)?;
            write_expr(w, e, depth + 1)
        }
        Stmt::Block(stmts) => {
            w.write_u8(STMT_BLOCK)?;
            w.write_u32(stmts.len() as u32)?;
            for s in stmts {
                write_stmt(w, s, depth + 1)?;
            }
            Ok(())
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            w.write_u8(STMT_IF)?;
            write_expr(w, cond, depth + 1)?;
            write_stmt(w, then_body, depth + 1)?;
            match else_body {
                Some(e) => {
                    w.write_bool(true)?;
                    write_stmt(w, e, depth + 1)
                }
                None => w.write_bool(false),
            }
        }
        Stmt::While { cond, body } => {
            w.write_u8(STMT_WHILE)?;
            write_expr(w, cond, depth + 1)?;
            write_stmt(w, body, depth + 1)
        }
        Stmt::Return(value) => {
            w.write_u8(STMT_RETURN)?;
            match value {
                Some(e) => {
                    w.write_bool(true)?;
                    write_expr(w, e, depth + 1)
                }
                None => w.write_bool(false),
            }
        }
        Stmt::Global { names, line } => {
            w.write_u8(STMT_GLOBAL)?;
            w.write_u32(*line)?;
            write_names(w, names)
        }
        Stmt::Try {
            body,
            catch_var,
            handler,
        } => {
            w.write_u8(STMT_TRY)?;
            write_stmt(w, body, depth + 1)?;
            w.write_str(catch_var)?;
            write_stmt(w, handler, depth + 1)
        }
    }
}

fn read_stmt<R: Read>(r: &mut DataReader<R>, depth: u32) -> RunResult<Stmt> {
    if depth > MAX_DEPTH {
        return Err(Error::deser("statement tree too deep"));
    }
    let tag = r.read_u8()?;
    let s = match tag {
        STMT_EXPR => Stmt::Expr(Arc::new(read_expr(r, depth + 1)?)),
        STMT_BLOCK => {
            let n = r.read_u32()?;
            let mut stmts = checked_vec::<Arc<Stmt>>(n, "statement")?;
            for _ in 0..n {
                stmts.push(Arc::new(read_stmt(r, depth + 1)?));
            }
            Stmt::Block(stmts)
        }
        STMT_IF => {
            let cond = Arc::new(read_expr(r, depth + 1)?);
            let then_body = Arc::new(read_stmt(r, depth + 1)?);
            let else_body = if r.read_bool()? {
                Some(Arc::new(read_stmt(r, depth + 1)?))
            } else {
                None
            };
            Stmt::If {
                cond,
                then_body,
                else_body,
            }
        }
        STMT_WHILE => Stmt::While {
            cond: Arc::new(read_expr(r, depth + 1)?),
            body: Arc::new(read_stmt(r, depth + 1)?),
        },
        STMT_RETURN => {
            let value = if r.read_bool()? {
                Some(Arc::new(read_expr(r, depth + 1)?))
            } else {
                None
            };
            Stmt::Return(value)
        }
        STMT_GLOBAL => {
            let line = r.read_u32()?;
            let names = read_names(r)?;
            Stmt::Global { names, line }
        }
        STMT_TRY => {
            let body = Arc::new(read_stmt(r, depth + 1)?);
            let catch_var = r.read_str()?;
            let handler = Arc::new(read_stmt(r, depth + 1)?);
            Stmt::Try {
                body,
                catch_var,
                handler,
            }
        }
        other => return Err(Error::deser(format!("unknown statement tag {other}"))),
    };
    Ok(s)
}

const EXPR_LIT: u8 = 0;
const EXPR_NAME: u8 = 1;
const EXPR_ASSIGN: u8 = 2;
const EXPR_UNARY: u8 = 3;
const EXPR_BINARY: u8 = 4;
const EXPR_COMPARE: u8 = 5;
const EXPR_AND: u8 = 6;
const EXPR_OR: u8 = 7;
const EXPR_TERNARY: u8 = 8;
const EXPR_CALL: u8 = 9;
const EXPR_CLOSURE: u8 = 10;

fn write_expr<W: Write>(w: &mut DataWriter<W>, e: &Expr, depth: u32) -> RunResult<()> {
    if depth > MAX_DEPTH {
        return Err(Error::param("expression tree too deep to serialize"));
    }
    match e {
        Expr::Lit(c) => {
            w.write_u8(EXPR_LIT)?;
            write_const(w, c)
        }
        Expr::Name(n) => {
            w.write_u8(EXPR_NAME)?;
            w.write_str(n)
        }
        Expr::Assign { target, value } => {
            w.write_u8(EXPR_ASSIGN)?;
            w.write_str(target)?;
            write_expr(w, value, depth + 1)
        }
        Expr::Unary { op, operand } => {
            w.write_u8(EXPR_UNARY)?;
            w.write_u8(match op {
                UnaryOp::Neg => 0,
                UnaryOp::Not => 1,
            })?;
            write_expr(w, operand, depth + 1)
        }
        Expr::Binary { op, lhs, rhs } => {
            w.write_u8(EXPR_BINARY)?;
            w.write_u8(match op {
                BinOp::Add => 0,
                BinOp::Sub => 1,
                BinOp::Mul => 2,
                BinOp::Div => 3,
            })?;
            write_expr(w, lhs, depth + 1)?;
            write_expr(w, rhs, depth + 1)
        }
        Expr::Compare { op, lhs, rhs } => {
            w.write_u8(EXPR_COMPARE)?;
            w.write_u8(match op {
                CmpOp::Lt => 0,
                CmpOp::Le => 1,
                CmpOp::Gt => 2,
                CmpOp::Ge => 3,
                CmpOp::Eq => 4,
                CmpOp::Ne => 5,
            })?;
            write_expr(w, lhs, depth + 1)?;
            write_expr(w, rhs, depth + 1)
        }
        Expr::And { lhs, rhs } => {
            w.write_u8(EXPR_AND)?;
            write_expr(w, lhs, depth + 1)?;
            write_expr(w, rhs, depth + 1)
        }
        Expr::Or { lhs, rhs } => {
            w.write_u8(EXPR_OR)?;
            write_expr(w, lhs, depth + 1)?;
            write_expr(w, rhs, depth + 1)
        }
        Expr::Ternary {
            cond,
            on_true,
            on_false,
        } => {
            w.write_u8(EXPR_TERNARY)?;
            write_expr(w, cond, depth + 1)?;
            write_expr(w, on_true, depth + 1)?;
            write_expr(w, on_false, depth + 1)
        }
        Expr::Call { callee, args } => {
            w.write_u8(EXPR_CALL)?;
            write_expr(w, callee, depth + 1)?;
            w.write_u32(args.len() as u32)?;
            for a in args {
                write_expr(w, a, depth + 1)?;
            }
            Ok(())
        }
        Expr::Closure(f) => {
            w.write_u8(EXPR_CLOSURE)?;
            write_function(w, f)
        }
    }
}

fn read_expr<R: Read>(r: &mut DataReader<R>, depth: u32) -> RunResult<Expr> {
    if depth > MAX_DEPTH {
        return Err(Error::deser("expression tree too deep"));
    }
    let tag = r.read_u8()?;
    let e = match tag {
        EXPR_LIT => Expr::Lit(read_const(r)?),
        EXPR_NAME => Expr::Name(r.read_str()?),
        EXPR_ASSIGN => Expr::Assign {
            target: r.read_str()?,
            value: Arc::new(read_expr(r, depth + 1)?),
        },
        EXPR_UNARY => {
            let op = match r.read_u8()? {
                0 => UnaryOp::Neg,
                1 => UnaryOp::Not,
                k => return Err(Error::deser(format!("unknown unary op {k}"))),
            };
            Expr::Unary {
                op,
                operand: Arc::new(read_expr(r, depth + 1)?),
            }
        }
        EXPR_BINARY => {
            let op = match r.read_u8()? {
                0 => BinOp::Add,
                1 => BinOp::Sub,
                2 => BinOp::Mul,
                3 => BinOp::Div,
                k => return Err(Error::deser(format!("unknown binary op {k}"))),
            };
            Expr::Binary {
                op,
                lhs: Arc::new(read_expr(r, depth + 1)?),
                rhs: Arc::new(read_expr(r, depth + 1)?),
            }
        }
        EXPR_COMPARE => {
            let op = match r.read_u8()? {
                0 => CmpOp::Lt,
                1 => CmpOp::Le,
                2 => CmpOp::Gt,
                3 => CmpOp::Ge,
                4 => CmpOp::Eq,
                5 => CmpOp::Ne,
                k => return Err(Error::deser(format!("unknown comparison op {k}"))),
            };
            Expr::Compare {
                op,
                lhs: Arc::new(read_expr(r, depth + 1)?),
                rhs: Arc::new(read_expr(r, depth + 1)?),
            }
        }
        EXPR_AND => Expr::And {
            lhs: Arc::new(read_expr(r, depth + 1)?),
            rhs: Arc::new(read_expr(r, depth + 1)?),
        },
        EXPR_OR => Expr::Or {
            lhs: Arc::new(read_expr(r, depth + 1)?),
            rhs: Arc::new(read_expr(r, depth + 1)?),
        },
        EXPR_TERNARY => Expr::Ternary {
            cond: Arc::new(read_expr(r, depth + 1)?),
            on_true: Arc::new(read_expr(r, depth + 1)?),
            on_false: Arc::new(read_expr(r, depth + 1)?),
        },
        EXPR_CALL => {
            let callee = Arc::new(read_expr(r, depth + 1)?);
            let n = r.read_u32()?;
            let mut args = checked_vec::<Arc<Expr>>(n, "argument")?;
            for _ in 0..n {
                args.push(Arc::new(read_expr(r, depth + 1)?));
            }
            Expr::Call { callee, args }
        }
        EXPR_CLOSURE => Expr::Closure(Arc::new(read_function(r, depth + 1)?)),
        other => return Err(Error::deser(format!("unknown expression tag {other}"))),
    };
    Ok(e)
}

fn write_const<W: Write>(w: &mut DataWriter<W>, c: &Const) -> RunResult<()> {
    match c {
        Const::Nil => w.write_u8(0),
        Const::Bool(b) => {
            w.write_u8(1)?;
            w.write_bool(*b)
        }
        Const::Int(i) => {
            w.write_u8(2)?;
            w.write_i64(*i)
        }
        Const::Float(f) => {
            w.write_u8(3)?;
            w.write_f64(*f)
        }
        Const::Str(s) => {
            w.write_u8(4)?;
            w.write_str(s)
        }
    }
}

fn read_const<R: Read>(r: &mut DataReader<R>) -> RunResult<Const> {
    let c = match r.read_u8()? {
        0 => Const::Nil,
        1 => Const::Bool(r.read_bool()?),
        2 => Const::Int(r.read_i64()?),
        3 => Const::Float(r.read_f64()?),
        4 => Const::Str(r.read_str()?),
        k => return Err(Error::deser(format!("unknown literal tag {k}"))),
    };
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::io::Cursor;

    fn sample_module() -> Arc<Module> {
        let m = Module::new("sample", "kes:/sample.kes");
        let req = m.add_request("dep", false, false);
        let def = m
            .add_import(ImportDef {
                request: Some(req),
                symbols: vec!["helper".to_string()],
                wildcard: false,
                target_ns: Some("dep".to_string()),
            })
            .unwrap();
        m.add_extern("helper", 4, Some(def), None);
        m.set_ns_translation("d", def);
        m.add_global("counter", Item::Int(0));
        m.set_attribute("version", Item::Nil);
        m.add_istring("greeting");
        m.declare_export("counter");
        m
    }

    fn round_trip(m: &Module) -> RunResult<Arc<Module>> {
        let mut buf = Vec::new();
        m.store(&mut DataWriter::new(&mut buf))?;
        Module::restore(&mut DataReader::new(Cursor::new(buf)))
    }

    #[test]
    fn test_store_restore_round_trip() {
        let m = sample_module();
        let r = round_trip(&m).unwrap();
        assert_eq!(r.name(), "sample");
        assert_eq!(r.uri(), "kes:/sample.kes");
        assert_eq!(r.requests(), m.requests());
        assert_eq!(r.imports(), m.imports());
        assert_eq!(r.global_names(), m.global_names());
        assert_eq!(r.ns_translation("d"), Some(0));
        assert_eq!(r.attribute_names(), vec!["version".to_string()]);
        assert_eq!(r.istrings(), vec!["greeting".to_string()]);
        let externs: Vec<String> =
            r.with_symbols(|t| t.externs().map(|(n, _)| n.clone()).collect());
        assert_eq!(externs, vec!["helper".to_string()]);
    }

    #[test]
    fn test_native_module_stores_identity_only() {
        let m = Module::native("host", "native:/host");
        let r = round_trip(&m).unwrap();
        assert!(r.is_native());
        assert_eq!(r.name(), "host");
        assert_eq!(r.uri(), "native:/host");
    }

    #[test]
    fn test_out_of_range_import_id_rejected() {
        let m = sample_module();
        let mut buf = Vec::new();
        m.store(&mut DataWriter::new(&mut buf)).unwrap();
        // the extern's import-def id sits 5 bytes after the extern name
        // and its line; corrupt it to a huge value
        let needle = b"helper";
        let pos = buf
            .windows(needle.len())
            .rposition(|w| w == needle)
            .unwrap();
        let id_at = pos + needle.len() + 4; // skip line
        buf[id_at..id_at + 4].copy_from_slice(&99i32.to_le_bytes());
        let err = Module::restore(&mut DataReader::new(Cursor::new(buf))).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }

    #[test]
    fn test_foreign_stream_rejected_cleanly() {
        let gc = Collector::new();
        let bytes = b"ELF\x7f not a module at all".to_vec();
        let err =
            Module::restore_precompiled(&gc, &mut DataReader::new(Cursor::new(bytes))).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }

    fn entry_function(name: &str, result: i64) -> Function {
        Function::new(
            name,
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Return(Some(Arc::new(Expr::Lit(
                Const::Int(result),
            )))))),
        )
    }

    #[test]
    fn test_flatten_unflatten_reflags_main() {
        let gc = Collector::new();
        let m = Module::new("m", "kes:/m.kes");
        m.add_mantra(
            Mantra::Function(Arc::new(entry_function(crate::module::MAIN_NAME, 7))),
            false,
        )
        .unwrap();
        m.add_mantra(Mantra::Function(Arc::new(entry_function("aux", 1))), true)
            .unwrap();
        m.add_global("x", Item::Int(41));
        m.set_attribute("tag", Item::Int(3));
        let flat = m.flatten(&gc).unwrap();

        // a structurally identical twin, as restore would produce it
        let twin = round_trip(&m).unwrap();
        assert!(twin.main_function().is_none());
        twin.unflatten(&gc, &flat).unwrap();
        assert!(twin.main_function().is_some());
        assert_eq!(
            *twin.cell_for("x").unwrap().read().unwrap(),
            Item::Int(41)
        );
        assert!(twin.get_mantra("aux").is_some());
        assert_eq!(twin.attribute("tag"), Some(Item::Int(3)));
        // export flag survived through the structural image
        assert!(twin.exported_names().contains(&"aux".to_string()));
    }

    #[test]
    fn test_precompiled_round_trip_preserves_behavior() {
        let gc = Collector::new();
        let m = Module::new("m", "kes:/m.kes");
        m.add_mantra(
            Mantra::Function(Arc::new(entry_function(crate::module::MAIN_NAME, 99))),
            false,
        )
        .unwrap();
        m.add_global("x", Item::Int(5));

        let mut buf = Vec::new();
        m.save_precompiled(&gc, &mut DataWriter::new(&mut buf)).unwrap();
        let r =
            Module::restore_precompiled(&gc, &mut DataReader::new(Cursor::new(buf))).unwrap();

        let mut ctx = crate::vm::VmContext::new(0, Arc::new(Collector::new()), None);
        // run against a fresh collector to prove the module is
        // self-contained
        let out = ctx.call_main(&r).unwrap();
        assert_eq!(out, Item::Int(99));
        assert_eq!(*r.cell_for("x").unwrap().read().unwrap(), Item::Int(5));
    }

    #[test]
    fn test_truncated_precompiled_rolls_back() {
        let gc = Collector::new();
        let m = sample_module();
        let mut buf = Vec::new();
        m.save_precompiled(&gc, &mut DataWriter::new(&mut buf)).unwrap();
        buf.truncate(buf.len() / 2);
        let err =
            Module::restore_precompiled(&gc, &mut DataReader::new(Cursor::new(buf))).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }
}
