//! The module loader: search path, source-vs-cache policy, and the
//! compile-or-restore pipeline.
//!
//! Every policy knob is its own enum, so a precompiled-cache setting can
//! never be mistaken for a template-check setting. The loader resolves
//! logical names through an ordered search path (first match wins) and
//! URIs directly, always through the configured [`Vfs`].

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, RunResult};
use crate::gc::Collector;
use crate::module::Module;
use crate::serial::{DataReader, DataWriter};
use crate::vfs::Vfs;

/// Whether freshly compiled modules are written back as precompiled
/// caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SavePrecompiled {
    /// Never write caches.
    Never,
    /// Write caches, silently ignoring failures.
    #[default]
    Try,
    /// Write caches; a failed write fails the load.
    Mandatory,
}

/// When a source should be compiled in template-document mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateCheck {
    Never,
    /// Template mode for sources carrying the template extension.
    #[default]
    ByExtension,
    Always,
}

/// How to choose between a source file and its precompiled cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourcePreference {
    /// Use whichever of the pair is newer; ties go to the cache.
    #[default]
    PreferNewer,
    /// Compile the source whenever one exists.
    AlwaysSource,
    /// Read the cache whenever one exists, even against a newer source.
    AlwaysPrecompiled,
}

const KNOWN_ENCODINGS: &[&str] = &["utf-8", "ascii", "latin-1"];

/// Loader configuration; serde-mapped so project files can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoaderConfig {
    pub save_precompiled: SavePrecompiled,
    pub template_check: TemplateCheck,
    pub source_preference: SourcePreference,
    /// Write caches next to sources on non-local backends too.
    pub save_remote: bool,
    pub source_encoding: String,
    pub source_ext: String,
    pub precompiled_ext: String,
    pub template_ext: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            save_precompiled: SavePrecompiled::default(),
            template_check: TemplateCheck::default(),
            source_preference: SourcePreference::default(),
            save_remote: false,
            source_encoding: "utf-8".to_string(),
            source_ext: "kes".to_string(),
            precompiled_ext: "kfm".to_string(),
            template_ext: "ktd".to_string(),
        }
    }
}

/// Turns a source text into a syntactic module. The grammar lives with
/// the embedder; the engine only drives the pipeline.
pub trait SourceCompiler: Send + Sync {
    fn compile(&self, uri: &str, source: &str, template: bool) -> RunResult<Arc<Module>>;
}

pub struct ModLoader {
    vfs: Arc<dyn Vfs>,
    compiler: Option<Arc<dyn SourceCompiler>>,
    paths: RwLock<VecDeque<String>>,
    config: RwLock<LoaderConfig>,
}

impl ModLoader {
    #[must_use]
    pub fn new(vfs: Arc<dyn Vfs>, compiler: Option<Arc<dyn SourceCompiler>>) -> Self {
        ModLoader {
            vfs,
            compiler,
            paths: RwLock::new(VecDeque::new()),
            config: RwLock::new(LoaderConfig::default()),
        }
    }

    /// Adds a directory at the end of the search path.
    pub fn append_path(&self, dir: impl Into<String>) {
        self.paths.write().unwrap().push_back(dir.into());
    }

    /// Adds a directory ahead of everything already in the search path.
    pub fn prepend_path(&self, dir: impl Into<String>) {
        self.paths.write().unwrap().push_front(dir.into());
    }

    #[must_use]
    pub fn search_path(&self) -> Vec<String> {
        self.paths.read().unwrap().iter().cloned().collect()
    }

    #[must_use]
    pub fn config(&self) -> LoaderConfig {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: LoaderConfig) -> RunResult<()> {
        if !KNOWN_ENCODINGS.contains(&config.source_encoding.as_str()) {
            return Err(Error::param(format!(
                "unknown source encoding '{}'",
                config.source_encoding
            )));
        }
        *self.config.write().unwrap() = config;
        Ok(())
    }

    /// Selects the source encoding; unknown names are parameter errors.
    pub fn set_source_encoding(&self, name: &str) -> RunResult<()> {
        if !KNOWN_ENCODINGS.contains(&name) {
            return Err(Error::param(format!("unknown source encoding '{name}'")));
        }
        self.config.write().unwrap().source_encoding = name.to_string();
        Ok(())
    }

    /// Resolves a logical module name through the search path, first
    /// match wins, and loads it under the source-vs-cache policy. Each
    /// directory is probed for a plain source, a template document and a
    /// precompiled cache; a plain source shadows a template.
    pub fn load_name(&self, gc: &Collector, name: &str) -> RunResult<Arc<Module>> {
        let config = self.config();
        let dirs = self.search_path();
        for dir in &dirs {
            let cache_uri = format!("{dir}/{name}.{}", config.precompiled_ext);
            let source = [&config.source_ext, &config.template_ext]
                .into_iter()
                .map(|ext| format!("{dir}/{name}.{ext}"))
                .find_map(|uri| self.vfs.stat(&uri).map(|meta| (uri, meta)));
            let cache = self.vfs.stat(&cache_uri);
            let use_source = match (&source, &cache) {
                (None, None) => continue,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((_, s)), Some(c)) => match config.source_preference {
                    SourcePreference::AlwaysSource => true,
                    SourcePreference::AlwaysPrecompiled => false,
                    SourcePreference::PreferNewer => s.mtime > c.mtime,
                },
            };
            return match source {
                Some((uri, _)) if use_source => {
                    self.compile_uri(gc, &uri, Some(&cache_uri), &config)
                }
                _ => self.restore_uri(gc, &cache_uri),
            };
        }
        Err(Error::code(format!(
            "module '{name}' not found in search path"
        )))
    }

    /// Loads a module addressed directly by URI.
    pub fn load_uri(&self, gc: &Collector, uri: &str) -> RunResult<Arc<Module>> {
        let config = self.config();
        if uri.ends_with(&format!(".{}", config.precompiled_ext)) {
            return self.restore_uri(gc, uri);
        }
        if config.source_preference == SourcePreference::AlwaysPrecompiled {
            let cache_uri = swap_ext(uri, &config.precompiled_ext);
            if self.vfs.stat(&cache_uri).is_some() {
                return self.restore_uri(gc, &cache_uri);
            }
        }
        let cache_uri = swap_ext(uri, &config.precompiled_ext);
        self.compile_uri(gc, uri, Some(&cache_uri), &config)
    }

    fn compile_uri(
        &self,
        gc: &Collector,
        uri: &str,
        cache_uri: Option<&str>,
        config: &LoaderConfig,
    ) -> RunResult<Arc<Module>> {
        let compiler = self
            .compiler
            .as_ref()
            .ok_or_else(|| Error::code("no source compiler installed"))?;
        let mut bytes = Vec::new();
        self.vfs.open(uri)?.read_to_end(&mut bytes)?;
        let source = decode_source(&bytes, &config.source_encoding, uri)?;
        let template = match config.template_check {
            TemplateCheck::Never => false,
            TemplateCheck::Always => true,
            TemplateCheck::ByExtension => uri.ends_with(&format!(".{}", config.template_ext)),
        };
        let module = compiler.compile(uri, &source, template)?;
        module.set_uri(uri);
        if let Some(cache_uri) = cache_uri {
            self.maybe_save_cache(gc, &module, cache_uri, config)?;
        }
        Ok(module)
    }

    fn restore_uri(&self, gc: &Collector, uri: &str) -> RunResult<Arc<Module>> {
        let mut bytes = Vec::new();
        self.vfs.open(uri)?.read_to_end(&mut bytes)?;
        let module =
            Module::restore_precompiled(gc, &mut DataReader::new(std::io::Cursor::new(bytes)))?;
        module.set_uri(uri);
        Ok(module)
    }

    fn maybe_save_cache(
        &self,
        gc: &Collector,
        module: &Arc<Module>,
        cache_uri: &str,
        config: &LoaderConfig,
    ) -> RunResult<()> {
        if config.save_precompiled == SavePrecompiled::Never {
            return Ok(());
        }
        if !self.vfs.is_local() && !config.save_remote {
            return Ok(());
        }
        let result = (|| {
            let mut buf = Vec::new();
            module.save_precompiled(gc, &mut DataWriter::new(&mut buf))?;
            self.vfs.write_atomic(cache_uri, &buf)
        })();
        match result {
            Ok(()) => Ok(()),
            // best-effort mode swallows the failure
            Err(_) if config.save_precompiled == SavePrecompiled::Try => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn swap_ext(uri: &str, new_ext: &str) -> String {
    match uri.rfind('.') {
        Some(dot) if !uri[dot + 1..].contains('/') => format!("{}.{new_ext}", &uri[..dot]),
        _ => format!("{uri}.{new_ext}"),
    }
}

fn decode_source(bytes: &[u8], encoding: &str, uri: &str) -> RunResult<String> {
    match encoding {
        "utf-8" => String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::code(format!("'{uri}' is not valid utf-8"))),
        "ascii" => {
            if bytes.iter().any(|b| !b.is_ascii()) {
                return Err(Error::code(format!("'{uri}' is not valid ascii")));
            }
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
        "latin-1" => Ok(bytes.iter().map(|&b| b as char).collect()),
        other => Err(Error::param(format!("unknown source encoding '{other}'"))),
    }
}
