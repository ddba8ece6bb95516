//! Kestrel CLI - Command-line interface for the Kestrel execution engine

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use kestrel_core::module::loader::{LoaderConfig, ModLoader};
use kestrel_core::module::space::LoadOptions;
use kestrel_core::serial::DataReader;
use kestrel_core::vfs::{LocalFs, Vfs};
use kestrel_core::{Module, ModSpace, RunOutcome, Runtime};

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(version = kestrel_core::VERSION)]
#[command(about = "The Kestrel execution engine", long_about = None)]
struct Cli {
    /// Project configuration file
    #[arg(long, default_value = "kestrel.toml")]
    config: PathBuf,

    /// Append a directory to the module search path
    #[arg(long = "path")]
    paths: Vec<String>,

    /// Put a directory ahead of the module search path
    #[arg(long = "prepend-path")]
    prepend_paths: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module, run its entry code and its load-requested dependencies
    Run {
        /// Module name resolved through the search path
        module: String,

        /// Treat the module argument as a URI instead of a logical name
        #[arg(long)]
        uri: bool,
    },

    /// Load a module without running it and print its structure
    Inspect {
        /// Module name resolved through the search path
        module: String,

        /// Treat the module argument as a URI instead of a logical name
        #[arg(long)]
        uri: bool,
    },

    /// Check that a precompiled module file restores cleanly
    Verify {
        /// Path to a precompiled module file
        file: PathBuf,
    },
}

/// On-disk project configuration, `kestrel.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ProjectConfig {
    loader: LoaderConfig,
    search_path: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match &cli.command {
        Commands::Run { module, uri } => run(&cli, &config, module, *uri),
        Commands::Inspect { module, uri } => inspect(&cli, &config, module, *uri),
        Commands::Verify { file } => verify(file),
    }
}

fn load_config(path: &PathBuf) -> Result<ProjectConfig> {
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration '{}'", path.display()))?;
    toml::from_str(&text)
        .with_context(|| format!("malformed configuration '{}'", path.display()))
}

fn build_space(cli: &Cli, config: &ProjectConfig, rt: &Runtime) -> Result<Arc<ModSpace>> {
    let loader = ModLoader::new(Arc::new(LocalFs) as Arc<dyn Vfs>, None);
    loader.set_config(config.loader.clone())?;
    for dir in &config.search_path {
        loader.append_path(dir.clone());
    }
    for dir in &cli.paths {
        loader.append_path(dir.clone());
    }
    for dir in &cli.prepend_paths {
        loader.prepend_path(dir.clone());
    }
    if loader.search_path().is_empty() {
        loader.append_path(".");
    }
    Ok(rt.new_space(None, Arc::new(loader)))
}

fn run(cli: &Cli, config: &ProjectConfig, module: &str, uri: bool) -> Result<()> {
    let rt = Runtime::new();
    let space = build_space(cli, config, &rt)?;
    let mut ctx = rt.new_context(Some(Arc::clone(&space)));
    let opts = LoadOptions {
        is_uri: uri,
        as_load: true,
        as_main: true,
        add_to_space: true,
    };
    space.load_module_in_context(module, opts, &mut ctx, None)?;
    loop {
        match ctx.run()? {
            RunOutcome::Completed => return Ok(()),
            RunOutcome::Suspended => {}
            RunOutcome::Terminated => bail!("execution terminated"),
        }
    }
}

fn inspect(cli: &Cli, config: &ProjectConfig, module: &str, uri: bool) -> Result<()> {
    let rt = Runtime::new();
    let space = build_space(cli, config, &rt)?;
    let mut ctx = rt.new_context(Some(Arc::clone(&space)));
    let opts = LoadOptions {
        is_uri: uri,
        add_to_space: true,
        ..LoadOptions::default()
    };
    let module = space.load_module_in_context(module, opts, &mut ctx, None)?;
    print_module(&rt, &module);
    Ok(())
}

fn verify(file: &PathBuf) -> Result<()> {
    let bytes =
        fs::read(file).with_context(|| format!("cannot read '{}'", file.display()))?;
    let rt = Runtime::new();
    let module = Module::restore_precompiled(
        rt.collector(),
        &mut DataReader::new(std::io::Cursor::new(bytes)),
    )
    .with_context(|| format!("'{}' does not restore", file.display()))?;
    println!("ok: module '{}'", module.name());
    print_module(&rt, &module);
    Ok(())
}

fn print_module(rt: &Runtime, module: &Arc<Module>) {
    println!("module {} ({})", module.name(), module.uri());
    if module.is_native() {
        println!("  native");
        return;
    }
    let globals = module.global_names();
    if !globals.is_empty() {
        println!("  globals: {}", globals.join(", "));
    }
    let mantras: Vec<String> = module
        .mantra_entries()
        .into_iter()
        .map(|(name, e)| {
            if e.exported {
                format!("{name} (exported)")
            } else {
                name
            }
        })
        .collect();
    if !mantras.is_empty() {
        println!("  mantras: {}", mantras.join(", "));
    }
    let requests: Vec<String> = module.requests().into_iter().map(|r| r.name).collect();
    if !requests.is_empty() {
        println!("  requests: {}", requests.join(", "));
    }
    for name in module.attribute_names() {
        if let Some(value) = module.attribute(&name) {
            println!(
                "  attribute {name} = {}",
                rt.collector().describe_item(&value, 3)
            );
        }
    }
    if module.main_function().is_some() {
        println!("  has entry code");
    }
}
