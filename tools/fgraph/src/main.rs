//! fgraph - run and inspect filter graphs
//!
//! # Usage
//!
//! ```bash
//! # Generate five seconds of test streams and inspect them
//! fgraph run testsrc:dur=5 inspect
//!
//! # Copy a file through the graph
//! fgraph run src=input.bin dst=output.bin
//!
//! # Run a graph described in a manifest, with session settings from a file
//! fgraph run -m graph.yaml --config session.toml --stats
//!
//! # Show the filters known to the engine and how two of them would be linked
//! fgraph list
//! fgraph info testsrc
//! fgraph link testsrc inspect
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use filtergraph_core::caps::{Capability, Linker};
use filtergraph_core::{
    FilterNotification, FilterRegistry, GraphManifest, RunOutcome, Session, SessionConfig,
};

/// Run and inspect media filter graphs
#[derive(Parser)]
#[command(name = "fgraph")]
#[command(author, version)]
#[command(about = "Run and inspect media filter graphs")]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a graph and run it to completion
    Run {
        /// Filters to load: `name:arg=value`, `src=URL` or `dst=URL`
        specs: Vec<String>,

        /// Graph manifest (YAML or JSON) loaded before the specs
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// Session settings file (TOML, YAML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker threads, 0 for one per core
        #[arg(short, long)]
        threads: Option<usize>,

        /// Abort the whole session on the first filter error
        #[arg(long)]
        abort_on_error: bool,

        /// Print session statistics as JSON when done
        #[arg(long)]
        stats: bool,

        /// Print the resolved graph when done
        #[arg(long)]
        graph: bool,
    },

    /// List registered filters
    List,

    /// Show arguments and capabilities of a filter
    Info {
        /// Filter name
        name: String,
    },

    /// Show the filter chain the linker would insert between two filters
    Link {
        /// Producing filter
        from: String,

        /// Consuming filter
        to: String,

        /// Longest chain considered
        #[arg(long, default_value_t = 6)]
        max_chain: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match args.command {
        Command::Run {
            specs,
            manifest,
            config,
            threads,
            abort_on_error,
            stats,
            graph,
        } => {
            let mut session_config = match &config {
                Some(path) => SessionConfig::from_path(path)
                    .with_context(|| format!("Failed to load session config {}", path.display()))?,
                None => SessionConfig::default(),
            };
            if let Some(threads) = threads {
                session_config = session_config.with_threads(threads);
            }
            if abort_on_error {
                session_config = session_config.with_abort_on_error(true);
            }
            run(specs, manifest, session_config, stats, graph)
        }
        Command::List => {
            list();
            Ok(())
        }
        Command::Info { name } => info(&name),
        Command::Link { from, to, max_chain } => link(&from, &to, max_chain),
    }
}

fn build_session(manifest: Option<PathBuf>, config: SessionConfig) -> Result<Session> {
    let Some(path) = manifest else {
        return Ok(Session::new(config));
    };
    let mut manifest = GraphManifest::from_path(&path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    // command-line settings win over the manifest ones
    manifest.config = Some(config);
    let session = Session::from_manifest(&manifest)
        .with_context(|| format!("Failed to build graph from {}", path.display()))?;
    Ok(session)
}

fn run(
    specs: Vec<String>,
    manifest: Option<PathBuf>,
    config: SessionConfig,
    print_stats: bool,
    print_graph: bool,
) -> Result<()> {
    if specs.is_empty() && manifest.is_none() {
        bail!("nothing to run: give filter specs or a manifest");
    }
    let session = build_session(manifest, config)?;
    session.set_notification_handler(|n| match n {
        FilterNotification::Failed { name, error, .. } => {
            tracing::error!(filter = %name, "{}", error);
        }
        other => tracing::debug!("{:?}", other),
    });

    for spec in &specs {
        let loaded = if let Some(url) = spec.strip_prefix("src=") {
            session.load_source(url)
        } else if let Some(url) = spec.strip_prefix("dst=") {
            session.load_destination(url)
        } else {
            session.load_filter(spec)
        };
        let id = loaded.with_context(|| format!("Failed to load '{}'", spec))?;
        tracing::info!(filter = %id, spec = %spec, "filter loaded");
    }

    let outcome = session.run().context("Session run failed")?;
    if let Some(err) = session.connect_error() {
        eprintln!("warning: {}", err);
    }
    if let Some(err) = session.process_error() {
        eprintln!("error: {}", err);
    }

    if print_graph {
        let view = session.lock();
        for f in view.filters() {
            println!("{} [{}] {} ({}){}", f.id, f.class, f.name, f.state, if f.dynamic { " dynamic" } else { "" });
            for pid in &f.outputs {
                println!(
                    "  -> {} to {:?}: {} packets{}",
                    pid.name,
                    pid.consumers,
                    pid.statistics.packets,
                    if pid.eos { ", eos" } else { "" }
                );
            }
        }
    }
    if print_stats {
        let stats = session.stats();
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    match outcome {
        RunOutcome::Completed if session.process_error().is_none() => Ok(()),
        RunOutcome::Completed => bail!("session completed with filter errors"),
        RunOutcome::Aborted => bail!("session aborted"),
    }
}

fn list() {
    let registry = FilterRegistry::with_builtins();
    let mut descriptors = registry.descriptors();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    for desc in descriptors {
        let role = match (desc.is_source(), desc.is_sink()) {
            (true, _) => "source",
            (_, true) => "sink",
            _ => "filter",
        };
        println!("{:<12} {:<7} {}", desc.name, role, desc.description);
    }
}

fn describe_cap(cap: &Capability) -> String {
    let op = if cap.is_excluded() { "!=" } else { "=" };
    match &cap.value {
        Some(value) => format!("{}{}{}", cap.key, op, value),
        None => format!("{}=*", cap.key),
    }
}

fn info(name: &str) -> Result<()> {
    let registry = FilterRegistry::with_builtins();
    let Some(desc) = registry.get(name) else {
        bail!("no filter named '{}'", name);
    };
    println!("{}: {}", desc.name, desc.description);
    if desc.explicit_only {
        println!("  only loaded explicitly, never inserted by the linker");
    }
    if !desc.args.is_empty() {
        println!("Arguments:");
        for arg in &desc.args {
            let default = arg.default.as_deref().map(|d| format!(" (default {})", d)).unwrap_or_default();
            println!("  {:<12} {:?}{}  {}", arg.name, arg.kind, default, arg.description);
        }
    }
    for bundle in desc.caps.bundles() {
        let inputs: Vec<String> = bundle.inputs().map(describe_cap).collect();
        let outputs: Vec<String> = bundle.outputs().map(describe_cap).collect();
        println!("Caps #{}{}:", bundle.index, bundle.name.map(|n| format!(" {}", n)).unwrap_or_default());
        if !inputs.is_empty() {
            println!("  in:  {}", inputs.join(", "));
        }
        if !outputs.is_empty() {
            println!("  out: {}", outputs.join(", "));
        }
    }
    Ok(())
}

fn link(from: &str, to: &str, max_chain: usize) -> Result<()> {
    let registry = FilterRegistry::with_builtins();
    let src = registry
        .get(from)
        .with_context(|| format!("no filter named '{}'", from))?;
    let dst = registry
        .get(to)
        .with_context(|| format!("no filter named '{}'", to))?;
    let chain = Linker::new(&registry, max_chain).resolve_descriptors(&src, &dst)?;
    if chain.is_direct() {
        println!("{} -> {} (direct)", from, to);
    } else {
        println!("{} -> {} -> {}", from, chain, to);
    }
    Ok(())
}
