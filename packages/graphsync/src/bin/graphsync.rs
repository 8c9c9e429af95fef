//! graphsync - encode vectors against a fixture and inspect the result
//!
//! Usage:
//!   graphsync encode --fixture todos.json --vectors vectors.json [--config sync.json]
//!                    [--policy policy.json] [--principal 1] [--role admin]...
//!                    [--msgpack out.bin] [--roundtrip]
//!   graphsync decode --fixture todos.json --tree tree.json
//!
//! `encode` prints the merged tree as JSON on stdout. With `--roundtrip` the
//! tree is also applied to an empty mirror graph and the mirror is printed.
//! `decode` applies a stored tree (JSON, or MessagePack when the file ends in
//! `.bin` / `.msgpack`) to an empty mirror graph built from the fixture schema.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};

use graphsync::policy::{AccessPolicy, ActingPrincipal, PermitAll, RulePolicy};
use graphsync::{MemoryStore, MergedTree, MirrorGraph, Overrides, ServerDataCache, SyncConfig, TreeReconciler, Vector};

#[derive(Parser, Debug)]
#[command(name = "graphsync", version, about = "Encode and decode record graph slices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate vectors against a fixture store
    Encode {
        /// Fixture with schema and records
        #[arg(long)]
        fixture: PathBuf,
        /// JSON array of vectors
        #[arg(long)]
        vectors: PathBuf,
        /// Batch configuration; without it every fixture model is regulated
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rule policy; without it everything is permitted
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Acting principal id
        #[arg(long)]
        principal: Option<String>,
        /// Role held by the principal (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
        /// Also write the tree as MessagePack
        #[arg(long)]
        msgpack: Option<PathBuf>,
        /// Apply the tree to an empty mirror and print it
        #[arg(long)]
        roundtrip: bool,
        /// Log every vector
        #[arg(long)]
        log_vectors: bool,
    },
    /// Apply a stored tree to an empty mirror graph
    Decode {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        tree: PathBuf,
    },
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_mirror(store: &MemoryStore, tree: &MergedTree) -> anyhow::Result<()> {
    let mut graph = MirrorGraph::new(store.schema().clone());
    let mut reconciler = TreeReconciler::new(&mut graph);
    reconciler.apply(tree);
    let mismatches = reconciler.mismatches();
    if mismatches > 0 {
        eprintln!("[graphsync] {} keys did not match the mirror schema", mismatches);
    }
    println!("{}", serde_json::to_string_pretty(&graph.dump())?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode(
    fixture: &Path,
    vectors: &Path,
    config: Option<&Path>,
    policy: Option<&Path>,
    principal: Option<String>,
    roles: Vec<String>,
    msgpack: Option<&Path>,
    roundtrip: bool,
    log_vectors: bool,
) -> anyhow::Result<()> {
    let store = MemoryStore::from_file(fixture).with_context(|| format!("loading fixture {}", fixture.display()))?;
    let vectors = Vector::parse_all(&read_json(vectors)?)?;

    let mut config = match config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::with_models(store.schema().models.keys().cloned()),
    };
    config.log_vectors |= log_vectors;

    let policy: Box<dyn AccessPolicy> = match policy {
        Some(path) => Box::new(RulePolicy::from_file(path)?),
        None => Box::new(PermitAll),
    };
    let principal = principal.map(ActingPrincipal::user).unwrap_or_default().with_roles(roles);

    let cache = ServerDataCache::new(&store, policy.as_ref(), &config);
    let evaluation = cache.evaluate_with_stats(&principal, &Overrides::new(), &vectors)?;
    tracing::info!(
        "{} vectors, {} items, {} memo hits",
        evaluation.stats.vectors,
        evaluation.stats.items_created,
        evaluation.stats.memo_hits
    );

    if let Some(path) = msgpack {
        std::fs::write(path, evaluation.tree.to_msgpack()?).with_context(|| format!("writing {}", path.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&evaluation.tree.to_json())?);
    if roundtrip {
        print_mirror(&store, &evaluation.tree)?;
    }
    Ok(())
}

fn decode(fixture: &Path, tree: &Path) -> anyhow::Result<()> {
    let store = MemoryStore::from_file(fixture).with_context(|| format!("loading fixture {}", fixture.display()))?;
    let is_msgpack = matches!(
        tree.extension().and_then(|e| e.to_str()),
        Some("bin") | Some("msgpack")
    );
    let tree = if is_msgpack {
        let bytes = std::fs::read(tree).with_context(|| format!("reading {}", tree.display()))?;
        MergedTree::from_msgpack(&bytes)?
    } else {
        MergedTree::from_json(&read_json(tree)?)?
    };
    print_mirror(&store, &tree)
}

fn main() {
    graphsync::init_logging();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Encode {
            fixture,
            vectors,
            config,
            policy,
            principal,
            roles,
            msgpack,
            roundtrip,
            log_vectors,
        } => encode(
            &fixture,
            &vectors,
            config.as_deref(),
            policy.as_deref(),
            principal,
            roles,
            msgpack.as_deref(),
            roundtrip,
            log_vectors,
        ),
        Commands::Decode { fixture, tree } => decode(&fixture, &tree),
    };

    if let Err(e) = result {
        eprintln!("[graphsync] Error: {:#}", e);
        process::exit(1);
    }
}
