use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use docsync::{pull_session, Config, Document, ModelDef, ModelRegistry, SessionServer};

#[derive(Parser)]
#[command(name = "docsync", author, version, about = "Host, pull and inspect synchronized documents")]
struct Cli {
    /// JSON config file; DOCSYNC_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host documents over TCP
    Serve {
        #[arg(long)]
        addr: Option<String>,
        /// Snapshot loaded into the default session and saved back on Ctrl-C
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// JSON list of model definitions to register before loading
        #[arg(long)]
        defs: Option<PathBuf>,
    },
    /// Pull a session and print a summary, or write its snapshot
    Pull {
        url: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Summarize a snapshot file
    Inspect { file: PathBuf },
    /// Print a server's info reply
    Info { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Commands::Serve {
            addr,
            snapshot,
            defs,
        } => serve(config, addr, snapshot, defs).await,
        Commands::Pull {
            url,
            session_id,
            out,
        } => pull(config, &url, session_id.as_deref(), out.as_deref()).await,
        Commands::Inspect { file } => {
            let document = Document::load(&file, Arc::new(ModelRegistry::with_builtins()))
                .with_context(|| format!("loading {}", file.display()))?;
            print_summary(&document);
            Ok(())
        }
        Commands::Info { url } => info(config, &url).await,
    }
}

async fn serve(
    mut config: Config,
    addr: Option<String>,
    snapshot: Option<PathBuf>,
    defs: Option<PathBuf>,
) -> Result<()> {
    if let Some(addr) = addr {
        config.server.bind_addr = addr;
    }
    if snapshot.is_some() {
        config.server.snapshot = snapshot;
    }

    let registry = Arc::new(ModelRegistry::with_builtins());
    if let Some(path) = &defs {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let defs: Vec<ModelDef> = serde_json::from_str(&json)?;
        let registered = registry.resolve_defs(&defs)?;
        log::info!("Registered {} model definitions", registered.len());
    }

    let server = SessionServer::new(Arc::clone(&registry), config.server.clone());
    let session = config.server.default_session.clone();
    if let Some(path) = &config.server.snapshot {
        if path.exists() {
            let document = Document::load(path, Arc::clone(&registry))
                .with_context(|| format!("loading {}", path.display()))?;
            server.insert_document(session.clone(), document).await;
        }
    }

    let addr = config.server.bind_addr.clone();
    println!("Serving session '{}' on {}", session, addr);
    tokio::select! {
        result = Arc::clone(&server).listen(&addr) => result?,
        _ = tokio::signal::ctrl_c() => println!("Shutting down"),
    }

    if let Some(path) = &config.server.snapshot {
        let document = server.document(&session).await;
        document.lock().await.save(path)?;
        println!("Saved snapshot to {}", path.display());
    }
    Ok(())
}

async fn pull(config: Config, url: &str, session_id: Option<&str>, out: Option<&Path>) -> Result<()> {
    let registry = Arc::new(ModelRegistry::with_builtins());
    let session = pull_session(url, session_id, None, registry, config.session).await?;
    {
        let document = session.document();
        let document = document.lock().await;
        match out {
            Some(path) => {
                document.save(path)?;
                println!("Wrote session {} to {}", session.id(), path.display());
            }
            None => {
                println!("Session: {}", session.id());
                print_summary(&document);
            }
        }
    }
    session.close().await?;
    Ok(())
}

async fn info(config: Config, url: &str) -> Result<()> {
    let registry = Arc::new(ModelRegistry::with_builtins());
    let session = pull_session(url, None, None, registry, config.session).await?;
    let info = session.server_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    session.close().await?;
    Ok(())
}

fn print_summary(document: &Document) {
    println!("Title: {}", document.title());
    println!("Version: {}", document.version());
    println!("Roots ({}):", document.roots().len());
    for root in document.roots() {
        let type_name = document
            .get_model(root)
            .map(|model| model.type_name())
            .unwrap_or("?");
        println!("  {} {}", type_name, root);
    }

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for model in document.models().values() {
        *by_type.entry(model.type_name()).or_default() += 1;
    }
    println!("Models ({}):", document.models().len());
    for (type_name, count) in by_type {
        println!("  {:<32} {}", type_name, count);
    }
}
