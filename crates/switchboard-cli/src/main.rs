use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard_core::registry::mask_secret;
use switchboard_core::{
    ChatMessage, ProviderClient, ProviderKind, ProviderRegistry, ProviderStore,
};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Manage, select, and probe AI chat-completion providers")]
struct Cli {
    /// Path to the registry file (default: ~/.switchboard/providers.json)
    #[arg(short, long, global = true)]
    registry: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers
    List,

    /// Show the active provider and load-balancing settings
    Status,

    /// Switch the active provider, optionally setting its API key first
    Use {
        name: String,
        /// API key to store for the provider before activating it
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Probe the active provider's health
    Test,

    /// Enable a provider
    Enable { name: String },

    /// Disable a provider
    Disable { name: String },

    /// Remove a provider from the registry
    Remove { name: String },

    /// Write the full registry to a JSON file
    Export { file: PathBuf },

    /// Replace the registry with the contents of a JSON file
    Import { file: PathBuf },

    /// Send a one-shot message through the active provider
    Ask { message: String },

    /// Interactive first-time setup
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let mut store = match &cli.registry {
        Some(path) => ProviderStore::open_at(path),
        None => ProviderStore::open(),
    };

    match cli.command {
        Commands::List => cmd_list(&store),
        Commands::Status => cmd_status(&store),
        Commands::Use { name, key } => cmd_use(&mut store, &name, key),
        Commands::Test => cmd_test(&mut store).await,
        Commands::Enable { name } => cmd_toggle(&mut store, &name, true),
        Commands::Disable { name } => cmd_toggle(&mut store, &name, false),
        Commands::Remove { name } => cmd_remove(&mut store, &name),
        Commands::Export { file } => cmd_export(&store, &file),
        Commands::Import { file } => cmd_import(&mut store, &file),
        Commands::Ask { message } => cmd_ask(&store, &message).await,
        Commands::Setup => cmd_setup(&mut store).await,
    }
}

fn cmd_list(store: &ProviderStore) -> Result<()> {
    let registry = store.registry();
    if registry.providers.is_empty() {
        println!("No providers configured. Run `switchboard setup` to get started.");
        return Ok(());
    }

    for name in registry.ordered_names() {
        let Some(cfg) = registry.providers.get(&name) else {
            continue;
        };
        let marker = if name == registry.active_provider {
            "*"
        } else {
            " "
        };
        let state = if cfg.enabled { "enabled" } else { "disabled" };
        println!(
            "{} {:<12} kind={:<10} model={:<28} priority={:<4} {:<9} key={}",
            marker,
            cfg.name,
            cfg.kind.to_string(),
            cfg.model,
            cfg.priority,
            state,
            mask_secret(&cfg.api_key),
        );
    }
    Ok(())
}

fn cmd_status(store: &ProviderStore) -> Result<()> {
    let registry = store.registry();
    match store.active() {
        Some(cfg) => {
            println!("Active provider: {}", cfg.name);
            println!("  model:   {}", cfg.model);
            println!("  url:     {}", cfg.api_url);
            println!("  timeout: {}ms", cfg.timeout_ms);
        }
        None => println!("Active provider: none"),
    }
    let lb = &registry.load_balancing;
    if lb.enabled {
        println!("Load balancing: enabled ({:?})", lb.strategy);
    } else {
        println!("Load balancing: disabled");
    }
    println!("Registry file: {}", store.path().display());
    Ok(())
}

fn cmd_use(store: &mut ProviderStore, name: &str, key: Option<String>) -> Result<()> {
    if let Some(key) = key {
        store.set_api_key(name, key)?;
    }
    store.set_active(name)?;
    println!("Active provider set to '{name}'.");
    Ok(())
}

async fn cmd_test(store: &mut ProviderStore) -> Result<()> {
    let cfg = store
        .active()
        .context("no active provider; run `switchboard use <name>` first")?
        .clone();
    println!("Probing {} ({})...", cfg.name, cfg.model);

    let client = ProviderClient::new(cfg.clone());
    let result = client.health_check().await;

    if result.healthy {
        store.record_latency(&cfg.name, result.response_time_ms as f64);
        println!("Healthy: responded in {}ms.", result.response_time_ms);
        Ok(())
    } else {
        bail!(
            "provider '{}' is unhealthy after {}ms: {}",
            cfg.name,
            result.response_time_ms,
            result.error.unwrap_or_else(|| "unknown error".to_string()),
        );
    }
}

fn cmd_toggle(store: &mut ProviderStore, name: &str, enabled: bool) -> Result<()> {
    store.toggle(name, enabled)?;
    let state = if enabled { "enabled" } else { "disabled" };
    println!("Provider '{name}' {state}.");
    match store.active() {
        Some(active) => println!("Active provider: {}", active.name),
        None => println!("Active provider: none"),
    }
    Ok(())
}

fn cmd_remove(store: &mut ProviderStore, name: &str) -> Result<()> {
    store.remove(name)?;
    println!("Provider '{name}' removed.");
    Ok(())
}

fn cmd_export(store: &ProviderStore, file: &PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&store.export())?;
    std::fs::write(file, json)
        .with_context(|| format!("failed to write {}", file.display()))?;
    println!("Registry exported to {}.", file.display());
    Ok(())
}

fn cmd_import(store: &mut ProviderStore, file: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let registry: ProviderRegistry = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", file.display()))?;
    let count = registry.providers.len();
    store.import(registry)?;
    println!("Imported {count} providers from {}.", file.display());
    Ok(())
}

async fn cmd_ask(store: &ProviderStore, message: &str) -> Result<()> {
    let cfg = store
        .active()
        .context("no active provider; run `switchboard use <name>` first")?
        .clone();

    let client = ProviderClient::new(cfg);
    let completion = client.send(&[ChatMessage::user(message)], None).await?;
    println!("{}", completion.text());
    Ok(())
}

async fn cmd_setup(store: &mut ProviderStore) -> Result<()> {
    println!("\n  Switchboard Setup\n  ─────────────────\n");
    println!("  Enter an API key for each provider you want to use.");
    println!("  Press Enter to skip a provider.\n");

    for kind in [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Google,
    ] {
        let name = kind.to_string();
        let already = store.get(&name).is_some_and(|cfg| cfg.has_key());
        if already {
            println!("  {name}: key already configured, keeping it.");
            continue;
        }
        let key = prompt(&format!("  {name} API key: "))?;
        if key.is_empty() {
            println!("  Skipped.");
            continue;
        }
        store.set_api_key(&name, key)?;
        println!("  Saved.");
    }

    let Some(active) = store.active().cloned() else {
        println!("\n  No provider configured. Re-run `switchboard setup` when you have a key.");
        return Ok(());
    };

    println!("\n  Active provider: {} ({})", active.name, active.model);
    println!("  Verifying connection...");
    let client = ProviderClient::new(active.clone());
    let result = client.health_check().await;
    if result.healthy {
        store.record_latency(&active.name, result.response_time_ms as f64);
        println!("  Connection works ({}ms).", result.response_time_ms);
    } else {
        println!(
            "  Health check failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
        println!("  Check the key and try `switchboard test` again.");
    }

    println!("\n  Setup complete.");
    println!("  ──────────────");
    println!("  Registry: {}", store.path().display());
    println!();
    println!("  Next steps:");
    println!("    switchboard list            # see all providers");
    println!("    switchboard test            # probe the active provider");
    println!("    switchboard ask \"Hello\"     # one-shot message");
    println!();
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::{self, BufRead, Write};
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
