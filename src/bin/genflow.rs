//! genflow: run chat requests through the caching pipeline from a shell.
//!
//! Usage:
//!   genflow chat [--config <file>] [--offline] [--chat-id <id>] <prompt>...
//!   genflow key [--config <file>] <stream|generate> <request.json|->
//!   genflow config [--config <file>]

use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use genflow::cache::{CacheKeyDeriver, GenerationMode};
use genflow::drivers::ScriptedModel;
use genflow::types::GenerationRequest;
use genflow::{ChatOrchestrator, ChatRequest, GenflowConfig, Message};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let outcome = match args[1].as_str() {
        "chat" => cmd_chat(&args[2..]).await,
        "key" => cmd_key(&args[2..]),
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("genflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"genflow - generation caching and streaming orchestration

USAGE:
    genflow <COMMAND> [OPTIONS]

COMMANDS:
    chat [--config <file>] [--offline] [--chat-id <id>] <prompt>...
                                Run one request and print outbound parts as JSON lines
    key [--config <file>] <stream|generate> <request.json|->
                                Print the cache key of a generation request
    config [--config <file>]    Print the effective configuration
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    RUST_LOG                    Log filter (default: warn)
    GENFLOW_*                   Configuration overrides (see `genflow config`)"#
    );
}

/// Value following `flag`, if present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Arguments that are neither flags nor flag values.
fn positional(args: &[String], valued_flags: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for a in args {
        if skip {
            skip = false;
            continue;
        }
        if valued_flags.contains(&a.as_str()) {
            skip = true;
            continue;
        }
        if a.starts_with("--") {
            continue;
        }
        out.push(a.clone());
    }
    out
}

fn load_config(args: &[String]) -> anyhow::Result<GenflowConfig> {
    let mut config = match flag_value(args, "--config") {
        Some(path) => GenflowConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => GenflowConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn cmd_chat(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let prompt = positional(args, &["--config", "--chat-id"]).join(" ");
    if prompt.trim().is_empty() {
        bail!("chat needs a prompt");
    }
    let chat_id = flag_value(args, "--chat-id").unwrap_or("cli").to_string();

    let mut builder = ChatOrchestrator::builder().config(config);
    if args.iter().any(|a| a == "--offline") {
        builder = builder.model(Arc::new(ScriptedModel::new()));
    }
    let orchestrator = builder.build().await?;

    let mut response = orchestrator
        .handle(ChatRequest::new(chat_id, vec![Message::user(prompt)]))
        .await?;
    while let Some(part) = response.stream.next().await {
        println!("{}", serde_json::to_string(&part?)?);
    }

    orchestrator.shutdown().await?;
    let stats = orchestrator.cache().stats();
    tracing::info!(hits = stats.hits, misses = stats.misses, sets = stats.sets, "cache stats");
    Ok(())
}

fn cmd_key(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let pos = positional(args, &["--config"]);
    let (mode, source) = match pos.as_slice() {
        [mode, source] => (mode, source),
        _ => bail!("usage: genflow key <stream|generate> <request.json|->"),
    };
    let mode: GenerationMode = mode.parse().map_err(|e| anyhow!("{}", e))?;

    let mut text = String::new();
    if source == "-" {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        text = std::fs::read_to_string(source).with_context(|| format!("reading {}", source))?;
    }
    let request: GenerationRequest = serde_json::from_str(&text).context("parsing generation request")?;

    let key = CacheKeyDeriver::new().derive(mode, &request);
    println!("{}", key.storage_key(config.cache.key_prefix.as_deref()));
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
