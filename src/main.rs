use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, trace, warn};

use toolbridge::agent::Agent;
use toolbridge::catalog::ToolCatalog;
use toolbridge::config::AppConfig;
use toolbridge::error::ToolbridgeError;
use toolbridge::llm::openai::OpenAiCompatibleClient;
use toolbridge::lookup::uniprot::UniProtClient;
use toolbridge::server::debug::register_debug_tools;
use toolbridge::server::tools::{register_protein_tools, FunctionPredictor};
use toolbridge::server::{serve, ToolRegistry};
use toolbridge::worker::{CallOutcome, ToolClient};

/// Stdio tool worker transport and protein assistant
#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Call tools in a worker process over stdio, or serve them", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tools on stdin/stdout, one JSON request per line
    Serve {
        /// Also serve the sleep/exit/emit/fail tools used for transport testing
        #[arg(long)]
        debug_tools: bool,
    },
    /// Call one tool through a worker process and print its result
    Call {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Deadline for the call (e.g. "500ms", "10s"); defaults to the configured timeout
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },
    /// Print the tool catalog as JSON
    Tools,
    /// Ask the assistant; without an utterance, start an interactive chat
    Ask {
        utterance: Vec<String>,
    },
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,hyper=debug,reqwest=debug", // -vvv shows everything including dependencies
    };

    // stdout carries protocol lines in serve mode, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("toolbridge started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Serve { debug_tools } => run_serve(config, debug_tools).await,
            Commands::Call {
                tool,
                params,
                timeout,
            } => run_call(config, &tool, &params, timeout).await,
            Commands::Tools => run_tools().map(|_| None),
            Commands::Ask { utterance } => run_ask(config, utterance.join(" ")).await.map(|_| None),
        },
        Err(e) => Err(ToolbridgeError::from(e).into()),
    };

    match result {
        Ok(None) => {}
        Ok(Some(code)) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {}", e);
            eprintln!("Error: {e:#}");
            let code = match e.downcast_ref::<ToolbridgeError>() {
                Some(err) => {
                    for line in err.diagnostics() {
                        eprintln!("  worker: {line}");
                    }
                    err.exit_code()
                }
                None => 1,
            };
            std::process::exit(code);
        }
    }
}

/// Serve until stdin closes; returns the exit code a tool asked for.
async fn run_serve(config: AppConfig, debug_tools: bool) -> anyhow::Result<Option<i32>> {
    let lookup = UniProtClient::new(config.lookup).map_err(ToolbridgeError::from)?;
    let mut registry = ToolRegistry::new();
    register_protein_tools(&mut registry, Arc::new(lookup), FunctionPredictor::default());
    if debug_tools {
        register_debug_tools(&mut registry);
    }
    info!(
        "Serving tools on stdio: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );

    let summary = serve(tokio::io::stdin(), tokio::io::stdout(), Arc::new(registry))
        .await
        .map_err(ToolbridgeError::from)?;
    Ok(summary.exit_code)
}

async fn run_call(
    config: AppConfig,
    tool: &str,
    params: &str,
    timeout: Option<Duration>,
) -> anyhow::Result<Option<i32>> {
    let params: Value = serde_json::from_str(params)
        .map_err(ToolbridgeError::from)
        .context("--params must be valid JSON")?;
    let worker = config.worker.resolve_program().map_err(ToolbridgeError::from)?;
    let client = ToolClient::new(worker);

    let outcome = match timeout {
        Some(timeout) => client.call_with_timeout(tool, params, timeout).await,
        None => client.call(tool, params).await,
    };
    if let Err(e) = client.stop().await {
        warn!("Failed to stop worker cleanly: {}", e);
    }

    match outcome.map_err(ToolbridgeError::from)? {
        CallOutcome::Result(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(None)
        }
        CallOutcome::ToolError(failure) => Err(ToolbridgeError::tool_failed(tool, &failure).into()),
        CallOutcome::Timeout(after) => Err(ToolbridgeError::tool_timeout(tool, after).into()),
    }
}

fn run_tools() -> anyhow::Result<()> {
    println!("{}", ToolCatalog::protein_tools().to_json_pretty()?);
    Ok(())
}

async fn run_ask(config: AppConfig, utterance: String) -> anyhow::Result<()> {
    let generator = OpenAiCompatibleClient::from_config(&config.llm).map_err(ToolbridgeError::from)?;
    let worker = config.worker.resolve_program().map_err(ToolbridgeError::from)?;
    let client = ToolClient::new(worker);
    let mut agent = Agent::new(
        Arc::new(generator),
        Arc::new(client),
        ToolCatalog::protein_tools(),
    )
    .with_json_policy(config.llm.json_policy());

    let result: anyhow::Result<()> = if utterance.trim().is_empty() {
        chat(&mut agent).await
    } else {
        agent
            .process_message(&utterance)
            .await
            .map(|reply| println!("{}", reply.text))
            .map_err(|e| ToolbridgeError::from(e).into())
    };

    if let Err(e) = agent.shutdown().await {
        warn!("Failed to stop worker cleanly: {}", e);
    }
    result
}

/// Line-oriented chat on stdin. `/clear` resets the conversation, `/exit` quits.
async fn chat(agent: &mut Agent) -> anyhow::Result<()> {
    println!("Protein assistant ready. Type /clear to reset, /exit to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                agent.clear_history();
                println!("Conversation cleared.");
            }
            message => match agent.process_message(message).await {
                Ok(reply) => println!("{}", reply.text),
                Err(e) => {
                    let err = ToolbridgeError::from(e);
                    error!("Reply failed: {}", err);
                    println!("Sorry, something went wrong: {}", err.user_message());
                }
            },
        }
    }
    Ok(())
}
