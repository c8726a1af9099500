//! Command-line client for a stdio tool server

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;

use tool_bridge::{BridgeConfig, Error, ProcessBridge, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to <config_dir>/tool-bridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tool server executable, overriding the config
    #[arg(long)]
    program: Option<String>,

    /// Argument passed to the tool server (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Identity token handed to the tool server
    #[arg(long)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tools the server offers
    Tools,
    /// Invoke a tool
    Call {
        name: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Send a raw JSON-RPC request
    Rpc {
        method: String,
        #[arg(long)]
        params: Option<String>,
    },
    /// Start the server and print the bridge status
    Status,
}

fn parse_json(label: &str, text: &str) -> Result<JsonValue> {
    serde_json::from_str(text).map_err(|e| Error::InvalidRequest(format!("{} is not valid JSON: {}", label, e)))
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(args.config.as_deref())?.with_env_overrides();
    if let Some(program) = &args.program {
        config.launch.program = program.clone();
    }
    if !args.args.is_empty() {
        config.launch.args = args.args.clone();
    }
    if let Some(identity) = &args.identity {
        config.identity = identity.clone();
    }
    Ok(config)
}

async fn run(bridge: &ProcessBridge, command: Command) -> Result<JsonValue> {
    match command {
        Command::Tools => Ok(serde_json::to_value(bridge.list_tools().await?)?),
        Command::Call {
            name,
            args,
            timeout_secs,
        } => {
            let arguments = parse_json("--args", &args)?;
            match timeout_secs {
                Some(secs) => {
                    bridge
                        .call_tool_with_timeout(&name, arguments, Duration::from_secs(secs))
                        .await
                }
                None => bridge.call_tool(&name, arguments).await,
            }
        }
        Command::Rpc { method, params } => {
            let params = params.map(|p| parse_json("--params", &p)).transpose()?;
            bridge.call(&method, params).await
        }
        Command::Status => {
            bridge.ensure_started().await?;
            Ok(serde_json::to_value(bridge.status())?)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tool_bridge::init_tracing();
    let args = Args::parse();

    let bridge = match load_config(&args).and_then(ProcessBridge::new) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = run(&bridge, args.command).await;
    bridge.shutdown().await;

    match outcome {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
