//! bureau — run a syscall delegation session from the command line.
//!
//! `serve` binds one session, prints its port, and waits for an agent.
//! Each stdin line `<num> [arg...]` is delegated to the agent against an
//! in-memory engine state; the resulting actions are applied to that
//! state and echoed as JSON lines.

use std::fs;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;

use bureau_engine::{apply_actions, SimState};
use bureau_runtime::transport::bind_listener;
use bureau_runtime::{BridgeConfig, BridgeError, Bureau, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bureau")]
#[command(about = "Delegate syscalls from a symbolic engine to an external agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session and delegate syscalls read from stdin
    Serve(ServeArgs),
    /// Report the first bindable port in a range
    Probe(PortArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON memory image for the engine state
    #[arg(short, long)]
    memory: Option<PathBuf>,

    #[command(flatten)]
    ports: PortArgs,
}

#[derive(Args)]
struct PortArgs {
    /// Interface to bind
    #[arg(long)]
    host: Option<String>,

    /// First port to try
    #[arg(long)]
    start_port: Option<u16>,

    /// Last port to try
    #[arg(long)]
    max_port: Option<u16>,
}

impl PortArgs {
    fn apply(&self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.start_port {
            config.start_port = port;
        }
        if let Some(port) = self.max_port {
            config.max_port = port;
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let result = match &cli.command {
        Command::Serve(args) => serve(args),
        Command::Probe(args) => probe(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bureau failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    let config = match path {
        Some(p) => BridgeConfig::from_file(p)?,
        None => BridgeConfig::default(),
    };
    config.with_env_overrides()
}

fn probe(args: &PortArgs) -> Result<()> {
    let config = args.apply(load_config(None)?);
    config.validate()?;
    let (_listener, port) = bind_listener(&config.host, config.start_port, config.max_port)?;
    println!("{}", json!({ "host": config.host, "port": port }));
    Ok(())
}

fn serve(args: &ServeArgs) -> Result<()> {
    let config = args.ports.apply(load_config(args.config.as_ref())?);

    let mut state = match &args.memory {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            SimState::from_json(&content)
                .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?
        }
        None => SimState::new(),
    };

    let bureau = Bureau::new(config)?;
    let session = bureau.start()?;
    let port = bureau.port(session).ok_or(BridgeError::UnknownSession(session))?;
    println!("{}", json!({ "session": session.as_u64(), "port": port }));
    info!(%session, port, "waiting for syscalls on stdin");

    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (num, call_args) = match parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                println!("{}", json!({ "error": e }));
                continue;
            }
        };

        match bureau.invoke_syscall(session, &state, num, &call_args) {
            Ok(actions) => {
                let retval = apply_actions(&mut state, &actions);
                println!(
                    "{}",
                    json!({ "num": num, "retval": retval, "actions": actions })
                );
            }
            Err(e) => {
                println!("{}", json!({ "num": num, "error": e.to_string() }));
                if bureau.session(session).map_or(true, |s| s.is_closed()) {
                    return Err(e);
                }
            }
        }
    }
    bureau.close(session)
}

/// Parse `<num> [arg...]`; decimal or 0x-prefixed hex.
fn parse_request(line: &str) -> std::result::Result<(u64, Vec<u64>), String> {
    let mut values = line.split_whitespace().map(parse_number);
    let num = values
        .next()
        .ok_or_else(|| "empty request".to_string())??;
    let args = values.collect::<std::result::Result<Vec<u64>, String>>()?;
    Ok((num, args))
}

fn parse_number(token: &str) -> std::result::Result<u64, String> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|e| format!("bad number {:?}: {}", token, e))
}
