//! Interactive calc REPL driving a worker through the bridge.
//!
//! Each input line is executed as a program. Lines starting with `:` are
//! commands: `:complete CODE`, `:format CODE`, `:install PKG...`, `:quit`.
//! Ctrl-C interrupts the running program.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use xpy::{
    Bridge, BridgeConfig, BridgeError, Context, ExecOutcome, ExecRequest, InProcessSpawner,
    ProcessSpawner, host_fn,
};
use xpy_calc::CalcEngine;

#[derive(Parser, Debug)]
#[command(name = "xpy-calc")]
#[command(about = "Calculator REPL running its interpreter in an isolated worker")]
struct Args {
    /// Run the worker as a child process from this binary instead of a thread
    #[arg(long, value_name = "WORKER_BINARY")]
    process: Option<PathBuf>,

    /// Seconds to wait for the worker to become ready
    #[arg(long)]
    setup_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    xpy::logging::init_tracing();

    let mut config = match &args.process {
        Some(program) => BridgeConfig::from_env(ProcessSpawner::new(program)),
        None => BridgeConfig::from_env(InProcessSpawner::new(CalcEngine::new)),
    };
    if let Some(secs) = args.setup_timeout {
        config = config.with_setup_timeout(Duration::from_secs(secs));
    }

    let bridge = Bridge::new(config);
    bridge
        .ensure_ready()
        .await
        .context("Failed to start the calc worker")?;

    let interrupter = bridge.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = interrupter.interrupt() {
                tracing::warn!(error = %e, "Interrupt not delivered");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" {
            break;
        }
        if let Err(e) = handle_line(&bridge, line).await {
            eprintln!("{e}");
            if matches!(e, BridgeError::Disconnected | BridgeError::Setup(_)) {
                break;
            }
        }
    }

    bridge.shutdown().await?;
    Ok(())
}

async fn handle_line(bridge: &Bridge, line: &str) -> Result<(), BridgeError> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        ":complete" => {
            let completions = bridge.complete(rest, None, None).await?;
            for m in completions.matches {
                println!("{:<12} {:<9} {}", m.name, m.kind, m.description);
            }
        }
        ":format" => println!("{}", bridge.format(rest, Map::new()).await?),
        ":install" => {
            bridge.install(rest.split_whitespace()).await?;
            println!("installed");
        }
        _ => {
            let request = ExecRequest::new(line).with_context(
                Context::new().with_function("env", host_fn(read_env)),
            );
            print_outcome(bridge.exec(request).await?);
        }
    }
    Ok(())
}

/// `env(name)`: the controller's environment variable, or none.
fn read_env(args: Vec<Value>) -> anyhow::Result<Value> {
    let [Value::String(name)] = args.as_slice() else {
        anyhow::bail!("env() takes one string argument");
    };
    Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
}

fn print_outcome(outcome: ExecOutcome) {
    if let Some(stdout) = outcome.stdout {
        print!("{stdout}");
    }
    if let Some(stderr) = outcome.stderr {
        eprint!("{stderr}");
    }
    if let Some(error) = outcome.error {
        eprintln!("{error}");
    }
    match outcome.result {
        Some(Value::String(result)) => println!("{result}"),
        Some(Value::Null) | None => {}
        Some(other) => println!("{other}"),
    }
}
