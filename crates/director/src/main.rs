//! Director binary: syncs declarative config onto the kernel IPVS table.
//!
//! # Usage
//!
//! ```bash
//! # Reconcile events read as JSON lines from stdin
//! director -c /etc/director.yaml run
//!
//! # Dump the kernel table
//! director print
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use director::{Config, ConfigEvent, Director, IpvsDriver, Routes};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Command-line arguments
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

enum Command {
    Run,
    Print,
}

fn parse_args() -> Result<Args, String> {
    let mut config = None;
    let mut command = Command::Run;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or("missing argument for --config")?;
                config = Some(PathBuf::from(path));
            }
            "run" => command = Command::Run,
            "print" => command = Command::Print,
            other => return Err(format!("unknown argument {other:?}")),
        }
    }

    Ok(Args { config, command })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    common::logging::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: director [-c <config>] [run|print]");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = run(args).await {
        error!(error = %err, "director failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> common::Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let routes = Routes::from_config(&config.routes)?;
    let mut driver = IpvsDriver::setup(&config, routes)?;

    match args.command {
        Command::Print => driver.print(),
        Command::Run => {
            let mut director = Director::new(driver);
            director.sync()?;

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(read_events(tx));
            director.run(rx).await;
            Ok(())
        }
    }
}

/// Stand-in configuration watcher: one JSON event per stdin line.
async fn read_events(tx: mpsc::Sender<ConfigEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ConfigEvent>(line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "ignoring malformed event"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "stdin read failed");
                break;
            }
        }
    }
}
