//! `cogmemd` – host process for the memory engine.
//!
//! ```text
//! cogmemd [--config <path>] [run]      start the decay engine until Ctrl-C
//! cogmemd [--config <path>] cycle      run one decay cycle and exit
//! cogmemd [--config <path>] init       write the effective config to disk
//! cogmemd schema                       print the retrieval query JSON schema
//! ```
//!
//! Configuration is read from `~/.cogmem/config.toml` unless `--config` is
//! given, then overridden by `COGMEM_*` environment variables.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use cogmem_runtime::{MemoryConfig, MemoryEngine, config, telemetry};
use tracing::{error, info, warn};

/// How long shutdown waits for an in-flight decay cycle.
const STOP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Command {
    Run,
    Cycle,
    Init,
    Schema,
    Help,
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut config = None;
    let mut command = None;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = it.next().ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" | "help" => command = Some(Command::Help),
            "run" | "cycle" | "init" | "schema" if command.is_some() => {
                return Err(format!("unexpected extra command {arg:?}"));
            }
            "run" => command = Some(Command::Run),
            "cycle" => command = Some(Command::Cycle),
            "init" => command = Some(Command::Init),
            "schema" => command = Some(Command::Schema),
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(Args {
        config,
        command: command.unwrap_or(Command::Run),
    })
}

fn usage() -> &'static str {
    "usage: cogmemd [--config <path>] [run | cycle | init | schema]"
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("cogmemd: {e}\n{}", usage());
            return ExitCode::from(2);
        }
    };
    match args.command {
        Command::Help => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Command::Schema => {
            match serde_json::to_string_pretty(&cogmem_memory::query_schema()) {
                Ok(schema) => println!("{schema}"),
                Err(e) => {
                    eprintln!("cogmemd: {e}");
                    return ExitCode::FAILURE;
                }
            }
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    // Tracing is installed before the runtime exists.
    let _guard = telemetry::init_tracing("cogmemd");

    let config_path = args.config.unwrap_or_else(config::config_path);
    let cfg = match config::load_from(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.command == Command::Init {
        return match config::save_to(&cfg, &config_path) {
            Ok(()) => {
                info!(path = %config_path.display(), "configuration written");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to write configuration");
                ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let once = args.command == Command::Cycle;
    runtime.block_on(async move {
        match serve(&cfg, once).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "cogmemd exited with an error");
                ExitCode::FAILURE
            }
        }
    })
}

async fn serve(cfg: &MemoryConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    let engine = MemoryEngine::open(cfg)?;

    if once {
        let report = engine.run_decay_cycle().await?;
        info!(
            examined = report.examined,
            updated = report.updated,
            failed = report.failed,
            "decay cycle complete"
        );
        return Ok(());
    }

    let handle = engine.start_decay();
    info!(
        generation = handle.generation(),
        interval_secs = cfg.decay_interval_secs,
        "cogmemd running; press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutdown requested");
    engine.stop_decay(STOP_DEADLINE).await?;
    Ok(())
}
