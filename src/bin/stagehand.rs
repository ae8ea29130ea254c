//! stagehand - container launch preparation CLI
//!
//! Runs the preparation pipeline for one launch request and publishes the
//! plan to the starter, or serves one of the host-side lifecycle handshakes.
//!
//! ## Usage
//!
//! ```sh
//! stagehand prepare --engine-config <file> [--policy <file>] [--capabilities <file>] [--starter-fd <n>] [--dry-run]
//! stagehand post-start-host --socket-fd <n> --engine-config <file>
//! stagehand cleanup-host --socket-fd <n> --engine-config <file>
//! ```
//!
//! Log verbosity comes from `STAGEHAND_LOG` (`error`, `warn`, `info`,
//! `debug`, `trace`; default `warn`).

use stagehand::constants::POST_START_TRIGGER_TIMEOUT;
use stagehand::fuse::Fusermount;
use stagehand::lifecycle::{self, HostCleanupState, Lifecycle};
use stagehand::{Engine, EngineConfig, HostState, PolicySources, StarterRegion};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Prepare {
        engine_config: PathBuf,
        policy: Option<PathBuf>,
        capabilities: Option<PathBuf>,
        starter_fd: Option<RawFd>,
        dry_run: bool,
    },
    PostStartHost {
        socket_fd: RawFd,
        engine_config: PathBuf,
    },
    CleanupHost {
        socket_fd: RawFd,
        engine_config: PathBuf,
    },
    Version,
    Help,
}

/// Value following `flag`, if present.
fn flag_value(args: &[String], flag: &str) -> Result<Option<String>, String> {
    match args.iter().position(|a| a == flag) {
        Some(i) => args
            .get(i + 1)
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("{} requires a value", flag)),
        None => Ok(None),
    }
}

fn fd_value(args: &[String], flag: &str) -> Result<Option<RawFd>, String> {
    flag_value(args, flag)?
        .map(|v| {
            v.parse::<RawFd>()
                .map_err(|_| format!("{} requires a file descriptor number", flag))
        })
        .transpose()
}

fn required(value: Option<String>, message: &str) -> Result<PathBuf, String> {
    value.map(PathBuf::from).ok_or_else(|| message.to_string())
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }
    let rest = &args[2..];

    match args[1].as_str() {
        "prepare" => Ok(Command::Prepare {
            engine_config: required(
                flag_value(rest, "--engine-config")?,
                "prepare requires --engine-config <file>",
            )?,
            policy: flag_value(rest, "--policy")?.map(PathBuf::from),
            capabilities: flag_value(rest, "--capabilities")?.map(PathBuf::from),
            starter_fd: fd_value(rest, "--starter-fd")?,
            dry_run: rest.iter().any(|a| a == "--dry-run"),
        }),
        cmd @ ("post-start-host" | "cleanup-host") => {
            let socket_fd = fd_value(rest, "--socket-fd")?
                .ok_or_else(|| format!("{} requires --socket-fd <n>", cmd))?;
            let engine_config = required(
                flag_value(rest, "--engine-config")?,
                &format!("{} requires --engine-config <file>", cmd),
            )?;
            Ok(if cmd == "post-start-host" {
                Command::PostStartHost {
                    socket_fd,
                    engine_config,
                }
            } else {
                Command::CleanupHost {
                    socket_fd,
                    engine_config,
                }
            })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_prepare(
    engine_config: PathBuf,
    policy: Option<PathBuf>,
    capabilities: Option<PathBuf>,
    starter_fd: Option<RawFd>,
    dry_run: bool,
) -> Result<(), String> {
    let config = EngineConfig::load(&engine_config).map_err(|e| e.to_string())?;

    let mut region = match starter_fd {
        Some(fd) => Some(StarterRegion::from_fd(fd).map_err(|e| e.to_string())?),
        None => None,
    };
    let is_suid = match &region {
        Some(region) => region.is_suid(),
        None => nix::unistd::geteuid().is_root() && !nix::unistd::getuid().is_root(),
    };

    let mut sources = PolicySources::default();
    if let Some(path) = policy {
        sources.config_file = path;
    }
    if let Some(path) = capabilities {
        sources.capability_file = path;
    }

    let host = HostState::sample(is_suid).map_err(|e| e.to_string())?;
    debug!("host: {}", host);
    let engine = Engine::new(sources, host);
    let prepared = engine.prepare(config).map_err(|e| e.to_string())?;

    if dry_run || region.is_none() {
        let plan = serde_json::to_string_pretty(&prepared.plan).map_err(|e| e.to_string())?;
        println!("{}", plan);
        return Ok(());
    }
    if let Some(mut region) = region.take() {
        prepared.publish(&mut region).map_err(|e| e.to_string())?;
        region.release().map_err(|e| e.to_string())?;
    }
    eprintln!("Prepared launch of {}", prepared.config.image.display());
    Ok(())
}

fn cmd_lifecycle(socket_fd: RawFd, engine_config: PathBuf, post_start: bool) -> Result<(), String> {
    let config = EngineConfig::load(&engine_config).map_err(|e| e.to_string())?;
    let handler = Lifecycle::new(HostCleanupState::from(&config), Box::new(Fusermount::default()));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    runtime.block_on(async {
        // SAFETY: the descriptor number is handed to us by the launcher and
        // is owned exclusively by this process from here on.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(socket_fd) };
        std_stream.set_nonblocking(true).map_err(|e| e.to_string())?;
        let mut stream = tokio::net::UnixStream::from_std(std_stream).map_err(|e| e.to_string())?;

        let result = if post_start {
            lifecycle::serve(&mut stream, Some(POST_START_TRIGGER_TIMEOUT), || {
                handler.post_start_host()
            })
            .await
        } else {
            lifecycle::serve(&mut stream, None, || handler.cleanup_host()).await
        };
        result.map_err(|e| e.to_string())
    })
}

fn cmd_version() {
    println!("stagehand version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"stagehand - container launch preparation

USAGE:
    stagehand <command> [options]

COMMANDS:
    prepare                 Build the launch plan and publish it to the starter
    post-start-host         Serve the post-start handshake
    cleanup-host            Serve the cleanup handshake
    version                 Show version info
    help                    Show this help

OPTIONS:
    --engine-config <file>  Engine configuration (JSON)
    --policy <file>         Administrator configuration (YAML)
    --capabilities <file>   Capability authorization table (JSON)
    --starter-fd <n>        Shared starter region descriptor
    --socket-fd <n>         Lifecycle socket descriptor
    --dry-run               Print the plan instead of publishing it

ENVIRONMENT:
    STAGEHAND_LOG           error, warn, info, debug or trace (default: warn)
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn log_level() -> Level {
    match std::env::var("STAGEHAND_LOG").as_deref() {
        Ok("error") => Level::ERROR,
        Ok("info") => Level::INFO,
        Ok("debug") => Level::DEBUG,
        Ok("trace") => Level::TRACE,
        _ => Level::WARN,
    }
}

fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }

    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Prepare {
                    engine_config,
                    policy,
                    capabilities,
                    starter_fd,
                    dry_run,
                } => cmd_prepare(engine_config, policy, capabilities, starter_fd, dry_run),
                Command::PostStartHost {
                    socket_fd,
                    engine_config,
                } => cmd_lifecycle(socket_fd, engine_config, true),
                Command::CleanupHost {
                    socket_fd,
                    engine_config,
                } => cmd_lifecycle(socket_fd, engine_config, false),
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
