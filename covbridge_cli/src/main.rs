use covbridge_core::config::BridgeConfig;
use covbridge_core::context::BridgeContext;
use covbridge_core::platform::{InMemoryPlatform, Platform};
use covbridge_core::replay::{BranchTrace, replay};
use covbridge_core::sync::SyncEvent;
use covbridge_core::{MAP_SIZE, parse_block_id};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::ffi::CString;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Trace every recorded edge.
    #[clap(long)]
    debug: bool,
    /// Block id (decimal or 0x hex) that re-enables recording.
    #[clap(long, value_parser = block_id)]
    entry: Option<u64>,
    /// Block id that disables recording and notifies the controller.
    #[clap(long, value_parser = block_id)]
    exit: Option<u64>,
    /// FIFO used for controller notifications.
    #[clap(long)]
    sync_pipe: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a recorded branch trace through the coverage recorder.
    Replay {
        #[clap(short, long)]
        trace: PathBuf,
        /// Write the raw coverage map here after the run.
        #[clap(long)]
        map_out: Option<PathBuf>,
        /// Keep everything in-process: no shared memory, no FIFO.
        #[clap(long)]
        in_memory: bool,
    },
    /// Controller side: create the FIFO and print every event written to it.
    Listen {
        #[clap(long)]
        pipe: Option<PathBuf>,
    },
}

fn block_id(text: &str) -> Result<u64, String> {
    parse_block_id(text).map_err(|e| e.to_string())
}

/// Where the effective configuration came from, reported once logging is up.
#[derive(Debug)]
enum ConfigSource {
    Cli(PathBuf),
    Default(PathBuf),
    BuiltIn,
}

fn load_config(cli: &Cli) -> Result<(BridgeConfig, ConfigSource), anyhow::Error> {
    let (mut config, source) = match &cli.config_file {
        Some(config_path) => (
            BridgeConfig::load_from_file(config_path)?,
            ConfigSource::Cli(config_path.clone()),
        ),
        None => {
            let default_config_path = PathBuf::from("covbridge.toml");
            if default_config_path.exists() {
                (
                    BridgeConfig::load_from_file(&default_config_path)?,
                    ConfigSource::Default(default_config_path),
                )
            } else {
                (BridgeConfig::default(), ConfigSource::BuiltIn)
            }
        }
    };

    if cli.debug {
        config.debug = true;
    }
    if cli.entry.is_some() {
        config.entry = cli.entry;
    }
    if cli.exit.is_some() {
        config.exit = cli.exit;
    }
    if let Some(sync_pipe) = &cli.sync_pipe {
        config.sync_pipe = sync_pipe.clone();
    }
    Ok((config, source))
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

fn run_replay<P: Platform>(
    ctx: BridgeContext<P>,
    trace: &BranchTrace,
    map_out: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let outcome = replay(&ctx, trace);
    if let Some(path) = map_out {
        std::fs::write(path, ctx.map().snapshot())
            .with_context(|| format!("Failed to write coverage map to {path:?}"))?;
        log::info!("Wrote {MAP_SIZE} byte coverage map to {path:?}");
    }

    let report = serde_json::json!({
        "replay": outcome,
        "summary": ctx.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn listen(pipe: &Path) -> Result<(), anyhow::Error> {
    if !pipe.exists() {
        let c_path = CString::new(pipe.as_os_str().as_bytes())
            .with_context(|| format!("Invalid FIFO path {pipe:?}"))?;
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to create FIFO {pipe:?}"));
        }
        log::info!("Created FIFO {pipe:?}");
    }

    log::info!("Waiting for events on {pipe:?}");
    // Blocks until the instrumented target opens its end.
    let mut fifo =
        std::fs::File::open(pipe).with_context(|| format!("Failed to open FIFO {pipe:?}"))?;
    let mut buf = [0u8; 64];
    loop {
        let n = fifo.read(&mut buf)?;
        if n == 0 {
            log::info!("Writer closed {pipe:?}");
            return Ok(());
        }
        for &byte in &buf[..n] {
            match SyncEvent::from_byte(byte) {
                Some(event) => println!("{}", event.name()),
                None => println!("unknown:{byte:#04x}"),
            }
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let (config, source) = load_config(&cli)?;
    init_logging(config.debug);
    match &source {
        ConfigSource::Cli(path) => {
            log::info!("Loaded configuration from specified path: {path:?}")
        }
        ConfigSource::Default(path) => {
            log::info!("No config file specified via CLI, loaded default: {path:?}")
        }
        ConfigSource::BuiltIn => log::debug!("No config file found, using built-in defaults"),
    }
    log::debug!("Effective configuration: {config:#?}");

    match &cli.command {
        Command::Replay {
            trace,
            map_out,
            in_memory,
        } => {
            let trace = BranchTrace::load_from_file(trace)?;
            if *in_memory {
                let ctx =
                    BridgeContext::initialize_with_shm_id(InMemoryPlatform::new(), config, None)?;
                run_replay(ctx, &trace, map_out.as_deref())
            } else {
                let ctx = BridgeContext::initialize(covbridge_core::UnixPlatform, config)?;
                run_replay(ctx, &trace, map_out.as_deref())
            }
        }
        Command::Listen { pipe } => {
            let pipe = pipe.clone().unwrap_or_else(|| config.sync_pipe.clone());
            listen(&pipe)
        }
    }
}
