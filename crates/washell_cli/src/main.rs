//! Interactive front end for the washell bridge.
//!
//! Drives a reactor session against the bundled emulated engine; a
//! production embedding would construct its own snapshot-capable engine and
//! use `washell_bridge` directly.
//!
//! Usage:
//!
//!     washell run config.yaml              # interactive REPL
//!     washell eval config.yaml 'echo hi'   # execute a command string
//!     washell script config.yaml setup.sh  # execute a script file

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};
use washell_bridge::ReactorSession;
use washell_bridge::engine::WasiConfig;
use washell_bridge::engine::emulated::EmulatedEngine;
use washell_config::ShellConfig;

/// Run shell commands in a re-entrant WASM shell session.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive shell prompt.
    Run {
        /// Path to the session config file.
        config: PathBuf,
    },
    /// Evaluate a single command string and exit with its status.
    Eval {
        /// Path to the session config file.
        config: PathBuf,
        /// Command string to evaluate.
        command: String,
    },
    /// Run a script file and exit with the status of its last command.
    Script {
        /// Path to the session config file.
        config: PathBuf,
        /// Script file to execute.
        script: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "washell_bridge=info,washell=info") };
    }

    let subscriber = tracing_subscriber::Registry::default()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::from_default_env());
    subscriber.try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let mut session = open_session(&config)?;
            let status = repl(&mut session)?;
            session.close();
            Ok(exit_code(status))
        }
        Command::Eval { config, command } => {
            let mut session = open_session(&config)?;
            let status = session.eval(&command)?;
            session.close();
            Ok(exit_code(status))
        }
        Command::Script { config, script } => {
            let mut session = open_session(&config)?;
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("failed to read {}", script.display()))?;
            let status = session.eval(&source)?;
            session.close();
            Ok(exit_code(status))
        }
    }
}

fn open_session(config_path: &Path) -> Result<ReactorSession> {
    let config = ShellConfig::load(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    let image = match config.guest_image_path() {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("failed to read guest image {}", path.display()))?,
        None => Vec::new(),
    };

    let wasi = WasiConfig::create_from_shell_config(&config);
    let mut engine = EmulatedEngine::new();
    let mut session = ReactorSession::new(&mut engine, &image, &wasi)?;

    let args: Vec<&str> = config.app.args.iter().map(String::as_str).collect();
    session.init(&args)?;
    tracing::info!(name = %config.name, "session ready");
    Ok(session)
}

fn repl(session: &mut ReactorSession) -> Result<i32> {
    eprintln!("washell (type 'exit' or Ctrl+D to quit)");

    let stdin = std::io::stdin();
    let mut status = 0;
    loop {
        eprint!("$ ");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            eprintln!();
            break;
        }

        let line = line.trim_end_matches('\n');
        if line == "exit" || line == "quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        match session.eval(line) {
            Ok(code) => status = code,
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(status)
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from(status.rem_euclid(256) as u8)
}
