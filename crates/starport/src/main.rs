//! starport - run Lua scripts with mail, LLM and charm bindings

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luahelper::ValuePrinter;
use mlua::{Lua, LuaOptions, MultiValue, StdLib, Value};
use starport_core::logging::{LogConfig, LogFormat, init_logging};
use starport_core::retry::CancelToken;
use starport_core::{Modules, Settings};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "starport")]
#[command(about = "Run Lua scripts with mail, LLM and charm bindings")]
#[command(version)]
struct Cli {
    /// Settings file (default: <config_dir>/starport/starport.toml)
    #[arg(long, global = true, env = "STARPORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua script with every module installed
    #[command(after_help = "\
Examples:
  starport run hello.lua
  starport run report.lua --timeout 120 --log-level debug
  starport run job.lua --config ./starport.toml --log-format json")]
    Run {
        /// Script to execute
        script: PathBuf,

        /// Log level (overrides the settings file)
        #[arg(long)]
        log_level: Option<String>,

        /// Log format: pretty or json
        #[arg(long)]
        log_format: Option<LogFormat>,

        /// Stop remote calls after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print the resolved settings with secrets masked
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Run {
            script,
            log_level,
            log_format,
            timeout,
        } => {
            let log = LogConfig {
                level: log_level.unwrap_or_else(|| settings.logging.level.clone()),
                format: log_format.unwrap_or(settings.logging.format),
                file: settings.logging.file.clone(),
            };
            init_logging(&log).context("initializing logging")?;
            run_script(&settings, &script, timeout.map(Duration::from_secs))
        }
        Commands::Config => {
            print!("{}", settings.masked().to_toml()?);
            Ok(())
        }
    }
}

/// Libraries scripts may use; `io`, `os` and `debug` stay out.
fn sandbox_libs() -> StdLib {
    StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE | StdLib::PACKAGE
}

fn run_script(settings: &Settings, path: &Path, timeout: Option<Duration>) -> Result<()> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))?;

    let cancel = CancelToken::new();
    if let Some(timeout) = timeout {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            tracing::warn!(timeout_secs = timeout.as_secs(), "script timeout reached, cancelling calls");
            cancel.cancel();
        });
    }

    let lua = Lua::new_with(sandbox_libs(), LuaOptions::default()).context("creating Lua state")?;
    Modules::from_settings(settings, &cancel)
        .install(&lua)
        .context("installing modules")?;

    tracing::debug!(script = %path.display(), "running script");
    let results: MultiValue = lua
        .load(source.trim_start_matches('\u{FEFF}'))
        .set_name(path.to_string_lossy())
        .eval()
        .with_context(|| format!("executing {}", path.display()))?;

    for value in results {
        if !matches!(value, Value::Nil) {
            println!("{:?}", ValuePrinter(value));
        }
    }
    Ok(())
}
