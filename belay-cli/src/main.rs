//! CLI for driving MicroPython and CircuitPython devices.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod sync;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use belay::{Config, Device, Payload, ProcessTransport, TcpTransport};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "belay", version, about = "Drive MicroPython and CircuitPython devices over the raw REPL")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run Python code on a device and print the result.
    Exec {
        #[command(flatten)]
        conn: ConnArgs,
        /// Code to run.
        code: String,
    },

    /// Mirror a local folder onto a device.
    Sync(sync::SyncArgs),

    /// Display the device's firmware and capabilities.
    Info {
        #[command(flatten)]
        conn: ConnArgs,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// How to reach a device.
#[derive(Args)]
pub(crate) struct ConnArgs {
    /// `host[:port]` for telnet/WebREPL bridges, or `exec:<command>` for a
    /// local process such as the unix port.
    device: String,

    /// Login user for telnet bridges.
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Login password for telnet bridges.
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reconnect attempts; negative retries forever.
    #[arg(long, allow_negative_numbers = true)]
    attempts: Option<i32>,
}

impl ConnArgs {
    /// Settings file (or defaults), then the command's `adjust`, then flags.
    fn settings(&self, adjust: impl FnOnce(Config) -> Config) -> Result<Config> {
        let base = match &self.config {
            Some(path) => {
                Config::load(path).with_context(|| format!("reading {}", path.display()))?
            }
            None => Config::default(),
        };
        let mut config = adjust(base);
        if let Some(attempts) = self.attempts {
            config = config.with_attempts(attempts);
        }
        Ok(config)
    }

    /// Opens the device described by the arguments.
    pub(crate) fn connect(&self, adjust: impl FnOnce(Config) -> Config) -> Result<Device> {
        let config = self.settings(adjust)?;
        let device = if let Some(cmd) = self.device.strip_prefix("exec:") {
            Device::connect(ProcessTransport::new(cmd), config)
        } else {
            let mut transport = TcpTransport::new(self.device.as_str());
            if let (Some(user), Some(password)) = (&self.user, &self.password) {
                transport = transport.with_login(user.as_str(), password.as_str());
            }
            Device::connect(transport, config)
        };
        device.with_context(|| format!("connecting to {}", self.device))
    }
}

/// Output format for info.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("belay: {e:#}");
        std::process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` wins unless `-v` is given.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Exec { conn, code } => exec(&conn, &code),
            Command::Sync(args) => sync::run(&args),
            Command::Info { conn, format } => info(&conn, format),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "belay", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

fn exec(conn: &ConnArgs, code: &str) -> Result<()> {
    let device = conn.connect(|c| c.with_sync_time(false))?;
    device.set_output(|line| echo(&mut std::io::stdout().lock(), line));
    let reply = device.run(code)?;
    match reply.into_payload() {
        Payload::Value(belay::Value::None) => {}
        Payload::Value(value) => println!("{value}"),
        Payload::Proxy(handle) => println!("<remote object {}>", handle.name()),
        _ => {}
    }
    device.close()?;
    Ok(())
}

/// Writes one line of device output; the device's line ending is already gone.
fn echo(out: &mut impl Write, line: &str) {
    if let Err(e) = writeln!(out, "{line}") {
        tracing::debug!(error = %e, "dropping device output");
    }
}

fn info(conn: &ConnArgs, format: OutputFormat) -> Result<()> {
    let device = conn.connect(|c| c)?;
    let imp = device
        .implementation()
        .context("device did not report its implementation")?;
    let offset = device.clock_offset();
    device.close()?;

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "device": device.describe(),
            "implementation": imp,
            "clock_offset": offset,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    let (major, minor, patch) = imp.version;
    println!("device:    {}", device.describe());
    println!("firmware:  {} {major}.{minor}.{patch}", imp.name);
    println!("platform:  {}", imp.platform);
    match imp.arch {
        Some(arch) => println!("arch:      {}", serde_json::to_value(arch)?.as_str().unwrap_or("?")),
        None => println!("arch:      none"),
    }
    let mut emitters = Vec::new();
    if imp.emitters.native {
        emitters.push("native");
    }
    if imp.emitters.viper {
        emitters.push("viper");
    }
    let label = if emitters.is_empty() {
        "none"
    } else {
        &emitters.join(", ")
    };
    println!("emitters:  {label}");
    println!("threads:   {}", if imp.dispatch().threads { "yes" } else { "no" });
    if let Some(offset) = offset {
        println!("clock:     {offset:+.3} s");
    }
    Ok(())
}
