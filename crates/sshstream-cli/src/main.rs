//! sshstream CLI
//!
//! Runs one command on a remote host and streams its output to the terminal

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use sshstream_exec::{CommandExecutor, SshTransport};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, TargetConfig};

/// Lines buffered between a pump and the terminal
const LINE_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "sshstream")]
#[command(about = "Run a remote command over SSH and stream its output", long_about = None)]
struct Cli {
    /// Config file (defaults to $SSHSTREAM_CONFIG, ./sshstream.toml, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// SSH user
    #[arg(short, long)]
    user: Option<String>,

    /// Private key file
    #[arg(short = 'i', long)]
    key: Option<String>,

    /// Pinned host key fingerprint (SHA256:...)
    #[arg(long)]
    fingerprint: Option<String>,

    /// Give up after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Forward terminal stdin to the remote command
    ///
    /// Input stays open until the terminal sends EOF: even after the remote
    /// command exits, sshstream waits for Ctrl-D before returning.
    #[arg(long)]
    stdin: bool,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// Let command-line flags override file settings
    fn apply(&self, target: &mut TargetConfig) {
        if let Some(host) = &self.host {
            target.address.clone_from(host);
        }
        if let Some(port) = self.port {
            target.port = port;
        }
        if let Some(user) = &self.user {
            target.user.clone_from(user);
        }
        if let Some(key) = &self.key {
            target.key_path = Some(key.clone());
            target.key_env = None;
            target.password_env = None;
        }
        if let Some(fingerprint) = &self.fingerprint {
            target.fingerprint = Some(fingerprint.clone());
        }
        if let Some(timeout) = self.timeout {
            target.timeout_secs = Some(timeout);
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Copy lines from `rx` to a terminal stream until the pump closes it
async fn print_lines<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<String>,
    mut out: W,
) -> std::io::Result<()> {
    while let Some(line) = rx.recv().await {
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

/// Send terminal stdin to the remote command line by line
async fn forward_stdin(tx: mpsc::Sender<String>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(format!("{line}\n")).await.is_err() {
            debug!("remote stdin closed");
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    cli.apply(&mut config.target);
    init_tracing(&config.log_level);

    let exec_config = config.target.executor_config()?;
    let transport = match &config.target.fingerprint {
        Some(fingerprint) => SshTransport::new().with_host_fingerprint(fingerprint.clone()),
        None => SshTransport::new(),
    };

    let (out_tx, out_rx) = mpsc::channel(LINE_BUFFER);
    let (err_tx, err_rx) = mpsc::channel(LINE_BUFFER);
    let mut executor = CommandExecutor::new(exec_config, transport)
        .with_stdout(out_tx)
        .with_stderr(err_tx);

    if cli.stdin {
        let (in_tx, in_rx) = mpsc::channel(LINE_BUFFER);
        executor = executor.with_stdin(in_rx);
        tokio::spawn(forward_stdin(in_tx));
    }

    let stdout_task = tokio::spawn(print_lines(out_rx, tokio::io::stdout()));
    let stderr_task = tokio::spawn(print_lines(err_rx, tokio::io::stderr()));

    let command = cli.command.join(" ");
    let result = executor.execute(&command).await;

    stdout_task.await?.wrap_err("writing stdout")?;
    stderr_task.await?.wrap_err("writing stderr")?;

    let target = executor.config();
    result.wrap_err_with(|| format!("running `{command}` on {}:{}", target.address, target.port))?;
    Ok(())
}
