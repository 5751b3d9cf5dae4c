use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueHint;
use std::path::PathBuf;

const LONG_ABOUT: &str = "\
Run commands under a supervising daemon that predicts their timeout,\n\
streams their output and gates each run with configurable hooks.\n\
\n\
Start the daemon once, then submit commands with `exec`.";

const AFTER_LONG_HELP: &str = r#"EXAMPLES:
    # Start the daemon in the foreground
    agent-exec daemon --hooks ./hooks.json

    # Run a command with a predicted timeout
    agent-exec exec -- cargo test --workspace

    # Run with an explicit timeout and environment
    agent-exec exec --timeout 30 --env RUST_LOG=debug -- ./script.sh

    # Ask what timeout the daemon would choose
    agent-exec predict -- npm install

    # Check the daemon
    agent-exec status --json"#;

#[derive(Parser)]
#[command(name = "agent-exec")]
#[command(author, version, propagate_version = true)]
#[command(about = "Supervised command execution for AI agents")]
#[command(long_about = LONG_ABOUT)]
#[command(after_long_help = AFTER_LONG_HELP)]
#[command(subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Daemon socket path
    #[arg(
        long,
        global = true,
        env = "AGENT_EXEC_SOCKET",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help_heading = "Connection Options"
    )]
    pub socket: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true, help_heading = "Output Options")]
    pub json: bool,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true, help_heading = "Debug Options")]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Daemon(DaemonArgs),

    /// Execute a command through the daemon and stream its output
    #[command(long_about = "\
Execute a command through the daemon and stream its output.\n\
\n\
The exit status mirrors the child: its own code on a normal exit,\n\
128+N when killed by signal N, and 124 on timeout or stall.")]
    Exec(ExecArgs),

    /// Show daemon health
    Status,

    /// Show the timeout the daemon would assign to a command
    Predict(PredictArgs),
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Hook configuration file
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub hooks: Option<PathBuf>,

    /// History store: off, memory or a JSONL file path
    #[arg(long, value_name = "STORE")]
    pub history: Option<String>,

    /// WebSocket listen address
    #[arg(long, value_name = "ADDR", conflicts_with = "no_ws")]
    pub ws_listen: Option<String>,

    /// Disable the WebSocket transport
    #[arg(long)]
    pub no_ws: bool,

    /// Maximum number of live sessions
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_sessions: Option<u64>,

    /// Restrict executables to these basenames (repeatable or comma-separated)
    #[arg(long = "allow", value_name = "CMD", value_delimiter = ',')]
    pub allow: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Timeout in seconds (predicted when omitted)
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Working directory for the command
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Session to run in (defaults to this connection's session)
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    /// Command and its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    /// Command and its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
